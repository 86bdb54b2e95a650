// Copyright (C) 2022 Quickwit, Inc.
//
// Quickwit is offered under the AGPL v3.0 and as commercial software.
// For commercial licensing, contact us at hello@quickwit.io.
//
// AGPL:
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as
// published by the Free Software Foundation, either version 3 of the
// License, or (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <http://www.gnu.org/licenses/>.

use anyhow::bail;

/// Header naming the input topic a changelog record was derived from.
pub const SOURCE_TOPIC_HEADER: &str = "__source_topic";
/// Header carrying the input partition, 4-byte big-endian.
pub const SOURCE_PARTITION_HEADER: &str = "__source_partition";
/// Header carrying the input offset, 8-byte big-endian.
pub const SOURCE_OFFSET_HEADER: &str = "__source_offset";
/// Header carrying the one-byte sub-store prefix.
pub const PREFIX_HEADER: &str = "__prefix";

/// One leading byte multiplexing several logical keyspaces (plain values,
/// window values, expiry indexes, ...) onto a single store partition and its
/// changelog topic. Operators reserve disjoint prefixes; the store does not
/// interpret them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct KeyPrefix(pub u8);

impl KeyPrefix {
    /// Prefix of plain key-value stores.
    pub const VALUES: KeyPrefix = KeyPrefix(b'v');
    /// Prefix of windowed aggregation values.
    pub const WINDOWS: KeyPrefix = KeyPrefix(b'w');
    /// Prefix of window expiry indexes.
    pub const EXPIRY: KeyPrefix = KeyPrefix(b'x');

    /// Prepends the prefix byte to `key`, forming the composite key stored in
    /// RocksDB.
    pub fn composite_key(&self, key: &[u8]) -> Vec<u8> {
        let mut composite = Vec::with_capacity(key.len() + 1);
        composite.push(self.0);
        composite.extend_from_slice(key);
        composite
    }
}

/// Identifies the input record whose processing produced a state mutation.
/// Stamped on every changelog record emitted for the enclosing transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangelogSource {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
}

/// The wire shape written to a changelog topic: one record per mutated key,
/// `value: None` encoding a tombstone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangelogRecord {
    pub key: Vec<u8>,
    pub value: Option<Vec<u8>>,
    pub prefix: KeyPrefix,
    pub source: ChangelogSource,
}

/// Sink for changelog records, implemented by the row producer.
///
/// The store holds a handle to the writer, never the other way around, so the
/// store subsystem stays independent of the Kafka plumbing.
pub trait ChangelogWriter: Send + Sync {
    /// Enqueues `record` for delivery to `topic`, partitioned like the input.
    /// Must fail fast: an error here fails the enclosing transaction.
    fn write_changelog(&self, topic: &str, record: ChangelogRecord) -> anyhow::Result<()>;

    /// Highest changelog offset acknowledged by the broker for
    /// `(topic, partition)`, if any record has been delivered yet. Only
    /// meaningful after a flush.
    fn delivered_offset(&self, topic: &str, partition: i32) -> Option<i64>;
}

pub fn encode_source_partition(partition: i32) -> [u8; 4] {
    partition.to_be_bytes()
}

pub fn decode_source_partition(bytes: &[u8]) -> anyhow::Result<i32> {
    let Ok(bytes) = <[u8; 4]>::try_from(bytes) else {
        bail!(
            "`{SOURCE_PARTITION_HEADER}` header must be 4 bytes, got {}.",
            bytes.len()
        );
    };
    Ok(i32::from_be_bytes(bytes))
}

pub fn encode_source_offset(offset: i64) -> [u8; 8] {
    offset.to_be_bytes()
}

pub fn decode_source_offset(bytes: &[u8]) -> anyhow::Result<i64> {
    let Ok(bytes) = <[u8; 8]>::try_from(bytes) else {
        bail!(
            "`{SOURCE_OFFSET_HEADER}` header must be 8 bytes, got {}.",
            bytes.len()
        );
    };
    Ok(i64::from_be_bytes(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_composite_key_prepends_prefix() {
        assert_eq!(KeyPrefix::VALUES.composite_key(b"word"), b"vword");
        assert_eq!(KeyPrefix(0).composite_key(b""), vec![0]);
    }

    #[test]
    fn test_source_header_encoding() {
        assert_eq!(encode_source_partition(3), [0, 0, 0, 3]);
        assert_eq!(decode_source_partition(&[0, 0, 0, 3]).unwrap(), 3);
        assert_eq!(
            decode_source_offset(&encode_source_offset(i64::MAX)).unwrap(),
            i64::MAX
        );
        decode_source_partition(b"xx").unwrap_err();
        decode_source_offset(b"xx").unwrap_err();
    }
}
