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

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::changelog::{ChangelogRecord, ChangelogSource, ChangelogWriter};
use crate::partition::StorePartition;
use crate::{KeyPrefix, StateError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    Open,
    Prepared,
    Committed,
    Failed,
}

/// One buffered mutation plus the offset of the input record that caused it.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct WriteSetEntry {
    pub value: Option<Vec<u8>>,
    pub source_offset: i64,
}

/// The unit of mutation against one store partition.
///
/// Reads hit the write-set first, then a read cache, then RocksDB. Mutations
/// are buffered until [`commit`](Self::commit); nothing touches the store
/// before that, so [`discard`](Self::discard) (or a plain drop) is free.
///
/// Lifecycle: `Open` → (`prepare_changelog`) `Prepared` → (`commit`)
/// `Committed`, with any failure parking the transaction in `Failed`.
pub struct StoreTransaction {
    partition: Arc<StorePartition>,
    write_set: BTreeMap<Vec<u8>, WriteSetEntry>,
    read_cache: HashMap<Vec<u8>, Option<Vec<u8>>>,
    /// Offset of the input record whose processing is mutating the
    /// transaction, `-1` until positioned.
    current_offset: i64,
    status: TransactionStatus,
}

impl StoreTransaction {
    pub(crate) fn new(partition: Arc<StorePartition>) -> StoreTransaction {
        StoreTransaction {
            partition,
            write_set: BTreeMap::new(),
            read_cache: HashMap::new(),
            current_offset: -1,
            status: TransactionStatus::Open,
        }
    }

    pub fn status(&self) -> TransactionStatus {
        self.status
    }

    pub fn store_name(&self) -> &str {
        self.partition.store_name()
    }

    pub fn partition(&self) -> i32 {
        self.partition.partition()
    }

    /// True if the transaction buffers at least one mutation.
    pub fn is_dirty(&self) -> bool {
        !self.write_set.is_empty()
    }

    /// Attributes subsequent mutations to the input record at
    /// `source_offset`; their changelog records carry it as provenance.
    pub fn position_at(&mut self, source_offset: i64) {
        self.current_offset = source_offset;
    }

    fn ensure_open(&self) -> Result<(), StateError> {
        if self.status != TransactionStatus::Open {
            return Err(StateError::TransactionClosed {
                status: self.status,
            });
        }
        Ok(())
    }

    pub fn get(&mut self, prefix: KeyPrefix, key: &[u8]) -> Result<Option<Vec<u8>>, StateError> {
        self.ensure_open()?;
        let composite_key = prefix.composite_key(key);
        if let Some(entry) = self.write_set.get(&composite_key) {
            return Ok(entry.value.clone());
        }
        if let Some(cached) = self.read_cache.get(&composite_key) {
            return Ok(cached.clone());
        }
        let stored = self.partition.get_composite(&composite_key)?;
        self.read_cache.insert(composite_key, stored.clone());
        Ok(stored)
    }

    pub fn set(&mut self, prefix: KeyPrefix, key: &[u8], value: Vec<u8>) -> Result<(), StateError> {
        self.ensure_open()?;
        self.write_set.insert(
            prefix.composite_key(key),
            WriteSetEntry {
                value: Some(value),
                source_offset: self.current_offset,
            },
        );
        Ok(())
    }

    pub fn delete(&mut self, prefix: KeyPrefix, key: &[u8]) -> Result<(), StateError> {
        self.ensure_open()?;
        self.write_set.insert(
            prefix.composite_key(key),
            WriteSetEntry {
                value: None,
                source_offset: self.current_offset,
            },
        );
        Ok(())
    }

    /// Merged view (write-set over store) of all keys under `key_prefix`
    /// within the sub-store `prefix`. Keys are returned without the sub-store
    /// byte, in key order.
    pub fn items_with_prefix(
        &self,
        prefix: KeyPrefix,
        key_prefix: &[u8],
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StateError> {
        self.ensure_open()?;
        let composite_prefix = prefix.composite_key(key_prefix);
        let mut merged: BTreeMap<Vec<u8>, Vec<u8>> = self
            .partition
            .scan_composite_prefix(&composite_prefix)?
            .into_iter()
            .collect();
        for (composite_key, entry) in self.write_set.range(composite_prefix.clone()..) {
            if !composite_key.starts_with(&composite_prefix) {
                break;
            }
            match &entry.value {
                Some(value) => {
                    merged.insert(composite_key.clone(), value.clone());
                }
                None => {
                    merged.remove(composite_key);
                }
            }
        }
        Ok(merged
            .into_iter()
            .map(|(composite_key, value)| (composite_key[1..].to_vec(), value))
            .collect())
    }

    /// Emits one changelog record per buffered mutation, each tagged with
    /// the input record that caused it (`source_topic`, the partition this
    /// store is bound to, and the offset captured at mutation time). Fails
    /// fast on the first writer error, leaving the transaction `Failed`.
    ///
    /// A partition without a changelog topic (replication disabled) prepares
    /// trivially.
    pub fn prepare_changelog(
        &mut self,
        writer: &dyn ChangelogWriter,
        source_topic: &str,
    ) -> Result<(), StateError> {
        self.ensure_open()?;
        if let Some(changelog_topic) = self.partition.changelog_topic() {
            let changelog_topic = changelog_topic.to_string();
            for (composite_key, entry) in &self.write_set {
                let record = ChangelogRecord {
                    key: composite_key[1..].to_vec(),
                    value: entry.value.clone(),
                    prefix: KeyPrefix(composite_key[0]),
                    source: ChangelogSource {
                        topic: source_topic.to_string(),
                        partition: self.partition.partition(),
                        offset: entry.source_offset,
                    },
                };
                if let Err(error) = writer.write_changelog(&changelog_topic, record) {
                    self.status = TransactionStatus::Failed;
                    return Err(StateError::ChangelogWrite(error));
                }
            }
        }
        self.status = TransactionStatus::Prepared;
        Ok(())
    }

    /// Applies the write-set to the store atomically and advances the
    /// changelog watermark to `watermark` (when replication is on, the
    /// highest delivered changelog offset for this partition).
    pub fn commit(mut self, watermark: Option<i64>) -> Result<(), StateError> {
        match self.status {
            TransactionStatus::Open | TransactionStatus::Prepared => {}
            status => return Err(StateError::TransactionClosed { status }),
        }
        if let Err(error) = self.partition.apply_write_set(&self.write_set, watermark) {
            self.status = TransactionStatus::Failed;
            return Err(error);
        }
        self.status = TransactionStatus::Committed;
        Ok(())
    }

    /// Drops the write-set; the store is untouched.
    pub fn discard(self) {}
}

impl Drop for StoreTransaction {
    fn drop(&mut self) {
        self.partition.release_transaction();
    }
}
