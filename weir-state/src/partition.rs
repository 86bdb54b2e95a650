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

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use rocksdb::{Direction, IteratorMode, Options, WriteBatch, DB};
use tracing::{debug, info};

use crate::metadata::PartitionMetadata;
use crate::transaction::{StoreTransaction, WriteSetEntry};
use crate::{KeyPrefix, StateError};

const DB_DIR_NAME: &str = "db";

/// A slice of a named key-value store bound 1:1 to one input Kafka partition.
///
/// Opening bumps the on-disk epoch; the epoch is re-checked before every
/// write-set application so a writer that lost the partition to a newer
/// instance fails with [`StateError::Fenced`] instead of clobbering state.
pub struct StorePartition {
    store_name: String,
    partition: i32,
    dir: PathBuf,
    changelog_topic: Option<String>,
    db: DB,
    epoch: u64,
    metadata: Mutex<PartitionMetadata>,
    transaction_open: AtomicBool,
}

impl StorePartition {
    pub fn open(
        dir: &Path,
        store_name: &str,
        partition: i32,
        changelog_topic: Option<String>,
    ) -> Result<StorePartition, StateError> {
        std::fs::create_dir_all(dir)?;
        let mut metadata = PartitionMetadata::load(dir)?.unwrap_or_default();
        metadata.epoch += 1;
        metadata.store(dir)?;

        let mut options = Options::default();
        options.create_if_missing(true);
        let db = DB::open(&options, dir.join(DB_DIR_NAME))?;

        info!(
            store_name = %store_name,
            partition = partition,
            processed_offset = metadata.processed_offset,
            epoch = metadata.epoch,
            "Opened store partition."
        );
        Ok(StorePartition {
            store_name: store_name.to_string(),
            partition,
            dir: dir.to_path_buf(),
            changelog_topic,
            db,
            epoch: metadata.epoch,
            metadata: Mutex::new(metadata),
            transaction_open: AtomicBool::new(false),
        })
    }

    pub fn store_name(&self) -> &str {
        &self.store_name
    }

    pub fn partition(&self) -> i32 {
        self.partition
    }

    pub fn changelog_topic(&self) -> Option<&str> {
        self.changelog_topic.as_deref()
    }

    /// Changelog offset of the last record applied to this partition, `-1`
    /// before the first commit.
    pub fn processed_offset(&self) -> i64 {
        self.metadata.lock().unwrap().processed_offset
    }

    /// Opens the single transaction allowed against this partition.
    pub fn begin(self: &Arc<Self>) -> Result<StoreTransaction, StateError> {
        if self
            .transaction_open
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(StateError::TransactionAlreadyOpen {
                store_name: self.store_name.clone(),
                partition: self.partition,
            });
        }
        Ok(StoreTransaction::new(self.clone()))
    }

    /// Point lookup by composite (prefix + user) key, bypassing any open
    /// transaction.
    pub(crate) fn get_composite(&self, composite_key: &[u8]) -> Result<Option<Vec<u8>>, StateError> {
        Ok(self.db.get(composite_key)?)
    }

    /// Range scan of all composite keys starting with `composite_prefix`,
    /// in key order.
    pub(crate) fn scan_composite_prefix(
        &self,
        composite_prefix: &[u8],
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StateError> {
        let mut items = Vec::new();
        for entry in self
            .db
            .iterator(IteratorMode::From(composite_prefix, Direction::Forward))
        {
            let (key, value) = entry?;
            if !key.starts_with(composite_prefix) {
                break;
            }
            items.push((key.into_vec(), value.into_vec()));
        }
        Ok(items)
    }

    /// Applies one replayed changelog record: a `None` value deletes the key.
    /// Used only by recovery; regular processing goes through transactions.
    pub fn apply_changelog(
        &self,
        prefix: KeyPrefix,
        key: &[u8],
        value: Option<&[u8]>,
    ) -> Result<(), StateError> {
        let composite_key = prefix.composite_key(key);
        match value {
            Some(value) => self.db.put(composite_key, value)?,
            None => self.db.delete(composite_key)?,
        }
        Ok(())
    }

    /// Persists a new changelog watermark after recovery caught up.
    pub fn set_processed_offset(&self, processed_offset: i64) -> Result<(), StateError> {
        let mut metadata = self.metadata.lock().unwrap();
        self.check_fencing()?;
        metadata.processed_offset = processed_offset;
        metadata.store(&self.dir)?;
        Ok(())
    }

    /// Applies a transaction write-set in one RocksDB batch and advances the
    /// watermark. Fencing is re-checked first: losing the race to a newer
    /// opener must not overwrite its state.
    pub(crate) fn apply_write_set(
        &self,
        write_set: &BTreeMap<Vec<u8>, WriteSetEntry>,
        watermark: Option<i64>,
    ) -> Result<(), StateError> {
        let mut metadata = self.metadata.lock().unwrap();
        self.check_fencing()?;

        let mut batch = WriteBatch::default();
        for (composite_key, entry) in write_set {
            match &entry.value {
                Some(value) => batch.put(composite_key, value),
                None => batch.delete(composite_key),
            }
        }
        self.db.write(batch)?;

        if let Some(watermark) = watermark {
            if watermark > metadata.processed_offset {
                metadata.processed_offset = watermark;
                metadata.store(&self.dir)?;
            }
        }
        debug!(
            store_name = %self.store_name,
            partition = self.partition,
            num_keys = write_set.len(),
            processed_offset = metadata.processed_offset,
            "Committed write-set."
        );
        Ok(())
    }

    fn check_fencing(&self) -> Result<(), StateError> {
        let disk_epoch = PartitionMetadata::load(&self.dir)?
            .map(|metadata| metadata.epoch)
            .unwrap_or(0);
        if disk_epoch != self.epoch {
            return Err(StateError::Fenced {
                store_name: self.store_name.clone(),
                partition: self.partition,
                our_epoch: self.epoch,
                disk_epoch,
            });
        }
        Ok(())
    }

    pub(crate) fn release_transaction(&self) {
        self.transaction_open.store(false, Ordering::SeqCst);
    }
}

impl std::fmt::Debug for StorePartition {
    fn fmt(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
        formatter
            .debug_struct("StorePartition")
            .field("store_name", &self.store_name)
            .field("partition", &self.partition)
            .field("epoch", &self.epoch)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_for_test(dir: &Path) -> Arc<StorePartition> {
        Arc::new(StorePartition::open(dir, "counts", 0, Some("changelog-topic".to_string())).unwrap())
    }

    #[test]
    fn test_open_bumps_epoch_and_keeps_offset() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = open_for_test(temp_dir.path());
        assert_eq!(store.processed_offset(), -1);
        store.set_processed_offset(7).unwrap();
        drop(store);

        let reopened = open_for_test(temp_dir.path());
        assert_eq!(reopened.processed_offset(), 7);
        let metadata = PartitionMetadata::load(temp_dir.path()).unwrap().unwrap();
        assert_eq!(metadata.epoch, 2);
    }

    #[test]
    fn test_stale_writer_is_fenced() {
        let temp_dir = tempfile::tempdir().unwrap();
        let stale = open_for_test(temp_dir.path());
        // A newer opener bumps the on-disk epoch out from under `stale`.
        let mut metadata = PartitionMetadata::load(temp_dir.path()).unwrap().unwrap();
        metadata.epoch += 1;
        metadata.store(temp_dir.path()).unwrap();

        let error = stale.set_processed_offset(3).unwrap_err();
        assert!(matches!(error, StateError::Fenced { .. }));
    }

    #[test]
    fn test_only_one_open_transaction() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = open_for_test(temp_dir.path());
        let transaction = store.begin().unwrap();
        let error = store.begin().unwrap_err();
        assert!(matches!(error, StateError::TransactionAlreadyOpen { .. }));
        drop(transaction);
        store.begin().unwrap();
    }

    #[test]
    fn test_apply_changelog_put_and_tombstone() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = open_for_test(temp_dir.path());
        store
            .apply_changelog(KeyPrefix::VALUES, b"a", Some(b"1"))
            .unwrap();
        assert_eq!(
            store
                .get_composite(&KeyPrefix::VALUES.composite_key(b"a"))
                .unwrap(),
            Some(b"1".to_vec())
        );
        store.apply_changelog(KeyPrefix::VALUES, b"a", None).unwrap();
        assert_eq!(
            store
                .get_composite(&KeyPrefix::VALUES.composite_key(b"a"))
                .unwrap(),
            None
        );
    }
}
