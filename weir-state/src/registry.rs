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

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tracing::info;

use crate::partition::StorePartition;
use crate::StateError;

/// All store partitions currently opened by one application instance, laid
/// out on disk as `{state_dir}/{store_name}/{partition}/`.
///
/// Partitions come and go with the consumer assignment: the recovery manager
/// opens them on assign and closes them on revoke.
pub struct StateStoreRegistry {
    base_dir: PathBuf,
    partitions: Mutex<HashMap<(String, i32), Arc<StorePartition>>>,
}

impl StateStoreRegistry {
    pub fn new(base_dir: &Path) -> StateStoreRegistry {
        StateStoreRegistry {
            base_dir: base_dir.to_path_buf(),
            partitions: Mutex::new(HashMap::new()),
        }
    }

    pub fn partition_dir(&self, store_name: &str, partition: i32) -> PathBuf {
        self.base_dir.join(store_name).join(partition.to_string())
    }

    /// Opens (or returns the already opened) store partition.
    pub fn open_partition(
        &self,
        store_name: &str,
        partition: i32,
        changelog_topic: Option<String>,
    ) -> Result<Arc<StorePartition>, StateError> {
        let key = (store_name.to_string(), partition);
        let mut partitions = self.partitions.lock().unwrap();
        if let Some(store_partition) = partitions.get(&key) {
            return Ok(store_partition.clone());
        }
        let store_partition = Arc::new(StorePartition::open(
            &self.partition_dir(store_name, partition),
            store_name,
            partition,
            changelog_topic,
        )?);
        partitions.insert(key, store_partition.clone());
        Ok(store_partition)
    }

    pub fn get_partition(&self, store_name: &str, partition: i32) -> Option<Arc<StorePartition>> {
        self.partitions
            .lock()
            .unwrap()
            .get(&(store_name.to_string(), partition))
            .cloned()
    }

    /// Closes one store partition. Called on revocation.
    pub fn close_partition(&self, store_name: &str, partition: i32) {
        let removed = self
            .partitions
            .lock()
            .unwrap()
            .remove(&(store_name.to_string(), partition));
        if removed.is_some() {
            info!(store_name = %store_name, partition = partition, "Closed store partition.");
        }
    }

    pub fn close_all(&self) {
        self.partitions.lock().unwrap().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_opens_and_reuses_partitions() {
        let temp_dir = tempfile::tempdir().unwrap();
        let registry = StateStoreRegistry::new(temp_dir.path());
        let first = registry.open_partition("counts", 0, None).unwrap();
        let second = registry.open_partition("counts", 0, None).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert!(registry.get_partition("counts", 1).is_none());
    }

    #[test]
    fn test_close_partition() {
        let temp_dir = tempfile::tempdir().unwrap();
        let registry = StateStoreRegistry::new(temp_dir.path());
        registry.open_partition("counts", 0, None).unwrap();
        registry.open_partition("counts", 1, None).unwrap();

        registry.close_partition("counts", 0);
        assert!(registry.get_partition("counts", 0).is_none());
        assert!(registry.get_partition("counts", 1).is_some());
    }
}
