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

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::StateError;

pub const METADATA_FILE_NAME: &str = "partition.json";

/// Durable per-store-partition bookkeeping, kept next to the RocksDB
/// directory.
///
/// `processed_offset` is the changelog offset of the last record whose effect
/// is visible in the local store (`-1` before the first commit). `epoch`
/// fences concurrent writers: it is bumped every time the partition is opened
/// and a commit from a stale epoch is rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionMetadata {
    pub processed_offset: i64,
    pub epoch: u64,
}

impl Default for PartitionMetadata {
    fn default() -> Self {
        PartitionMetadata {
            processed_offset: -1,
            epoch: 0,
        }
    }
}

impl PartitionMetadata {
    pub fn load(dir: &Path) -> Result<Option<PartitionMetadata>, StateError> {
        let path = dir.join(METADATA_FILE_NAME);
        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(error) => return Err(error.into()),
        };
        let metadata = serde_json::from_slice::<PartitionMetadata>(&bytes).map_err(|error| {
            StateError::MetadataCorrupted {
                path: path.display().to_string(),
                source: error,
            }
        })?;
        Ok(Some(metadata))
    }

    /// Writes the metadata file atomically (write-then-rename), so a crash
    /// mid-write leaves the previous version intact.
    pub fn store(&self, dir: &Path) -> Result<(), StateError> {
        let tmp_path = dir.join(format!("{METADATA_FILE_NAME}.tmp"));
        let json = serde_json::to_vec_pretty(self).expect("Metadata should serialize.");
        std::fs::write(&tmp_path, json)?;
        std::fs::rename(&tmp_path, dir.join(METADATA_FILE_NAME))?;
        Ok(())
    }
}
