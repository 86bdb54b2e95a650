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

//! Local state for stateful stream processing.
//!
//! A store is a named keyspace sharded 1:1 with the partitions of its input
//! topic. Each `(store name, partition)` pair owns a RocksDB instance plus a
//! metadata file recording how far the changelog replication has been applied
//! locally. All mutations go through [`StoreTransaction`], whose write-set is
//! replicated to a compacted Kafka changelog topic before it is applied
//! locally: the store never leads the changelog.

mod changelog;
mod metadata;
mod partition;
mod registry;
mod transaction;

pub use changelog::{
    decode_source_offset, decode_source_partition, encode_source_offset, encode_source_partition,
    ChangelogRecord, ChangelogSource, ChangelogWriter, KeyPrefix, PREFIX_HEADER,
    SOURCE_OFFSET_HEADER, SOURCE_PARTITION_HEADER, SOURCE_TOPIC_HEADER,
};
pub use metadata::PartitionMetadata;
pub use partition::StorePartition;
pub use registry::StateStoreRegistry;
pub use transaction::{StoreTransaction, TransactionStatus};

#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("Store I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("RocksDB error: {0}")]
    Rocksdb(#[from] rocksdb::Error),
    #[error("A transaction is already open for store `{store_name}` partition `{partition}`.")]
    TransactionAlreadyOpen { store_name: String, partition: i32 },
    #[error("Transaction is `{status:?}` and cannot accept further operations.")]
    TransactionClosed { status: TransactionStatus },
    #[error(
        "Writer fenced for store `{store_name}` partition `{partition}`: on-disk epoch \
         `{disk_epoch}` is newer than ours (`{our_epoch}`)."
    )]
    Fenced {
        store_name: String,
        partition: i32,
        our_epoch: u64,
        disk_epoch: u64,
    },
    #[error("Failed to replicate write-set to changelog: {0}")]
    ChangelogWrite(#[source] anyhow::Error),
    #[error("Metadata file `{path}` is corrupted: {source}")]
    MetadataCorrupted {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}
