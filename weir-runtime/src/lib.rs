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

//! Client-side stream processing over Kafka.
//!
//! An application registers a pipeline per input topic and runs the
//! [`Runtime`]: a single-threaded loop that consumes records, executes the
//! pipelines, maintains keyed state in local RocksDB partitions replicated to
//! compacted changelog topics, and seals processed offsets, produced output,
//! and state mutations together in periodic checkpoints. With the
//! exactly-once guarantee the checkpoint rides a Kafka transaction; with
//! at-least-once it uses plain synchronous commits.

mod checkpoint;
mod consumer;
mod error;
mod model;
mod pipeline;
mod producer;
mod recovery;
mod serialize;
mod topic;

mod runtime;

pub use checkpoint::Checkpoint;
pub use consumer::{KafkaMessage, RebalanceEvent, RuntimeConsumer};
pub use error::{ProcessingError, ProcessingPhase};
pub use model::{ConsumedRecord, PartitionState, Row, RowValue, TopicPartition};
pub use pipeline::{
    ErrorAction, Pipeline, PipelineErrorHandler, ProcessingContext, StateHandle,
};
pub use producer::{transactional_id, RowProducer, RowProducerError};
pub use recovery::RecoveryManager;
pub use runtime::{Runtime, RuntimeCounters, ShutdownHandle};
pub use serialize::{
    Deserialized, DeserializeContext, JsonArrayMode, OnMalformed, SerializationError,
    SerializationFormat, SerializeContext,
};
pub use topic::{
    changelog_topic_name, repartition_topic_name, TimestampExtractor, Topic, TopicConfig,
    TopicManager,
};
