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
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context as AnyhowContext;
use rdkafka::consumer::ConsumerGroupMetadata;
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::message::{Message, OwnedHeaders};
use rdkafka::producer::{BaseRecord, DeliveryResult, Producer, ProducerContext, ThreadedProducer};
use rdkafka::{ClientConfig, ClientContext, TopicPartitionList};
use tracing::{debug, error, warn};
use weir_config::WeirConfig;
use weir_state::{
    ChangelogRecord, ChangelogWriter, PREFIX_HEADER, SOURCE_OFFSET_HEADER,
    SOURCE_PARTITION_HEADER, SOURCE_TOPIC_HEADER,
};

const QUEUE_FULL_NUM_RETRIES: usize = 20;
const QUEUE_FULL_RETRY_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, thiserror::Error)]
pub enum RowProducerError {
    #[error("Producer queue is full.")]
    QueueFull,
    #[error("Producer flush timed out with {num_pending} messages still in flight.")]
    FlushTimeout { num_pending: i64 },
    #[error("Message delivery failed: {0}")]
    Delivery(RDKafkaErrorCode),
    #[error("Producer transaction failed: {0}")]
    Transaction(#[source] KafkaError),
    #[error("Kafka producer error: {0}")]
    Kafka(#[from] KafkaError),
}

/// Shared between the loop thread and librdkafka's delivery callbacks.
#[derive(Default)]
pub(crate) struct DeliveryTracker {
    in_flight: AtomicI64,
    first_error: Mutex<Option<RDKafkaErrorCode>>,
    delivered_offsets: Mutex<HashMap<(String, i32), i64>>,
}

impl DeliveryTracker {
    fn record_success(&self, topic: &str, partition: i32, offset: i64) {
        let mut delivered_offsets = self.delivered_offsets.lock().unwrap();
        let delivered_offset = delivered_offsets
            .entry((topic.to_string(), partition))
            .or_insert(-1);
        if offset > *delivered_offset {
            *delivered_offset = offset;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }

    fn record_failure(&self, error_code: RDKafkaErrorCode) {
        let mut first_error = self.first_error.lock().unwrap();
        if first_error.is_none() {
            *first_error = Some(error_code);
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

struct TrackingProducerContext {
    tracker: Arc<DeliveryTracker>,
}

impl ClientContext for TrackingProducerContext {}

impl ProducerContext for TrackingProducerContext {
    type DeliveryOpaque = ();

    fn delivery(&self, delivery_result: &DeliveryResult<'_>, _delivery_opaque: ()) {
        match delivery_result {
            Ok(message) => {
                self.tracker
                    .record_success(message.topic(), message.partition(), message.offset());
            }
            Err((kafka_error, message)) => {
                error!(
                    topic = message.topic(),
                    partition = message.partition(),
                    error = %kafka_error,
                    "Message delivery failed."
                );
                let error_code = match kafka_error {
                    KafkaError::MessageProduction(error_code) => *error_code,
                    _ => RDKafkaErrorCode::Fail,
                };
                self.tracker.record_failure(error_code);
            }
        }
    }
}

/// The transactional id is a pure function of the application identity so a
/// restarted instance takes over the fencing token of its predecessor.
pub fn transactional_id(consumer_group: &str, application_id: &str) -> String {
    format!("weir-{consumer_group}--{application_id}")
}

/// Wraps a Kafka producer with per-message delivery tracking, a synchronous
/// "drain everything in flight" flush, and an optional transactional mode.
///
/// Shared by all partitions of the loop thread; the loop's single-threaded
/// discipline is what makes that safe.
pub struct RowProducer {
    producer: ThreadedProducer<TrackingProducerContext>,
    tracker: Arc<DeliveryTracker>,
    transactional: bool,
}

impl RowProducer {
    pub fn from_config(config: &WeirConfig) -> anyhow::Result<RowProducer> {
        let mut client_config = ClientConfig::new();
        client_config.set("bootstrap.servers", &config.bootstrap_servers);
        for (key, value) in &config.producer_extra_config {
            client_config.set(key, value);
        }
        if config.exactly_once() {
            client_config.set(
                "transactional.id",
                transactional_id(&config.consumer_group, &config.application_id),
            );
            client_config.set("enable.idempotence", "true");
        }
        let tracker = Arc::new(DeliveryTracker::default());
        let producer: ThreadedProducer<TrackingProducerContext> = client_config
            .create_with_context(TrackingProducerContext {
                tracker: tracker.clone(),
            })
            .context("Failed to create Kafka producer.")?;
        if config.exactly_once() {
            producer
                .init_transactions(config.flush_timeout())
                .context("Failed to initialize producer transactions.")?;
        }
        Ok(RowProducer {
            producer,
            tracker,
            transactional: config.exactly_once(),
        })
    }

    pub fn is_transactional(&self) -> bool {
        self.transactional
    }

    /// Number of produced messages not yet acknowledged by the broker.
    pub fn in_flight(&self) -> i64 {
        self.tracker.in_flight.load(Ordering::SeqCst)
    }

    /// Enqueues a message for asynchronous delivery and returns immediately.
    ///
    /// A full queue is retried with short bounded waits (the background
    /// poller keeps draining it); when the waits are exhausted the caller
    /// gets [`RowProducerError::QueueFull`] and is expected to checkpoint.
    pub fn produce(
        &self,
        topic: &str,
        partition: Option<i32>,
        key: Option<&[u8]>,
        payload: Option<&[u8]>,
        headers: &[(String, Vec<u8>)],
        timestamp_ms: Option<i64>,
    ) -> Result<(), RowProducerError> {
        let mut owned_headers = OwnedHeaders::new_with_capacity(headers.len());
        for (name, value) in headers {
            owned_headers = owned_headers.add(name, value);
        }
        let mut record: BaseRecord<[u8], [u8]> = BaseRecord::to(topic);
        record.partition = partition;
        record.key = key;
        record.payload = payload;
        record.timestamp = timestamp_ms;
        record.headers = Some(owned_headers);

        let mut num_retries = 0;
        loop {
            match self.producer.send(record) {
                Ok(()) => {
                    self.tracker.in_flight.fetch_add(1, Ordering::SeqCst);
                    return Ok(());
                }
                Err((KafkaError::MessageProduction(RDKafkaErrorCode::QueueFull), returned)) => {
                    if num_retries >= QUEUE_FULL_NUM_RETRIES {
                        return Err(RowProducerError::QueueFull);
                    }
                    num_retries += 1;
                    record = returned;
                    std::thread::sleep(QUEUE_FULL_RETRY_INTERVAL);
                }
                Err((kafka_error, _)) => return Err(kafka_error.into()),
            }
        }
    }

    /// Blocks until every in-flight message is acknowledged or `timeout`
    /// elapses. On timeout all unacked messages must be considered lost for
    /// the current checkpoint.
    pub fn flush(&self, timeout: Duration) -> Result<(), RowProducerError> {
        self.producer.flush(timeout);
        if let Some(error_code) = self.tracker.first_error.lock().unwrap().take() {
            return Err(RowProducerError::Delivery(error_code));
        }
        let num_pending = self.in_flight();
        if num_pending > 0 {
            return Err(RowProducerError::FlushTimeout { num_pending });
        }
        Ok(())
    }

    pub fn begin_transaction(&self) -> Result<(), RowProducerError> {
        self.producer
            .begin_transaction()
            .map_err(RowProducerError::Transaction)
    }

    /// Enlists the consumer offsets into the open transaction and commits it.
    /// A retriable commit failure is retried once, then escalated.
    pub fn commit_transaction(
        &self,
        offsets: &TopicPartitionList,
        group_metadata: &ConsumerGroupMetadata,
        timeout: Duration,
    ) -> Result<(), RowProducerError> {
        self.producer
            .send_offsets_to_transaction(offsets, group_metadata, timeout)
            .map_err(RowProducerError::Transaction)?;
        match self.producer.commit_transaction(timeout) {
            Ok(()) => Ok(()),
            Err(KafkaError::Transaction(rd_error)) if rd_error.is_retriable() => {
                warn!(error = %rd_error, "Transaction commit failed with a retriable error, retrying once.");
                self.producer
                    .commit_transaction(timeout)
                    .map_err(RowProducerError::Transaction)
            }
            Err(kafka_error) => Err(RowProducerError::Transaction(kafka_error)),
        }
    }

    /// Best effort: an abort failure is logged, not surfaced, since the loop
    /// is already on its way down.
    pub fn abort_transaction(&self, timeout: Duration) {
        if let Err(kafka_error) = self.producer.abort_transaction(timeout) {
            error!(error = %kafka_error, "Failed to abort producer transaction.");
        }
    }
}

impl ChangelogWriter for RowProducer {
    fn write_changelog(&self, topic: &str, record: ChangelogRecord) -> anyhow::Result<()> {
        let headers = [
            (
                SOURCE_TOPIC_HEADER.to_string(),
                record.source.topic.clone().into_bytes(),
            ),
            (
                SOURCE_PARTITION_HEADER.to_string(),
                weir_state::encode_source_partition(record.source.partition).to_vec(),
            ),
            (
                SOURCE_OFFSET_HEADER.to_string(),
                weir_state::encode_source_offset(record.source.offset).to_vec(),
            ),
            (PREFIX_HEADER.to_string(), vec![record.prefix.0]),
        ];
        debug!(
            topic = topic,
            partition = record.source.partition,
            tombstone = record.value.is_none(),
            "Producing changelog record."
        );
        // Changelog partitioning mirrors the input partitioning 1:1.
        self.produce(
            topic,
            Some(record.source.partition),
            Some(&record.key),
            record.value.as_deref(),
            &headers,
            None,
        )
        .with_context(|| format!("Failed to produce changelog record to `{topic}`."))
    }

    fn delivered_offset(&self, topic: &str, partition: i32) -> Option<i64> {
        self.tracker
            .delivered_offsets
            .lock()
            .unwrap()
            .get(&(topic.to_string(), partition))
            .copied()
    }
}
