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
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use tracing::{debug, info, warn};
use weir_config::{validate_identifier, WeirConfig};
use weir_state::{StateError, StateStoreRegistry, StoreTransaction};

use crate::checkpoint::Checkpoint;
use crate::consumer::{next_offsets_as_tpl, KafkaMessage, RebalanceEvent, RuntimeConsumer};
use crate::error::{ProcessingError, ProcessingPhase};
use crate::model::{ConsumedRecord, PartitionState, Row, TopicPartition};
use crate::pipeline::{ErrorAction, Pipeline, PipelineErrorHandler, ProcessingContext};
use crate::producer::{RowProducer, RowProducerError};
use crate::recovery::RecoveryManager;
use crate::serialize::{DeserializeContext, Deserialized, SerializationError};
use crate::topic::{Topic, TopicManager};

const SELECT_TIMEOUT: Duration = Duration::from_millis(100);
const STARTUP_TIMEOUT: Duration = Duration::from_secs(30);
/// Outstanding-message counts at which a partition is paused and resumed.
/// Bounded memory beats commit frequency when the producer falls behind.
const BACKPRESSURE_PAUSE_IN_FLIGHT: i64 = 50_000;
const BACKPRESSURE_RESUME_IN_FLIGHT: i64 = 25_000;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuntimeCounters {
    pub num_records_processed: u64,
    pub num_records_skipped: u64,
    pub num_rows_produced: u64,
    pub num_pipeline_errors: u64,
    pub num_checkpoints: u64,
    pub num_recoveries: u64,
}

/// Flips the loop-level shutdown flag; the loop observes it within one poll
/// timeout.
#[derive(Clone)]
pub struct ShutdownHandle {
    shutdown: Arc<AtomicBool>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }
}

struct PipelineEntry {
    pipeline: Box<dyn Pipeline>,
    store_names: Vec<String>,
    error_handler: Option<PipelineErrorHandler>,
}

/// One stream-processing application instance: a set of pipelines keyed by
/// input topic, plus the Kafka and state plumbing to run them with the
/// configured processing guarantee.
pub struct Runtime {
    config: WeirConfig,
    topic_manager: TopicManager,
    pipelines: BTreeMap<String, PipelineEntry>,
    /// store name -> input topic owning it.
    store_topics: HashMap<String, String>,
    shutdown: Arc<AtomicBool>,
}

impl Runtime {
    pub fn new(config: WeirConfig) -> anyhow::Result<Runtime> {
        config.validate()?;
        let topic_manager = TopicManager::from_config(&config)?;
        Ok(Runtime {
            config,
            topic_manager,
            pipelines: BTreeMap::new(),
            store_topics: HashMap::new(),
            shutdown: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            shutdown: self.shutdown.clone(),
        }
    }

    /// Registers `pipeline` as the handler for `topic`, together with the
    /// named stores it may access. Store names are global to the application:
    /// each belongs to exactly one input topic.
    pub fn add_pipeline(
        &mut self,
        topic: Topic,
        store_names: &[&str],
        pipeline: impl Pipeline + 'static,
    ) -> anyhow::Result<()> {
        if self.pipelines.contains_key(&topic.name) {
            bail!("A pipeline is already registered for topic `{}`.", topic.name);
        }
        for store_name in store_names {
            validate_identifier("Store name", store_name)?;
            if let Some(owner) = self.store_topics.get(*store_name) {
                bail!("Store `{store_name}` is already bound to topic `{owner}`.");
            }
        }
        for store_name in store_names {
            self.store_topics
                .insert(store_name.to_string(), topic.name.clone());
        }
        self.pipelines.insert(
            topic.name.clone(),
            PipelineEntry {
                pipeline: Box::new(pipeline),
                store_names: store_names.iter().map(|name| name.to_string()).collect(),
                error_handler: None,
            },
        );
        self.topic_manager.register_topic(topic);
        Ok(())
    }

    /// Installs a record-level error handler for `topic`'s pipeline.
    pub fn set_error_handler(
        &mut self,
        topic_name: &str,
        error_handler: PipelineErrorHandler,
    ) -> anyhow::Result<()> {
        let entry = self
            .pipelines
            .get_mut(topic_name)
            .with_context(|| format!("No pipeline registered for topic `{topic_name}`."))?;
        entry.error_handler = Some(error_handler);
        Ok(())
    }

    /// Runs the processing loop until shutdown or a fatal error. On fatal
    /// exit the error identifies the phase and the offending record position.
    pub fn run(self) -> anyhow::Result<RuntimeCounters> {
        let worker = RuntimeWorker::start(self)?;
        worker.run().map_err(anyhow::Error::from)
    }
}

enum Incoming {
    Event(RebalanceEvent),
    Message(KafkaMessage),
    TimedOut,
    Disconnected,
}

struct RuntimeWorker {
    config: WeirConfig,
    topic_manager: TopicManager,
    pipelines: BTreeMap<String, PipelineEntry>,
    store_topics: HashMap<String, String>,
    shutdown: Arc<AtomicBool>,
    producer: RowProducer,
    consumer: RuntimeConsumer,
    stores: StateStoreRegistry,
    recovery: RecoveryManager,
    partition_states: HashMap<TopicPartition, PartitionState>,
    transactions: HashMap<(String, i32), StoreTransaction>,
    checkpoint: Checkpoint,
    counters: RuntimeCounters,
    txn_active: bool,
}

impl RuntimeWorker {
    fn start(runtime: Runtime) -> anyhow::Result<RuntimeWorker> {
        let Runtime {
            config,
            topic_manager,
            pipelines,
            store_topics,
            shutdown,
        } = runtime;
        if pipelines.is_empty() {
            bail!("No pipeline registered: nothing to run.");
        }

        topic_manager.fetch_broker_configs(STARTUP_TIMEOUT)?;
        if config.use_changelog_topics {
            for (topic_name, entry) in &pipelines {
                for store_name in &entry.store_names {
                    topic_manager.changelog_topic(topic_name, store_name)?;
                }
            }
        }
        topic_manager.ensure_topics_created(STARTUP_TIMEOUT)?;
        topic_manager.fetch_broker_configs(STARTUP_TIMEOUT)?;
        topic_manager.validate_all()?;

        std::fs::create_dir_all(&config.state_dir_path).with_context(|| {
            format!(
                "Failed to create state dir `{}`.",
                config.state_dir_path.display()
            )
        })?;
        let stores = StateStoreRegistry::new(&config.state_dir_path);
        let recovery = RecoveryManager::from_config(&config);
        let producer = RowProducer::from_config(&config)?;
        let input_topics: Vec<String> = pipelines.keys().cloned().collect();
        let consumer = RuntimeConsumer::from_config(&config, &input_topics)?;
        let txn_active = if producer.is_transactional() {
            producer.begin_transaction()?;
            true
        } else {
            false
        };
        info!(
            consumer_group = %config.consumer_group,
            input_topics = ?input_topics,
            exactly_once = config.exactly_once(),
            "Starting processing loop."
        );
        Ok(RuntimeWorker {
            config,
            topic_manager,
            pipelines,
            store_topics,
            shutdown,
            producer,
            consumer,
            stores,
            recovery,
            partition_states: HashMap::new(),
            transactions: HashMap::new(),
            checkpoint: Checkpoint::new(),
            counters: RuntimeCounters::default(),
            txn_active,
        })
    }

    fn run(mut self) -> Result<RuntimeCounters, ProcessingError> {
        let outcome = self.process_until_shutdown();
        self.consumer.shutdown();
        self.transactions.clear();
        self.stores.close_all();
        match outcome {
            Ok(()) => {
                info!(counters = ?self.counters, "Processing loop stopped.");
                Ok(self.counters)
            }
            Err(error) => {
                self.abort_producer_transaction();
                Err(error)
            }
        }
    }

    fn process_until_shutdown(&mut self) -> Result<(), ProcessingError> {
        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                return self.finalize();
            }
            let incoming = flume::Selector::new()
                .recv(self.consumer.events(), |received| match received {
                    Ok(event) => Incoming::Event(event),
                    Err(_) => Incoming::Disconnected,
                })
                .recv(self.consumer.messages(), |received| match received {
                    Ok(message) => Incoming::Message(message),
                    Err(_) => Incoming::Disconnected,
                })
                .wait_timeout(SELECT_TIMEOUT)
                .unwrap_or(Incoming::TimedOut);
            match incoming {
                Incoming::Event(event) => self.handle_rebalance_event(event)?,
                Incoming::Message(message) => self.handle_kafka_message(message)?,
                Incoming::TimedOut => {}
                Incoming::Disconnected => {
                    warn!("Consumer channels disconnected, shutting down.");
                    return self.finalize();
                }
            }
            self.maybe_resume_paused()?;
            let has_dirty_state = self
                .transactions
                .values()
                .any(StoreTransaction::is_dirty);
            if self.checkpoint.should_commit(
                self.config.commit_interval(),
                self.config.commit_every,
                has_dirty_state,
            ) {
                self.commit_checkpoint()?;
            }
        }
    }

    /// Orderly shutdown: drain what was already handed over, seal it with a
    /// final checkpoint.
    fn finalize(&mut self) -> Result<(), ProcessingError> {
        info!("Shutdown requested: draining buffered records and taking a final checkpoint.");
        self.process_all_buffered()?;
        self.commit_checkpoint()?;
        self.abort_producer_transaction();
        Ok(())
    }

    fn handle_rebalance_event(&mut self, event: RebalanceEvent) -> Result<(), ProcessingError> {
        match event {
            RebalanceEvent::Assigned { partitions, ack_tx } => {
                let outcome = self.handle_assigned(&partitions);
                // Ack even on failure so the poll thread is never left
                // blocked inside the callback.
                let _ = ack_tx.send(());
                outcome
            }
            RebalanceEvent::Revoked { partitions, ack_tx } => {
                let outcome = self.handle_revoked(&partitions);
                let _ = ack_tx.send(());
                outcome
            }
            RebalanceEvent::Lost => self.handle_lost(),
        }
    }

    /// On-assign: open the store partitions of every assigned input
    /// partition and replay their changelog tails. The poll thread is blocked
    /// on our ack for the whole duration, so no record reaches a partition
    /// whose recovery is incomplete.
    fn handle_assigned(&mut self, partitions: &[TopicPartition]) -> Result<(), ProcessingError> {
        for topic_partition in partitions {
            let Some(store_names) = self
                .pipelines
                .get(&topic_partition.topic)
                .map(|entry| entry.store_names.clone())
            else {
                warn!(topic_partition = %topic_partition, "Assigned a partition with no registered pipeline.");
                continue;
            };
            self.partition_states
                .entry(topic_partition.clone())
                .or_insert_with(|| PartitionState::new(topic_partition.clone()));
            for store_name in store_names {
                let changelog_topic = if self.config.use_changelog_topics {
                    let changelog = self
                        .topic_manager
                        .changelog_topic(&topic_partition.topic, &store_name)
                        .map_err(|error| {
                            ProcessingError::new(ProcessingPhase::Recovery, error)
                                .at(topic_partition.clone())
                        })?;
                    Some(changelog.name)
                } else {
                    None
                };
                let store = self
                    .stores
                    .open_partition(&store_name, topic_partition.partition, changelog_topic)
                    .map_err(|error| {
                        ProcessingError::new(ProcessingPhase::Recovery, error.into())
                            .at(topic_partition.clone())
                    })?;
                if self.config.use_changelog_topics {
                    self.recovery
                        .recover_store_partition(&store)
                        .map_err(|error| {
                            ProcessingError::new(ProcessingPhase::Recovery, error)
                                .at(topic_partition.clone())
                        })?;
                    self.counters.num_recoveries += 1;
                }
            }
        }
        Ok(())
    }

    /// On-revoke: records already handed over belong to the assignment epoch
    /// being closed, so they are processed and sealed in a final checkpoint
    /// scoped to the revoked partitions; the surviving partitions keep their
    /// in-flight unit.
    fn handle_revoked(&mut self, partitions: &[TopicPartition]) -> Result<(), ProcessingError> {
        self.drain_pending_messages()?;
        self.process_buffered_for(partitions)?;
        self.commit_checkpoint_for(partitions)?;
        for topic_partition in partitions {
            self.partition_states.remove(topic_partition);
            if let Some(store_names) = self
                .pipelines
                .get(&topic_partition.topic)
                .map(|entry| entry.store_names.clone())
            {
                for store_name in &store_names {
                    self.stores
                        .close_partition(store_name, topic_partition.partition);
                }
            }
        }
        Ok(())
    }

    /// On-lost: everything is discarded without a checkpoint; the partitions
    /// will be replayed elsewhere.
    fn handle_lost(&mut self) -> Result<(), ProcessingError> {
        warn!("Assignment lost: discarding all partition state without a checkpoint.");
        self.transactions.clear();
        self.partition_states.clear();
        self.checkpoint = Checkpoint::new();
        self.stores.close_all();
        if self.producer.is_transactional() {
            self.abort_producer_transaction();
            self.producer.begin_transaction().map_err(|error| {
                ProcessingError::new(ProcessingPhase::Commit, error.into())
            })?;
            self.txn_active = true;
        }
        Ok(())
    }

    fn drain_pending_messages(&mut self) -> Result<(), ProcessingError> {
        loop {
            let message = match self.consumer.messages().try_recv() {
                Ok(message) => message,
                Err(_) => return Ok(()),
            };
            self.handle_kafka_message(message)?;
        }
    }

    fn handle_kafka_message(&mut self, message: KafkaMessage) -> Result<(), ProcessingError> {
        match message {
            KafkaMessage::Record(record) => self.handle_record(record),
            KafkaMessage::Error(kafka_error) => {
                if is_fatal_consumer_error(&kafka_error) {
                    Err(ProcessingError::new(
                        ProcessingPhase::Poll,
                        kafka_error.into(),
                    ))
                } else {
                    warn!(error = %kafka_error, "Transient consumer error.");
                    Ok(())
                }
            }
        }
    }

    fn handle_record(&mut self, record: ConsumedRecord) -> Result<(), ProcessingError> {
        let topic_partition = record.topic_partition();
        let Some(state) = self.partition_states.get_mut(&topic_partition) else {
            debug!(topic_partition = %topic_partition, "Dropping record for unassigned partition.");
            return Ok(());
        };
        if state.paused {
            state.buffered.push_back(record);
            return Ok(());
        }
        if self.producer.in_flight() >= BACKPRESSURE_PAUSE_IN_FLIGHT {
            debug!(
                topic_partition = %topic_partition,
                in_flight = self.producer.in_flight(),
                "Producer back-pressure: pausing partition."
            );
            state.paused = true;
            state.buffered.push_back(record);
            return Ok(());
        }
        self.process_record(record)
    }

    fn process_record(&mut self, record: ConsumedRecord) -> Result<(), ProcessingError> {
        let topic_partition = record.topic_partition();
        let Some(topic) = self.topic_manager.get_topic(&record.topic) else {
            debug!(topic = %record.topic, "Record from an unregistered topic, dropping.");
            return Ok(());
        };
        let deserialize_ctx = DeserializeContext {
            topic: &record.topic,
            partition: record.partition,
            headers: &record.headers,
            key: record.key.as_deref(),
        };
        let deserialized = topic
            .value_format
            .deserialize(record.payload.as_deref(), &deserialize_ctx)
            .map_err(|error| {
                ProcessingError::new(ProcessingPhase::Deserialize, error.into())
                    .at(topic_partition.clone())
                    .at_offset(record.offset)
            })?;
        let values = match deserialized {
            Deserialized::Skip => {
                // The record is acknowledged but contributes nothing: the
                // next checkpoint commits right past it.
                if let Some(state) = self.partition_states.get_mut(&topic_partition) {
                    state.next_offset = record.offset + 1;
                }
                self.checkpoint
                    .track_next_offset(topic_partition, record.offset + 1);
                self.counters.num_records_skipped += 1;
                return Ok(());
            }
            Deserialized::One(value) => vec![value],
            Deserialized::Many(values) => values,
        };

        let broker_timestamp_ms = record.timestamp_ms.unwrap_or(-1);
        let mut max_timestamp_ms = i64::MIN;
        for value in values {
            let timestamp_ms = topic.extract_timestamp(&value, broker_timestamp_ms);
            if timestamp_ms > max_timestamp_ms {
                max_timestamp_ms = timestamp_ms;
            }
            let row = Row {
                value,
                key: record.key.clone(),
                headers: record.headers.clone(),
                timestamp_ms,
                topic: record.topic.clone(),
                partition: record.partition,
                offset: record.offset,
            };
            self.dispatch_row(&row)?;
        }

        if let Some(state) = self.partition_states.get_mut(&topic_partition) {
            state.advance(record.offset, max_timestamp_ms);
        }
        self.checkpoint
            .track_next_offset(topic_partition, record.offset + 1);
        self.checkpoint.record_processed();
        self.counters.num_records_processed += 1;
        Ok(())
    }

    fn dispatch_row(&mut self, row: &Row) -> Result<(), ProcessingError> {
        let topic_partition = row.topic_partition();
        let Some(entry) = self.pipelines.get_mut(&row.topic) else {
            return Ok(());
        };
        let mut ctx = ProcessingContext {
            topics: &self.topic_manager,
            producer: &self.producer,
            stores: &self.stores,
            transactions: &mut self.transactions,
            partition: row.partition,
            offset: row.offset,
            num_rows_produced: &mut self.counters.num_rows_produced,
        };
        let outcome = entry.pipeline.process(row, &mut ctx);
        let Err(error) = outcome else {
            return Ok(());
        };
        self.counters.num_pipeline_errors += 1;
        let (phase, skippable) = classify_pipeline_error(&error);
        if skippable {
            if let Some(error_handler) = entry.error_handler.as_mut() {
                if error_handler(&error, row) == ErrorAction::Skip {
                    warn!(
                        topic_partition = %topic_partition,
                        offset = row.offset,
                        error = %format!("{error:#}"),
                        "Pipeline error classified as skippable by the error handler."
                    );
                    return Ok(());
                }
            }
        }
        self.abort_checkpoint();
        Err(ProcessingError::new(phase, error)
            .at(topic_partition)
            .at_offset(row.offset))
    }

    /// Freezes and commits the whole in-flight unit.
    fn commit_checkpoint(&mut self) -> Result<(), ProcessingError> {
        if self.checkpoint.is_empty() && self.transactions.is_empty() {
            // Nothing to seal: restart the interval, no commit call issued.
            self.checkpoint = Checkpoint::new();
            return Ok(());
        }
        let checkpoint = self.checkpoint.take();
        let transactions = std::mem::take(&mut self.transactions);
        self.commit_frozen(checkpoint, transactions)
    }

    /// Freezes and commits only the given partitions' offsets and store
    /// transactions, leaving the rest of the in-flight unit live. Used by
    /// on-revoke, where the surviving partitions keep processing.
    ///
    /// Under exactly-once the whole unit commits instead: a producer
    /// transaction is indivisible, and committing only some offsets while
    /// its output commits globally would break the guarantee.
    fn commit_checkpoint_for(
        &mut self,
        partitions: &[TopicPartition],
    ) -> Result<(), ProcessingError> {
        if self.producer.is_transactional() {
            return self.commit_checkpoint();
        }
        let checkpoint = self.checkpoint.split_off(partitions);
        let mut transactions: HashMap<(String, i32), StoreTransaction> = HashMap::new();
        let keys: Vec<(String, i32)> = self.transactions.keys().cloned().collect();
        for key in keys {
            let Some(input_topic) = self.store_topics.get(&key.0) else {
                continue;
            };
            if partitions.contains(&TopicPartition::new(input_topic, key.1)) {
                if let Some(transaction) = self.transactions.remove(&key) {
                    transactions.insert(key, transaction);
                }
            }
        }
        if checkpoint.is_empty() && transactions.is_empty() {
            return Ok(());
        }
        self.commit_frozen(checkpoint, transactions)
    }

    /// The strictly ordered commit sequence over a frozen unit. Durability
    /// at the broker (changelogs flushed, offsets committed) always precedes
    /// durability in the local store: after a crash in between, the
    /// changelog replay makes the store catch up to what was already
    /// committed.
    fn commit_frozen(
        &mut self,
        checkpoint: Checkpoint,
        transactions: HashMap<(String, i32), StoreTransaction>,
    ) -> Result<(), ProcessingError> {
        debug!(
            num_partitions = checkpoint.next_offsets().len(),
            num_transactions = transactions.len(),
            num_records = checkpoint.num_processed_records(),
            "Committing checkpoint."
        );

        // Replicate every dirty write-set to its changelog topic.
        let mut prepared: Vec<StoreTransaction> = Vec::new();
        for ((store_name, partition), mut transaction) in transactions {
            if !transaction.is_dirty() {
                transaction.discard();
                continue;
            }
            let Some(input_topic) = self.store_topics.get(&store_name).cloned() else {
                transaction.discard();
                continue;
            };
            if let Err(error) = transaction.prepare_changelog(&self.producer, &input_topic) {
                drop(transaction);
                drop(prepared);
                self.abort_producer_transaction();
                return Err(ProcessingError::new(ProcessingPhase::Produce, error.into())
                    .at(TopicPartition::new(&input_topic, partition)));
            }
            prepared.push(transaction);
        }

        // Wait for every in-flight message, outputs and changelogs alike.
        if let Err(error) = self.producer.flush(self.config.flush_timeout()) {
            drop(prepared);
            self.abort_producer_transaction();
            return Err(ProcessingError::new(ProcessingPhase::Flush, error.into()));
        }

        // Make the input offsets durable at the broker.
        if !checkpoint.next_offsets().is_empty() {
            if self.producer.is_transactional() {
                let tpl = next_offsets_as_tpl(checkpoint.next_offsets())
                    .map_err(|error| ProcessingError::new(ProcessingPhase::Commit, error))?;
                let group_metadata = self
                    .consumer
                    .group_metadata()
                    .context("Consumer group metadata is unavailable.")
                    .map_err(|error| ProcessingError::new(ProcessingPhase::Commit, error))?;
                if let Err(error) = self.producer.commit_transaction(
                    &tpl,
                    &group_metadata,
                    self.config.flush_timeout(),
                ) {
                    drop(prepared);
                    self.abort_producer_transaction();
                    return Err(ProcessingError::new(ProcessingPhase::Commit, error.into()));
                }
                self.txn_active = false;
            } else if let Err(error) = self.consumer.commit_offsets(checkpoint.next_offsets()) {
                drop(prepared);
                return Err(ProcessingError::new(ProcessingPhase::Commit, error));
            }
        }

        // Only now let the local store catch up with the changelog.
        for transaction in prepared {
            let store_name = transaction.store_name().to_string();
            let partition = transaction.partition();
            let watermark = self
                .stores
                .get_partition(&store_name, partition)
                .and_then(|store| store.changelog_topic().map(str::to_string))
                .and_then(|changelog_topic| {
                    self.producer.delivered_offset(&changelog_topic, partition)
                });
            transaction.commit(watermark).map_err(|error| {
                ProcessingError::new(ProcessingPhase::StoreCommit, error.into())
            })?;
        }

        self.counters.num_checkpoints += 1;
        if self.producer.is_transactional() && !self.txn_active {
            self.producer
                .begin_transaction()
                .map_err(|error| ProcessingError::new(ProcessingPhase::Commit, error.into()))?;
            self.txn_active = true;
        }
        Ok(())
    }

    fn abort_checkpoint(&mut self) {
        warn!("Aborting the in-flight checkpoint.");
        self.abort_producer_transaction();
        self.transactions.clear();
        self.checkpoint = Checkpoint::new();
    }

    fn abort_producer_transaction(&mut self) {
        if self.producer.is_transactional() && self.txn_active {
            self.producer.abort_transaction(self.config.flush_timeout());
            self.txn_active = false;
        }
    }

    /// Resumes paused partitions once the producer queue has drained enough,
    /// replaying their buffered records in arrival order.
    fn maybe_resume_paused(&mut self) -> Result<(), ProcessingError> {
        if self.producer.in_flight() > BACKPRESSURE_RESUME_IN_FLIGHT {
            return Ok(());
        }
        let paused: Vec<TopicPartition> = self
            .partition_states
            .iter()
            .filter(|(_, state)| state.paused)
            .map(|(topic_partition, _)| topic_partition.clone())
            .collect();
        for topic_partition in paused {
            if let Some(state) = self.partition_states.get_mut(&topic_partition) {
                state.paused = false;
            }
            loop {
                if self.producer.in_flight() >= BACKPRESSURE_PAUSE_IN_FLIGHT {
                    if let Some(state) = self.partition_states.get_mut(&topic_partition) {
                        state.paused = true;
                    }
                    break;
                }
                let Some(record) = self
                    .partition_states
                    .get_mut(&topic_partition)
                    .and_then(|state| state.buffered.pop_front())
                else {
                    break;
                };
                self.process_record(record)?;
            }
        }
        Ok(())
    }

    /// Processes every buffered record regardless of back-pressure: callers
    /// follow up with a checkpoint whose flush drains the queue.
    fn process_all_buffered(&mut self) -> Result<(), ProcessingError> {
        let topic_partitions: Vec<TopicPartition> =
            self.partition_states.keys().cloned().collect();
        self.process_buffered_for(&topic_partitions)
    }

    /// Like [`process_all_buffered`](Self::process_all_buffered), restricted
    /// to the given partitions. Other partitions keep their buffers.
    fn process_buffered_for(
        &mut self,
        partitions: &[TopicPartition],
    ) -> Result<(), ProcessingError> {
        for topic_partition in partitions {
            loop {
                let Some(record) = self
                    .partition_states
                    .get_mut(topic_partition)
                    .and_then(|state| state.buffered.pop_front())
                else {
                    break;
                };
                self.process_record(record)?;
            }
            if let Some(state) = self.partition_states.get_mut(topic_partition) {
                state.paused = false;
            }
        }
        Ok(())
    }
}

fn is_fatal_consumer_error(error: &rdkafka::error::KafkaError) -> bool {
    matches!(
        error,
        rdkafka::error::KafkaError::MessageConsumption(
            rdkafka::error::RDKafkaErrorCode::Fatal
        )
    )
}

/// State and producer failures are never skippable: the former breaks the
/// store/changelog contract, the latter means output may be lost.
fn classify_pipeline_error(error: &anyhow::Error) -> (ProcessingPhase, bool) {
    for cause in error.chain() {
        if cause.downcast_ref::<StateError>().is_some() {
            return (ProcessingPhase::Pipeline, false);
        }
        if cause.downcast_ref::<RowProducerError>().is_some() {
            return (ProcessingPhase::Produce, false);
        }
        if cause.downcast_ref::<SerializationError>().is_some() {
            return (ProcessingPhase::Produce, true);
        }
    }
    (ProcessingPhase::Pipeline, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serialize::SerializationFormat;

    fn runtime_for_test() -> Runtime {
        Runtime::new(WeirConfig::for_test()).unwrap()
    }

    fn noop_pipeline() -> impl Pipeline {
        |_row: &Row, _ctx: &mut ProcessingContext<'_>| -> anyhow::Result<()> { Ok(()) }
    }

    #[test]
    fn test_add_pipeline_rejects_duplicates() {
        let mut runtime = runtime_for_test();
        runtime
            .add_pipeline(
                Topic::input("words", SerializationFormat::json()),
                &["counts"],
                noop_pipeline(),
            )
            .unwrap();
        let error = runtime
            .add_pipeline(
                Topic::input("words", SerializationFormat::json()),
                &[],
                noop_pipeline(),
            )
            .unwrap_err();
        assert!(error.to_string().contains("already registered"));
    }

    #[test]
    fn test_add_pipeline_rejects_claimed_store() {
        let mut runtime = runtime_for_test();
        runtime
            .add_pipeline(
                Topic::input("words", SerializationFormat::json()),
                &["counts"],
                noop_pipeline(),
            )
            .unwrap();
        let error = runtime
            .add_pipeline(
                Topic::input("sentences", SerializationFormat::json()),
                &["counts"],
                noop_pipeline(),
            )
            .unwrap_err();
        assert!(error.to_string().contains("already bound"));
    }

    #[test]
    fn test_add_pipeline_validates_store_names() {
        let mut runtime = runtime_for_test();
        let error = runtime
            .add_pipeline(
                Topic::input("words", SerializationFormat::json()),
                &["bad store!"],
                noop_pipeline(),
            )
            .unwrap_err();
        assert!(error.to_string().contains("invalid"));
    }

    #[test]
    fn test_set_error_handler_requires_pipeline() {
        let mut runtime = runtime_for_test();
        let error = runtime
            .set_error_handler("words", Box::new(|_, _| ErrorAction::Skip))
            .unwrap_err();
        assert!(error.to_string().contains("No pipeline"));
    }

    #[test]
    fn test_shutdown_handle_flips_the_flag() {
        let runtime = runtime_for_test();
        let handle = runtime.shutdown_handle();
        assert!(!runtime.shutdown.load(Ordering::SeqCst));
        handle.shutdown();
        assert!(runtime.shutdown.load(Ordering::SeqCst));
    }

    #[test]
    fn test_classify_pipeline_error() {
        let plain = anyhow::anyhow!("user code exploded");
        assert_eq!(classify_pipeline_error(&plain), (ProcessingPhase::Pipeline, true));

        let producer_error: anyhow::Error = RowProducerError::QueueFull.into();
        assert_eq!(
            classify_pipeline_error(&producer_error.context("while producing")),
            (ProcessingPhase::Produce, false)
        );

        let state_error: anyhow::Error = StateError::TransactionAlreadyOpen {
            store_name: "counts".to_string(),
            partition: 0,
        }
        .into();
        assert_eq!(
            classify_pipeline_error(&state_error),
            (ProcessingPhase::Pipeline, false)
        );
    }
}
