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
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::Context;
use rdkafka::consumer::{
    BaseConsumer, CommitMode, Consumer, ConsumerContext, ConsumerGroupMetadata, Rebalance,
};
use rdkafka::error::KafkaError;
use rdkafka::message::{BorrowedMessage, Headers, Message};
use rdkafka::{ClientConfig, ClientContext, Offset, TopicPartitionList};
use tracing::{debug, info, warn};
use weir_config::WeirConfig;

use crate::model::{ConsumedRecord, TopicPartition};

const POLL_TIMEOUT: Duration = Duration::from_millis(100);
const MESSAGE_CHANNEL_CAPACITY: usize = 64;

/// Rebalance callbacks, forwarded from the poll thread to the processing
/// loop. The poll thread blocks inside the callback until the loop acks,
/// which is what keeps records from flowing while stores are recovered
/// (assign) or checkpointed (revoke).
pub enum RebalanceEvent {
    Assigned {
        partitions: Vec<TopicPartition>,
        ack_tx: oneshot::Sender<()>,
    },
    Revoked {
        partitions: Vec<TopicPartition>,
        ack_tx: oneshot::Sender<()>,
    },
    /// The assignment was lost without an orderly revoke; everything must be
    /// discarded without a checkpoint.
    Lost,
}

#[derive(Debug)]
pub enum KafkaMessage {
    Record(ConsumedRecord),
    Error(KafkaError),
}

struct RuntimeConsumerContext {
    rebalance_events: flume::Sender<RebalanceEvent>,
    /// Once set, callbacks stop synchronizing with the loop: the final
    /// revoke fired by closing the consumer has nobody left to ack it.
    shutdown: Arc<AtomicBool>,
}

impl ClientContext for RuntimeConsumerContext {}

impl ConsumerContext for RuntimeConsumerContext {
    fn pre_rebalance(&self, rebalance: &Rebalance) {
        if self.shutdown.load(Ordering::Relaxed) {
            return;
        }
        if let Rebalance::Revoke(tpl) = rebalance {
            let partitions = partitions_of(tpl);
            info!(partitions = ?partitions, "Partitions revoked.");
            let (ack_tx, ack_rx) = oneshot::channel();
            if self
                .rebalance_events
                .send(RebalanceEvent::Revoked { partitions, ack_tx })
                .is_err()
            {
                // The loop is gone; nothing left to synchronize with.
                return;
            }
            let _ = ack_rx.recv();
        }
    }

    fn post_rebalance(&self, rebalance: &Rebalance) {
        if self.shutdown.load(Ordering::Relaxed) {
            return;
        }
        match rebalance {
            Rebalance::Assign(tpl) => {
                let partitions = partitions_of(tpl);
                info!(partitions = ?partitions, "Partitions assigned.");
                let (ack_tx, ack_rx) = oneshot::channel();
                if self
                    .rebalance_events
                    .send(RebalanceEvent::Assigned { partitions, ack_tx })
                    .is_err()
                {
                    return;
                }
                let _ = ack_rx.recv();
            }
            Rebalance::Error(error) => {
                warn!(error = ?error, "Rebalance error, treating the assignment as lost.");
                let _ = self.rebalance_events.send(RebalanceEvent::Lost);
            }
            Rebalance::Revoke(_) => {}
        }
    }
}

fn partitions_of(tpl: &TopicPartitionList) -> Vec<TopicPartition> {
    tpl.elements()
        .iter()
        .map(|element| TopicPartition::new(element.topic(), element.partition()))
        .collect()
}

fn consumed_record_from(message: &BorrowedMessage) -> ConsumedRecord {
    let mut headers = Vec::new();
    if let Some(borrowed_headers) = message.headers() {
        for idx in 0..borrowed_headers.count() {
            if let Some((name, value)) = borrowed_headers.get(idx) {
                headers.push((name.to_string(), value.to_vec()));
            }
        }
    }
    ConsumedRecord {
        topic: message.topic().to_string(),
        partition: message.partition(),
        offset: message.offset(),
        timestamp_ms: message.timestamp().to_millis(),
        key: message.key().map(<[u8]>::to_vec),
        payload: message.payload().map(<[u8]>::to_vec),
        headers,
    }
}

/// Builds the commit payload: for each partition, the offset of the next
/// record to consume.
pub fn next_offsets_as_tpl(
    next_offsets: &HashMap<TopicPartition, i64>,
) -> anyhow::Result<TopicPartitionList> {
    let mut tpl = TopicPartitionList::new();
    for (topic_partition, next_offset) in next_offsets {
        tpl.add_partition_offset(
            &topic_partition.topic,
            topic_partition.partition,
            Offset::Offset(*next_offset),
        )
        .with_context(|| format!("Invalid next offset `{next_offset}` for `{topic_partition}`."))?;
    }
    Ok(tpl)
}

/// The input consumer: a poll thread forwards records and rebalance events to
/// the processing loop over bounded channels.
pub struct RuntimeConsumer {
    consumer: Arc<BaseConsumer<RuntimeConsumerContext>>,
    events_rx: flume::Receiver<RebalanceEvent>,
    messages_rx: flume::Receiver<KafkaMessage>,
    shutdown: Arc<AtomicBool>,
    poll_thread: Option<JoinHandle<()>>,
}

impl RuntimeConsumer {
    pub fn from_config(config: &WeirConfig, topics: &[String]) -> anyhow::Result<RuntimeConsumer> {
        let shutdown = Arc::new(AtomicBool::new(false));
        let (events_tx, events_rx) = flume::bounded(2);
        let mut client_config = ClientConfig::new();
        client_config
            .set("bootstrap.servers", &config.bootstrap_servers)
            .set("group.id", &config.consumer_group)
            // Offsets are committed by the checkpoint coordinator, never by
            // librdkafka.
            .set("enable.auto.commit", "false")
            .set("enable.partition.eof", "false")
            // Incremental rebalancing: a rebalance revokes only the
            // partitions that actually move, so the survivors keep
            // processing and the revoke checkpoint stays partial.
            .set("partition.assignment.strategy", "cooperative-sticky")
            .set("auto.offset.reset", config.auto_offset_reset.as_kafka_param());
        if config.exactly_once() {
            client_config.set("isolation.level", "read_committed");
        }
        for (key, value) in &config.consumer_extra_config {
            client_config.set(key, value);
        }
        let consumer: BaseConsumer<RuntimeConsumerContext> = client_config
            .create_with_context(RuntimeConsumerContext {
                rebalance_events: events_tx,
                shutdown: shutdown.clone(),
            })
            .context("Failed to create Kafka consumer.")?;
        let consumer = Arc::new(consumer);

        let topic_refs: Vec<&str> = topics.iter().map(String::as_str).collect();
        consumer
            .subscribe(&topic_refs)
            .with_context(|| format!("Failed to subscribe to topics `{}`.", topics.join(", ")))?;

        let (messages_tx, messages_rx) = flume::bounded(MESSAGE_CHANNEL_CAPACITY);
        let poll_thread = std::thread::Builder::new()
            .name("weir-consumer-poll".to_string())
            .spawn({
                let consumer = consumer.clone();
                let shutdown = shutdown.clone();
                move || {
                    'poll: while !shutdown.load(Ordering::Relaxed) {
                        let message = match consumer.poll(POLL_TIMEOUT) {
                            Some(Ok(message)) => KafkaMessage::Record(consumed_record_from(&message)),
                            Some(Err(kafka_error)) => KafkaMessage::Error(kafka_error),
                            None => continue,
                        };
                        // A full channel is back-pressure from the loop; keep
                        // watching the shutdown flag while waiting for room.
                        let mut pending = message;
                        loop {
                            match messages_tx.send_timeout(pending, POLL_TIMEOUT) {
                                Ok(()) => break,
                                Err(flume::SendTimeoutError::Timeout(message)) => {
                                    if shutdown.load(Ordering::Relaxed) {
                                        break 'poll;
                                    }
                                    pending = message;
                                }
                                Err(flume::SendTimeoutError::Disconnected(_)) => break 'poll,
                            }
                        }
                    }
                    debug!("Consumer poll thread exiting.");
                }
            })
            .context("Failed to spawn consumer poll thread.")?;

        Ok(RuntimeConsumer {
            consumer,
            events_rx,
            messages_rx,
            shutdown,
            poll_thread: Some(poll_thread),
        })
    }

    pub fn events(&self) -> &flume::Receiver<RebalanceEvent> {
        &self.events_rx
    }

    pub fn messages(&self) -> &flume::Receiver<KafkaMessage> {
        &self.messages_rx
    }

    /// Synchronously commits the given next offsets to the group coordinator.
    pub fn commit_offsets(
        &self,
        next_offsets: &HashMap<TopicPartition, i64>,
    ) -> anyhow::Result<()> {
        let tpl = next_offsets_as_tpl(next_offsets)?;
        self.consumer
            .commit(&tpl, CommitMode::Sync)
            .context("Failed to commit consumer offsets.")?;
        Ok(())
    }

    pub fn group_metadata(&self) -> Option<ConsumerGroupMetadata> {
        self.consumer.group_metadata()
    }

    /// Stops the poll thread. Dropping the consumer afterwards leaves the
    /// group, triggering on-revoke on the remaining members.
    pub fn shutdown(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(poll_thread) = self.poll_thread.take() {
            while !poll_thread.is_finished() {
                // The poll thread may be blocked inside a rebalance callback
                // waiting for an ack the loop will never deliver; ack on its
                // behalf and keep the channels draining.
                while let Ok(event) = self.events_rx.try_recv() {
                    match event {
                        RebalanceEvent::Assigned { ack_tx, .. }
                        | RebalanceEvent::Revoked { ack_tx, .. } => {
                            let _ = ack_tx.send(());
                        }
                        RebalanceEvent::Lost => {}
                    }
                }
                while self.messages_rx.try_recv().is_ok() {}
                std::thread::sleep(Duration::from_millis(10));
            }
            let _ = poll_thread.join();
        }
    }
}

impl Drop for RuntimeConsumer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_next_offsets_as_tpl() {
        let next_offsets: HashMap<TopicPartition, i64> = [
            (TopicPartition::new("words", 0), 3),
            (TopicPartition::new("words", 1), 12),
        ]
        .into_iter()
        .collect();
        let tpl = next_offsets_as_tpl(&next_offsets).unwrap();
        assert_eq!(tpl.count(), 2);
        let element = tpl.find_partition("words", 1).unwrap();
        assert_eq!(element.offset(), Offset::Offset(12));
    }

    #[test]
    fn test_negative_next_offset_is_rejected() {
        let next_offsets: HashMap<TopicPartition, i64> =
            [(TopicPartition::new("words", 0), -3)].into_iter().collect();
        next_offsets_as_tpl(&next_offsets).unwrap_err();
    }
}
