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

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context};
use rdkafka::consumer::{BaseConsumer, Consumer, DefaultConsumerContext};
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::message::{Headers, Message};
use rdkafka::{ClientConfig, Offset, TopicPartitionList};
use tracing::{debug, info};
use weir_common::new_coolid;
use weir_common::retry::{retry_with_backoff, RetryError};
use weir_config::WeirConfig;
use weir_state::{KeyPrefix, StorePartition, PREFIX_HEADER};

const WATERMARK_FETCH_TIMEOUT: Duration = Duration::from_secs(10);
const RECOVERY_POLL_TIMEOUT: Duration = Duration::from_millis(500);
/// How long recovery tolerates making no progress before declaring the
/// high-watermark unreachable.
const RECOVERY_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Replays changelog tails into local store partitions on assignment.
///
/// Each recovery uses its own short-lived consumer with a throwaway group id,
/// assigned (not subscribed) to the single changelog partition, so it never
/// interferes with the input consumer group.
pub struct RecoveryManager {
    bootstrap_servers: String,
    read_committed: bool,
}

impl RecoveryManager {
    pub fn from_config(config: &WeirConfig) -> RecoveryManager {
        RecoveryManager {
            bootstrap_servers: config.bootstrap_servers.clone(),
            read_committed: config.exactly_once(),
        }
    }

    /// Brings `store` up to date with its changelog partition: replays every
    /// record in `(processed_offset, high_watermark)`, then persists the new
    /// watermark. A store without a changelog topic recovers trivially.
    pub fn recover_store_partition(&self, store: &Arc<StorePartition>) -> anyhow::Result<()> {
        let Some(changelog_topic) = store.changelog_topic().map(str::to_string) else {
            return Ok(());
        };
        let partition = store.partition();
        let consumer = self.create_recovery_consumer()?;

        let (low_watermark, high_watermark) =
            retry_with_backoff("fetch-watermarks", WATERMARK_FETCH_TIMEOUT * 3, || {
                consumer
                    .fetch_watermarks(&changelog_topic, partition, WATERMARK_FETCH_TIMEOUT)
                    .map_err(|error| match error {
                        KafkaError::MetadataFetch(RDKafkaErrorCode::OperationTimedOut) => {
                            RetryError::transient(error)
                        }
                        error => RetryError::permanent(error),
                    })
            })
            .with_context(|| {
                format!("Failed to fetch watermarks of `{changelog_topic}-{partition}`.")
            })?;

        let processed_offset = store.processed_offset();
        if processed_offset + 1 >= high_watermark {
            debug!(
                store_name = store.store_name(),
                partition = partition,
                processed_offset = processed_offset,
                high_watermark = high_watermark,
                "Store is up to date with its changelog, skipping recovery."
            );
            return Ok(());
        }
        let start_offset = (processed_offset + 1).max(low_watermark);
        info!(
            store_name = store.store_name(),
            partition = partition,
            start_offset = start_offset,
            high_watermark = high_watermark,
            "Recovering store partition from changelog."
        );

        let mut assignment = TopicPartitionList::new();
        assignment
            .add_partition_offset(&changelog_topic, partition, Offset::Offset(start_offset))
            .context("Invalid recovery start offset.")?;
        consumer
            .assign(&assignment)
            .context("Failed to assign recovery consumer.")?;

        let mut num_records_applied = 0u64;
        let mut last_progress_at = Instant::now();
        loop {
            match consumer.poll(RECOVERY_POLL_TIMEOUT) {
                Some(Ok(message)) => {
                    let prefix = prefix_of(&message);
                    let key = message.key().unwrap_or_default();
                    store.apply_changelog(prefix, key, message.payload())?;
                    num_records_applied += 1;
                    last_progress_at = Instant::now();
                    if message.offset() >= high_watermark - 1 {
                        break;
                    }
                }
                Some(Err(kafka_error)) => {
                    return Err(kafka_error).with_context(|| {
                        format!("Changelog read failed on `{changelog_topic}-{partition}`.")
                    });
                }
                None => {
                    // With read_committed, trailing aborted batches are
                    // invisible but still advance the position past them.
                    if self.position_of(&consumer, &changelog_topic, partition)? >= high_watermark {
                        break;
                    }
                    if last_progress_at.elapsed() > RECOVERY_IDLE_TIMEOUT {
                        bail!(
                            "Recovery of `{changelog_topic}-{partition}` stalled before reaching \
                             the high-watermark `{high_watermark}`."
                        );
                    }
                }
            }
        }
        store.set_processed_offset(high_watermark - 1)?;
        info!(
            store_name = store.store_name(),
            partition = partition,
            num_records_applied = num_records_applied,
            processed_offset = high_watermark - 1,
            "Store partition recovered."
        );
        Ok(())
    }

    fn create_recovery_consumer(&self) -> anyhow::Result<BaseConsumer<DefaultConsumerContext>> {
        let mut client_config = ClientConfig::new();
        client_config
            .set("bootstrap.servers", &self.bootstrap_servers)
            .set("group.id", new_coolid("weir-recovery"))
            .set("enable.auto.commit", "false")
            .set("enable.partition.eof", "false");
        if self.read_committed {
            client_config.set("isolation.level", "read_committed");
        }
        client_config
            .create()
            .context("Failed to create recovery consumer.")
    }

    fn position_of(
        &self,
        consumer: &BaseConsumer<DefaultConsumerContext>,
        topic: &str,
        partition: i32,
    ) -> anyhow::Result<i64> {
        let position = consumer
            .position()
            .context("Failed to read recovery consumer position.")?;
        let offset = position
            .find_partition(topic, partition)
            .map(|element| element.offset())
            .unwrap_or(Offset::Invalid);
        match offset {
            Offset::Offset(offset) => Ok(offset),
            _ => Ok(-1),
        }
    }
}

fn prefix_of(message: &rdkafka::message::BorrowedMessage) -> KeyPrefix {
    if let Some(headers) = message.headers() {
        for idx in 0..headers.count() {
            if let Some((name, value)) = headers.get(idx) {
                if name == PREFIX_HEADER && value.len() == 1 {
                    return KeyPrefix(value[0]);
                }
            }
        }
    }
    KeyPrefix::VALUES
}
