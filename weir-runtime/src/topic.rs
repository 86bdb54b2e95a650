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
use std::sync::{Arc, RwLock};
use std::time::Duration;

use anyhow::{bail, Context};
use futures::executor::block_on;
use itertools::Itertools;
use rdkafka::admin::{AdminClient, AdminOptions, NewTopic, ResourceSpecifier, TopicReplication};
use rdkafka::client::DefaultClientContext;
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::ClientConfig;
use tracing::{debug, info};
use weir_common::retry::{retry_with_backoff, RetryError};
use weir_config::WeirConfig;

use crate::model::RowValue;
use crate::serialize::SerializationFormat;

/// Extracts the event timestamp from a deserialized value; falls back to the
/// broker record timestamp passed as the second argument.
pub type TimestampExtractor = Arc<dyn Fn(&RowValue, i64) -> i64 + Send + Sync>;

/// Desired or observed shape of a topic on the broker. Compared by value.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TopicConfig {
    pub num_partitions: i32,
    pub replication_factor: i32,
    pub extra_config: BTreeMap<String, String>,
}

/// A logical topic: its name, how to create it (absent for externally managed
/// topics), what the broker reports about it, and how to (de)serialize its
/// records.
#[derive(Clone)]
pub struct Topic {
    pub name: String,
    pub create_config: Option<TopicConfig>,
    pub broker_config: Option<TopicConfig>,
    pub key_format: SerializationFormat,
    pub value_format: SerializationFormat,
    pub timestamp_extractor: Option<TimestampExtractor>,
}

impl Topic {
    /// An externally managed input topic.
    pub fn input(name: &str, value_format: SerializationFormat) -> Topic {
        Topic {
            name: name.to_string(),
            create_config: None,
            broker_config: None,
            key_format: SerializationFormat::Bytes,
            value_format,
            timestamp_extractor: None,
        }
    }

    pub fn with_key_format(mut self, key_format: SerializationFormat) -> Topic {
        self.key_format = key_format;
        self
    }

    pub fn with_timestamp_extractor(mut self, extractor: TimestampExtractor) -> Topic {
        self.timestamp_extractor = Some(extractor);
        self
    }

    pub fn extract_timestamp(&self, value: &RowValue, broker_timestamp_ms: i64) -> i64 {
        match &self.timestamp_extractor {
            Some(extractor) => extractor(value, broker_timestamp_ms),
            None => broker_timestamp_ms,
        }
    }

    /// Partition count, preferring what the broker reports over the create
    /// config.
    pub fn num_partitions(&self) -> Option<i32> {
        self.broker_config
            .as_ref()
            .or(self.create_config.as_ref())
            .map(|config| config.num_partitions)
    }
}

impl std::fmt::Debug for Topic {
    fn fmt(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
        formatter
            .debug_struct("Topic")
            .field("name", &self.name)
            .field("create_config", &self.create_config)
            .field("broker_config", &self.broker_config)
            .finish()
    }
}

pub fn changelog_topic_name(consumer_group: &str, source_topic: &str, store_name: &str) -> String {
    format!("changelog__{consumer_group}--{source_topic}--{store_name}")
}

pub fn repartition_topic_name(consumer_group: &str, source_topic: &str, operation: &str) -> String {
    format!("repartition__{consumer_group}--{source_topic}--{operation}")
}

/// Canonical source of all topics of one application instance, input and
/// derived. Holds topics by name; nothing holds the manager.
pub struct TopicManager {
    admin_client: AdminClient<DefaultClientContext>,
    consumer_group: String,
    replication_factor: i32,
    repartition_retention_ms: i64,
    topics: RwLock<BTreeMap<String, Topic>>,
    /// changelog topic name -> source topic name, for partition-count
    /// validation.
    changelog_sources: RwLock<BTreeMap<String, String>>,
}

impl TopicManager {
    pub fn from_config(config: &WeirConfig) -> anyhow::Result<TopicManager> {
        let admin_client = ClientConfig::new()
            .set("bootstrap.servers", &config.bootstrap_servers)
            .create()
            .context("Failed to create Kafka admin client.")?;
        Ok(TopicManager {
            admin_client,
            consumer_group: config.consumer_group.clone(),
            replication_factor: config.replication_factor,
            repartition_retention_ms: config.repartition_retention_ms,
            topics: RwLock::new(BTreeMap::new()),
            changelog_sources: RwLock::new(BTreeMap::new()),
        })
    }

    pub fn register_topic(&self, topic: Topic) {
        self.topics
            .write()
            .unwrap()
            .insert(topic.name.clone(), topic);
    }

    pub fn get_topic(&self, name: &str) -> Option<Topic> {
        self.topics.read().unwrap().get(name).cloned()
    }

    pub fn topic_names(&self) -> Vec<String> {
        self.topics.read().unwrap().keys().cloned().collect()
    }

    /// Derives (and registers) the changelog topic replicating `store_name`
    /// over `source_topic`: compacted, unbounded retention, one partition per
    /// source partition. Idempotent.
    pub fn changelog_topic(&self, source_topic: &str, store_name: &str) -> anyhow::Result<Topic> {
        let name = changelog_topic_name(&self.consumer_group, source_topic, store_name);
        if let Some(topic) = self.get_topic(&name) {
            return Ok(topic);
        }
        let num_partitions = self
            .get_topic(source_topic)
            .with_context(|| format!("Source topic `{source_topic}` is not registered."))?
            .num_partitions()
            .with_context(|| {
                format!(
                    "Partition count of source topic `{source_topic}` is unknown: inspect broker \
                     configs before deriving changelog topics."
                )
            })?;
        let extra_config: BTreeMap<String, String> = [
            ("cleanup.policy", "compact"),
            ("min.compaction.lag.ms", "0"),
            // Compaction must be the only thing that drops live keys.
            ("retention.ms", "-1"),
            ("retention.bytes", "-1"),
        ]
        .into_iter()
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .collect();
        let topic = Topic {
            name: name.clone(),
            create_config: Some(TopicConfig {
                num_partitions,
                replication_factor: self.replication_factor,
                extra_config,
            }),
            broker_config: None,
            key_format: SerializationFormat::Bytes,
            value_format: SerializationFormat::Bytes,
            timestamp_extractor: None,
        };
        self.register_topic(topic.clone());
        self.changelog_sources
            .write()
            .unwrap()
            .insert(name, source_topic.to_string());
        Ok(topic)
    }

    /// Derives (and registers) the repartition topic for `operation` over
    /// `source_topic`: delete cleanup, bounded retention, one partition per
    /// source partition. Idempotent.
    pub fn repartition_topic(
        &self,
        source_topic: &str,
        operation: &str,
        value_format: SerializationFormat,
    ) -> anyhow::Result<Topic> {
        let name = repartition_topic_name(&self.consumer_group, source_topic, operation);
        if let Some(topic) = self.get_topic(&name) {
            return Ok(topic);
        }
        let num_partitions = self
            .get_topic(source_topic)
            .with_context(|| format!("Source topic `{source_topic}` is not registered."))?
            .num_partitions()
            .with_context(|| {
                format!(
                    "Partition count of source topic `{source_topic}` is unknown: inspect broker \
                     configs before deriving repartition topics."
                )
            })?;
        let extra_config: BTreeMap<String, String> = [
            ("cleanup.policy".to_string(), "delete".to_string()),
            (
                "retention.ms".to_string(),
                self.repartition_retention_ms.to_string(),
            ),
        ]
        .into_iter()
        .collect();
        let topic = Topic {
            name,
            create_config: Some(TopicConfig {
                num_partitions,
                replication_factor: self.replication_factor,
                extra_config,
            }),
            broker_config: None,
            key_format: SerializationFormat::Bytes,
            value_format,
            timestamp_extractor: None,
        };
        self.register_topic(topic.clone());
        Ok(topic)
    }

    /// Creates every registered topic that carries a create config. A topic
    /// that already exists is a success; any other creation failure is fatal.
    pub fn ensure_topics_created(&self, timeout: Duration) -> anyhow::Result<()> {
        let new_topics: Vec<(String, TopicConfig)> = {
            let topics = self.topics.read().unwrap();
            topics
                .values()
                .filter_map(|topic| {
                    topic
                        .create_config
                        .clone()
                        .map(|config| (topic.name.clone(), config))
                })
                .collect()
        };
        if new_topics.is_empty() {
            return Ok(());
        }
        let requests: Vec<NewTopic> = new_topics
            .iter()
            .map(|(name, config)| {
                let mut request = NewTopic::new(
                    name,
                    config.num_partitions,
                    TopicReplication::Fixed(config.replication_factor),
                );
                for (key, value) in &config.extra_config {
                    request = request.set(key, value);
                }
                request
            })
            .collect();
        let admin_options = AdminOptions::new().operation_timeout(Some(timeout.into()));
        let results = block_on(self.admin_client.create_topics(&requests, &admin_options))
            .context("Failed to send topic creation request.")?;
        for result in results {
            match result {
                Ok(topic) => info!(topic = %topic, "Created topic."),
                Err((topic, RDKafkaErrorCode::TopicAlreadyExists)) => {
                    debug!(topic = %topic, "Topic already exists.");
                }
                Err((topic, error_code)) => {
                    bail!("Failed to create topic `{topic}`: {error_code}.");
                }
            }
        }
        Ok(())
    }

    /// Inspects the broker and fills in `broker_config` for every registered
    /// topic present on the cluster. Metadata timeouts are retried before
    /// surfacing.
    pub fn fetch_broker_configs(&self, timeout: Duration) -> anyhow::Result<()> {
        for name in self.topic_names() {
            let metadata_config = self.fetch_topic_config(&name, timeout)?;
            if let Some(config) = metadata_config {
                let mut topics = self.topics.write().unwrap();
                if let Some(topic) = topics.get_mut(&name) {
                    topic.broker_config = Some(config);
                }
            }
        }
        Ok(())
    }

    fn fetch_topic_config(
        &self,
        name: &str,
        timeout: Duration,
    ) -> anyhow::Result<Option<TopicConfig>> {
        let metadata = retry_with_backoff("fetch-metadata", timeout * 3, || {
            self.admin_client
                .inner()
                .fetch_metadata(Some(name), timeout)
                .map_err(|error| match error {
                    KafkaError::MetadataFetch(RDKafkaErrorCode::OperationTimedOut) => {
                        RetryError::transient(error)
                    }
                    error => RetryError::permanent(error),
                })
        })
        .with_context(|| format!("Failed to fetch metadata for topic `{name}`."))?;
        let Some(topic_metadata) = metadata
            .topics()
            .iter()
            .find(|topic_metadata| topic_metadata.name() == name)
        else {
            return Ok(None);
        };
        if topic_metadata.error().is_some() || topic_metadata.partitions().is_empty() {
            return Ok(None);
        }
        let num_partitions = topic_metadata.partitions().len() as i32;
        let replication_factor = topic_metadata.partitions()[0].replicas().len() as i32;

        let admin_options = AdminOptions::new().request_timeout(Some(timeout.into()));
        let resources = block_on(
            self.admin_client
                .describe_configs(&[ResourceSpecifier::Topic(name)], &admin_options),
        )
        .with_context(|| format!("Failed to describe configs of topic `{name}`."))?;
        let mut extra_config = BTreeMap::new();
        for resource in resources {
            let resource =
                resource.with_context(|| format!("Failed to describe configs of topic `{name}`."))?;
            for entry in resource.entries {
                if let Some(value) = entry.value {
                    extra_config.insert(entry.name, value);
                }
            }
        }
        Ok(Some(TopicConfig {
            num_partitions,
            replication_factor,
            extra_config,
        }))
    }

    /// Checks every registered topic against the broker view. All violations
    /// are collected and raised as a single aggregated failure.
    pub fn validate_all(&self) -> anyhow::Result<()> {
        let topics = self.topics.read().unwrap();
        let changelog_sources = self.changelog_sources.read().unwrap();
        let mut violations: Vec<String> = Vec::new();

        for topic in topics.values() {
            let Some(broker_config) = &topic.broker_config else {
                violations.push(format!("Topic `{}` was not found on the broker.", topic.name));
                continue;
            };
            let Some(source_name) = changelog_sources.get(&topic.name) else {
                continue;
            };
            let cleanup_policy = broker_config
                .extra_config
                .get("cleanup.policy")
                .map(String::as_str)
                .unwrap_or("");
            if !cleanup_policy.contains("compact") {
                violations.push(format!(
                    "Changelog topic `{}` must be compacted, got `cleanup.policy={}`.",
                    topic.name, cleanup_policy
                ));
            }
            let source_num_partitions = topics
                .get(source_name)
                .and_then(|source| source.num_partitions());
            if source_num_partitions != Some(broker_config.num_partitions) {
                violations.push(format!(
                    "Changelog topic `{}` has {} partitions, its source `{}` has {:?}.",
                    topic.name, broker_config.num_partitions, source_name, source_num_partitions
                ));
            }
        }
        if !violations.is_empty() {
            bail!(
                "Topic validation failed:\n{}",
                violations
                    .iter()
                    .map(|violation| format!("- {violation}"))
                    .join("\n")
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager_for_test() -> TopicManager {
        let mut config = WeirConfig::for_test();
        config.consumer_group = "g1".to_string();
        TopicManager::from_config(&config).unwrap()
    }

    fn input_with_broker_config(name: &str, num_partitions: i32) -> Topic {
        let mut topic = Topic::input(name, SerializationFormat::json());
        topic.broker_config = Some(TopicConfig {
            num_partitions,
            replication_factor: 1,
            extra_config: BTreeMap::new(),
        });
        topic
    }

    #[test]
    fn test_derived_topic_names() {
        assert_eq!(
            changelog_topic_name("g1", "words", "counts"),
            "changelog__g1--words--counts"
        );
        assert_eq!(
            repartition_topic_name("g1", "words", "group-by-word"),
            "repartition__g1--words--group-by-word"
        );
    }

    #[test]
    fn test_changelog_topic_derivation() {
        let manager = manager_for_test();
        manager.register_topic(input_with_broker_config("words", 3));

        let changelog = manager.changelog_topic("words", "counts").unwrap();
        assert_eq!(changelog.name, "changelog__g1--words--counts");
        let create_config = changelog.create_config.unwrap();
        assert_eq!(create_config.num_partitions, 3);
        assert_eq!(
            create_config.extra_config.get("cleanup.policy").unwrap(),
            "compact"
        );
        assert_eq!(create_config.extra_config.get("retention.ms").unwrap(), "-1");
        assert_eq!(
            create_config.extra_config.get("retention.bytes").unwrap(),
            "-1"
        );

        // Deriving twice yields the same registered topic.
        let again = manager.changelog_topic("words", "counts").unwrap();
        assert_eq!(again.name, changelog.name);
    }

    #[test]
    fn test_changelog_requires_known_partition_count() {
        let manager = manager_for_test();
        manager.register_topic(Topic::input("words", SerializationFormat::json()));
        let error = manager.changelog_topic("words", "counts").unwrap_err();
        assert!(error.to_string().contains("unknown"));
    }

    #[test]
    fn test_repartition_topic_derivation() {
        let manager = manager_for_test();
        manager.register_topic(input_with_broker_config("words", 2));
        let repartition = manager
            .repartition_topic("words", "group-by-word", SerializationFormat::json())
            .unwrap();
        let create_config = repartition.create_config.unwrap();
        assert_eq!(create_config.num_partitions, 2);
        assert_eq!(
            create_config.extra_config.get("cleanup.policy").unwrap(),
            "delete"
        );
        assert_eq!(
            create_config.extra_config.get("retention.ms").unwrap(),
            "604800000"
        );
    }

    #[test]
    fn test_validate_all_aggregates_violations() {
        let manager = manager_for_test();
        manager.register_topic(input_with_broker_config("words", 2));
        manager.changelog_topic("words", "counts").unwrap();

        // The changelog "exists" on the broker with the wrong partition count
        // and no compaction.
        {
            let mut topics = manager.topics.write().unwrap();
            let changelog = topics.get_mut("changelog__g1--words--counts").unwrap();
            changelog.broker_config = Some(TopicConfig {
                num_partitions: 1,
                replication_factor: 1,
                extra_config: [("cleanup.policy".to_string(), "delete".to_string())]
                    .into_iter()
                    .collect(),
            });
        }
        let error = manager.validate_all().unwrap_err();
        let message = error.to_string();
        assert!(message.contains("must be compacted"));
        assert!(message.contains("has 1 partitions"));

        // An unknown topic is a third violation.
        manager.register_topic(Topic::input("missing", SerializationFormat::json()));
        let message = manager.validate_all().unwrap_err().to_string();
        assert!(message.contains("`missing` was not found"));
    }
}
