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
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context};
use json_comments::StripComments;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::validate_identifier;

const DEFAULT_STATE_DIR_PATH: &str = "./weirdata";

/// Initial consume position when the consumer group has no committed offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AutoOffsetReset {
    Earliest,
    Latest,
}

impl AutoOffsetReset {
    /// The value librdkafka expects for `auto.offset.reset`.
    pub fn as_kafka_param(&self) -> &'static str {
        match self {
            AutoOffsetReset::Earliest => "earliest",
            AutoOffsetReset::Latest => "latest",
        }
    }
}

/// Delivery guarantee of the processing loop.
///
/// `ExactlyOnce` enlists produced output and input offsets in a Kafka
/// transaction; `AtLeastOnce` uses plain synchronous offset commits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProcessingGuarantee {
    #[serde(rename = "at-least-once")]
    AtLeastOnce,
    #[serde(rename = "exactly-once")]
    ExactlyOnce,
}

fn default_application_id() -> String {
    "weir".to_string()
}

fn default_auto_offset_reset() -> AutoOffsetReset {
    AutoOffsetReset::Earliest
}

fn default_processing_guarantee() -> ProcessingGuarantee {
    ProcessingGuarantee::AtLeastOnce
}

fn default_commit_interval_secs() -> f64 {
    5.0
}

fn default_commit_every() -> u64 {
    100
}

fn default_flush_timeout_secs() -> f64 {
    60.0
}

fn default_use_changelog_topics() -> bool {
    true
}

fn default_replication_factor() -> i32 {
    // -1 asks the broker for its default replication factor.
    -1
}

fn default_repartition_retention_ms() -> i64 {
    // 7 days.
    604_800_000
}

fn default_state_dir_path() -> PathBuf {
    PathBuf::from(DEFAULT_STATE_DIR_PATH)
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct WeirConfig {
    /// Kafka group id, and the suffix of every derived (changelog,
    /// repartition) topic name.
    pub consumer_group: String,
    pub bootstrap_servers: String,
    #[serde(default = "default_application_id")]
    pub application_id: String,
    #[serde(default = "default_auto_offset_reset")]
    pub auto_offset_reset: AutoOffsetReset,
    #[serde(default = "default_processing_guarantee")]
    pub processing_guarantee: ProcessingGuarantee,
    /// Max wall-time between checkpoints, in seconds.
    #[serde(default = "default_commit_interval_secs")]
    pub commit_interval_secs: f64,
    /// Max number of processed records between checkpoints. `0` disables the
    /// count trigger.
    #[serde(default = "default_commit_every")]
    pub commit_every: u64,
    /// Budget for draining in-flight produced messages at checkpoint time.
    #[serde(default = "default_flush_timeout_secs")]
    pub flush_timeout_secs: f64,
    /// When false, state lives only in the local store: nothing is replicated
    /// and state is discarded (best effort) whenever a partition is revoked.
    #[serde(default = "default_use_changelog_topics")]
    pub use_changelog_topics: bool,
    /// Replication factor for derived topics. `-1` defers to the broker.
    #[serde(default = "default_replication_factor")]
    pub replication_factor: i32,
    #[serde(default = "default_repartition_retention_ms")]
    pub repartition_retention_ms: i64,
    #[serde(default = "default_state_dir_path")]
    #[serde(rename = "state_dir")]
    pub state_dir_path: PathBuf,
    /// Raw librdkafka tunables merged into the consumer config.
    #[serde(default)]
    pub consumer_extra_config: BTreeMap<String, String>,
    /// Raw librdkafka tunables merged into the producer config.
    #[serde(default)]
    pub producer_extra_config: BTreeMap<String, String>,
}

impl WeirConfig {
    /// Parses and validates a [`WeirConfig`] from a config file, dispatching
    /// on the file extension.
    pub fn load(path: &Path) -> anyhow::Result<WeirConfig> {
        let config_content = std::fs::read(path)
            .with_context(|| format!("Failed to read config file `{}`.", path.display()))?;
        let parser_fn = match path.extension().and_then(|extension| extension.to_str()) {
            Some("json") => Self::from_json,
            Some("toml") => Self::from_toml,
            Some("yaml") | Some("yml") => Self::from_yaml,
            Some(extension) => bail!(
                "Failed to read weir config file `{}`: file extension `.{}` is not supported. \
                 Supported file formats and extensions are JSON (.json), TOML (.toml), and YAML \
                 (.yaml or .yml).",
                path.display(),
                extension
            ),
            None => bail!(
                "Failed to read weir config file `{}`: file extension is missing. Supported file \
                 formats and extensions are JSON (.json), TOML (.toml), and YAML (.yaml or .yml).",
                path.display()
            ),
        };
        let config = parser_fn(&config_content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json(bytes: &[u8]) -> anyhow::Result<WeirConfig> {
        let mut json_file_without_comments = String::new();
        StripComments::new(bytes).read_to_string(&mut json_file_without_comments)?;
        serde_json::from_str::<WeirConfig>(&json_file_without_comments)
            .context("Failed to parse JSON weir config file.")
    }

    pub fn from_toml(bytes: &[u8]) -> anyhow::Result<WeirConfig> {
        toml::from_slice::<WeirConfig>(bytes).context("Failed to parse TOML weir config file.")
    }

    pub fn from_yaml(bytes: &[u8]) -> anyhow::Result<WeirConfig> {
        serde_yaml::from_slice::<WeirConfig>(bytes)
            .context("Failed to parse YAML weir config file.")
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        validate_identifier("Consumer group", &self.consumer_group)?;
        validate_identifier("Application ID", &self.application_id)?;
        if self.bootstrap_servers.is_empty() {
            bail!("`bootstrap_servers` must not be empty.");
        }
        if self.commit_interval_secs <= 0.0 {
            bail!(
                "`commit_interval_secs` must be positive, got `{}`.",
                self.commit_interval_secs
            );
        }
        if self.flush_timeout_secs <= 0.0 {
            bail!(
                "`flush_timeout_secs` must be positive, got `{}`.",
                self.flush_timeout_secs
            );
        }
        if self.commit_every == 0 {
            warn!("`commit_every` is 0: checkpoints are only triggered by the commit interval.");
        }
        if let Some(overridden) = self.consumer_extra_config.get("enable.auto.commit") {
            bail!(
                "`consumer_extra_config` must not set `enable.auto.commit` (got `{}`): offsets \
                 are committed by the checkpoint coordinator.",
                overridden
            );
        }
        Ok(())
    }

    pub fn commit_interval(&self) -> Duration {
        Duration::from_secs_f64(self.commit_interval_secs)
    }

    pub fn flush_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.flush_timeout_secs)
    }

    pub fn exactly_once(&self) -> bool {
        self.processing_guarantee == ProcessingGuarantee::ExactlyOnce
    }

    #[doc(hidden)]
    pub fn for_test() -> WeirConfig {
        WeirConfig {
            consumer_group: "weir-test".to_string(),
            bootstrap_servers: "localhost:9092".to_string(),
            application_id: default_application_id(),
            auto_offset_reset: AutoOffsetReset::Earliest,
            processing_guarantee: ProcessingGuarantee::AtLeastOnce,
            commit_interval_secs: 0.2,
            commit_every: 10,
            flush_timeout_secs: 10.0,
            use_changelog_topics: true,
            replication_factor: 1,
            repartition_retention_ms: default_repartition_retention_ms(),
            state_dir_path: default_state_dir_path(),
            consumer_extra_config: BTreeMap::new(),
            producer_extra_config: BTreeMap::new(),
        }
    }
}
