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

use std::collections::VecDeque;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TopicPartition {
    pub topic: String,
    pub partition: i32,
}

impl TopicPartition {
    pub fn new(topic: &str, partition: i32) -> TopicPartition {
        TopicPartition {
            topic: topic.to_string(),
            partition,
        }
    }
}

impl fmt::Display for TopicPartition {
    fn fmt(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        write!(formatter, "{}-{}", self.topic, self.partition)
    }
}

/// Tagged record payload. The variant is decided by the topic's
/// serialization format; pipelines match on it or use the accessors.
#[derive(Debug, Clone, PartialEq)]
pub enum RowValue {
    Bytes(Vec<u8>),
    Text(String),
    Json(serde_json::Value),
}

impl RowValue {
    pub fn as_json(&self) -> Option<&serde_json::Value> {
        match self {
            RowValue::Json(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            RowValue::Text(text) => Some(text),
            RowValue::Json(serde_json::Value::String(text)) => Some(text),
            _ => None,
        }
    }
}

/// A deserialized message, immutable from the pipeline's perspective:
/// transforms yield new rows rather than mutating their input.
#[derive(Debug, Clone)]
pub struct Row {
    pub value: RowValue,
    pub key: Option<Vec<u8>>,
    pub headers: Vec<(String, Vec<u8>)>,
    pub timestamp_ms: i64,
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
}

impl Row {
    pub fn topic_partition(&self) -> TopicPartition {
        TopicPartition::new(&self.topic, self.partition)
    }
}

/// A raw record handed over by the consumer poll thread, not yet
/// deserialized.
#[derive(Debug, Clone)]
pub struct ConsumedRecord {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub timestamp_ms: Option<i64>,
    pub key: Option<Vec<u8>>,
    pub payload: Option<Vec<u8>>,
    pub headers: Vec<(String, Vec<u8>)>,
}

impl ConsumedRecord {
    pub fn topic_partition(&self) -> TopicPartition {
        TopicPartition::new(&self.topic, self.partition)
    }
}

/// Loop-side view of one assigned input partition.
#[derive(Debug)]
pub struct PartitionState {
    pub topic_partition: TopicPartition,
    /// Offset of the next record to process; `-1` until the first record.
    pub next_offset: i64,
    /// Max record timestamp seen so far, in epoch milliseconds.
    pub watermark_ms: i64,
    /// While paused, records are withheld from the pipeline and parked in
    /// `buffered` instead.
    pub paused: bool,
    pub buffered: VecDeque<ConsumedRecord>,
}

impl PartitionState {
    pub fn new(topic_partition: TopicPartition) -> PartitionState {
        PartitionState {
            topic_partition,
            next_offset: -1,
            watermark_ms: i64::MIN,
            paused: false,
            buffered: VecDeque::new(),
        }
    }

    /// Records the successful processing of the record at `offset`.
    pub fn advance(&mut self, offset: i64, timestamp_ms: i64) {
        debug_assert!(
            offset + 1 > self.next_offset,
            "pipeline invocations must be offset-monotone"
        );
        self.next_offset = offset + 1;
        if timestamp_ms > self.watermark_ms {
            self.watermark_ms = timestamp_ms;
        }
    }
}
