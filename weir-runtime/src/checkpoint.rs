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
use std::time::{Duration, Instant};

use crate::model::TopicPartition;

/// The in-progress commit unit: which input offsets become durable at the
/// next commit, and how much has been processed since the last one.
///
/// The dirty store transactions belong to the loop, not the checkpoint; the
/// two are frozen together when the commit sequence starts.
#[derive(Debug)]
pub struct Checkpoint {
    created_at: Instant,
    next_offsets: HashMap<TopicPartition, i64>,
    num_processed_records: u64,
}

impl Default for Checkpoint {
    fn default() -> Checkpoint {
        Checkpoint::new()
    }
}

impl Checkpoint {
    pub fn new() -> Checkpoint {
        Checkpoint {
            created_at: Instant::now(),
            next_offsets: HashMap::new(),
            num_processed_records: 0,
        }
    }

    /// Records that everything below `next_offset` on `topic_partition` has
    /// been processed. Offsets never move backwards.
    pub fn track_next_offset(&mut self, topic_partition: TopicPartition, next_offset: i64) {
        let entry = self.next_offsets.entry(topic_partition).or_insert(next_offset);
        if next_offset > *entry {
            *entry = next_offset;
        }
    }

    pub fn record_processed(&mut self) {
        self.num_processed_records += 1;
    }

    pub fn next_offsets(&self) -> &HashMap<TopicPartition, i64> {
        &self.next_offsets
    }

    pub fn num_processed_records(&self) -> u64 {
        self.num_processed_records
    }

    /// True when committing would be a pure no-op.
    pub fn is_empty(&self) -> bool {
        self.next_offsets.is_empty()
    }

    pub fn elapsed(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Whether any commit trigger has fired. `commit_every == 0` disables the
    /// count trigger; the wall-time trigger only fires when there is
    /// something to commit.
    pub fn should_commit(
        &self,
        commit_interval: Duration,
        commit_every: u64,
        has_dirty_state: bool,
    ) -> bool {
        if self.is_empty() && !has_dirty_state {
            return false;
        }
        if commit_every > 0 && self.num_processed_records >= commit_every {
            return true;
        }
        self.elapsed() >= commit_interval
    }

    /// Freezes the current checkpoint and restarts the interval timer.
    pub fn take(&mut self) -> Checkpoint {
        std::mem::take(self)
    }

    /// Splits the offsets of `partitions` off into their own checkpoint,
    /// leaving everything else (and the interval timer) in place. Used for
    /// the partial commit on revocation.
    pub fn split_off(&mut self, partitions: &[TopicPartition]) -> Checkpoint {
        let mut split = Checkpoint::new();
        for topic_partition in partitions {
            if let Some(next_offset) = self.next_offsets.remove(topic_partition) {
                split.next_offsets.insert(topic_partition.clone(), next_offset);
            }
        }
        split
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_checkpoint_never_commits() {
        let checkpoint = Checkpoint::new();
        assert!(!checkpoint.should_commit(Duration::ZERO, 1, false));
        // Dirty state alone is enough once the interval elapsed.
        assert!(checkpoint.should_commit(Duration::ZERO, 1, true));
    }

    #[test]
    fn test_count_trigger() {
        let mut checkpoint = Checkpoint::new();
        checkpoint.track_next_offset(TopicPartition::new("words", 0), 1);
        checkpoint.record_processed();
        assert!(!checkpoint.should_commit(Duration::from_secs(3600), 2, false));
        checkpoint.record_processed();
        assert!(checkpoint.should_commit(Duration::from_secs(3600), 2, false));
        // commit_every == 0 disables the count trigger entirely.
        assert!(!checkpoint.should_commit(Duration::from_secs(3600), 0, false));
    }

    #[test]
    fn test_interval_trigger() {
        let mut checkpoint = Checkpoint::new();
        checkpoint.track_next_offset(TopicPartition::new("words", 0), 1);
        assert!(checkpoint.should_commit(Duration::ZERO, 100, false));
        assert!(!checkpoint.should_commit(Duration::from_secs(3600), 100, false));
    }

    #[test]
    fn test_offsets_are_monotone() {
        let mut checkpoint = Checkpoint::new();
        let topic_partition = TopicPartition::new("words", 0);
        checkpoint.track_next_offset(topic_partition.clone(), 8);
        checkpoint.track_next_offset(topic_partition.clone(), 3);
        assert_eq!(checkpoint.next_offsets()[&topic_partition], 8);
    }

    #[test]
    fn test_take_resets_the_checkpoint() {
        let mut checkpoint = Checkpoint::new();
        checkpoint.track_next_offset(TopicPartition::new("words", 0), 1);
        checkpoint.record_processed();
        let frozen = checkpoint.take();
        assert_eq!(frozen.num_processed_records(), 1);
        assert!(checkpoint.is_empty());
        assert_eq!(checkpoint.num_processed_records(), 0);
    }

    #[test]
    fn test_split_off_takes_only_the_given_partitions() {
        let mut checkpoint = Checkpoint::new();
        checkpoint.track_next_offset(TopicPartition::new("words", 0), 10);
        checkpoint.track_next_offset(TopicPartition::new("words", 1), 12);

        let split = checkpoint.split_off(&[TopicPartition::new("words", 1)]);
        assert_eq!(
            split.next_offsets()[&TopicPartition::new("words", 1)],
            12
        );
        assert_eq!(split.next_offsets().len(), 1);
        // The surviving partition stays in the live checkpoint.
        assert_eq!(
            checkpoint.next_offsets()[&TopicPartition::new("words", 0)],
            10
        );
        assert_eq!(checkpoint.next_offsets().len(), 1);
    }
}
