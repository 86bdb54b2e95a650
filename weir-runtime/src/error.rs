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

use std::fmt;

use crate::model::TopicPartition;

/// The stage of the processing loop a fatal error surfaced in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessingPhase {
    Poll,
    Deserialize,
    Pipeline,
    Produce,
    Flush,
    Commit,
    StoreCommit,
    Recovery,
}

impl ProcessingPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessingPhase::Poll => "poll",
            ProcessingPhase::Deserialize => "deserialize",
            ProcessingPhase::Pipeline => "pipeline",
            ProcessingPhase::Produce => "produce",
            ProcessingPhase::Flush => "flush",
            ProcessingPhase::Commit => "commit",
            ProcessingPhase::StoreCommit => "store-commit",
            ProcessingPhase::Recovery => "recovery",
        }
    }
}

impl fmt::Display for ProcessingPhase {
    fn fmt(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        formatter.write_str(self.as_str())
    }
}

/// Fatal processing failure, tagged with the phase it happened in and, when
/// applicable, the offending record position.
#[derive(Debug)]
pub struct ProcessingError {
    pub phase: ProcessingPhase,
    pub topic_partition: Option<TopicPartition>,
    pub offset: Option<i64>,
    pub source: anyhow::Error,
}

impl ProcessingError {
    pub fn new(phase: ProcessingPhase, source: anyhow::Error) -> ProcessingError {
        ProcessingError {
            phase,
            topic_partition: None,
            offset: None,
            source,
        }
    }

    pub fn at(mut self, topic_partition: TopicPartition) -> ProcessingError {
        self.topic_partition = Some(topic_partition);
        self
    }

    pub fn at_offset(mut self, offset: i64) -> ProcessingError {
        self.offset = Some(offset);
        self
    }
}

impl fmt::Display for ProcessingError {
    fn fmt(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        write!(formatter, "Processing failed in phase `{}`", self.phase)?;
        if let Some(topic_partition) = &self.topic_partition {
            write!(formatter, " at `{topic_partition}`")?;
            if let Some(offset) = self.offset {
                write!(formatter, " offset `{offset}`")?;
            }
        }
        write!(formatter, ": {:#}", self.source)
    }
}

impl std::error::Error for ProcessingError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.source.as_ref())
    }
}
