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

use anyhow::Context;
use serde::de::DeserializeOwned;
use serde::Serialize;
use weir_state::{KeyPrefix, StateStoreRegistry, StoreTransaction};

use crate::model::{Row, RowValue};
use crate::producer::RowProducer;
use crate::serialize::SerializeContext;
use crate::topic::TopicManager;

/// What to do with a record whose pipeline invocation failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAction {
    Halt,
    Skip,
}

/// Record-level error handler installed by the operator. Returning
/// [`ErrorAction::Skip`] acknowledges the record and keeps the loop alive.
pub type PipelineErrorHandler = Box<dyn FnMut(&anyhow::Error, &Row) -> ErrorAction + Send>;

/// One user pipeline, bound to a single input topic. Invocations are strictly
/// in offset order within a partition.
pub trait Pipeline: Send {
    fn process(&mut self, row: &Row, ctx: &mut ProcessingContext<'_>) -> anyhow::Result<()>;
}

impl<F> Pipeline for F
where F: FnMut(&Row, &mut ProcessingContext<'_>) -> anyhow::Result<()> + Send
{
    fn process(&mut self, row: &Row, ctx: &mut ProcessingContext<'_>) -> anyhow::Result<()> {
        (self)(row, ctx)
    }
}

/// Everything a pipeline invocation may touch: downstream topics through the
/// shared row producer, and keyed state through the store transaction of the
/// current input partition.
pub struct ProcessingContext<'a> {
    pub(crate) topics: &'a TopicManager,
    pub(crate) producer: &'a RowProducer,
    pub(crate) stores: &'a StateStoreRegistry,
    pub(crate) transactions: &'a mut HashMap<(String, i32), StoreTransaction>,
    /// Partition and offset of the input record currently being processed.
    pub(crate) partition: i32,
    pub(crate) offset: i64,
    pub(crate) num_rows_produced: &'a mut u64,
}

impl<'a> ProcessingContext<'a> {
    /// Keyed state of `store_name`, scoped to the plain-values sub-store.
    pub fn state(&mut self, store_name: &str) -> anyhow::Result<StateHandle<'_>> {
        self.state_with_prefix(store_name, KeyPrefix::VALUES)
    }

    /// Keyed state of `store_name` under an explicit sub-store prefix.
    /// Operators reserve disjoint prefixes; a handle never reaches across its
    /// own.
    pub fn state_with_prefix(
        &mut self,
        store_name: &str,
        prefix: KeyPrefix,
    ) -> anyhow::Result<StateHandle<'_>> {
        let key = (store_name.to_string(), self.partition);
        if !self.transactions.contains_key(&key) {
            let store_partition = self
                .stores
                .get_partition(store_name, self.partition)
                .with_context(|| {
                    format!(
                        "Store `{store_name}` is not open for partition `{}`: was it registered \
                         with this topic's pipeline?",
                        self.partition
                    )
                })?;
            let transaction = store_partition.begin()?;
            self.transactions.insert(key.clone(), transaction);
        }
        let transaction = self.transactions.get_mut(&key).expect("just inserted");
        // Mutations made through this handle are provenance-tagged with the
        // record being processed.
        transaction.position_at(self.offset);
        Ok(StateHandle {
            transaction,
            prefix,
        })
    }

    /// Serializes and enqueues one output record on `topic_name`, using the
    /// topic's registered key and value formats.
    pub fn produce(
        &mut self,
        topic_name: &str,
        key: Option<&RowValue>,
        value: &RowValue,
    ) -> anyhow::Result<()> {
        let topic = self
            .topics
            .get_topic(topic_name)
            .with_context(|| format!("Topic `{topic_name}` is not registered."))?;
        let serialize_ctx = SerializeContext {
            topic: topic_name,
            partition: None,
        };
        let key_bytes = key
            .map(|key| topic.key_format.serialize(key, &serialize_ctx))
            .transpose()?;
        let value_bytes = topic.value_format.serialize(value, &serialize_ctx)?;
        self.producer.produce(
            topic_name,
            None,
            key_bytes.as_deref(),
            Some(&value_bytes),
            &[],
            None,
        )?;
        *self.num_rows_produced += 1;
        Ok(())
    }

    /// Forwards a row downstream, carrying its key, headers, and timestamp
    /// through unchanged. The value is re-serialized with the destination
    /// topic's format.
    pub fn produce_row(&mut self, topic_name: &str, row: &Row) -> anyhow::Result<()> {
        let topic = self
            .topics
            .get_topic(topic_name)
            .with_context(|| format!("Topic `{topic_name}` is not registered."))?;
        let serialize_ctx = SerializeContext {
            topic: topic_name,
            partition: None,
        };
        let value_bytes = topic.value_format.serialize(&row.value, &serialize_ctx)?;
        self.producer.produce(
            topic_name,
            None,
            row.key.as_deref(),
            Some(&value_bytes),
            &row.headers,
            Some(row.timestamp_ms),
        )?;
        *self.num_rows_produced += 1;
        Ok(())
    }
}

/// Prefix-scoped view over the store transaction of the current partition.
pub struct StateHandle<'a> {
    transaction: &'a mut StoreTransaction,
    prefix: KeyPrefix,
}

impl<'a> StateHandle<'a> {
    pub fn get(&mut self, key: &[u8]) -> anyhow::Result<Option<Vec<u8>>> {
        Ok(self.transaction.get(self.prefix, key)?)
    }

    pub fn set(&mut self, key: &[u8], value: Vec<u8>) -> anyhow::Result<()> {
        Ok(self.transaction.set(self.prefix, key, value)?)
    }

    pub fn delete(&mut self, key: &[u8]) -> anyhow::Result<()> {
        Ok(self.transaction.delete(self.prefix, key)?)
    }

    pub fn get_json<T: DeserializeOwned>(&mut self, key: &[u8]) -> anyhow::Result<Option<T>> {
        match self.get(key)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes).with_context(|| {
                format!("Failed to decode stored value for key `{}`.", String::from_utf8_lossy(key))
            })?)),
            None => Ok(None),
        }
    }

    pub fn set_json<T: Serialize>(&mut self, key: &[u8], value: &T) -> anyhow::Result<()> {
        let bytes = serde_json::to_vec(value)?;
        self.set(key, bytes)
    }

    /// Merged (transaction over store) view of all keys under `key_prefix`.
    pub fn items_with_prefix(&self, key_prefix: &[u8]) -> anyhow::Result<Vec<(Vec<u8>, Vec<u8>)>> {
        Ok(self.transaction.items_with_prefix(self.prefix, key_prefix)?)
    }
}
