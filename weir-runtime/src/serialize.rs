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

use tracing::debug;

use crate::model::RowValue;

#[derive(Debug, thiserror::Error)]
pub enum SerializationError {
    #[error("Payload is not valid UTF-8: {0}")]
    InvalidUtf8(#[from] std::str::Utf8Error),
    #[error("Payload is not valid JSON: {0}")]
    MalformedJson(#[from] serde_json::Error),
    #[error("A `{value_kind}` value cannot be serialized with the `{format}` format.")]
    IncompatibleValue {
        value_kind: &'static str,
        format: &'static str,
    },
}

/// Outcome of deserializing one message. `Skip` advances the offset without
/// invoking the pipeline; it is distinct from failure, which halts the loop.
#[derive(Debug, Clone, PartialEq)]
pub enum Deserialized {
    One(RowValue),
    Many(Vec<RowValue>),
    Skip,
}

/// How the JSON deserializer reacts to malformed payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OnMalformed {
    /// Surface a deserialization error and halt the loop.
    #[default]
    Fail,
    /// Map the message to [`Deserialized::Skip`] and count it.
    Skip,
}

/// How the JSON deserializer treats a top-level array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum JsonArrayMode {
    /// The array is one value.
    #[default]
    AsValue,
    /// The array fans out into one row per element.
    Explode,
}

/// Per-deserialize inputs beyond the payload itself.
pub struct DeserializeContext<'a> {
    pub topic: &'a str,
    pub partition: i32,
    pub headers: &'a [(String, Vec<u8>)],
    pub key: Option<&'a [u8]>,
}

pub struct SerializeContext<'a> {
    pub topic: &'a str,
    pub partition: Option<i32>,
}

/// Wire format of one side (key or value) of a topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SerializationFormat {
    Bytes,
    Text,
    Json {
        array_mode: JsonArrayMode,
        on_malformed: OnMalformed,
    },
}

impl SerializationFormat {
    /// JSON with default behavior: arrays are values, malformed input fails.
    pub fn json() -> SerializationFormat {
        SerializationFormat::Json {
            array_mode: JsonArrayMode::default(),
            on_malformed: OnMalformed::default(),
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            SerializationFormat::Bytes => "bytes",
            SerializationFormat::Text => "text",
            SerializationFormat::Json { .. } => "json",
        }
    }

    pub fn deserialize(
        &self,
        payload: Option<&[u8]>,
        ctx: &DeserializeContext,
    ) -> Result<Deserialized, SerializationError> {
        match self {
            SerializationFormat::Bytes => {
                let bytes = payload.unwrap_or_default().to_vec();
                Ok(Deserialized::One(RowValue::Bytes(bytes)))
            }
            SerializationFormat::Text => {
                let Some(payload) = payload else {
                    debug!(topic = ctx.topic, partition = ctx.partition, "Null payload, skipping.");
                    return Ok(Deserialized::Skip);
                };
                let text = std::str::from_utf8(payload)?;
                Ok(Deserialized::One(RowValue::Text(text.to_string())))
            }
            SerializationFormat::Json {
                array_mode,
                on_malformed,
            } => {
                let Some(payload) = payload else {
                    // A null payload is a JSON null: compacted input topics
                    // use it to signal deletion.
                    return Ok(Deserialized::One(RowValue::Json(serde_json::Value::Null)));
                };
                let value = match serde_json::from_slice::<serde_json::Value>(payload) {
                    Ok(value) => value,
                    Err(error) if *on_malformed == OnMalformed::Skip => {
                        debug!(
                            topic = ctx.topic,
                            partition = ctx.partition,
                            error = %error,
                            "Malformed JSON payload, skipping."
                        );
                        return Ok(Deserialized::Skip);
                    }
                    Err(error) => return Err(error.into()),
                };
                match (*array_mode, value) {
                    (JsonArrayMode::Explode, serde_json::Value::Array(elements)) => Ok(
                        Deserialized::Many(elements.into_iter().map(RowValue::Json).collect()),
                    ),
                    (_, value) => Ok(Deserialized::One(RowValue::Json(value))),
                }
            }
        }
    }

    pub fn serialize(
        &self,
        value: &RowValue,
        _ctx: &SerializeContext,
    ) -> Result<Vec<u8>, SerializationError> {
        match (self, value) {
            (SerializationFormat::Bytes, RowValue::Bytes(bytes)) => Ok(bytes.clone()),
            (SerializationFormat::Bytes, RowValue::Text(text)) => Ok(text.as_bytes().to_vec()),
            (SerializationFormat::Text, RowValue::Text(text)) => Ok(text.as_bytes().to_vec()),
            (SerializationFormat::Text, RowValue::Bytes(bytes)) => {
                std::str::from_utf8(bytes)?;
                Ok(bytes.clone())
            }
            (SerializationFormat::Text, RowValue::Json(serde_json::Value::String(text))) => {
                Ok(text.as_bytes().to_vec())
            }
            (SerializationFormat::Json { .. }, RowValue::Json(value)) => {
                Ok(serde_json::to_vec(value)?)
            }
            (SerializationFormat::Json { .. }, RowValue::Text(text)) => {
                Ok(serde_json::to_vec(&serde_json::Value::String(text.clone()))?)
            }
            (format, value) => Err(SerializationError::IncompatibleValue {
                value_kind: match value {
                    RowValue::Bytes(_) => "bytes",
                    RowValue::Text(_) => "text",
                    RowValue::Json(_) => "json",
                },
                format: format.as_str(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx<'a>() -> DeserializeContext<'a> {
        DeserializeContext {
            topic: "words",
            partition: 0,
            headers: &[],
            key: None,
        }
    }

    #[test]
    fn test_json_deserialize_object() {
        let deserialized = SerializationFormat::json()
            .deserialize(Some(br#"{"word": "a"}"#), &ctx())
            .unwrap();
        let Deserialized::One(RowValue::Json(value)) = deserialized else {
            panic!("expected a single JSON value");
        };
        assert_eq!(value["word"], "a");
    }

    #[test]
    fn test_json_array_explodes_into_many_rows() {
        let format = SerializationFormat::Json {
            array_mode: JsonArrayMode::Explode,
            on_malformed: OnMalformed::Fail,
        };
        let deserialized = format.deserialize(Some(b"[1, 2, 3]"), &ctx()).unwrap();
        let Deserialized::Many(values) = deserialized else {
            panic!("expected a fan-out");
        };
        assert_eq!(values.len(), 3);

        // In `AsValue` mode the same payload is a single row.
        let deserialized = SerializationFormat::json()
            .deserialize(Some(b"[1, 2, 3]"), &ctx())
            .unwrap();
        assert!(matches!(deserialized, Deserialized::One(_)));
    }

    #[test]
    fn test_malformed_json_policies() {
        let error = SerializationFormat::json()
            .deserialize(Some(b"{oops"), &ctx())
            .unwrap_err();
        assert!(matches!(error, SerializationError::MalformedJson(_)));

        let skipping = SerializationFormat::Json {
            array_mode: JsonArrayMode::AsValue,
            on_malformed: OnMalformed::Skip,
        };
        let deserialized = skipping.deserialize(Some(b"{oops"), &ctx()).unwrap();
        assert_eq!(deserialized, Deserialized::Skip);
    }

    #[test]
    fn test_text_rejects_invalid_utf8() {
        let error = SerializationFormat::Text
            .deserialize(Some(&[0xff, 0xfe]), &ctx())
            .unwrap_err();
        assert!(matches!(error, SerializationError::InvalidUtf8(_)));
    }

    #[test]
    fn test_serialize_compatibility() {
        let serialize_ctx = SerializeContext {
            topic: "words",
            partition: None,
        };
        let json = RowValue::Json(serde_json::json!({"a": 4}));
        assert_eq!(
            SerializationFormat::json()
                .serialize(&json, &serialize_ctx)
                .unwrap(),
            br#"{"a":4}"#.to_vec()
        );
        let error = SerializationFormat::Json {
            array_mode: JsonArrayMode::AsValue,
            on_malformed: OnMalformed::Fail,
        }
        .serialize(&RowValue::Bytes(vec![1]), &serialize_ctx)
        .unwrap_err();
        assert!(matches!(
            error,
            SerializationError::IncompatibleValue { .. }
        ));
    }
}
