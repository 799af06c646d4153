//! Typed view over decoded stream events.
//!
//! The analysis backend announces five kinds of frame: `start`, `progress`,
//! `text`, `complete` and `error`. Anything else passes through as
//! [`PipelineEvent::Other`].

use serde::{Deserialize, Deserializer};
use serde_json::Value;

use crate::frame::StreamEvent;

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Progress {
    #[serde(deserialize_with = "string_or_number")]
    pub step: String,
    #[serde(default)]
    pub image: Option<u32>,
    #[serde(default)]
    pub total_images: u32,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Complete {
    #[serde(default, deserialize_with = "opt_string_or_number")]
    pub message_id: Option<String>,
    #[serde(default)]
    pub hypothesis: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PipelineEvent {
    Start { total_images: u32 },
    Progress(Progress),
    Text(String),
    Complete(Complete),
    Error(String),
    Other(StreamEvent),
}

#[derive(Deserialize)]
struct StartPayload {
    #[serde(default)]
    total_images: u32,
}

#[derive(Deserialize)]
struct TextPayload {
    text: String,
}

#[derive(Deserialize)]
struct ErrorPayload {
    #[serde(deserialize_with = "string_or_number")]
    error: String,
}

impl PipelineEvent {
    /// Interpret a decoded frame.
    ///
    /// Returns `None` when a known kind carries a payload missing its
    /// required fields; such frames are malformed and dropped.
    pub fn from_stream_event(event: StreamEvent) -> Option<Self> {
        let parsed = match event.kind.as_str() {
            "start" => Self::Start {
                total_images: decode::<StartPayload>(&event)?.total_images,
            },
            "progress" => Self::Progress(decode(&event)?),
            "text" => Self::Text(decode::<TextPayload>(&event)?.text),
            "complete" => Self::Complete(decode(&event)?),
            "error" => Self::Error(decode::<ErrorPayload>(&event)?.error),
            _ => Self::Other(event),
        };
        Some(parsed)
    }
}

fn decode<T: for<'de> Deserialize<'de>>(event: &StreamEvent) -> Option<T> {
    serde_json::from_value(Value::Object(event.payload.clone())).ok()
}

fn string_or_number<'de, D: Deserializer<'de>>(d: D) -> Result<String, D::Error> {
    match Value::deserialize(d)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "expected string or number, got {other}"
        ))),
    }
}

fn opt_string_or_number<'de, D: Deserializer<'de>>(d: D) -> Result<Option<String>, D::Error> {
    match Value::deserialize(d)? {
        Value::Null => Ok(None),
        Value::String(s) => Ok(Some(s)),
        Value::Number(n) => Ok(Some(n.to_string())),
        other => Err(serde::de::Error::custom(format!(
            "expected string or number, got {other}"
        ))),
    }
}
