//! Incremental decoder for `event:` / `data:` server-sent frames.
//!
//! Bytes go in as they arrive off the wire; complete lines are decoded and
//! everything after the last newline stays buffered for the next chunk. A
//! newline byte never occurs inside a multi-byte UTF-8 sequence, so splitting
//! on it keeps every decoded line intact.

use serde_json::{Map, Value};

/// Event kind used when a `data:` line arrives without a preceding `event:`.
pub const DEFAULT_EVENT_KIND: &str = "message";

/// One decoded frame: the announced kind and its JSON object payload.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamEvent {
    pub kind: String,
    pub payload: Map<String, Value>,
}

impl StreamEvent {
    pub fn new(kind: impl Into<String>, payload: Map<String, Value>) -> Self {
        Self {
            kind: kind.into(),
            payload,
        }
    }

    /// String field of the payload, if present and a string.
    pub fn str_field(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(Value::as_str)
    }
}

#[derive(Debug)]
pub struct FrameDecoder {
    pending: Vec<u8>,
    kind: String,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self {
            pending: Vec::new(),
            kind: DEFAULT_EVENT_KIND.to_string(),
        }
    }

    /// Feed a chunk of bytes; returns the events completed by it, in order.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<StreamEvent> {
        self.pending.extend_from_slice(chunk);

        let Some(last_newline) = self.pending.iter().rposition(|&b| b == b'\n') else {
            return Vec::new();
        };
        let complete: Vec<u8> = self.pending.drain(..=last_newline).collect();
        let text = String::from_utf8_lossy(&complete);

        text.lines().filter_map(|line| self.decode_line(line)).collect()
    }

    /// Decode whatever is left once the byte stream has ended.
    ///
    /// A final line without a trailing newline is still a whole line.
    pub fn finish(&mut self) -> Option<StreamEvent> {
        if self.pending.is_empty() {
            return None;
        }
        let rest = std::mem::take(&mut self.pending);
        let line = String::from_utf8_lossy(&rest);
        self.decode_line(line.trim_end_matches('\r'))
    }

    /// Bytes held back waiting for a newline.
    pub fn buffered(&self) -> usize {
        self.pending.len()
    }

    fn decode_line(&mut self, line: &str) -> Option<StreamEvent> {
        if let Some(kind) = field(line, "event") {
            let kind = kind.trim();
            self.kind = if kind.is_empty() {
                DEFAULT_EVENT_KIND.to_string()
            } else {
                kind.to_string()
            };
            return None;
        }

        let data = field(line, "data")?;
        // Malformed payloads are dropped; the pending kind carries over.
        let payload = parse_payload(data)?;
        let kind = std::mem::replace(&mut self.kind, DEFAULT_EVENT_KIND.to_string());
        Some(StreamEvent { kind, payload })
    }
}

/// Value of `name:` on `line`, with one optional leading space removed.
fn field<'a>(line: &'a str, name: &str) -> Option<&'a str> {
    let value = line.strip_prefix(name)?.strip_prefix(':')?;
    Some(value.strip_prefix(' ').unwrap_or(value))
}

fn parse_payload(data: &str) -> Option<Map<String, Value>> {
    match serde_json::from_str::<Value>(data.trim()) {
        Ok(Value::Object(map)) => Some(map),
        _ => None,
    }
}
