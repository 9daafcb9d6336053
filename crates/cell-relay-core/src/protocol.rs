//! Wire protocol messages exchanged with the wrapped engine and the client.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Message identity header.
///
/// The `msg_id` of a request becomes the correlation id that the engine
/// echoes back in the `parent` header of every reply and broadcast it
/// produces for that request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    pub msg_id: String,
}

impl Header {
    /// Mint a header with a fresh random id.
    #[must_use]
    pub fn fresh() -> Self {
        Self {
            msg_id: Uuid::new_v4().to_string(),
        }
    }
}

/// Destination stream of an output fragment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamName {
    Stdout,
    Stderr,
}

/// Reported execution state of the wrapped engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionState {
    Busy,
    Idle,
}

/// Terminal status of an execute reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplyStatus {
    Ok,
    Error,
    Aborted,
}

/// Content of an `execute_request`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecuteRequest {
    pub code: String,
    #[serde(default)]
    pub silent: bool,
    #[serde(default)]
    pub allow_stdin: bool,
    /// Stable logical id correlating repeated runs of the same cell.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cell_id: Option<String>,
    /// Per-request configuration overrides.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub overrides: HashMap<String, String>,
}

/// Content of an `execute_reply`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecuteReply {
    pub status: ReplyStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_count: Option<u64>,
    #[serde(default, flatten)]
    pub extra: serde_json::Map<String, Value>,
}

/// Rich output carried by `display_data` and `execute_result`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RichOutput {
    pub data: Value,
    #[serde(default)]
    pub metadata: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_count: Option<u64>,
}

/// Content of a broadcast `error`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorOutput {
    pub ename: String,
    pub evalue: String,
    #[serde(default)]
    pub traceback: Vec<String>,
}

/// Message payload, discriminated by `msg_type` on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "msg_type", content = "content", rename_all = "snake_case")]
pub enum Payload {
    // Requests
    ExecuteRequest(ExecuteRequest),
    InterruptRequest,
    InputReply { value: String },
    ShutdownRequest { restart: bool },

    // Replies
    ExecuteReply(ExecuteReply),
    InterruptReply,
    ShutdownReply { restart: bool },

    // Broadcasts
    Stream { name: StreamName, text: String },
    DisplayData(RichOutput),
    ExecuteResult(RichOutput),
    Error(ErrorOutput),
    Status { execution_state: ExecutionState },
    ClearOutput { wait: bool },

    // Interactive input
    InputRequest { prompt: String, password: bool },
}

/// One protocol message: identity, correlation, and payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub header: Header,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<Header>,
    #[serde(flatten)]
    pub payload: Payload,
}

impl Envelope {
    /// Create a message with a fresh header and no parent.
    #[must_use]
    pub fn new(payload: Payload) -> Self {
        Self {
            header: Header::fresh(),
            parent: None,
            payload,
        }
    }

    /// Create a message answering the request identified by `parent`.
    #[must_use]
    pub fn child_of(parent: &Header, payload: Payload) -> Self {
        Self {
            header: Header::fresh(),
            parent: Some(parent.clone()),
            payload,
        }
    }

    /// Whether this message answers the request with the given id.
    #[must_use]
    pub fn correlates_with(&self, msg_id: &str) -> bool {
        self.parent.as_ref().is_some_and(|p| p.msg_id == msg_id)
    }

    /// Rewrite the router-internal correlation id back to the caller's.
    ///
    /// Replaces the parent header with the original request header and
    /// rewrites any occurrence of the internal id inside nested content
    /// fields, so the caller never observes the router's id.
    pub fn rewrite_correlation(&mut self, internal_id: &str, origin: &Header) {
        self.parent = Some(origin.clone());
        let external_id = origin.msg_id.as_str();
        match &mut self.payload {
            Payload::ExecuteReply(reply) => {
                for value in reply.extra.values_mut() {
                    rewrite_value(value, internal_id, external_id);
                }
            }
            Payload::DisplayData(rich) | Payload::ExecuteResult(rich) => {
                rewrite_value(&mut rich.data, internal_id, external_id);
                rewrite_value(&mut rich.metadata, internal_id, external_id);
            }
            Payload::Error(error) => {
                for line in &mut error.traceback {
                    if line.contains(internal_id) {
                        *line = line.replace(internal_id, external_id);
                    }
                }
            }
            _ => {}
        }
    }

    /// Approximate in-memory size, used to bound the outbound history.
    #[must_use]
    pub fn approx_bytes(&self) -> usize {
        const OVERHEAD: usize = 128;
        let payload = match &self.payload {
            Payload::Stream { text, .. } => text.len(),
            Payload::ExecuteRequest(req) => req.code.len(),
            Payload::DisplayData(rich) | Payload::ExecuteResult(rich) => {
                rich.data.to_string().len()
            }
            Payload::Error(error) => {
                error.ename.len()
                    + error.evalue.len()
                    + error.traceback.iter().map(String::len).sum::<usize>()
            }
            Payload::ExecuteReply(reply) => {
                reply.extra.iter().map(|(k, v)| k.len() + v.to_string().len()).sum()
            }
            Payload::InputRequest { prompt, .. } => prompt.len(),
            Payload::InputReply { value } => value.len(),
            _ => 0,
        };
        OVERHEAD + payload
    }
}

fn rewrite_value(value: &mut Value, from: &str, to: &str) {
    match value {
        Value::String(s) => {
            if s.contains(from) {
                *s = s.replace(from, to);
            }
        }
        Value::Array(items) => {
            for item in items {
                rewrite_value(item, from, to);
            }
        }
        Value::Object(map) => {
            for item in map.values_mut() {
                rewrite_value(item, from, to);
            }
        }
        _ => {}
    }
}
