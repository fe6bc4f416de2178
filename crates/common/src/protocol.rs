//! Wire protocol for the controller link.
//!
//! One JSON object per line in both directions. Inbound requests carry a
//! `method`, optional `params`, and an optional correlation `id` (integer or
//! string). Outbound envelopes echo that id verbatim and carry either a
//! `result` or an `error`.

use serde_json::{Map, Value};

/// Channel a command arrived on. Determines which methods are permitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Http,
    LocalSocket,
    ReverseSocket,
}

impl Origin {
    /// Socket origins (local or reverse) may run privileged methods that
    /// plain HTTP callers may not.
    pub fn is_socket(self) -> bool {
        !matches!(self, Origin::Http)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Origin::Http => "http",
            Origin::LocalSocket => "local_socket",
            Origin::ReverseSocket => "reverse_socket",
        }
    }
}

/// A parsed inbound request. Immutable after parse, discarded after dispatch.
#[derive(Debug, Clone)]
pub struct Command {
    pub id: Option<Value>,
    pub method: String,
    pub params: Map<String, Value>,
}

/// Outcome of reading one inbound line.
#[derive(Debug)]
pub enum Inbound {
    /// A request to dispatch.
    Command(Command),
    /// A response to a message this side sent (has `result`/`error` but no
    /// `method`). Logged by the channel, never dispatched.
    Reply {
        id: Option<Value>,
        error: Option<Value>,
    },
    /// Not a protocol message at all.
    Malformed(String),
}

/// Parse one line of inbound text.
pub fn parse_line(raw: &str) -> Inbound {
    let trimmed = raw.trim();
    if !trimmed.starts_with('{') {
        return Inbound::Malformed(format!("not a JSON object: {}", snippet(trimmed, 80)));
    }

    let value: Value = match serde_json::from_str(trimmed) {
        Ok(value) => value,
        Err(err) => return Inbound::Malformed(format!("invalid JSON: {err}")),
    };

    let obj = match value {
        Value::Object(obj) => obj,
        other => return Inbound::Malformed(format!("expected object, got {other}")),
    };

    let id = obj.get("id").filter(|v| !v.is_null()).cloned();

    let method = obj
        .get("method")
        .and_then(Value::as_str)
        .unwrap_or_default();

    if method.is_empty() {
        if obj.contains_key("result") || obj.contains_key("error") {
            return Inbound::Reply {
                id,
                error: obj.get("error").cloned(),
            };
        }
        return Inbound::Malformed("message has no method, result, or error".to_string());
    }

    let params = match obj.get("params") {
        Some(Value::Object(params)) => params.clone(),
        _ => Map::new(),
    };

    Inbound::Command(Command {
        id,
        method: method.to_string(),
        params,
    })
}

/// Truncate a payload for logging; SDP/ICE bodies can run to kilobytes.
pub fn snippet(text: &str, max: usize) -> String {
    if text.len() <= max {
        text.to_string()
    } else {
        let mut end = max;
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}...", &text[..end])
    }
}

/// Handler result wrapped for transport.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// A plain success value (string, number).
    Success(Value),
    /// A pre-serialized object/array payload sent through as-is.
    Raw(Value),
    Error(String),
}

/// Correlated response; `id` echoes the originating command's id or is absent.
#[derive(Debug, Clone)]
pub struct ResponseEnvelope {
    pub id: Option<Value>,
    pub outcome: Outcome,
}

impl ResponseEnvelope {
    pub fn success(id: Option<Value>, value: impl Into<Value>) -> Self {
        Self {
            id,
            outcome: Outcome::Success(value.into()),
        }
    }

    pub fn raw(id: Option<Value>, value: Value) -> Self {
        Self {
            id,
            outcome: Outcome::Raw(value),
        }
    }

    pub fn error(id: Option<Value>, message: impl Into<String>) -> Self {
        Self {
            id,
            outcome: Outcome::Error(message.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        !matches!(self.outcome, Outcome::Error(_))
    }

    pub fn to_value(&self) -> Value {
        let mut obj = Map::new();
        if let Some(id) = &self.id {
            obj.insert("id".to_string(), id.clone());
        }
        match &self.outcome {
            Outcome::Success(value) | Outcome::Raw(value) => {
                obj.insert("status".to_string(), Value::from("success"));
                obj.insert("result".to_string(), value.clone());
            }
            Outcome::Error(message) => {
                obj.insert("status".to_string(), Value::from("error"));
                obj.insert("error".to_string(), Value::from(message.as_str()));
            }
        }
        Value::Object(obj)
    }

    pub fn to_line(&self) -> String {
        self.to_value().to_string()
    }
}
