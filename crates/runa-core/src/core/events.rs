//! Events emitted by the agent loop during a turn.
//!
//! A turn produces an ordered stream of [`AgentEvent`]s over a bounded
//! channel. Text arrives incrementally as `TextDelta`s; tool activity is
//! bracketed by `ToolCallRequested`/`ToolStarted`/`ToolCompleted`; the
//! stream ends with exactly one terminal event (`TurnCompleted` or `Error`).

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

use crate::core::errors::ErrorKind;
use crate::core::errors::RuntimeError;

/// Events emitted during agent execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    /// A turn began for a session.
    TurnStarted { session_id: String },
    /// Incremental assistant text.
    TextDelta { text: String },
    /// A contiguous run of assistant text was sealed (at a tool-call
    /// boundary or at end of stream).
    AssistantSegment { text: String },
    /// The model requested a tool invocation with fully parsed input.
    ToolCallRequested {
        id: String,
        name: String,
        input: Value,
    },
    /// A tool executor is about to run (re-emitted on retry).
    ToolStarted { id: String, name: String },
    /// A tool finished, successfully or not.
    ToolCompleted { id: String, output: ToolOutput },
    /// Terminal: the turn reached a natural completion.
    TurnCompleted { final_text: String },
    /// Terminal: the turn failed or was cancelled.
    Error {
        kind: ErrorKind,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        details: Option<String>,
    },
}

impl AgentEvent {
    /// Returns true for the two events that terminate a turn's stream.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AgentEvent::TurnCompleted { .. } | AgentEvent::Error { .. }
        )
    }

    /// Builds the terminal error event for a failed or cancelled turn.
    pub fn from_error(err: &RuntimeError) -> Self {
        AgentEvent::Error {
            kind: err.kind,
            message: err.message.clone(),
            details: err.details.clone(),
        }
    }
}

/// Result envelope produced by tool execution and recorded in the session.
///
/// Serializes to `{"ok": true, "data": ...}` on success and
/// `{"ok": false, "error": {"code", "message", "details"}}` on failure.
/// Cancellation round-trips through the failure shape with code
/// `"cancelled"`.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolOutput {
    Success {
        data: Value,
    },
    Failure {
        code: String,
        message: String,
        details: Option<Value>,
    },
    Cancelled,
}

impl ToolOutput {
    pub fn success(data: Value) -> Self {
        ToolOutput::Success { data }
    }

    pub fn failure(code: impl Into<String>, message: impl Into<String>) -> Self {
        ToolOutput::Failure {
            code: code.into(),
            message: message.into(),
            details: None,
        }
    }

    pub fn failure_with_details(
        code: impl Into<String>,
        message: impl Into<String>,
        details: Value,
    ) -> Self {
        ToolOutput::Failure {
            code: code.into(),
            message: message.into(),
            details: Some(details),
        }
    }

    /// Builds a failure envelope from a runtime error, using the error kind
    /// as the code.
    pub fn from_error(err: &RuntimeError) -> Self {
        if err.kind == ErrorKind::Cancelled {
            return ToolOutput::Cancelled;
        }
        ToolOutput::Failure {
            code: err.kind.to_string(),
            message: err.message.clone(),
            details: err.details.as_ref().map(|d| Value::String(d.clone())),
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, ToolOutput::Success { .. })
    }

    /// Human-readable summary of a non-success outcome, if any.
    pub fn error_summary(&self) -> Option<String> {
        match self {
            ToolOutput::Success { .. } => None,
            ToolOutput::Failure { code, message, .. } => Some(format!("{code}: {message}")),
            ToolOutput::Cancelled => Some("cancelled: Tool execution cancelled".to_string()),
        }
    }
}

impl Serialize for ToolOutput {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        use serde::ser::SerializeMap;
        match self {
            ToolOutput::Success { data } => {
                let mut map = serializer.serialize_map(Some(2))?;
                map.serialize_entry("ok", &true)?;
                map.serialize_entry("data", data)?;
                map.end()
            }
            ToolOutput::Failure {
                code,
                message,
                details,
            } => {
                let mut error = serde_json::Map::new();
                error.insert("code".to_string(), Value::String(code.clone()));
                error.insert("message".to_string(), Value::String(message.clone()));
                if let Some(details) = details {
                    error.insert("details".to_string(), details.clone());
                }
                let mut map = serializer.serialize_map(Some(2))?;
                map.serialize_entry("ok", &false)?;
                map.serialize_entry("error", &Value::Object(error))?;
                map.end()
            }
            ToolOutput::Cancelled => {
                let mut error = serde_json::Map::new();
                error.insert(
                    "code".to_string(),
                    Value::String("cancelled".to_string()),
                );
                error.insert(
                    "message".to_string(),
                    Value::String("Tool execution cancelled".to_string()),
                );
                let mut map = serializer.serialize_map(Some(2))?;
                map.serialize_entry("ok", &false)?;
                map.serialize_entry("error", &Value::Object(error))?;
                map.end()
            }
        }
    }
}

impl<'de> Deserialize<'de> for ToolOutput {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        use serde::de::Error;
        let value = Value::deserialize(deserializer)?;
        let obj = value
            .as_object()
            .ok_or_else(|| D::Error::custom("expected tool output object"))?;
        let ok = obj
            .get("ok")
            .and_then(Value::as_bool)
            .ok_or_else(|| D::Error::custom("missing boolean 'ok' field"))?;
        if ok {
            let data = obj.get("data").cloned().unwrap_or(Value::Null);
            return Ok(ToolOutput::Success { data });
        }
        let error = obj
            .get("error")
            .and_then(Value::as_object)
            .ok_or_else(|| D::Error::custom("missing 'error' object"))?;
        let code = error
            .get("code")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string();
        if code == "cancelled" {
            return Ok(ToolOutput::Cancelled);
        }
        let message = error
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let details = error.get("details").cloned();
        Ok(ToolOutput::Failure {
            code,
            message,
            details,
        })
    }
}
