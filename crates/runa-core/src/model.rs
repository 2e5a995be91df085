//! Model backend contract.
//!
//! The runtime talks to a language model through [`ModelBackend`], which
//! opens one streaming request per model round and yields raw
//! [`ModelEvent`]s. Tool-call arguments arrive as partial JSON fragments
//! keyed by an in-stream index; the assembler is responsible for stitching
//! and parsing them.

use std::fmt;

use futures_util::future::BoxFuture;
use futures_util::stream::BoxStream;
use serde::Deserialize;
use serde::Serialize;

use crate::core::errors::RuntimeResult;
use crate::session::Message;
use crate::tools::ToolSchema;

/// Raw events produced by a model stream, before assembly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ModelEvent {
    /// Incremental assistant text.
    TextDelta { text: String },
    /// A tool call opened at the given stream index. The id may be absent;
    /// the assembler generates one when missing.
    ToolCallStart {
        index: usize,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        name: String,
    },
    /// A fragment of the JSON arguments for the call at `index`.
    ToolCallDelta { index: usize, partial_json: String },
    /// The call at `index` has no more argument fragments.
    ToolCallEnd { index: usize },
    /// The model finished this round cleanly.
    Completed,
    /// The provider reported an in-stream error.
    Error { message: String },
}

/// Transport-level failure from a model backend.
#[derive(Debug, Clone)]
pub struct ModelError {
    pub message: String,
    pub details: Option<String>,
}

impl ModelError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            details: None,
        }
    }

    #[must_use]
    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}

impl fmt::Display for ModelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)?;
        if let Some(details) = &self.details {
            write!(f, " ({details})")?;
        }
        Ok(())
    }
}

impl std::error::Error for ModelError {}

/// Boxed stream of model events for one request.
pub type ModelStream = BoxStream<'static, Result<ModelEvent, ModelError>>;

/// A streaming language-model backend.
///
/// Implementations own their transport; the runtime only consumes the
/// returned stream. One call corresponds to one model round within a turn.
pub trait ModelBackend: Send + Sync {
    fn stream_turn<'a>(
        &'a self,
        messages: &'a [Message],
        tools: &'a [ToolSchema],
    ) -> BoxFuture<'a, RuntimeResult<ModelStream>>;
}

/// Produces a compact summary message standing in for evicted history.
pub trait Summarizer: Send + Sync {
    fn summarize<'a>(&'a self, messages: &'a [Message]) -> BoxFuture<'a, RuntimeResult<Message>>;
}
