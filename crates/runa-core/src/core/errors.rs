//! Runtime error taxonomy.
//!
//! Every failure the runtime can surface is classified by [`ErrorKind`] and
//! carried as a [`RuntimeError`] (kind + one-line summary + optional
//! details). Terminal turn failures reach the caller as an
//! `AgentEvent::Error` embedding the same kind, so the taxonomy is
//! serializable.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Error categories for runtime failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// A tool name was registered twice.
    DuplicateTool,
    /// A tool name could not be resolved in the registry.
    UnknownTool,
    /// Tool parameters failed schema validation (or the schema itself was invalid).
    InvalidParameters,
    /// A tool executor failed or timed out.
    ToolExecution,
    /// The context window cannot be brought under the token budget.
    BudgetUnsatisfiable,
    /// The session store failed to load or save.
    Persistence,
    /// The per-turn tool-call iteration bound was exceeded.
    IterationLimit,
    /// The model stream was interrupted, timed out, or ended early.
    StreamTransport,
    /// The turn was cancelled by the caller.
    Cancelled,
    /// Internal/unclassified error.
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::DuplicateTool => "duplicate_tool",
            ErrorKind::UnknownTool => "unknown_tool",
            ErrorKind::InvalidParameters => "invalid_parameters",
            ErrorKind::ToolExecution => "tool_execution",
            ErrorKind::BudgetUnsatisfiable => "budget_unsatisfiable",
            ErrorKind::Persistence => "persistence",
            ErrorKind::IterationLimit => "iteration_limit",
            ErrorKind::StreamTransport => "stream_transport",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Internal => "internal",
        };
        write!(f, "{s}")
    }
}

/// Structured runtime error with kind and details.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeError {
    /// Error category.
    pub kind: ErrorKind,
    /// One-line summary suitable for display.
    pub message: String,
    /// Optional additional details (e.g., validation output, error chain).
    pub details: Option<String>,
}

impl RuntimeError {
    /// Creates a new runtime error.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            details: None,
        }
    }

    /// Attaches additional details.
    #[must_use]
    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    pub fn duplicate_tool(name: &str) -> Self {
        Self::new(
            ErrorKind::DuplicateTool,
            format!("Tool '{name}' is already registered"),
        )
    }

    pub fn unknown_tool(name: &str) -> Self {
        Self::new(ErrorKind::UnknownTool, format!("Unknown tool: {name}"))
    }

    pub fn invalid_parameters(tool: &str, details: impl Into<String>) -> Self {
        Self::new(
            ErrorKind::InvalidParameters,
            format!("Invalid parameters for tool '{tool}'"),
        )
        .with_details(details)
    }

    /// Wraps an executor failure, preserving the error chain in details.
    pub fn tool_execution(tool: &str, source: &anyhow::Error) -> Self {
        Self::new(
            ErrorKind::ToolExecution,
            format!("Tool '{tool}' failed: {source}"),
        )
        .with_details(format!("{source:#}"))
    }

    pub fn tool_timeout(tool: &str, secs: u64) -> Self {
        Self::new(
            ErrorKind::ToolExecution,
            format!("Tool '{tool}' timed out after {secs} seconds"),
        )
    }

    pub fn budget_unsatisfiable(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::BudgetUnsatisfiable, message)
    }

    pub fn persistence(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Persistence, message)
    }

    pub fn iteration_limit(max: usize) -> Self {
        Self::new(
            ErrorKind::IterationLimit,
            format!("Exceeded maximum of {max} tool-call iterations in one turn"),
        )
    }

    pub fn stream_transport(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::StreamTransport, message)
    }

    pub fn cancelled() -> Self {
        Self::new(ErrorKind::Cancelled, "Turn cancelled")
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.kind, self.message)?;
        if let Some(details) = &self.details {
            write!(f, " ({details})")?;
        }
        Ok(())
    }
}

impl std::error::Error for RuntimeError {}

/// Result type for runtime operations.
pub type RuntimeResult<T> = std::result::Result<T, RuntimeError>;
