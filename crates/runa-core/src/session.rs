//! Session data model.
//!
//! A [`Session`] is the durable conversation state: an ordered message
//! history, an optional rolling summary, and the outcome of the most
//! recent turn. Messages carry a cached token estimate so budget checks
//! never rescan the full history.

use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

use crate::core::events::ToolOutput;

/// Speaker role for a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    /// Carrier for tool results fed back to the model.
    Tool,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        }
    }
}

/// One block inside a structured message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text { text: String },
    /// A tool invocation requested by the assistant.
    ToolCall {
        id: String,
        name: String,
        input: Value,
    },
    /// The recorded outcome of a tool invocation, correlated by call id.
    ToolResult { call_id: String, output: ToolOutput },
}

/// Message content: plain text or structured blocks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

/// A single message in the session history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: MessageContent,
    pub timestamp: DateTime<Utc>,
    /// Cached token estimate for this message.
    pub token_count: u64,
}

impl Message {
    fn from_content(role: Role, content: MessageContent) -> Self {
        let token_count = estimate_content_tokens(&content);
        Self {
            role,
            content,
            timestamp: Utc::now(),
            token_count,
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::from_content(Role::User, MessageContent::Text(text.into()))
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::from_content(Role::Assistant, MessageContent::Text(text.into()))
    }

    pub fn assistant_blocks(blocks: Vec<ContentBlock>) -> Self {
        Self::from_content(Role::Assistant, MessageContent::Blocks(blocks))
    }

    /// Tool-result message for one completed invocation.
    pub fn tool_result(call_id: impl Into<String>, output: ToolOutput) -> Self {
        Self::from_content(
            Role::Tool,
            MessageContent::Blocks(vec![ContentBlock::ToolResult {
                call_id: call_id.into(),
                output,
            }]),
        )
    }

    /// Overrides the cached token estimate.
    #[must_use]
    pub fn with_token_count(mut self, token_count: u64) -> Self {
        self.token_count = token_count;
        self
    }

    /// Plain text of the message, if it is a text message.
    pub fn text(&self) -> Option<&str> {
        match &self.content {
            MessageContent::Text(text) => Some(text),
            MessageContent::Blocks(_) => None,
        }
    }

    /// Call ids of tool-result blocks in this message.
    pub fn tool_result_ids(&self) -> Vec<&str> {
        match &self.content {
            MessageContent::Text(_) => Vec::new(),
            MessageContent::Blocks(blocks) => blocks
                .iter()
                .filter_map(|block| match block {
                    ContentBlock::ToolResult { call_id, .. } => Some(call_id.as_str()),
                    _ => None,
                })
                .collect(),
        }
    }

    /// Call ids of tool-call blocks in this message.
    pub fn tool_call_ids(&self) -> Vec<&str> {
        match &self.content {
            MessageContent::Text(_) => Vec::new(),
            MessageContent::Blocks(blocks) => blocks
                .iter()
                .filter_map(|block| match block {
                    ContentBlock::ToolCall { id, .. } => Some(id.as_str()),
                    _ => None,
                })
                .collect(),
        }
    }
}

/// Deterministic token estimate: one token per four characters, minimum one.
///
/// Intentionally crude; budgets are advisory rather than exact, and the
/// same function is applied everywhere so comparisons stay consistent.
pub fn estimate_tokens(text: &str) -> u64 {
    let chars = text.chars().count() as u64;
    chars.div_ceil(4).max(1)
}

fn estimate_content_tokens(content: &MessageContent) -> u64 {
    match content {
        MessageContent::Text(text) => estimate_tokens(text),
        MessageContent::Blocks(blocks) => {
            let rendered = serde_json::to_string(blocks).unwrap_or_default();
            estimate_tokens(&rendered)
        }
    }
}

/// Outcome of the most recently executed turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TurnRecord {
    Completed,
    Cancelled,
    Failed {
        kind: crate::core::errors::ErrorKind,
        message: String,
    },
}

/// Durable conversation state for one session id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub messages: Vec<Message>,
    /// Rolling summary standing in for evicted history.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<Message>,
    pub token_budget: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_turn: Option<TurnRecord>,
}

impl Session {
    pub fn new(id: impl Into<String>, token_budget: u64) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            messages: Vec::new(),
            summary: None,
            token_budget,
            created_at: now,
            updated_at: now,
            last_turn: None,
        }
    }

    /// Estimated tokens of the live (non-summarized) history.
    pub fn live_tokens(&self) -> u64 {
        self.messages.iter().map(|m| m.token_count).sum()
    }

    /// Estimated tokens of summary plus live history.
    pub fn total_tokens(&self) -> u64 {
        self.summary.as_ref().map_or(0, |m| m.token_count) + self.live_tokens()
    }

    /// The message sequence sent to the model: summary first (when
    /// present), then the live history in order.
    pub fn context_messages(&self) -> Vec<Message> {
        let mut messages = Vec::with_capacity(self.messages.len() + 1);
        if let Some(summary) = &self.summary {
            messages.push(summary.clone());
        }
        messages.extend(self.messages.iter().cloned());
        messages
    }

    /// Tool-call ids that have no matching tool-result yet.
    pub fn outstanding_tool_calls(&self) -> Vec<String> {
        let mut outstanding: Vec<String> = Vec::new();
        for message in &self.messages {
            for id in message.tool_call_ids() {
                outstanding.push(id.to_string());
            }
            for id in message.tool_result_ids() {
                outstanding.retain(|pending| pending != id);
            }
        }
        outstanding
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}
