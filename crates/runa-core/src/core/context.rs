//! Context window management.
//!
//! Appends are validated (tool results must correlate with an outstanding
//! tool call) and the window is kept under the session's token budget by
//! folding the oldest messages into a rolling summary. The most recent
//! exchange is never summarized: eviction stops at the later of the last
//! user message and the recency guard.

use crate::core::errors::RuntimeError;
use crate::core::errors::RuntimeResult;
use crate::model::Summarizer;
use crate::session::Message;
use crate::session::Session;

/// Appends a message, enforcing tool-call/result correlation.
pub fn append_message(session: &mut Session, message: Message) -> RuntimeResult<()> {
    let outstanding = session.outstanding_tool_calls();
    for call_id in message.tool_result_ids() {
        if !outstanding.iter().any(|id| id == call_id) {
            return Err(RuntimeError::internal(format!(
                "Tool result references unknown or settled call id '{call_id}'"
            )));
        }
    }
    session.messages.push(message);
    session.touch();
    Ok(())
}

/// Index of the first message that must stay live: everything from the
/// last user message onward, and never fewer than `recency_guard` messages.
fn protected_start(session: &Session, recency_guard: usize) -> usize {
    let len = session.messages.len();
    let guard_start = len.saturating_sub(recency_guard);
    let last_user = session
        .messages
        .iter()
        .rposition(|m| m.role == crate::session::Role::User)
        .unwrap_or(len);
    guard_start.min(last_user)
}

/// Brings the session under its token budget, summarizing the oldest
/// messages when needed. No-op while the estimate fits the budget.
///
/// Deterministic: the same history and budget always evict the same
/// prefix in one summarization pass.
pub async fn ensure_within_budget(
    session: &mut Session,
    summarizer: &dyn Summarizer,
    recency_guard: usize,
) -> RuntimeResult<()> {
    if session.total_tokens() <= session.token_budget {
        return Ok(());
    }

    let protect_start = protected_start(session, recency_guard);
    if protect_start == 0 {
        return Err(RuntimeError::budget_unsatisfiable(format!(
            "Context exceeds budget of {} tokens and no messages are eligible for summarization",
            session.token_budget
        )));
    }

    // Summarize the existing summary (if any) together with the evicted
    // prefix so no information silently disappears twice.
    let mut input: Vec<Message> = Vec::with_capacity(protect_start + 1);
    if let Some(summary) = &session.summary {
        input.push(summary.clone());
    }
    input.extend(session.messages[..protect_start].iter().cloned());

    let summary = summarizer.summarize(&input).await.map_err(|err| {
        RuntimeError::budget_unsatisfiable("Summarization failed while reducing context")
            .with_details(err.to_string())
    })?;

    tracing::debug!(
        session_id = %session.id,
        evicted = protect_start,
        summary_tokens = summary.token_count,
        "summarized context prefix"
    );

    session.summary = Some(summary);
    session.messages.drain(..protect_start);
    session.touch();

    if session.total_tokens() > session.token_budget {
        return Err(RuntimeError::budget_unsatisfiable(format!(
            "Context still exceeds budget of {} tokens after summarization",
            session.token_budget
        )));
    }
    Ok(())
}
