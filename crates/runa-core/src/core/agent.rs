//! Agent loop controller.
//!
//! Drives one turn through its phases: awaiting the model, streaming the
//! response, dispatching tools, and back, until the model completes with
//! no tool calls or the turn fails. Every terminal transition persists
//! the session exactly once and emits exactly one terminal event.
//!
//! Turns for the same session are serialized behind a per-session lock;
//! the [`TurnPolicy`] decides whether a second caller waits or is
//! rejected. Cancellation is cooperative via a per-turn
//! [`CancellationToken`]; a cancelled turn persists whatever partial
//! state it accumulated.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;

use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::RuntimeConfig;
use crate::config::TurnPolicy;
use crate::core::assembler::assemble;
use crate::core::assembler::StreamOutcome;
use crate::core::assembler::ToolCall;
use crate::core::context;
use crate::core::errors::ErrorKind;
use crate::core::errors::RuntimeError;
use crate::core::errors::RuntimeResult;
use crate::core::events::AgentEvent;
use crate::core::events::ToolOutput;
use crate::model::ModelBackend;
use crate::model::Summarizer;
use crate::session::ContentBlock;
use crate::session::Message;
use crate::session::Session;
use crate::session::TurnRecord;
use crate::store::SessionStore;
use crate::tools::ToolRegistry;

/// Sender half of the per-turn event channel.
pub type AgentEventTx = mpsc::Sender<AgentEvent>;
/// Receiver half of the per-turn event channel.
pub type AgentEventRx = mpsc::Receiver<AgentEvent>;

/// Creates the bounded event channel for a turn.
pub fn create_event_channel(capacity: usize) -> (AgentEventTx, AgentEventRx) {
    mpsc::channel(capacity.max(1))
}

/// Wrapper around the event channel. All sends await channel capacity so
/// a slow caller applies backpressure instead of losing events; a closed
/// channel reads as implicit cancellation.
#[derive(Clone)]
pub struct EventSender {
    tx: AgentEventTx,
}

impl EventSender {
    pub fn new(tx: AgentEventTx) -> Self {
        Self { tx }
    }

    /// Sends an event, returning false when the receiver is gone.
    pub async fn send(&self, event: AgentEvent) -> bool {
        self.tx.send(event).await.is_ok()
    }

    /// True once the receiver has been dropped.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Phase of the turn state machine, recorded in terminal error details.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TurnPhase {
    AwaitingModel,
    StreamingResponse,
    DispatchingTool,
}

impl fmt::Display for TurnPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TurnPhase::AwaitingModel => "awaiting_model",
            TurnPhase::StreamingResponse => "streaming_response",
            TurnPhase::DispatchingTool => "dispatching_tool",
        };
        write!(f, "{s}")
    }
}

/// The agent execution runtime: wires store, backend, summarizer, and
/// tools together and runs turns.
pub struct AgentRuntime {
    store: Arc<dyn SessionStore>,
    backend: Arc<dyn ModelBackend>,
    summarizer: Arc<dyn Summarizer>,
    tools: ToolRegistry,
    config: RuntimeConfig,
    turn_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl AgentRuntime {
    pub fn new(
        store: Arc<dyn SessionStore>,
        backend: Arc<dyn ModelBackend>,
        summarizer: Arc<dyn Summarizer>,
        tools: ToolRegistry,
        config: RuntimeConfig,
    ) -> Self {
        Self {
            store,
            backend,
            summarizer,
            tools,
            config,
            turn_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    /// Event channel sized per the configured capacity.
    pub fn event_channel(&self) -> (AgentEventTx, AgentEventRx) {
        create_event_channel(self.config.event_channel_capacity)
    }

    fn turn_lock(&self, session_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self
            .turn_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        Arc::clone(
            locks
                .entry(session_id.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))),
        )
    }

    /// Reclaims the lock entry once no holder or waiter remains.
    ///
    /// The map's handle is the only one left when the count is 1; waiters
    /// parked in `lock_owned` keep their own handle alive, so an entry
    /// with traffic is never removed.
    fn release_turn_lock(&self, session_id: &str) {
        let mut locks = self
            .turn_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if locks
            .get(session_id)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(session_id);
        }
    }

    /// Runs one turn for `session_id` with the given user message.
    ///
    /// Events stream over `tx` while the turn runs; the returned session
    /// is the persisted post-turn snapshot. Exactly one terminal event is
    /// emitted per turn.
    pub async fn run_turn(
        &self,
        session_id: &str,
        user_text: &str,
        tx: AgentEventTx,
        cancel: CancellationToken,
    ) -> RuntimeResult<Session> {
        let sender = EventSender::new(tx);

        let lock = self.turn_lock(session_id);
        let guard = match self.config.turn_policy {
            TurnPolicy::Wait => lock.lock_owned().await,
            TurnPolicy::Reject => match lock.try_lock_owned() {
                Ok(guard) => guard,
                Err(_) => {
                    let err = RuntimeError::internal(format!(
                        "A turn is already in flight for session '{session_id}'"
                    ));
                    sender.send(AgentEvent::from_error(&err)).await;
                    return Err(err);
                }
            },
        };

        let result = self
            .run_turn_locked(session_id, user_text, sender, cancel)
            .await;
        drop(guard);
        self.release_turn_lock(session_id);
        result
    }

    async fn run_turn_locked(
        &self,
        session_id: &str,
        user_text: &str,
        sender: EventSender,
        cancel: CancellationToken,
    ) -> RuntimeResult<Session> {
        // A departed caller is implicit cancellation, checked at every
        // suspension point from here on.
        if !sender
            .send(AgentEvent::TurnStarted {
                session_id: session_id.to_string(),
            })
            .await
        {
            cancel.cancel();
        }
        tracing::info!(session_id, "turn started");

        let mut session = match self.store.load(session_id).await {
            Ok(session) => session,
            Err(err) => {
                // Nothing loaded, so nothing to persist.
                sender.send(AgentEvent::from_error(&err)).await;
                return Err(err);
            }
        };

        if let Err(err) = context::append_message(&mut session, Message::user(user_text)) {
            return Err(self
                .fail_turn(&mut session, &sender, TurnPhase::AwaitingModel, err)
                .await);
        }

        let mut tool_iterations: usize = 0;
        loop {
            // AwaitingModel
            if sender.is_closed() {
                cancel.cancel();
            }
            if cancel.is_cancelled() {
                return Err(self
                    .fail_turn(
                        &mut session,
                        &sender,
                        TurnPhase::AwaitingModel,
                        RuntimeError::cancelled(),
                    )
                    .await);
            }

            if let Err(err) = context::ensure_within_budget(
                &mut session,
                self.summarizer.as_ref(),
                self.config.recency_guard,
            )
            .await
            {
                return Err(self
                    .fail_turn(&mut session, &sender, TurnPhase::AwaitingModel, err)
                    .await);
            }

            let messages = session.context_messages();
            let schemas = self.tools.schemas();
            let stream = tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    return Err(self
                        .fail_turn(
                            &mut session,
                            &sender,
                            TurnPhase::AwaitingModel,
                            RuntimeError::cancelled(),
                        )
                        .await);
                }
                result = self.backend.stream_turn(&messages, &schemas) => match result {
                    Ok(stream) => stream,
                    Err(err) => {
                        return Err(self
                            .fail_turn(&mut session, &sender, TurnPhase::AwaitingModel, err)
                            .await);
                    }
                },
            };

            // StreamingResponse
            let assembled =
                assemble(stream, &sender, &cancel, self.config.model_timeout()).await;

            if let Some(malformed) = assembled.malformed {
                // Record the call with its raw arguments plus a failure
                // result so the history stays diagnosable and correlated.
                let mut blocks: Vec<ContentBlock> = assembled
                    .segments
                    .iter()
                    .map(|text| ContentBlock::Text { text: text.clone() })
                    .collect();
                blocks.push(ContentBlock::ToolCall {
                    id: malformed.id.clone(),
                    name: malformed.name.clone(),
                    input: serde_json::json!({ "_raw": malformed.raw }),
                });
                let append = context::append_message(&mut session, Message::assistant_blocks(blocks));
                if append.is_ok() {
                    let output = ToolOutput::failure_with_details(
                        "invalid_parameters",
                        format!(
                            "Arguments for tool '{}' were not valid JSON",
                            malformed.name
                        ),
                        Value::String(malformed.error.clone()),
                    );
                    sender
                        .send(AgentEvent::ToolCompleted {
                            id: malformed.id.clone(),
                            output: output.clone(),
                        })
                        .await;
                    let _ = context::append_message(
                        &mut session,
                        Message::tool_result(&malformed.id, output),
                    );
                }
                let err = match assembled.outcome {
                    StreamOutcome::Failed(err) => err,
                    StreamOutcome::Completed => {
                        RuntimeError::invalid_parameters(&malformed.name, malformed.error)
                    }
                };
                return Err(self
                    .fail_turn(&mut session, &sender, TurnPhase::StreamingResponse, err)
                    .await);
            }

            if let StreamOutcome::Failed(err) = assembled.outcome {
                // Keep any partial text the model produced before failing.
                let text = assembled.segments.concat();
                if !text.is_empty() {
                    let _ = context::append_message(&mut session, Message::assistant(text));
                }
                return Err(self
                    .fail_turn(&mut session, &sender, TurnPhase::StreamingResponse, err)
                    .await);
            }

            if assembled.tool_calls.is_empty() {
                // Natural completion.
                let final_text = assembled.text();
                if !final_text.is_empty()
                    && let Err(err) = context::append_message(
                        &mut session,
                        Message::assistant(final_text.clone()),
                    )
                {
                    return Err(self
                        .fail_turn(&mut session, &sender, TurnPhase::StreamingResponse, err)
                        .await);
                }
                // The budget invariant holds after the turn, not just
                // before each model round.
                if let Err(err) = context::ensure_within_budget(
                    &mut session,
                    self.summarizer.as_ref(),
                    self.config.recency_guard,
                )
                .await
                {
                    return Err(self
                        .fail_turn(&mut session, &sender, TurnPhase::StreamingResponse, err)
                        .await);
                }
                session.last_turn = Some(TurnRecord::Completed);
                session.touch();
                if let Err(err) = self.store.save(&session).await {
                    tracing::warn!(session_id, error = %err, "failed to persist completed turn");
                    sender.send(AgentEvent::from_error(&err)).await;
                    return Err(err);
                }
                sender
                    .send(AgentEvent::TurnCompleted {
                        final_text: final_text.clone(),
                    })
                    .await;
                tracing::info!(session_id, "turn completed");
                return Ok(session);
            }

            // Tool turn: record the assistant message (text segments plus
            // the calls) before any dispatch.
            let mut blocks: Vec<ContentBlock> = assembled
                .segments
                .iter()
                .map(|text| ContentBlock::Text { text: text.clone() })
                .collect();
            for call in &assembled.tool_calls {
                blocks.push(ContentBlock::ToolCall {
                    id: call.id.clone(),
                    name: call.name.clone(),
                    input: call.input.clone(),
                });
            }
            if let Err(err) =
                context::append_message(&mut session, Message::assistant_blocks(blocks))
            {
                return Err(self
                    .fail_turn(&mut session, &sender, TurnPhase::StreamingResponse, err)
                    .await);
            }

            // DispatchingTool: strictly sequential, in request order, each
            // result appended before the next call starts.
            for call in &assembled.tool_calls {
                tool_iterations += 1;
                if tool_iterations > self.config.max_tool_iterations {
                    return Err(self
                        .fail_turn(
                            &mut session,
                            &sender,
                            TurnPhase::DispatchingTool,
                            RuntimeError::iteration_limit(self.config.max_tool_iterations),
                        )
                        .await);
                }

                match self.dispatch_tool(call, &sender, &cancel).await {
                    Ok(output) => {
                        if !sender
                            .send(AgentEvent::ToolCompleted {
                                id: call.id.clone(),
                                output: output.clone(),
                            })
                            .await
                        {
                            // The result still lands in context; the next
                            // suspension point observes the cancellation.
                            cancel.cancel();
                        }
                        if let Err(err) = context::append_message(
                            &mut session,
                            Message::tool_result(&call.id, output),
                        ) {
                            return Err(self
                                .fail_turn(&mut session, &sender, TurnPhase::DispatchingTool, err)
                                .await);
                        }
                    }
                    Err(err) => {
                        let output = ToolOutput::from_error(&err);
                        sender
                            .send(AgentEvent::ToolCompleted {
                                id: call.id.clone(),
                                output: output.clone(),
                            })
                            .await;
                        let _ = context::append_message(
                            &mut session,
                            Message::tool_result(&call.id, output),
                        );
                        return Err(self
                            .fail_turn(&mut session, &sender, TurnPhase::DispatchingTool, err)
                            .await);
                    }
                }
            }
            // Back to AwaitingModel so the model can react to the results.
        }
    }

    /// Runs one tool call, retrying execution failures up to the
    /// configured limit. Resolution and validation failures are never
    /// retried.
    async fn dispatch_tool(
        &self,
        call: &ToolCall,
        sender: &EventSender,
        cancel: &CancellationToken,
    ) -> RuntimeResult<ToolOutput> {
        let mut attempt: usize = 0;
        loop {
            attempt += 1;
            if cancel.is_cancelled() {
                return Err(RuntimeError::cancelled());
            }

            if !sender
                .send(AgentEvent::ToolStarted {
                    id: call.id.clone(),
                    name: call.name.clone(),
                })
                .await
            {
                cancel.cancel();
                return Err(RuntimeError::cancelled());
            }

            let registry = self.tools.clone();
            let name = call.name.clone();
            let input = call.input.clone();
            let timeout = self.config.tool_timeout();
            let mut handle =
                tokio::spawn(async move { registry.invoke(&name, &input, Some(timeout)).await });

            let result = tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    // Best-effort cancellation; the output is discarded
                    // either way.
                    handle.abort();
                    return Err(RuntimeError::cancelled());
                }
                joined = &mut handle => match joined {
                    Ok(result) => result,
                    Err(join_err) => Err(RuntimeError::internal(format!(
                        "Tool '{}' task failed: {join_err}",
                        call.name
                    ))),
                },
            };

            match result {
                Ok(value) => return Ok(ToolOutput::success(value)),
                Err(err)
                    if err.kind == ErrorKind::ToolExecution
                        && attempt <= self.config.tool_retry_limit =>
                {
                    tracing::warn!(
                        tool = %call.name,
                        attempt,
                        error = %err,
                        "tool execution failed, retrying"
                    );
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Marks the turn failed (or cancelled), persists the session, and
    /// emits the terminal error event annotated with the failing phase.
    async fn fail_turn(
        &self,
        session: &mut Session,
        sender: &EventSender,
        phase: TurnPhase,
        mut err: RuntimeError,
    ) -> RuntimeError {
        session.last_turn = Some(match err.kind {
            ErrorKind::Cancelled => TurnRecord::Cancelled,
            kind => TurnRecord::Failed {
                kind,
                message: err.message.clone(),
            },
        });
        session.touch();
        if let Err(save_err) = self.store.save(session).await {
            tracing::warn!(
                session_id = %session.id,
                error = %save_err,
                "failed to persist terminal turn state"
            );
        }

        let phase_note = format!("phase: {phase}");
        err.details = Some(match err.details.take() {
            Some(details) => format!("{details}; {phase_note}"),
            None => phase_note,
        });
        tracing::warn!(session_id = %session.id, error = %err, "turn failed");
        sender.send(AgentEvent::from_error(&err)).await;
        err
    }
}

impl fmt::Debug for AgentRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentRuntime")
            .field("tools", &self.tools)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
