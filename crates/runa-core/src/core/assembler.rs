//! Streaming assembler.
//!
//! Consumes one model round's [`ModelStream`] and folds the raw events
//! into ordered text segments and fully parsed tool calls. Text is sealed
//! into a segment at each tool-call boundary and at end of stream; tool
//! arguments are accumulated as JSON fragments and parsed only once the
//! call closes. Deltas are forwarded to the caller as they arrive.

use std::time::Duration;

use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::core::agent::EventSender;
use crate::core::errors::RuntimeError;
use crate::core::events::AgentEvent;
use crate::model::ModelEvent;
use crate::model::ModelStream;

use futures_util::StreamExt;

/// A fully parsed tool call extracted from the stream.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ToolCall {
    pub id: String,
    pub name: String,
    pub input: Value,
}

/// A tool call whose accumulated arguments were not valid JSON.
#[derive(Debug, Clone)]
pub(crate) struct MalformedCall {
    pub id: String,
    pub name: String,
    pub raw: String,
    pub error: String,
}

/// How the stream ended.
#[derive(Debug)]
pub(crate) enum StreamOutcome {
    /// The model signalled completion.
    Completed,
    /// Transport failure, malformed stream, or cancellation.
    Failed(RuntimeError),
}

/// Everything assembled from one model round.
#[derive(Debug)]
pub(crate) struct AssembledTurn {
    /// Sealed text segments, in stream order.
    pub segments: Vec<String>,
    /// Parsed tool calls, in stream order.
    pub tool_calls: Vec<ToolCall>,
    /// Set when a call's arguments failed to parse; assembly stops there.
    pub malformed: Option<MalformedCall>,
    pub outcome: StreamOutcome,
}

impl AssembledTurn {
    pub fn text(&self) -> String {
        self.segments.concat()
    }
}

/// In-flight accumulator for one tool call's streamed arguments.
struct ToolCallBuilder {
    index: usize,
    id: String,
    name: String,
    input_json: String,
}

impl ToolCallBuilder {
    fn finalize(self) -> Result<ToolCall, MalformedCall> {
        let trimmed = self.input_json.trim();
        let input = if trimmed.is_empty() {
            Ok(Value::Object(serde_json::Map::new()))
        } else {
            serde_json::from_str(trimmed)
        };
        match input {
            Ok(input) => Ok(ToolCall {
                id: self.id,
                name: self.name,
                input,
            }),
            Err(err) => Err(MalformedCall {
                id: self.id,
                name: self.name,
                raw: self.input_json,
                error: err.to_string(),
            }),
        }
    }
}

/// Drains a model stream into an [`AssembledTurn`], forwarding deltas and
/// parsed tool calls to `sender` as they materialize.
///
/// Never panics on a malformed stream; every irregularity lands in
/// `outcome`. A closed event channel is treated as implicit cancellation.
pub(crate) async fn assemble(
    mut stream: ModelStream,
    sender: &EventSender,
    cancel: &CancellationToken,
    event_timeout: Duration,
) -> AssembledTurn {
    let mut segments: Vec<String> = Vec::new();
    let mut current = String::new();
    let mut builders: Vec<ToolCallBuilder> = Vec::new();
    let mut tool_calls: Vec<ToolCall> = Vec::new();

    macro_rules! finish {
        ($outcome:expr) => {
            return AssembledTurn {
                segments,
                tool_calls,
                malformed: None,
                outcome: $outcome,
            }
        };
    }

    loop {
        let next = tokio::select! {
            biased;
            () = cancel.cancelled() => {
                if !current.is_empty() {
                    segments.push(std::mem::take(&mut current));
                }
                finish!(StreamOutcome::Failed(RuntimeError::cancelled()));
            }
            next = tokio::time::timeout(event_timeout, stream.next()) => next,
        };

        let event = match next {
            Ok(Some(Ok(event))) => event,
            Ok(Some(Err(err))) => {
                if !current.is_empty() {
                    segments.push(std::mem::take(&mut current));
                }
                let mut runtime_err = RuntimeError::stream_transport(err.message.clone());
                if let Some(details) = err.details {
                    runtime_err = runtime_err.with_details(details);
                }
                finish!(StreamOutcome::Failed(runtime_err));
            }
            Ok(None) => {
                if !current.is_empty() {
                    segments.push(std::mem::take(&mut current));
                }
                finish!(StreamOutcome::Failed(RuntimeError::stream_transport(
                    "Model stream ended before completion",
                )));
            }
            Err(_) => {
                if !current.is_empty() {
                    segments.push(std::mem::take(&mut current));
                }
                finish!(StreamOutcome::Failed(RuntimeError::stream_transport(
                    format!(
                        "No model event within {} seconds",
                        event_timeout.as_secs()
                    ),
                )));
            }
        };

        match event {
            ModelEvent::TextDelta { text } => {
                current.push_str(&text);
                if !sender
                    .send(AgentEvent::TextDelta { text })
                    .await
                {
                    cancel.cancel();
                    segments.push(std::mem::take(&mut current));
                    finish!(StreamOutcome::Failed(RuntimeError::cancelled()));
                }
            }
            ModelEvent::ToolCallStart { index, id, name } => {
                if !current.is_empty() {
                    let segment = std::mem::take(&mut current);
                    let delivered = sender
                        .send(AgentEvent::AssistantSegment {
                            text: segment.clone(),
                        })
                        .await;
                    segments.push(segment);
                    if !delivered {
                        cancel.cancel();
                        finish!(StreamOutcome::Failed(RuntimeError::cancelled()));
                    }
                }
                builders.push(ToolCallBuilder {
                    index,
                    id: id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
                    name,
                    input_json: String::new(),
                });
            }
            ModelEvent::ToolCallDelta {
                index,
                partial_json,
            } => {
                let Some(builder) = builders.iter_mut().find(|b| b.index == index) else {
                    finish!(StreamOutcome::Failed(RuntimeError::stream_transport(
                        format!("Tool call fragment for unknown index {index}"),
                    )));
                };
                builder.input_json.push_str(&partial_json);
            }
            ModelEvent::ToolCallEnd { index } => {
                let Some(position) = builders.iter().position(|b| b.index == index) else {
                    finish!(StreamOutcome::Failed(RuntimeError::stream_transport(
                        format!("Tool call end for unknown index {index}"),
                    )));
                };
                match builders.remove(position).finalize() {
                    Ok(call) => {
                        let delivered = sender
                            .send(AgentEvent::ToolCallRequested {
                                id: call.id.clone(),
                                name: call.name.clone(),
                                input: call.input.clone(),
                            })
                            .await;
                        tool_calls.push(call);
                        if !delivered {
                            cancel.cancel();
                            finish!(StreamOutcome::Failed(RuntimeError::cancelled()));
                        }
                    }
                    Err(malformed) => {
                        let error = RuntimeError::invalid_parameters(
                            &malformed.name,
                            malformed.error.clone(),
                        );
                        return AssembledTurn {
                            segments,
                            tool_calls,
                            malformed: Some(malformed),
                            outcome: StreamOutcome::Failed(error),
                        };
                    }
                }
            }
            ModelEvent::Completed => {
                if !current.is_empty() {
                    let segment = std::mem::take(&mut current);
                    let delivered = sender
                        .send(AgentEvent::AssistantSegment {
                            text: segment.clone(),
                        })
                        .await;
                    segments.push(segment);
                    if !delivered {
                        cancel.cancel();
                        finish!(StreamOutcome::Failed(RuntimeError::cancelled()));
                    }
                }
                finish!(StreamOutcome::Completed);
            }
            ModelEvent::Error { message } => {
                if !current.is_empty() {
                    segments.push(std::mem::take(&mut current));
                }
                finish!(StreamOutcome::Failed(RuntimeError::stream_transport(
                    message
                )));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::agent::create_event_channel;
    use crate::core::errors::ErrorKind;
    use crate::model::ModelError;
    use futures_util::stream;
    use serde_json::json;

    fn stream_of(events: Vec<ModelEvent>) -> ModelStream {
        stream::iter(events.into_iter().map(Ok)).boxed()
    }

    async fn run(events: Vec<ModelEvent>) -> (AssembledTurn, Vec<AgentEvent>) {
        let (tx, mut rx) = create_event_channel(256);
        let sender = EventSender::new(tx);
        let cancel = CancellationToken::new();
        let turn = assemble(
            stream_of(events),
            &sender,
            &cancel,
            Duration::from_secs(5),
        )
        .await;
        drop(sender);
        let mut seen = Vec::new();
        while let Some(event) = rx.recv().await {
            seen.push(event);
        }
        (turn, seen)
    }

    #[tokio::test]
    async fn test_deltas_concatenate_in_order() {
        let (turn, events) = run(vec![
            ModelEvent::TextDelta {
                text: "Hel".to_string(),
            },
            ModelEvent::TextDelta {
                text: "lo".to_string(),
            },
            ModelEvent::TextDelta {
                text: " world".to_string(),
            },
            ModelEvent::Completed,
        ])
        .await;

        assert!(matches!(turn.outcome, StreamOutcome::Completed));
        assert_eq!(turn.segments, vec!["Hello world"]);
        let deltas: Vec<&str> = events
            .iter()
            .filter_map(|e| match e {
                AgentEvent::TextDelta { text } => Some(text.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(deltas, vec!["Hel", "lo", " world"]);
    }

    #[tokio::test]
    async fn test_tool_arguments_assembled_across_fragments() {
        let (turn, events) = run(vec![
            ModelEvent::ToolCallStart {
                index: 0,
                id: Some("c1".to_string()),
                name: "adder".to_string(),
            },
            ModelEvent::ToolCallDelta {
                index: 0,
                partial_json: "{\"a\": 2,".to_string(),
            },
            ModelEvent::ToolCallDelta {
                index: 0,
                partial_json: " \"b\": 2}".to_string(),
            },
            ModelEvent::ToolCallEnd { index: 0 },
            ModelEvent::Completed,
        ])
        .await;

        assert_eq!(turn.tool_calls.len(), 1);
        assert_eq!(turn.tool_calls[0].input, json!({"a": 2, "b": 2}));
        assert!(events.iter().any(|e| matches!(
            e,
            AgentEvent::ToolCallRequested { id, .. } if id == "c1"
        )));
    }

    #[tokio::test]
    async fn test_text_sealed_before_tool_call() {
        let (turn, events) = run(vec![
            ModelEvent::TextDelta {
                text: "Let me compute".to_string(),
            },
            ModelEvent::ToolCallStart {
                index: 0,
                id: Some("c1".to_string()),
                name: "adder".to_string(),
            },
            ModelEvent::ToolCallEnd { index: 0 },
            ModelEvent::Completed,
        ])
        .await;

        assert_eq!(turn.segments, vec!["Let me compute"]);
        let segment_pos = events
            .iter()
            .position(|e| matches!(e, AgentEvent::AssistantSegment { .. }))
            .unwrap();
        let call_pos = events
            .iter()
            .position(|e| matches!(e, AgentEvent::ToolCallRequested { .. }))
            .unwrap();
        assert!(segment_pos < call_pos);
    }

    #[tokio::test]
    async fn test_empty_arguments_default_to_empty_object() {
        let (turn, _) = run(vec![
            ModelEvent::ToolCallStart {
                index: 0,
                id: Some("c1".to_string()),
                name: "lister".to_string(),
            },
            ModelEvent::ToolCallEnd { index: 0 },
            ModelEvent::Completed,
        ])
        .await;
        assert_eq!(turn.tool_calls[0].input, json!({}));
    }

    #[tokio::test]
    async fn test_missing_call_id_is_generated() {
        let (turn, _) = run(vec![
            ModelEvent::ToolCallStart {
                index: 0,
                id: None,
                name: "adder".to_string(),
            },
            ModelEvent::ToolCallEnd { index: 0 },
            ModelEvent::Completed,
        ])
        .await;
        assert!(!turn.tool_calls[0].id.is_empty());
    }

    #[tokio::test]
    async fn test_malformed_arguments_fail_assembly() {
        let (turn, _) = run(vec![
            ModelEvent::ToolCallStart {
                index: 0,
                id: Some("c1".to_string()),
                name: "adder".to_string(),
            },
            ModelEvent::ToolCallDelta {
                index: 0,
                partial_json: "{\"a\": ".to_string(),
            },
            ModelEvent::ToolCallEnd { index: 0 },
        ])
        .await;

        let malformed = turn.malformed.as_ref().unwrap();
        assert_eq!(malformed.id, "c1");
        match &turn.outcome {
            StreamOutcome::Failed(err) => assert_eq!(err.kind, ErrorKind::InvalidParameters),
            StreamOutcome::Completed => panic!("expected failure"),
        }
    }

    #[tokio::test]
    async fn test_stream_ending_early_is_transport_failure() {
        let (turn, _) = run(vec![ModelEvent::TextDelta {
            text: "partial".to_string(),
        }])
        .await;

        assert_eq!(turn.segments, vec!["partial"]);
        match &turn.outcome {
            StreamOutcome::Failed(err) => assert_eq!(err.kind, ErrorKind::StreamTransport),
            StreamOutcome::Completed => panic!("expected failure"),
        }
    }

    #[tokio::test]
    async fn test_in_stream_error_event() {
        let (tx, _rx) = create_event_channel(16);
        let sender = EventSender::new(tx);
        let cancel = CancellationToken::new();
        let events: Vec<Result<ModelEvent, ModelError>> =
            vec![Err(ModelError::new("connection reset"))];
        let turn = assemble(
            stream::iter(events).boxed(),
            &sender,
            &cancel,
            Duration::from_secs(5),
        )
        .await;
        match &turn.outcome {
            StreamOutcome::Failed(err) => {
                assert_eq!(err.kind, ErrorKind::StreamTransport);
                assert!(err.message.contains("connection reset"));
            }
            StreamOutcome::Completed => panic!("expected failure"),
        }
    }

    #[tokio::test]
    async fn test_cancellation_stops_assembly() {
        let (tx, _rx) = create_event_channel(16);
        let sender = EventSender::new(tx);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let pending: ModelStream = stream::pending().boxed();
        let turn = assemble(pending, &sender, &cancel, Duration::from_secs(5)).await;
        match &turn.outcome {
            StreamOutcome::Failed(err) => assert_eq!(err.kind, ErrorKind::Cancelled),
            StreamOutcome::Completed => panic!("expected cancellation"),
        }
    }
}
