//! Streaming session state machine.
//!
//! One session owns one exchange with the model transport:
//! `Idle → Sending → Streaming → {Completed | Errored | Cancelled}`. Terminal
//! states are final; no render events fire after one is reached.
//!
//! Retry rules: only transient failures observed before the first chunk are
//! retried (with exponential backoff, honoring a server Retry-After hint).
//! Once any chunk has been delivered, a failure is terminal and carries the
//! partial text already shown — replaying would risk duplicate output.

use crate::transport::ModelTransport;
use std::thread;
use std::time::Duration;
use tether_core::{
    AssistantTurn, CancelToken, ChatRequest, LlmConfig, RenderEvent, RenderSink, ToolCallRequest,
    TransportChunk, TransportError,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Sending,
    Streaming,
    Completed,
    Errored,
    Cancelled,
}

/// Terminal result of one streaming exchange.
#[derive(Debug)]
pub enum SessionOutcome {
    Completed(AssistantTurn),
    /// Cancelled at a chunk boundary; `partial` holds exactly the content
    /// delivered before the trigger. Never retried, never an error.
    Cancelled { partial: String },
    /// Failed; `partial` holds any content already delivered.
    Errored {
        error: TransportError,
        partial: String,
    },
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u8,
    pub base_delay_ms: u64,
}

impl From<&LlmConfig> for RetryPolicy {
    fn from(cfg: &LlmConfig) -> Self {
        Self {
            max_retries: cfg.max_retries,
            base_delay_ms: cfg.retry_base_ms,
        }
    }
}

fn retry_delay(base_ms: u64, attempt: u8, retry_after: Option<Duration>) -> Duration {
    if let Some(hint) = retry_after {
        return hint;
    }
    let exponential = base_ms.saturating_mul(2_u64.saturating_pow(u32::from(attempt)));
    Duration::from_millis(exponential.max(base_ms.max(100)))
}

/// Accumulates streamed fragments into a completed assistant turn.
#[derive(Default)]
struct TurnAccumulator {
    content: String,
    reasoning: String,
    finish_reason: Option<String>,
    calls: Vec<CallAccumulator>,
    saw_chunk: bool,
}

#[derive(Default)]
struct CallAccumulator {
    id: Option<String>,
    name: String,
    arguments: String,
}

impl TurnAccumulator {
    /// Fold one tool-call fragment in. A fragment with a new id starts an
    /// accumulator (arrival order preserved); a repeated or absent id appends
    /// to the matching/current accumulator's argument buffer.
    fn merge_fragment(&mut self, id: Option<String>, name: Option<String>, arguments: String) {
        let slot = match id {
            Some(id) => {
                match self
                    .calls
                    .iter()
                    .position(|c| c.id.as_deref() == Some(id.as_str()))
                {
                    Some(pos) => pos,
                    None => {
                        self.calls.push(CallAccumulator {
                            id: Some(id),
                            ..CallAccumulator::default()
                        });
                        self.calls.len() - 1
                    }
                }
            }
            None => {
                if self.calls.is_empty() {
                    self.calls.push(CallAccumulator::default());
                }
                self.calls.len() - 1
            }
        };
        if let Some(name) = name
            && !name.trim().is_empty()
        {
            self.calls[slot].name = name;
        }
        self.calls[slot].arguments.push_str(&arguments);
    }

    fn into_turn(self) -> AssistantTurn {
        let tool_calls: Vec<ToolCallRequest> = self
            .calls
            .into_iter()
            .enumerate()
            .filter_map(|(index, call)| {
                if call.name.trim().is_empty() {
                    return None;
                }
                Some(ToolCallRequest {
                    id: call
                        .id
                        .unwrap_or_else(|| format!("tool_call_{}", index + 1)),
                    name: call.name,
                    arguments: call.arguments,
                })
            })
            .collect();
        AssistantTurn {
            content: self.content,
            reasoning: self.reasoning,
            tool_calls,
            finish_reason: self.finish_reason.unwrap_or_else(|| "stop".to_string()),
        }
    }
}

pub struct StreamingSession<'a> {
    transport: &'a dyn ModelTransport,
    retry: RetryPolicy,
    state: SessionState,
}

impl<'a> StreamingSession<'a> {
    pub fn new(transport: &'a dyn ModelTransport, retry: RetryPolicy) -> Self {
        Self {
            transport,
            retry,
            state: SessionState::Idle,
        }
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Drive the exchange to a terminal outcome.
    pub fn run(
        mut self,
        req: &ChatRequest,
        cancel: &CancelToken,
        sink: &RenderSink,
    ) -> SessionOutcome {
        let mut attempt: u8 = 0;
        loop {
            self.state = SessionState::Sending;
            let mut acc = TurnAccumulator::default();

            let result = self.transport.open(req, cancel, &mut |chunk| {
                // Chunk boundary: once cancellation triggers, nothing further
                // is accumulated or rendered.
                if cancel.is_triggered() {
                    return;
                }
                match chunk {
                    TransportChunk::Reasoning(delta) => {
                        acc.saw_chunk = true;
                        acc.reasoning.push_str(&delta);
                        sink(RenderEvent::ReasoningDelta(delta));
                    }
                    TransportChunk::Content(delta) => {
                        acc.saw_chunk = true;
                        acc.content.push_str(&delta);
                        sink(RenderEvent::ContentDelta(delta));
                    }
                    TransportChunk::ToolCallFragment {
                        id,
                        name,
                        arguments,
                    } => {
                        acc.saw_chunk = true;
                        acc.merge_fragment(id, name, arguments);
                    }
                    TransportChunk::Done { finish_reason } => {
                        if let Some(reason) = finish_reason {
                            acc.finish_reason = Some(reason);
                        }
                    }
                }
            });
            if acc.saw_chunk {
                self.state = SessionState::Streaming;
            }

            if cancel.is_triggered() {
                self.state = SessionState::Cancelled;
                return SessionOutcome::Cancelled {
                    partial: acc.content,
                };
            }

            match result {
                Ok(()) => {
                    self.state = SessionState::Completed;
                    return SessionOutcome::Completed(acc.into_turn());
                }
                Err(error) => {
                    if acc.saw_chunk {
                        // Partial output already rendered: surface as terminal
                        // regardless of the underlying failure class.
                        self.state = SessionState::Errored;
                        return SessionOutcome::Errored {
                            error: TransportError::Terminal(format!(
                                "stream interrupted after partial output: {error}"
                            )),
                            partial: acc.content,
                        };
                    }
                    match error {
                        TransportError::Transient {
                            ref retry_after, ..
                        } if attempt < self.retry.max_retries => {
                            thread::sleep(retry_delay(
                                self.retry.base_delay_ms,
                                attempt,
                                *retry_after,
                            ));
                            attempt = attempt.saturating_add(1);
                        }
                        other => {
                            self.state = SessionState::Errored;
                            return SessionOutcome::Errored {
                                error: other,
                                partial: String::new(),
                            };
                        }
                    }
                }
            }
        }
    }
}
