//! The per-turn control loop.
//!
//! `submit_turn` appends the user message and drives
//! `ContextBuilding → Streaming → ToolDispatch` iterations until the model
//! answers without tool calls, the user cancels, an unrecoverable transport
//! error surfaces, or the iteration guard trips. The conversation is
//! append-only and mutated only here; context selection is rebuilt from the
//! full history on every iteration.

use crate::dispatcher::{ToolCallRecord, ToolDispatcher};
use anyhow::{Result, bail};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use tether_context::{BuiltContext, ContextBudget, Summarizer, build_context};
use tether_core::{
    CancelToken, ConfirmationHandler, ContentPart, EngineConfig, Message, RenderEvent, RenderSink,
    ToolChoice, ToolDefinition, ToolHost,
};
use tether_llm::{ModelTransport, RetryPolicy, SessionOutcome, StreamingSession};
use tether_observe::{EngineEvent, Observer};
use tether_policy::PolicyStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TurnPhase {
    Idle = 0,
    ContextBuilding = 1,
    Streaming = 2,
    ToolDispatch = 3,
}

impl TurnPhase {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::ContextBuilding,
            2 => Self::Streaming,
            3 => Self::ToolDispatch,
            _ => Self::Idle,
        }
    }
}

/// Why the turn reached Idle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnFinish {
    Completed,
    Cancelled,
    MaxIterations,
}

impl TurnFinish {
    fn as_str(self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::MaxIterations => "max_iterations",
        }
    }
}

/// Result of one turn.
#[derive(Debug)]
pub struct TurnOutcome {
    /// Final (or partial, when cancelled) assistant text.
    pub response: String,
    pub finish: TurnFinish,
    /// Model exchanges performed.
    pub iterations: u64,
    pub tool_calls: Vec<ToolCallRecord>,
}

/// Cloneable handle for interrupting the active turn from another thread.
/// Only honored during `Streaming` and `ToolDispatch`.
#[derive(Clone)]
pub struct CancelHandle {
    phase: Arc<AtomicU8>,
    active: Arc<Mutex<CancelToken>>,
}

impl CancelHandle {
    /// Trigger cancellation. Returns whether the request was honored.
    pub fn cancel(&self) -> bool {
        match TurnPhase::from_u8(self.phase.load(Ordering::SeqCst)) {
            TurnPhase::Streaming | TurnPhase::ToolDispatch => {
                self.active.lock().unwrap().trigger();
                true
            }
            _ => false,
        }
    }
}

pub struct Orchestrator {
    cfg: EngineConfig,
    transport: Arc<dyn ModelTransport + Send + Sync>,
    host: Arc<dyn ToolHost + Send + Sync>,
    policy: Mutex<PolicyStore>,
    confirmer: Option<ConfirmationHandler>,
    summarizer: Option<Box<dyn Summarizer + Send + Sync>>,
    observer: Observer,
    sink: RenderSink,
    system_preamble: String,
    conversation: Mutex<Vec<Message>>,
    phase: Arc<AtomicU8>,
    active_cancel: Arc<Mutex<CancelToken>>,
    in_flight: AtomicBool,
}

impl Orchestrator {
    pub fn new(
        workspace: &Path,
        cfg: EngineConfig,
        transport: Arc<dyn ModelTransport + Send + Sync>,
        host: Arc<dyn ToolHost + Send + Sync>,
        sink: RenderSink,
    ) -> Result<Self> {
        Ok(Self {
            cfg,
            transport,
            host,
            policy: Mutex::new(PolicyStore::load(workspace)),
            confirmer: None,
            summarizer: None,
            observer: Observer::new(workspace)?,
            sink,
            system_preamble: String::new(),
            conversation: Mutex::new(Vec::new()),
            phase: Arc::new(AtomicU8::new(TurnPhase::Idle as u8)),
            active_cancel: Arc::new(Mutex::new(CancelToken::new())),
            in_flight: AtomicBool::new(false),
        })
    }

    pub fn with_system_preamble(mut self, preamble: impl Into<String>) -> Self {
        self.system_preamble = preamble.into();
        self
    }

    pub fn with_confirmer(mut self, confirmer: ConfirmationHandler) -> Self {
        self.confirmer = Some(confirmer);
        self
    }

    pub fn with_summarizer(mut self, summarizer: Box<dyn Summarizer + Send + Sync>) -> Self {
        self.summarizer = Some(summarizer);
        self
    }

    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.observer.set_verbose(verbose);
        self
    }

    #[must_use]
    pub fn phase(&self) -> TurnPhase {
        TurnPhase::from_u8(self.phase.load(Ordering::SeqCst))
    }

    /// Snapshot of the full conversation, for display.
    #[must_use]
    pub fn conversation(&self) -> Vec<Message> {
        self.conversation.lock().unwrap().clone()
    }

    #[must_use]
    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle {
            phase: Arc::clone(&self.phase),
            active: Arc::clone(&self.active_cancel),
        }
    }

    /// Run one turn to a terminal state. Rejected while another turn is in
    /// flight.
    pub fn submit_turn(&self, text: &str, attachments: Vec<ContentPart>) -> Result<TurnOutcome> {
        if self.in_flight.swap(true, Ordering::SeqCst) {
            bail!("a turn is already in flight");
        }
        let result = self.drive_turn(text, attachments);
        self.set_phase(TurnPhase::Idle);
        self.in_flight.store(false, Ordering::SeqCst);
        result
    }

    fn drive_turn(&self, text: &str, attachments: Vec<ContentPart>) -> Result<TurnOutcome> {
        let token = CancelToken::new();
        *self.active_cancel.lock().unwrap() = token.clone();

        self.record(EngineEvent::TurnStarted {
            preview: truncate(text, 80),
        });

        let user_message = if attachments.is_empty() {
            Message::user(text)
        } else {
            let mut parts = vec![ContentPart::Text {
                text: text.to_string(),
            }];
            parts.extend(attachments);
            Message::user_with_parts(parts)
        };
        self.append(user_message);

        let tool_definitions: Vec<ToolDefinition> = self
            .host
            .capabilities()
            .iter()
            .map(|spec| spec.to_definition())
            .collect();
        let dispatcher = ToolDispatcher::new(
            &*self.host,
            &self.policy,
            self.confirmer.as_ref(),
            &self.sink,
        );
        let budget = ContextBudget::from(&self.cfg.context);
        let summarizer: Option<&dyn Summarizer> = match &self.summarizer {
            Some(s) => Some(s.as_ref()),
            None => None,
        };

        let mut iterations: u64 = 0;
        let mut records: Vec<ToolCallRecord> = Vec::new();

        loop {
            if iterations >= self.cfg.turn_loop.max_iterations {
                (self.sink)(RenderEvent::Done {
                    reason: Some("max iterations reached".to_string()),
                });
                return Ok(self.finish(TurnFinish::MaxIterations, String::new(), iterations, records));
            }
            iterations += 1;

            self.set_phase(TurnPhase::ContextBuilding);
            let built = {
                let conversation = self.conversation.lock().unwrap();
                build_context(&self.system_preamble, &conversation, &budget, summarizer)
            };
            self.record(EngineEvent::ContextBuilt {
                selected: built.selected.len(),
                dropped: built.dropped,
                estimated_tokens: built.estimated_tokens,
                summarized: built.summary.is_some(),
                budget_exceeded: built.budget_exceeded,
            });
            if built.preamble_overflow {
                self.observer
                    .warn_log("system preamble exceeds the context window; sending without history");
            }

            let request = tether_core::ChatRequest {
                model: self.cfg.llm.model.clone(),
                system: compose_system(&built),
                messages: built.selected,
                tools: tool_definitions.clone(),
                tool_choice: ToolChoice::auto(),
                max_tokens: self.cfg.llm.max_output_tokens,
                temperature: self.cfg.llm.temperature,
            };

            self.set_phase(TurnPhase::Streaming);
            let session =
                StreamingSession::new(&*self.transport, RetryPolicy::from(&self.cfg.llm));
            match session.run(&request, &token, &self.sink) {
                SessionOutcome::Cancelled { partial } => {
                    if !partial.is_empty() {
                        self.append(Message::assistant(Some(partial.clone()), None, vec![]));
                    }
                    (self.sink)(RenderEvent::Cancelled);
                    self.record(EngineEvent::SessionCancelled);
                    return Ok(self.finish(TurnFinish::Cancelled, partial, iterations, records));
                }
                SessionOutcome::Errored { error, partial } => {
                    if !partial.is_empty() {
                        self.append(Message::assistant(Some(partial), None, vec![]));
                    }
                    (self.sink)(RenderEvent::TurnError {
                        message: error.to_string(),
                    });
                    self.record(EngineEvent::SessionErrored {
                        message: error.to_string(),
                    });
                    return Err(error.into());
                }
                SessionOutcome::Completed(turn) => {
                    self.record(EngineEvent::SessionCompleted {
                        finish_reason: turn.finish_reason.clone(),
                        tool_calls: turn.tool_calls.len(),
                    });

                    if turn.tool_calls.is_empty() {
                        let response = turn.content.clone();
                        self.append(Message::assistant(
                            non_empty(turn.content),
                            non_empty(turn.reasoning),
                            vec![],
                        ));
                        (self.sink)(RenderEvent::Done { reason: None });
                        return Ok(self.finish(TurnFinish::Completed, response, iterations, records));
                    }

                    self.append(Message::assistant(
                        non_empty(turn.content.clone()),
                        non_empty(turn.reasoning),
                        turn.tool_calls.clone(),
                    ));

                    self.set_phase(TurnPhase::ToolDispatch);
                    let dispatched = dispatcher.dispatch(&turn.tool_calls, &token);
                    for record in &dispatched.records {
                        self.record(EngineEvent::ToolDispatched {
                            name: record.tool_name.clone(),
                            success: record.success,
                            duration_ms: record.duration_ms,
                        });
                    }
                    // Results land in call order, directly after the
                    // assistant message that requested them.
                    self.conversation
                        .lock()
                        .unwrap()
                        .extend(dispatched.results);
                    records.extend(dispatched.records);

                    if dispatched.cancelled || token.is_triggered() {
                        (self.sink)(RenderEvent::Cancelled);
                        return Ok(self.finish(
                            TurnFinish::Cancelled,
                            turn.content,
                            iterations,
                            records,
                        ));
                    }
                }
            }
        }
    }

    fn finish(
        &self,
        finish: TurnFinish,
        response: String,
        iterations: u64,
        tool_calls: Vec<ToolCallRecord>,
    ) -> TurnOutcome {
        self.record(EngineEvent::TurnFinished {
            finish: finish.as_str().to_string(),
            iterations,
        });
        TurnOutcome {
            response,
            finish,
            iterations,
            tool_calls,
        }
    }

    fn append(&self, message: Message) {
        self.conversation.lock().unwrap().push(message);
    }

    fn set_phase(&self, phase: TurnPhase) {
        self.phase.store(phase as u8, Ordering::SeqCst);
    }

    fn record(&self, event: EngineEvent) {
        if let Err(err) = self.observer.record(&event) {
            self.observer.verbose_log(&format!("event log write failed: {err}"));
        }
    }
}

fn compose_system(built: &BuiltContext) -> String {
    match &built.summary {
        Some(summary) => format!(
            "{}\n\n## Earlier conversation (summarized)\n{summary}",
            built.system
        ),
        None => built.system.clone(),
    }
}

fn non_empty(text: String) -> Option<String> {
    if text.is_empty() { None } else { Some(text) }
}

fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let cut: String = text.chars().take(max).collect();
    format!("{cut}...")
}
