//! Shared test scaffolding: temp workspaces, a scripted model transport, a
//! recording render sink, and a mock capability registry.

use anyhow::Result;
use serde_json::{Value, json};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use tether_core::{
    CancelToken, CapabilitySpec, ChatRequest, RenderEvent, RenderSink, ToolHost, TransportChunk,
    TransportError,
};
use tether_llm::ModelTransport;

/// Fresh workspace directory for a test.
pub fn temp_workspace() -> Result<TempDir> {
    Ok(tempfile::tempdir()?)
}

/// One scripted transport exchange.
pub struct ScriptedExchange {
    pub chunks: Vec<TransportChunk>,
    pub result: Result<(), TransportError>,
}

impl ScriptedExchange {
    /// A plain text completion.
    pub fn text(content: &str) -> Self {
        Self {
            chunks: vec![
                TransportChunk::Content(content.to_string()),
                TransportChunk::Done {
                    finish_reason: Some("stop".to_string()),
                },
            ],
            result: Ok(()),
        }
    }

    /// A completion requesting a single tool call.
    pub fn tool_call(id: &str, name: &str, arguments: &str) -> Self {
        Self {
            chunks: vec![
                TransportChunk::ToolCallFragment {
                    id: Some(id.to_string()),
                    name: Some(name.to_string()),
                    arguments: arguments.to_string(),
                },
                TransportChunk::Done {
                    finish_reason: Some("tool_calls".to_string()),
                },
            ],
            result: Ok(()),
        }
    }

    /// A completion requesting several tool calls at once.
    pub fn tool_calls(calls: &[(&str, &str, &str)]) -> Self {
        let mut chunks: Vec<TransportChunk> = calls
            .iter()
            .map(|(id, name, arguments)| TransportChunk::ToolCallFragment {
                id: Some((*id).to_string()),
                name: Some((*name).to_string()),
                arguments: (*arguments).to_string(),
            })
            .collect();
        chunks.push(TransportChunk::Done {
            finish_reason: Some("tool_calls".to_string()),
        });
        Self {
            chunks,
            result: Ok(()),
        }
    }

    /// A failed exchange emitting no chunks.
    pub fn failure(error: TransportError) -> Self {
        Self {
            chunks: vec![],
            result: Err(error),
        }
    }
}

/// Transport replaying a queue of scripted exchanges; records every request
/// it receives.
pub struct ScriptedTransport {
    exchanges: Mutex<VecDeque<ScriptedExchange>>,
    requests: Mutex<Vec<ChatRequest>>,
}

impl ScriptedTransport {
    pub fn new(exchanges: Vec<ScriptedExchange>) -> Self {
        Self {
            exchanges: Mutex::new(VecDeque::from(exchanges)),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Requests seen so far, in order.
    pub fn requests(&self) -> Vec<ChatRequest> {
        self.requests.lock().unwrap().clone()
    }
}

impl ModelTransport for ScriptedTransport {
    fn open(
        &self,
        req: &ChatRequest,
        cancel: &CancelToken,
        sink: &mut dyn FnMut(TransportChunk),
    ) -> Result<(), TransportError> {
        self.requests.lock().unwrap().push(req.clone());
        let exchange = self
            .exchanges
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| TransportError::Terminal("no scripted exchange left".to_string()))?;
        for chunk in exchange.chunks {
            if cancel.is_triggered() {
                return Ok(());
            }
            sink(chunk);
        }
        exchange.result
    }
}

/// Render sink that records every event for later assertions.
#[derive(Clone, Default)]
pub struct RecordingSink {
    events: Arc<Mutex<Vec<RenderEvent>>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sink(&self) -> RenderSink {
        let events = Arc::clone(&self.events);
        Arc::new(move |event| events.lock().unwrap().push(event))
    }

    pub fn events(&self) -> Vec<RenderEvent> {
        self.events.lock().unwrap().clone()
    }
}

/// Capability registry backed by scripted results; records invocations.
pub struct MockToolHost {
    capabilities: Vec<CapabilitySpec>,
    results: Mutex<VecDeque<Result<Value>>>,
    invocations: Mutex<Vec<(String, Value)>>,
}

impl MockToolHost {
    pub fn new(capabilities: Vec<CapabilitySpec>) -> Self {
        Self {
            capabilities,
            results: Mutex::new(VecDeque::new()),
            invocations: Mutex::new(Vec::new()),
        }
    }

    /// Queue the result returned by the next invocation.
    pub fn push_result(&self, result: Result<Value>) {
        self.results.lock().unwrap().push_back(result);
    }

    /// Invocations seen so far as `(name, args)` pairs.
    pub fn invocations(&self) -> Vec<(String, Value)> {
        self.invocations.lock().unwrap().clone()
    }

    /// A permissive capability spec accepting any object argument.
    pub fn capability(name: &str, requires_confirmation: bool) -> CapabilitySpec {
        CapabilitySpec {
            name: name.to_string(),
            description: format!("test capability {name}"),
            parameters: json!({"type": "object"}),
            requires_confirmation,
        }
    }
}

impl ToolHost for MockToolHost {
    fn capabilities(&self) -> Vec<CapabilitySpec> {
        self.capabilities.clone()
    }

    fn invoke(&self, name: &str, args: &Value) -> Result<Value> {
        self.invocations
            .lock()
            .unwrap()
            .push((name.to_string(), args.clone()));
        self.results
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(json!({"ok": true})))
    }
}
