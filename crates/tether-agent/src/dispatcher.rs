//! Tool dispatch.
//!
//! Processes the tool-call batch from a completed assistant turn strictly in
//! the order received. Every call yields exactly one tool-result message —
//! parse failures, unknown capabilities, schema violations, user denials,
//! execution errors, and cancellation all become error results that feed back
//! into the model on the next loop iteration. Nothing here aborts the batch.

use std::sync::Mutex;
use std::time::Instant;
use tether_core::{
    CancelToken, CapabilitySpec, ConfirmationDecision, ConfirmationHandler, ConfirmationRequest,
    Message, RenderEvent, RenderSink, ToolCallRequest, ToolHost,
};
use tether_policy::PolicyStore;

/// Record of a single dispatched call, for per-turn accounting.
#[derive(Debug, Clone)]
pub struct ToolCallRecord {
    pub tool_name: String,
    pub tool_call_id: String,
    pub preview: String,
    pub success: bool,
    pub duration_ms: u64,
}

/// Result of dispatching one batch.
#[derive(Debug, Default)]
pub struct DispatchOutcome {
    /// Tool-result messages, one per call, in call order.
    pub results: Vec<Message>,
    pub records: Vec<ToolCallRecord>,
    /// The batch was cut short by cancellation; the tail calls carry
    /// cancelled error results.
    pub cancelled: bool,
}

struct CallExecution {
    success: bool,
    content: String,
    summary: String,
    preview: String,
}

impl CallExecution {
    fn failure(content: impl Into<String>, summary: &str, preview: String) -> Self {
        Self {
            success: false,
            content: content.into(),
            summary: summary.to_string(),
            preview,
        }
    }
}

pub struct ToolDispatcher<'a> {
    host: &'a dyn ToolHost,
    policy: &'a Mutex<PolicyStore>,
    confirmer: Option<&'a ConfirmationHandler>,
    sink: &'a RenderSink,
    /// Capability specs with their compiled argument validators, fetched once
    /// per dispatcher. A schema that fails to compile skips validation.
    capabilities: Vec<(CapabilitySpec, Option<jsonschema::Validator>)>,
}

impl<'a> ToolDispatcher<'a> {
    pub fn new(
        host: &'a dyn ToolHost,
        policy: &'a Mutex<PolicyStore>,
        confirmer: Option<&'a ConfirmationHandler>,
        sink: &'a RenderSink,
    ) -> Self {
        let capabilities = host
            .capabilities()
            .into_iter()
            .map(|spec| {
                let validator = jsonschema::validator_for(&spec.parameters).ok();
                (spec, validator)
            })
            .collect();
        Self {
            host,
            policy,
            confirmer,
            sink,
            capabilities,
        }
    }

    /// Process the batch in order, producing one result message per call.
    pub fn dispatch(&self, calls: &[ToolCallRequest], cancel: &CancelToken) -> DispatchOutcome {
        let mut out = DispatchOutcome::default();

        for call in calls {
            let started = Instant::now();

            let execution = if cancel.is_triggered() {
                out.cancelled = true;
                CallExecution::failure(
                    "Tool call cancelled by user before execution.",
                    "cancelled",
                    String::new(),
                )
            } else {
                self.run_call(call)
            };

            let duration_ms = started.elapsed().as_millis() as u64;
            (self.sink)(RenderEvent::ToolCallEnd {
                name: call.name.clone(),
                duration_ms,
                success: execution.success,
                summary: execution.summary.clone(),
            });

            out.results
                .push(Message::tool_result(call.id.clone(), execution.content));
            out.records.push(ToolCallRecord {
                tool_name: call.name.clone(),
                tool_call_id: call.id.clone(),
                preview: execution.preview,
                success: execution.success,
                duration_ms,
            });
        }

        out
    }

    fn run_call(&self, call: &ToolCallRequest) -> CallExecution {
        // Parse the raw argument payload first; the preview for render events
        // and confirmation prompts comes from the parsed form.
        let args: serde_json::Value = if call.arguments.trim().is_empty() {
            serde_json::json!({})
        } else {
            match serde_json::from_str(&call.arguments) {
                Ok(value) => value,
                Err(err) => {
                    let preview = truncate(&call.arguments, 60);
                    (self.sink)(RenderEvent::ToolCallStart {
                        name: call.name.clone(),
                        preview: preview.clone(),
                    });
                    return CallExecution::failure(
                        format!(
                            "Invalid JSON arguments for '{}': {err}. Resend the call with valid JSON.",
                            call.name
                        ),
                        "invalid arguments",
                        preview,
                    );
                }
            }
        };

        let preview = preview_args(&args);
        (self.sink)(RenderEvent::ToolCallStart {
            name: call.name.clone(),
            preview: preview.clone(),
        });

        let Some((spec, validator)) = self
            .capabilities
            .iter()
            .find(|(spec, _)| spec.name == call.name)
        else {
            let known: Vec<&str> = self
                .capabilities
                .iter()
                .map(|(spec, _)| spec.name.as_str())
                .collect();
            return CallExecution::failure(
                format!(
                    "Unknown tool '{}'. Available tools: {}.",
                    call.name,
                    known.join(", ")
                ),
                "unknown tool",
                preview,
            );
        };

        if let Some(validator) = validator
            && let Err(err) = validator.validate(&args)
        {
            return CallExecution::failure(
                format!(
                    "Arguments for '{}' do not match the tool schema: {err}. Fix the arguments and retry.",
                    call.name
                ),
                "schema mismatch",
                preview,
            );
        }

        let needs_confirmation = self
            .policy
            .lock()
            .unwrap()
            .requires_confirmation(&spec.name, spec.requires_confirmation);
        if needs_confirmation {
            let decision = match self.confirmer {
                Some(handler) => handler(&ConfirmationRequest {
                    capability: spec.name.clone(),
                    preview: preview.clone(),
                }),
                // No handler wired: deny by default in non-interactive mode.
                None => ConfirmationDecision::deny(),
            };
            if decision.approved && decision.remember {
                let _ = self.policy.lock().unwrap().remember_approval(&spec.name);
            }
            if !decision.approved {
                return CallExecution::failure(
                    "Tool call denied by user. Try a different approach or ask the user for guidance.",
                    "denied",
                    preview,
                );
            }
        }

        match self.host.invoke(&spec.name, &args) {
            Ok(output) => {
                let content = match output {
                    serde_json::Value::String(text) => text,
                    other => other.to_string(),
                };
                CallExecution {
                    success: true,
                    content,
                    summary: "ok".to_string(),
                    preview,
                }
            }
            Err(err) => CallExecution::failure(
                format!("Tool '{}' failed: {err}", call.name),
                "error",
                preview,
            ),
        }
    }
}

/// Short `key="value"` preview of tool arguments for display and
/// confirmation prompts.
pub fn preview_args(args: &serde_json::Value) -> String {
    let mut parts = Vec::new();
    if let Some(obj) = args.as_object() {
        for (key, value) in obj {
            let short = match value {
                serde_json::Value::String(s) => format!("{key}={}", quoted(s)),
                serde_json::Value::Number(n) => format!("{key}={n}"),
                serde_json::Value::Bool(b) => format!("{key}={b}"),
                _ => format!("{key}=..."),
            };
            parts.push(short);
        }
    }
    if parts.is_empty() {
        return "()".to_string();
    }
    parts.join(", ")
}

fn quoted(value: &str) -> String {
    format!("\"{}\"", truncate(value, 57))
}

fn truncate(value: &str, max: usize) -> String {
    if value.chars().count() <= max {
        return value.to_string();
    }
    let cut: String = value.chars().take(max).collect();
    format!("{cut}...")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;
    use tether_core::MessageBody;
    use tether_testkit::{MockToolHost, RecordingSink, temp_workspace};

    fn call(id: &str, name: &str, arguments: &str) -> ToolCallRequest {
        ToolCallRequest {
            id: id.to_string(),
            name: name.to_string(),
            arguments: arguments.to_string(),
        }
    }

    fn tool_content(msg: &Message) -> &str {
        match &msg.body {
            MessageBody::Tool { content, .. } => content,
            other => panic!("expected tool message, got {other:?}"),
        }
    }

    fn tool_call_id(msg: &Message) -> &str {
        match &msg.body {
            MessageBody::Tool { tool_call_id, .. } => tool_call_id,
            other => panic!("expected tool message, got {other:?}"),
        }
    }

    #[test]
    fn parse_failure_in_the_middle_keeps_order() {
        let workspace = temp_workspace().expect("workspace");
        let host = MockToolHost::new(vec![MockToolHost::capability("fs_read", false)]);
        host.push_result(Ok(json!("contents of a")));
        host.push_result(Ok(json!("contents of c")));
        let policy = Mutex::new(PolicyStore::load(workspace.path()));
        let recording = RecordingSink::new();
        let sink = recording.sink();
        let dispatcher = ToolDispatcher::new(&host, &policy, None, &sink);

        let calls = vec![
            call("a", "fs_read", r#"{"path":"a.rs"}"#),
            call("b", "fs_read", "{not json"),
            call("c", "fs_read", r#"{"path":"c.rs"}"#),
        ];
        let out = dispatcher.dispatch(&calls, &CancelToken::new());

        assert_eq!(out.results.len(), 3);
        assert_eq!(tool_call_id(&out.results[0]), "a");
        assert_eq!(tool_call_id(&out.results[1]), "b");
        assert_eq!(tool_call_id(&out.results[2]), "c");
        assert_eq!(tool_content(&out.results[0]), "contents of a");
        assert!(tool_content(&out.results[1]).contains("Invalid JSON arguments"));
        assert_eq!(tool_content(&out.results[2]), "contents of c");
        assert!(!out.records[1].success);
        assert!(out.records[0].success && out.records[2].success);
        // The failed call never reached the host.
        assert_eq!(host.invocations().len(), 2);
    }

    #[test]
    fn unknown_tool_yields_error_result_without_aborting() {
        let workspace = temp_workspace().expect("workspace");
        let host = MockToolHost::new(vec![MockToolHost::capability("fs_read", false)]);
        host.push_result(Ok(json!("ok")));
        let policy = Mutex::new(PolicyStore::load(workspace.path()));
        let recording = RecordingSink::new();
        let sink = recording.sink();
        let dispatcher = ToolDispatcher::new(&host, &policy, None, &sink);

        let calls = vec![
            call("a", "fs_teleport", "{}"),
            call("b", "fs_read", r#"{"path":"x"}"#),
        ];
        let out = dispatcher.dispatch(&calls, &CancelToken::new());

        assert!(tool_content(&out.results[0]).contains("Unknown tool 'fs_teleport'"));
        assert!(out.records[1].success);
    }

    #[test]
    fn schema_violation_is_contained_as_error_result() {
        let workspace = temp_workspace().expect("workspace");
        let mut spec = MockToolHost::capability("fs_read", false);
        spec.parameters = json!({
            "type": "object",
            "properties": {"path": {"type": "string"}},
            "required": ["path"]
        });
        let host = MockToolHost::new(vec![spec]);
        let policy = Mutex::new(PolicyStore::load(workspace.path()));
        let recording = RecordingSink::new();
        let sink = recording.sink();
        let dispatcher = ToolDispatcher::new(&host, &policy, None, &sink);

        let out = dispatcher.dispatch(&[call("a", "fs_read", r#"{"path":42}"#)], &CancelToken::new());

        assert!(tool_content(&out.results[0]).contains("do not match the tool schema"));
        assert!(host.invocations().is_empty(), "invalid call must not run");
    }

    #[test]
    fn denial_never_invokes_the_capability() {
        let workspace = temp_workspace().expect("workspace");
        let host = MockToolHost::new(vec![MockToolHost::capability("shell_run", true)]);
        let policy = Mutex::new(PolicyStore::load(workspace.path()));
        let recording = RecordingSink::new();
        let sink = recording.sink();
        let confirmer: ConfirmationHandler = Arc::new(|_req| ConfirmationDecision::deny());
        let dispatcher = ToolDispatcher::new(&host, &policy, Some(&confirmer), &sink);

        let out = dispatcher.dispatch(
            &[call("a", "shell_run", r#"{"cmd":"rm -rf /"}"#)],
            &CancelToken::new(),
        );

        assert!(tool_content(&out.results[0]).contains("denied by user"));
        assert!(!out.records[0].success);
        assert!(host.invocations().is_empty());
    }

    #[test]
    fn missing_confirmer_denies_by_default() {
        let workspace = temp_workspace().expect("workspace");
        let host = MockToolHost::new(vec![MockToolHost::capability("shell_run", true)]);
        let policy = Mutex::new(PolicyStore::load(workspace.path()));
        let recording = RecordingSink::new();
        let sink = recording.sink();
        let dispatcher = ToolDispatcher::new(&host, &policy, None, &sink);

        let out = dispatcher.dispatch(&[call("a", "shell_run", "{}")], &CancelToken::new());
        assert!(tool_content(&out.results[0]).contains("denied"));
        assert!(host.invocations().is_empty());
    }

    #[test]
    fn remembered_approval_skips_future_confirmations() {
        let workspace = temp_workspace().expect("workspace");
        let host = MockToolHost::new(vec![MockToolHost::capability("shell_run", true)]);
        let policy = Mutex::new(PolicyStore::load(workspace.path()));
        let recording = RecordingSink::new();
        let sink = recording.sink();
        let asked = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let asked_in_handler = Arc::clone(&asked);
        let confirmer: ConfirmationHandler = Arc::new(move |_req| {
            asked_in_handler.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            ConfirmationDecision::always_allow()
        });
        let dispatcher = ToolDispatcher::new(&host, &policy, Some(&confirmer), &sink);

        dispatcher.dispatch(&[call("a", "shell_run", "{}")], &CancelToken::new());
        dispatcher.dispatch(&[call("b", "shell_run", "{}")], &CancelToken::new());

        assert_eq!(asked.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert_eq!(host.invocations().len(), 2);
        // The grant survives a process restart.
        let reloaded = PolicyStore::load(workspace.path());
        assert!(!reloaded.requires_confirmation("shell_run", true));
    }

    #[test]
    fn execution_error_is_contained() {
        let workspace = temp_workspace().expect("workspace");
        let host = MockToolHost::new(vec![MockToolHost::capability("fs_read", false)]);
        host.push_result(Err(anyhow::anyhow!("permission denied")));
        let policy = Mutex::new(PolicyStore::load(workspace.path()));
        let recording = RecordingSink::new();
        let sink = recording.sink();
        let dispatcher = ToolDispatcher::new(&host, &policy, None, &sink);

        let out = dispatcher.dispatch(&[call("a", "fs_read", "{}")], &CancelToken::new());
        assert!(tool_content(&out.results[0]).contains("permission denied"));
        assert!(!out.records[0].success);
    }

    #[test]
    fn cancellation_marks_unstarted_calls_without_invoking_them() {
        let workspace = temp_workspace().expect("workspace");
        let host = MockToolHost::new(vec![MockToolHost::capability("fs_read", false)]);
        host.push_result(Ok(json!("first result")));
        let policy = Mutex::new(PolicyStore::load(workspace.path()));
        let recording = RecordingSink::new();
        let sink = recording.sink();
        let dispatcher = ToolDispatcher::new(&host, &policy, None, &sink);

        let cancel = CancelToken::new();
        // Trigger while the batch is mid-flight: the first call has already
        // run; the remaining two must be marked cancelled and skipped.
        host.push_result(Ok(json!("never used")));
        let calls = vec![
            call("a", "fs_read", "{}"),
            call("b", "fs_read", "{}"),
            call("c", "fs_read", "{}"),
        ];

        // Simulate the trigger arriving after the first invocation by
        // dispatching the head and tail separately with the same token.
        let head = dispatcher.dispatch(&calls[..1], &cancel);
        cancel.trigger();
        let tail = dispatcher.dispatch(&calls[1..], &cancel);

        assert!(!head.cancelled);
        assert!(tail.cancelled);
        assert_eq!(tail.results.len(), 2);
        assert!(tool_content(&tail.results[0]).contains("cancelled"));
        assert!(tool_content(&tail.results[1]).contains("cancelled"));
        assert_eq!(host.invocations().len(), 1);
    }

    #[test]
    fn every_call_start_precedes_its_end_event() {
        let workspace = temp_workspace().expect("workspace");
        let host = MockToolHost::new(vec![MockToolHost::capability("fs_read", false)]);
        let policy = Mutex::new(PolicyStore::load(workspace.path()));
        let recording = RecordingSink::new();
        let sink = recording.sink();
        let dispatcher = ToolDispatcher::new(&host, &policy, None, &sink);

        dispatcher.dispatch(
            &[
                call("a", "fs_read", r#"{"path":"one.rs"}"#),
                call("b", "fs_read", r#"{"path":"two.rs"}"#),
            ],
            &CancelToken::new(),
        );

        let events = recording.events();
        let kinds: Vec<&str> = events
            .iter()
            .map(|e| match e {
                RenderEvent::ToolCallStart { .. } => "start",
                RenderEvent::ToolCallEnd { .. } => "end",
                _ => "other",
            })
            .collect();
        assert_eq!(kinds, vec!["start", "end", "start", "end"]);
    }

    #[test]
    fn preview_elides_long_values() {
        let long = "x".repeat(100);
        let preview = preview_args(&json!({"path": long, "limit": 5, "flag": true}));
        assert!(preview.contains("limit=5"));
        assert!(preview.contains("flag=true"));
        assert!(preview.contains("..."));
        assert!(preview.len() < 120);
    }
}
