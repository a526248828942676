//! Wire-facing request types and the event stream surfaced to the UI.

use crate::message::{Message, ToolCallRequest};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// A tool (function) definition sent to the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    #[serde(rename = "type")]
    pub tool_type: String,
    pub function: FunctionDefinition,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionDefinition {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

impl ToolDefinition {
    pub fn function(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: serde_json::Value,
    ) -> Self {
        Self {
            tool_type: "function".to_string(),
            function: FunctionDefinition {
                name: name.into(),
                description: description.into(),
                parameters,
            },
        }
    }
}

/// Controls how the model picks tools.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ToolChoice {
    /// "none", "auto", or "required".
    Mode(String),
}

impl ToolChoice {
    pub fn auto() -> Self {
        Self::Mode("auto".to_string())
    }
    pub fn none() -> Self {
        Self::Mode("none".to_string())
    }
    pub fn required() -> Self {
        Self::Mode("required".to_string())
    }
}

/// One bounded request to the model transport: the composed system preamble
/// plus the selected history window.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub model: String,
    pub system: String,
    pub messages: Vec<Message>,
    pub tools: Vec<ToolDefinition>,
    pub tool_choice: ToolChoice,
    pub max_tokens: u32,
    pub temperature: Option<f32>,
}

/// The fully assembled result of one streaming exchange.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AssistantTurn {
    pub content: String,
    pub reasoning: String,
    pub tool_calls: Vec<ToolCallRequest>,
    pub finish_reason: String,
}

/// A raw chunk pushed by the model transport as it arrives off the wire.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportChunk {
    /// A reasoning/thinking text delta.
    Reasoning(String),
    /// A content text delta.
    Content(String),
    /// An incremental piece of a tool call. `id`/`name` arrive on the first
    /// fragment of a call; later fragments typically carry only argument text.
    ToolCallFragment {
        id: Option<String>,
        name: Option<String>,
        arguments: String,
    },
    /// End of stream.
    Done { finish_reason: Option<String> },
}

/// Ordered UI events. The engine never formats for a terminal; the consumer
/// owning the sink decides how each event is rendered.
#[derive(Debug, Clone, PartialEq)]
pub enum RenderEvent {
    ReasoningDelta(String),
    ContentDelta(String),
    ToolCallStart {
        name: String,
        preview: String,
    },
    ToolCallEnd {
        name: String,
        duration_ms: u64,
        success: bool,
        summary: String,
    },
    TurnError {
        message: String,
    },
    Cancelled,
    Done {
        reason: Option<String>,
    },
}

/// Callback receiving render events. `Arc<dyn Fn>` so it can be cloned across
/// the turn loop and the streaming session.
pub type RenderSink = Arc<dyn Fn(RenderEvent) + Send + Sync>;

/// A sink that discards every event.
pub fn null_sink() -> RenderSink {
    Arc::new(|_| {})
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_choice_serializes_as_bare_mode() {
        let json = serde_json::to_string(&ToolChoice::auto()).expect("serialize");
        assert_eq!(json, "\"auto\"");
    }

    #[test]
    fn tool_definition_carries_function_tag() {
        let def = ToolDefinition::function(
            "fs_list",
            "List directory entries",
            serde_json::json!({"type": "object"}),
        );
        let json = serde_json::to_value(&def).expect("serialize");
        assert_eq!(json["type"], "function");
        assert_eq!(json["function"]["name"], "fs_list");
    }
}
