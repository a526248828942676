//! Conversation messages.
//!
//! A conversation is an ordered, append-only list of [`Message`] values owned
//! by the orchestrator. Messages are never mutated after append; context
//! selection is a read-time projection over the list.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A single model-requested function invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCallRequest {
    pub id: String,
    pub name: String,
    /// Raw JSON argument payload, exactly as assembled from the stream.
    pub arguments: String,
}

/// User message content: plain text, or an ordered list of parts for
/// multimodal turns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum UserContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    Image { mime: String, base64_data: String },
}

/// Role-tagged message body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "lowercase")]
pub enum MessageBody {
    User {
        content: UserContent,
    },
    Assistant {
        #[serde(skip_serializing_if = "Option::is_none", default)]
        content: Option<String>,
        /// Chain-of-thought text from a thinking-capable model. Kept for
        /// display; not replayed to the transport on later turns.
        #[serde(skip_serializing_if = "Option::is_none", default)]
        reasoning: Option<String>,
        #[serde(skip_serializing_if = "Vec::is_empty", default)]
        tool_calls: Vec<ToolCallRequest>,
    },
    Tool {
        tool_call_id: String,
        content: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    #[serde(flatten)]
    pub body: MessageBody,
}

impl Message {
    fn with_body(body: MessageBody) -> Self {
        Self {
            id: Uuid::now_v7(),
            created_at: Utc::now(),
            body,
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::with_body(MessageBody::User {
            content: UserContent::Text(text.into()),
        })
    }

    pub fn user_with_parts(parts: Vec<ContentPart>) -> Self {
        Self::with_body(MessageBody::User {
            content: UserContent::Parts(parts),
        })
    }

    pub fn assistant(
        content: Option<String>,
        reasoning: Option<String>,
        tool_calls: Vec<ToolCallRequest>,
    ) -> Self {
        Self::with_body(MessageBody::Assistant {
            content,
            reasoning,
            tool_calls,
        })
    }

    pub fn tool_result(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self::with_body(MessageBody::Tool {
            tool_call_id: tool_call_id.into(),
            content: content.into(),
        })
    }

    #[must_use]
    pub fn is_user(&self) -> bool {
        matches!(self.body, MessageBody::User { .. })
    }

    #[must_use]
    pub fn is_tool(&self) -> bool {
        matches!(self.body, MessageBody::Tool { .. })
    }

    /// Tool calls requested by this message (empty for non-assistant roles).
    #[must_use]
    pub fn tool_calls(&self) -> &[ToolCallRequest] {
        match &self.body {
            MessageBody::Assistant { tool_calls, .. } => tool_calls,
            _ => &[],
        }
    }
}

/// Check the assistant/tool pairing invariant over an ordered history.
///
/// A tool message must directly follow an assistant message bearing tool
/// calls, and the tool messages following that assistant must resolve its
/// requested ids exactly (a complete permutation, no extras, no repeats)
/// before any other message appears. Returns a description of the first
/// violation, or `None` when the history is well formed.
pub fn pairing_violation(history: &[Message]) -> Option<String> {
    let mut pending: Vec<String> = Vec::new();

    for (idx, msg) in history.iter().enumerate() {
        match &msg.body {
            MessageBody::Tool { tool_call_id, .. } => {
                let Some(pos) = pending.iter().position(|id| id == tool_call_id) else {
                    return Some(format!(
                        "message {idx}: tool result '{tool_call_id}' has no pending tool call"
                    ));
                };
                pending.remove(pos);
            }
            _ if !pending.is_empty() => {
                return Some(format!(
                    "message {idx}: tool call group left unresolved ids {pending:?}"
                ));
            }
            MessageBody::Assistant { tool_calls, .. } => {
                pending = tool_calls.iter().map(|tc| tc.id.clone()).collect();
            }
            MessageBody::User { .. } => {}
        }
    }

    if pending.is_empty() {
        None
    } else {
        Some(format!("history ends with unresolved tool call ids {pending:?}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call(id: &str) -> ToolCallRequest {
        ToolCallRequest {
            id: id.to_string(),
            name: "fs_list".to_string(),
            arguments: "{}".to_string(),
        }
    }

    #[test]
    fn well_formed_history_passes() {
        let history = vec![
            Message::user("list files"),
            Message::assistant(None, None, vec![call("a"), call("b")]),
            Message::tool_result("b", "two"),
            Message::tool_result("a", "one"),
            Message::assistant(Some("done".into()), None, vec![]),
        ];
        assert_eq!(pairing_violation(&history), None);
    }

    #[test]
    fn orphan_tool_result_is_flagged() {
        let history = vec![Message::user("hi"), Message::tool_result("x", "out")];
        assert!(pairing_violation(&history).is_some());
    }

    #[test]
    fn incomplete_group_before_user_is_flagged() {
        let history = vec![
            Message::user("go"),
            Message::assistant(None, None, vec![call("a"), call("b")]),
            Message::tool_result("a", "one"),
            Message::user("next"),
        ];
        let violation = pairing_violation(&history).expect("violation");
        assert!(violation.contains("unresolved"));
    }

    #[test]
    fn trailing_incomplete_group_is_flagged() {
        let history = vec![
            Message::user("go"),
            Message::assistant(None, None, vec![call("a")]),
        ];
        assert!(pairing_violation(&history).is_some());
    }

    #[test]
    fn message_roundtrips_through_serde() {
        let msg = Message::assistant(Some("hi".into()), None, vec![call("a")]);
        let json = serde_json::to_string(&msg).expect("serialize");
        assert!(json.contains("\"role\":\"assistant\""));
        let back: Message = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, msg);
    }
}
