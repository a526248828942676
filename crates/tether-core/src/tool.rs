//! Tool capability registry and confirmation collaborator interfaces.

use crate::request::ToolDefinition;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// A capability exposed by the external tool registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapabilitySpec {
    pub name: String,
    pub description: String,
    /// JSON Schema for the argument payload.
    pub parameters: serde_json::Value,
    /// Whether user approval must precede invocation (overridable by a
    /// persisted "don't ask again" decision).
    pub requires_confirmation: bool,
}

impl CapabilitySpec {
    /// Wire-level function definition for this capability.
    #[must_use]
    pub fn to_definition(&self) -> ToolDefinition {
        ToolDefinition::function(
            self.name.clone(),
            self.description.clone(),
            self.parameters.clone(),
        )
    }
}

/// The external capability registry: the dispatcher resolves and invokes
/// tools through this seam and never knows their implementations.
pub trait ToolHost {
    fn capabilities(&self) -> Vec<CapabilitySpec>;
    fn invoke(&self, name: &str, args: &serde_json::Value) -> anyhow::Result<serde_json::Value>;
}

/// A pending confirmation shown to the user before a tool runs.
#[derive(Debug, Clone)]
pub struct ConfirmationRequest {
    pub capability: String,
    /// Human-readable argument preview (e.g. `path="src/main.rs"`).
    pub preview: String,
}

/// The user's decision for one pending tool call.
#[derive(Debug, Clone, Copy)]
pub struct ConfirmationDecision {
    pub approved: bool,
    /// Persist this approval as policy for the capability.
    pub remember: bool,
}

impl ConfirmationDecision {
    #[must_use]
    pub fn approve() -> Self {
        Self {
            approved: true,
            remember: false,
        }
    }

    #[must_use]
    pub fn deny() -> Self {
        Self {
            approved: false,
            remember: false,
        }
    }

    #[must_use]
    pub fn always_allow() -> Self {
        Self {
            approved: true,
            remember: true,
        }
    }
}

/// Callback producing a [`ConfirmationDecision`] for a pending tool call.
pub type ConfirmationHandler =
    Arc<dyn Fn(&ConfirmationRequest) -> ConfirmationDecision + Send + Sync>;
