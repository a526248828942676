//! Shared data model for the Tether engine: conversation messages, wire
//! request types, tool capability traits, the cancellation token, the
//! transport error taxonomy, token estimation, and layered configuration.

pub mod cancel;
pub mod config;
pub mod error;
pub mod estimate;
pub mod message;
pub mod request;
pub mod tool;

pub use cancel::CancelToken;
pub use config::{
    ContextConfig, EngineConfig, LlmConfig, LoopConfig, UiPreferences, runtime_dir,
};
pub use error::TransportError;
pub use estimate::{estimate_message, estimate_messages, estimate_text};
pub use message::{
    ContentPart, Message, MessageBody, ToolCallRequest, UserContent, pairing_violation,
};
pub use request::{
    AssistantTurn, ChatRequest, FunctionDefinition, RenderEvent, RenderSink, ToolChoice,
    ToolDefinition, TransportChunk, null_sink,
};
pub use tool::{
    CapabilitySpec, ConfirmationDecision, ConfirmationHandler, ConfirmationRequest, ToolHost,
};

pub type Result<T> = anyhow::Result<T>;
