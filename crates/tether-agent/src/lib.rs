//! Conversation orchestration: the per-turn control loop and the tool
//! dispatcher that executes model-requested capability invocations under the
//! confirmation policy.

pub mod dispatcher;
pub mod orchestrator;

pub use dispatcher::{DispatchOutcome, ToolCallRecord, ToolDispatcher, preview_args};
pub use orchestrator::{CancelHandle, Orchestrator, TurnFinish, TurnOutcome, TurnPhase};
