//! Model transport and streaming session.
//!
//! [`transport::HttpTransport`] performs one blocking HTTP exchange against an
//! OpenAI-compatible chat-completions endpoint and pushes raw SSE deltas to a
//! sink. [`session::StreamingSession`] owns one exchange end to end: retries
//! (pre-first-chunk only), cancellation at chunk boundaries, and assembly of
//! streamed fragments into a completed assistant turn.

pub mod session;
pub mod transport;

pub use session::{RetryPolicy, SessionOutcome, SessionState, StreamingSession};
pub use transport::{HttpTransport, ModelTransport};
