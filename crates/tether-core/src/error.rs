//! Transport error taxonomy.
//!
//! The streaming session needs to distinguish "nothing was sent to the user
//! yet" failures (safe to retry) from failures after partial output (never
//! retried, since replaying risks duplicate text) and from configuration
//! problems (no request should be attempted at all).

use std::time::Duration;

#[derive(thiserror::Error, Debug)]
pub enum TransportError {
    /// Missing/invalid local configuration. Fatal for the turn; never retried.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A failure that may resolve on its own (rate limit, server error,
    /// connect/timeout). Retried with backoff, but only before the first
    /// chunk of a stream has been received.
    #[error("transient transport failure: {message}")]
    Transient {
        message: String,
        /// Server-provided retry hint, when present.
        retry_after: Option<Duration>,
    },

    /// A failure that will not resolve by retrying (auth, bad request,
    /// interrupted stream). Surfaced with any partial content delivered.
    #[error("terminal transport failure: {0}")]
    Terminal(String),
}

impl TransportError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient {
            message: message.into(),
            retry_after: None,
        }
    }

    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transient_is_retryable() {
        assert!(TransportError::transient("429").is_retryable());
        assert!(!TransportError::Terminal("401".into()).is_retryable());
        assert!(!TransportError::Configuration("no key".into()).is_retryable());
    }
}
