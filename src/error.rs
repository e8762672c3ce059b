use std::time::Duration;

use thiserror::Error;

/// Error taxonomy for the ingestion pipeline.
///
/// Recovery policy lives at the call sites: transient failures and rate
/// limits feed the reconnect/retry machinery, invalid messages are dropped
/// with a warning, remote-API failures wait for the next dispatch cycle.
/// Only `Config` is fatal, and only at startup.
#[derive(Debug, Error)]
pub enum FeedError {
    /// Connection drop, read error, HTTP 5xx. Never fatal.
    #[error("transient network failure: {0}")]
    Transient(String),

    /// HTTP 429 or a documented rate-limit header.
    #[error("rate limited{}", retry_after.map(|d| format!(" (retry after {}s)", d.as_secs())).unwrap_or_default())]
    RateLimit { retry_after: Option<Duration> },

    /// A vendor message the normalizer could not turn into a tick.
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    /// Missing or malformed configuration. Fatal at startup only.
    #[error("configuration error: {0}")]
    Config(String),

    /// Non-2xx response from the causal intelligence service.
    #[error("causal api returned status {status}")]
    RemoteApi { status: u16 },
}

impl FeedError {
    /// Whether the operation that produced this error is worth retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(self, FeedError::Transient(_) | FeedError::RateLimit { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(FeedError::Transient("reset by peer".into()).is_retryable());
        assert!(FeedError::RateLimit { retry_after: None }.is_retryable());
        assert!(!FeedError::Config("missing CAUSAL_API_URL".into()).is_retryable());
        assert!(!FeedError::RemoteApi { status: 500 }.is_retryable());
    }

    #[test]
    fn test_rate_limit_display_includes_delay() {
        let err = FeedError::RateLimit {
            retry_after: Some(Duration::from_secs(10)),
        };
        assert!(err.to_string().contains("10s"));
    }
}
