//! The fetch result type and construction-time error enums.
//!
//! `Outcome` is a tagged sum type rather than a `Result<Response, E>` because
//! the retry policy, the circuit breaker, and the metrics layer all need to
//! match on *why* a fetch didn't succeed without downcasting a trait object —
//! a 429 and a 503 are both "failures" but must never be treated the same way
//! by the breaker.

use std::fmt;
use std::time::Duration;

/// Cap on the number of per-attempt outcomes retained for diagnostics (e.g.
/// the canonicalizer's all-variants-failed report).
pub const MAX_RECORDED_ATTEMPTS: usize = 10;

/// A successful HTTP response, trimmed to what callers need after hygiene
/// stripping (hop-by-hop headers and `Set-Cookie` removed upstream).
#[derive(Debug, Clone)]
pub struct FetchResponse {
    pub status: u16,
    pub final_url: String,
    pub headers: Vec<(String, String)>,
    pub body: bytes::Bytes,
}

impl FetchResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Result of a single fetch attempt.
#[derive(Debug, Clone)]
pub enum Outcome {
    Success { response: FetchResponse },
    RateLimited { retry_after: Option<Duration> },
    ServerError { status: u16 },
    ClientError { status: u16 },
    Timeout,
    NetworkError { cause: String },
    CircuitOpen,
    Validation { reason: String },
}

impl Outcome {
    /// Whether the retry policy should attempt another try for this outcome.
    /// 4xx (non-429) and `Validation` are terminal.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimited { .. } | Self::ServerError { .. } | Self::Timeout | Self::NetworkError { .. }
        )
    }

    /// Whether this outcome should count as a circuit breaker failure.
    /// 429 is deliberately excluded — rate limiting is not a host-health signal.
    pub fn counts_as_breaker_failure(&self) -> bool {
        matches!(self, Self::ServerError { .. } | Self::Timeout | Self::NetworkError { .. })
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Success { response } => Some(response.status),
            Self::ServerError { status } | Self::ClientError { status } => Some(*status),
            _ => None,
        }
    }

    /// A short machine-stable tag for logging and metrics, independent of
    /// any payload.
    pub fn category(&self) -> &'static str {
        match self {
            Self::Success { .. } => "success",
            Self::RateLimited { .. } => "rate_limited",
            Self::ServerError { .. } => "server_error",
            Self::ClientError { .. } => "client_error",
            Self::Timeout => "timeout",
            Self::NetworkError { .. } => "network_error",
            Self::CircuitOpen => "circuit_open",
            Self::Validation { .. } => "validation",
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success { response } => write!(f, "success ({})", response.status),
            Self::RateLimited { retry_after } => match retry_after {
                Some(d) => write!(f, "rate limited, retry after {:?}", d),
                None => write!(f, "rate limited"),
            },
            Self::ServerError { status } => write!(f, "server error ({})", status),
            Self::ClientError { status } => write!(f, "client error ({})", status),
            Self::Timeout => write!(f, "timed out"),
            Self::NetworkError { cause } => write!(f, "network error: {}", cause),
            Self::CircuitOpen => write!(f, "circuit open"),
            Self::Validation { reason } => write!(f, "validation failed: {}", reason),
        }
    }
}

/// Errors a `HostRegistry`/policy builder can reject at construction time.
#[derive(Debug, Clone, thiserror::Error)]
pub enum BuildError {
    #[error("half_open_max_calls must be at least 1")]
    ZeroHalfOpenLimit,
    #[error("max_concurrent must be at least 1")]
    ZeroConcurrency,
    #[error("base_backoff ({base:?}) must not exceed max_backoff ({max:?})")]
    BackoffOrdering { base: Duration, max: Duration },
    #[error("invalid host pattern: {0}")]
    InvalidHostPattern(String),
}

/// Errors loading configuration from the environment.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    #[error("{key} must be in [{min}, {max}], got {value}")]
    OutOfRange { key: &'static str, value: i64, min: i64, max: i64 },
    #[error("{key} has invalid value: {reason}")]
    Invalid { key: &'static str, reason: String },
}

/// Errors surfacing at the job-control boundary.
#[derive(Debug, Clone, thiserror::Error)]
pub enum JobError {
    #[error("job {0} not found")]
    NotFound(String),
    #[error("job {0} has not completed")]
    NotCompleted(String),
    #[error("invalid job mode: {0}")]
    InvalidMode(String),
    #[error("job input must contain at least one url")]
    EmptyInput,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_response(status: u16) -> FetchResponse {
        FetchResponse { status, final_url: "https://example.com/".into(), headers: vec![], body: bytes::Bytes::new() }
    }

    #[test]
    fn success_is_not_retryable() {
        let outcome = Outcome::Success { response: sample_response(200) };
        assert!(!outcome.is_retryable());
        assert!(outcome.is_success());
    }

    #[test]
    fn rate_limited_is_retryable_but_not_a_breaker_failure() {
        let outcome = Outcome::RateLimited { retry_after: Some(Duration::from_secs(5)) };
        assert!(outcome.is_retryable());
        assert!(!outcome.counts_as_breaker_failure());
    }

    #[test]
    fn server_error_is_retryable_and_a_breaker_failure() {
        let outcome = Outcome::ServerError { status: 503 };
        assert!(outcome.is_retryable());
        assert!(outcome.counts_as_breaker_failure());
        assert_eq!(outcome.status(), Some(503));
    }

    #[test]
    fn client_error_is_terminal_and_not_a_breaker_failure() {
        let outcome = Outcome::ClientError { status: 404 };
        assert!(!outcome.is_retryable());
        assert!(!outcome.counts_as_breaker_failure());
    }

    #[test]
    fn validation_is_terminal() {
        let outcome = Outcome::Validation { reason: "empty url".into() };
        assert!(!outcome.is_retryable());
        assert_eq!(outcome.category(), "validation");
    }

    #[test]
    fn timeout_and_network_error_are_retryable_breaker_failures() {
        assert!(Outcome::Timeout.is_retryable());
        assert!(Outcome::Timeout.counts_as_breaker_failure());
        let net = Outcome::NetworkError { cause: "connection reset".into() };
        assert!(net.is_retryable());
        assert!(net.counts_as_breaker_failure());
    }

    #[test]
    fn circuit_open_is_terminal_for_this_attempt() {
        assert!(!Outcome::CircuitOpen.is_retryable());
        assert!(!Outcome::CircuitOpen.counts_as_breaker_failure());
    }

    #[test]
    fn display_messages_mention_key_details() {
        let msg = format!("{}", Outcome::ServerError { status: 502 });
        assert!(msg.contains("502"));
        let msg = format!("{}", Outcome::RateLimited { retry_after: None });
        assert!(msg.contains("rate limited"));
    }

    #[test]
    fn fetch_response_header_lookup_is_case_insensitive() {
        let response = FetchResponse {
            status: 200,
            final_url: "https://example.com/".into(),
            headers: vec![("Content-Type".into(), "text/html".into())],
            body: bytes::Bytes::new(),
        };
        assert_eq!(response.header("content-type"), Some("text/html"));
    }
}
