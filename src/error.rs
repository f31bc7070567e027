//! Crate-level error type.
//!
//! Every fallible operation returns [`RoundtableError`]. The enum is `Clone`
//! so a failure can be carried inside a [`crate::discussion::RoundEvent`] and
//! stored on the finished round at the same time.

use thiserror::Error;

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, RoundtableError>;

/// Coarse failure classification. Callers branch on this rather than on
/// individual variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    InvalidInput,
    Timeout,
    ConnectionRefused,
    NetworkFailure,
    ApplicationError,
    StreamFailure,
    ConcurrentRound,
    Internal,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureKind::InvalidInput => write!(f, "invalid_input"),
            FailureKind::Timeout => write!(f, "timeout"),
            FailureKind::ConnectionRefused => write!(f, "connection_refused"),
            FailureKind::NetworkFailure => write!(f, "network_failure"),
            FailureKind::ApplicationError => write!(f, "application_error"),
            FailureKind::StreamFailure => write!(f, "stream_failure"),
            FailureKind::ConcurrentRound => write!(f, "concurrent_round"),
            FailureKind::Internal => write!(f, "internal"),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RoundtableError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Timed out after {after_ms} ms: {context}")]
    Timeout { context: String, after_ms: u64 },

    #[error("Connection refused by {url}: {detail}")]
    ConnectionRefused { url: String, detail: String },

    #[error("Network failure talking to {url}: {detail}")]
    Network { url: String, detail: String },

    /// The remote server replied with a non-2xx HTTP status code.
    #[error("HTTP {status} from {url}")]
    Http { status: u16, url: String },

    /// Response body was not a valid `{code, msg, data}` envelope.
    #[error("Malformed response from {url}: {detail}")]
    Decode { url: String, detail: String },

    /// Envelope carried a non-zero `code`.
    #[error("Application error (code {code}): {message}")]
    Application { code: i64, message: String },

    #[error("Stream failure: {0}")]
    Stream(String),

    #[error("A discussion round is already in progress")]
    ConcurrentRound,

    #[error("Cannot switch mode while a discussion round is in progress")]
    ModeLocked,

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Startup step '{step}' failed: {detail}")]
    Startup { step: String, detail: String },
}

impl RoundtableError {
    pub fn kind(&self) -> FailureKind {
        match self {
            RoundtableError::InvalidInput(_) | RoundtableError::InvalidState(_) => {
                FailureKind::InvalidInput
            }
            RoundtableError::Timeout { .. } => FailureKind::Timeout,
            RoundtableError::ConnectionRefused { .. } => FailureKind::ConnectionRefused,
            RoundtableError::Network { .. }
            | RoundtableError::Http { .. }
            | RoundtableError::Decode { .. } => FailureKind::NetworkFailure,
            RoundtableError::Application { .. } => FailureKind::ApplicationError,
            RoundtableError::Stream(_) => FailureKind::StreamFailure,
            RoundtableError::ConcurrentRound | RoundtableError::ModeLocked => {
                FailureKind::ConcurrentRound
            }
            RoundtableError::Persistence(_)
            | RoundtableError::Config(_)
            | RoundtableError::Startup { .. } => FailureKind::Internal,
        }
    }

    /// Only timeouts are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        self.kind() == FailureKind::Timeout
    }

    /// Connectivity-class failures that justify switching to the mock backend.
    pub fn triggers_fallback(&self) -> bool {
        matches!(
            self.kind(),
            FailureKind::ConnectionRefused | FailureKind::NetworkFailure | FailureKind::Timeout
        )
    }

    /// Classify a reqwest error against the URL it was issued for.
    pub fn from_reqwest(err: &reqwest::Error, url: &str, after_ms: u64) -> Self {
        if err.is_timeout() {
            RoundtableError::Timeout { context: url.to_string(), after_ms }
        } else if err.is_connect() {
            RoundtableError::ConnectionRefused { url: url.to_string(), detail: err.to_string() }
        } else if err.is_decode() {
            RoundtableError::Decode { url: url.to_string(), detail: err.to_string() }
        } else {
            RoundtableError::Network { url: url.to_string(), detail: err.to_string() }
        }
    }
}

impl From<std::io::Error> for RoundtableError {
    fn from(e: std::io::Error) -> Self {
        RoundtableError::Persistence(e.to_string())
    }
}
