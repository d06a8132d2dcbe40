//! Authentication error types.

use thiserror::Error;

/// HTTP statuses that indicate the request itself is wrong and retrying
/// cannot fix it.
const TERMINAL_STATUSES: [u16; 4] = [400, 401, 403, 404];

/// Authentication error type.
#[derive(Error, Debug)]
pub enum AuthError {
    /// Server answered with a terminal status (400/401/403/404)
    #[error("Request rejected: HTTP {status}: {message}")]
    Terminal { status: u16, message: String },

    /// Server answered with a retryable status (5xx and friends)
    #[error("Server error: HTTP {status}: {message}")]
    Server { status: u16, message: String },

    /// Refresh token was rejected; session cannot be recovered
    #[error("Session expired, sign in again")]
    RefreshExhausted,

    /// Request was cancelled by its owner
    #[error("Request cancelled")]
    Cancelled,

    /// No connectivity and the operation cannot be deferred
    #[error("Currently offline")]
    Offline,

    /// Deferred request was dropped before replay completed
    #[error("Deferred request abandoned")]
    QueueClosed,

    /// Offline queue is at capacity
    #[error("Offline queue full")]
    QueueFull,

    /// Operation timed out
    #[error("Operation timed out")]
    Timeout,

    /// Network unavailable (transient, can retry)
    #[error("Network unavailable")]
    NetworkUnavailable,

    /// Invalid state transition in the auth FSM
    #[error("Invalid auth state transition: {0}")]
    InvalidStateTransition(String),

    /// Server response violated the wire contract
    #[error("Malformed auth response: {0}")]
    MalformedResponse(String),

    /// Storage error
    #[error("Storage error: {0}")]
    Storage(#[from] credential_vault::StorageError),

    /// HTTP transport error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// URL parse error
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

impl AuthError {
    /// Build the right variant for a non-success HTTP status.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        if TERMINAL_STATUSES.contains(&status) {
            AuthError::Terminal { status, message }
        } else {
            AuthError::Server { status, message }
        }
    }

    /// HTTP status carried by this error, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            AuthError::Terminal { status, .. } | AuthError::Server { status, .. } => Some(*status),
            AuthError::Http(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }

    /// Best-effort clone for fanning one failure out to several waiters.
    /// Wrapped source errors collapse to their closest plain variant.
    pub fn duplicate(&self) -> Self {
        match self {
            AuthError::Terminal { status, message } => AuthError::Terminal {
                status: *status,
                message: message.clone(),
            },
            AuthError::Server { status, message } => AuthError::Server {
                status: *status,
                message: message.clone(),
            },
            AuthError::RefreshExhausted => AuthError::RefreshExhausted,
            AuthError::Cancelled => AuthError::Cancelled,
            AuthError::Offline => AuthError::Offline,
            AuthError::QueueClosed => AuthError::QueueClosed,
            AuthError::QueueFull => AuthError::QueueFull,
            AuthError::Timeout => AuthError::Timeout,
            AuthError::NetworkUnavailable => AuthError::NetworkUnavailable,
            AuthError::InvalidStateTransition(s) => AuthError::InvalidStateTransition(s.clone()),
            AuthError::MalformedResponse(s) => AuthError::MalformedResponse(s.clone()),
            AuthError::Config(s) => AuthError::Config(s.clone()),
            AuthError::Http(e) => match e.status() {
                Some(status) => AuthError::from_status(status.as_u16(), e.to_string()),
                None if e.is_timeout() => AuthError::Timeout,
                None => AuthError::NetworkUnavailable,
            },
            AuthError::Storage(e) => AuthError::Config(format!("storage failure: {e}")),
            AuthError::Json(e) => AuthError::Config(format!("malformed response: {e}")),
            AuthError::InvalidUrl(e) => AuthError::Config(format!("invalid url: {e}")),
        }
    }

    /// Returns true if this error is transient and the operation can be
    /// retried: connectivity loss, timeouts, and server-side (5xx) failures.
    ///
    /// Terminal statuses, cancellation, and exhausted refresh are never
    /// retried.
    pub fn is_transient(&self) -> bool {
        match self {
            AuthError::NetworkUnavailable => true,
            AuthError::Timeout => true,
            AuthError::Server { .. } => true,
            AuthError::Http(e) => {
                if e.is_connect() || e.is_timeout() {
                    return true;
                }
                if let Some(status) = e.status() {
                    return status.is_server_error();
                }
                // Request never reached the server
                e.is_request()
            }
            _ => false,
        }
    }
}

/// Result type alias using AuthError.
pub type AuthResult<T> = Result<T, AuthError>;
