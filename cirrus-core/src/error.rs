//! Error types for Cirrus

use thiserror::Error;

/// Result type alias
pub type ApiResult<T> = Result<T, ApiError>;

/// Transport failure classification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    /// Could not establish a connection
    Connect,
    /// Connect, read or write deadline elapsed
    Timeout,
    /// I/O failure while moving bytes
    Io,
    /// The peer answered with something we could not understand
    Protocol,
}

/// Misuse of a call or service lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum StateError {
    #[error("call already executed")]
    AlreadyExecuted,

    #[error("service has been shut down")]
    Shutdown,

    #[error("blocking execution is not allowed inside an async runtime, use execute_async")]
    BlockingInAsyncContext,
}

/// Main error type
#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("API error {code}: {message}")]
    Api { code: u32, message: String },

    #[error("Transport error ({kind:?}): {message}")]
    Transport {
        kind: TransportErrorKind,
        message: String,
    },

    #[error("Transfer length mismatch: expected {expected} bytes, got {actual}")]
    Integrity { expected: u64, actual: u64 },

    #[error("Illegal state: {0}")]
    State(#[from] StateError),

    #[error("Cancelled")]
    Cancelled,
}

/// Coarse error classification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Argument,
    Api,
    Transport,
    Integrity,
    State,
    Cancelled,
}

impl ApiError {
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        ApiError::InvalidArgument(message.into())
    }

    pub fn api(code: u32, message: impl Into<String>) -> Self {
        ApiError::Api {
            code,
            message: message.into(),
        }
    }

    pub fn transport(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        ApiError::Transport {
            kind,
            message: message.into(),
        }
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::transport(TransportErrorKind::Protocol, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::transport(TransportErrorKind::Timeout, message)
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            ApiError::InvalidArgument(_) => ErrorKind::Argument,
            ApiError::Api { .. } => ErrorKind::Api,
            ApiError::Transport { .. } => ErrorKind::Transport,
            ApiError::Integrity { .. } => ErrorKind::Integrity,
            ApiError::State(_) => ErrorKind::State,
            ApiError::Cancelled => ErrorKind::Cancelled,
        }
    }

    /// Server-side result code, if this is an API error.
    pub fn api_code(&self) -> Option<u32> {
        match self {
            ApiError::Api { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// Whether a fresh call for the same operation might succeed.
    ///
    /// Only connectivity problems qualify; the decision to actually retry is
    /// left to the caller.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ApiError::Transport {
                kind: TransportErrorKind::Connect | TransportErrorKind::Timeout | TransportErrorKind::Io,
                ..
            }
        )
    }

    /// Log-in required, log-in failed and invalid token codes.
    pub fn is_auth_error(&self) -> bool {
        matches!(self, ApiError::Api { code: 1000 | 2000 | 2094, .. })
    }
}

impl From<std::io::Error> for ApiError {
    fn from(err: std::io::Error) -> Self {
        let kind = match err.kind() {
            std::io::ErrorKind::TimedOut => TransportErrorKind::Timeout,
            std::io::ErrorKind::ConnectionRefused
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::NotConnected => TransportErrorKind::Connect,
            _ => TransportErrorKind::Io,
        };
        ApiError::transport(kind, err.to_string())
    }
}

impl From<serde_json::Error> for ApiError {
    fn from(err: serde_json::Error) -> Self {
        ApiError::protocol(format!("malformed response: {err}"))
    }
}
