//! Error types shared across actmesh.

use crate::envelope::{ErrorCode, ErrorInfo};
use crate::pattern::Pattern;
use thiserror::Error;

/// Prefix of every caller-visible action error message.
pub const ERROR_NAMESPACE: &str = "actmesh";

/// Malformed wire data.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Malformed envelope: {reason}")]
pub struct DecodeError {
    pub reason: String,
}

impl DecodeError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// Network-layer failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The peer could not be reached.
    #[error("Connect to {addr} failed: {reason}")]
    ConnectFailed { addr: String, reason: String },
    /// Writing the request to the peer failed.
    #[error("Write failed: {reason}")]
    WriteFailed { reason: String },
    /// The peer closed the connection before responding.
    #[error("Peer closed the connection")]
    PeerClosed,
    /// The local component is closing or closed.
    #[error("Transport closed")]
    Closed,
}

/// Why a dispatched action did not produce a result.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Failure {
    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    /// No response arrived before the deadline.
    #[error("timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// The request returned to the instance that originated it.
    #[error("{message}")]
    OwnMessage { message: String },

    /// The request revisited an instance already on its path.
    #[error("{message}")]
    MessageLoop { message: String },

    /// The remote handler reported a failure.
    #[error("{message}")]
    App { message: String, retryable: bool },

    /// The client was closed while the call was pending.
    #[error("client closed")]
    Closed,
}

impl Failure {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Decode(_) => ErrorCode::Decode,
            Self::Transport(_) => ErrorCode::Transport,
            Self::Timeout { .. } => ErrorCode::Timeout,
            Self::OwnMessage { .. } => ErrorCode::OwnMessage,
            Self::MessageLoop { .. } => ErrorCode::MessageLoop,
            Self::App { .. } => ErrorCode::App,
            Self::Closed => ErrorCode::Closed,
        }
    }

    /// True only for a local correlation deadline expiry.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    pub fn retryable(&self) -> bool {
        match self {
            Self::Transport(_) | Self::Timeout { .. } => true,
            Self::App { retryable, .. } => *retryable,
            _ => false,
        }
    }

    /// Wire form of this failure.
    pub fn to_error_info(&self) -> ErrorInfo {
        let message = match self {
            Self::Decode(e) => e.reason.clone(),
            other => other.to_string(),
        };
        ErrorInfo {
            message,
            retryable: self.retryable(),
            code: self.code(),
        }
    }

    /// Rebuild a failure from a remote `errorInfo`.
    ///
    /// Remote timeouts and transport failures are relayed as application
    /// errors: only the local correlation deadline carries the timeout marker.
    pub fn from_error_info(info: ErrorInfo) -> Self {
        match info.code {
            ErrorCode::OwnMessage => Self::OwnMessage {
                message: info.message,
            },
            ErrorCode::MessageLoop => Self::MessageLoop {
                message: info.message,
            },
            ErrorCode::Decode => Self::Decode(DecodeError::new(info.message)),
            ErrorCode::App
            | ErrorCode::Timeout
            | ErrorCode::Transport
            | ErrorCode::Closed
            | ErrorCode::Unknown => Self::App {
                message: info.message,
                retryable: info.retryable,
            },
        }
    }
}

/// Error returned to a local caller of a remote action.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{namespace}: Action {pattern} failed: {failure}.", namespace = ERROR_NAMESPACE)]
pub struct ActionError {
    pub pattern: Pattern,
    pub failure: Failure,
}

impl ActionError {
    pub fn new(pattern: Pattern, failure: Failure) -> Self {
        Self { pattern, failure }
    }

    /// The timeout marker: set only when the local deadline expired.
    pub fn is_timeout(&self) -> bool {
        self.failure.is_timeout()
    }
}

/// Failure reported by a local action handler.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct AppError {
    pub message: String,
    pub retryable: bool,
    pub code: ErrorCode,
}

impl AppError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
            code: ErrorCode::App,
        }
    }

    pub fn into_error_info(self) -> ErrorInfo {
        ErrorInfo {
            message: self.message,
            retryable: self.retryable,
            code: self.code,
        }
    }
}

/// A handler that forwarded a call relays the downstream failure unchanged.
impl From<ActionError> for AppError {
    fn from(err: ActionError) -> Self {
        let info = err.failure.to_error_info();
        Self {
            message: info.message,
            retryable: info.retryable,
            code: info.code,
        }
    }
}

/// Correlation table misuse.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CorrelationError {
    /// The id is already pending; ids are generated uniquely, so this is a bug.
    #[error("Duplicate correlation id: {0}")]
    DuplicateCorrelationId(String),
}

/// Invalid pattern text.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PatternError {
    #[error("Pattern segment `{0}` is missing a `:` separator")]
    MissingSeparator(String),
    #[error("Pattern segment `{0}` has an empty key")]
    EmptyKey(String),
}

/// Configuration loading and validation errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Invalid pin: {0}")]
    Pattern(#[from] PatternError),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Work that could not be drained before a component closed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{} operation(s) did not drain before close: {}", .failures.len(), .failures.join("; "))]
pub struct CloseError {
    pub failures: Vec<String>,
}
