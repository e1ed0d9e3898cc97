//! Error types for the event-socket control client
//!
//! Every fallible operation in this crate returns [`EslResult`]. Errors fall
//! into four groups, which [`EslError::category`] exposes for metrics:
//!
//! - **transport** - socket failures and closes. Always recoverable; the
//!   connection manager reconnects with backoff.
//! - **protocol** - malformed frames or events. The offending event is
//!   dropped, later events are processed normally.
//! - **command** - not connected, switch-reported errors, timeouts and
//!   unusable replies. Returned to the caller, never swallowed.
//! - **reconnect** - the reconnect budget is exhausted. Escalated as a
//!   distinct signal so a supervisor can alert an operator.
//!
//! ```rust
//! use rvoip_esl_core::EslError;
//!
//! let err = EslError::NotConnected;
//! assert_eq!(err.category(), "command");
//! assert!(!err.is_recoverable());
//!
//! let err = EslError::transport("connection reset by peer");
//! assert_eq!(err.category(), "transport");
//! assert!(err.is_recoverable());
//! ```

use thiserror::Error;

/// Result type alias for esl-core operations
pub type EslResult<T> = Result<T, EslError>;

/// Error types for the event-socket client
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EslError {
    /// Transport errors
    #[error("Transport error: {reason}")]
    Transport { reason: String },

    #[error("Connection to {addr} failed: {reason}")]
    ConnectionFailed { addr: String, reason: String },

    #[error("Connection closed: {reason}")]
    ConnectionClosed { reason: String },

    #[error("Authentication failed: {reason}")]
    AuthenticationFailed { reason: String },

    /// Protocol errors
    #[error("Protocol error: {reason}")]
    Protocol { reason: String },

    #[error("Missing required header: {header}")]
    MissingHeader { header: String },

    /// Command errors
    #[error("Not connected to switch")]
    NotConnected,

    #[error("Command '{command}' failed: {reason}")]
    CommandFailed { command: String, reason: String },

    #[error("Command '{command}' timed out after {timeout_ms}ms")]
    CommandTimeout { command: String, timeout_ms: u64 },

    #[error("Malformed response to '{command}': {reason}")]
    MalformedResponse { command: String, reason: String },

    #[error("Call not found: {call_id}")]
    CallNotFound { call_id: String },

    #[error("Call already exists: {call_id}")]
    CallAlreadyExists { call_id: String },

    #[error("Invalid call state for call {call_id}: current state is {current_state}")]
    InvalidCallState { call_id: String, current_state: String },

    /// Reconnect budget exhausted
    #[error("Max reconnect attempts reached ({attempts})")]
    MaxReconnectAttempts { attempts: u32 },

    /// Configuration errors
    #[error("Invalid configuration: {field} - {reason}")]
    InvalidConfiguration { field: String, reason: String },

    /// External collaborator errors
    #[error("CDR sink error: {reason}")]
    CdrSink { reason: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl EslError {
    /// Create a transport error
    pub fn transport(reason: impl Into<String>) -> Self {
        Self::Transport { reason: reason.into() }
    }

    /// Create a protocol error
    pub fn protocol(reason: impl Into<String>) -> Self {
        Self::Protocol { reason: reason.into() }
    }

    /// Create a missing header error
    pub fn missing_header(header: impl Into<String>) -> Self {
        Self::MissingHeader { header: header.into() }
    }

    /// Create a command failed error
    pub fn command_failed(command: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::CommandFailed {
            command: command.into(),
            reason: reason.into(),
        }
    }

    /// Create a malformed response error
    pub fn malformed_response(command: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::MalformedResponse {
            command: command.into(),
            reason: reason.into(),
        }
    }

    /// Create a call not found error
    pub fn call_not_found(call_id: impl Into<String>) -> Self {
        Self::CallNotFound { call_id: call_id.into() }
    }

    /// Create an invalid configuration error
    pub fn invalid_configuration(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidConfiguration {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal { message: message.into() }
    }

    /// Check if this error is recoverable by retrying or reconnecting
    pub fn is_recoverable(&self) -> bool {
        match self {
            EslError::Transport { .. }
            | EslError::ConnectionFailed { .. }
            | EslError::ConnectionClosed { .. }
            | EslError::CommandTimeout { .. } => true,

            EslError::AuthenticationFailed { .. }
            | EslError::InvalidConfiguration { .. }
            | EslError::MaxReconnectAttempts { .. } => false,

            _ => false,
        }
    }

    /// Get error category for metrics/logging
    pub fn category(&self) -> &'static str {
        match self {
            EslError::Transport { .. }
            | EslError::ConnectionFailed { .. }
            | EslError::ConnectionClosed { .. }
            | EslError::AuthenticationFailed { .. } => "transport",

            EslError::Protocol { .. } | EslError::MissingHeader { .. } => "protocol",

            EslError::NotConnected
            | EslError::CommandFailed { .. }
            | EslError::CommandTimeout { .. }
            | EslError::MalformedResponse { .. }
            | EslError::CallNotFound { .. }
            | EslError::CallAlreadyExists { .. }
            | EslError::InvalidCallState { .. } => "command",

            EslError::MaxReconnectAttempts { .. } => "reconnect",

            EslError::InvalidConfiguration { .. } => "configuration",

            EslError::CdrSink { .. } | EslError::Internal { .. } => "system",
        }
    }
}

impl From<std::io::Error> for EslError {
    fn from(err: std::io::Error) -> Self {
        EslError::Transport {
            reason: err.to_string(),
        }
    }
}
