//! Common error type for diagnostic operations

use thiserror::Error;

/// Result type for diagnostic operations
pub type DiagnosticResult<T> = Result<T, DiagnosticError>;

/// Errors surfaced to callers of the diagnostic core
///
/// Each component of the core (transport, protocol session, PID engine,
/// DTC decoder, actuator orchestrator, security adapter) has its own
/// error enum; they all convert into this type at the crate boundary.
#[derive(Debug, Error)]
pub enum DiagnosticError {
    /// Transport/channel error (open, read, write, disconnect)
    #[error("Transport error: {0}")]
    Transport(String),

    /// No adapter is connected
    #[error("Not connected to an adapter")]
    NotConnected,

    /// Adapter returned a negative response token
    #[error("Adapter error response: {0}")]
    Negative(String),

    /// Protocol-level error (malformed frame, framing failure)
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Initialization handshake failed at a specific step
    #[error("Initialization failed at {step}: {message}")]
    InitFailed { step: String, message: String },

    /// Requested PID is not supported by the vehicle
    #[error("PID not supported: {0}")]
    Unsupported(String),

    /// Security access required or failed
    #[error("Security access required: {0}")]
    SecurityRequired(String),

    /// Another exclusive operation is in progress
    #[error("Resource busy: {0}")]
    Busy(String),

    /// High-risk operation attempted without confirmation
    #[error("Confirmation required: {0}")]
    ConfirmationRequired(String),

    /// Invalid parameter or request
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Timeout waiting for the adapter
    #[error("Operation timed out")]
    Timeout,

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl DiagnosticError {
    /// Whether the operation that produced this error may be retried
    /// automatically. Only transient timeouts qualify; destructive
    /// operations (clear, coding, actuator trigger) are never retried
    /// by callers regardless of this flag.
    pub fn is_retryable(&self) -> bool {
        matches!(self, DiagnosticError::Timeout)
    }
}
