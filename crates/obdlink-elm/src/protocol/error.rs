//! Protocol session errors

use thiserror::Error;

use crate::transport::TransportError;

/// Init handshake steps, in order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitStep {
    Reset,
    EchoOff,
    HeadersOff,
    ProtocolAuto,
    ProtocolQuery,
}

impl InitStep {
    /// AT command the step sends
    pub fn command(&self) -> &'static str {
        match self {
            InitStep::Reset => "ATZ",
            InitStep::EchoOff => "ATE0",
            InitStep::HeadersOff => "ATH0",
            InitStep::ProtocolAuto => "ATSP0",
            InitStep::ProtocolQuery => "ATDP",
        }
    }
}

impl std::fmt::Display for InitStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.command())
    }
}

#[derive(Debug, Error, Clone)]
#[error("Adapter init failed at {step}: {message}")]
pub struct InitError {
    pub step: InitStep,
    pub message: String,
}

#[derive(Debug, Error, Clone)]
pub enum ProtocolError {
    #[error("Not connected")]
    NotConnected,

    /// Adapter answered with a negative token such as `NO DATA`
    #[error("Adapter reported: {0}")]
    Negative(String),

    #[error("Malformed response: {0}")]
    Malformed(String),

    #[error("Command timed out")]
    Timeout,

    #[error(transparent)]
    Init(#[from] InitError),

    #[error(transparent)]
    Transport(TransportError),
}

impl From<TransportError> for ProtocolError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Timeout(_) => ProtocolError::Timeout,
            TransportError::ConnectionClosed => ProtocolError::NotConnected,
            other => ProtocolError::Transport(other),
        }
    }
}

impl From<ProtocolError> for obdlink_core::DiagnosticError {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::NotConnected => obdlink_core::DiagnosticError::NotConnected,
            ProtocolError::Negative(token) => obdlink_core::DiagnosticError::Negative(token),
            ProtocolError::Malformed(msg) => obdlink_core::DiagnosticError::Protocol(msg),
            ProtocolError::Timeout => obdlink_core::DiagnosticError::Timeout,
            ProtocolError::Init(e) => obdlink_core::DiagnosticError::InitFailed {
                step: e.step.to_string(),
                message: e.message,
            },
            ProtocolError::Transport(e) => e.into(),
        }
    }
}
