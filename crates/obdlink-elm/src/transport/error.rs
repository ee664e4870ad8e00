//! Transport layer errors

use thiserror::Error;

#[derive(Debug, Error, Clone)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Scan failed: {0}")]
    ScanFailed(String),

    #[error("Pairing failed: {0}")]
    PairingFailed(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Transport not supported: {0}")]
    Unsupported(String),
}

/// Errors from `TransportManager::connect`
#[derive(Debug, Error, Clone)]
pub enum ConnectError {
    #[error("Device channel could not be opened: {0}")]
    OpenFailed(String),

    #[error("Already connecting")]
    AlreadyConnecting,

    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl From<TransportError> for obdlink_core::DiagnosticError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Timeout(_) => obdlink_core::DiagnosticError::Timeout,
            TransportError::ConnectionClosed => obdlink_core::DiagnosticError::NotConnected,
            other => obdlink_core::DiagnosticError::Transport(other.to_string()),
        }
    }
}
