//! Event types published to subscribers
//!
//! The core publishes through `tokio::sync::broadcast` channels; a
//! subscriber holds a `Receiver` and drops it to unsubscribe. No
//! callback lists, no manual unsubscribe bookkeeping.

use serde::Serialize;

use crate::models::{ConnectionQuality, ConnectionState, TestProgress};

/// Events emitted by the transport manager and actuator orchestrator
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ConnectionEvent {
    /// Connection state changed (connect, disconnect, error)
    StateChanged(ConnectionState),
    /// Link quality reclassified
    QualityChanged(ConnectionQuality),
    /// Reconnection attempts were exhausted
    ReconnectExhausted { attempts: u32 },
    /// Progress update from a running actuator test batch
    TestProgress(TestProgress),
}
