//! Connection state and history models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::Device;

/// Connection quality derived from recent round-trip behavior
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionQuality {
    /// No recent timeouts
    #[default]
    Excellent,
    /// Occasional timeout
    Good,
    /// Repeated timeouts, responses still arriving
    Poor,
    /// Consecutive timeouts, link likely failing
    Bad,
}

impl ConnectionQuality {
    /// Derive quality from the number of consecutive command timeouts
    pub fn from_consecutive_timeouts(timeouts: u32) -> Self {
        match timeouts {
            0 => ConnectionQuality::Excellent,
            1 => ConnectionQuality::Good,
            2..=3 => ConnectionQuality::Poor,
            _ => ConnectionQuality::Bad,
        }
    }
}

/// Process-wide connection state, owned by the transport manager
///
/// Invariant: `device` is `Some` if and only if `phase` is `Connected`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectionState {
    /// Lifecycle phase
    pub phase: ConnectionPhase,
    /// The connected device (present only while connected)
    pub device: Option<Device>,
    /// When the current connection was established
    pub connected_at: Option<DateTime<Utc>>,
    /// Last successful round trip on the channel
    pub last_seen: Option<DateTime<Utc>>,
    /// Quality of the current link
    pub quality: ConnectionQuality,
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        self.phase == ConnectionPhase::Connected
    }
}

/// Connection lifecycle phase
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionPhase {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Error,
}

/// One entry in the append-only connection history log
///
/// Appended on every connect attempt, success or failure; ordered
/// most-recent-first by the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionHistoryEntry {
    /// Device address
    pub address: String,
    /// Device name at the time of the attempt
    pub name: String,
    /// When the attempt was made
    pub timestamp: DateTime<Utc>,
    /// Whether the connection was established
    pub success: bool,
}
