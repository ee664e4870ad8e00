//! Serial link traits and link health tracking

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use obdlink_core::{ConnectionQuality, Device};
use parking_lot::RwLock;

use super::TransportError;

/// An open half-duplex serial byte stream to an adapter
///
/// The link knows nothing about AT framing; it moves bytes. Framing and
/// command serialization live in the protocol session.
#[async_trait]
pub trait SerialLink: Send + Sync {
    /// Write all bytes to the channel
    async fn write_all(&self, data: &[u8]) -> Result<(), TransportError>;

    /// Read one chunk of available bytes, waiting up to `timeout`.
    ///
    /// Returns `TransportError::Timeout` when nothing arrives in time and
    /// `TransportError::ConnectionClosed` when the channel is gone.
    async fn read_chunk(&self, timeout: Duration) -> Result<Vec<u8>, TransportError>;

    /// Whether the underlying channel is still open
    async fn is_connected(&self) -> bool;

    /// Close the channel; subsequent reads/writes fail
    async fn close(&self);
}

/// Discovers, pairs, and opens serial links for one transport kind
#[async_trait]
pub trait SerialLinkBackend: Send + Sync {
    /// Scan for nearby devices for up to `timeout`
    async fn scan(&self, timeout: Duration) -> Result<Vec<Device>, TransportError>;

    /// Pair with a device; returns whether the device is now paired
    async fn pair(&self, device: &Device) -> Result<bool, TransportError>;

    /// Open a serial channel to a device
    async fn open(&self, device: &Device) -> Result<Arc<dyn SerialLink>, TransportError>;
}

/// Shared handle the protocol session reports round-trip outcomes to
///
/// The transport manager owns the counters and derives connection
/// quality from them; the session only reports.
#[derive(Clone, Default)]
pub struct LinkHealth {
    inner: Arc<HealthInner>,
}

#[derive(Default)]
struct HealthInner {
    consecutive_timeouts: AtomicU32,
    last_seen: RwLock<Option<DateTime<Utc>>>,
}

impl LinkHealth {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a successful round trip
    pub fn report_success(&self) {
        self.inner.consecutive_timeouts.store(0, Ordering::SeqCst);
        *self.inner.last_seen.write() = Some(Utc::now());
    }

    /// Record a command timeout
    pub fn report_timeout(&self) {
        self.inner.consecutive_timeouts.fetch_add(1, Ordering::SeqCst);
    }

    /// Clear counters (new connection)
    pub fn reset(&self) {
        self.inner.consecutive_timeouts.store(0, Ordering::SeqCst);
        *self.inner.last_seen.write() = None;
    }

    /// Timestamp of the last successful round trip
    pub fn last_seen(&self) -> Option<DateTime<Utc>> {
        *self.inner.last_seen.read()
    }

    /// Quality classification from recent behavior
    pub fn quality(&self) -> ConnectionQuality {
        ConnectionQuality::from_consecutive_timeouts(
            self.inner.consecutive_timeouts.load(Ordering::SeqCst),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_degrades_and_recovers() {
        let health = LinkHealth::new();
        assert_eq!(health.quality(), ConnectionQuality::Excellent);

        health.report_timeout();
        assert_eq!(health.quality(), ConnectionQuality::Good);
        health.report_timeout();
        health.report_timeout();
        assert_eq!(health.quality(), ConnectionQuality::Poor);
        health.report_timeout();
        assert_eq!(health.quality(), ConnectionQuality::Bad);

        health.report_success();
        assert_eq!(health.quality(), ConnectionQuality::Excellent);
        assert!(health.last_seen().is_some());
    }
}
