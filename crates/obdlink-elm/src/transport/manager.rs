//! Transport manager: scan, pair, connect, disconnect, reconnect
//!
//! Owns the process-wide [`ConnectionState`] and the connection history.
//! Other components read state through accessors or subscribe to
//! [`ConnectionEvent`]s; nothing else mutates it.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use obdlink_core::{
    ConnectionEvent, ConnectionHistoryEntry, ConnectionPhase, ConnectionQuality, ConnectionState,
    Device, HistoryStore,
};
use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{ConnectError, LinkHealth, SerialLink, SerialLinkBackend, TransportError};
use crate::config::ReconnectConfig;

/// Shared handle to the currently open link
///
/// The protocol session reads through this handle so a reconnect can
/// swap the link underneath it without re-wiring the session.
pub type LinkHandle = Arc<RwLock<Option<Arc<dyn SerialLink>>>>;

const MONITOR_INTERVAL: Duration = Duration::from_millis(500);

pub struct TransportManager {
    backend: Arc<dyn SerialLinkBackend>,
    reconnect: ReconnectConfig,
    history: Arc<dyn HistoryStore>,
    state: Arc<RwLock<ConnectionState>>,
    events: broadcast::Sender<ConnectionEvent>,
    link: LinkHandle,
    health: LinkHealth,
    monitor_handle: Mutex<Option<JoinHandle<()>>>,
}

impl TransportManager {
    pub fn new(
        backend: Arc<dyn SerialLinkBackend>,
        history: Arc<dyn HistoryStore>,
        reconnect: ReconnectConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            backend,
            reconnect,
            history,
            state: Arc::new(RwLock::new(ConnectionState::default())),
            events,
            link: Arc::new(RwLock::new(None)),
            health: LinkHealth::new(),
            monitor_handle: Mutex::new(None),
        }
    }

    /// Current connection state snapshot
    pub fn state(&self) -> ConnectionState {
        self.state.read().clone()
    }

    /// Subscribe to connection events; drop the receiver to unsubscribe
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    /// Handle to the open link, for wiring up a protocol session
    pub fn link_handle(&self) -> LinkHandle {
        self.link.clone()
    }

    /// Health handle the protocol session reports round trips to
    pub fn health(&self) -> LinkHealth {
        self.health.clone()
    }

    /// Scan for nearby adapters, ranked by compatibility score
    pub async fn scan(&self, timeout: Duration) -> Result<Vec<Device>, TransportError> {
        let mut devices = self.backend.scan(timeout).await?;
        devices.sort_by(|a, b| b.compatibility_score().cmp(&a.compatibility_score()));

        let current = self.state.read().device.clone();
        if let Some(current) = current {
            for d in devices.iter_mut() {
                d.connected = d.address == current.address;
            }
        }

        debug!(count = devices.len(), "Scan completed");
        Ok(devices)
    }

    /// Pair with a device
    pub async fn pair(&self, device: &Device) -> Result<bool, TransportError> {
        let paired = self.backend.pair(device).await?;
        info!(address = %device.address, paired, "Pairing finished");
        Ok(paired)
    }

    /// Open a channel to a device
    ///
    /// Transitions Disconnected -> Connecting -> Connected|Error and
    /// appends a history entry whether or not the attempt succeeds.
    pub async fn connect(&self, device: &Device) -> Result<Device, ConnectError> {
        if self.state.read().phase == ConnectionPhase::Connecting {
            return Err(ConnectError::AlreadyConnecting);
        }

        // Tear down any existing channel first
        self.disconnect().await;

        self.publish_state(|s| {
            s.phase = ConnectionPhase::Connecting;
            s.device = None;
            s.connected_at = None;
        });

        match self.backend.open(device).await {
            Ok(link) => {
                let mut connected_device = device.clone();
                connected_device.connected = true;

                *self.link.write() = Some(link);
                self.health.reset();

                self.publish_state(|s| {
                    s.phase = ConnectionPhase::Connected;
                    s.device = Some(connected_device.clone());
                    s.connected_at = Some(Utc::now());
                    s.last_seen = None;
                    s.quality = ConnectionQuality::Excellent;
                });
                self.append_history(device, true).await;
                self.start_monitor(connected_device.clone());

                info!(address = %device.address, name = %device.name, "Connected");
                Ok(connected_device)
            }
            Err(e) => {
                self.publish_state(|s| {
                    s.phase = ConnectionPhase::Error;
                    s.device = None;
                });
                self.append_history(device, false).await;

                warn!(address = %device.address, error = %e, "Connect failed");
                Err(ConnectError::OpenFailed(e.to_string()))
            }
        }
    }

    /// Close the channel. Idempotent and reachable from any state;
    /// returns whether an open connection was actually torn down.
    pub async fn disconnect(&self) -> bool {
        if let Some(handle) = self.monitor_handle.lock().take() {
            handle.abort();
        }

        let link = self.link.write().take();
        let was_connected = self.state.read().is_connected();

        if let Some(link) = &link {
            link.close().await;
        }

        // Device and connected flag drop together; subscribers never see
        // a half-cleared state.
        self.publish_state(|s| {
            *s = ConnectionState::default();
        });
        self.health.reset();

        if was_connected {
            info!("Disconnected");
        }
        was_connected
    }

    /// Connection history, most recent first
    pub async fn connection_history(&self) -> Vec<ConnectionHistoryEntry> {
        self.history.load().await
    }

    /// Clear the connection history
    pub async fn clear_history(&self) {
        self.history.clear().await;
    }

    fn publish_state(&self, mutate: impl FnOnce(&mut ConnectionState)) {
        let snapshot = {
            let mut state = self.state.write();
            mutate(&mut state);
            state.clone()
        };
        let _ = self.events.send(ConnectionEvent::StateChanged(snapshot));
    }

    async fn append_history(&self, device: &Device, success: bool) {
        self.history
            .append(ConnectionHistoryEntry {
                address: device.address.clone(),
                name: device.name.clone(),
                timestamp: Utc::now(),
                success,
            })
            .await;
    }

    /// Liveness monitor: tracks quality/last-seen from the health handle
    /// and drives bounded-backoff reconnection on unexpected drops. This
    /// is the only background retry loop in the system.
    fn start_monitor(&self, device: Device) {
        let state = self.state.clone();
        let events = self.events.clone();
        let link = self.link.clone();
        let health = self.health.clone();
        let backend = self.backend.clone();
        let history = self.history.clone();
        let reconnect = self.reconnect.clone();

        let handle = tokio::spawn(async move {
            let mut last_quality = ConnectionQuality::Excellent;

            loop {
                tokio::time::sleep(MONITOR_INTERVAL).await;

                let quality = health.quality();
                {
                    let mut s = state.write();
                    s.quality = quality;
                    s.last_seen = health.last_seen();
                }
                if quality != last_quality {
                    last_quality = quality;
                    let _ = events.send(ConnectionEvent::QualityChanged(quality));
                }

                let alive = match link.read().clone() {
                    Some(l) => l,
                    None => break,
                };
                if alive.is_connected().await {
                    continue;
                }

                warn!(address = %device.address, "Transport dropped unexpectedly");
                {
                    let snapshot = {
                        let mut s = state.write();
                        s.phase = ConnectionPhase::Connecting;
                        s.device = None;
                        s.clone()
                    };
                    let _ = events.send(ConnectionEvent::StateChanged(snapshot));
                }

                let mut backoff = Duration::from_millis(reconnect.initial_backoff_ms);
                let mut restored = false;

                for attempt in 1..=reconnect.max_attempts {
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(Duration::from_millis(reconnect.max_backoff_ms));

                    match backend.open(&device).await {
                        Ok(new_link) => {
                            *link.write() = Some(new_link);
                            health.reset();

                            let snapshot = {
                                let mut s = state.write();
                                s.phase = ConnectionPhase::Connected;
                                s.device = Some(device.clone());
                                s.connected_at = Some(Utc::now());
                                s.quality = ConnectionQuality::Excellent;
                                s.clone()
                            };
                            let _ = events.send(ConnectionEvent::StateChanged(snapshot));
                            history
                                .append(ConnectionHistoryEntry {
                                    address: device.address.clone(),
                                    name: device.name.clone(),
                                    timestamp: Utc::now(),
                                    success: true,
                                })
                                .await;

                            info!(attempt, "Reconnected");
                            last_quality = ConnectionQuality::Excellent;
                            restored = true;
                            break;
                        }
                        Err(e) => {
                            warn!(attempt, error = %e, "Reconnect attempt failed");
                            history
                                .append(ConnectionHistoryEntry {
                                    address: device.address.clone(),
                                    name: device.name.clone(),
                                    timestamp: Utc::now(),
                                    success: false,
                                })
                                .await;
                        }
                    }
                }

                if !restored {
                    let snapshot = {
                        let mut s = state.write();
                        s.phase = ConnectionPhase::Error;
                        s.device = None;
                        s.clone()
                    };
                    let _ = events.send(ConnectionEvent::StateChanged(snapshot));
                    let _ = events.send(ConnectionEvent::ReconnectExhausted {
                        attempts: reconnect.max_attempts,
                    });
                    warn!("Reconnect attempts exhausted; manual reconnect required");
                    break;
                }
            }
        });

        *self.monitor_handle.lock() = Some(handle);
    }
}

impl Drop for TransportManager {
    fn drop(&mut self) {
        if let Some(handle) = self.monitor_handle.lock().take() {
            handle.abort();
        }
    }
}
