//! PID engine: single reads, batch reads, and live-data polling
//!
//! Definitions come from the injected [`ProfileProvider`]; the engine
//! itself hard-codes no PID table. PIDs the vehicle answers with
//! `NO DATA` are cached as unsupported for the rest of the session so
//! polling does not hammer them.

mod decode;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use obdlink_core::{
    LiveReading, PidDefinition, ProfileProvider, ReadingStatus, ReadingValue, VehicleProfile,
};
use parking_lot::RwLock;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, trace};

use crate::config::PollingConfig;
use crate::protocol::{ExclusiveAccess, ProtocolError, ProtocolSession, SendOptions};

#[derive(Debug, Error, Clone)]
pub enum ReadError {
    #[error("Unknown PID: {0}")]
    UnknownPid(String),

    /// The vehicle does not answer this PID
    #[error("PID not supported by vehicle: {0}")]
    Unsupported(String),

    #[error("Truncated payload for {pid}: expected {expected} bytes, got {got}")]
    Truncated {
        pid: String,
        expected: usize,
        got: usize,
    },

    #[error("Malformed response: {0}")]
    Malformed(String),

    #[error("Decode failed: {0}")]
    Decode(String),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

impl From<ReadError> for obdlink_core::DiagnosticError {
    fn from(err: ReadError) -> Self {
        match err {
            ReadError::UnknownPid(pid) => {
                obdlink_core::DiagnosticError::InvalidRequest(format!("unknown PID {pid}"))
            }
            ReadError::Unsupported(pid) => obdlink_core::DiagnosticError::Unsupported(pid),
            ReadError::Protocol(e) => e.into(),
            other => obdlink_core::DiagnosticError::Protocol(other.to_string()),
        }
    }
}

#[derive(Clone)]
pub struct PidEngine {
    session: Arc<ProtocolSession>,
    provider: Arc<dyn ProfileProvider>,
    profile: Arc<RwLock<Option<Arc<VehicleProfile>>>>,
    unsupported: Arc<RwLock<HashSet<String>>>,
    exclusive: ExclusiveAccess,
    polling: PollingConfig,
}

impl PidEngine {
    pub fn new(
        session: Arc<ProtocolSession>,
        provider: Arc<dyn ProfileProvider>,
        exclusive: ExclusiveAccess,
        polling: PollingConfig,
    ) -> Self {
        Self {
            session,
            provider,
            profile: Arc::new(RwLock::new(None)),
            unsupported: Arc::new(RwLock::new(HashSet::new())),
            exclusive,
            polling,
        }
    }

    /// Select the active vehicle profile; extended PIDs come from it.
    /// Clears the unsupported cache, another vehicle may answer more.
    pub fn set_profile(&self, profile: Option<Arc<VehicleProfile>>) {
        *self.profile.write() = profile;
        self.unsupported.write().clear();
    }

    /// Forget which PIDs the vehicle declined (call after reconnect)
    pub fn clear_unsupported_cache(&self) {
        self.unsupported.write().clear();
    }

    /// All PIDs readable with the current profile
    pub fn available_pids(&self) -> Vec<PidDefinition> {
        let mut pids = self.provider.standard_pids();
        if let Some(profile) = self.profile.read().as_ref() {
            pids.extend(profile.extended_pids.iter().cloned());
        }
        pids
    }

    fn definition(&self, pid: &str) -> Option<PidDefinition> {
        if let Some(profile) = self.profile.read().as_ref() {
            if let Some(def) = profile.extended_pids.iter().find(|d| d.id == pid) {
                return Some(def.clone());
            }
        }
        self.provider.standard_pids().into_iter().find(|d| d.id == pid)
    }

    /// Read and decode one PID
    pub async fn read(&self, pid: &str) -> Result<LiveReading, ReadError> {
        let definition = self
            .definition(pid)
            .ok_or_else(|| ReadError::UnknownPid(pid.to_string()))?;

        if self.unsupported.read().contains(pid) {
            return Err(ReadError::Unsupported(pid.to_string()));
        }

        let response = match self
            .session
            .send_command(&definition.id, SendOptions::default())
            .await
        {
            Ok(response) => response,
            Err(ProtocolError::Negative(token)) if token == "NO DATA" || token == "?" => {
                debug!(pid, token, "Vehicle declined PID; caching as unsupported");
                self.unsupported.write().insert(pid.to_string());
                return Err(ReadError::Unsupported(pid.to_string()));
            }
            Err(e) => return Err(e.into()),
        };

        let value = decode::decode_response(&definition, &response)?;
        let status = match &value {
            ReadingValue::Numeric(v) => {
                ReadingStatus::classify(*v, definition.thresholds.as_ref())
            }
            _ => ReadingStatus::Normal,
        };

        Ok(LiveReading {
            pid: definition.id,
            value,
            unit: definition.unit,
            status,
            timestamp: Utc::now(),
        })
    }

    /// Read several PIDs back to back over the serialized channel
    pub async fn read_many(&self, pids: &[String]) -> Vec<Result<LiveReading, ReadError>> {
        let mut results = Vec::with_capacity(pids.len());
        for pid in pids {
            results.push(self.read(pid).await);
        }
        results
    }

    /// Start a background polling loop over the given PIDs
    ///
    /// Each cycle produces one batch of successful readings. Cycles are
    /// skipped while an actuator test holds the channel. Dropping the
    /// subscription stops the loop.
    pub fn start_polling(
        &self,
        pids: Vec<String>,
        interval: Option<Duration>,
    ) -> PollSubscription {
        let interval = interval.unwrap_or(Duration::from_millis(self.polling.interval_ms));
        let (tx, rx) = mpsc::channel(16);
        let engine = self.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;
                if engine.exclusive.is_held() {
                    trace!("Channel busy with a test; skipping poll cycle");
                    continue;
                }

                // The lease is re-checked before every read so a test
                // that starts mid-cycle never interleaves with the rest
                // of the batch
                let mut batch = Vec::new();
                let mut abandoned = false;
                for pid in &pids {
                    if engine.exclusive.is_held() {
                        trace!("Test took the channel mid-cycle; abandoning poll cycle");
                        abandoned = true;
                        break;
                    }
                    match engine.read(pid).await {
                        Ok(reading) => batch.push(reading),
                        Err(ReadError::Unsupported(_)) => {}
                        Err(e) => trace!(error = %e, "Poll read failed"),
                    }
                }

                if abandoned {
                    continue;
                }
                if tx.send(batch).await.is_err() {
                    break;
                }
            }
        });

        PollSubscription { rx, handle }
    }
}

/// Receiving side of a polling loop; dropping it stops the loop
pub struct PollSubscription {
    rx: mpsc::Receiver<Vec<LiveReading>>,
    handle: JoinHandle<()>,
}

impl PollSubscription {
    /// Next batch of readings, `None` after the loop stops
    pub async fn recv(&mut self) -> Option<Vec<LiveReading>> {
        self.rx.recv().await
    }
}

impl Drop for PollSubscription {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use obdlink_core::{DecodeFormula, Device, SeedKeyAlgorithm, Thresholds};
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::config::{MockConfig, ProtocolConfig};
    use crate::transport::mock::MockBackend;
    use crate::transport::{LinkHandle, LinkHealth, SerialLinkBackend};

    struct TestProvider;

    impl ProfileProvider for TestProvider {
        fn standard_pids(&self) -> Vec<PidDefinition> {
            vec![
                PidDefinition {
                    id: "010C".to_string(),
                    name: "Engine RPM".to_string(),
                    unit: Some("rpm".to_string()),
                    byte_length: 2,
                    formula: DecodeFormula::Linear {
                        scale: 0.25,
                        offset: 0.0,
                    },
                    category: Some("engine".to_string()),
                    thresholds: Some(Thresholds {
                        warn_above: Some(6000.0),
                        crit_above: Some(7000.0),
                        ..Default::default()
                    }),
                },
                PidDefinition {
                    id: "0105".to_string(),
                    name: "Coolant temperature".to_string(),
                    unit: Some("°C".to_string()),
                    byte_length: 1,
                    formula: DecodeFormula::Linear {
                        scale: 1.0,
                        offset: -40.0,
                    },
                    category: Some("engine".to_string()),
                    thresholds: None,
                },
            ]
        }

        fn profile(&self, _id: &str) -> Option<Arc<VehicleProfile>> {
            None
        }

        fn seed_key_algorithm(&self, _name: &str) -> Option<Arc<dyn SeedKeyAlgorithm>> {
            None
        }
    }

    async fn engine_over_mock() -> (Arc<crate::transport::mock::MockAdapter>, PidEngine) {
        engine_with_latency(0).await
    }

    async fn engine_with_latency(
        latency_ms: u64,
    ) -> (Arc<crate::transport::mock::MockAdapter>, PidEngine) {
        let backend = MockBackend::new(&MockConfig { latency_ms });
        let adapter = backend.adapter();
        let device = Device::new("00:11:22:33:44:55", "OBDII-ELM327", true);
        let link = backend.open(&device).await.unwrap();
        let handle: LinkHandle = Arc::new(RwLock::new(Some(link)));

        let config = ProtocolConfig {
            command_timeout_ms: 500,
            idle_timeout_ms: 50,
            max_retries: 1,
        };
        let session = Arc::new(ProtocolSession::new(handle, LinkHealth::new(), config));
        session.initialize().await.unwrap();

        let engine = PidEngine::new(
            session,
            Arc::new(TestProvider),
            ExclusiveAccess::new(),
            PollingConfig { interval_ms: 20 },
        );
        (adapter, engine)
    }

    #[tokio::test]
    async fn test_read_rpm() {
        let (_adapter, engine) = engine_over_mock().await;

        let reading = engine.read("010C").await.unwrap();
        assert_eq!(reading.value, ReadingValue::Numeric(1726.0));
        assert_eq!(reading.unit.as_deref(), Some("rpm"));
        assert_eq!(reading.status, ReadingStatus::Normal);
    }

    #[tokio::test]
    async fn test_unknown_pid_rejected() {
        let (_adapter, engine) = engine_over_mock().await;

        let err = engine.read("01FF").await.unwrap_err();
        assert!(matches!(err, ReadError::UnknownPid(_)));
    }

    #[tokio::test]
    async fn test_no_data_caches_unsupported() {
        let (adapter, engine) = engine_over_mock().await;
        adapter.set_response("0105", "NO DATA");

        let err = engine.read("0105").await.unwrap_err();
        assert!(matches!(err, ReadError::Unsupported(_)));

        // Second read fails from the cache without touching the adapter
        adapter.set_silent("0105");
        let err = engine.read("0105").await.unwrap_err();
        assert!(matches!(err, ReadError::Unsupported(_)));

        engine.clear_unsupported_cache();
        adapter.clear_silent("0105");
        adapter.set_response("0105", "41 05 7B");
        let reading = engine.read("0105").await.unwrap();
        assert_eq!(reading.value, ReadingValue::Numeric(83.0));
    }

    #[tokio::test]
    async fn test_polling_delivers_batches() {
        let (_adapter, engine) = engine_over_mock().await;

        let mut sub = engine.start_polling(
            vec!["010C".to_string(), "0105".to_string()],
            Some(Duration::from_millis(20)),
        );

        let batch = sub.recv().await.unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].pid, "010C");
        assert_eq!(batch[1].pid, "0105");
    }

    #[tokio::test]
    async fn test_polling_skips_while_test_holds_channel() {
        let (_adapter, engine) = engine_over_mock().await;
        let guard = engine.exclusive.acquire().unwrap();

        let mut sub = engine.start_polling(
            vec!["010C".to_string()],
            Some(Duration::from_millis(10)),
        );

        // While the lease is held no batches arrive
        let waited = tokio::time::timeout(Duration::from_millis(80), sub.recv()).await;
        assert!(waited.is_err());

        drop(guard);
        let batch = sub.recv().await.unwrap();
        assert_eq!(batch.len(), 1);
    }

    #[tokio::test]
    async fn test_poll_cycle_abandoned_when_test_takes_channel() {
        let (_adapter, engine) = engine_with_latency(10).await;
        let pids = vec!["010C".to_string(); 6];

        let mut sub = engine.start_polling(pids, Some(Duration::from_millis(10)));

        // Let the first cycle get a few reads in, then grab the channel
        tokio::time::sleep(Duration::from_millis(25)).await;
        let guard = engine.exclusive.acquire().unwrap();

        // The in-flight cycle stops at the next read boundary and is
        // discarded; nothing is delivered while the lease is held
        let waited = tokio::time::timeout(Duration::from_millis(150), sub.recv()).await;
        assert!(waited.is_err());

        drop(guard);
        let batch = sub.recv().await.unwrap();
        assert_eq!(batch.len(), 6);
    }
}
