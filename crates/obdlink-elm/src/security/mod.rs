//! Security access (seed-key exchange, service 27)
//!
//! Protected operations require unlocking the target module first: the
//! module hands out a seed, the manufacturer algorithm computes a key,
//! and the module grants a time-limited session when the key matches.
//! The algorithm itself is injected through the profile provider; this
//! module never hard-codes one.

use std::sync::Arc;

use chrono::{Duration, Utc};
use obdlink_core::{ProfileProvider, SecuritySession, VehicleProfile};
use parking_lot::RwLock;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::protocol::{ProtocolError, ProtocolSession, SendOptions};

const REQUEST_SEED: &str = "2701";
const SEND_KEY: &str = "2702";

#[derive(Debug, Error, Clone)]
pub enum AuthError {
    #[error("No seed-key algorithm available: {0}")]
    NoAlgorithm(String),

    #[error("No pending seed for module {0}; request a seed first")]
    NoPendingSeed(String),

    #[error("Module rejected the key: {0}")]
    Rejected(String),

    #[error("Malformed security response: {0}")]
    Malformed(String),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

impl From<AuthError> for obdlink_core::DiagnosticError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::NoAlgorithm(msg) => obdlink_core::DiagnosticError::Unsupported(msg),
            AuthError::NoPendingSeed(module) => obdlink_core::DiagnosticError::InvalidRequest(
                format!("no pending seed for {module}"),
            ),
            AuthError::Rejected(msg) => obdlink_core::DiagnosticError::SecurityRequired(msg),
            AuthError::Malformed(msg) => obdlink_core::DiagnosticError::Protocol(msg),
            AuthError::Protocol(e) => e.into(),
        }
    }
}

pub struct SecurityManager {
    session: Arc<ProtocolSession>,
    provider: Arc<dyn ProfileProvider>,
    profile: Arc<RwLock<Option<Arc<VehicleProfile>>>>,
    current: Arc<RwLock<Option<SecuritySession>>>,
}

impl SecurityManager {
    pub fn new(session: Arc<ProtocolSession>, provider: Arc<dyn ProfileProvider>) -> Self {
        Self {
            session,
            provider,
            profile: Arc::new(RwLock::new(None)),
            current: Arc::new(RwLock::new(None)),
        }
    }

    /// Select the vehicle profile supplying algorithm name and TTL.
    /// Drops any active session.
    pub fn set_profile(&self, profile: Option<Arc<VehicleProfile>>) {
        *self.profile.write() = profile;
        self.invalidate();
    }

    /// Whether a valid session for `module` is active
    pub fn is_authenticated(&self, module: &str) -> bool {
        self.current
            .read()
            .as_ref()
            .is_some_and(|s| s.is_valid_for(module))
    }

    /// Current session, if any
    pub fn session(&self) -> Option<SecuritySession> {
        self.current.read().clone()
    }

    /// Drop the active session (call on disconnect)
    pub fn invalidate(&self) {
        if self.current.write().take().is_some() {
            debug!("Security session invalidated");
        }
    }

    /// Invalidate automatically whenever the transport leaves the
    /// connected state. Returns the watcher task handle; abort it to
    /// stop watching.
    pub fn invalidate_on_disconnect(
        &self,
        mut events: tokio::sync::broadcast::Receiver<obdlink_core::ConnectionEvent>,
    ) -> tokio::task::JoinHandle<()> {
        let current = self.current.clone();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(obdlink_core::ConnectionEvent::StateChanged(state))
                        if !state.is_connected() =>
                    {
                        if current.write().take().is_some() {
                            debug!("Security session invalidated on disconnect");
                        }
                    }
                    Ok(_) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    /// Request a seed from `module`
    ///
    /// An all-zero seed means the module is already unlocked; the
    /// session becomes valid immediately without a key exchange.
    /// Targeting a different module drops any previous session.
    pub async fn begin_access(&self, module: &str) -> Result<Vec<u8>, AuthError> {
        {
            let mut current = self.current.write();
            if current.as_ref().is_some_and(|s| s.module != module) {
                *current = None;
            }
        }

        let response = self
            .session
            .send_command(REQUEST_SEED, SendOptions::default())
            .await
            .map_err(|e| match e {
                ProtocolError::Negative(token) => AuthError::Rejected(token),
                other => AuthError::Protocol(other),
            })?;

        let bytes = parse_hex(&response)?;
        if bytes.len() < 2 || bytes[0] != 0x67 || bytes[1] != 0x01 {
            return Err(AuthError::Malformed(format!("seed reply: {response}")));
        }
        let seed = bytes[2..].to_vec();

        if !seed.is_empty() && seed.iter().all(|&b| b == 0x00) {
            info!(module, "Module already unlocked (zero seed)");
            *self.current.write() = Some(SecuritySession {
                module: module.to_string(),
                seed: seed.clone(),
                key: Vec::new(),
                authenticated: true,
                expires_at: Utc::now() + self.ttl(),
            });
            return Ok(seed);
        }

        debug!(module, seed_len = seed.len(), "Seed received");
        *self.current.write() = Some(SecuritySession {
            module: module.to_string(),
            seed: seed.clone(),
            key: Vec::new(),
            authenticated: false,
            expires_at: Utc::now() + self.ttl(),
        });
        Ok(seed)
    }

    /// Compute the key for the pending seed and send it
    pub async fn complete_access(&self, module: &str) -> Result<SecuritySession, AuthError> {
        let seed = {
            let current = self.current.read();
            match current.as_ref() {
                Some(s) if s.module == module && !s.authenticated => s.seed.clone(),
                Some(s) if s.module == module && s.authenticated => return Ok(s.clone()),
                _ => return Err(AuthError::NoPendingSeed(module.to_string())),
            }
        };

        let algorithm_name = self
            .profile
            .read()
            .as_ref()
            .and_then(|p| p.seed_key_algorithm.clone())
            .ok_or_else(|| AuthError::NoAlgorithm("profile configures none".to_string()))?;
        let algorithm = self
            .provider
            .seed_key_algorithm(&algorithm_name)
            .ok_or_else(|| AuthError::NoAlgorithm(algorithm_name.clone()))?;

        let key = algorithm.compute_key(&seed);
        let command = format!("{SEND_KEY}{}", hex::encode_upper(&key));

        let response = self
            .session
            .send_command(&command, SendOptions::non_idempotent())
            .await
            .map_err(|e| match e {
                ProtocolError::Negative(token) => {
                    warn!(module, token, "Key rejected");
                    AuthError::Rejected(token)
                }
                other => AuthError::Protocol(other),
            })?;

        let bytes = parse_hex(&response)?;
        if bytes.len() < 2 || bytes[0] != 0x67 || bytes[1] != 0x02 {
            return Err(AuthError::Malformed(format!("key reply: {response}")));
        }

        let session = SecuritySession {
            module: module.to_string(),
            seed,
            key,
            authenticated: true,
            expires_at: Utc::now() + self.ttl(),
        };
        *self.current.write() = Some(session.clone());
        info!(module, algorithm = %algorithm_name, "Security access granted");
        Ok(session)
    }

    fn ttl(&self) -> Duration {
        let secs = self
            .profile
            .read()
            .as_ref()
            .map(|p| p.security_ttl_secs)
            .unwrap_or(300);
        Duration::seconds(secs as i64)
    }
}

fn parse_hex(response: &str) -> Result<Vec<u8>, AuthError> {
    let compact: String = response.chars().filter(|c| !c.is_whitespace()).collect();
    hex::decode(&compact).map_err(|e| AuthError::Malformed(format!("hex payload: {e}")))
}

#[cfg(test)]
mod tests {
    use obdlink_core::{Device, PidDefinition, SeedKeyAlgorithm};

    use super::*;
    use crate::config::{MockConfig, ProtocolConfig};
    use crate::transport::mock::{MockAdapter, MockBackend};
    use crate::transport::{LinkHandle, LinkHealth, SerialLinkBackend};

    struct XorAlgorithm;

    impl SeedKeyAlgorithm for XorAlgorithm {
        fn compute_key(&self, seed: &[u8]) -> Vec<u8> {
            seed.iter().map(|b| b ^ 0xFF).collect()
        }
    }

    struct TestProvider;

    impl ProfileProvider for TestProvider {
        fn standard_pids(&self) -> Vec<PidDefinition> {
            Vec::new()
        }

        fn profile(&self, _id: &str) -> Option<Arc<VehicleProfile>> {
            None
        }

        fn seed_key_algorithm(&self, name: &str) -> Option<Arc<dyn SeedKeyAlgorithm>> {
            (name == "xor").then(|| Arc::new(XorAlgorithm) as Arc<dyn SeedKeyAlgorithm>)
        }
    }

    fn xor_profile(ttl_secs: u64) -> Arc<VehicleProfile> {
        Arc::new(VehicleProfile {
            id: "test".to_string(),
            name: "Test vehicle".to_string(),
            seed_key_algorithm: Some("xor".to_string()),
            security_ttl_secs: ttl_secs,
            ..Default::default()
        })
    }

    async fn manager_over_mock() -> (Arc<MockAdapter>, SecurityManager) {
        let backend = MockBackend::new(&MockConfig::default());
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

        let manager = SecurityManager::new(session, Arc::new(TestProvider));
        manager.set_profile(Some(xor_profile(300)));
        (adapter, manager)
    }

    #[tokio::test]
    async fn test_seed_key_exchange() {
        let (_adapter, manager) = manager_over_mock().await;

        let seed = manager.begin_access("engine").await.unwrap();
        assert_eq!(seed, vec![0x12, 0x34]);
        assert!(!manager.is_authenticated("engine"));

        let session = manager.complete_access("engine").await.unwrap();
        assert!(session.authenticated);
        assert_eq!(session.key, vec![0xED, 0xCB]);
        assert!(manager.is_authenticated("engine"));
    }

    #[tokio::test]
    async fn test_zero_seed_means_unlocked() {
        let (adapter, manager) = manager_over_mock().await;
        adapter.set_response("2701", "67 01 00 00");

        let seed = manager.begin_access("engine").await.unwrap();
        assert_eq!(seed, vec![0x00, 0x00]);
        assert!(manager.is_authenticated("engine"));
    }

    #[tokio::test]
    async fn test_complete_without_seed_rejected() {
        let (_adapter, manager) = manager_over_mock().await;

        let err = manager.complete_access("engine").await.unwrap_err();
        assert!(matches!(err, AuthError::NoPendingSeed(_)));
    }

    #[tokio::test]
    async fn test_module_switch_drops_session() {
        let (_adapter, manager) = manager_over_mock().await;

        manager.begin_access("engine").await.unwrap();
        manager.complete_access("engine").await.unwrap();
        assert!(manager.is_authenticated("engine"));

        manager.begin_access("abs").await.unwrap();
        assert!(!manager.is_authenticated("engine"));
    }

    #[tokio::test]
    async fn test_rejected_key() {
        let (adapter, manager) = manager_over_mock().await;
        adapter.set_response("2702", "ERROR");

        manager.begin_access("engine").await.unwrap();
        let err = manager.complete_access("engine").await.unwrap_err();
        assert!(matches!(err, AuthError::Rejected(_)));
        assert!(!manager.is_authenticated("engine"));
    }

    #[tokio::test]
    async fn test_expired_session_not_honored() {
        let (_adapter, manager) = manager_over_mock().await;
        manager.set_profile(Some(xor_profile(0)));

        manager.begin_access("engine").await.unwrap();
        manager.complete_access("engine").await.unwrap();
        assert!(!manager.is_authenticated("engine"));
    }

    #[tokio::test]
    async fn test_disconnect_invalidates_session() {
        use obdlink_core::{ConnectionEvent, ConnectionState};

        let (_adapter, manager) = manager_over_mock().await;
        let (tx, rx) = tokio::sync::broadcast::channel(8);
        let watcher = manager.invalidate_on_disconnect(rx);

        manager.begin_access("engine").await.unwrap();
        manager.complete_access("engine").await.unwrap();
        assert!(manager.is_authenticated("engine"));

        tx.send(ConnectionEvent::StateChanged(ConnectionState::default()))
            .unwrap();

        for _ in 0..100 {
            if !manager.is_authenticated("engine") {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        }
        assert!(!manager.is_authenticated("engine"));
        watcher.abort();
    }

    #[tokio::test]
    async fn test_missing_algorithm() {
        let (_adapter, manager) = manager_over_mock().await;
        manager.set_profile(Some(Arc::new(VehicleProfile::default())));

        manager.begin_access("engine").await.unwrap();
        let err = manager.complete_access("engine").await.unwrap_err();
        assert!(matches!(err, AuthError::NoAlgorithm(_)));
    }
}
