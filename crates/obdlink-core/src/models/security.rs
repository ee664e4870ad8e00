//! Security access sessions

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// An authenticated seed-key exchange with one module
///
/// Created on a successful seed-key exchange; invalidated on transport
/// disconnect, on switching target module, or after expiry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecuritySession {
    /// Target module (address or logical name)
    pub module: String,
    /// Seed received from the module
    pub seed: Vec<u8>,
    /// Key computed and accepted by the module
    pub key: Vec<u8>,
    /// Whether the exchange completed successfully
    pub authenticated: bool,
    /// When this session stops being honored
    pub expires_at: DateTime<Utc>,
}

impl SecuritySession {
    /// Whether this session is usable for `module` right now
    pub fn is_valid_for(&self, module: &str) -> bool {
        self.authenticated && self.module == module && Utc::now() < self.expires_at
    }
}
