//! Collaborator traits the diagnostic core consumes
//!
//! The surrounding product supplies these: static PID/DTC reference
//! tables and manufacturer command maps come from a [`ProfileProvider`],
//! connection history persistence from a [`HistoryStore`], and
//! manufacturer seed-key algorithms from [`SeedKeyAlgorithm`]
//! implementations. The core never hard-codes any of this data.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::models::{
    ActuatorTestDefinition, ConnectionHistoryEntry, DtcSeverity, PidDefinition,
};

/// A manufacturer-specific diagnostic profile
///
/// Maps a vehicle to its extended PID set, DTC description/severity
/// tables, actuator command map, and security parameters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VehicleProfile {
    /// Stable identifier (e.g. "vag", "generic")
    pub id: String,
    /// Human-readable name
    pub name: String,
    /// Manufacturer-specific PID definitions on top of the standard set
    #[serde(default)]
    pub extended_pids: Vec<PidDefinition>,
    /// DTC code -> description
    #[serde(default)]
    pub dtc_descriptions: HashMap<String, String>,
    /// DTC code -> severity override (prefix heuristics apply otherwise)
    #[serde(default)]
    pub dtc_severity: HashMap<String, DtcSeverity>,
    /// Actuator tests available for this vehicle
    #[serde(default)]
    pub actuator_tests: Vec<ActuatorTestDefinition>,
    /// Name of the seed-key algorithm used for security access
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed_key_algorithm: Option<String>,
    /// Security session lifetime in seconds
    #[serde(default = "default_security_ttl")]
    pub security_ttl_secs: u64,
}

fn default_security_ttl() -> u64 {
    300
}

/// Supplies PID/DTC reference data and vehicle profiles
pub trait ProfileProvider: Send + Sync {
    /// Standard (SAE J1979) PID definitions
    fn standard_pids(&self) -> Vec<PidDefinition>;

    /// Look up a vehicle profile by id
    fn profile(&self, id: &str) -> Option<Arc<VehicleProfile>>;

    /// Resolve a seed-key algorithm by name
    fn seed_key_algorithm(&self, name: &str) -> Option<Arc<dyn SeedKeyAlgorithm>>;
}

/// Computes a security access key from a module seed
///
/// One implementation per manufacturer; the core never hard-codes a
/// single algorithm.
pub trait SeedKeyAlgorithm: Send + Sync {
    fn compute_key(&self, seed: &[u8]) -> Vec<u8>;
}

/// Persistence for the connection history log
///
/// The log is append-only and ordered most-recent-first; `clear` is the
/// only way to remove entries.
#[async_trait]
pub trait HistoryStore: Send + Sync {
    /// Load the history, most recent first
    async fn load(&self) -> Vec<ConnectionHistoryEntry>;

    /// Append one attempt
    async fn append(&self, entry: ConnectionHistoryEntry);

    /// Drop all entries
    async fn clear(&self);
}

/// In-memory history store, bounded to the most recent entries
///
/// Suitable default when the product supplies no persistent store.
#[derive(Default)]
pub struct MemoryHistory {
    entries: tokio::sync::RwLock<Vec<ConnectionHistoryEntry>>,
}

const MEMORY_HISTORY_CAP: usize = 100;

impl MemoryHistory {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl HistoryStore for MemoryHistory {
    async fn load(&self) -> Vec<ConnectionHistoryEntry> {
        self.entries.read().await.clone()
    }

    async fn append(&self, entry: ConnectionHistoryEntry) {
        let mut entries = self.entries.write().await;
        entries.insert(0, entry);
        entries.truncate(MEMORY_HISTORY_CAP);
    }

    async fn clear(&self) {
        self.entries.write().await.clear();
    }
}
