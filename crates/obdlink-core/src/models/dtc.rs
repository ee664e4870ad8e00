//! Diagnostic trouble code models

use serde::{Deserialize, Serialize};

/// DTC code family from the top two bits of the first byte
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DtcCategory {
    /// P codes - engine and transmission
    Powertrain,
    /// C codes - ABS, steering, suspension
    Chassis,
    /// B codes - airbags, climate, body electronics
    Body,
    /// U codes - network/communication
    Network,
}

impl DtcCategory {
    /// Category from the DTC high byte (top two bits: 00 P, 01 C, 10 B, 11 U)
    pub fn from_high_byte(high: u8) -> Self {
        match (high >> 6) & 0x03 {
            0 => DtcCategory::Powertrain,
            1 => DtcCategory::Chassis,
            2 => DtcCategory::Body,
            _ => DtcCategory::Network,
        }
    }

    pub fn prefix(&self) -> char {
        match self {
            DtcCategory::Powertrain => 'P',
            DtcCategory::Chassis => 'C',
            DtcCategory::Body => 'B',
            DtcCategory::Network => 'U',
        }
    }
}

/// Where in its lifecycle a code was read from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DtcLifecycle {
    /// Confirmed and stored (mode 03)
    Stored,
    /// Detected but not yet confirmed (mode 07)
    Pending,
    /// Survives clear until verified repaired (mode 0A)
    Permanent,
}

/// Severity classification, from code prefix plus manufacturer table
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DtcSeverity {
    Low,
    #[default]
    Medium,
    High,
}

/// A decoded trouble code
///
/// Created by a read operation; cleared en masse by `clear_all`, never
/// partially. Description text is supplied by external configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DtcRecord {
    /// Canonical code, e.g. "P0301"
    pub code: String,
    /// Raw byte pair as received
    pub raw: [u8; 2],
    /// Code family
    pub category: DtcCategory,
    /// Lifecycle the code was read from
    pub lifecycle: DtcLifecycle,
    /// Severity classification
    pub severity: DtcSeverity,
    /// Human-readable description, if the profile knows the code
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}
