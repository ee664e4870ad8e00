//! Discovered Bluetooth adapter devices

use serde::{Deserialize, Serialize};

/// Adapter chipset classification derived from the advertised name
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdapterType {
    /// ELM327 or clone
    Elm327,
    /// OBDLink (STN chipset)
    ObdLink,
    /// Name suggests an OBD device of unknown chipset
    Generic,
    /// No OBD hint in the name
    #[default]
    Unknown,
}

impl AdapterType {
    /// Classify an adapter from its advertised device name
    pub fn from_name(name: &str) -> Self {
        let lower = name.to_lowercase();
        if lower.contains("elm327") {
            AdapterType::Elm327
        } else if lower.contains("obdlink") || lower.contains("stn") {
            AdapterType::ObdLink
        } else if lower.contains("obd") {
            AdapterType::Generic
        } else {
            AdapterType::Unknown
        }
    }
}

/// A Bluetooth device seen during a scan session
///
/// Created on scan discovery, mutated on pair/connect, discarded at the
/// end of the scan session unless remembered in connection history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    /// Bluetooth MAC address (e.g. "00:11:22:33:44:55")
    pub address: String,
    /// Advertised device name
    pub name: String,
    /// Whether the device is already paired with the host
    pub paired: bool,
    /// Whether we currently hold an open channel to the device
    pub connected: bool,
    /// Chipset classification from name heuristics
    pub adapter_type: AdapterType,
}

impl Device {
    pub fn new(address: impl Into<String>, name: impl Into<String>, paired: bool) -> Self {
        let name = name.into();
        let adapter_type = AdapterType::from_name(&name);
        Self {
            address: address.into(),
            name,
            paired,
            connected: false,
            adapter_type,
        }
    }

    /// Compatibility score (0-100) used to rank scan results.
    ///
    /// Name substrings reward likely OBD adapters; a single name bonus
    /// applies for "obd"/"obdii" so the two are not double-counted.
    /// Existing pairing adds on top, capped at 100.
    pub fn compatibility_score(&self) -> u8 {
        let lower = self.name.to_lowercase();
        let mut score = 0u32;

        if lower.contains("elm327") {
            score += 40;
        }
        if lower.contains("obd") {
            // covers "obd", "obdii" and "obd2" names
            score += 30;
        }
        if self.paired {
            score += 30;
        }

        score.min(100) as u8
    }
}
