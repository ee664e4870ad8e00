//! PID definitions and decoded live readings

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Decode formula applied to the raw payload of a PID response
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum DecodeFormula {
    /// physical = unsigned_be(raw) * scale + offset
    Linear { scale: f64, offset: f64 },
    /// physical = signed_be(raw) * scale + offset
    SignedLinear { scale: f64, offset: f64 },
    /// Raw bytes interpreted as a bit field (value is the raw word)
    BitField,
    /// First payload byte mapped through a label table
    Lookup { table: HashMap<u8, String> },
}

/// Warning/critical thresholds bound to a PID
///
/// A reading outside the critical bounds classifies as critical, outside
/// the warning bounds as warning, otherwise normal.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Thresholds {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warn_above: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warn_below: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub crit_above: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub crit_below: Option<f64>,
}

/// Immutable PID definition, supplied by configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PidDefinition {
    /// Mode+PID hex string (e.g. "010C" for engine RPM)
    pub id: String,
    /// Human-readable name
    pub name: String,
    /// Unit of measurement
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    /// Expected payload length in bytes (after the echo header)
    pub byte_length: usize,
    /// Decode formula
    pub formula: DecodeFormula,
    /// Category tag (e.g. "engine", "fuel")
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    /// Status classification thresholds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thresholds: Option<Thresholds>,
}

/// Decoded value of a live reading
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ReadingValue {
    Numeric(f64),
    Text(String),
    Bits(u32),
}

/// Status classification of a reading against its PID thresholds
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReadingStatus {
    #[default]
    Normal,
    Warning,
    Critical,
}

impl ReadingStatus {
    /// Classify a numeric value against thresholds
    pub fn classify(value: f64, thresholds: Option<&Thresholds>) -> Self {
        let Some(t) = thresholds else {
            return ReadingStatus::Normal;
        };

        let beyond = |above: Option<f64>, below: Option<f64>| {
            above.is_some_and(|a| value > a) || below.is_some_and(|b| value < b)
        };

        if beyond(t.crit_above, t.crit_below) {
            ReadingStatus::Critical
        } else if beyond(t.warn_above, t.warn_below) {
            ReadingStatus::Warning
        } else {
            ReadingStatus::Normal
        }
    }
}

/// One decoded reading, recreated every poll cycle and never persisted
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LiveReading {
    /// PID id this reading belongs to
    pub pid: String,
    /// Decoded value
    pub value: ReadingValue,
    /// Unit copied from the definition
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    /// Classification against the PID's thresholds
    pub status: ReadingStatus,
    /// When the reading was taken
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_without_thresholds() {
        assert_eq!(ReadingStatus::classify(9999.0, None), ReadingStatus::Normal);
    }

    #[test]
    fn test_classify_warning_and_critical() {
        let t = Thresholds {
            warn_above: Some(100.0),
            crit_above: Some(120.0),
            ..Default::default()
        };
        assert_eq!(ReadingStatus::classify(90.0, Some(&t)), ReadingStatus::Normal);
        assert_eq!(
            ReadingStatus::classify(110.0, Some(&t)),
            ReadingStatus::Warning
        );
        assert_eq!(
            ReadingStatus::classify(130.0, Some(&t)),
            ReadingStatus::Critical
        );
    }

    #[test]
    fn test_classify_below_bounds() {
        let t = Thresholds {
            warn_below: Some(11.5),
            crit_below: Some(10.5),
            ..Default::default()
        };
        assert_eq!(
            ReadingStatus::classify(11.0, Some(&t)),
            ReadingStatus::Warning
        );
        assert_eq!(
            ReadingStatus::classify(10.0, Some(&t)),
            ReadingStatus::Critical
        );
    }
}
