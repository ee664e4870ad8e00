//! Trouble code reading, decoding, and clearing
//!
//! Codes come back as two-byte pairs; the top two bits of the first
//! byte select the family (P/C/B/U), the rest spell the digits.
//! Descriptions and severity overrides come from the active vehicle
//! profile, with a category heuristic as fallback.

use std::sync::Arc;

use obdlink_core::{
    DtcCategory, DtcLifecycle, DtcRecord, DtcSeverity, VehicleProfile,
};
use parking_lot::RwLock;
use thiserror::Error;
use tracing::{debug, info};

use crate::protocol::{ProtocolError, ProtocolSession, SendOptions};

/// Errors from `clear_all`
#[derive(Debug, Error, Clone)]
pub enum ClearError {
    #[error("Vehicle rejected the clear: {0}")]
    Rejected(String),

    #[error("Clear response malformed: {0}")]
    Malformed(String),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

impl From<ClearError> for obdlink_core::DiagnosticError {
    fn from(err: ClearError) -> Self {
        match err {
            ClearError::Rejected(msg) => obdlink_core::DiagnosticError::Negative(msg),
            ClearError::Malformed(msg) => obdlink_core::DiagnosticError::Protocol(msg),
            ClearError::Protocol(e) => e.into(),
        }
    }
}

pub struct DtcDecoder {
    session: Arc<ProtocolSession>,
    profile: Arc<RwLock<Option<Arc<VehicleProfile>>>>,
}

impl DtcDecoder {
    pub fn new(session: Arc<ProtocolSession>) -> Self {
        Self {
            session,
            profile: Arc::new(RwLock::new(None)),
        }
    }

    /// Select the vehicle profile supplying descriptions and severity
    pub fn set_profile(&self, profile: Option<Arc<VehicleProfile>>) {
        *self.profile.write() = profile;
    }

    /// Confirmed codes (mode 03)
    pub async fn read_stored(&self) -> Result<Vec<DtcRecord>, ProtocolError> {
        self.read_codes("03", 0x43, DtcLifecycle::Stored).await
    }

    /// Detected but unconfirmed codes (mode 07)
    pub async fn read_pending(&self) -> Result<Vec<DtcRecord>, ProtocolError> {
        self.read_codes("07", 0x47, DtcLifecycle::Pending).await
    }

    /// Codes that survive a clear until verified repaired (mode 0A)
    pub async fn read_permanent(&self) -> Result<Vec<DtcRecord>, ProtocolError> {
        self.read_codes("0A", 0x4A, DtcLifecycle::Permanent).await
    }

    /// Clear all stored codes and freeze frames (mode 04)
    ///
    /// All or nothing: the vehicle either clears everything or rejects
    /// the request. Clearing also resets readiness monitors, so the
    /// caller is expected to confirm with the user first.
    pub async fn clear_all(&self) -> Result<(), ClearError> {
        let response = self
            .session
            .send_command("04", SendOptions::non_idempotent())
            .await
            .map_err(|e| match e {
                ProtocolError::Negative(token) => ClearError::Rejected(token),
                other => ClearError::Protocol(other),
            })?;

        let bytes = payload_bytes(&response).map_err(ClearError::Malformed)?;
        if bytes.first() != Some(&0x44) {
            return Err(ClearError::Malformed(format!(
                "unexpected reply: {response}"
            )));
        }

        info!("Trouble codes cleared");
        Ok(())
    }

    async fn read_codes(
        &self,
        mode: &str,
        expected_echo: u8,
        lifecycle: DtcLifecycle,
    ) -> Result<Vec<DtcRecord>, ProtocolError> {
        let response = match self.session.send_command(mode, SendOptions::default()).await {
            Ok(response) => response,
            // No codes set reads as NO DATA on many adapters
            Err(ProtocolError::Negative(token)) if token == "NO DATA" => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let bytes = payload_bytes(&response).map_err(ProtocolError::Malformed)?;
        if bytes.first() != Some(&expected_echo) {
            return Err(ProtocolError::Malformed(format!(
                "unexpected mode echo: {response}"
            )));
        }

        let codes = decode_pairs(&bytes[1..], lifecycle, self.profile.read().as_deref());
        debug!(mode, count = codes.len(), "Read trouble codes");
        Ok(codes)
    }
}

/// Hex payload of a response, with multi-frame prefixes stripped
fn payload_bytes(response: &str) -> Result<Vec<u8>, String> {
    let mut compact = String::new();
    for line in response.lines() {
        // Indexed segment lines keep only the data after the colon; a
        // bare count line carries no code bytes and is dropped
        let data = match line.split_once(':') {
            Some((_, data)) => data,
            None if response.contains(':') => continue,
            None => line,
        };
        compact.extend(data.chars().filter(|c| !c.is_whitespace()));
    }
    hex::decode(&compact).map_err(|e| format!("hex payload: {e}"))
}

/// Decode byte pairs into records, skipping `00 00` padding
fn decode_pairs(
    payload: &[u8],
    lifecycle: DtcLifecycle,
    profile: Option<&VehicleProfile>,
) -> Vec<DtcRecord> {
    // Some ECUs prepend a count byte, leaving an odd payload length
    let pairs = if payload.len() % 2 == 1 {
        &payload[1..]
    } else {
        payload
    };

    pairs
        .chunks_exact(2)
        .filter(|pair| pair[0] != 0x00 || pair[1] != 0x00)
        .map(|pair| decode_pair([pair[0], pair[1]], lifecycle, profile))
        .collect()
}

fn decode_pair(
    raw: [u8; 2],
    lifecycle: DtcLifecycle,
    profile: Option<&VehicleProfile>,
) -> DtcRecord {
    let category = DtcCategory::from_high_byte(raw[0]);
    let code = format!(
        "{}{}{:01X}{:02X}",
        category.prefix(),
        (raw[0] >> 4) & 0x03,
        raw[0] & 0x0F,
        raw[1]
    );

    let description = profile.and_then(|p| p.dtc_descriptions.get(&code).cloned());
    let severity = profile
        .and_then(|p| p.dtc_severity.get(&code).copied())
        .unwrap_or_else(|| default_severity(category));

    DtcRecord {
        code,
        raw,
        category,
        lifecycle,
        severity,
        description,
    }
}

/// Fallback severity when the profile has no entry for a code
fn default_severity(category: DtcCategory) -> DtcSeverity {
    match category {
        DtcCategory::Chassis | DtcCategory::Network => DtcSeverity::High,
        DtcCategory::Powertrain => DtcSeverity::Medium,
        DtcCategory::Body => DtcSeverity::Low,
    }
}
