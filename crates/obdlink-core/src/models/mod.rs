//! Domain models shared across the diagnostic core

mod actuator;
mod connection;
mod device;
mod dtc;
mod pid;
mod security;

pub use actuator::{
    ActuatorTestDefinition, RiskLevel, TestExecution, TestKind, TestOutcome, TestProgress,
    TestStatus,
};
pub use connection::{ConnectionHistoryEntry, ConnectionPhase, ConnectionQuality, ConnectionState};
pub use device::{AdapterType, Device};
pub use dtc::{DtcCategory, DtcLifecycle, DtcRecord, DtcSeverity};
pub use pid::{
    DecodeFormula, LiveReading, PidDefinition, ReadingStatus, ReadingValue, Thresholds,
};
pub use security::SecuritySession;
