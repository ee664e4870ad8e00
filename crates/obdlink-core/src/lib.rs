//! obdlink-core - Core types and collaborator traits for the obdlink
//! diagnostic core
//!
//! This crate holds the domain model shared between the diagnostic
//! communication core (`obdlink-elm`) and its external collaborators:
//! the configuration provider that supplies PID/DTC reference tables
//! and manufacturer command maps, the persistence provider for
//! connection history, and the event types the UI subscribes to.
//!
//! It deliberately contains no protocol logic and no I/O.

pub mod error;
pub mod events;
pub mod models;
pub mod provider;

pub use error::{DiagnosticError, DiagnosticResult};
pub use events::ConnectionEvent;
pub use models::*;
pub use provider::{
    HistoryStore, MemoryHistory, ProfileProvider, SeedKeyAlgorithm, VehicleProfile,
};
