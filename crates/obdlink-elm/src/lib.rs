//! obdlink-elm - ELM327 diagnostic communication core
//!
//! This crate talks to an ELM327-class OBD2 adapter over a Bluetooth
//! serial channel and runs standard and manufacturer-specific
//! diagnostics against a vehicle ECU.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                     caller (UI / service)                    │
//! │                                                              │
//! │  ┌───────────┐ ┌───────────┐ ┌─────────────┐ ┌────────────┐  │
//! │  │ PidEngine │ │DtcDecoder │ │ActuatorOrch │ │SecurityMgr │  │
//! │  └─────┬─────┘ └─────┬─────┘ └──────┬──────┘ └─────┬──────┘  │
//! │        └──────────┬──┴──────────────┴──────────────┘         │
//! │             ┌─────┴─────────┐                                │
//! │             │ProtocolSession│  (single serialized send)      │
//! │             └─────┬─────────┘                                │
//! │           ┌───────┴────────┐                                 │
//! │           │TransportManager│  (scan/pair/connect/reconnect)  │
//! │           └───────┬────────┘                                 │
//! │            ┌──────┴───────┐                                  │
//! │            │  SerialLink  │  (Bluetooth RFCOMM / mock)       │
//! │            └──────────────┘                                  │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! All higher components funnel through the protocol session's
//! serialized `send`; the transport exposes one half-duplex channel and
//! no two commands are ever in flight concurrently.

pub mod actuator;
pub mod config;
pub mod dtc;
pub mod pid;
pub mod protocol;
pub mod security;
pub mod transport;

pub use actuator::{ActuatorOrchestrator, ConfirmationToken, ExecError};
pub use config::DiagnosticConfig;
pub use dtc::{ClearError, DtcDecoder};
pub use pid::{PidEngine, PollSubscription, ReadError};
pub use protocol::{
    ExclusiveAccess, InitError, InitStep, ProtocolError, ProtocolSession, SendOptions,
};
pub use security::{AuthError, SecurityManager};
pub use transport::{
    create_backend, ConnectError, LinkHealth, SerialLink, SerialLinkBackend, TransportError,
    TransportManager,
};

// Re-export for convenience
pub use obdlink_core::{
    ConnectionEvent, ConnectionState, Device, DiagnosticError, DiagnosticResult, DtcRecord,
    LiveReading, PidDefinition, SecuritySession, TestExecution, VehicleProfile,
};
