//! ELM327 protocol session
//!
//! Framing, init handshake, and the single serialized command channel
//! every higher-level component funnels through.

mod error;
mod exclusive;
mod session;

pub use error::{InitError, InitStep, ProtocolError};
pub use exclusive::{ExclusiveAccess, ExclusiveGuard};
pub use session::{ProtocolSession, SendOptions};
