//! Transport layer for adapter communication
//!
//! This module provides serial link backends for talking to an
//! ELM327-class adapter:
//! - Bluetooth RFCOMM via BlueZ (Linux only, `bluetooth` feature)
//! - Mock backend with a scripted adapter for testing
//!
//! The [`TransportManager`] on top of a backend owns the process-wide
//! connection state, the connection history, and the reconnection
//! policy.

mod error;
mod link;
mod manager;
pub mod mock;

#[cfg(all(target_os = "linux", feature = "bluetooth"))]
pub mod bluetooth;

pub use error::{ConnectError, TransportError};
pub use link::{LinkHealth, SerialLink, SerialLinkBackend};
pub use manager::{LinkHandle, TransportManager};

use std::sync::Arc;

use crate::config::TransportConfig;

/// Create a serial link backend based on configuration
pub fn create_backend(
    config: &TransportConfig,
) -> Result<Arc<dyn SerialLinkBackend>, TransportError> {
    match config {
        #[cfg(all(target_os = "linux", feature = "bluetooth"))]
        TransportConfig::Bluetooth(cfg) => {
            let backend = bluetooth::BluetoothBackend::new(cfg.clone());
            Ok(Arc::new(backend))
        }
        #[cfg(not(all(target_os = "linux", feature = "bluetooth")))]
        TransportConfig::Bluetooth(_) => Err(TransportError::Unsupported(
            "Bluetooth requires Linux and the 'bluetooth' feature".to_string(),
        )),
        TransportConfig::Mock(cfg) => {
            let backend = mock::MockBackend::new(cfg);
            Ok(Arc::new(backend))
        }
    }
}
