//! Bluetooth RFCOMM backend via BlueZ
//!
//! ELM327 adapters expose a serial port profile over RFCOMM, usually on
//! channel 1. This backend discovers devices through a BlueZ session and
//! opens an RFCOMM stream per connection.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bluer::rfcomm::{SocketAddr, Stream};
use bluer::{Adapter, AdapterEvent, Address, Session};
use futures::{pin_mut, StreamExt};
use obdlink_core::{AdapterType, Device};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::{SerialLink, SerialLinkBackend, TransportError};
use crate::config::BluetoothConfig;

const READ_BUF_SIZE: usize = 256;

pub struct BluetoothBackend {
    config: BluetoothConfig,
}

impl BluetoothBackend {
    pub fn new(config: BluetoothConfig) -> Self {
        Self { config }
    }

    async fn adapter(&self) -> Result<Adapter, TransportError> {
        let session = Session::new()
            .await
            .map_err(|e| TransportError::ConnectionFailed(format!("BlueZ session: {e}")))?;

        let adapter = match &self.config.adapter {
            Some(name) => session
                .adapter(name)
                .map_err(|e| TransportError::InvalidConfig(format!("adapter '{name}': {e}")))?,
            None => session
                .default_adapter()
                .await
                .map_err(|e| TransportError::ConnectionFailed(format!("no adapter: {e}")))?,
        };

        adapter
            .set_powered(true)
            .await
            .map_err(|e| TransportError::ConnectionFailed(format!("power on adapter: {e}")))?;
        Ok(adapter)
    }

    async fn describe(&self, adapter: &Adapter, addr: Address) -> Option<Device> {
        let device = adapter.device(addr).ok()?;
        let name = device
            .name()
            .await
            .ok()
            .flatten()
            .unwrap_or_else(|| addr.to_string());
        let paired = device.is_paired().await.unwrap_or(false);
        let connected = device.is_connected().await.unwrap_or(false);

        Some(Device {
            address: addr.to_string(),
            adapter_type: AdapterType::from_name(&name),
            name,
            paired,
            connected,
        })
    }

    fn parse_address(address: &str) -> Result<Address, TransportError> {
        Address::from_str(address)
            .map_err(|e| TransportError::InvalidConfig(format!("address '{address}': {e}")))
    }
}

#[async_trait]
impl SerialLinkBackend for BluetoothBackend {
    async fn scan(&self, scan_timeout: Duration) -> Result<Vec<Device>, TransportError> {
        let adapter = self.adapter().await?;

        // Known (paired/cached) devices show up even when not advertising
        let mut found: HashMap<Address, Device> = HashMap::new();
        if let Ok(addresses) = adapter.device_addresses().await {
            for addr in addresses {
                if let Some(device) = self.describe(&adapter, addr).await {
                    found.insert(addr, device);
                }
            }
        }

        let events = adapter
            .discover_devices()
            .await
            .map_err(|e| TransportError::ScanFailed(e.to_string()))?;
        pin_mut!(events);

        let deadline = tokio::time::Instant::now() + scan_timeout;
        loop {
            let event = tokio::select! {
                event = events.next() => event,
                _ = tokio::time::sleep_until(deadline) => break,
            };
            match event {
                Some(AdapterEvent::DeviceAdded(addr)) => {
                    if let Some(device) = self.describe(&adapter, addr).await {
                        debug!(address = %addr, name = %device.name, "Device discovered");
                        found.insert(addr, device);
                    }
                }
                Some(AdapterEvent::DeviceRemoved(addr)) => {
                    found.remove(&addr);
                }
                Some(_) => {}
                None => break,
            }
        }

        Ok(found.into_values().collect())
    }

    async fn pair(&self, device: &Device) -> Result<bool, TransportError> {
        let adapter = self.adapter().await?;
        let addr = Self::parse_address(&device.address)?;
        let bt_device = adapter
            .device(addr)
            .map_err(|e| TransportError::PairingFailed(e.to_string()))?;

        if bt_device.is_paired().await.unwrap_or(false) {
            return Ok(true);
        }

        info!(address = %device.address, "Pairing");
        bt_device
            .pair()
            .await
            .map_err(|e| TransportError::PairingFailed(e.to_string()))?;
        Ok(bt_device.is_paired().await.unwrap_or(false))
    }

    async fn open(&self, device: &Device) -> Result<Arc<dyn SerialLink>, TransportError> {
        let addr = Self::parse_address(&device.address)?;
        let socket_addr = SocketAddr::new(addr, self.config.channel);
        let connect_timeout = Duration::from_millis(self.config.connect_timeout_ms);

        debug!(address = %addr, channel = self.config.channel, "Opening RFCOMM stream");

        let stream = timeout(connect_timeout, Stream::connect(socket_addr))
            .await
            .map_err(|_| TransportError::Timeout(format!("connect to {addr}")))?
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;

        info!(address = %addr, "RFCOMM stream open");
        Ok(Arc::new(RfcommLink {
            stream: Mutex::new(stream),
            connected: AtomicBool::new(true),
        }))
    }
}

/// One open RFCOMM stream
struct RfcommLink {
    stream: Mutex<Stream>,
    connected: AtomicBool,
}

#[async_trait]
impl SerialLink for RfcommLink {
    async fn write_all(&self, data: &[u8]) -> Result<(), TransportError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectionClosed);
        }
        let mut stream = self.stream.lock().await;
        stream.write_all(data).await.map_err(|e| {
            self.connected.store(false, Ordering::SeqCst);
            TransportError::SendFailed(e.to_string())
        })
    }

    async fn read_chunk(&self, read_timeout: Duration) -> Result<Vec<u8>, TransportError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectionClosed);
        }
        let mut stream = self.stream.lock().await;
        let mut buf = [0u8; READ_BUF_SIZE];

        let n = timeout(read_timeout, stream.read(&mut buf))
            .await
            .map_err(|_| TransportError::Timeout("read".to_string()))?
            .map_err(|e| {
                self.connected.store(false, Ordering::SeqCst);
                TransportError::ReceiveFailed(e.to_string())
            })?;

        if n == 0 {
            self.connected.store(false, Ordering::SeqCst);
            return Err(TransportError::ConnectionClosed);
        }
        Ok(buf[..n].to_vec())
    }

    async fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        self.connected.store(false, Ordering::SeqCst);
        let mut stream = self.stream.lock().await;
        if let Err(e) = stream.shutdown().await {
            warn!(error = %e, "RFCOMM shutdown failed");
        }
    }
}
