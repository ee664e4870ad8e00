//! Mock transport backend with a scripted ELM327 adapter
//!
//! The mock adapter speaks just enough of the ELM327 command set for
//! the core to run end to end: AT handshake commands, echo state, a
//! canned OBD response table, and failure injection (silent commands,
//! forced timeouts, mid-command disconnects, failed opens).

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use obdlink_core::Device;
use parking_lot::{Mutex, RwLock};

use super::{SerialLink, SerialLinkBackend, TransportError};
use crate::config::MockConfig;

/// Bytes handed out per `read_chunk` call, small enough to exercise
/// partial-frame buffering in the session.
const CHUNK_SIZE: usize = 16;

/// Scripted adapter state shared by all links the backend opens
pub struct MockAdapter {
    latency_ms: u64,
    connected: AtomicBool,
    echo: AtomicBool,
    /// Caller-supplied responses, looked up before the built-ins
    responses: RwLock<Vec<(String, String)>>,
    /// Commands that produce no response at all
    silent: RwLock<HashSet<String>>,
    /// Commands that kill the link after the write is accepted
    disconnect_on: RwLock<HashSet<String>>,
    /// Commands whose write fails with an I/O error
    fail_write_on: RwLock<HashSet<String>>,
    /// Forced read timeouts remaining
    timeouts_to_inject: AtomicU32,
    /// Pending output bytes toward the tester
    outbox: Mutex<VecDeque<u8>>,
    /// Partial command line received so far
    inbox: Mutex<Vec<u8>>,
}

impl MockAdapter {
    fn new(latency_ms: u64) -> Self {
        Self {
            latency_ms,
            connected: AtomicBool::new(true),
            echo: AtomicBool::new(true),
            responses: RwLock::new(Vec::new()),
            silent: RwLock::new(HashSet::new()),
            disconnect_on: RwLock::new(HashSet::new()),
            fail_write_on: RwLock::new(HashSet::new()),
            timeouts_to_inject: AtomicU32::new(0),
            outbox: Mutex::new(VecDeque::new()),
            inbox: Mutex::new(Vec::new()),
        }
    }

    /// Script a response for a command (exact match wins over prefix
    /// match); scripting the same command again replaces the entry
    pub fn set_response(&self, command: impl Into<String>, response: impl Into<String>) {
        let key = normalize(&command.into());
        let mut responses = self.responses.write();
        responses.retain(|(req, _)| *req != key);
        responses.push((key, response.into()));
    }

    /// Make a command produce no response (the read will time out)
    pub fn set_silent(&self, command: impl Into<String>) {
        self.silent.write().insert(normalize(&command.into()));
    }

    /// Undo `set_silent` for a command
    pub fn clear_silent(&self, command: impl Into<String>) {
        self.silent.write().remove(&normalize(&command.into()));
    }

    /// Kill the link when this command arrives
    pub fn set_disconnect_on(&self, command: impl Into<String>) {
        self.disconnect_on.write().insert(normalize(&command.into()));
    }

    /// Fail the write for this command with an I/O error
    pub fn set_fail_write_on(&self, command: impl Into<String>) {
        self.fail_write_on.write().insert(normalize(&command.into()));
    }

    /// Force the next `n` reads to time out
    pub fn inject_timeouts(&self, n: u32) {
        self.timeouts_to_inject.store(n, Ordering::SeqCst);
    }

    /// Set the link up/down
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn reset_for_open(&self) {
        self.connected.store(true, Ordering::SeqCst);
        self.echo.store(true, Ordering::SeqCst);
        self.outbox.lock().clear();
        self.inbox.lock().clear();
    }

    /// Process one complete command line and queue the adapter's reply
    fn handle_command(&self, raw_line: &str) {
        let cmd = normalize(raw_line);

        if self.disconnect_on.read().contains(&cmd) {
            tracing::debug!(%cmd, "Mock adapter: dropping link on command");
            self.connected.store(false, Ordering::SeqCst);
            return;
        }

        if self.silent.read().contains(&cmd) {
            tracing::debug!(%cmd, "Mock adapter: staying silent");
            return;
        }

        let mut out = Vec::new();
        if self.echo.load(Ordering::SeqCst) {
            out.extend_from_slice(raw_line.as_bytes());
            out.push(b'\r');
        }

        let body = self.response_for(&cmd);
        out.extend_from_slice(body.as_bytes());
        out.extend_from_slice(b"\r\r>");

        self.outbox.lock().extend(out);
    }

    fn response_for(&self, cmd: &str) -> String {
        // Caller-scripted responses first: exact, then prefix
        {
            let responses = self.responses.read();
            for (req, resp) in responses.iter() {
                if req == cmd {
                    return resp.clone();
                }
            }
            for (req, resp) in responses.iter() {
                if cmd.starts_with(req.as_str()) {
                    return resp.clone();
                }
            }
        }

        // Built-in AT handling
        if let Some(resp) = self.handle_at(cmd) {
            return resp;
        }

        // Built-in OBD responses
        for (req, resp) in Self::default_obd_responses() {
            if cmd == *req || cmd.starts_with(req) {
                return resp.to_string();
            }
        }

        "?".to_string()
    }

    fn handle_at(&self, cmd: &str) -> Option<String> {
        match cmd {
            "ATZ" => {
                // Reset re-enables echo, like the real chip
                self.echo.store(true, Ordering::SeqCst);
                Some("ELM327 v1.5".to_string())
            }
            "ATE0" => {
                self.echo.store(false, Ordering::SeqCst);
                Some("OK".to_string())
            }
            "ATE1" => {
                self.echo.store(true, Ordering::SeqCst);
                Some("OK".to_string())
            }
            "ATI" => Some("ELM327 v1.5".to_string()),
            "ATRV" => Some("12.6V".to_string()),
            "ATDP" => Some("AUTO, ISO 15765-4 (CAN 11/500)".to_string()),
            "ATH0" | "ATH1" | "ATS0" | "ATL0" => Some("OK".to_string()),
            _ if cmd.starts_with("ATSP") => Some("OK".to_string()),
            _ if cmd.starts_with("AT") => Some("OK".to_string()),
            _ => None,
        }
    }

    fn default_obd_responses() -> &'static [(&'static str, &'static str)] {
        &[
            // Supported PIDs 01-20
            ("0100", "41 00 BE 3E B8 11"),
            // Engine coolant temperature: 0x7B - 40 = 83 C
            ("0105", "41 05 7B"),
            // Engine RPM: ((0x1A * 256) + 0xF8) / 4 = 1726.0
            ("010C", "41 0C 1A F8"),
            // Vehicle speed
            ("010D", "41 0D 37"),
            // Stored DTCs: P0105, P0300
            ("03", "43 01 05 03 00"),
            // Pending DTCs: P0130
            ("07", "47 01 30 00 00"),
            // Permanent DTCs: none
            ("0A", "4A 00 00"),
            // Clear all
            ("04", "44"),
            // Security access: seed request / key accept
            ("2701", "67 01 12 34"),
            ("2702", "67 02"),
        ]
    }
}

/// One open channel to the scripted adapter
pub struct MockSerialLink {
    adapter: Arc<MockAdapter>,
}

#[async_trait]
impl SerialLink for MockSerialLink {
    async fn write_all(&self, data: &[u8]) -> Result<(), TransportError> {
        if !self.adapter.is_connected() {
            return Err(TransportError::ConnectionClosed);
        }

        let lines: Vec<String> = {
            let mut inbox = self.adapter.inbox.lock();
            inbox.extend_from_slice(data);
            let mut lines = Vec::new();
            while let Some(pos) = inbox.iter().position(|&b| b == b'\r') {
                let line: Vec<u8> = inbox.drain(..=pos).collect();
                let text = String::from_utf8_lossy(&line[..line.len() - 1]).to_string();
                lines.push(text);
            }
            lines
        };

        for line in lines {
            if self.adapter.fail_write_on.read().contains(&normalize(&line)) {
                return Err(TransportError::SendFailed(format!("write failed: {line}")));
            }
            self.adapter.handle_command(&line);
        }

        Ok(())
    }

    async fn read_chunk(&self, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        if self
            .adapter
            .timeouts_to_inject
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            tokio::time::sleep(timeout).await;
            return Err(TransportError::Timeout("injected".to_string()));
        }

        if self.adapter.latency_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.adapter.latency_ms)).await;
        }

        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            {
                let mut outbox = self.adapter.outbox.lock();
                if !outbox.is_empty() {
                    let take = outbox.len().min(CHUNK_SIZE);
                    return Ok(outbox.drain(..take).collect());
                }
            }

            if !self.adapter.is_connected() {
                return Err(TransportError::ConnectionClosed);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(TransportError::Timeout("no data".to_string()));
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    }

    async fn is_connected(&self) -> bool {
        self.adapter.is_connected()
    }

    async fn close(&self) {
        self.adapter.set_connected(false);
    }
}

/// Mock backend producing links to one shared scripted adapter
pub struct MockBackend {
    adapter: Arc<MockAdapter>,
    devices: RwLock<Vec<Device>>,
    /// Number of upcoming `open` calls to fail (reconnect testing)
    fail_opens: AtomicU32,
}

impl MockBackend {
    pub fn new(config: &MockConfig) -> Self {
        Self {
            adapter: Arc::new(MockAdapter::new(config.latency_ms)),
            devices: RwLock::new(vec![
                Device::new("00:11:22:33:44:55", "OBDII-ELM327", false),
                Device::new("AA:BB:CC:DD:EE:FF", "Car Stereo", true),
            ]),
            fail_opens: AtomicU32::new(0),
        }
    }

    /// Handle to the scripted adapter for test setup
    pub fn adapter(&self) -> Arc<MockAdapter> {
        self.adapter.clone()
    }

    /// Replace the devices returned by `scan`
    pub fn set_devices(&self, devices: Vec<Device>) {
        *self.devices.write() = devices;
    }

    /// Fail the next `n` open attempts
    pub fn fail_next_opens(&self, n: u32) {
        self.fail_opens.store(n, Ordering::SeqCst);
    }
}

#[async_trait]
impl SerialLinkBackend for MockBackend {
    async fn scan(&self, _timeout: Duration) -> Result<Vec<Device>, TransportError> {
        let mut devices = self.devices.read().clone();
        devices.sort_by(|a, b| b.compatibility_score().cmp(&a.compatibility_score()));
        Ok(devices)
    }

    async fn pair(&self, device: &Device) -> Result<bool, TransportError> {
        let mut devices = self.devices.write();
        match devices.iter_mut().find(|d| d.address == device.address) {
            Some(d) => {
                d.paired = true;
                Ok(true)
            }
            None => Err(TransportError::PairingFailed(format!(
                "Unknown device: {}",
                device.address
            ))),
        }
    }

    async fn open(&self, device: &Device) -> Result<Arc<dyn SerialLink>, TransportError> {
        if self
            .fail_opens
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(TransportError::ConnectionFailed(format!(
                "Mock open refused for {}",
                device.address
            )));
        }

        self.adapter.reset_for_open();
        Ok(Arc::new(MockSerialLink {
            adapter: self.adapter.clone(),
        }))
    }
}

fn normalize(command: &str) -> String {
    command
        .trim()
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect::<String>()
        .to_uppercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn drain_response(link: &Arc<dyn SerialLink>) -> String {
        let mut buf = Vec::new();
        loop {
            match link.read_chunk(Duration::from_millis(100)).await {
                Ok(chunk) => {
                    buf.extend_from_slice(&chunk);
                    if buf.contains(&b'>') {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
        String::from_utf8_lossy(&buf).to_string()
    }

    #[tokio::test]
    async fn test_echo_until_disabled() {
        let backend = MockBackend::new(&MockConfig::default());
        let device = Device::new("00:11:22:33:44:55", "OBDII-ELM327", true);
        let link = backend.open(&device).await.unwrap();

        link.write_all(b"ATZ\r").await.unwrap();
        let resp = drain_response(&link).await;
        assert!(resp.contains("ATZ"), "echo expected before ATE0: {resp}");
        assert!(resp.contains("ELM327"));

        link.write_all(b"ATE0\r").await.unwrap();
        let _ = drain_response(&link).await;

        link.write_all(b"010C\r").await.unwrap();
        let resp = drain_response(&link).await;
        assert!(!resp.contains("010C\r"), "echo should be off: {resp}");
        assert!(resp.contains("41 0C 1A F8"));
        assert!(resp.ends_with('>'));
    }

    #[tokio::test]
    async fn test_silent_command_times_out() {
        let backend = MockBackend::new(&MockConfig::default());
        let device = Device::new("00:11:22:33:44:55", "OBDII-ELM327", true);
        let link = backend.open(&device).await.unwrap();
        backend.adapter().set_silent("0110");

        link.write_all(b"0110\r").await.unwrap();
        let err = link.read_chunk(Duration::from_millis(30)).await.unwrap_err();
        assert!(matches!(err, TransportError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_disconnect_on_command() {
        let backend = MockBackend::new(&MockConfig::default());
        let device = Device::new("00:11:22:33:44:55", "OBDII-ELM327", true);
        let link = backend.open(&device).await.unwrap();
        backend.adapter().set_disconnect_on("31FF");

        link.write_all(b"31FF\r").await.unwrap();
        let err = link.read_chunk(Duration::from_millis(50)).await.unwrap_err();
        assert!(matches!(err, TransportError::ConnectionClosed));
        assert!(!link.is_connected().await);
    }
}
