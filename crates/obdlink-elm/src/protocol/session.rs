//! Protocol session: serialized AT/OBD command channel
//!
//! ELM327 adapters are strictly half duplex. Every command goes out as
//! ASCII terminated by CR, and the adapter signals readiness for the
//! next command with a `>` prompt. The session serializes all senders
//! behind one async mutex so no two commands are ever in flight at the
//! same time, regardless of how many components share the session.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::config::ProtocolConfig;
use crate::transport::{LinkHandle, LinkHealth, SerialLink, TransportError};

use super::{InitError, InitStep, ProtocolError};

const PROMPT: u8 = b'>';

/// Responses that carry a failure instead of data
const NEGATIVE_TOKENS: &[&str] = &[
    "UNABLE TO CONNECT",
    "CAN ERROR",
    "BUS INIT",
    "BUS ERROR",
    "NO DATA",
    "STOPPED",
    "ERROR",
    "?",
];

/// Per-command send options
#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    /// Override the configured command timeout
    pub timeout: Option<Duration>,
    /// Command has side effects on the vehicle. Retried at most once,
    /// and only when the adapter returned nothing at all, never after
    /// a partial response.
    pub non_idempotent: bool,
}

impl SendOptions {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
            ..Self::default()
        }
    }

    pub fn non_idempotent() -> Self {
        Self {
            non_idempotent: true,
            ..Self::default()
        }
    }
}

#[derive(Default)]
struct SessionInfo {
    initialized: bool,
    identity: Option<String>,
    protocol: Option<String>,
}

/// Bytes read past the `>` prompt belong to the next response; they are
/// carried inside the send gate so ordering is preserved.
#[derive(Default)]
struct RecvState {
    carry: Vec<u8>,
}

pub struct ProtocolSession {
    link: LinkHandle,
    health: LinkHealth,
    config: ProtocolConfig,
    gate: Mutex<RecvState>,
    info: RwLock<SessionInfo>,
}

impl ProtocolSession {
    pub fn new(link: LinkHandle, health: LinkHealth, config: ProtocolConfig) -> Self {
        Self {
            link,
            health,
            config,
            gate: Mutex::new(RecvState::default()),
            info: RwLock::new(SessionInfo::default()),
        }
    }

    /// Whether the init handshake has completed on this session
    pub fn is_initialized(&self) -> bool {
        self.info.read().initialized
    }

    /// Adapter identity string from the last reset, e.g. `ELM327 v1.5`
    pub fn identity(&self) -> Option<String> {
        self.info.read().identity.clone()
    }

    /// Bus protocol the adapter negotiated, e.g. `ISO 15765-4 (CAN 11/500)`
    pub fn detected_protocol(&self) -> Option<String> {
        self.info.read().protocol.clone()
    }

    /// Run the adapter init handshake
    ///
    /// Resets the adapter, disables echo and headers, selects automatic
    /// protocol detection, and queries the negotiated protocol. Any step
    /// failing aborts the handshake and reports which step failed.
    pub async fn initialize(&self) -> Result<(), InitError> {
        self.info.write().initialized = false;

        for step in [
            InitStep::Reset,
            InitStep::EchoOff,
            InitStep::HeadersOff,
            InitStep::ProtocolAuto,
            InitStep::ProtocolQuery,
        ] {
            // ATZ takes noticeably longer than other AT commands
            let options = match step {
                InitStep::Reset => SendOptions::with_timeout(Duration::from_secs(5)),
                _ => SendOptions::default(),
            };

            let response = self
                .send_command(step.command(), options)
                .await
                .map_err(|e| InitError {
                    step,
                    message: e.to_string(),
                })?;

            match step {
                InitStep::Reset => {
                    self.info.write().identity = Some(response.clone());
                }
                InitStep::ProtocolQuery => {
                    self.info.write().protocol = Some(response.clone());
                }
                _ => {
                    if !response.contains("OK") {
                        return Err(InitError {
                            step,
                            message: format!("unexpected reply: {response}"),
                        });
                    }
                }
            }
            debug!(step = %step, response = %response, "Init step done");
        }

        self.info.write().initialized = true;
        Ok(())
    }

    /// Ask the adapter for its identity string via `ATI`
    pub async fn probe_identity(&self) -> Result<String, ProtocolError> {
        let identity = self.send_command("ATI", SendOptions::default()).await?;
        self.info.write().identity = Some(identity.clone());
        Ok(identity)
    }

    /// Read the adapter supply voltage via `ATRV`
    pub async fn read_voltage(&self) -> Result<f64, ProtocolError> {
        let response = self.send_command("ATRV", SendOptions::default()).await?;
        response
            .trim()
            .trim_end_matches(['V', 'v'])
            .parse::<f64>()
            .map_err(|_| ProtocolError::Malformed(format!("voltage: {response}")))
    }

    /// Send one command and wait for the complete response
    ///
    /// Echo lines, blank lines, and `SEARCHING...` banners are stripped;
    /// multi-line payloads come back joined with `\n`. Negative adapter
    /// tokens surface as [`ProtocolError::Negative`].
    pub async fn send_command(
        &self,
        command: &str,
        options: SendOptions,
    ) -> Result<String, ProtocolError> {
        let timeout = options
            .timeout
            .unwrap_or(Duration::from_millis(self.config.command_timeout_ms));

        let mut state = self.gate.lock().await;
        let link = self.current_link()?;

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            trace!(command, attempt, "Sending");

            link.write_all(format!("{command}\r").as_bytes())
                .await
                .map_err(ProtocolError::from)?;

            match self.read_until_prompt(&link, &mut state, timeout).await {
                Ok(raw) => {
                    self.health.report_success();
                    let cleaned = clean_response(&raw, command);
                    if let Some(token) = negative_token(&cleaned) {
                        return Err(ProtocolError::Negative(token));
                    }
                    if cleaned.is_empty() {
                        return Err(ProtocolError::Malformed("empty response".to_string()));
                    }
                    return Ok(cleaned);
                }
                Err((received_any, err)) => {
                    let timed_out = matches!(err, ProtocolError::Timeout);
                    if timed_out {
                        self.health.report_timeout();
                    }

                    // Side-effecting commands never go on the wire more
                    // than twice, whatever the configured retry count
                    let retry_limit = if options.non_idempotent {
                        self.config.max_retries.min(1)
                    } else {
                        self.config.max_retries
                    };
                    let retryable = timed_out
                        && attempt <= retry_limit
                        && (!options.non_idempotent || !received_any);
                    if !retryable {
                        // Stale partial bytes must not surface as the
                        // next command's response
                        state.carry.clear();
                        return Err(err);
                    }
                    warn!(command, attempt, "Command timed out; retrying");
                    // Partial bytes of the aborted exchange must not leak
                    // into the retry's response
                    state.carry.clear();
                }
            }
        }
    }

    fn current_link(&self) -> Result<Arc<dyn SerialLink>, ProtocolError> {
        self.link.read().clone().ok_or(ProtocolError::NotConnected)
    }

    /// Accumulate chunks until the `>` prompt; anything after the prompt
    /// stays in the carry buffer. The error side reports whether any
    /// bytes arrived before the failure.
    async fn read_until_prompt(
        &self,
        link: &Arc<dyn SerialLink>,
        state: &mut RecvState,
        timeout: Duration,
    ) -> Result<String, (bool, ProtocolError)> {
        let mut buf = std::mem::take(&mut state.carry);
        let deadline = Instant::now() + timeout;

        loop {
            if let Some(pos) = buf.iter().position(|&b| b == PROMPT) {
                state.carry = buf.split_off(pos + 1);
                buf.pop(); // drop the prompt byte
                return Ok(String::from_utf8_lossy(&buf).into_owned());
            }

            let now = Instant::now();
            if now >= deadline {
                state.carry = buf;
                let received_any = !state.carry.is_empty();
                return Err((received_any, ProtocolError::Timeout));
            }
            let idle = Duration::from_millis(self.config.idle_timeout_ms).min(deadline - now);

            match link.read_chunk(idle).await {
                Ok(chunk) => buf.extend_from_slice(&chunk),
                Err(TransportError::Timeout(_)) => continue,
                Err(e) => {
                    let received_any = !buf.is_empty();
                    state.carry = buf;
                    return Err((received_any, e.into()));
                }
            }
        }
    }
}

/// Strip echo, prompts-in-waiting, and progress banners from a raw
/// adapter response
fn clean_response(raw: &str, command: &str) -> String {
    raw.split(['\r', '\n'])
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter(|line| !line.eq_ignore_ascii_case(command))
        .filter(|line| !line.starts_with("SEARCHING"))
        .collect::<Vec<_>>()
        .join("\n")
}

fn negative_token(response: &str) -> Option<String> {
    let first_line = response.lines().next().unwrap_or("");
    NEGATIVE_TOKENS
        .iter()
        .find(|token| first_line.starts_with(**token))
        .map(|token| token.to_string())
}
