use std::fs;
use std::io;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::SerialConfig;
use crate::error::DiscoveryError;
use crate::link::{
    read_line_blocking, Command, ControllerLink, ControllerRole, SerialTransport,
    HANDSHAKE_REQUEST,
};

/// An enumerated system serial port, produced by `PortScanner::scan` and
/// consumed during discovery only.
#[derive(Debug, Clone)]
pub struct PortCandidate {
    pub name: String,
    pub description: Option<String>,
    /// Short-range wireless transport (e.g. Bluetooth). Never probed.
    pub wireless: bool,
}

/// Outcome of probing one candidate with the handshake protocol.
#[derive(Debug)]
pub struct HandshakeResult {
    pub candidate: PortCandidate,
    pub role: Option<ControllerRole>,
}

/// Port enumeration and opening, abstracted so discovery can be exercised
/// without hardware.
pub trait PortScanner: Send {
    /// Enumerate candidates in a fixed deterministic order, most recently
    /// enumerated first, so retries probe the same sequence.
    fn scan(&self) -> io::Result<Vec<PortCandidate>>;

    /// Open a candidate port for probing or binding.
    fn open(&self, port_name: &str) -> io::Result<Box<dyn SerialTransport>>;
}

/// Scanner backed by the system serial enumeration.
pub struct SystemPortScanner {
    baud_rate: u32,
    read_poll: Duration,
}

impl SystemPortScanner {
    pub fn new(config: &SerialConfig) -> Self {
        Self {
            baud_rate: config.baud_rate,
            read_poll: Duration::from_millis(config.read_poll_ms),
        }
    }
}

impl PortScanner for SystemPortScanner {
    fn scan(&self) -> io::Result<Vec<PortCandidate>> {
        let ports = serialport::available_ports()
            .map_err(|e| io::Error::other(format!("port enumeration failed: {e}")))?;

        // Reverse the enumeration so the most recently listed port is probed
        // first, matching the order controllers tend to appear in.
        let mut candidates: Vec<PortCandidate> = ports
            .into_iter()
            .map(|info| {
                let (description, wireless) = match &info.port_type {
                    serialport::SerialPortType::UsbPort(usb) => (usb.product.clone(), false),
                    serialport::SerialPortType::BluetoothPort => (None, true),
                    _ => (None, false),
                };
                let wireless = wireless
                    || info.port_name.contains("Bluetooth")
                    || description
                        .as_deref()
                        .is_some_and(|d| d.contains("Bluetooth"));
                PortCandidate {
                    name: info.port_name,
                    description,
                    wireless,
                }
            })
            .collect();
        candidates.reverse();
        Ok(candidates)
    }

    fn open(&self, port_name: &str) -> io::Result<Box<dyn SerialTransport>> {
        let port = serialport::new(port_name, self.baud_rate)
            .timeout(self.read_poll)
            .open()
            .map_err(|e| io::Error::other(format!("failed to open {port_name}: {e}")))?;
        Ok(Box::new(SystemTransport { port }))
    }
}

/// serialport-backed transport with a short internal read timeout so the
/// link's deadline loop stays responsive.
struct SystemTransport {
    port: Box<dyn serialport::SerialPort>,
}

impl SerialTransport for SystemTransport {
    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        io::Write::write_all(&mut self.port, buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        io::Write::flush(&mut self.port)
    }

    fn read_byte(&mut self) -> io::Result<Option<u8>> {
        let mut byte = [0u8; 1];
        match io::Read::read(&mut self.port, &mut byte) {
            Ok(0) => Ok(None),
            Ok(_) => Ok(Some(byte[0])),
            Err(e) if e.kind() == io::ErrorKind::TimedOut => Ok(None),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn clear_input(&mut self) -> io::Result<()> {
        self.port
            .clear(serialport::ClearBuffer::Input)
            .map_err(|e| io::Error::other(format!("failed to clear input buffer: {e}")))
    }
}

/// The persisted discovery record: port identifiers only, never open
/// handles. Always re-verified with the handshake before being trusted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PortMap {
    pub stepper_port: String,
    pub mechanism_port: String,
}

impl PortMap {
    pub fn load(path: &Path) -> Option<Self> {
        let raw = fs::read_to_string(path).ok()?;
        match serde_json::from_str(&raw) {
            Ok(map) => Some(map),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "ignoring corrupt port map");
                None
            }
        }
    }

    pub fn save(&self, path: &Path) -> io::Result<()> {
        let raw = serde_json::to_string_pretty(self)
            .map_err(|e| io::Error::other(format!("failed to serialize port map: {e}")))?;
        fs::write(path, raw)
    }
}

/// Both controller bindings for one session: role, discovered port, and the
/// open channel. Owned exclusively by the command gateway for the session's
/// lifetime; invalidated by any close, after which discovery must run again.
pub struct ControllerBindings {
    pub stepper: ControllerLink,
    pub mechanism: ControllerLink,
}

impl std::fmt::Debug for ControllerBindings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControllerBindings")
            .field("stepper", &self.stepper.port_name())
            .field("mechanism", &self.mechanism.port_name())
            .finish()
    }
}

/// Discovers which physical port hosts which logical controller role and
/// persists the mapping for reuse.
pub struct ControllerDirectory {
    scanner: Box<dyn PortScanner>,
    config: SerialConfig,
}

impl ControllerDirectory {
    pub fn new(scanner: Box<dyn PortScanner>, config: SerialConfig) -> Self {
        Self { scanner, config }
    }

    /// Bind both controller roles, preferring the persisted port map when it
    /// still verifies, and falling back to a full probe otherwise.
    pub fn acquire(&self) -> Result<ControllerBindings, DiscoveryError> {
        let map_path = Path::new(&self.config.port_map_path).to_path_buf();

        if let Some(map) = PortMap::load(&map_path) {
            info!(
                stepper = %map.stepper_port,
                mechanism = %map.mechanism_port,
                "verifying persisted controller ports"
            );
            match self.verify_map(&map) {
                Some(bindings) => {
                    info!("persisted controller ports verified");
                    return Ok(bindings);
                }
                None => {
                    warn!("persisted ports did not verify, probing all candidates");
                }
            }
        }

        self.probe_all(&map_path)
    }

    /// Re-verify a persisted mapping with the same handshake used during
    /// discovery. Any failure discards the mapping.
    fn verify_map(&self, map: &PortMap) -> Option<ControllerBindings> {
        if map.stepper_port == map.mechanism_port {
            return None;
        }
        let stepper = self.verify_port(&map.stepper_port, ControllerRole::Stepper)?;
        let mechanism = self.verify_port(&map.mechanism_port, ControllerRole::Mechanism)?;
        Some(ControllerBindings { stepper, mechanism })
    }

    fn verify_port(&self, port_name: &str, role: ControllerRole) -> Option<ControllerLink> {
        let mut transport = match self.scanner.open(port_name) {
            Ok(t) => t,
            Err(e) => {
                debug!(port = port_name, error = %e, "persisted port failed to open");
                return None;
            }
        };
        match self.handshake(transport.as_mut()) {
            Ok(Some(observed)) if observed == role => {
                Some(ControllerLink::new(role, port_name.to_string(), transport))
            }
            Ok(observed) => {
                debug!(port = port_name, expected = %role, ?observed, "persisted port identity mismatch");
                None
            }
            Err(e) => {
                debug!(port = port_name, error = %e, "persisted port handshake failed");
                None
            }
        }
    }

    /// Probe every candidate in scan order until both roles are bound.
    fn probe_all(&self, map_path: &Path) -> Result<ControllerBindings, DiscoveryError> {
        let candidates = self
            .scanner
            .scan()
            .map_err(|_| DiscoveryError::NoPorts)?;

        if candidates.is_empty() {
            return Err(DiscoveryError::NoPorts);
        }

        let mut stepper: Option<ControllerLink> = None;
        let mut mechanism: Option<ControllerLink> = None;

        for candidate in candidates {
            if candidate.wireless {
                debug!(port = %candidate.name, "skipping wireless transport");
                continue;
            }
            if stepper.is_some() && mechanism.is_some() {
                break;
            }

            let mut transport = match self.scanner.open(&candidate.name) {
                Ok(t) => t,
                Err(e) => {
                    warn!(port = %candidate.name, error = %e, "candidate failed to open");
                    continue;
                }
            };

            let result = match self.handshake(transport.as_mut()) {
                Ok(role) => HandshakeResult { candidate, role },
                Err(e) => {
                    warn!(error = %e, "handshake failed, skipping candidate");
                    continue;
                }
            };

            match result.role {
                Some(role @ ControllerRole::Stepper) if stepper.is_none() => {
                    info!(port = %result.candidate.name, "found stepper controller");
                    stepper = Some(ControllerLink::new(role, result.candidate.name, transport));
                }
                Some(role @ ControllerRole::Mechanism) if mechanism.is_none() => {
                    info!(port = %result.candidate.name, "found mechanism controller");
                    mechanism = Some(ControllerLink::new(role, result.candidate.name, transport));
                }
                Some(role) => {
                    // A candidate already bound to a role is not reconsidered.
                    debug!(port = %result.candidate.name, %role, "role already bound, ignoring duplicate");
                }
                None => {
                    debug!(port = %result.candidate.name, "candidate did not identify as a controller");
                }
            }
        }

        match (stepper, mechanism) {
            (Some(stepper), Some(mechanism)) => {
                let map = PortMap {
                    stepper_port: stepper.port_name().to_string(),
                    mechanism_port: mechanism.port_name().to_string(),
                };
                if let Err(e) = map.save(map_path) {
                    warn!(path = %map_path.display(), error = %e, "failed to persist port map");
                } else {
                    info!(path = %map_path.display(), "port map persisted");
                }
                Ok(ControllerBindings { stepper, mechanism })
            }
            (stepper, mechanism) => {
                let mut missing = Vec::new();
                if stepper.is_none() {
                    missing.push(ControllerRole::Stepper);
                }
                if mechanism.is_none() {
                    missing.push(ControllerRole::Mechanism);
                }
                Err(DiscoveryError::RolesMissing { missing })
            }
        }
    }

    /// One-shot identity probe: settle after reset-on-open, drop stale
    /// input, send the literal handshake line, and match the response
    /// byte-for-byte against the identity tokens.
    fn handshake(&self, transport: &mut dyn SerialTransport) -> io::Result<Option<ControllerRole>> {
        std::thread::sleep(Duration::from_millis(self.config.settle_delay_ms));
        transport.clear_input()?;

        let request = Command::new(HANDSHAKE_REQUEST).wire_line();
        transport.write_all(request.as_bytes())?;
        transport.flush()?;

        let timeout = Duration::from_millis(self.config.handshake_timeout_ms);
        match read_line_blocking(transport, timeout)? {
            Some(line) => Ok(ControllerRole::from_identity_token(&line)),
            None => Ok(None),
        }
    }
}
