use std::io;
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use crate::error::LinkError;

/// Logical identity of a hardware controller, independent of which physical
/// port it occupies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControllerRole {
    /// Compaction stepper controller.
    Stepper,
    /// Sorting mechanism + fill sensor controller.
    Mechanism,
}

impl ControllerRole {
    /// The identity token the controller answers to the handshake probe.
    pub fn identity_token(&self) -> &'static str {
        match self {
            ControllerRole::Stepper => "ARDUINO1",
            ControllerRole::Mechanism => "ARDUINO2",
        }
    }

    /// Role matching a handshake response line, if any.
    pub fn from_identity_token(token: &str) -> Option<Self> {
        match token {
            "ARDUINO1" => Some(ControllerRole::Stepper),
            "ARDUINO2" => Some(ControllerRole::Mechanism),
            _ => None,
        }
    }
}

impl std::fmt::Display for ControllerRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ControllerRole::Stepper => write!(f, "stepper"),
            ControllerRole::Mechanism => write!(f, "mechanism"),
        }
    }
}

/// The literal handshake request line used to identify controllers.
pub const HANDSHAKE_REQUEST: &str = "HANDSHAKE";

/// An immutable command sent to a controller: a verb plus optional payload,
/// one line on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    verb: String,
    payload: Option<String>,
}

impl Command {
    pub fn new(verb: impl Into<String>) -> Self {
        Self {
            verb: verb.into(),
            payload: None,
        }
    }

    pub fn with_payload(verb: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            verb: verb.into(),
            payload: Some(payload.into()),
        }
    }

    pub fn verb(&self) -> &str {
        &self.verb
    }

    /// Newline-terminated wire form.
    pub fn wire_line(&self) -> String {
        match &self.payload {
            Some(payload) => format!("{} {}\n", self.verb, payload),
            None => format!("{}\n", self.verb),
        }
    }
}

/// The outcome of one command/response round trip. A timed-out read is data
/// ("no response"), distinct from an empty or garbage line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandResponse {
    Line(String),
    NoResponse,
}

impl CommandResponse {
    pub fn line(&self) -> Option<&str> {
        match self {
            CommandResponse::Line(line) => Some(line),
            CommandResponse::NoResponse => None,
        }
    }

    pub fn is_no_response(&self) -> bool {
        matches!(self, CommandResponse::NoResponse)
    }
}

/// Byte-level serial channel under a controller link.
///
/// `read_byte` is expected to block only briefly (the serialport-backed
/// transport uses a short internal read timeout) and report `None` when no
/// byte arrived in that window; the link loops it against its own deadline.
pub trait SerialTransport: Send {
    fn write_all(&mut self, buf: &[u8]) -> io::Result<()>;
    fn flush(&mut self) -> io::Result<()>;
    fn read_byte(&mut self) -> io::Result<Option<u8>>;
    fn clear_input(&mut self) -> io::Result<()>;
}

/// Strip the line terminator (and any trailing whitespace the controller
/// appends with it) from a raw response line. Leading bytes and case are
/// preserved for exact comparison.
pub(crate) fn trim_line(raw: &[u8]) -> String {
    String::from_utf8_lossy(raw).trim_end().to_string()
}

/// Read one terminator-delimited line within `timeout`. A partial line at
/// the deadline is discarded, never carried over to the next call.
pub(crate) fn read_line_blocking(
    transport: &mut dyn SerialTransport,
    timeout: Duration,
) -> io::Result<Option<String>> {
    let deadline = Instant::now() + timeout;
    let mut buf = Vec::new();

    loop {
        if Instant::now() >= deadline {
            return Ok(None);
        }

        match transport.read_byte()? {
            Some(b'\n') => return Ok(Some(trim_line(&buf))),
            Some(byte) => buf.push(byte),
            None => continue,
        }
    }
}

/// One addressable hardware controller over an open serial channel.
///
/// Strictly synchronous request/response: `&mut self` enforces at most one
/// outstanding request per binding, and nothing is pipelined.
pub struct ControllerLink {
    role: ControllerRole,
    port_name: String,
    transport: Box<dyn SerialTransport>,
}

impl ControllerLink {
    pub fn new(role: ControllerRole, port_name: String, transport: Box<dyn SerialTransport>) -> Self {
        Self {
            role,
            port_name,
            transport,
        }
    }

    pub fn role(&self) -> ControllerRole {
        self.role
    }

    pub fn port_name(&self) -> &str {
        &self.port_name
    }

    /// Send a command and wait up to `timeout` for one response line.
    pub fn send(
        &mut self,
        command: &Command,
        timeout: Duration,
    ) -> Result<CommandResponse, LinkError> {
        self.write_command(command)?;

        match self.read_line(timeout)? {
            Some(line) => {
                trace!(role = %self.role, verb = command.verb(), response = %line, "controller replied");
                Ok(CommandResponse::Line(line))
            }
            None => {
                debug!(role = %self.role, verb = command.verb(), ?timeout, "no response from controller");
                Ok(CommandResponse::NoResponse)
            }
        }
    }

    /// Write a command line without waiting for the reply. Used by the
    /// sensor poll, which may need to re-read several lines for one send.
    pub fn write_command(&mut self, command: &Command) -> Result<(), LinkError> {
        let line = command.wire_line();
        debug!(role = %self.role, port = %self.port_name, verb = command.verb(), "sending command");

        self.transport
            .write_all(line.as_bytes())
            .and_then(|()| self.transport.flush())
            .map_err(|source| LinkError::Io {
                role: self.role,
                source,
            })
    }

    /// Read one response line within `timeout`; `None` on timeout.
    pub fn read_line(&mut self, timeout: Duration) -> Result<Option<String>, LinkError> {
        read_line_blocking(self.transport.as_mut(), timeout).map_err(|source| LinkError::Io {
            role: self.role,
            source,
        })
    }
}

impl std::fmt::Debug for ControllerLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControllerLink")
            .field("role", &self.role)
            .field("port_name", &self.port_name)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::ScriptedPort;

    fn link_over(port: ScriptedPort) -> ControllerLink {
        ControllerLink::new(ControllerRole::Mechanism, "/dev/ttyUSB7".into(), Box::new(port))
    }

    #[test]
    fn command_wire_format() {
        assert_eq!(Command::new("FLUSH").wire_line(), "FLUSH\n");
        assert_eq!(Command::with_payload("MOVE", "42").wire_line(), "MOVE 42\n");
    }

    #[test]
    fn send_writes_line_and_reads_reply() {
        let port = ScriptedPort::new();
        port.reply_to("BR", "OK\r\n");
        let written = port.written();

        let mut link = link_over(port);
        let response = link.send(&Command::new("BR"), Duration::from_millis(100)).unwrap();

        assert_eq!(response, CommandResponse::Line("OK".into()));
        assert_eq!(written.lock().unwrap().as_slice(), ["BR"]);
    }

    #[test]
    fn trailing_whitespace_is_trimmed_but_case_is_not_folded() {
        let port = ScriptedPort::new();
        port.reply_to("HANDSHAKE", "ARDUINO2 \r\n");

        let mut link = link_over(port);
        let response = link
            .send(&Command::new(HANDSHAKE_REQUEST), Duration::from_millis(100))
            .unwrap();

        // Terminator and trailing whitespace trimmed; content kept verbatim.
        assert_eq!(response.line(), Some("ARDUINO2"));
        assert_eq!(ControllerRole::from_identity_token("ARDUINO2"), Some(ControllerRole::Mechanism));
        assert_eq!(ControllerRole::from_identity_token("arduino2"), None);
        assert_eq!(ControllerRole::from_identity_token("ARDUINO2X"), None);
    }

    #[test]
    fn silence_yields_no_response() {
        let port = ScriptedPort::new();
        let mut link = link_over(port);

        let response = link.send(&Command::new("RESTART"), Duration::from_millis(10)).unwrap();
        assert!(response.is_no_response());
    }

    #[test]
    fn partial_line_is_discarded_at_deadline() {
        let port = ScriptedPort::new();
        // Bytes arrive but no terminator does.
        port.push_raw(b"ARDU");

        let port_handle = port.clone_handle();
        let mut link = link_over(port);
        let response = link.send(&Command::new(HANDSHAKE_REQUEST), Duration::from_millis(10)).unwrap();
        assert!(response.is_no_response());

        // A later complete line is read on its own, without the stale prefix.
        port_handle.push_raw(b"OK\n");
        assert_eq!(link.read_line(Duration::from_millis(100)).unwrap(), Some("OK".into()));
    }

    #[test]
    fn io_error_is_surfaced_as_link_error() {
        let port = ScriptedPort::new();
        port.fail_reads();

        let mut link = link_over(port);
        let err = link.send(&Command::new("GETD"), Duration::from_millis(10)).unwrap_err();
        assert!(matches!(err, LinkError::Io { role: ControllerRole::Mechanism, .. }));
    }
}
