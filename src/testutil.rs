//! Scripted serial fakes shared by the link, discovery, gateway, and
//! orchestrator tests.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::discovery::{PortCandidate, PortScanner};
use crate::link::SerialTransport;

#[derive(Default)]
struct PortState {
    /// One-shot replies, popped in FIFO order per command line.
    replies: HashMap<String, VecDeque<Vec<u8>>>,
    /// Sticky replies used when the FIFO for a command is empty.
    sticky: HashMap<String, Vec<u8>>,
    readable: VecDeque<u8>,
    written: Vec<String>,
    partial_write: Vec<u8>,
    fail_reads: bool,
}

/// A serial transport that answers scripted replies to written command
/// lines. Handles share state, so a test can keep one while the code under
/// test owns another.
#[derive(Clone)]
pub(crate) struct ScriptedPort {
    state: Arc<Mutex<PortState>>,
    written: Arc<Mutex<Vec<String>>>,
}

impl ScriptedPort {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(PortState::default())),
            written: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn clone_handle(&self) -> Self {
        self.clone()
    }

    /// Queue a one-shot reply for the next write of `command`.
    pub fn reply_to(&self, command: &str, reply: &str) {
        self.state
            .lock()
            .unwrap()
            .replies
            .entry(command.to_string())
            .or_default()
            .push_back(reply.as_bytes().to_vec());
    }

    /// Set a reply used every time `command` is written and no one-shot
    /// reply is queued.
    pub fn always_reply_to(&self, command: &str, reply: &str) {
        self.state
            .lock()
            .unwrap()
            .sticky
            .insert(command.to_string(), reply.as_bytes().to_vec());
    }

    /// Make bytes readable without any command having been written.
    pub fn push_raw(&self, bytes: &[u8]) {
        self.state.lock().unwrap().readable.extend(bytes.iter().copied());
    }

    pub fn fail_reads(&self) {
        self.state.lock().unwrap().fail_reads = true;
    }

    /// Complete command lines written so far, terminator-trimmed.
    pub fn written(&self) -> Arc<Mutex<Vec<String>>> {
        Arc::clone(&self.written)
    }
}

impl SerialTransport for ScriptedPort {
    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        let mut state = self.state.lock().unwrap();
        for &byte in buf {
            if byte == b'\n' {
                let line = String::from_utf8_lossy(&state.partial_write).trim_end().to_string();
                state.partial_write.clear();
                self.written.lock().unwrap().push(line.clone());

                let reply = state
                    .replies
                    .get_mut(&line)
                    .and_then(VecDeque::pop_front)
                    .or_else(|| state.sticky.get(&line).cloned());
                if let Some(reply) = reply {
                    state.readable.extend(reply);
                }
            } else {
                state.partial_write.push(byte);
            }
        }
        Ok(())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }

    fn read_byte(&mut self) -> io::Result<Option<u8>> {
        let mut state = self.state.lock().unwrap();
        if state.fail_reads {
            return Err(io::Error::other("scripted read failure"));
        }
        match state.readable.pop_front() {
            Some(byte) => Ok(Some(byte)),
            None => {
                drop(state);
                // Pace deadline loops the way a real port timeout would.
                std::thread::sleep(Duration::from_micros(200));
                Ok(None)
            }
        }
    }

    fn clear_input(&mut self) -> io::Result<()> {
        self.state.lock().unwrap().readable.clear();
        Ok(())
    }
}

/// A port scanner backed by scripted ports. Each `open` of a port name pops
/// the next scripted transport queued for it.
pub(crate) struct FakeScanner {
    candidates: Vec<PortCandidate>,
    ports: Mutex<HashMap<String, VecDeque<ScriptedPort>>>,
    scan_count: Arc<AtomicUsize>,
    cancel_on_scan: Option<(usize, CancellationToken)>,
}

impl FakeScanner {
    pub fn new(candidates: Vec<PortCandidate>) -> Self {
        Self {
            candidates,
            ports: Mutex::new(HashMap::new()),
            scan_count: Arc::new(AtomicUsize::new(0)),
            cancel_on_scan: None,
        }
    }

    pub fn queue_port(&self, name: &str, port: ScriptedPort) {
        self.ports
            .lock()
            .unwrap()
            .entry(name.to_string())
            .or_default()
            .push_back(port);
    }

    pub fn scan_count(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.scan_count)
    }

    /// Cancel `token` once `nth` scans have happened (1-based).
    pub fn cancel_on_scan(&mut self, nth: usize, token: CancellationToken) {
        self.cancel_on_scan = Some((nth, token));
    }
}

impl PortScanner for FakeScanner {
    fn scan(&self) -> io::Result<Vec<PortCandidate>> {
        let count = self.scan_count.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some((nth, token)) = &self.cancel_on_scan {
            if count >= *nth {
                token.cancel();
            }
        }
        Ok(self.candidates.clone())
    }

    fn open(&self, port_name: &str) -> io::Result<Box<dyn SerialTransport>> {
        let port = self
            .ports
            .lock()
            .unwrap()
            .get_mut(port_name)
            .and_then(VecDeque::pop_front)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("no scripted port for {port_name}")))?;
        Ok(Box::new(port))
    }
}

pub(crate) fn usb_candidate(name: &str) -> PortCandidate {
    PortCandidate {
        name: name.to_string(),
        description: Some("USB Serial".to_string()),
        wireless: false,
    }
}

pub(crate) fn bluetooth_candidate(name: &str) -> PortCandidate {
    PortCandidate {
        name: name.to_string(),
        description: Some("Bluetooth-Incoming-Port".to_string()),
        wireless: true,
    }
}
