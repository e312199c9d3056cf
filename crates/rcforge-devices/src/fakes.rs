//! In-memory serial transport for tests and dry runs.
//!
//! Ports are exclusive like real ones: a port cannot be opened again until
//! the reader half of the previous connection has been dropped.

use std::collections::BTreeMap;
use std::io::{self, Read, Write};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::error::{Result, SerialError};
use crate::serial::{SerialParams, SerialReader, SerialTransport, SerialWriter};

#[derive(Default)]
struct PortState {
    /// Feeds the reader half of the currently open connection.
    to_host: Option<mpsc::Sender<Vec<u8>>>,
    /// Everything the host wrote, across connections.
    written: Vec<u8>,
    /// A reader half is alive.
    held: bool,
}

type Ports = Arc<Mutex<BTreeMap<String, PortState>>>;

fn lock(ports: &Ports) -> MutexGuard<'_, BTreeMap<String, PortState>> {
    ports.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Serial transport whose ports are in-memory pipes controlled by the test.
#[derive(Clone, Default)]
pub struct LoopbackSerialTransport {
    ports: Ports,
}

impl LoopbackSerialTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a port and return a handle playing the device side.
    pub fn add_port(&self, name: impl Into<String>) -> LoopbackDevice {
        let name = name.into();
        lock(&self.ports).entry(name.clone()).or_default();
        LoopbackDevice {
            port: name,
            ports: self.ports.clone(),
        }
    }
}

impl SerialTransport for LoopbackSerialTransport {
    fn open(&self, params: &SerialParams) -> Result<(SerialReader, SerialWriter)> {
        let mut ports = lock(&self.ports);
        let state = ports
            .get_mut(&params.port)
            .ok_or_else(|| SerialError::Port(format!("no such port: {}", params.port)))?;
        if state.held {
            return Err(SerialError::Port(format!("{} is busy", params.port)));
        }
        let (tx, rx) = mpsc::channel();
        state.to_host = Some(tx);
        state.held = true;

        let reader = LoopbackReader {
            rx,
            buffered: Vec::new(),
            timeout: params.read_timeout(),
            port: params.port.clone(),
            ports: self.ports.clone(),
        };
        let writer = LoopbackWriter {
            port: params.port.clone(),
            ports: self.ports.clone(),
        };
        Ok((Box::new(reader), Box::new(writer)))
    }

    fn available_ports(&self) -> Result<Vec<String>> {
        Ok(lock(&self.ports).keys().cloned().collect())
    }
}

/// Device side of a loopback port.
#[derive(Clone)]
pub struct LoopbackDevice {
    port: String,
    ports: Ports,
}

impl LoopbackDevice {
    /// Send raw bytes to the host. Returns `false` if no connection is open.
    pub fn send(&self, bytes: &[u8]) -> bool {
        lock(&self.ports)
            .get(&self.port)
            .and_then(|state| state.to_host.as_ref())
            .map(|tx| tx.send(bytes.to_vec()).is_ok())
            .unwrap_or(false)
    }

    pub fn send_line(&self, line: &str) -> bool {
        self.send(format!("{line}\r\n").as_bytes())
    }

    /// Everything the host has written so far.
    pub fn written(&self) -> Vec<u8> {
        lock(&self.ports)
            .get(&self.port)
            .map(|state| state.written.clone())
            .unwrap_or_default()
    }

    /// Whether a host connection still holds the port.
    pub fn is_held(&self) -> bool {
        lock(&self.ports)
            .get(&self.port)
            .is_some_and(|state| state.held)
    }

    /// Simulate unplugging: the host reader sees EOF.
    pub fn disconnect(&self) {
        if let Some(state) = lock(&self.ports).get_mut(&self.port) {
            state.to_host = None;
        }
    }
}

struct LoopbackReader {
    rx: mpsc::Receiver<Vec<u8>>,
    buffered: Vec<u8>,
    timeout: Duration,
    port: String,
    ports: Ports,
}

impl Drop for LoopbackReader {
    fn drop(&mut self) {
        if let Some(state) = lock(&self.ports).get_mut(&self.port) {
            state.held = false;
            state.to_host = None;
        }
    }
}

impl Read for LoopbackReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.buffered.is_empty() {
            match self.rx.recv_timeout(self.timeout) {
                Ok(bytes) => self.buffered = bytes,
                Err(RecvTimeoutError::Timeout) => {
                    return Err(io::Error::new(io::ErrorKind::TimedOut, "no data"))
                }
                Err(RecvTimeoutError::Disconnected) => return Ok(0),
            }
        }
        let n = buf.len().min(self.buffered.len());
        buf[..n].copy_from_slice(&self.buffered[..n]);
        self.buffered.drain(..n);
        Ok(n)
    }
}

struct LoopbackWriter {
    port: String,
    ports: Ports,
}

impl Write for LoopbackWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut ports = lock(&self.ports);
        let state = ports
            .get_mut(&self.port)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "port removed"))?;
        state.written.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
