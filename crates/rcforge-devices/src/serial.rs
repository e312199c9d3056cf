//! Serial monitor.
//!
//! Each open device gets a reader thread that republishes every received
//! line as a `SerialLine` event on [`Topic::Serial`]. A device has at most
//! one open connection; opening it again fails with
//! [`SerialError::AlreadyOpen`]. The connection is released on `close`, on
//! EOF and on read errors. `close` returns only after the reader thread has
//! let go of the port, so the same port can be reopened straight away.
//!
//! A device that never sends a newline has its output published in chunks
//! of [`MAX_LINE_BYTES`].

use std::collections::HashMap;
use std::io::{ErrorKind, Read, Write};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::Duration;

use rcforge_core::{emit_serial_closed, emit_serial_opened, DeviceId, EventBus, EventPayload, Topic};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Result, SerialError};

pub const DEFAULT_BAUD_RATE: u32 = 420_000;
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_millis(100);
/// Longest line published before a newline arrives.
pub const MAX_LINE_BYTES: usize = 4096;

/// How to reach a device's serial port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerialParams {
    pub port: String,
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    /// Read poll interval; bounds how long `close` takes to stop the reader.
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
}

fn default_baud_rate() -> u32 {
    DEFAULT_BAUD_RATE
}

fn default_read_timeout_ms() -> u64 {
    DEFAULT_READ_TIMEOUT.as_millis() as u64
}

impl SerialParams {
    pub fn new(port: impl Into<String>) -> Self {
        Self {
            port: port.into(),
            baud_rate: DEFAULT_BAUD_RATE,
            read_timeout_ms: default_read_timeout_ms(),
        }
    }

    pub fn with_baud_rate(mut self, baud_rate: u32) -> Self {
        self.baud_rate = baud_rate;
        self
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}

pub type SerialReader = Box<dyn Read + Send>;
pub type SerialWriter = Box<dyn Write + Send>;

/// Opens serial connections.
pub trait SerialTransport: Send + Sync {
    /// Open `params.port`, returning independent read and write halves.
    fn open(&self, params: &SerialParams) -> Result<(SerialReader, SerialWriter)>;

    /// Names of the ports that could be opened.
    fn available_ports(&self) -> Result<Vec<String>>;
}

/// Real serial ports through the `serialport` crate.
#[derive(Debug, Clone, Copy, Default)]
pub struct SerialportTransport;

impl SerialTransport for SerialportTransport {
    fn open(&self, params: &SerialParams) -> Result<(SerialReader, SerialWriter)> {
        let port = serialport::new(&params.port, params.baud_rate)
            .timeout(params.read_timeout())
            .open()
            .map_err(|e| SerialError::Port(format!("failed to open {}: {e}", params.port)))?;
        let reader = port.try_clone()?;
        Ok((Box::new(reader), Box::new(port)))
    }

    fn available_ports(&self) -> Result<Vec<String>> {
        let mut names: Vec<String> = serialport::available_ports()?
            .into_iter()
            .map(|p| p.port_name)
            .collect();
        names.sort();
        Ok(names)
    }
}

struct Session {
    id: u64,
    port: String,
    writer: SerialWriter,
    stop: Arc<AtomicBool>,
    reader: Option<JoinHandle<()>>,
}

impl Session {
    /// Stop the reader thread and wait until it has dropped the port.
    fn shut(mut self) {
        self.stop.store(true, Ordering::SeqCst);
        let Some(reader) = self.reader.take() else {
            return;
        };
        if reader.join().is_err() {
            warn!(port = %self.port, "serial reader thread panicked");
        }
    }
}

type Sessions = Arc<Mutex<HashMap<DeviceId, Session>>>;

fn lock(sessions: &Sessions) -> MutexGuard<'_, HashMap<DeviceId, Session>> {
    sessions
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct SerialMonitor {
    transport: Arc<dyn SerialTransport>,
    bus: EventBus,
    sessions: Sessions,
    next_id: AtomicU64,
}

impl SerialMonitor {
    pub fn new(transport: Arc<dyn SerialTransport>, bus: EventBus) -> Self {
        Self {
            transport,
            bus,
            sessions: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(0),
        }
    }

    /// Open a connection to `device` and start republishing its lines.
    pub fn open(&self, device: &DeviceId, params: &SerialParams) -> Result<()> {
        let mut sessions = lock(&self.sessions);
        if sessions.contains_key(device) {
            return Err(SerialError::AlreadyOpen(device.to_string()));
        }

        let (reader, writer) = self.transport.open(params)?;
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let stop = Arc::new(AtomicBool::new(false));

        let pump = ReaderPump {
            device: device.clone(),
            id,
            bus: self.bus.clone(),
            sessions: self.sessions.clone(),
            stop: stop.clone(),
        };
        let reader = std::thread::Builder::new()
            .name(format!("serial-{device}"))
            .spawn(move || pump.run(reader))?;

        sessions.insert(
            device.clone(),
            Session {
                id,
                port: params.port.clone(),
                writer,
                stop,
                reader: Some(reader),
            },
        );
        emit_serial_opened(device.as_str(), &params.port, params.baud_rate);
        Ok(())
    }

    /// Send raw bytes to `device`.
    pub fn write(&self, device: &DeviceId, bytes: &[u8]) -> Result<()> {
        let mut sessions = lock(&self.sessions);
        let session = sessions
            .get_mut(device)
            .ok_or_else(|| SerialError::NotOpen(device.to_string()))?;
        session.writer.write_all(bytes)?;
        session.writer.flush()?;
        Ok(())
    }

    /// Release the connection to `device`.
    ///
    /// Blocks for up to one read timeout while the reader thread winds down.
    pub fn close(&self, device: &DeviceId) -> Result<()> {
        let session = lock(&self.sessions)
            .remove(device)
            .ok_or_else(|| SerialError::NotOpen(device.to_string()))?;
        debug!(device_id = %device, port = %session.port, "closing serial connection");
        session.shut();
        emit_serial_closed(device.as_str(), None);
        Ok(())
    }

    pub fn is_open(&self, device: &DeviceId) -> bool {
        lock(&self.sessions).contains_key(device)
    }

    /// Devices with an open connection, ordered by id.
    pub fn open_devices(&self) -> Vec<DeviceId> {
        let mut devices: Vec<DeviceId> = lock(&self.sessions).keys().cloned().collect();
        devices.sort();
        devices
    }

    pub fn available_ports(&self) -> Result<Vec<String>> {
        self.transport.available_ports()
    }

    /// Close every open connection.
    pub fn close_all(&self) {
        for device in self.open_devices() {
            let _ = self.close(&device);
        }
    }
}

impl Drop for SerialMonitor {
    fn drop(&mut self) {
        self.close_all();
    }
}

struct ReaderPump {
    device: DeviceId,
    id: u64,
    bus: EventBus,
    sessions: Sessions,
    stop: Arc<AtomicBool>,
}

impl ReaderPump {
    fn publish(&self, raw: &[u8]) {
        let text = String::from_utf8_lossy(raw);
        self.bus.publish(
            Topic::Serial(self.device.clone()),
            EventPayload::SerialLine {
                device_id: self.device.clone(),
                text: text.trim_end_matches('\r').to_string(),
            },
        );
    }

    fn run(self, mut reader: SerialReader) {
        let mut pending: Vec<u8> = Vec::new();
        let mut chunk = [0u8; 1024];

        let error = loop {
            if self.stop.load(Ordering::SeqCst) {
                return;
            }
            match reader.read(&mut chunk) {
                Ok(0) => break None,
                Ok(n) => {
                    pending.extend_from_slice(&chunk[..n]);
                    while let Some(end) = pending.iter().position(|b| *b == b'\n') {
                        let line: Vec<u8> = pending.drain(..=end).collect();
                        self.publish(&line[..line.len() - 1]);
                    }
                    while pending.len() >= MAX_LINE_BYTES {
                        let line: Vec<u8> = pending.drain(..MAX_LINE_BYTES).collect();
                        self.publish(&line);
                    }
                }
                Err(e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock | ErrorKind::Interrupted) => {}
                Err(e) => break Some(e),
            }
        };

        if !pending.is_empty() {
            self.publish(&pending);
        }
        self.release(error);
    }

    /// Drop the session unless `close` (or a newer `open`) already did.
    fn release(&self, error: Option<std::io::Error>) {
        let removed = {
            let mut sessions = lock(&self.sessions);
            match sessions.get(&self.device) {
                Some(session) if session.id == self.id => sessions.remove(&self.device),
                _ => None,
            }
        };
        if removed.is_some() {
            emit_serial_closed(
                self.device.as_str(),
                error.as_ref().map(|e| e as &dyn std::fmt::Display),
            );
        }
    }
}
