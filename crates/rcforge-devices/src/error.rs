//! Error types for rcforge-devices

use thiserror::Error;

/// Errors raised by discovery services.
#[derive(Error, Debug)]
pub enum DiscoveryError {
    /// `start` called on a service that is already running
    #[error("discovery already running")]
    AlreadyRunning,

    /// Socket could not be set up
    #[error("discovery socket error: {0}")]
    Socket(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A simulation script that cannot be replayed.
#[derive(Error, Debug)]
pub enum ScriptError {
    /// Not valid script JSON
    #[error("simulation script is not valid JSON: {0}")]
    Parse(#[from] serde_json::Error),

    /// An offset lies past the longest supported simulation
    #[error("{field} of {value} ms exceeds the {max} ms limit")]
    OutOfRange {
        field: &'static str,
        value: u64,
        max: u64,
    },
}

/// Errors raised by the serial monitor.
#[derive(Error, Debug)]
pub enum SerialError {
    /// No connection is open for the device
    #[error("serial connection for {0} is not open")]
    NotOpen(String),

    /// The device already has an open connection
    #[error("serial connection for {0} is already open")]
    AlreadyOpen(String),

    /// Read or write failed on an open connection
    #[error("serial IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Port could not be opened or enumerated
    #[error("serial port error: {0}")]
    Port(String),
}

impl From<serialport::Error> for SerialError {
    fn from(err: serialport::Error) -> Self {
        SerialError::Port(err.to_string())
    }
}

/// Result type for serial operations.
pub type Result<T> = std::result::Result<T, SerialError>;
