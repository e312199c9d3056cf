//! rcforge device layer
//!
//! Finds radio-control hardware on the local network and monitors serial
//! consoles, publishing both on the shared event bus.

pub mod discovery;
pub mod error;
pub mod fakes;
pub mod serial;

pub use discovery::{
    Discovery, LiveDiscovery, LiveDiscoverySettings, Observation, PresenceTracker, ScriptStep,
    SimulatedDiscovery, SimulationScript, DEFAULT_DISCOVERY_PORT, DEFAULT_PRESENCE_TIMEOUT,
};
pub use error::{DiscoveryError, ScriptError, SerialError};
pub use fakes::{LoopbackDevice, LoopbackSerialTransport};
pub use serial::{
    SerialMonitor, SerialParams, SerialTransport, SerialportTransport, DEFAULT_BAUD_RATE,
    MAX_LINE_BYTES,
};
