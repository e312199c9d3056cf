//! Events published on the [`EventBus`](crate::bus::EventBus).

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::{DeviceId, TargetId};

/// Addressable event stream key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum Topic {
    /// Build output and state changes for one target.
    Build(TargetId),

    /// Lines received from one serial device.
    Serial(DeviceId),

    /// Devices appearing on and leaving the local network.
    Discovery,
}

impl std::fmt::Display for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Topic::Build(t) => write!(f, "build/{t}"),
            Topic::Serial(d) => write!(f, "serial/{d}"),
            Topic::Discovery => write!(f, "discovery"),
        }
    }
}

/// Classification of a failed build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildFailureKind {
    Configuration,
    ToolchainSpawn,
    ToolchainExit,
    Timeout,
    Internal,
}

/// Lifecycle state of the build slot of one target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum BuildState {
    Idle,
    Running,
    Succeeded {
        artifact: PathBuf,
    },
    Failed {
        kind: BuildFailureKind,
        reason: String,
    },
    Cancelled {
        /// The toolchain ignored the soft stop and had to be killed.
        forced: bool,
        reason: String,
    },
}

impl BuildState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BuildState::Succeeded { .. } | BuildState::Failed { .. } | BuildState::Cancelled { .. }
        )
    }

    pub fn label(&self) -> &'static str {
        match self {
            BuildState::Idle => "idle",
            BuildState::Running => "running",
            BuildState::Succeeded { .. } => "succeeded",
            BuildState::Failed { .. } => "failed",
            BuildState::Cancelled { .. } => "cancelled",
        }
    }
}

/// Device advertisement as reported by discovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceAdvert {
    pub device_id: DeviceId,

    /// Human readable name broadcast by the device.
    pub name: String,

    /// Network address the advertisement came from.
    pub address: String,

    /// Target the running firmware was built for, if advertised.
    #[serde(default)]
    pub target: Option<TargetId>,

    /// Firmware version string, if advertised.
    #[serde(default)]
    pub version: Option<String>,
}

/// Event payload variants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    /// One line of toolchain output. `line` counts from 0 within a build.
    BuildOutputLine {
        build_id: String,
        line: u64,
        text: String,
    },

    BuildStateChanged {
        build_id: String,
        state: BuildState,
    },

    DeviceDiscovered {
        advert: DeviceAdvert,
    },

    DeviceLost {
        device_id: DeviceId,
    },

    SerialLine {
        device_id: DeviceId,
        text: String,
    },
}

impl EventPayload {
    pub fn kind(&self) -> &'static str {
        match self {
            EventPayload::BuildOutputLine { .. } => "build_output_line",
            EventPayload::BuildStateChanged { .. } => "build_state_changed",
            EventPayload::DeviceDiscovered { .. } => "device_discovered",
            EventPayload::DeviceLost { .. } => "device_lost",
            EventPayload::SerialLine { .. } => "serial_line",
        }
    }
}

/// An immutable, sequenced event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub topic: Topic,

    /// Per-topic sequence number assigned by the bus, starting at 0.
    pub seq: u64,

    pub timestamp: DateTime<Utc>,

    pub payload: EventPayload,
}
