//! rcforge build layer
//!
//! Resolves build configuration, runs the firmware toolchain and drives the
//! per-target build state machine, publishing progress on the event bus.

pub mod config_source;
pub mod error;
pub mod fakes;
pub mod orchestrator;
pub mod process;
pub mod toolchain;

pub use config_source::{
    ConfigDocument, ConfigSource, DeviceConfig, GitConfigSource, HttpConfigSource,
    ParameterDefinition, ParameterKind,
};
pub use error::{BuildError, ConfigError, Result};
pub use orchestrator::{BuildHandle, BuildJob, BuildOrchestrator, BuildRequest};
pub use process::{ProcessToolchain, ProcessToolchainSettings, DEFAULT_GRACE_PERIOD};
pub use toolchain::{
    ArtifactKind, BuildStream, BuildStreamSender, FailureCause, Toolchain, ToolchainEvent,
    ToolchainFailure, ToolchainOutcome, ToolchainRequest,
};
