//! Error types for rcforge-build

use rcforge_core::BuildFailureKind;
use thiserror::Error;

/// Errors raised while resolving build configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The source has no definition for this target
    #[error("no configuration defined for target {0}")]
    UnknownDevice(String),

    /// Parameter name not defined anywhere in the source
    #[error("unknown parameter: {0}")]
    UnknownParameter(String),

    /// Parameter exists but this target does not accept it
    #[error("target {target} does not accept parameter {parameter}")]
    NotAccepted { target: String, parameter: String },

    /// Value does not fit the parameter definition
    #[error("invalid value for {parameter}: {reason}")]
    InvalidValue { parameter: String, reason: String },

    /// Two mutually exclusive parameters are both set
    #[error("parameters {first} and {second} cannot be used together")]
    Conflict { first: String, second: String },

    /// Remote fetch failed
    #[error("configuration fetch failed: {0}")]
    Fetch(String),

    /// Configuration document could not be parsed or is inconsistent
    #[error("configuration document malformed: {0}")]
    Malformed(String),

    /// git command failed
    #[error("git error: {0}")]
    Git(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<reqwest::Error> for ConfigError {
    fn from(err: reqwest::Error) -> Self {
        ConfigError::Fetch(err.to_string())
    }
}

impl From<serde_json::Error> for ConfigError {
    fn from(err: serde_json::Error) -> Self {
        ConfigError::Malformed(err.to_string())
    }
}

/// Errors surfaced by the build orchestrator and toolchain adapter.
#[derive(Error, Debug)]
pub enum BuildError {
    /// Target already has a build in flight
    #[error("target {target} is already building")]
    AlreadyBuilding { target: String },

    /// Cancel requested for a target with no build in flight
    #[error("target {target} has no build in flight")]
    NotBuilding { target: String },

    /// Target missing from the device registry
    #[error("unknown target: {0}")]
    UnknownTarget(String),

    /// Configuration could not be resolved
    #[error("configuration error: {0}")]
    Configuration(#[from] ConfigError),

    /// Toolchain process could not be started
    #[error("toolchain could not be started: {0}")]
    ToolchainSpawn(String),

    /// Toolchain ran and reported failure
    #[error("toolchain failed: {reason}")]
    ToolchainExit { code: Option<i32>, reason: String },

    /// Toolchain ignored the soft stop and had to be killed
    #[error("toolchain for {target} did not stop within {grace_ms} ms and was killed")]
    CancellationTimeout { target: String, grace_ms: u64 },
}

impl BuildError {
    /// The failure classification reported in `BuildStateChanged` events.
    pub fn failure_kind(&self) -> BuildFailureKind {
        match self {
            BuildError::Configuration(_) => BuildFailureKind::Configuration,
            BuildError::ToolchainSpawn(_) => BuildFailureKind::ToolchainSpawn,
            BuildError::ToolchainExit { .. } => BuildFailureKind::ToolchainExit,
            BuildError::CancellationTimeout { .. } => BuildFailureKind::Timeout,
            BuildError::AlreadyBuilding { .. }
            | BuildError::NotBuilding { .. }
            | BuildError::UnknownTarget(_) => BuildFailureKind::Internal,
        }
    }
}

/// Result type for build operations.
pub type Result<T> = std::result::Result<T, BuildError>;
