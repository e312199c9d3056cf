//! Daemon settings from command-line flags and `RCFORGE_*` environment
//! variables.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use tracing::Level;

/// Where build configuration documents come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ConfigSourceKind {
    Git,
    Http,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum DiscoveryKind {
    Live,
    Simulated,
}

#[derive(Debug, Clone, Parser)]
#[command(name = "rcforged")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Firmware build orchestration and device monitoring for radio-control hardware", long_about = None)]
pub struct Settings {
    /// JSON device catalog to load at startup
    #[arg(long, env = "RCFORGE_REGISTRY")]
    pub registry: Option<PathBuf>,

    /// Configuration source backend
    #[arg(long, value_enum, env = "RCFORGE_CONFIG_SOURCE", default_value = "git")]
    pub config_source: ConfigSourceKind,

    /// Repository holding the configuration document (git backend)
    #[arg(long, env = "RCFORGE_CONFIG_REPO")]
    pub config_repo: Option<String>,

    /// Branch or tag to track (git backend)
    #[arg(long, env = "RCFORGE_CONFIG_REF")]
    pub config_ref: Option<String>,

    /// Local checkout directory (git backend)
    #[arg(long, env = "RCFORGE_CONFIG_CACHE_DIR", default_value = ".rcforge/config")]
    pub config_cache_dir: PathBuf,

    /// Document path inside the repository (git backend)
    #[arg(long, env = "RCFORGE_CONFIG_DOCUMENT")]
    pub config_document: Option<PathBuf>,

    /// Document URL (http backend)
    #[arg(long, env = "RCFORGE_CONFIG_URL")]
    pub config_url: Option<String>,

    /// Discovery variant
    #[arg(long, value_enum, env = "RCFORGE_DISCOVERY", default_value = "live")]
    pub discovery: DiscoveryKind,

    /// UDP port devices answer discovery queries on
    #[arg(long, env = "RCFORGE_DISCOVERY_PORT", default_value_t = rcforge_devices::DEFAULT_DISCOVERY_PORT)]
    pub discovery_port: u16,

    #[arg(long, env = "RCFORGE_DISCOVERY_INTERVAL_MS", default_value_t = 2000)]
    pub discovery_interval_ms: u64,

    /// Silence after which a device is reported lost
    #[arg(long, env = "RCFORGE_DISCOVERY_TIMEOUT_MS", default_value_t = 10_000)]
    pub discovery_timeout_ms: u64,

    /// JSON simulation script (simulated discovery); a built-in demo otherwise
    #[arg(long, env = "RCFORGE_SIMULATION_SCRIPT")]
    pub simulation_script: Option<PathBuf>,

    /// Build tool to run for each build
    #[arg(long, env = "RCFORGE_TOOLCHAIN_PROGRAM", default_value = "pio")]
    pub toolchain_program: String,

    /// Argument passed to the build tool; repeatable, supports {target},
    /// {platform}, {board} and {output_dir}
    #[arg(
        long = "toolchain-arg",
        env = "RCFORGE_TOOLCHAIN_ARGS",
        value_delimiter = ',',
        allow_hyphen_values = true
    )]
    pub toolchain_args: Vec<String>,

    #[arg(long, env = "RCFORGE_TOOLCHAIN_WORKDIR")]
    pub toolchain_workdir: Option<PathBuf>,

    #[arg(long, env = "RCFORGE_ARTIFACT_DIR", default_value = ".rcforge/artifacts")]
    pub artifact_dir: PathBuf,

    /// Time a cancelled build gets to exit before it is killed
    #[arg(long, env = "RCFORGE_GRACE_PERIOD_MS", default_value_t = 5000)]
    pub grace_period_ms: u64,

    /// Wall-clock limit for one build
    #[arg(long, env = "RCFORGE_BUILD_DEADLINE_SECS")]
    pub build_deadline_secs: Option<u64>,

    /// Emit JSON-formatted log lines
    #[arg(long, env = "RCFORGE_JSON_LOGS")]
    pub json: bool,

    /// Enable verbose output
    #[arg(short, long)]
    pub verbose: bool,
}

impl Settings {
    pub fn log_level(&self) -> Level {
        if self.verbose {
            Level::DEBUG
        } else {
            Level::INFO
        }
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    pub fn build_deadline(&self) -> Option<Duration> {
        self.build_deadline_secs.map(Duration::from_secs)
    }

    pub fn discovery_interval(&self) -> Duration {
        Duration::from_millis(self.discovery_interval_ms)
    }

    pub fn discovery_timeout(&self) -> Duration {
        Duration::from_millis(self.discovery_timeout_ms)
    }
}
