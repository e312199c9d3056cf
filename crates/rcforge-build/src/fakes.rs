//! In-memory configuration source and toolchain for tests and dry runs.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use rcforge_core::{ParameterSet, TargetId};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::config_source::{ConfigDocument, ConfigSource};
use crate::error::{BuildError, ConfigError};
use crate::toolchain::{
    BuildStream, BuildStreamSender, FailureCause, Toolchain, ToolchainFailure, ToolchainOutcome,
    ToolchainRequest,
};

/// Configuration source backed by a fixed table.
///
/// Without a document, each target resolves to its defaults with overrides
/// applied on top; overriding a name the target has no default for is an
/// `UnknownParameter` error. With a document, resolution follows the
/// document rules.
#[derive(Debug, Default)]
pub struct StaticConfigSource {
    targets: BTreeMap<TargetId, ParameterSet>,
    document: Option<ConfigDocument>,
    resolve_calls: AtomicUsize,
}

impl StaticConfigSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_document(document: ConfigDocument) -> Self {
        Self {
            document: Some(document),
            ..Self::default()
        }
    }

    pub fn with_target(mut self, target: impl Into<TargetId>, defaults: ParameterSet) -> Self {
        self.targets.insert(target.into(), defaults);
        self
    }

    /// Number of `resolve` calls made so far.
    pub fn resolve_calls(&self) -> usize {
        self.resolve_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ConfigSource for StaticConfigSource {
    async fn resolve(
        &self,
        target: &TargetId,
        overrides: &ParameterSet,
    ) -> Result<ParameterSet, ConfigError> {
        self.resolve_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(document) = &self.document {
            return document.resolve(target, overrides);
        }

        let mut resolved = self
            .targets
            .get(target)
            .cloned()
            .ok_or_else(|| ConfigError::UnknownDevice(target.to_string()))?;
        for (name, value) in overrides.iter() {
            if resolved.get(name).is_none() {
                return Err(ConfigError::UnknownParameter(name.clone()));
            }
            resolved.insert(name.clone(), value.clone());
        }
        Ok(resolved)
    }

    async fn list_available(&self) -> Result<Vec<TargetId>, ConfigError> {
        Ok(match &self.document {
            Some(document) => document.targets(),
            None => self.targets.keys().cloned().collect(),
        })
    }

    async fn refresh(&self) -> Result<(), ConfigError> {
        Ok(())
    }

    fn describe(&self) -> String {
        "static".to_string()
    }
}

#[derive(Debug, Clone)]
enum Script {
    Run {
        lines: Vec<String>,
        outcome: ToolchainOutcome,
    },
    Hang {
        /// Simulated time taken to hard-kill a toolchain that ignores the
        /// soft stop. `None` means it stops cooperatively.
        kill_after: Option<Duration>,
    },
    SpawnError(String),
}

/// Toolchain that replays a fixed script instead of running a process.
#[derive(Debug)]
pub struct ScriptedToolchain {
    script: Script,
    line_delay: Option<Duration>,
    requests: Mutex<Vec<ToolchainRequest>>,
}

impl ScriptedToolchain {
    fn with_script(script: Script) -> Self {
        Self {
            script,
            line_delay: None,
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Emit `lines`, then succeed with `artifact`.
    pub fn succeeding<I, S>(lines: I, artifact: impl Into<PathBuf>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::with_script(Script::Run {
            lines: lines.into_iter().map(Into::into).collect(),
            outcome: ToolchainOutcome::Success {
                artifact: artifact.into(),
            },
        })
    }

    /// Emit `lines`, then exit with `code`.
    pub fn failing<I, S>(lines: I, code: i32) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::with_script(Script::Run {
            lines: lines.into_iter().map(Into::into).collect(),
            outcome: ToolchainOutcome::Failure(ToolchainFailure::new(
                FailureCause::Exit { code: Some(code) },
                format!("exit status {code}"),
            )),
        })
    }

    /// Run until cancelled, then stop cooperatively.
    pub fn hanging() -> Self {
        Self::with_script(Script::Hang { kill_after: None })
    }

    /// Run until cancelled, ignore the soft stop and get killed after `grace`.
    pub fn ignoring_soft_stop(grace: Duration) -> Self {
        Self::with_script(Script::Hang {
            kill_after: Some(grace),
        })
    }

    pub fn failing_to_spawn(reason: impl Into<String>) -> Self {
        Self::with_script(Script::SpawnError(reason.into()))
    }

    /// Pause before each scripted line.
    pub fn with_line_delay(mut self, delay: Duration) -> Self {
        self.line_delay = Some(delay);
        self
    }

    /// Requests received so far.
    pub fn requests(&self) -> Vec<ToolchainRequest> {
        self.requests
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

fn cancelled(forced: bool, reason: impl Into<String>) -> ToolchainOutcome {
    ToolchainOutcome::Failure(ToolchainFailure::new(FailureCause::Cancelled { forced }, reason))
}

async fn run_script(
    tx: BuildStreamSender,
    lines: Vec<String>,
    outcome: ToolchainOutcome,
    line_delay: Option<Duration>,
    cancel: CancellationToken,
) {
    for line in lines {
        if let Some(delay) = line_delay {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.cancelled() => {
                    tx.finish(cancelled(false, "cancelled")).await;
                    return;
                }
            }
        }
        if cancel.is_cancelled() {
            tx.finish(cancelled(false, "cancelled")).await;
            return;
        }
        if !tx.line(line).await {
            return;
        }
    }
    tx.finish(outcome).await;
}

async fn hang(tx: BuildStreamSender, target: String, kill_after: Option<Duration>, cancel: CancellationToken) {
    cancel.cancelled().await;
    match kill_after {
        None => tx.finish(cancelled(false, "cancelled")).await,
        Some(grace) => {
            tokio::time::sleep(grace).await;
            let err = BuildError::CancellationTimeout {
                target,
                grace_ms: grace.as_millis() as u64,
            };
            warn!(error = %err, "escalating to hard kill");
            tx.finish(cancelled(true, err.to_string())).await;
        }
    }
}

#[async_trait]
impl Toolchain for ScriptedToolchain {
    async fn build(
        &self,
        request: ToolchainRequest,
        cancel: CancellationToken,
    ) -> Result<BuildStream, BuildError> {
        let target = request.target.id.to_string();
        self.requests
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(request);

        let (tx, stream) = BuildStream::channel(64);
        match self.script.clone() {
            Script::SpawnError(reason) => return Err(BuildError::ToolchainSpawn(reason)),
            Script::Run { lines, outcome } => {
                tokio::spawn(run_script(tx, lines, outcome, self.line_delay, cancel));
            }
            Script::Hang { kill_after } => {
                tokio::spawn(hang(tx, target, kill_after, cancel));
            }
        }
        Ok(stream)
    }

    fn name(&self) -> &str {
        "scripted"
    }
}
