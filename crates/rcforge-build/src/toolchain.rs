//! Toolchain adapter contract.
//!
//! A [`Toolchain`] starts one build and hands back a [`BuildStream`]: zero or
//! more output lines followed by exactly one terminal [`ToolchainOutcome`].
//! Cancellation is cooperative through a [`CancellationToken`]; the adapter
//! owns the soft-stop grace period and escalates to a hard kill itself.

use std::path::PathBuf;

use async_trait::async_trait;
use rcforge_core::{BuildFailureKind, BuildState, ParameterSet, Target};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::BuildError;

/// What the toolchain should produce.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    /// Firmware image for the target's own flashing path.
    #[default]
    Firmware,
    /// Image meant to be flashed from a host tool.
    Flash,
}

impl ArtifactKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactKind::Firmware => "firmware",
            ArtifactKind::Flash => "flash",
        }
    }
}

/// Everything an adapter needs to run one build.
#[derive(Debug, Clone)]
pub struct ToolchainRequest {
    pub build_id: String,
    pub target: Target,
    pub parameters: ParameterSet,
    pub artifact: ArtifactKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureCause {
    /// Toolchain ran and exited unsuccessfully. `None` when killed by a signal.
    Exit { code: Option<i32> },
    /// Stopped on request. `forced` when the soft stop was ignored.
    Cancelled { forced: bool },
    /// Exceeded its build deadline.
    Timeout { forced: bool },
    /// Could not be started at all.
    Spawn,
    /// Adapter bug or lost channel.
    Internal,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolchainFailure {
    pub cause: FailureCause,
    pub reason: String,
}

impl ToolchainFailure {
    pub fn new(cause: FailureCause, reason: impl Into<String>) -> Self {
        Self {
            cause,
            reason: reason.into(),
        }
    }
}

/// Terminal result of a toolchain run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolchainOutcome {
    Success { artifact: PathBuf },
    Failure(ToolchainFailure),
}

impl ToolchainOutcome {
    /// The build state reported for this outcome.
    pub fn into_state(self) -> BuildState {
        match self {
            ToolchainOutcome::Success { artifact } => BuildState::Succeeded { artifact },
            ToolchainOutcome::Failure(ToolchainFailure { cause, reason }) => match cause {
                FailureCause::Cancelled { forced } => BuildState::Cancelled { forced, reason },
                FailureCause::Exit { code } => {
                    let err = BuildError::ToolchainExit { code, reason };
                    BuildState::Failed {
                        kind: err.failure_kind(),
                        reason: err.to_string(),
                    }
                }
                FailureCause::Timeout { .. } => BuildState::Failed {
                    kind: BuildFailureKind::Timeout,
                    reason,
                },
                FailureCause::Spawn => BuildState::Failed {
                    kind: BuildFailureKind::ToolchainSpawn,
                    reason,
                },
                FailureCause::Internal => BuildState::Failed {
                    kind: BuildFailureKind::Internal,
                    reason,
                },
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolchainEvent {
    Line(String),
    Finished(ToolchainOutcome),
}

/// Producer half of a [`BuildStream`].
///
/// Clones may emit lines from several readers; [`BuildStreamSender::finish`]
/// consumes the sender so only one outcome is ever produced per clone.
#[derive(Debug, Clone)]
pub struct BuildStreamSender {
    tx: mpsc::Sender<ToolchainEvent>,
}

impl BuildStreamSender {
    /// Emit an output line. Returns `false` once the consumer is gone.
    pub async fn line(&self, text: impl Into<String>) -> bool {
        self.tx.send(ToolchainEvent::Line(text.into())).await.is_ok()
    }

    pub async fn finish(self, outcome: ToolchainOutcome) {
        let _ = self.tx.send(ToolchainEvent::Finished(outcome)).await;
    }
}

/// Ordered output of one toolchain run.
#[derive(Debug)]
pub struct BuildStream {
    rx: mpsc::Receiver<ToolchainEvent>,
    finished: bool,
}

impl BuildStream {
    pub fn channel(capacity: usize) -> (BuildStreamSender, BuildStream) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            BuildStreamSender { tx },
            BuildStream {
                rx,
                finished: false,
            },
        )
    }

    /// Next event, or `None` after the terminal outcome has been returned.
    ///
    /// If every sender is dropped without finishing, a synthetic internal
    /// failure is returned so callers always see exactly one outcome.
    pub async fn next(&mut self) -> Option<ToolchainEvent> {
        if self.finished {
            return None;
        }
        match self.rx.recv().await {
            Some(ToolchainEvent::Finished(outcome)) => {
                self.finished = true;
                self.rx.close();
                Some(ToolchainEvent::Finished(outcome))
            }
            Some(line) => Some(line),
            None => {
                self.finished = true;
                Some(ToolchainEvent::Finished(ToolchainOutcome::Failure(
                    ToolchainFailure::new(
                        FailureCause::Internal,
                        "toolchain stream closed without a result",
                    ),
                )))
            }
        }
    }
}

/// Something that can build firmware.
#[async_trait]
pub trait Toolchain: Send + Sync {
    /// Start a build. Returning `Err` means nothing was started.
    ///
    /// Once `cancel` fires the adapter must wind the build down and finish
    /// the stream with [`FailureCause::Cancelled`].
    async fn build(
        &self,
        request: ToolchainRequest,
        cancel: CancellationToken,
    ) -> Result<BuildStream, BuildError>;

    fn name(&self) -> &str;
}
