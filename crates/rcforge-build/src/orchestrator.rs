//! Per-target build state machine.
//!
//! Each target owns one slot. `submit` reserves the slot, resolves the
//! configuration and hands the build to a dedicated driving task that owns
//! the [`BuildJob`] until the toolchain reports a terminal outcome. Every
//! transition is published on [`Topic::Build`] for the target.
//!
//! ```text
//! Idle --submit--> Running --outcome--> Succeeded | Failed | Cancelled --> Idle
//! ```
//!
//! The terminal event is published while the slot table is locked and before
//! the slot is released, so a target reads as `Idle` only after observers can
//! see how its last build ended.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use rcforge_core::{
    emit_build_finished, emit_build_started, BuildFailureKind, BuildSpan, BuildState, Device,
    DeviceRegistry, EventBus, EventPayload, ParameterSet, TargetId, Topic, METRICS,
};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{info, Instrument};
use uuid::Uuid;

use crate::config_source::ConfigSource;
use crate::error::{BuildError, ConfigError, Result};
use crate::toolchain::{ArtifactKind, Toolchain, ToolchainEvent, ToolchainRequest};

/// A request to build firmware for one target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildRequest {
    pub target: TargetId,
    #[serde(default)]
    pub overrides: ParameterSet,
    #[serde(default)]
    pub artifact: ArtifactKind,
}

impl BuildRequest {
    pub fn new(target: impl Into<TargetId>) -> Self {
        Self {
            target: target.into(),
            overrides: ParameterSet::new(),
            artifact: ArtifactKind::default(),
        }
    }

    pub fn with_overrides(mut self, overrides: ParameterSet) -> Self {
        self.overrides = overrides;
        self
    }

    pub fn with_artifact(mut self, artifact: ArtifactKind) -> Self {
        self.artifact = artifact;
        self
    }
}

/// Snapshot of one build attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildJob {
    pub build_id: String,
    pub target: TargetId,
    pub state: BuildState,
    /// Resolved parameters; empty when resolution failed.
    pub parameters: ParameterSet,
    pub artifact: ArtifactKind,
    /// Output lines published so far, which is also the next line number.
    pub lines: u64,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Caller's view of an accepted build.
#[derive(Debug, Clone)]
pub struct BuildHandle {
    build_id: String,
    target: TargetId,
    job: watch::Receiver<BuildJob>,
}

impl BuildHandle {
    pub fn build_id(&self) -> &str {
        &self.build_id
    }

    pub fn target(&self) -> &TargetId {
        &self.target
    }

    pub fn snapshot(&self) -> BuildJob {
        self.job.borrow().clone()
    }

    /// Wait until the build reaches a terminal state and return the final job.
    pub async fn wait(&mut self) -> BuildJob {
        let finished = self
            .job
            .wait_for(|job| job.state.is_terminal())
            .await
            .map(|job| job.clone());
        match finished {
            Ok(job) => job,
            // Driver gone; its last write is final.
            Err(_) => self.job.borrow().clone(),
        }
    }
}

struct RunningBuild {
    build_id: String,
    cancel: CancellationToken,
}

#[derive(Default)]
struct Slot {
    running: Option<RunningBuild>,
    last_job: Option<watch::Receiver<BuildJob>>,
}

struct Inner {
    registry: Arc<DeviceRegistry>,
    config: Arc<dyn ConfigSource>,
    toolchain: Arc<dyn Toolchain>,
    bus: EventBus,
    slots: Mutex<HashMap<TargetId, Slot>>,
}

impl Inner {
    fn slots(&self) -> MutexGuard<'_, HashMap<TargetId, Slot>> {
        self.slots
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Publish the terminal event and free the slot in one step.
    fn finish(
        &self,
        target: &TargetId,
        build_id: &str,
        state: BuildState,
        job: &watch::Sender<BuildJob>,
        started: Instant,
    ) {
        let _span = BuildSpan::enter(target.as_str(), build_id);
        {
            let mut slots = self.slots();
            self.bus.publish(
                Topic::Build(target.clone()),
                EventPayload::BuildStateChanged {
                    build_id: build_id.to_string(),
                    state: state.clone(),
                },
            );
            if let Some(slot) = slots.get_mut(target) {
                if slot
                    .running
                    .as_ref()
                    .is_some_and(|running| running.build_id == build_id)
                {
                    slot.running = None;
                }
            }
        }

        job.send_modify(|job| {
            job.state = state.clone();
            job.finished_at = Some(Utc::now());
        });

        match &state {
            BuildState::Succeeded { .. } => METRICS.inc_builds_succeeded(),
            BuildState::Cancelled { .. } => METRICS.inc_builds_cancelled(),
            _ => METRICS.inc_builds_failed(),
        }
        let lines = job.borrow().lines;
        emit_build_finished(
            target.as_str(),
            build_id,
            &state,
            lines,
            started.elapsed().as_millis() as u64,
        );
    }
}

/// Releases a reserved slot if `submit` is abandoned before the driving task
/// takes over.
struct SlotGuard {
    inner: Arc<Inner>,
    target: TargetId,
    build_id: String,
    armed: bool,
}

impl SlotGuard {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut slots = self.inner.slots();
        if let Some(slot) = slots.get_mut(&self.target) {
            if slot
                .running
                .as_ref()
                .is_some_and(|running| running.build_id == self.build_id)
            {
                slot.running = None;
            }
        }
    }
}

/// Drives builds for every target in the registry.
#[derive(Clone)]
pub struct BuildOrchestrator {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for BuildOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BuildOrchestrator")
            .field("config", &self.inner.config.describe())
            .field("toolchain", &self.inner.toolchain.name())
            .finish()
    }
}

impl BuildOrchestrator {
    pub fn new(
        registry: Arc<DeviceRegistry>,
        config: Arc<dyn ConfigSource>,
        toolchain: Arc<dyn Toolchain>,
        bus: EventBus,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                registry,
                config,
                toolchain,
                bus,
                slots: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.inner.registry
    }

    pub fn bus(&self) -> &EventBus {
        &self.inner.bus
    }

    /// Start a build for `request.target`.
    ///
    /// Fails with [`BuildError::AlreadyBuilding`] while the target has a build
    /// in flight, and with [`BuildError::Configuration`] when an override is
    /// not accepted by the registry device or the parameters cannot be
    /// resolved. In the latter case a `Failed` state change is still
    /// published and no toolchain is started.
    pub async fn submit(&self, request: BuildRequest) -> Result<BuildHandle> {
        let BuildRequest {
            target,
            overrides,
            artifact,
        } = request;
        let device = self
            .inner
            .registry
            .get(&target)
            .map_err(|_| BuildError::UnknownTarget(target.to_string()))?;

        let build_id = Uuid::new_v4().to_string();
        let cancel = CancellationToken::new();
        let (job_tx, job_rx) = watch::channel(BuildJob {
            build_id: build_id.clone(),
            target: target.clone(),
            state: BuildState::Idle,
            parameters: ParameterSet::new(),
            artifact,
            lines: 0,
            started_at: Utc::now(),
            finished_at: None,
        });

        {
            let mut slots = self.inner.slots();
            let slot = slots.entry(target.clone()).or_default();
            if slot.running.is_some() {
                return Err(BuildError::AlreadyBuilding {
                    target: target.to_string(),
                });
            }
            slot.running = Some(RunningBuild {
                build_id: build_id.clone(),
                cancel: cancel.clone(),
            });
            slot.last_job = Some(job_rx.clone());
        }
        let guard = SlotGuard {
            inner: self.inner.clone(),
            target: target.clone(),
            build_id: build_id.clone(),
            armed: true,
        };
        let started = Instant::now();

        let resolved = match check_accepted(&device, &overrides) {
            Ok(()) => self.inner.config.resolve(&target, &overrides).await,
            Err(err) => Err(err),
        };
        let parameters = match resolved {
            Ok(parameters) => parameters,
            Err(err) => {
                let state = BuildState::Failed {
                    kind: BuildFailureKind::Configuration,
                    reason: err.to_string(),
                };
                self.inner
                    .finish(&target, &build_id, state, &job_tx, started);
                guard.disarm();
                return Err(BuildError::Configuration(err));
            }
        };

        job_tx.send_modify(|job| {
            job.state = BuildState::Running;
            job.parameters = parameters.clone();
        });
        self.inner.bus.publish(
            Topic::Build(target.clone()),
            EventPayload::BuildStateChanged {
                build_id: build_id.clone(),
                state: BuildState::Running,
            },
        );
        METRICS.inc_builds_started();
        emit_build_started(target.as_str(), &build_id, parameters.len());

        let toolchain_request = ToolchainRequest {
            build_id: build_id.clone(),
            target: device.target.clone(),
            parameters,
            artifact,
        };
        let span = tracing::info_span!("rcforge.build", target = %target, build_id = %build_id);
        tokio::spawn(
            drive(
                self.inner.clone(),
                target.clone(),
                build_id.clone(),
                toolchain_request,
                cancel,
                job_tx,
                started,
            )
            .instrument(span),
        );
        guard.disarm();

        Ok(BuildHandle {
            build_id,
            target,
            job: job_rx,
        })
    }

    /// Request cancellation of the build in flight for `target`.
    ///
    /// Returns as soon as the request is recorded; the build reaches
    /// `Cancelled` asynchronously once the toolchain has stopped.
    pub fn cancel_build(&self, target: &TargetId) -> Result<()> {
        let slots = self.inner.slots();
        match slots.get(target).and_then(|slot| slot.running.as_ref()) {
            Some(running) => {
                running.cancel.cancel();
                info!(target = %target, build_id = %running.build_id, "build cancellation requested");
                Ok(())
            }
            None => Err(BuildError::NotBuilding {
                target: target.to_string(),
            }),
        }
    }

    /// `Running` while a build is in flight for `target`, otherwise `Idle`.
    pub fn state(&self, target: &TargetId) -> BuildState {
        let slots = self.inner.slots();
        match slots.get(target) {
            Some(slot) if slot.running.is_some() => BuildState::Running,
            _ => BuildState::Idle,
        }
    }

    /// Latest job for `target`, finished or not.
    pub fn job(&self, target: &TargetId) -> Option<BuildJob> {
        let slots = self.inner.slots();
        slots
            .get(target)
            .and_then(|slot| slot.last_job.as_ref())
            .map(|job| job.borrow().clone())
    }

    /// Wait for every build in flight to reach a terminal state.
    ///
    /// Returns `false` if some build was still running when `limit` ran out.
    pub async fn wait_idle(&self, limit: Duration) -> bool {
        let jobs: Vec<watch::Receiver<BuildJob>> = {
            let slots = self.inner.slots();
            slots
                .values()
                .filter(|slot| slot.running.is_some())
                .filter_map(|slot| slot.last_job.clone())
                .collect()
        };
        let settled = async move {
            for mut job in jobs {
                // A dropped sender means the submit was abandoned.
                let _ = job.wait_for(|job| job.state.is_terminal()).await;
            }
        };
        tokio::time::timeout(limit, settled).await.is_ok()
    }

    /// Targets with a build in flight, ordered by id.
    pub fn running(&self) -> Vec<TargetId> {
        let slots = self.inner.slots();
        let mut targets: Vec<TargetId> = slots
            .iter()
            .filter(|(_, slot)| slot.running.is_some())
            .map(|(target, _)| target.clone())
            .collect();
        targets.sort();
        targets
    }
}

/// Every override must be a parameter the registry device declares.
fn check_accepted(device: &Device, overrides: &ParameterSet) -> std::result::Result<(), ConfigError> {
    match overrides.iter().find(|(name, _)| !device.accepts(name)) {
        Some((name, _)) => Err(ConfigError::NotAccepted {
            target: device.id().to_string(),
            parameter: name.to_string(),
        }),
        None => Ok(()),
    }
}

async fn drive(
    inner: Arc<Inner>,
    target: TargetId,
    build_id: String,
    request: ToolchainRequest,
    cancel: CancellationToken,
    job: watch::Sender<BuildJob>,
    started: Instant,
) {
    let topic = Topic::Build(target.clone());
    let state = match inner.toolchain.build(request, cancel).await {
        Err(err) => BuildState::Failed {
            kind: err.failure_kind(),
            reason: err.to_string(),
        },
        Ok(mut stream) => loop {
            match stream.next().await {
                Some(ToolchainEvent::Line(text)) => {
                    let line = job.borrow().lines;
                    inner.bus.publish(
                        topic.clone(),
                        EventPayload::BuildOutputLine {
                            build_id: build_id.clone(),
                            line,
                            text,
                        },
                    );
                    job.send_modify(|job| job.lines += 1);
                }
                Some(ToolchainEvent::Finished(outcome)) => break outcome.into_state(),
                None => {
                    break BuildState::Failed {
                        kind: BuildFailureKind::Internal,
                        reason: "toolchain stream ended without an outcome".to_string(),
                    }
                }
            }
        },
    };
    inner.finish(&target, &build_id, state, &job, started);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::{ScriptedToolchain, StaticConfigSource};
    use rcforge_core::Target;

    fn device(id: &str) -> Device {
        Device {
            target: Target {
                id: TargetId::new(id),
                platform: "espressif32".into(),
                board: "esp32dev".into(),
                arch: "xtensa-esp32-none-elf".into(),
            },
            product_name: format!("{id} product"),
            connections: vec![],
            parameters: Default::default(),
        }
    }

    fn orchestrator(toolchain: ScriptedToolchain) -> BuildOrchestrator {
        let registry = DeviceRegistry::from_devices(vec![device("TX_ESP32"), device("RX_2400")]).unwrap();
        let config = StaticConfigSource::new()
            .with_target("TX_ESP32", ParameterSet::new())
            .with_target("RX_2400", ParameterSet::new());
        BuildOrchestrator::new(
            Arc::new(registry),
            Arc::new(config),
            Arc::new(toolchain),
            EventBus::new(),
        )
    }

    #[tokio::test]
    async fn unknown_target_rejected_without_events() {
        let orch = orchestrator(ScriptedToolchain::succeeding(Vec::<String>::new(), "/out/fw.bin"));
        let mut sub = orch.bus().subscribe(Topic::Build(TargetId::new("NOPE")));
        let err = orch.submit(BuildRequest::new("NOPE")).await.unwrap_err();
        assert!(matches!(err, BuildError::UnknownTarget(_)));
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn cancel_idle_target_is_not_building() {
        let orch = orchestrator(ScriptedToolchain::hanging());
        let err = orch.cancel_build(&TargetId::new("TX_ESP32")).unwrap_err();
        assert!(matches!(err, BuildError::NotBuilding { .. }));
    }

    #[tokio::test]
    async fn job_snapshot_tracks_lines_and_terminal_state() {
        let orch = orchestrator(ScriptedToolchain::succeeding(["a", "b", "c"], "/out/fw.bin"));
        let mut handle = orch.submit(BuildRequest::new("TX_ESP32")).await.unwrap();
        let job = handle.wait().await;
        assert_eq!(job.lines, 3);
        assert!(job.finished_at.is_some());
        assert_eq!(
            job.state,
            BuildState::Succeeded {
                artifact: "/out/fw.bin".into()
            }
        );
        assert_eq!(orch.job(&TargetId::new("TX_ESP32")), Some(job));
        assert_eq!(orch.state(&TargetId::new("TX_ESP32")), BuildState::Idle);
    }

    #[tokio::test]
    async fn unrelated_targets_build_in_parallel() {
        let orch = orchestrator(ScriptedToolchain::hanging());
        orch.submit(BuildRequest::new("TX_ESP32")).await.unwrap();
        orch.submit(BuildRequest::new("RX_2400")).await.unwrap();
        assert_eq!(
            orch.running(),
            vec![TargetId::new("RX_2400"), TargetId::new("TX_ESP32")]
        );
        orch.cancel_build(&TargetId::new("TX_ESP32")).unwrap();
        orch.cancel_build(&TargetId::new("RX_2400")).unwrap();
    }

    #[tokio::test]
    async fn wait_idle_returns_once_cancelled_builds_finish() {
        let orch = orchestrator(ScriptedToolchain::hanging());
        assert!(orch.wait_idle(Duration::from_millis(10)).await);

        let handle = orch.submit(BuildRequest::new("TX_ESP32")).await.unwrap();
        assert!(!orch.wait_idle(Duration::from_millis(50)).await);

        orch.cancel_build(&TargetId::new("TX_ESP32")).unwrap();
        assert!(orch.wait_idle(Duration::from_secs(5)).await);
        assert!(orch.running().is_empty());
        assert!(matches!(handle.snapshot().state, BuildState::Cancelled { .. }));
    }

    #[tokio::test]
    async fn spawn_failure_is_reported_as_failed_build() {
        let orch = orchestrator(ScriptedToolchain::failing_to_spawn("no such file"));
        let mut handle = orch.submit(BuildRequest::new("TX_ESP32")).await.unwrap();
        let job = handle.wait().await;
        assert!(matches!(
            job.state,
            BuildState::Failed {
                kind: BuildFailureKind::ToolchainSpawn,
                ..
            }
        ));
        // A fresh submit is allowed once idle.
        assert!(orch.submit(BuildRequest::new("TX_ESP32")).await.is_ok());
    }
}
