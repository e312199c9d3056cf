//! Toolchain adapter that runs an external build command.
//!
//! The command sees the request through `RCFORGE_*` environment variables and
//! `{target}`, `{platform}`, `{board}` and `{output_dir}` placeholders in its
//! arguments. Every stdout and stderr line becomes a build output line. A
//! stdout line of the form `@artifact <path>` names the produced image;
//! without one the artifact is `<output_dir>/<target>.bin`.
//!
//! Stopping is two-phase: a soft stop (SIGTERM to the process group on unix),
//! then a hard kill once the grace period runs out. Whatever is left of the
//! group when the toolchain itself is gone gets SIGKILL, so no helper the
//! toolchain forked outlives its build.

use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::BuildError;
use crate::toolchain::{
    BuildStream, BuildStreamSender, FailureCause, Toolchain, ToolchainFailure, ToolchainOutcome,
    ToolchainRequest,
};

pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(5);

const ARTIFACT_MARKER: &str = "@artifact ";
const STREAM_CAPACITY: usize = 256;
/// How long to wait for output readers after the process is gone.
const READER_DRAIN: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct ProcessToolchainSettings {
    pub program: String,
    pub args: Vec<String>,
    pub work_dir: Option<PathBuf>,
    /// Root under which each target gets its own output directory.
    pub artifact_dir: PathBuf,
    pub grace_period: Duration,
    /// Wall-clock limit for one build. `None` means unlimited.
    pub deadline: Option<Duration>,
}

impl ProcessToolchainSettings {
    pub fn new(program: impl Into<String>, artifact_dir: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            work_dir: None,
            artifact_dir: artifact_dir.into(),
            grace_period: DEFAULT_GRACE_PERIOD,
            deadline: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProcessToolchain {
    settings: ProcessToolchainSettings,
}

enum Stop {
    Exited(std::io::Result<ExitStatus>),
    Cancelled,
    Deadline,
}

impl ProcessToolchain {
    pub fn new(settings: ProcessToolchainSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &ProcessToolchainSettings {
        &self.settings
    }

    fn output_dir(&self, request: &ToolchainRequest) -> PathBuf {
        self.settings.artifact_dir.join(request.target.id.as_str())
    }

    fn expand(&self, arg: &str, request: &ToolchainRequest, output_dir: &Path) -> String {
        arg.replace("{target}", request.target.id.as_str())
            .replace("{platform}", &request.target.platform)
            .replace("{board}", &request.target.board)
            .replace("{output_dir}", &output_dir.to_string_lossy())
    }

    fn command(&self, request: &ToolchainRequest, output_dir: &Path) -> Command {
        let mut cmd = std::process::Command::new(&self.settings.program);
        cmd.args(
            self.settings
                .args
                .iter()
                .map(|a| self.expand(a, request, output_dir)),
        )
        .env("RCFORGE_BUILD_ID", &request.build_id)
        .env("RCFORGE_TARGET", request.target.id.as_str())
        .env("RCFORGE_PLATFORM", &request.target.platform)
        .env("RCFORGE_BOARD", &request.target.board)
        .env("RCFORGE_ARCH", &request.target.arch)
        .env("RCFORGE_ARTIFACT_KIND", request.artifact.as_str())
        .env("RCFORGE_OUTPUT_DIR", output_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

        for (name, value) in request.parameters.iter() {
            cmd.env(param_env_name(name), value.render());
        }
        if let Some(dir) = &self.settings.work_dir {
            cmd.current_dir(dir);
        }
        // Own process group so a stop signal reaches every child the
        // toolchain forks.
        #[cfg(unix)]
        std::os::unix::process::CommandExt::process_group(&mut cmd, 0);

        let mut cmd = Command::from(cmd);
        cmd.kill_on_drop(true);
        cmd
    }
}

/// `telemetry-ratio` -> `RCFORGE_PARAM_TELEMETRY_RATIO`
fn param_env_name(name: &str) -> String {
    let suffix: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect();
    format!("RCFORGE_PARAM_{suffix}")
}

#[async_trait]
impl Toolchain for ProcessToolchain {
    async fn build(
        &self,
        request: ToolchainRequest,
        cancel: CancellationToken,
    ) -> Result<BuildStream, BuildError> {
        let (tx, stream) = BuildStream::channel(STREAM_CAPACITY);

        if cancel.is_cancelled() {
            tx.finish(ToolchainOutcome::Failure(ToolchainFailure::new(
                FailureCause::Cancelled { forced: false },
                "cancelled before start",
            )))
            .await;
            return Ok(stream);
        }

        let output_dir = self.output_dir(&request);
        tokio::fs::create_dir_all(&output_dir).await.map_err(|e| {
            BuildError::ToolchainSpawn(format!("{}: {e}", output_dir.display()))
        })?;

        let mut child = self
            .command(&request, &output_dir)
            .spawn()
            .map_err(|e| BuildError::ToolchainSpawn(format!("{}: {e}", self.settings.program)))?;
        let group = child.id();
        debug!(
            program = %self.settings.program,
            pid = group,
            target = %request.target.id,
            "toolchain spawned"
        );

        let stdout = child.stdout.take().map(|out| spawn_reader(out, tx.clone(), true));
        let stderr = child.stderr.take().map(|err| spawn_reader(err, tx.clone(), false));

        let default_artifact = output_dir.join(format!("{}.bin", request.target.id));
        let grace = self.settings.grace_period;
        let deadline = self.settings.deadline;
        let target = request.target.id.to_string();

        tokio::spawn(async move {
            let stop = {
                let expiry = async {
                    match deadline {
                        Some(limit) => tokio::time::sleep(limit).await,
                        None => std::future::pending::<()>().await,
                    }
                };
                tokio::select! {
                    status = child.wait() => Stop::Exited(status),
                    _ = cancel.cancelled() => Stop::Cancelled,
                    _ = expiry => Stop::Deadline,
                }
            };

            let outcome = match stop {
                Stop::Exited(Ok(status)) => {
                    kill_group(group);
                    let marker = drain(stdout).await;
                    drain(stderr).await;
                    if status.success() {
                        ToolchainOutcome::Success {
                            artifact: marker.unwrap_or(default_artifact),
                        }
                    } else {
                        ToolchainOutcome::Failure(ToolchainFailure::new(
                            FailureCause::Exit {
                                code: status.code(),
                            },
                            describe_exit(status),
                        ))
                    }
                }
                Stop::Exited(Err(e)) => {
                    hard_kill(&mut child, group).await;
                    ToolchainOutcome::Failure(ToolchainFailure::new(
                        FailureCause::Internal,
                        format!("waiting on toolchain failed: {e}"),
                    ))
                }
                Stop::Cancelled => {
                    let forced = terminate(&mut child, group, grace, &target).await;
                    drain(stdout).await;
                    drain(stderr).await;
                    let reason = if forced {
                        format!("cancelled; toolchain killed after {} ms grace period", grace.as_millis())
                    } else {
                        "cancelled".to_string()
                    };
                    ToolchainOutcome::Failure(ToolchainFailure::new(
                        FailureCause::Cancelled { forced },
                        reason,
                    ))
                }
                Stop::Deadline => {
                    let forced = terminate(&mut child, group, grace, &target).await;
                    drain(stdout).await;
                    drain(stderr).await;
                    let limit = deadline.unwrap_or_default();
                    ToolchainOutcome::Failure(ToolchainFailure::new(
                        FailureCause::Timeout { forced },
                        format!("build exceeded deadline of {} s", limit.as_secs()),
                    ))
                }
            };
            tx.finish(outcome).await;
        });

        Ok(stream)
    }

    fn name(&self) -> &str {
        &self.settings.program
    }
}

fn describe_exit(status: ExitStatus) -> String {
    match status.code() {
        Some(code) => format!("exit status {code}"),
        None => "terminated by signal".to_string(),
    }
}

/// Forward lines from one pipe. The stdout reader also returns the artifact
/// path announced by the toolchain, if any.
fn spawn_reader<R>(pipe: R, tx: BuildStreamSender, parse_marker: bool) -> JoinHandle<Option<PathBuf>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut artifact = None;
        let mut segments = BufReader::new(pipe).split(b'\n');
        loop {
            let segment = match segments.next_segment().await {
                Ok(Some(segment)) => segment,
                Ok(None) => break,
                Err(e) => {
                    debug!(error = %e, "toolchain pipe read failed");
                    break;
                }
            };
            let text = String::from_utf8_lossy(&segment);
            let text = text.trim_end_matches('\r');
            if parse_marker {
                if let Some(path) = text.strip_prefix(ARTIFACT_MARKER) {
                    artifact = Some(PathBuf::from(path.trim()));
                    continue;
                }
            }
            if !tx.line(text).await {
                break;
            }
        }
        artifact
    })
}

async fn drain(reader: Option<JoinHandle<Option<PathBuf>>>) -> Option<PathBuf> {
    let mut handle = reader?;
    match tokio::time::timeout(READER_DRAIN, &mut handle).await {
        Ok(Ok(artifact)) => artifact,
        Ok(Err(e)) => {
            debug!(error = %e, "toolchain reader task failed");
            None
        }
        Err(_) => {
            handle.abort();
            debug!("toolchain output still open after exit; reader abandoned");
            None
        }
    }
}

/// Soft stop, then hard kill after `grace`. Returns whether the kill was needed.
async fn terminate(child: &mut Child, group: Option<u32>, grace: Duration, target: &str) -> bool {
    if let Err(e) = soft_stop(child, group) {
        warn!(error = %e, pid = group, "soft stop failed");
    }
    if tokio::time::timeout(grace, child.wait()).await.is_ok() {
        kill_group(group);
        return false;
    }

    let err = BuildError::CancellationTimeout {
        target: target.to_string(),
        grace_ms: grace.as_millis() as u64,
    };
    warn!(error = %err, "escalating to hard kill");
    hard_kill(child, group).await;
    true
}

/// Send `signal` to every process in the group led by `group`.
///
/// A group that no longer exists is not an error.
#[cfg(unix)]
fn signal_group(group: Option<u32>, signal: libc::c_int) -> std::io::Result<()> {
    let Some(pid) = group else {
        return Ok(());
    };
    let pgid = libc::pid_t::try_from(pid).map_err(|_| {
        std::io::Error::new(std::io::ErrorKind::InvalidInput, format!("pid {pid} out of range"))
    })?;
    // SAFETY: killpg takes two integers and touches no memory of ours.
    if unsafe { libc::killpg(pgid, signal) } == 0 {
        return Ok(());
    }
    let err = std::io::Error::last_os_error();
    match err.raw_os_error() {
        Some(libc::ESRCH) => Ok(()),
        _ => Err(err),
    }
}

#[cfg(unix)]
fn soft_stop(_child: &mut Child, group: Option<u32>) -> std::io::Result<()> {
    signal_group(group, libc::SIGTERM)
}

#[cfg(not(unix))]
fn soft_stop(child: &mut Child, _group: Option<u32>) -> std::io::Result<()> {
    // No soft stop available; the hard kill below ends the process.
    child.start_kill()
}

/// SIGKILL the group. Also used once the leader has exited, for leftovers.
#[cfg(unix)]
fn kill_group(group: Option<u32>) {
    if let Err(e) = signal_group(group, libc::SIGKILL) {
        warn!(error = %e, pid = group, "failed to kill toolchain process group");
    }
}

#[cfg(not(unix))]
fn kill_group(_group: Option<u32>) {}

async fn hard_kill(child: &mut Child, group: Option<u32>) {
    kill_group(group);
    if let Err(e) = child.kill().await {
        debug!(error = %e, "toolchain already gone");
    }
}
