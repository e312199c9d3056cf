//! Structured observability hooks for build and device lifecycle events.
//!
//! Events are emitted at `info!` level except failures, which use `warn!`.

use tracing::{info, warn};

use crate::event::BuildState;

/// RAII guard that enters a build-scoped tracing span.
///
/// ```ignore
/// let _span = BuildSpan::enter("TX_ESP32", "b-42");
/// // tracing calls here carry target = "TX_ESP32"
/// ```
pub struct BuildSpan {
    _span: tracing::span::EnteredSpan,
}

impl BuildSpan {
    pub fn enter(target: &str, build_id: &str) -> Self {
        let span = tracing::info_span!("rcforge.build", target = %target, build_id = %build_id);
        Self {
            _span: span.entered(),
        }
    }
}

/// Emit event: build accepted and toolchain about to start.
pub fn emit_build_started(target: &str, build_id: &str, parameters: usize) {
    info!(event = "build.started", target = %target, build_id = %build_id, parameters);
}

/// Emit event: build reached a terminal state.
pub fn emit_build_finished(target: &str, build_id: &str, state: &BuildState, lines: u64, duration_ms: u64) {
    match state {
        BuildState::Failed { kind, reason } => warn!(
            event = "build.finished",
            target = %target,
            build_id = %build_id,
            state = state.label(),
            kind = ?kind,
            reason = %reason,
            lines,
            duration_ms,
        ),
        _ => info!(
            event = "build.finished",
            target = %target,
            build_id = %build_id,
            state = state.label(),
            lines,
            duration_ms,
        ),
    }
}

/// Emit event: a device advertised itself for the first time.
pub fn emit_device_seen(device_id: &str, address: &str) {
    info!(event = "device.seen", device_id = %device_id, address = %address);
}

/// Emit event: a device stopped advertising.
pub fn emit_device_lost(device_id: &str) {
    info!(event = "device.lost", device_id = %device_id);
}

/// Emit event: serial connection acquired.
pub fn emit_serial_opened(device_id: &str, port: &str, baud_rate: u32) {
    info!(event = "serial.opened", device_id = %device_id, port = %port, baud_rate);
}

/// Emit event: serial connection released, with the error if one caused it.
pub fn emit_serial_closed(device_id: &str, error: Option<&dyn std::fmt::Display>) {
    match error {
        Some(error) => warn!(event = "serial.closed", device_id = %device_id, error = %error),
        None => info!(event = "serial.closed", device_id = %device_id),
    }
}
