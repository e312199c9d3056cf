//! rcforge core library
//!
//! Shared foundation for the build and device layers:
//! - hardware catalog types and the [`DeviceRegistry`]
//! - the [`Event`] model and the process-wide [`EventBus`]
//! - tracing initialisation, lifecycle log hooks and metrics counters

pub mod bus;
pub mod error;
pub mod event;
pub mod metrics;
pub mod model;
pub mod obs;
pub mod registry;
pub mod telemetry;

pub use bus::{EventBus, Subscription, DEFAULT_TOPIC_CAPACITY};
pub use error::{RegistryError, Result};
pub use event::{BuildFailureKind, BuildState, DeviceAdvert, Event, EventPayload, Topic};
pub use metrics::METRICS;
pub use model::{ConnectionType, Device, DeviceId, ParamValue, ParameterSet, Target, TargetId};
pub use obs::{
    emit_build_finished, emit_build_started, emit_device_lost, emit_device_seen,
    emit_serial_closed, emit_serial_opened, BuildSpan,
};
pub use registry::{DeviceRegistry, JsonFileSource, RegistrySource, StaticSource};
pub use telemetry::init_tracing;

/// rcforge version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
