//! Forge Sandbox - isolated execution of generated applications
//!
//! Takes a bundle of generated files plus declared dependencies, checks it
//! against a static security policy, writes it into a private workspace,
//! installs dependencies and runs the app under either a process-group or a
//! container isolation strategy, and tracks every sandbox by id until it is
//! stopped or times out.

mod config;
mod error;
mod execution;
mod limits;
mod logs;
mod policy;
mod probe;
mod runtime;
mod service;
mod types;
mod workspace;

pub use config::{
    CommandConfig, ContainerConfig, EngineConfig, LimitsConfig, LogConfig, NetworkMode, PortRange,
    ProcessConfig, ReadinessConfig,
};
pub use error::{MaterializeError, SandboxError, SandboxResult};
pub use execution::{IsolationKind, SandboxId, SandboxRecord, SandboxState, StopReason};
pub use limits::{BundleLimits, ResourceConfig, ResourceLimits, MIN_CPU, MIN_MEMORY_BYTES, MIN_TIMEOUT};
pub use logs::{LogCollector, LogLine, LogStream, ResourceSample};
pub use policy::{
    normalize_name, PolicyConfig, Rule, SecurityValidator, ValidationVerdict, Violation,
    DEFAULT_DENYLIST,
};
pub use probe::HealthProbe;
#[cfg(feature = "container")]
pub use runtime::{ContainerRuntime, ContainerStats};
#[cfg(feature = "process")]
pub use runtime::ProcessRuntime;
pub use runtime::{
    from_config as runtime_from_config, Readiness, Runtime, SandboxUnit, TeardownReport,
    TeardownStep, UnitEvent, UnitSpec,
};
pub use service::SandboxService;
pub use types::{
    DependencyMap, ExecuteRequest, ExecuteResponse, FileMap, HealthReport, SandboxView, UpdateAck,
};
pub use workspace::{Materializer, BUILD_DESCRIPTOR_NAME, LOG_FILE_NAME};

/// Re-export common error types
pub type Result<T> = anyhow::Result<T>;
