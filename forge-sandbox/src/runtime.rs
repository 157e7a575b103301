//! Isolation strategies
//!
//! A [`Runtime`] is a factory chosen once from configuration; each sandbox
//! gets its own [`SandboxUnit`] which drives install → run → exit and
//! reports progress as [`UnitEvent`]s.

#[cfg(feature = "container")]
mod container;
#[cfg(feature = "process")]
mod process;

use crate::config::EngineConfig;
use crate::error::SandboxError;
use crate::execution::{IsolationKind, SandboxId};
use crate::limits::ResourceLimits;
use crate::logs::{LogCollector, LogLine, LogStream, ResourceSample};
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{info, warn};

#[cfg(feature = "container")]
pub use container::{ContainerRuntime, ContainerStats};
#[cfg(feature = "process")]
pub use process::ProcessRuntime;

/// Everything a strategy needs to bring one sandbox up
#[derive(Debug, Clone)]
pub struct UnitSpec {
    pub id: SandboxId,
    pub workspace: PathBuf,
    /// Host port assigned by the registry
    pub port: u16,
    /// Entry point substituted for `{entry}`
    pub entry: String,
    pub limits: ResourceLimits,
    pub logs: LogCollector,
}

/// How readiness was established
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    /// A ready marker appeared in the output
    Marker(String),
    /// The grace period elapsed with the app still alive
    GracePeriod,
    /// The HTTP liveness probe answered
    Probe,
}

/// Progress reported by a unit to the registry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnitEvent {
    /// Install (or image build) finished successfully
    Installed,
    Ready(Readiness),
    /// The app exited; `None` means it was killed by a signal
    Exited { code: Option<i32> },
    /// Install, build or spawn failed; the app never ran
    Failed { reason: String },
}

/// Isolation strategy factory
#[async_trait]
pub trait Runtime: Send + Sync {
    /// Get runtime name
    fn name(&self) -> &str;

    fn kind(&self) -> IsolationKind;

    /// Check that the strategy can run on this host
    async fn preflight(&self) -> crate::Result<()>;

    /// Create a unit for one sandbox. Nothing is started yet.
    fn create(&self, spec: UnitSpec) -> Arc<dyn SandboxUnit>;
}

/// One supervised sandbox
#[async_trait]
pub trait SandboxUnit: Send + Sync {
    /// Address callers use to reach the app
    fn endpoint(&self) -> String;

    /// Drive the unit until the app exits, install fails, or the unit is stopped.
    async fn start(&self, events: mpsc::Sender<UnitEvent>);

    /// Kill the app but keep the workspace
    async fn halt(&self);

    /// Tear everything down. Every step is attempted; failures are reported,
    /// never returned.
    async fn stop(&self) -> TeardownReport;

    /// Current resource usage, if it can be measured
    async fn stats(&self) -> Option<ResourceSample>;

    /// Last `tail` captured lines
    fn logs(&self, tail: usize) -> Vec<LogLine>;
}

/// Build the strategy selected by `config.isolation`
pub fn from_config(config: &EngineConfig) -> Result<Arc<dyn Runtime>, SandboxError> {
    match config.isolation {
        #[cfg(feature = "process")]
        IsolationKind::Process => Ok(Arc::new(ProcessRuntime::new(config))),
        #[cfg(feature = "container")]
        IsolationKind::Container => Ok(Arc::new(ContainerRuntime::new(config))),
        #[allow(unreachable_patterns)]
        other => Err(SandboxError::RuntimeUnavailable(format!(
            "{other} (compiled without the '{other}' feature)"
        ))),
    }
}

/// Outcome of one teardown step
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TeardownStep {
    pub name: &'static str,
    pub error: Option<String>,
}

/// Ordered record of a teardown. Steps never short-circuit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TeardownReport {
    pub steps: Vec<TeardownStep>,
}

impl TeardownReport {
    /// Record a step result and log it
    pub fn record<E: std::fmt::Display>(
        &mut self,
        id: &SandboxId,
        name: &'static str,
        result: std::result::Result<(), E>,
    ) {
        let error = match result {
            Ok(()) => {
                info!(sandbox_id = %id, step = name, "teardown step done");
                None
            }
            Err(e) => {
                warn!(sandbox_id = %id, step = name, error = %e, "teardown step failed");
                Some(e.to_string())
            }
        };
        self.steps.push(TeardownStep { name, error });
    }

    pub fn is_clean(&self) -> bool {
        self.steps.iter().all(|step| step.error.is_none())
    }
}

/// Watches output lines for ready markers; fires at most once.
#[derive(Clone)]
pub(crate) struct MarkerWatch {
    markers: Arc<Vec<String>>,
    fired: Arc<Mutex<Option<oneshot::Sender<String>>>>,
}

impl MarkerWatch {
    pub(crate) fn new(markers: &[String]) -> (Self, oneshot::Receiver<String>) {
        let (tx, rx) = oneshot::channel();
        let watch = Self {
            markers: Arc::new(markers.iter().map(|m| m.to_lowercase()).collect()),
            fired: Arc::new(Mutex::new(Some(tx))),
        };
        (watch, rx)
    }

    pub(crate) fn observe(&self, line: &str) {
        let line = line.to_lowercase();
        let Some(marker) = self.markers.iter().find(|m| line.contains(m.as_str())) else {
            return;
        };
        let sender = self
            .fired
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(sender) = sender {
            let _ = sender.send(marker.clone());
        }
    }
}

/// Copy lines from `reader` into the collector until EOF
pub(crate) fn pump_lines<R>(
    reader: R,
    stream: LogStream,
    logs: LogCollector,
    watch: Option<MarkerWatch>,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        // split on raw bytes so non-UTF-8 output never stalls the pipe
        let mut segments = BufReader::new(reader).split(b'\n');
        loop {
            match segments.next_segment().await {
                Ok(Some(raw)) => {
                    let line = String::from_utf8_lossy(&raw);
                    let line = line.trim_end_matches('\r');
                    if let Some(watch) = &watch {
                        watch.observe(line);
                    }
                    logs.push(stream, line);
                }
                Ok(None) => break,
                Err(e) => {
                    logs.system(format!("{stream} capture stopped: {e}"));
                    break;
                }
            }
        }
    })
}

/// Substitute `{entry}` and `{port}` in a command argument
pub(crate) fn substitute(arg: &str, entry: &str, port: u16) -> String {
    arg.replace("{entry}", entry).replace("{port}", &port.to_string())
}
