//! Sandbox service - the registry every caller goes through
//!
//! The id→sandbox map sits behind one async mutex. Spawning, log capture and
//! image builds happen outside it; only map mutations and state transitions
//! happen inside. Each sandbox runs three background tasks (pipeline, event
//! applier, resource sampler) plus a timeout timer owned by its entry.

use crate::config::{EngineConfig, PortRange};
use crate::error::{MaterializeError, SandboxError, SandboxResult};
use crate::execution::{IsolationKind, SandboxId, SandboxRecord, SandboxState, StopReason};
use crate::limits::ResourceLimits;
use crate::logs::LogCollector;
use crate::policy::SecurityValidator;
use crate::runtime::{self, Runtime, SandboxUnit, TeardownReport, UnitEvent, UnitSpec};
use crate::types::{ExecuteRequest, ExecuteResponse, FileMap, HealthReport, SandboxView, UpdateAck};
use crate::workspace::{Materializer, LOG_FILE_NAME};
use futures::future::join_all;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, MutexGuard, PoisonError};
use tokio::sync::{mpsc, Mutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

/// Sandbox registry
#[derive(Clone)]
pub struct SandboxService {
    inner: Arc<Registry>,
}

struct Registry {
    config: EngineConfig,
    runtime: Arc<dyn Runtime>,
    validator: SecurityValidator,
    materializer: Materializer,
    workspaces: WorkspaceLocks,
    state: Mutex<RegistryState>,
}

/// Per-id locks serializing every write to or removal of a workspace
/// directory. A generation holds its id's lock from materialization until its
/// unit is attached (or abandoned); teardown takes it before removing files.
#[derive(Default)]
struct WorkspaceLocks {
    locks: std::sync::Mutex<HashMap<SandboxId, Arc<Mutex<()>>>>,
}

struct WorkspaceGuard<'a> {
    owner: &'a WorkspaceLocks,
    id: SandboxId,
    guard: Option<OwnedMutexGuard<()>>,
}

impl WorkspaceLocks {
    async fn acquire(&self, id: &SandboxId) -> WorkspaceGuard<'_> {
        let lock = Arc::clone(self.table().entry(id.clone()).or_default());
        WorkspaceGuard {
            owner: self,
            id: id.clone(),
            guard: Some(lock.lock_owned().await),
        }
    }

    fn table(&self) -> MutexGuard<'_, HashMap<SandboxId, Arc<Mutex<()>>>> {
        self.locks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.table().len()
    }
}

impl Drop for WorkspaceGuard<'_> {
    fn drop(&mut self) {
        self.guard.take();
        let mut table = self.owner.table();
        // nobody else holds or waits on the lock
        if table.get(&self.id).is_some_and(|lock| Arc::strong_count(lock) == 1) {
            table.remove(&self.id);
        }
    }
}

struct RegistryState {
    sandboxes: HashMap<SandboxId, Entry>,
    next_port: u32,
    next_generation: u64,
    shutting_down: bool,
}

struct Entry {
    record: SandboxRecord,
    logs: LogCollector,
    unit: Option<Arc<dyn SandboxUnit>>,
    timer: Option<JoinHandle<()>>,
    tasks: Vec<JoinHandle<()>>,
}

impl Entry {
    fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }

    fn view(&self) -> SandboxView {
        self.record.view(self.logs.latest_sample())
    }
}

/// Result of installing a unit into its claimed entry
enum Launch {
    Started(ExecuteResponse),
    /// The entry was stopped while the workspace was being written.
    /// `superseded` is set when a newer generation now owns the id.
    Gone { superseded: bool },
}

impl RegistryState {
    fn allocate_port(&mut self, range: &PortRange) -> SandboxResult<u16> {
        let port = u16::try_from(self.next_port)
            .ok()
            .filter(|port| *port <= range.end)
            .ok_or(SandboxError::PortsExhausted {
                start: range.start,
                end: range.end,
            })?;
        self.next_port += 1;
        Ok(port)
    }
}

impl SandboxService {
    /// Build the configured isolation strategy, check it can run here and
    /// create an empty registry.
    pub async fn init(config: EngineConfig) -> SandboxResult<Self> {
        let runtime = runtime::from_config(&config)?;
        runtime
            .preflight()
            .await
            .map_err(|e| SandboxError::RuntimeUnavailable(format!("{e:#}")))?;
        Ok(Self::with_runtime(config, runtime))
    }

    /// Create a registry around an explicit strategy
    pub fn with_runtime(config: EngineConfig, runtime: Arc<dyn Runtime>) -> Self {
        info!(
            runtime = runtime.name(),
            workspace_root = %config.workspace_root.display(),
            ports = %format!("{}..={}", config.ports.start, config.ports.end),
            "sandbox service ready"
        );
        let validator = SecurityValidator::new(config.validator.clone());
        let materializer = Materializer::new(&config.workspace_root, config.validator.bundle);
        let next_port = u32::from(config.ports.start);

        Self {
            inner: Arc::new(Registry {
                config,
                runtime,
                validator,
                materializer,
                workspaces: WorkspaceLocks::default(),
                state: Mutex::new(RegistryState {
                    sandboxes: HashMap::new(),
                    next_port,
                    next_generation: 0,
                    shutting_down: false,
                }),
            }),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Get the runtime name
    pub fn runtime_name(&self) -> &str {
        self.inner.runtime.name()
    }

    /// Validate, materialize and start a bundle.
    ///
    /// Returns as soon as the pipeline is launched; install, readiness and
    /// exit are observed through [`status`](Self::status) and
    /// [`logs`](Self::logs).
    #[instrument(skip(self, request), fields(sandbox_id = %id))]
    pub async fn execute(&self, id: &str, request: ExecuteRequest) -> SandboxResult<ExecuteResponse> {
        let inner = &self.inner;
        let id = SandboxId::parse(id)?;

        let files = match inner.validator.admit(request.files, &request.dependencies) {
            Ok(files) => files,
            Err(verdict) => {
                warn!(violations = verdict.violations.len(), "bundle rejected: {verdict}");
                return Err(SandboxError::Validation(verdict));
            }
        };

        let limits = inner.config.limits.default.merge(
            &request.resources.unwrap_or_default(),
            &inner.config.limits.ceiling,
        );
        let entry_point = inner.validator.entry_point(&files);

        let (generation, port, logs, replaced) = inner.claim(&id, request.redeploy, limits.clone()).await?;
        if let Some(previous) = replaced {
            info!(previous = previous.record.generation, "replacing previous sandbox");
            inner.teardown(previous, StopReason::Redeploy).await;
        }

        // held until the unit is attached or abandoned
        let _workspace = inner.workspaces.acquire(&id).await;

        let materializer = inner.materializer.clone();
        let target = id.clone();
        let materialized = tokio::task::spawn_blocking(move || materializer.materialize(&target, &files))
            .await
            .unwrap_or_else(|e| Err(MaterializeError::io(PathBuf::new(), std::io::Error::other(e))));
        let workspace = match materialized {
            Ok(workspace) => workspace,
            Err(e) => {
                warn!(error = %e, "materialization failed");
                inner.release(&id, generation).await;
                return Err(e.into());
            }
        };
        logs.attach_file(&workspace.join(LOG_FILE_NAME));

        let unit = inner.runtime.create(UnitSpec {
            id: id.clone(),
            workspace: workspace.clone(),
            port,
            entry: entry_point,
            limits,
            logs,
        });

        match inner.launch(&id, generation, Arc::clone(&unit), workspace).await {
            Launch::Started(response) => {
                info!(port, endpoint = %response.endpoint, "sandbox launched");
                Ok(response)
            }
            Launch::Gone { superseded } => {
                // the workspace belongs to the newer generation when superseded
                if !superseded {
                    unit.stop().await;
                }
                Err(SandboxError::NotFound(id.to_string()))
            }
        }
    }

    /// Write changed files into a live workspace without reinstalling or restarting
    #[instrument(skip(self, files), fields(sandbox_id = %id, files = files.len()))]
    pub async fn update(&self, id: &str, files: FileMap) -> SandboxResult<UpdateAck> {
        let inner = &self.inner;
        let not_found = || SandboxError::NotFound(id.to_string());
        let id = SandboxId::parse(id).map_err(|_| not_found())?;

        let _workspace = inner.workspaces.acquire(&id).await;
        let (workspace, logs) = {
            let state = inner.state.lock().await;
            let entry = state.sandboxes.get(&id).ok_or_else(not_found)?;
            let workspace = entry.record.workspace.clone().ok_or_else(not_found)?;
            (workspace, entry.logs.clone())
        };

        let verdict = inner.validator.validate_files(&files);
        if !verdict.passed() {
            warn!("update rejected: {verdict}");
            return Err(SandboxError::Validation(verdict));
        }

        let materializer = inner.materializer.clone();
        let files_written = tokio::task::spawn_blocking(move || materializer.rewrite(&workspace, &files))
            .await
            .unwrap_or_else(|e| Err(MaterializeError::io(PathBuf::new(), std::io::Error::other(e))))?;
        logs.system(format!("hot update applied ({files_written} files)"));

        let status = inner
            .state
            .lock()
            .await
            .sandboxes
            .get(&id)
            .map(|entry| entry.record.state)
            .ok_or_else(not_found)?;
        Ok(UpdateAck {
            status,
            files_written,
        })
    }

    /// Snapshot of one sandbox
    pub async fn status(&self, id: &str) -> Option<SandboxView> {
        let id = SandboxId::parse(id).ok()?;
        let state = self.inner.state.lock().await;
        state.sandboxes.get(&id).map(Entry::view)
    }

    /// Last `tail` log lines (default and ceiling from config)
    pub async fn logs(&self, id: &str, tail: Option<usize>) -> Option<String> {
        let config = &self.inner.config.logs;
        let tail = tail.unwrap_or(config.default_tail).min(config.max_tail);
        let id = SandboxId::parse(id).ok()?;
        let logs = self.inner.state.lock().await.sandboxes.get(&id)?.logs.clone();
        Some(logs.tail_text(tail))
    }

    /// Tear a sandbox down and forget it. Unknown ids are a no-op.
    #[instrument(skip(self), fields(sandbox_id = %id))]
    pub async fn stop(&self, id: &str) -> Option<TeardownReport> {
        let id = SandboxId::parse(id).ok()?;
        let entry = {
            let mut state = self.inner.state.lock().await;
            let mut entry = state.sandboxes.remove(&id)?;
            entry.cancel_timer();
            entry
        };
        Some(self.inner.teardown(entry, StopReason::Requested).await)
    }

    /// Reject further executes and tear every sandbox down concurrently
    pub async fn stop_all(&self) -> usize {
        let entries: Vec<Entry> = {
            let mut state = self.inner.state.lock().await;
            state.shutting_down = true;
            state
                .sandboxes
                .drain()
                .map(|(_, mut entry)| {
                    entry.cancel_timer();
                    entry
                })
                .collect()
        };

        let count = entries.len();
        info!(count, "stopping all sandboxes");
        join_all(
            entries
                .into_iter()
                .map(|entry| self.inner.teardown(entry, StopReason::Shutdown)),
        )
        .await;
        count
    }

    pub async fn shutdown(&self) {
        self.stop_all().await;
        info!("sandbox service shut down");
    }

    /// Views of every known sandbox, ordered by id
    pub async fn list(&self) -> Vec<SandboxView> {
        let state = self.inner.state.lock().await;
        let mut views: Vec<SandboxView> = state.sandboxes.values().map(Entry::view).collect();
        views.sort_by(|a, b| a.id.cmp(&b.id));
        views
    }

    pub async fn health(&self) -> HealthReport {
        let state = self.inner.state.lock().await;
        HealthReport {
            status: "healthy".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            isolation: self.inner.runtime.kind(),
            sandboxes: state.sandboxes.len(),
            running: state
                .sandboxes
                .values()
                .filter(|entry| entry.record.state == SandboxState::Running)
                .count(),
            shutting_down: state.shutting_down,
        }
    }
}

impl Registry {
    /// Reserve `id` before any I/O. Returns the replaced entry, if any, with
    /// its timer already cancelled.
    async fn claim(
        &self,
        id: &SandboxId,
        redeploy: bool,
        limits: ResourceLimits,
    ) -> SandboxResult<(u64, u16, LogCollector, Option<Entry>)> {
        let mut state = self.state.lock().await;
        if state.shutting_down {
            return Err(SandboxError::ShuttingDown);
        }
        if let Some(existing) = state.sandboxes.get(id) {
            if existing.record.state.is_live() && !redeploy {
                return Err(SandboxError::AlreadyExists(id.to_string()));
            }
        }

        let port = state.allocate_port(&self.config.ports)?;
        let mut previous = state.sandboxes.remove(id);
        if let Some(previous) = previous.as_mut() {
            previous.cancel_timer();
        }

        state.next_generation += 1;
        let generation = state.next_generation;
        let logs = LogCollector::new(self.config.logs.buffer_lines);
        let record = SandboxRecord::new(id.clone(), generation, self.runtime.kind(), limits, port);
        state.sandboxes.insert(
            id.clone(),
            Entry {
                record,
                logs: logs.clone(),
                unit: None,
                timer: None,
                tasks: Vec::new(),
            },
        );
        debug!(sandbox_id = %id, generation, port, "id claimed");
        Ok((generation, port, logs, previous))
    }

    /// Drop a claim that never got a unit
    async fn release(&self, id: &SandboxId, generation: u64) {
        let mut state = self.state.lock().await;
        if state
            .sandboxes
            .get(id)
            .is_some_and(|entry| entry.record.generation == generation)
        {
            state.sandboxes.remove(id);
        }
    }

    /// Attach the unit to its entry and spawn the pipeline, event, sampler
    /// and timeout tasks.
    async fn launch(
        self: &Arc<Self>,
        id: &SandboxId,
        generation: u64,
        unit: Arc<dyn SandboxUnit>,
        workspace: PathBuf,
    ) -> Launch {
        let mut state = self.state.lock().await;
        let superseded = state
            .sandboxes
            .get(id)
            .is_some_and(|entry| entry.record.generation != generation);
        let Some(entry) = state
            .sandboxes
            .get_mut(id)
            .filter(|entry| entry.record.generation == generation)
        else {
            return Launch::Gone { superseded };
        };

        entry.record.endpoint = unit.endpoint();
        entry.record.workspace = Some(workspace);
        entry.unit = Some(Arc::clone(&unit));

        let (events_tx, mut events_rx) = mpsc::channel(16);
        let pipeline = {
            let unit = Arc::clone(&unit);
            tokio::spawn(async move { unit.start(events_tx).await })
        };
        let events = {
            let registry = Arc::clone(self);
            let id = id.clone();
            tokio::spawn(async move {
                while let Some(event) = events_rx.recv().await {
                    registry.apply_event(&id, generation, event).await;
                }
            })
        };
        let sampler = tokio::spawn(Arc::clone(self).sample(
            id.clone(),
            generation,
            Arc::clone(&unit),
            entry.logs.clone(),
            entry.record.limits.memory_bytes,
        ));
        let timer = {
            let registry = Arc::clone(self);
            let id = id.clone();
            let deadline = entry.record.started + entry.record.limits.timeout;
            tokio::spawn(async move {
                tokio::time::sleep_until(deadline).await;
                registry.expire(&id, generation).await;
            })
        };

        entry.tasks = vec![pipeline, events, sampler];
        entry.timer = Some(timer);

        Launch::Started(ExecuteResponse {
            app_id: id.to_string(),
            endpoint: entry.record.endpoint.clone(),
            status: entry.record.state,
            logs: entry.logs.tail_text(self.config.logs.default_tail),
        })
    }

    async fn apply_event(&self, id: &SandboxId, generation: u64, event: UnitEvent) {
        let mut state = self.state.lock().await;
        let Some(entry) = state
            .sandboxes
            .get_mut(id)
            .filter(|entry| entry.record.generation == generation)
        else {
            debug!(sandbox_id = %id, generation, ?event, "event for a retired sandbox");
            return;
        };

        let before = entry.record.state;
        if entry.record.apply(&event) {
            let after = entry.record.state;
            info!(sandbox_id = %id, from = %before, to = %after, "sandbox state changed");
            match &entry.record.reason {
                Some(reason) if after.is_terminal() => {
                    entry.logs.system(format!("status: {after} ({reason})"))
                }
                _ => entry.logs.system(format!("status: {after}")),
            }
        }
    }

    /// Periodically sample resource usage; enforce the memory ceiling for
    /// the process strategy.
    async fn sample(
        self: Arc<Self>,
        id: SandboxId,
        generation: u64,
        unit: Arc<dyn SandboxUnit>,
        logs: LogCollector,
        memory_ceiling: u64,
    ) {
        let enforce_memory = self.runtime.kind() == IsolationKind::Process;
        let mut ticker = tokio::time::interval(self.config.logs.stats_interval);
        // the first tick completes immediately
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let Some(sample) = unit.stats().await else {
                continue;
            };
            let exceeded = enforce_memory && sample.memory_bytes > memory_ceiling;
            logs.record_sample(sample);

            if exceeded && self.mark_failed(&id, generation, "memory limit exceeded").await {
                warn!(sandbox_id = %id, limit = memory_ceiling, "memory limit exceeded; halting");
                logs.system("memory limit exceeded; halting application");
                unit.halt().await;
            }
        }
    }

    /// Record a failure reason ahead of the exit it will cause.
    /// Returns false when the sandbox is gone or already terminal.
    async fn mark_failed(&self, id: &SandboxId, generation: u64, reason: &str) -> bool {
        let mut state = self.state.lock().await;
        match state.sandboxes.get_mut(id) {
            Some(entry) if entry.record.generation == generation && entry.record.state.is_live() => {
                entry.record.reason = Some(reason.to_string());
                true
            }
            _ => false,
        }
    }

    async fn expire(&self, id: &SandboxId, generation: u64) {
        let entry = {
            let mut state = self.state.lock().await;
            match state.sandboxes.get(id) {
                Some(entry) if entry.record.generation == generation => state.sandboxes.remove(id),
                _ => None,
            }
        };

        if let Some(mut entry) = entry {
            // this task is the timer: release the handle without aborting it
            entry.timer.take();
            info!(sandbox_id = %id, timeout = ?entry.record.limits.timeout, "execution timeout reached");
            entry.logs.system("execution timeout reached");
            self.teardown(entry, StopReason::Timeout).await;
        }
    }

    async fn teardown(&self, mut entry: Entry, reason: StopReason) -> TeardownReport {
        let id = entry.record.id.clone();
        if reason != StopReason::Timeout {
            entry.cancel_timer();
        }
        info!(sandbox_id = %id, reason = %reason, generation = entry.record.generation, "tearing down sandbox");
        entry.logs.system(format!("stopping ({reason})"));
        let _workspace = self.workspaces.acquire(&id).await;

        let report = match &entry.unit {
            Some(unit) => unit.stop().await,
            None => {
                let mut report = TeardownReport::default();
                if let Some(workspace) = &entry.record.workspace {
                    entry.logs.detach_file();
                    report.record(&id, "remove workspace", Materializer::remove(workspace).await);
                }
                report
            }
        };

        for task in entry.tasks.drain(..) {
            task.abort();
        }
        report
    }
}
