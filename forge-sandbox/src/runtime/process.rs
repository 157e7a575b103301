//! Process-based isolation: install and run as host processes, each in its own
//! process group so the whole tree can be signalled at once

use super::{
    pump_lines, substitute, MarkerWatch, Readiness, Runtime, SandboxUnit, TeardownReport,
    UnitEvent, UnitSpec,
};
use crate::config::{CommandConfig, EngineConfig, ProcessConfig, ReadinessConfig};
use crate::execution::IsolationKind;
use crate::logs::{LogLine, LogStream, ResourceSample};
use crate::workspace::Materializer;
use crate::Result;
use anyhow::{bail, Context};
use async_trait::async_trait;
use chrono::Utc;
use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Linux reports RSS in pages and CPU time in clock ticks
const PAGE_SIZE: u64 = 4096;
const CLOCK_TICKS: f64 = 100.0;

/// Grace given to output pumps after the child exits
const DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Process-based runtime
pub struct ProcessRuntime {
    commands: CommandConfig,
    process: ProcessConfig,
    readiness: ReadinessConfig,
}

impl ProcessRuntime {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            commands: config.commands.clone(),
            process: config.process.clone(),
            readiness: config.readiness.clone(),
        }
    }
}

#[async_trait]
impl Runtime for ProcessRuntime {
    fn name(&self) -> &str {
        "process"
    }

    fn kind(&self) -> IsolationKind {
        IsolationKind::Process
    }

    async fn preflight(&self) -> Result<()> {
        if self.commands.install.is_empty() || self.commands.run.is_empty() {
            bail!("install and run commands must be configured");
        }
        Ok(())
    }

    fn create(&self, spec: UnitSpec) -> Arc<dyn SandboxUnit> {
        Arc::new(ProcessUnit {
            spec,
            commands: self.commands.clone(),
            process: self.process.clone(),
            readiness: self.readiness.clone(),
            cancel: CancellationToken::new(),
            group: Mutex::new(None),
            cpu: Mutex::new(None),
        })
    }
}

/// How the pipeline ended up while waiting for readiness
enum Startup {
    Ready(Readiness),
    Exited(std::io::Result<ExitStatus>),
    Cancelled,
}

struct ProcessUnit {
    spec: UnitSpec,
    commands: CommandConfig,
    process: ProcessConfig,
    readiness: ReadinessConfig,
    cancel: CancellationToken,
    /// Process group of the current child. Guarded so that `stop` can never
    /// miss a child spawned concurrently.
    group: Mutex<Option<Pid>>,
    /// Previous (cpu ticks, wall clock) reading for CPU percentages
    cpu: Mutex<Option<(u64, Instant)>>,
}

impl ProcessUnit {
    fn command(&self, argv: &[String]) -> Result<Command> {
        let (program, args) = argv.split_first().context("empty command")?;
        let spec = &self.spec;

        let mut cmd = Command::new(substitute(program, &spec.entry, spec.port));
        cmd.args(args.iter().map(|arg| substitute(arg, &spec.entry, spec.port)))
            .current_dir(&spec.workspace)
            .env_clear()
            .envs(
                self.commands
                    .env_passthrough
                    .iter()
                    .filter_map(|name| std::env::var_os(name).map(|value| (name.clone(), value))),
            )
            .env("PORT", spec.port.to_string())
            .env("HOST", "127.0.0.1")
            .env("NODE_ENV", "production")
            .env("HOME", &spec.workspace)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true);
        Ok(cmd)
    }

    /// Spawn a child in a fresh process group and remember the group.
    ///
    /// Returns `Ok(None)` when the unit was stopped before the spawn.
    fn spawn_tracked(&self, argv: &[String]) -> Result<Option<Child>> {
        let mut cmd = self.command(argv)?;
        let mut group = self.lock_group();
        if self.cancel.is_cancelled() {
            return Ok(None);
        }
        let child = cmd
            .spawn()
            .with_context(|| format!("failed to spawn '{}'", argv.join(" ")))?;
        *group = child.id().map(|pid| Pid::from_raw(pid as i32));
        Ok(Some(child))
    }

    fn lock_group(&self) -> std::sync::MutexGuard<'_, Option<Pid>> {
        self.group.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Kill whatever is left of the current group after its leader exited
    fn reap_group(&self) {
        if let Some(pgid) = self.lock_group().take() {
            let _ = killpg(pgid, Signal::SIGKILL);
        }
    }

    fn capture(&self, child: &mut Child, watch: Option<MarkerWatch>) -> Vec<JoinHandle<()>> {
        let logs = &self.spec.logs;
        let mut pumps = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            pumps.push(pump_lines(stdout, LogStream::Stdout, logs.clone(), watch.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            pumps.push(pump_lines(stderr, LogStream::Stderr, logs.clone(), watch));
        }
        pumps
    }

    async fn drain(pumps: Vec<JoinHandle<()>>) {
        for pump in pumps {
            if tokio::time::timeout(DRAIN_TIMEOUT, pump).await.is_err() {
                debug!("output pump still open after exit");
            }
        }
    }

    /// Run the install step. Returns false when the pipeline must not continue.
    async fn install(&self, events: &mpsc::Sender<UnitEvent>) -> bool {
        let logs = &self.spec.logs;
        logs.system("installing dependencies");

        let mut child = match self.spawn_tracked(&self.commands.install) {
            Ok(Some(child)) => child,
            Ok(None) => return false,
            Err(e) => {
                logs.system(format!("install failed: {e:#}"));
                let _ = events
                    .send(UnitEvent::Failed {
                        reason: format!("install failed: {e}"),
                    })
                    .await;
                return false;
            }
        };
        let pumps = self.capture(&mut child, None);

        let status = tokio::select! {
            status = child.wait() => status,
            _ = self.cancel.cancelled() => return false,
        };
        Self::drain(pumps).await;
        self.reap_group();

        match status {
            Ok(status) if status.success() => {
                logs.system("dependencies installed");
                let _ = events.send(UnitEvent::Installed).await;
                true
            }
            Ok(status) => {
                logs.system(format!("install failed: {status}"));
                let _ = events
                    .send(UnitEvent::Failed {
                        reason: format!("install failed: {status}"),
                    })
                    .await;
                false
            }
            Err(e) => {
                let _ = events
                    .send(UnitEvent::Failed {
                        reason: format!("install failed: {e}"),
                    })
                    .await;
                false
            }
        }
    }

    async fn run(&self, events: &mpsc::Sender<UnitEvent>) {
        let logs = &self.spec.logs;
        logs.system(format!("starting application on port {}", self.spec.port));

        let mut child = match self.spawn_tracked(&self.commands.run) {
            Ok(Some(child)) => child,
            Ok(None) => return,
            Err(e) => {
                logs.system(format!("start failed: {e:#}"));
                let _ = events
                    .send(UnitEvent::Failed {
                        reason: format!("start failed: {e}"),
                    })
                    .await;
                return;
            }
        };

        let (watch, mut marker) = MarkerWatch::new(&self.readiness.markers);
        let pumps = self.capture(&mut child, Some(watch));
        let grace = tokio::time::sleep(self.readiness.grace_period);
        tokio::pin!(grace);

        let mut marker_open = true;
        let mut grace_pending = true;
        let startup = loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break Startup::Cancelled,
                found = &mut marker, if marker_open => match found {
                    Ok(found) => break Startup::Ready(Readiness::Marker(found)),
                    // output closed without a marker
                    Err(_) => marker_open = false,
                },
                _ = &mut grace, if grace_pending => {
                    grace_pending = false;
                    // an exit between the timer and this check is reported by wait()
                    if let Ok(None) = child.try_wait() {
                        break Startup::Ready(Readiness::GracePeriod);
                    }
                }
                status = child.wait() => break Startup::Exited(status),
            }
        };

        let status = match startup {
            Startup::Cancelled => return,
            Startup::Exited(status) => status,
            Startup::Ready(readiness) => {
                match &readiness {
                    Readiness::Marker(found) => logs.system(format!("ready (matched '{found}')")),
                    _ => logs.system("no ready marker seen; assuming ready after grace period"),
                }
                info!(sandbox_id = %self.spec.id, port = self.spec.port, "application ready");
                let _ = events.send(UnitEvent::Ready(readiness)).await;

                tokio::select! {
                    _ = self.cancel.cancelled() => return,
                    status = child.wait() => status,
                }
            }
        };

        Self::drain(pumps).await;
        self.reap_group();

        let code = match status {
            Ok(status) => {
                logs.system(format!("application exited: {status}"));
                status.code()
            }
            Err(e) => {
                logs.system(format!("lost track of application: {e}"));
                None
            }
        };
        let _ = events.send(UnitEvent::Exited { code }).await;
    }

    /// SIGTERM the group, wait up to the kill grace, then SIGKILL
    async fn terminate_group(&self) -> Result<()> {
        let Some(pgid) = self.lock_group().take() else {
            return Ok(());
        };

        match killpg(pgid, Signal::SIGTERM) {
            Err(Errno::ESRCH) => return Ok(()),
            other => other.context("SIGTERM failed")?,
        }

        let deadline = tokio::time::Instant::now() + self.process.kill_grace;
        while tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
            if let Err(Errno::ESRCH) = killpg(pgid, None::<Signal>) {
                return Ok(());
            }
        }

        warn!(sandbox_id = %self.spec.id, "process group ignored SIGTERM; sending SIGKILL");
        match killpg(pgid, Signal::SIGKILL) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(e) => Err(e).context("SIGKILL failed"),
        }
    }
}

#[async_trait]
impl SandboxUnit for ProcessUnit {
    fn endpoint(&self) -> String {
        format!("http://127.0.0.1:{}", self.spec.port)
    }

    async fn start(&self, events: mpsc::Sender<UnitEvent>) {
        if self.install(&events).await && !self.cancel.is_cancelled() {
            self.run(&events).await;
        }
    }

    async fn halt(&self) {
        let pgid = *self.lock_group();
        if let Some(pgid) = pgid {
            if let Err(e) = killpg(pgid, Signal::SIGKILL) {
                debug!(sandbox_id = %self.spec.id, error = %e, "halt: group already gone");
            }
        }
    }

    async fn stop(&self) -> TeardownReport {
        let id = &self.spec.id;
        let mut report = TeardownReport::default();

        // taking the group lock after cancelling closes the spawn race
        self.cancel.cancel();
        report.record(id, "terminate process group", self.terminate_group().await);

        self.spec.logs.system("stopped");
        self.spec.logs.detach_file();
        report.record(
            id,
            "remove workspace",
            Materializer::remove(&self.spec.workspace).await,
        );
        report
    }

    async fn stats(&self) -> Option<ResourceSample> {
        let pgid = (*self.lock_group())?;
        let (ticks, rss_pages) = tokio::task::spawn_blocking(move || group_usage(pgid))
            .await
            .ok()??;

        let now = Instant::now();
        let mut previous = self.cpu.lock().unwrap_or_else(|p| p.into_inner());
        let cpu_percent = match *previous {
            Some((last_ticks, last_at)) if ticks >= last_ticks => {
                let elapsed = now.duration_since(last_at).as_secs_f64();
                if elapsed > 0.0 {
                    (ticks - last_ticks) as f64 / CLOCK_TICKS / elapsed * 100.0
                } else {
                    0.0
                }
            }
            _ => 0.0,
        };
        *previous = Some((ticks, now));

        Some(ResourceSample {
            at: Utc::now(),
            cpu_percent,
            memory_bytes: rss_pages * PAGE_SIZE,
        })
    }

    fn logs(&self, tail: usize) -> Vec<LogLine> {
        self.spec.logs.tail(tail)
    }
}

/// Sum CPU ticks and RSS pages over every process in `pgid`
#[cfg(target_os = "linux")]
fn group_usage(pgid: Pid) -> Option<(u64, u64)> {
    let mut ticks = 0;
    let mut rss = 0;
    let mut found = false;

    for entry in std::fs::read_dir("/proc").ok()?.flatten() {
        let name = entry.file_name();
        if !name.to_string_lossy().bytes().all(|b| b.is_ascii_digit()) {
            continue;
        }
        let Ok(stat) = std::fs::read_to_string(entry.path().join("stat")) else {
            continue;
        };
        if let Some(sample) = parse_stat(&stat).filter(|s| s.pgrp == pgid.as_raw()) {
            ticks += sample.utime + sample.stime;
            rss += sample.rss_pages;
            found = true;
        }
    }

    found.then_some((ticks, rss))
}

#[cfg(not(target_os = "linux"))]
fn group_usage(_pgid: Pid) -> Option<(u64, u64)> {
    None
}

#[derive(Debug, PartialEq, Eq)]
struct StatSample {
    pgrp: i32,
    utime: u64,
    stime: u64,
    rss_pages: u64,
}

/// Parse the fields we need from `/proc/<pid>/stat`
fn parse_stat(stat: &str) -> Option<StatSample> {
    // the command name may contain spaces and parentheses
    let rest = &stat[stat.rfind(')')? + 1..];
    let fields: Vec<&str> = rest.split_whitespace().collect();
    // fields[0] is field 3 (state) of proc(5)
    Some(StatSample {
        pgrp: fields.get(2)?.parse().ok()?,
        utime: fields.get(11)?.parse().ok()?,
        stime: fields.get(12)?.parse().ok()?,
        rss_pages: fields.get(21)?.parse().ok()?,
    })
}
