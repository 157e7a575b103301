//! Container isolation through a docker-compatible CLI
//!
//! Each sandbox gets its own image (built from a generated descriptor in the
//! workspace) and one constrained container: no network by default, read-only
//! root filesystem, all capabilities dropped, non-root user.

use super::{
    pump_lines, substitute, MarkerWatch, Readiness, Runtime, SandboxUnit, TeardownReport,
    UnitEvent, UnitSpec,
};
use crate::config::{CommandConfig, ContainerConfig, EngineConfig, NetworkMode, ReadinessConfig};
use crate::execution::{IsolationKind, SandboxId};
use crate::logs::{LogLine, LogStream, ResourceSample};
use crate::probe::HealthProbe;
use crate::workspace::{Materializer, BUILD_DESCRIPTOR_NAME};
use crate::Result;
use anyhow::{bail, Context};
use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

const DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Container-based runtime
pub struct ContainerRuntime {
    commands: CommandConfig,
    container: ContainerConfig,
    readiness: ReadinessConfig,
    probe: HealthProbe,
}

impl ContainerRuntime {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            commands: config.commands.clone(),
            container: config.container.clone(),
            readiness: config.readiness.clone(),
            probe: HealthProbe::new(config.readiness.health_path.clone()),
        }
    }
}

#[async_trait]
impl Runtime for ContainerRuntime {
    fn name(&self) -> &str {
        "container"
    }

    fn kind(&self) -> IsolationKind {
        IsolationKind::Container
    }

    async fn preflight(&self) -> Result<()> {
        let version = cli_output(
            &self.container.binary,
            &["version", "--format", "{{.Server.Version}}"],
        )
        .await
        .with_context(|| format!("'{}' is not usable", self.container.binary))?;
        info!(binary = %self.container.binary, version = %version.trim(), "container engine available");
        Ok(())
    }

    fn create(&self, spec: UnitSpec) -> Arc<dyn SandboxUnit> {
        let name = container_name(&spec.id);
        Arc::new(ContainerUnit {
            image: image_tag(&spec.id),
            name,
            spec,
            commands: self.commands.clone(),
            config: self.container.clone(),
            readiness: self.readiness.clone(),
            probe: self.probe.clone(),
            cancel: CancellationToken::new(),
        })
    }
}

pub(crate) fn container_name(id: &SandboxId) -> String {
    format!("forge-sandbox-{id}")
}

/// Image tags must be lower-case, and ids differing only in case would
/// otherwise share (and remove) one image. The suffix is unique per unit.
pub(crate) fn image_tag(id: &SandboxId) -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{}-{}", container_name(id).to_lowercase(), &suffix[..12])
}

/// Generated build descriptor for one bundle
pub(crate) fn build_descriptor(
    config: &ContainerConfig,
    commands: &CommandConfig,
    entry: &str,
) -> Result<String> {
    let exec_form = |argv: &[String]| -> Result<String> {
        let argv: Vec<String> = argv
            .iter()
            .map(|arg| substitute(arg, entry, config.container_port))
            .collect();
        Ok(serde_json::to_string(&argv)?)
    };

    Ok(format!(
        "FROM {base}\n\
         WORKDIR /app\n\
         COPY --chown={user} . .\n\
         USER {user}\n\
         RUN {install}\n\
         ENV NODE_ENV=production HOST=0.0.0.0 PORT={port}\n\
         EXPOSE {port}\n\
         CMD {run}\n",
        base = config.base_image,
        user = config.user,
        install = exec_form(&commands.install)?,
        port = config.container_port,
        run = exec_form(&commands.run)?,
    ))
}

/// Arguments for `<cli> create`
pub(crate) fn create_args(spec: &UnitSpec, config: &ContainerConfig, name: &str, image: &str) -> Vec<String> {
    let limits = &spec.limits;
    let mut args = vec![
        "create".to_string(),
        format!("--name={name}"),
        format!("--label=forge.sandbox={}", spec.id),
        format!("--memory={}b", limits.memory_bytes),
        // equal to --memory: no swap on top of the ceiling
        format!("--memory-swap={}b", limits.memory_bytes),
        format!("--cpus={}", limits.cpus_arg()),
        format!("--pids-limit={}", limits.pids),
        format!("--network={}", config.network.as_str()),
    ];

    if config.network == NetworkMode::Bridge {
        args.push(format!(
            "--publish=127.0.0.1:{}:{}",
            spec.port, config.container_port
        ));
    }

    args.push("--read-only".into());
    args.push(format!("--tmpfs=/tmp:rw,noexec,nosuid,size={}", config.tmpfs_size));
    args.push("--cap-drop=ALL".into());
    args.extend(config.cap_add.iter().map(|cap| format!("--cap-add={cap}")));
    args.push("--security-opt=no-new-privileges:true".into());
    args.push(format!("--user={}", config.user));
    // the root filesystem is read-only, npm needs a writable home
    args.push("--env=HOME=/tmp".into());
    args.push(image.to_string());
    args
}

/// Run a CLI command to completion and return its stdout
async fn cli_output(binary: &str, args: &[&str]) -> Result<String> {
    let output = Command::new(binary)
        .args(args)
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output()
        .await
        .with_context(|| format!("failed to run {binary}"))?;

    if !output.status.success() {
        bail!(
            "{binary} {} failed ({}): {}",
            args.first().copied().unwrap_or_default(),
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// One line of `stats --no-stream --format "{{json .}}"`
#[derive(Debug, Clone, Deserialize)]
pub struct ContainerStats {
    #[serde(rename = "CPUPerc")]
    pub cpu_perc: String,
    #[serde(rename = "MemUsage")]
    pub mem_usage: String,
}

impl ContainerStats {
    pub fn parse(line: &str) -> Option<Self> {
        serde_json::from_str(line.trim()).ok()
    }

    /// `"12.34%"` → 12.34
    pub fn cpu_percent(&self) -> Option<f64> {
        self.cpu_perc.trim().trim_end_matches('%').parse().ok()
    }

    /// Used side of `"12.5MiB / 512MiB"`
    pub fn memory_bytes(&self) -> Option<u64> {
        let used = self.mem_usage.split('/').next()?;
        parse_size(used.trim())
    }
}

/// Parse sizes as printed by docker (`"1.5GiB"`, `"300kB"`, `"0B"`)
fn parse_size(raw: &str) -> Option<u64> {
    let split = raw
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(raw.len());
    let (number, unit) = raw.split_at(split);
    let number: f64 = number.parse().ok()?;
    let multiplier: f64 = match unit.trim() {
        "" | "B" => 1.0,
        "kB" | "KB" => 1e3,
        "MB" => 1e6,
        "GB" => 1e9,
        "KiB" => 1024.0,
        "MiB" => 1024.0 * 1024.0,
        "GiB" => 1024.0 * 1024.0 * 1024.0,
        _ => return None,
    };
    Some((number * multiplier) as u64)
}

enum Startup {
    Ready(Readiness),
    Exited(Option<i32>),
    Cancelled,
}

struct ContainerUnit {
    spec: UnitSpec,
    commands: CommandConfig,
    config: ContainerConfig,
    readiness: ReadinessConfig,
    probe: HealthProbe,
    cancel: CancellationToken,
    name: String,
    image: String,
}

impl ContainerUnit {
    fn cli(&self) -> Command {
        let mut cmd = Command::new(&self.config.binary);
        cmd.stdin(Stdio::null()).kill_on_drop(true);
        cmd
    }

    async fn output(&self, args: &[&str]) -> Result<String> {
        cli_output(&self.config.binary, args).await
    }

    async fn fail(&self, events: &mpsc::Sender<UnitEvent>, reason: String) {
        self.spec.logs.system(&reason);
        let _ = events.send(UnitEvent::Failed { reason }).await;
    }

    async fn is_running(&self) -> bool {
        self.output(&["inspect", "--format", "{{.State.Running}}", &self.name])
            .await
            .map(|out| out.trim() == "true")
            .unwrap_or(false)
    }

    /// Write the descriptor and build the image. Returns false on failure or stop.
    async fn build(&self, events: &mpsc::Sender<UnitEvent>) -> bool {
        let logs = &self.spec.logs;
        let descriptor_path = self.spec.workspace.join(BUILD_DESCRIPTOR_NAME);

        let written = match build_descriptor(&self.config, &self.commands, &self.spec.entry) {
            Ok(descriptor) => tokio::fs::write(&descriptor_path, descriptor)
                .await
                .context("cannot write build descriptor"),
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            self.fail(events, format!("image build failed: {e:#}")).await;
            return false;
        }

        logs.system("installing dependencies");
        logs.system(format!("building image {}", self.image));

        let mut build = self.cli();
        build
            .arg("build")
            .arg(format!("--tag={}", self.image))
            .arg("--file")
            .arg(&descriptor_path)
            .arg(&self.spec.workspace)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let mut child = match build.spawn() {
            Ok(child) => child,
            Err(e) => {
                self.fail(events, format!("image build failed: {e}")).await;
                return false;
            }
        };

        let mut pumps = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            pumps.push(pump_lines(stdout, LogStream::Stdout, logs.clone(), None));
        }
        if let Some(stderr) = child.stderr.take() {
            pumps.push(pump_lines(stderr, LogStream::Stderr, logs.clone(), None));
        }

        let status = tokio::select! {
            _ = self.cancel.cancelled() => return false,
            status = child.wait() => status,
        };
        for pump in pumps {
            let _ = tokio::time::timeout(DRAIN_TIMEOUT, pump).await;
        }

        match status {
            Ok(status) if status.success() => {
                logs.system("image built");
                let _ = events.send(UnitEvent::Installed).await;
                true
            }
            Ok(status) => {
                self.fail(events, format!("image build failed: {status}")).await;
                false
            }
            Err(e) => {
                self.fail(events, format!("image build failed: {e}")).await;
                false
            }
        }
    }

    async fn launch(&self, events: &mpsc::Sender<UnitEvent>) {
        let logs = &self.spec.logs;

        let args = create_args(&self.spec, &self.config, &self.name, &self.image);
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        if let Err(e) = self.output(&args).await {
            self.fail(events, format!("container create failed: {e:#}")).await;
            return;
        }
        if self.cancel.is_cancelled() {
            return;
        }
        if let Err(e) = self.output(&["start", &self.name]).await {
            self.fail(events, format!("container start failed: {e:#}")).await;
            return;
        }
        logs.system(format!("container {} started", self.name));

        let (watch, mut marker) = MarkerWatch::new(&self.readiness.markers);
        let mut follow = self.cli();
        follow
            .args(["logs", "--follow", self.name.as_str()])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let mut follower = follow.spawn().ok();
        let mut pumps = Vec::new();
        if let Some(child) = follower.as_mut() {
            if let Some(stdout) = child.stdout.take() {
                pumps.push(pump_lines(stdout, LogStream::Stdout, logs.clone(), Some(watch.clone())));
            }
            if let Some(stderr) = child.stderr.take() {
                pumps.push(pump_lines(stderr, LogStream::Stderr, logs.clone(), Some(watch)));
            }
        } else {
            logs.system("cannot follow container logs; relying on the liveness probe");
        }

        let wait_args = ["wait", self.name.as_str()];
        let waiter = self.output(&wait_args);
        tokio::pin!(waiter);
        let grace = tokio::time::sleep(self.readiness.grace_period);
        tokio::pin!(grace);
        let mut probe_tick = tokio::time::interval(self.readiness.probe_interval);
        let networked = self.config.network == NetworkMode::Bridge;
        let endpoint = self.endpoint();

        let mut marker_open = true;
        let mut grace_pending = true;
        let startup = loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break Startup::Cancelled,
                found = &mut marker, if marker_open => match found {
                    Ok(found) => break Startup::Ready(Readiness::Marker(found)),
                    Err(_) => marker_open = false,
                },
                _ = &mut grace, if grace_pending => {
                    grace_pending = false;
                    if self.is_running().await {
                        break Startup::Ready(Readiness::GracePeriod);
                    }
                }
                _ = probe_tick.tick(), if networked => {
                    if self.probe.check(&endpoint).await {
                        break Startup::Ready(Readiness::Probe);
                    }
                }
                exit = &mut waiter => break Startup::Exited(exit_code(exit)),
            }
        };

        let code = match startup {
            Startup::Cancelled => return,
            Startup::Exited(code) => code,
            Startup::Ready(readiness) => {
                match &readiness {
                    Readiness::Marker(found) => logs.system(format!("ready (matched '{found}')")),
                    Readiness::Probe => logs.system("ready (liveness probe answered)"),
                    Readiness::GracePeriod => {
                        logs.system("no ready marker seen; assuming ready after grace period")
                    }
                }
                info!(sandbox_id = %self.spec.id, endpoint = %endpoint, "container ready");
                let _ = events.send(UnitEvent::Ready(readiness)).await;

                tokio::select! {
                    _ = self.cancel.cancelled() => return,
                    exit = &mut waiter => exit_code(exit),
                }
            }
        };

        drop(follower);
        for pump in pumps {
            let _ = tokio::time::timeout(DRAIN_TIMEOUT, pump).await;
        }
        match code {
            Some(code) => logs.system(format!("container exited with code {code}")),
            None => logs.system("container exited"),
        }
        let _ = events.send(UnitEvent::Exited { code }).await;
    }
}

fn exit_code(waited: Result<String>) -> Option<i32> {
    match waited {
        Ok(out) => out.trim().parse().ok(),
        Err(e) => {
            debug!(error = %e, "wait failed");
            None
        }
    }
}

#[async_trait]
impl SandboxUnit for ContainerUnit {
    fn endpoint(&self) -> String {
        match self.config.network {
            NetworkMode::Bridge => format!("http://127.0.0.1:{}", self.spec.port),
            NetworkMode::None => format!("container://{}", self.name),
        }
    }

    async fn start(&self, events: mpsc::Sender<UnitEvent>) {
        if self.build(&events).await && !self.cancel.is_cancelled() {
            self.launch(&events).await;
        }
    }

    async fn halt(&self) {
        if let Err(e) = self.output(&["kill", &self.name]).await {
            debug!(sandbox_id = %self.spec.id, error = %e, "halt: container not running");
        }
    }

    async fn stop(&self) -> TeardownReport {
        let id = &self.spec.id;
        let mut report = TeardownReport::default();
        self.cancel.cancel();

        report.record(id, "kill container", self.output(&["kill", &self.name]).await.map(drop));
        report.record(
            id,
            "remove container",
            self.output(&["rm", "--force", &self.name]).await.map(drop),
        );
        report.record(
            id,
            "remove image",
            self.output(&["rmi", "--force", &self.image]).await.map(drop),
        );

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
        let out = self
            .output(&["stats", "--no-stream", "--format", "{{json .}}", &self.name])
            .await
            .ok()?;
        let stats = ContainerStats::parse(out.lines().next()?)?;
        Some(ResourceSample {
            at: Utc::now(),
            cpu_percent: stats.cpu_percent()?,
            memory_bytes: stats.memory_bytes()?,
        })
    }

    fn logs(&self, tail: usize) -> Vec<LogLine> {
        self.spec.logs.tail(tail)
    }
}
