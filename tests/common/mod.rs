//! Common test utilities shared across integration and E2E tests

use forge_sandbox::{
    EngineConfig, ExecuteRequest, FileMap, SandboxService, SandboxState, SandboxView,
};
use std::time::Duration;
use tempfile::TempDir;

/// Manifest and entry file names used by the `sh` test configuration
pub const MANIFEST: &str = "manifest";
pub const ENTRY: &str = "entry";

/// Setup logging for tests
pub fn setup_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("debug")
        .with_test_writer()
        .try_init();
}

/// Engine configuration that installs with `echo` and runs the entry file with `sh`
pub fn sh_config(root: &TempDir) -> EngineConfig {
    let mut config = EngineConfig {
        workspace_root: root.path().to_path_buf(),
        ..Default::default()
    };
    config.commands.install = argv(&["sh", "-c", "echo installing packages"]);
    config.commands.run = argv(&["sh", "{entry}"]);
    config.validator.manifest_file = MANIFEST.into();
    config.validator.entry_file = ENTRY.into();
    config.readiness.grace_period = Duration::from_secs(10);
    config.limits.default.timeout = Duration::from_secs(60);
    config.process.kill_grace = Duration::from_millis(500);
    config
}

pub fn argv(args: &[&str]) -> Vec<String> {
    args.iter().map(|arg| arg.to_string()).collect()
}

/// A registry over a private workspace root
pub struct TestEngine {
    pub service: SandboxService,
    pub root: TempDir,
}

impl TestEngine {
    pub async fn start(tweak: impl FnOnce(&mut EngineConfig)) -> Self {
        setup_test_logging();
        let root = TempDir::new().expect("Failed to create temp dir");
        let mut config = sh_config(&root);
        tweak(&mut config);
        let service = SandboxService::init(config)
            .await
            .expect("Failed to start sandbox service");
        Self { service, root }
    }

    pub fn workspace_exists(&self, id: &str) -> bool {
        self.root.path().join(id).exists()
    }

    /// Poll until the sandbox reaches `wanted` or `within` elapses
    pub async fn wait_for(&self, id: &str, wanted: SandboxState, within: Duration) -> SandboxView {
        let deadline = tokio::time::Instant::now() + within;
        loop {
            let view = self.service.status(id).await;
            match view {
                Some(view) if view.status == wanted => return view,
                _ if tokio::time::Instant::now() >= deadline => {
                    let logs = self.service.logs(id, None).await.unwrap_or_default();
                    panic!("{id} never reached {wanted}: {view:?}\n{logs}");
                }
                _ => tokio::time::sleep(Duration::from_millis(25)).await,
            }
        }
    }

    /// Poll until the sandbox is forgotten by the registry
    pub async fn wait_gone(&self, id: &str, within: Duration) {
        let deadline = tokio::time::Instant::now() + within;
        while self.service.status(id).await.is_some() {
            assert!(tokio::time::Instant::now() < deadline, "{id} was never torn down");
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }
}

/// A bundle whose entry file is the given shell script
pub fn sh_bundle(script: &str) -> ExecuteRequest {
    let files: FileMap = [
        (MANIFEST.to_string(), "{}".to_string()),
        (ENTRY.to_string(), script.to_string()),
    ]
    .into_iter()
    .collect();
    ExecuteRequest::new(files)
}

/// Entry script that announces readiness and stays up
pub const SERVES: &str = "echo server ready\nexec sleep 30\n";
