//! Container strategy against a real engine.
//!
//! Skipped unless `FORGE_CONTAINER_TEST=1`; needs a docker-compatible CLI
//! and network access to pull the base image.

use crate::common::{argv, sh_bundle, TestEngine};
use forge_sandbox::{IsolationKind, NetworkMode, SandboxState};
use std::time::Duration;

const SETTLE: Duration = Duration::from_secs(180);

fn enabled() -> bool {
    std::env::var("FORGE_CONTAINER_TEST").is_ok_and(|value| value == "1")
}

async fn container_engine(network: NetworkMode) -> TestEngine {
    TestEngine::start(|config| {
        config.isolation = IsolationKind::Container;
        config.container.base_image = "busybox:1.36".into();
        config.container.network = network;
        config.commands.install = argv(&["sh", "-c", "echo installing packages"]);
        config.commands.run = argv(&["sh", "{entry}"]);
        config.limits.default.timeout = Duration::from_secs(300);
    })
    .await
}

#[tokio::test]
async fn test_container_lifecycle() {
    if !enabled() {
        return;
    }
    let engine = container_engine(NetworkMode::None).await;

    let response = engine
        .service
        .execute("box-1", sh_bundle("echo server ready\nexec sleep 300\n"))
        .await
        .unwrap();
    assert!(response.endpoint.starts_with("container://"));

    let view = engine.wait_for("box-1", SandboxState::Running, SETTLE).await;
    assert_eq!(view.isolation, IsolationKind::Container);
    let logs = engine.service.logs("box-1", None).await.unwrap();
    assert!(logs.contains("building image"));
    assert!(logs.contains("server ready"));

    let report = engine.service.stop("box-1").await.unwrap();
    assert!(report.steps.iter().any(|step| step.name == "remove container"));
    assert!(!engine.workspace_exists("box-1"));
}

#[tokio::test]
async fn test_container_nonzero_exit() {
    if !enabled() {
        return;
    }
    let engine = container_engine(NetworkMode::None).await;
    engine
        .service
        .execute("box-2", sh_bundle("exit 4\n"))
        .await
        .unwrap();

    let view = engine.wait_for("box-2", SandboxState::Error, SETTLE).await;
    assert_eq!(view.exit_code, Some(4));
    engine.service.shutdown().await;
}

#[tokio::test]
async fn test_bridged_container_answers_probe() {
    if !enabled() {
        return;
    }
    let engine = container_engine(NetworkMode::Bridge).await;
    let script = "echo listening\nexec httpd -f -p 3000 -h /tmp\n";
    let response = engine.service.execute("box-3", sh_bundle(script)).await.unwrap();
    engine.wait_for("box-3", SandboxState::Running, SETTLE).await;

    let mut answered = false;
    for _ in 0..40 {
        if let Ok(reply) = reqwest::get(&response.endpoint).await {
            answered = !reply.status().is_server_error();
            break;
        }
        tokio::time::sleep(Duration::from_millis(250)).await;
    }
    assert!(answered, "{} never answered", response.endpoint);
    engine.service.shutdown().await;
}
