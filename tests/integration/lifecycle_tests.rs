//! Registry lifecycle with the process strategy

use crate::common::{argv, sh_bundle, TestEngine, ENTRY, SERVES};
use forge_sandbox::{FileMap, SandboxError, SandboxState};
use std::time::Duration;

const SETTLE: Duration = Duration::from_secs(10);

#[tokio::test]
async fn test_execute_until_running_then_stop() {
    let engine = TestEngine::start(|_| {}).await;

    let response = engine.service.execute("app-2", sh_bundle(SERVES)).await.unwrap();
    assert_eq!(response.app_id, "app-2");

    let view = engine.wait_for("app-2", SandboxState::Running, SETTLE).await;
    assert_eq!(view.id, "app-2");
    assert!(!view.endpoint.is_empty());
    assert!(view.ready_at.is_some());

    let logs = engine.service.logs("app-2", None).await.unwrap();
    assert!(logs.contains("installing packages"));
    assert!(logs.contains("server ready"));

    let report = engine.service.stop("app-2").await.unwrap();
    assert!(report.is_clean(), "{report:?}");
    assert!(engine.service.status("app-2").await.is_none());
    assert!(!engine.workspace_exists("app-2"));
}

#[tokio::test]
async fn test_stop_twice_is_harmless() {
    let engine = TestEngine::start(|_| {}).await;
    engine.service.execute("app-1", sh_bundle(SERVES)).await.unwrap();
    engine.wait_for("app-1", SandboxState::Running, SETTLE).await;

    assert!(engine.service.stop("app-1").await.is_some());
    assert!(engine.service.stop("app-1").await.is_none());
    assert!(engine.service.status("app-1").await.is_none());
    assert!(engine.service.list().await.is_empty());
}

#[tokio::test]
async fn test_update_does_not_reinstall() {
    let engine = TestEngine::start(|_| {}).await;
    engine.service.execute("app-1", sh_bundle(SERVES)).await.unwrap();
    engine.wait_for("app-1", SandboxState::Running, SETTLE).await;

    let files: FileMap = [("public/index.html".to_string(), "<p>v2</p>".to_string())]
        .into_iter()
        .collect();
    let ack = engine.service.update("app-1", files).await.unwrap();
    assert_eq!(ack.status, SandboxState::Running);
    assert_eq!(ack.files_written, 1);

    let logs = engine.service.logs("app-1", None).await.unwrap();
    assert_eq!(logs.matches("installing dependencies").count(), 1);
    assert_eq!(logs.matches("installing packages").count(), 1);
    assert_eq!(
        std::fs::read_to_string(engine.root.path().join("app-1/public/index.html")).unwrap(),
        "<p>v2</p>"
    );

    engine.service.shutdown().await;
}

#[tokio::test]
async fn test_update_missing_id() {
    let engine = TestEngine::start(|_| {}).await;
    let files: FileMap = [(ENTRY.to_string(), "echo hi".to_string())].into_iter().collect();

    let err = engine.service.update("missing-id", files).await.unwrap_err();
    assert!(matches!(err, SandboxError::NotFound(_)));
    assert!(!engine.workspace_exists("missing-id"));
    assert!(engine.service.health().await.status == "healthy");
}

#[tokio::test]
async fn test_clean_exit_before_ready_is_stopped() {
    let engine = TestEngine::start(|_| {}).await;
    engine.service.execute("app-1", sh_bundle("echo bye\n")).await.unwrap();

    let view = engine.wait_for("app-1", SandboxState::Stopped, SETTLE).await;
    assert_eq!(view.exit_code, Some(0));
    assert!(view.ready_at.is_none());
    // terminal sandboxes stay inspectable until stopped
    assert!(engine.service.logs("app-1", None).await.unwrap().contains("bye"));
    engine.service.stop("app-1").await;
}

#[tokio::test]
async fn test_nonzero_exit_is_error() {
    let engine = TestEngine::start(|_| {}).await;
    engine
        .service
        .execute("app-1", sh_bundle("echo crashing >&2\nexit 7\n"))
        .await
        .unwrap();

    let view = engine.wait_for("app-1", SandboxState::Error, SETTLE).await;
    assert_eq!(view.exit_code, Some(7));
    let logs = engine.service.logs("app-1", None).await.unwrap();
    assert!(logs.contains("crashing"));
    engine.service.stop("app-1").await;
}

#[tokio::test]
async fn test_install_failure_never_runs_app() {
    let engine = TestEngine::start(|config| {
        config.commands.install = argv(&["sh", "-c", "echo registry unreachable >&2; exit 3"]);
    })
    .await;
    engine
        .service
        .execute("app-1", sh_bundle("echo RUN-OUTPUT\nexec sleep 30\n"))
        .await
        .unwrap();

    let view = engine.wait_for("app-1", SandboxState::Error, SETTLE).await;
    assert!(view.reason.unwrap().contains("install failed"));

    let logs = engine.service.logs("app-1", None).await.unwrap();
    assert!(logs.contains("registry unreachable"));
    assert!(!logs.contains("RUN-OUTPUT"));
    engine.service.stop("app-1").await;
}

#[tokio::test]
async fn test_timeout_not_before_deadline() {
    let timeout = Duration::from_secs(1);
    let engine = TestEngine::start(|config| {
        config.limits.default.timeout = timeout;
    })
    .await;
    let started = tokio::time::Instant::now();
    // no marker, grace period longer than the timeout
    engine
        .service
        .execute("app-1", sh_bundle("exec sleep 30\n"))
        .await
        .unwrap();

    tokio::time::sleep(timeout / 2).await;
    let view = engine.service.status("app-1").await.unwrap();
    assert_eq!(view.status, SandboxState::Starting);

    engine.wait_gone("app-1", SETTLE).await;
    assert!(started.elapsed() >= timeout);
    assert!(!engine.workspace_exists("app-1"));
}

#[tokio::test]
async fn test_grace_period_marks_ready() {
    let engine = TestEngine::start(|config| {
        config.readiness.grace_period = Duration::from_millis(300);
    })
    .await;
    engine
        .service
        .execute("quiet", sh_bundle("exec sleep 30\n"))
        .await
        .unwrap();

    let view = engine.wait_for("quiet", SandboxState::Running, SETTLE).await;
    assert!(view.ready_at.is_some());
    let logs = engine.service.logs("quiet", None).await.unwrap();
    assert!(logs.contains("grace period"));
    engine.service.stop("quiet").await;
}

#[tokio::test]
async fn test_live_id_conflict_and_redeploy() {
    let engine = TestEngine::start(|_| {}).await;
    let first = engine.service.execute("app-1", sh_bundle(SERVES)).await.unwrap();
    engine.wait_for("app-1", SandboxState::Running, SETTLE).await;

    let err = engine.service.execute("app-1", sh_bundle(SERVES)).await.unwrap_err();
    assert!(matches!(err, SandboxError::AlreadyExists(_)));

    let second = engine
        .service
        .execute("app-1", sh_bundle(SERVES).redeploy())
        .await
        .unwrap();
    assert_ne!(first.endpoint, second.endpoint);
    engine.wait_for("app-1", SandboxState::Running, SETTLE).await;
    assert_eq!(engine.service.list().await.len(), 1);

    engine.service.shutdown().await;
    assert!(!engine.workspace_exists("app-1"));
}

#[tokio::test]
async fn test_stop_all_then_reject() {
    let engine = TestEngine::start(|_| {}).await;
    for id in ["a", "b", "c"] {
        engine.service.execute(id, sh_bundle(SERVES)).await.unwrap();
    }
    for id in ["a", "b", "c"] {
        engine.wait_for(id, SandboxState::Running, SETTLE).await;
    }

    assert_eq!(engine.service.stop_all().await, 3);
    for id in ["a", "b", "c"] {
        assert!(!engine.workspace_exists(id));
    }

    let err = engine.service.execute("d", sh_bundle(SERVES)).await.unwrap_err();
    assert!(matches!(err, SandboxError::ShuttingDown));
}

#[tokio::test]
async fn test_process_group_is_killed_on_stop() {
    let engine = TestEngine::start(|_| {}).await;
    // a background grandchild must not outlive the sandbox
    let script = "sleep 30 &\necho $! > child.pid\necho ready\nwait\n";
    engine.service.execute("app-1", sh_bundle(script)).await.unwrap();
    engine.wait_for("app-1", SandboxState::Running, SETTLE).await;

    let pid_file = engine.root.path().join("app-1/child.pid");
    let pid: u32 = std::fs::read_to_string(&pid_file).unwrap().trim().parse().unwrap();
    engine.service.stop("app-1").await;

    let stat = format!("/proc/{pid}/stat");
    for _ in 0..40 {
        // gone, or a zombie waiting for its new parent to reap it
        match std::fs::read_to_string(&stat) {
            Err(_) => return,
            Ok(line) if line.rsplit_once(')').is_some_and(|(_, rest)| rest.trim_start().starts_with('Z')) => return,
            Ok(_) => {}
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("grandchild {pid} survived teardown");
}
