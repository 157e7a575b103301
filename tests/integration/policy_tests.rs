//! Rejections that must leave no trace on disk

use crate::common::{sh_bundle, TestEngine, MANIFEST, SERVES};
use forge_sandbox::{
    MaterializeError, ResourceConfig, Rule, SandboxError, SandboxState, MIN_CPU, MIN_MEMORY_BYTES,
};
use std::time::Duration;

#[tokio::test]
async fn test_denylisted_dependency_rejected() {
    let engine = TestEngine::start(|_| {}).await;
    let request = sh_bundle("ready").with_dependency("child-process-lib", "*");

    let err = engine.service.execute("app-1", request).await.unwrap_err();
    let verdict = match err {
        SandboxError::Validation(verdict) => verdict,
        other => panic!("expected a validation error, got {other}"),
    };
    assert!(verdict.mentions("child-process-lib"));
    assert!(verdict.to_string().contains("child-process-lib"));
    assert!(!engine.workspace_exists("app-1"));
    assert!(engine.service.status("app-1").await.is_none());
}

#[tokio::test]
async fn test_manifest_dependency_rejected() {
    let engine = TestEngine::start(|_| {}).await;
    let mut request = sh_bundle(SERVES);
    request.files.insert(
        MANIFEST.into(),
        r#"{"dependencies":{"shelljs":"^0.8.5"},"optionalDependencies":{"child-process-lib":"1.0.0"}}"#.into(),
    );

    let verdict = match engine.service.execute("app-1", request).await.unwrap_err() {
        SandboxError::Validation(verdict) => verdict,
        other => panic!("expected a validation error, got {other}"),
    };
    assert!(verdict.mentions("shelljs"));
    assert!(verdict.mentions("child-process-lib"));
    assert!(!engine.workspace_exists("app-1"));
}

#[tokio::test]
async fn test_declared_dependencies_reach_install_manifest() {
    let engine = TestEngine::start(|_| {}).await;
    let request = sh_bundle(SERVES).with_dependency("express", "^4.18.2");

    engine.service.execute("app-1", request).await.unwrap();
    let manifest = std::fs::read_to_string(engine.root.path().join("app-1").join(MANIFEST)).unwrap();
    assert!(manifest.contains(r#""express": "^4.18.2""#), "{manifest}");
    engine.service.shutdown().await;
}

#[tokio::test]
async fn test_tiny_resource_overrides_are_floored() {
    let engine = TestEngine::start(|_| {}).await;
    let request = sh_bundle(SERVES).with_resources(ResourceConfig {
        memory_mb: Some(0),
        cpu: Some(0.001),
        timeout_secs: None,
    });

    engine.service.execute("app-1", request).await.unwrap();
    let view = engine.service.status("app-1").await.unwrap();
    assert_eq!(view.limits.memory_bytes, MIN_MEMORY_BYTES);
    assert_eq!(view.limits.cpu, MIN_CPU);
    engine.service.shutdown().await;
}

#[tokio::test]
async fn test_well_formed_dependencies_pass() {
    let engine = TestEngine::start(|_| {}).await;
    let request = sh_bundle(SERVES)
        .with_dependency("express", "^4.18.2")
        .with_dependency("@types/node", "~20.1.0");

    engine.service.execute("app-1", request).await.unwrap();
    engine
        .wait_for("app-1", SandboxState::Running, Duration::from_secs(10))
        .await;
    engine.service.shutdown().await;
}

#[tokio::test]
async fn test_every_violation_reported() {
    let engine = TestEngine::start(|_| {}).await;
    let mut request = sh_bundle(SERVES)
        .with_dependency("shelljs", "0.8.5")
        .with_dependency("execa", "latest || rm -rf /");
    request
        .files
        .insert("lib/run.js".into(), "eval(payload)".into());

    let SandboxError::Validation(verdict) = engine.service.execute("app-1", request).await.unwrap_err()
    else {
        panic!("expected a validation error");
    };
    assert!(verdict.mentions("shelljs"));
    assert!(verdict.mentions("execa"));
    assert!(verdict.mentions("lib/run.js"));
    assert!(verdict
        .violations
        .iter()
        .any(|v| v.rule == Rule::Content && v.detail.contains("eval")));
}

#[tokio::test]
async fn test_traversal_paths_leave_tree_unchanged() {
    let engine = TestEngine::start(|_| {}).await;
    let before = list_tree(engine.root.path());

    for path in ["../escape.js", "/etc/passwd", "a/../../b.js"] {
        let mut request = sh_bundle(SERVES);
        request.files.insert(path.into(), "x".into());
        let err = engine.service.execute("app-1", request).await.unwrap_err();
        assert!(
            matches!(
                err,
                SandboxError::Validation(_)
                    | SandboxError::Materialize(MaterializeError::PathViolation { .. })
            ),
            "{path}: {err}"
        );
    }

    assert_eq!(list_tree(engine.root.path()), before);
    assert!(!engine.root.path().parent().unwrap().join("escape.js").exists());
}

#[tokio::test]
async fn test_missing_manifest_rejected() {
    let engine = TestEngine::start(|_| {}).await;
    let mut request = sh_bundle(SERVES);
    request.files.remove(MANIFEST);

    let SandboxError::Validation(verdict) = engine.service.execute("app-1", request).await.unwrap_err()
    else {
        panic!("expected a validation error");
    };
    assert!(verdict.mentions(MANIFEST));
}

#[tokio::test]
async fn test_oversized_bundle_rejected() {
    let engine = TestEngine::start(|config| {
        config.validator.bundle.max_file_bytes = 16;
    })
    .await;
    let request = sh_bundle(&"echo padding\n".repeat(4));

    let err = engine.service.execute("app-1", request).await.unwrap_err();
    let verdict = match err {
        SandboxError::Validation(verdict) => verdict,
        other => panic!("expected a validation error, got {other}"),
    };
    assert!(verdict.violations.iter().any(|v| v.rule == Rule::Size));
    assert!(!engine.workspace_exists("app-1"));
}

fn list_tree(root: &std::path::Path) -> Vec<std::path::PathBuf> {
    let mut paths = Vec::new();
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        let Ok(entries) = std::fs::read_dir(&dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                pending.push(path.clone());
            }
            paths.push(path);
        }
    }
    paths.sort();
    paths
}
