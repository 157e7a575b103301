//! CLI command implementations
//!
//! `validate` and `run` work on a bundle directory: every regular file below
//! it becomes part of the bundle. Dependencies are whatever the manifest
//! declares; the validator reads them from there.

use anyhow::{bail, Context, Result};
use forge_sandbox::{
    DependencyMap, EngineConfig, ExecuteRequest, FileMap, IsolationKind, SandboxService,
    SandboxState, SandboxView, SecurityValidator, LOG_FILE_NAME,
};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

/// Directories never read into a bundle
const SKIPPED_DIRS: &[&str] = &["node_modules", ".git"];

/// Load `--config` or fall back to defaults
pub fn load_config(path: Option<&Path>) -> Result<EngineConfig> {
    match path {
        Some(path) => EngineConfig::load(path),
        None => Ok(EngineConfig::default()),
    }
}

/// Read a bundle directory
pub fn load_bundle(dir: &Path) -> Result<FileMap> {
    if !dir.is_dir() {
        bail!("{} is not a directory", dir.display());
    }

    let mut files = FileMap::new();
    collect_files(dir, dir, &mut files)?;
    debug!("Loaded {} files from {}", files.len(), dir.display());
    Ok(files)
}

fn collect_files(root: &Path, dir: &Path, files: &mut FileMap) -> Result<()> {
    let entries =
        std::fs::read_dir(dir).with_context(|| format!("Failed to read {}", dir.display()))?;
    for entry in entries {
        let entry = entry?;
        let path = entry.path();
        let file_type = entry.file_type()?;
        let name = entry.file_name();

        if file_type.is_dir() {
            if SKIPPED_DIRS.iter().any(|skip| name == *skip) {
                continue;
            }
            collect_files(root, &path, files)?;
        } else if file_type.is_file() {
            if name == LOG_FILE_NAME {
                continue;
            }
            let relative = relative_key(root, &path)?;
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("{} is not a UTF-8 text file", path.display()))?;
            files.insert(relative, content);
        }
    }
    Ok(())
}

/// Bundle key for `path`: relative to `root`, `/`-separated
fn relative_key(root: &Path, path: &Path) -> Result<String> {
    let relative = path.strip_prefix(root)?;
    let parts: Vec<String> = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    Ok(parts.join("/"))
}

/// Check a bundle directory and print every violation
pub fn execute_validate(dir: PathBuf, config: Option<PathBuf>) -> Result<()> {
    let config = load_config(config.as_deref())?;
    let files = load_bundle(&dir)?;
    let validator = SecurityValidator::new(config.validator.clone());

    let none = DependencyMap::new();
    let verdict = validator.validate(&files, &none);
    if verdict.passed() {
        println!(
            "✓ {} passed ({} files, {} dependencies, entry {})",
            dir.display(),
            files.len(),
            validator.resolve_dependencies(&files, &none).len(),
            validator.entry_point(&files)
        );
        return Ok(());
    }

    for violation in &verdict.violations {
        println!("✗ [{:?}] {}", violation.rule, violation);
    }
    bail!("{} violation(s) found", verdict.violations.len())
}

/// Execute a bundle and follow its logs until it ends or Ctrl-C
pub async fn execute_run(
    dir: PathBuf,
    id: Option<String>,
    config: Option<PathBuf>,
    container: bool,
) -> Result<()> {
    let mut config = load_config(config.as_deref())?;
    if container {
        config.isolation = IsolationKind::Container;
    }
    let files = load_bundle(&dir)?;
    let id = match id {
        Some(id) => id,
        None => default_id(&dir),
    };

    let service = SandboxService::init(config).await?;
    let response = match service.execute(&id, ExecuteRequest::new(files)).await {
        Ok(response) => response,
        Err(e) => {
            service.shutdown().await;
            return Err(e.into());
        }
    };
    println!("✓ {} → {}", response.app_id, response.endpoint);

    let outcome = tokio::select! {
        outcome = follow(&service, &id) => outcome,
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted");
            None
        }
    };

    service.shutdown().await;
    match outcome {
        Some(view) if view.status == SandboxState::Stopped => {
            println!("{} {}", view.id, view.status);
            Ok(())
        }
        Some(view) => bail!(
            "{} ended in {} (exit code {:?}, {})",
            view.id,
            view.status,
            view.exit_code,
            view.reason.unwrap_or_else(|| "no reason recorded".into())
        ),
        None => Ok(()),
    }
}

/// Print new log lines until the sandbox is terminal or gone
async fn follow(service: &SandboxService, id: &str) -> Option<SandboxView> {
    let tail = service.config().logs.max_tail;
    let mut printed: Vec<String> = Vec::new();
    let mut ticker = tokio::time::interval(Duration::from_millis(250));

    loop {
        ticker.tick().await;
        let view = service.status(id).await;
        if let Some(text) = service.logs(id, Some(tail)).await {
            let lines: Vec<String> = text.lines().map(String::from).collect();
            for line in &lines[overlap(&printed, &lines)..] {
                println!("{line}");
            }
            printed = lines;
        }

        match view {
            Some(view) if view.status.is_terminal() => return Some(view),
            Some(_) => {}
            None => return None,
        }
    }
}

/// Index in `next` of the first line not already in `previous`.
///
/// The ring buffer may have dropped lines from the front, so the longest
/// suffix of `previous` that is a prefix of `next` is taken as already shown.
fn overlap(previous: &[String], next: &[String]) -> usize {
    (0..=previous.len().min(next.len()))
        .rev()
        .find(|&len| previous[previous.len() - len..] == next[..len])
        .unwrap_or(0)
}

/// Directory name, lowercased, with anything outside `[a-z0-9_.-]` mapped to `-`
fn default_id(dir: &Path) -> String {
    let name = dir
        .canonicalize()
        .ok()
        .and_then(|path| path.file_name().map(|n| n.to_string_lossy().into_owned()))
        .unwrap_or_default();
    let id: String = name
        .to_lowercase()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-') {
                c
            } else {
                '-'
            }
        })
        .collect();
    let id = id.trim_start_matches(|c: char| !c.is_ascii_alphanumeric());
    if id.is_empty() {
        "app".to_string()
    } else {
        id.chars().take(64).collect()
    }
}
