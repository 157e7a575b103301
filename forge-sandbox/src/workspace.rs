//! Workspace materialization
//!
//! A bundle is written into a private staging directory next to the
//! workspace root and renamed into place only after every file landed, so a
//! failed materialization never leaves a partial tree behind. Every path is
//! checked twice: lexically, and again after its parent directories exist,
//! against the canonical workspace root.

use crate::error::MaterializeError;
use crate::execution::SandboxId;
use crate::limits::BundleLimits;
use crate::policy::check_relative_path;
use crate::types::FileMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Append-only log mirror the collector keeps inside every workspace
pub const LOG_FILE_NAME: &str = ".sandbox.log";

/// Build descriptor generated for the container strategy
pub const BUILD_DESCRIPTOR_NAME: &str = ".forge.Dockerfile";

/// Writes bundles into per-sandbox directories under one base directory
#[derive(Debug, Clone)]
pub struct Materializer {
    base_dir: PathBuf,
    limits: BundleLimits,
}

impl Materializer {
    pub fn new(base_dir: impl Into<PathBuf>, limits: BundleLimits) -> Self {
        Self {
            base_dir: base_dir.into(),
            limits,
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Write `files` into a fresh workspace for `id`, replacing any previous one
    pub fn materialize(&self, id: &SandboxId, files: &FileMap) -> Result<PathBuf, MaterializeError> {
        check_limits(files, &self.limits)?;
        for path in files.keys() {
            check_lexical(path)?;
        }

        fs::create_dir_all(&self.base_dir).map_err(|e| MaterializeError::io(&self.base_dir, e))?;
        let base = fs::canonicalize(&self.base_dir).map_err(|e| MaterializeError::io(&self.base_dir, e))?;
        let root = base.join(id.as_str());

        let staging = base.join(format!(".{id}.staging-{}", uuid::Uuid::new_v4()));
        fs::create_dir(&staging).map_err(|e| MaterializeError::io(&staging, e))?;

        let written = fs::canonicalize(&staging)
            .map_err(|e| MaterializeError::io(&staging, e))
            .and_then(|staging| write_all(&staging, files))
            .and_then(|_| {
                remove_existing(&root)?;
                fs::rename(&staging, &root).map_err(|e| MaterializeError::io(&root, e))
            });

        if let Err(e) = written {
            if let Err(cleanup) = fs::remove_dir_all(&staging) {
                if cleanup.kind() != io::ErrorKind::NotFound {
                    warn!(sandbox_id = %id, error = %cleanup, "failed to remove staging directory");
                }
            }
            return Err(e);
        }

        info!(sandbox_id = %id, files = files.len(), workspace = %root.display(), "workspace materialized");
        Ok(root)
    }

    /// Overwrite `files` inside an existing workspace (hot update).
    ///
    /// Returns the number of files written.
    pub fn rewrite(&self, workspace: &Path, files: &FileMap) -> Result<usize, MaterializeError> {
        check_limits(files, &self.limits)?;
        for path in files.keys() {
            check_lexical(path)?;
        }

        let root = fs::canonicalize(workspace).map_err(|e| MaterializeError::io(workspace, e))?;
        write_all(&root, files)?;

        debug!(workspace = %root.display(), files = files.len(), "workspace rewritten");
        Ok(files.len())
    }

    /// Delete a workspace. A missing directory counts as success.
    pub async fn remove(workspace: &Path) -> io::Result<()> {
        match tokio::fs::remove_dir_all(workspace).await {
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            other => other,
        }
    }
}

fn check_lexical(path: &str) -> Result<(), MaterializeError> {
    check_relative_path(path).map_err(|_| MaterializeError::PathViolation {
        path: path.to_string(),
    })
}

fn check_limits(files: &FileMap, limits: &BundleLimits) -> Result<(), MaterializeError> {
    if files.len() > limits.max_files {
        return Err(MaterializeError::LimitExceeded {
            limit: "max_files",
            actual: files.len() as u64,
            max: limits.max_files as u64,
        });
    }

    let mut total: u64 = 0;
    for content in files.values() {
        let size = content.len() as u64;
        if size > limits.max_file_bytes {
            return Err(MaterializeError::LimitExceeded {
                limit: "max_file_bytes",
                actual: size,
                max: limits.max_file_bytes,
            });
        }
        total = total.saturating_add(size);
    }

    if total > limits.max_total_bytes {
        return Err(MaterializeError::LimitExceeded {
            limit: "max_total_bytes",
            actual: total,
            max: limits.max_total_bytes,
        });
    }
    Ok(())
}

fn write_all(root: &Path, files: &FileMap) -> Result<(), MaterializeError> {
    for (path, content) in files {
        write_contained(root, path, content)?;
    }
    Ok(())
}

/// Write one file under `root`, which must already be canonical.
fn write_contained(root: &Path, relative: &str, content: &str) -> Result<(), MaterializeError> {
    let violation = || MaterializeError::PathViolation {
        path: relative.to_string(),
    };

    let relative_path = Path::new(relative);
    let file_name = relative_path.file_name().ok_or_else(violation)?;

    // Walk the parents one by one so an existing symlink is never followed
    // while creating directories.
    let mut parent = root.to_path_buf();
    if let Some(dirs) = relative_path.parent() {
        for component in dirs.components() {
            parent.push(component);
            match fs::symlink_metadata(&parent) {
                Ok(meta) if meta.file_type().is_dir() => {}
                Ok(_) => return Err(violation()),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    fs::create_dir(&parent).map_err(|e| MaterializeError::io(&parent, e))?;
                }
                Err(e) => return Err(MaterializeError::io(&parent, e)),
            }
        }
    }

    let parent = fs::canonicalize(&parent).map_err(|e| MaterializeError::io(&parent, e))?;
    if !parent.starts_with(root) {
        return Err(violation());
    }

    let target = parent.join(file_name);
    match fs::symlink_metadata(&target) {
        Ok(meta) if meta.file_type().is_symlink() || meta.is_dir() => return Err(violation()),
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(MaterializeError::io(&target, e)),
    }

    fs::write(&target, content).map_err(|e| MaterializeError::io(&target, e))
}

fn remove_existing(root: &Path) -> Result<(), MaterializeError> {
    match fs::symlink_metadata(root) {
        Ok(meta) if meta.file_type().is_dir() => {
            fs::remove_dir_all(root).map_err(|e| MaterializeError::io(root, e))
        }
        Ok(_) => fs::remove_file(root).map_err(|e| MaterializeError::io(root, e)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(MaterializeError::io(root, e)),
    }
}
