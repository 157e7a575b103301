//! Error taxonomy for the sandbox engine

use crate::policy::ValidationVerdict;
use std::path::PathBuf;
use thiserror::Error;

/// Errors returned synchronously by the sandbox registry.
///
/// Asynchronous failures (install, build, crash, timeout) never surface here;
/// they are observable through `status` and `logs`.
#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("bundle rejected by security policy: {0}")]
    Validation(ValidationVerdict),

    #[error(transparent)]
    Materialize(#[from] MaterializeError),

    #[error("invalid sandbox id '{0}'")]
    InvalidId(String),

    #[error("sandbox '{0}' is already running")]
    AlreadyExists(String),

    #[error("sandbox '{0}' not found")]
    NotFound(String),

    #[error("no free ports left in {start}..={end}")]
    PortsExhausted { start: u16, end: u16 },

    #[error("sandbox registry is shutting down")]
    ShuttingDown,

    #[error("isolation strategy unavailable: {0}")]
    RuntimeUnavailable(String),
}

/// Errors raised while writing a bundle into a workspace.
#[derive(Debug, Error)]
pub enum MaterializeError {
    #[error("path '{path}' escapes the workspace")]
    PathViolation { path: String },

    #[error("bundle exceeds {limit}: {actual} > {max}")]
    LimitExceeded {
        limit: &'static str,
        actual: u64,
        max: u64,
    },

    #[error("i/o error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl MaterializeError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

pub type SandboxResult<T> = std::result::Result<T, SandboxError>;
