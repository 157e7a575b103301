//! Request and response types at the registry boundary

use crate::execution::{IsolationKind, SandboxState};
use crate::limits::{ResourceConfig, ResourceLimits};
use crate::logs::ResourceSample;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Relative path → file content
pub type FileMap = BTreeMap<String, String>;

/// Package name → version spec
pub type DependencyMap = BTreeMap<String, String>;

/// Request to execute a bundle
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecuteRequest {
    /// The generated files
    pub files: FileMap,

    /// Declared dependencies
    #[serde(default)]
    pub dependencies: DependencyMap,

    /// Optional resource overrides, clamped to the engine ceiling
    #[serde(default)]
    pub resources: Option<ResourceConfig>,

    /// Replace a live sandbox with the same id instead of failing
    #[serde(default)]
    pub redeploy: bool,
}

impl ExecuteRequest {
    /// Create a request for a bundle with no dependencies
    pub fn new(files: FileMap) -> Self {
        Self {
            files,
            ..Default::default()
        }
    }

    /// Add a dependency
    pub fn with_dependency(mut self, name: impl Into<String>, version: impl Into<String>) -> Self {
        self.dependencies.insert(name.into(), version.into());
        self
    }

    /// Set resource overrides
    pub fn with_resources(mut self, resources: ResourceConfig) -> Self {
        self.resources = Some(resources);
        self
    }

    /// Allow replacing a live sandbox
    pub fn redeploy(mut self) -> Self {
        self.redeploy = true;
        self
    }
}

/// Snapshot of one sandbox
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SandboxView {
    #[serde(rename = "appId")]
    pub id: String,
    pub status: SandboxState,
    pub isolation: IsolationKind,
    pub endpoint: String,
    #[serde(rename = "uptime")]
    pub uptime_secs: u64,
    pub started_at: DateTime<Utc>,
    pub ready_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
    pub reason: Option<String>,
    pub limits: ResourceLimits,
    pub stats: Option<ResourceSample>,
}

/// Result of a successful `execute`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteResponse {
    pub app_id: String,
    pub endpoint: String,
    pub status: SandboxState,
    pub logs: String,
}

/// Acknowledgement of a hot update
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateAck {
    pub status: SandboxState,
    pub files_written: usize,
}

/// Engine liveness report
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: String,
    pub version: String,
    pub isolation: IsolationKind,
    pub sandboxes: usize,
    pub running: usize,
    pub shutting_down: bool,
}
