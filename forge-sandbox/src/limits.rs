//! Resource limits configuration for sandboxed execution

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Smallest memory ceiling handed out. Docker rejects anything below 6 MiB
/// and reads 0 as "unlimited".
pub const MIN_MEMORY_BYTES: u64 = 6 * 1024 * 1024;

/// Smallest CPU ceiling; `--cpus` renders with two decimals and `0.00` means
/// unlimited.
pub const MIN_CPU: f64 = 0.01;

/// Shortest execution timeout
pub const MIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Resource limits applied to one sandbox
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceLimits {
    /// Hard memory ceiling in bytes
    pub memory_bytes: u64,

    /// CPU ceiling as a fraction of one core (0.5 = half a core)
    pub cpu: f64,

    /// Wall-clock execution timeout, measured from sandbox creation
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,

    /// Maximum number of processes (container strategy only)
    pub pids: u32,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            memory_bytes: 512 * 1024 * 1024,      // 512 MB
            cpu: 0.5,                             // half a core
            timeout: Duration::from_secs(30 * 60), // 30 minutes
            pids: 256,
        }
    }
}

impl ResourceLimits {
    /// Create strict limits for short-lived previews
    pub fn strict() -> Self {
        Self {
            memory_bytes: 128 * 1024 * 1024, // 128 MB
            cpu: 0.25,
            timeout: Duration::from_secs(5 * 60),
            pids: 64,
        }
    }

    /// Create permissive limits for trusted long-running apps
    pub fn permissive() -> Self {
        Self {
            memory_bytes: 2 * 1024 * 1024 * 1024, // 2 GB
            cpu: 2.0,
            timeout: Duration::from_secs(4 * 60 * 60),
            pids: 1024,
        }
    }

    /// Overlay the caller's partial resource configuration on top of these limits.
    ///
    /// Caller values are raised to the `MIN_*` floors, so no override can
    /// switch a ceiling off, and everything is clamped to `ceiling` so a
    /// caller can never ask for more than the engine is configured to hand out.
    pub fn merge(&self, request: &ResourceConfig, ceiling: &ResourceLimits) -> Self {
        let memory_bytes = request
            .memory_mb
            .map(|mb| mb.saturating_mul(1024 * 1024).max(MIN_MEMORY_BYTES))
            .unwrap_or(self.memory_bytes)
            .min(ceiling.memory_bytes);
        let cpu = request
            .cpu
            .filter(|cpu| cpu.is_finite() && *cpu > 0.0)
            .map(|cpu| cpu.max(MIN_CPU))
            .unwrap_or(self.cpu)
            .min(ceiling.cpu);
        let timeout = request
            .timeout_secs
            .map(|secs| Duration::from_secs(secs).max(MIN_TIMEOUT))
            .unwrap_or(self.timeout)
            .min(ceiling.timeout);

        Self {
            memory_bytes,
            cpu,
            timeout,
            pids: self.pids.min(ceiling.pids),
        }
    }

    /// CPU ceiling rendered for `--cpus`
    pub fn cpus_arg(&self) -> String {
        format!("{:.2}", self.cpu)
    }
}

/// Caller-supplied resource overrides; every field is optional
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceConfig {
    /// Memory ceiling in megabytes
    #[serde(default)]
    pub memory_mb: Option<u64>,

    /// CPU ceiling as a fraction of one core
    #[serde(default)]
    pub cpu: Option<f64>,

    /// Execution timeout in seconds
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

/// Ceilings on what a single bundle may write into a workspace.
///
/// The same value is handed to the validator and the materializer so both
/// enforce identical numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BundleLimits {
    /// Largest single file in bytes
    pub max_file_bytes: u64,

    /// Largest number of files in one bundle
    pub max_files: usize,

    /// Largest aggregate size in bytes
    pub max_total_bytes: u64,
}

impl Default for BundleLimits {
    fn default() -> Self {
        Self {
            max_file_bytes: 1024 * 1024,       // 1 MiB
            max_files: 100,
            max_total_bytes: 10 * 1024 * 1024, // 10 MiB
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_limits() {
        let limits = ResourceLimits::default();
        assert_eq!(limits.memory_bytes, 512 * 1024 * 1024);
        assert_eq!(limits.timeout, Duration::from_secs(1800));
    }

    #[test]
    fn test_strict_limits() {
        let limits = ResourceLimits::strict();
        assert_eq!(limits.timeout, Duration::from_secs(300));
        assert_eq!(limits.memory_bytes, 128 * 1024 * 1024);
    }

    #[test]
    fn test_merge_applies_overrides() {
        let base = ResourceLimits::default();
        let request = ResourceConfig {
            memory_mb: Some(256),
            cpu: None,
            timeout_secs: Some(10),
        };
        let merged = base.merge(&request, &ResourceLimits::permissive());
        assert_eq!(merged.memory_bytes, 256 * 1024 * 1024);
        assert_eq!(merged.cpu, base.cpu);
        assert_eq!(merged.timeout, Duration::from_secs(10));
    }

    #[test]
    fn test_merge_clamps_to_ceiling() {
        let base = ResourceLimits::default();
        let request = ResourceConfig {
            memory_mb: Some(64 * 1024),
            cpu: Some(16.0),
            timeout_secs: Some(24 * 60 * 60),
        };
        let ceiling = ResourceLimits::permissive();
        let merged = base.merge(&request, &ceiling);
        assert_eq!(merged.memory_bytes, ceiling.memory_bytes);
        assert_eq!(merged.cpu, ceiling.cpu);
        assert_eq!(merged.timeout, ceiling.timeout);
    }

    #[test]
    fn test_merge_ignores_nonsense_cpu() {
        let base = ResourceLimits::default();
        let request = ResourceConfig {
            cpu: Some(-1.0),
            ..Default::default()
        };
        let merged = base.merge(&request, &ResourceLimits::permissive());
        assert_eq!(merged.cpu, base.cpu);
    }

    #[test]
    fn test_merge_floors_zero_and_tiny_values() {
        let base = ResourceLimits::default();
        let request = ResourceConfig {
            memory_mb: Some(0),
            cpu: Some(0.001),
            timeout_secs: Some(0),
        };
        let merged = base.merge(&request, &ResourceLimits::permissive());
        assert_eq!(merged.memory_bytes, MIN_MEMORY_BYTES);
        assert_eq!(merged.cpu, MIN_CPU);
        assert_eq!(merged.timeout, MIN_TIMEOUT);
        assert_eq!(merged.cpus_arg(), "0.01");

        let request = ResourceConfig {
            memory_mb: Some(1),
            ..Default::default()
        };
        assert_eq!(base.merge(&request, &ResourceLimits::permissive()).memory_bytes, MIN_MEMORY_BYTES);
    }

    #[test]
    fn test_default_bundle_limits() {
        let limits = BundleLimits::default();
        assert_eq!(limits.max_file_bytes, 1024 * 1024);
        assert_eq!(limits.max_files, 100);
    }

    #[test]
    fn test_cpus_arg() {
        assert_eq!(ResourceLimits::default().cpus_arg(), "0.50");
    }
}
