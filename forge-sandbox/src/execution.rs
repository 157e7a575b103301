//! Sandbox identity, lifecycle state machine and the registry's per-sandbox record

use crate::error::SandboxError;
use crate::limits::ResourceLimits;
use crate::logs::ResourceSample;
use crate::runtime::UnitEvent;
use crate::types::SandboxView;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::time::Instant;

const MAX_ID_LEN: usize = 64;

/// Caller-supplied sandbox identifier.
///
/// Ids become directory and container names, so only `[A-Za-z0-9][A-Za-z0-9_.-]*`
/// of at most 64 characters is accepted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SandboxId(String);

impl SandboxId {
    pub fn parse(raw: impl Into<String>) -> Result<Self, SandboxError> {
        let raw = raw.into();
        let mut chars = raw.chars();
        let valid_head = chars.next().is_some_and(|c| c.is_ascii_alphanumeric());
        let valid_tail = chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'));

        if valid_head && valid_tail && raw.len() <= MAX_ID_LEN {
            Ok(Self(raw))
        } else {
            Err(SandboxError::InvalidId(raw))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for SandboxId {
    type Error = SandboxError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<SandboxId> for String {
    fn from(id: SandboxId) -> Self {
        id.0
    }
}

impl AsRef<str> for SandboxId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SandboxId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Isolation strategy backing a sandbox
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IsolationKind {
    /// Host process tree in its own process group
    #[default]
    Process,
    /// Image build plus a constrained container
    Container,
}

impl std::fmt::Display for IsolationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Process => f.write_str("process"),
            Self::Container => f.write_str("container"),
        }
    }
}

/// Sandbox lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxState {
    Starting,
    Running,
    Stopped,
    Error,
}

impl SandboxState {
    /// Starting or running: the sandbox owns a live handle
    pub fn is_live(self) -> bool {
        matches!(self, Self::Starting | Self::Running)
    }

    pub fn is_terminal(self) -> bool {
        !self.is_live()
    }

    /// Transitions are monotonic; redeploys create a fresh record instead.
    pub fn can_transition_to(self, next: SandboxState) -> bool {
        match (self, next) {
            (Self::Starting, Self::Running | Self::Stopped | Self::Error) => true,
            (Self::Running, Self::Stopped | Self::Error) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for SandboxState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Starting => f.write_str("starting"),
            Self::Running => f.write_str("running"),
            Self::Stopped => f.write_str("stopped"),
            Self::Error => f.write_str("error"),
        }
    }
}

/// Why a sandbox was torn down
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StopReason {
    Requested,
    Timeout,
    Redeploy,
    Shutdown,
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Requested => f.write_str("requested"),
            Self::Timeout => f.write_str("timeout"),
            Self::Redeploy => f.write_str("redeploy"),
            Self::Shutdown => f.write_str("shutdown"),
        }
    }
}

/// Registry-side record of one sandbox generation
#[derive(Debug, Clone)]
pub struct SandboxRecord {
    pub id: SandboxId,
    pub generation: u64,
    pub kind: IsolationKind,
    pub state: SandboxState,
    pub limits: ResourceLimits,
    pub port: u16,
    pub endpoint: String,
    pub workspace: Option<PathBuf>,
    pub started_at: DateTime<Utc>,
    pub started: Instant,
    pub ready_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
    pub reason: Option<String>,
}

impl SandboxRecord {
    pub fn new(
        id: SandboxId,
        generation: u64,
        kind: IsolationKind,
        limits: ResourceLimits,
        port: u16,
    ) -> Self {
        Self {
            id,
            generation,
            kind,
            state: SandboxState::Starting,
            limits,
            port,
            endpoint: String::new(),
            workspace: None,
            started_at: Utc::now(),
            started: Instant::now(),
            ready_at: None,
            exit_code: None,
            reason: None,
        }
    }

    /// Move to `next` if the state machine allows it
    pub fn transition(&mut self, next: SandboxState) -> bool {
        if self.state.can_transition_to(next) {
            self.state = next;
            true
        } else {
            false
        }
    }

    /// Fold a unit event into the record. Returns whether the state changed.
    pub fn apply(&mut self, event: &UnitEvent) -> bool {
        match event {
            UnitEvent::Installed => false,
            UnitEvent::Ready(_) => {
                let changed = self.transition(SandboxState::Running);
                if changed {
                    self.ready_at = Some(Utc::now());
                }
                changed
            }
            UnitEvent::Exited { code } => {
                let next = if *code == Some(0) {
                    SandboxState::Stopped
                } else {
                    SandboxState::Error
                };
                let changed = self.transition(next);
                if changed {
                    self.exit_code = *code;
                    let detail = match code {
                        Some(0) => "exited cleanly".to_string(),
                        Some(code) => format!("exited with code {code}"),
                        None => "terminated by signal".to_string(),
                    };
                    // a reason recorded before the kill (memory ceiling) wins
                    if next == SandboxState::Stopped || self.reason.is_none() {
                        self.reason = Some(detail);
                    }
                }
                changed
            }
            UnitEvent::Failed { reason } => {
                let changed = self.transition(SandboxState::Error);
                if changed {
                    self.reason = Some(reason.clone());
                }
                changed
            }
        }
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started.elapsed().as_secs()
    }

    pub fn view(&self, stats: Option<ResourceSample>) -> SandboxView {
        SandboxView {
            id: self.id.to_string(),
            status: self.state,
            isolation: self.kind,
            endpoint: self.endpoint.clone(),
            uptime_secs: self.uptime_secs(),
            started_at: self.started_at,
            ready_at: self.ready_at,
            exit_code: self.exit_code,
            reason: self.reason.clone(),
            limits: self.limits.clone(),
            stats,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::Readiness;

    fn record() -> SandboxRecord {
        SandboxRecord::new(
            SandboxId::parse("app-1").unwrap(),
            1,
            IsolationKind::Process,
            ResourceLimits::default(),
            4100,
        )
    }

    #[test]
    fn test_id_accepts_simple_names() {
        for id in ["app-1", "A.b_c-9", "x"] {
            assert!(SandboxId::parse(id).is_ok(), "{id} should be accepted");
        }
    }

    #[test]
    fn test_id_rejects_path_like_names() {
        for id in ["", ".", "..", "../x", "a/b", "-lead", "a b", "ünï"] {
            assert!(SandboxId::parse(id).is_err(), "{id} should be rejected");
        }
        assert!(SandboxId::parse("a".repeat(65)).is_err());
    }

    #[test]
    fn test_state_machine_is_monotonic() {
        use SandboxState::*;
        assert!(Starting.can_transition_to(Running));
        assert!(Starting.can_transition_to(Error));
        assert!(Running.can_transition_to(Stopped));
        assert!(!Running.can_transition_to(Starting));
        assert!(!Stopped.can_transition_to(Running));
        assert!(!Error.can_transition_to(Stopped));
    }

    #[test]
    fn test_ready_then_clean_exit() {
        let mut record = record();
        assert!(record.apply(&UnitEvent::Ready(Readiness::Marker("ready".into()))));
        assert_eq!(record.state, SandboxState::Running);
        assert!(record.ready_at.is_some());

        assert!(record.apply(&UnitEvent::Exited { code: Some(0) }));
        assert_eq!(record.state, SandboxState::Stopped);
        assert_eq!(record.exit_code, Some(0));
    }

    #[test]
    fn test_clean_exit_before_ready_is_stopped() {
        let mut record = record();
        record.apply(&UnitEvent::Exited { code: Some(0) });
        assert_eq!(record.state, SandboxState::Stopped);
    }

    #[test]
    fn test_nonzero_exit_is_error() {
        let mut record = record();
        record.apply(&UnitEvent::Exited { code: Some(3) });
        assert_eq!(record.state, SandboxState::Error);
        assert_eq!(record.reason.as_deref(), Some("exited with code 3"));
    }

    #[test]
    fn test_failure_is_terminal() {
        let mut record = record();
        record.apply(&UnitEvent::Failed {
            reason: "install failed".into(),
        });
        assert_eq!(record.state, SandboxState::Error);
        assert!(!record.apply(&UnitEvent::Ready(Readiness::GracePeriod)));
        assert_eq!(record.state, SandboxState::Error);
    }

    #[test]
    fn test_recorded_reason_survives_kill() {
        let mut record = record();
        record.apply(&UnitEvent::Ready(Readiness::Probe));
        record.reason = Some("memory limit exceeded".into());
        record.apply(&UnitEvent::Exited { code: None });
        assert_eq!(record.state, SandboxState::Error);
        assert_eq!(record.reason.as_deref(), Some("memory limit exceeded"));
    }
}
