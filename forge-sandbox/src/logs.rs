//! Per-sandbox log ring buffer with a file mirror, plus the latest resource sample

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::warn;

/// Prefix of engine-authored lines
pub const SYSTEM_PREFIX: &str = "[sandbox]";

/// Where a log line came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogStream {
    Stdout,
    Stderr,
    System,
}

impl std::fmt::Display for LogStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stdout => f.write_str("stdout"),
            Self::Stderr => f.write_str("stderr"),
            Self::System => f.write_str("system"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogLine {
    pub at: DateTime<Utc>,
    pub stream: LogStream,
    pub text: String,
}

/// Point-in-time resource usage of one sandbox
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceSample {
    pub at: DateTime<Utc>,
    /// Percent of one core
    pub cpu_percent: f64,
    pub memory_bytes: u64,
}

struct CollectorState {
    lines: VecDeque<LogLine>,
    capacity: usize,
    mirror: Option<File>,
    latest: Option<ResourceSample>,
}

/// Shared log sink for one sandbox.
///
/// Cloning is cheap; every clone writes into the same buffer. The lock is a
/// plain `std::sync::Mutex` because it is never held across an await.
#[derive(Clone)]
pub struct LogCollector {
    state: Arc<Mutex<CollectorState>>,
}

impl std::fmt::Debug for LogCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogCollector").field("lines", &self.len()).finish()
    }
}

impl LogCollector {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(CollectorState {
                lines: VecDeque::with_capacity(capacity.min(1024)),
                capacity: capacity.max(1),
                mirror: None,
                latest: None,
            })),
        }
    }

    /// Start mirroring lines into `path` (append-only).
    ///
    /// Lines already buffered are written first. Failure to open the file is
    /// logged and leaves the collector memory-only.
    pub fn attach_file(&self, path: &Path) {
        let file = OpenOptions::new().create(true).append(true).open(path);
        let mut state = self.lock();
        match file {
            Ok(mut file) => {
                let backlog = state
                    .lines
                    .iter()
                    .try_for_each(|line| writeln!(file, "{}", render_mirror(line)));
                if let Err(e) = backlog {
                    warn!(path = %path.display(), error = %e, "log mirror write failed; mirror disabled");
                } else {
                    state.mirror = Some(file);
                }
            }
            Err(e) => warn!(path = %path.display(), error = %e, "cannot open log mirror"),
        }
    }

    /// Close the mirror so the workspace can be removed
    pub fn detach_file(&self) {
        self.lock().mirror = None;
    }

    pub fn push(&self, stream: LogStream, text: impl Into<String>) {
        let line = LogLine {
            at: Utc::now(),
            stream,
            text: text.into(),
        };

        let mut state = self.lock();
        if let Some(file) = state.mirror.as_mut() {
            if let Err(e) = writeln!(file, "{}", render_mirror(&line)) {
                warn!(error = %e, "log mirror write failed; mirror disabled");
                state.mirror = None;
            }
        }
        if state.lines.len() == state.capacity {
            state.lines.pop_front();
        }
        state.lines.push_back(line);
    }

    /// Record an engine-authored line, prefixed with `[sandbox]`
    pub fn system(&self, text: impl AsRef<str>) {
        self.push(LogStream::System, format!("{SYSTEM_PREFIX} {}", text.as_ref()));
    }

    /// Last `n` lines, oldest first
    pub fn tail(&self, n: usize) -> Vec<LogLine> {
        let state = self.lock();
        let skip = state.lines.len().saturating_sub(n);
        state.lines.iter().skip(skip).cloned().collect()
    }

    /// Last `n` lines joined with newlines
    pub fn tail_text(&self, n: usize) -> String {
        self.tail(n)
            .into_iter()
            .map(|line| line.text)
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn len(&self) -> usize {
        self.lock().lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn record_sample(&self, sample: ResourceSample) {
        self.lock().latest = Some(sample);
    }

    pub fn latest_sample(&self) -> Option<ResourceSample> {
        self.lock().latest.clone()
    }

    fn lock(&self) -> MutexGuard<'_, CollectorState> {
        // a panic while holding the lock leaves the buffer usable
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn render_mirror(line: &LogLine) -> String {
    format!("{} {:<6} {}", line.at.to_rfc3339(), line.stream, line.text)
}
