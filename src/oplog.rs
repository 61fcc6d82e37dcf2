//! Operation log records and the logger collaborators that consume them.
//!
//! A scope configured with a logger emits one [`OperationLogEntry`] per
//! finished operation. What gets recorded is filtered by [`LoggingMode`].

use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Exec,
    Read,
    Write,
    Rename,
    #[serde(rename = "rm")]
    Remove,
    #[serde(rename = "readdir")]
    ListDir,
    #[serde(rename = "mkdir")]
    MakeDir,
    Touch,
    Exists,
    Stat,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Exec => "exec",
            OperationKind::Read => "read",
            OperationKind::Write => "write",
            OperationKind::Rename => "rename",
            OperationKind::Remove => "rm",
            OperationKind::ListDir => "readdir",
            OperationKind::MakeDir => "mkdir",
            OperationKind::Touch => "touch",
            OperationKind::Exists => "exists",
            OperationKind::Stat => "stat",
        }
    }

    /// Operations that can change workspace state.
    pub fn is_modifying(&self) -> bool {
        matches!(
            self,
            OperationKind::Exec
                | OperationKind::Write
                | OperationKind::Rename
                | OperationKind::Remove
                | OperationKind::MakeDir
                | OperationKind::Touch
        )
    }
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoggingMode {
    /// Modifying operations only.
    #[default]
    Standard,
    /// Every operation, including reads.
    Verbose,
}

pub fn should_log_operation(kind: OperationKind, mode: LoggingMode) -> bool {
    match mode {
        LoggingMode::Verbose => true,
        LoggingMode::Standard => kind.is_modifying(),
    }
}

/// Record of one finished operation. Fields are read-only once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationLogEntry {
    timestamp: DateTime<Utc>,
    kind: OperationKind,
    scope_path: String,
    /// Command for `exec`, path (or `from -> to`) otherwise.
    operand: String,
    success: bool,
    #[serde(with = "duration_ms")]
    duration: Duration,
    stdout: Option<String>,
    #[serde(default)]
    stderr: Option<String>,
    /// Set for `exec` once the process ran.
    #[serde(default)]
    exit_code: Option<i32>,
    error: Option<String>,
}

impl OperationLogEntry {
    pub fn new(
        kind: OperationKind,
        scope_path: impl Into<String>,
        operand: impl Into<String>,
        started_at: DateTime<Utc>,
        duration: Duration,
        outcome: Result<Option<String>, String>,
    ) -> Self {
        let (success, stdout, error) = match outcome {
            Ok(stdout) => (true, stdout, None),
            Err(error) => (false, None, Some(error)),
        };
        Self {
            timestamp: started_at,
            kind,
            scope_path: scope_path.into(),
            operand: operand.into(),
            success,
            duration,
            stdout,
            stderr: None,
            exit_code: None,
            error,
        }
    }

    /// Attaches the process outcome of an `exec`.
    pub fn with_process(mut self, exit_code: i32, stderr: Option<String>) -> Self {
        self.exit_code = Some(exit_code);
        self.stderr = stderr.filter(|s| !s.is_empty());
        self
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
    pub fn kind(&self) -> OperationKind {
        self.kind
    }
    pub fn scope_path(&self) -> &str {
        &self.scope_path
    }
    pub fn operand(&self) -> &str {
        &self.operand
    }
    pub fn success(&self) -> bool {
        self.success
    }
    pub fn duration(&self) -> Duration {
        self.duration
    }
    pub fn stdout(&self) -> Option<&str> {
        self.stdout.as_deref()
    }
    pub fn stderr(&self) -> Option<&str> {
        self.stderr.as_deref()
    }
    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

/// Sink for finished-operation records.
pub trait OperationsLogger: Send + Sync {
    fn mode(&self) -> LoggingMode;
    fn log(&self, entry: OperationLogEntry);
}

/// Keeps every entry in memory. Handy for audits and tests.
#[derive(Default)]
pub struct MemoryOperationsLogger {
    mode: LoggingMode,
    entries: Mutex<Vec<OperationLogEntry>>,
}

impl MemoryOperationsLogger {
    pub fn new(mode: LoggingMode) -> Self {
        Self {
            mode,
            entries: Mutex::new(Vec::new()),
        }
    }

    pub fn entries(&self) -> Vec<OperationLogEntry> {
        self.entries.lock().clone()
    }

    pub fn entries_by_kind(&self, kind: OperationKind) -> Vec<OperationLogEntry> {
        self.entries
            .lock()
            .iter()
            .filter(|e| e.kind == kind)
            .cloned()
            .collect()
    }

    pub fn entries_by_success(&self, success: bool) -> Vec<OperationLogEntry> {
        self.entries
            .lock()
            .iter()
            .filter(|e| e.success == success)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}

impl OperationsLogger for MemoryOperationsLogger {
    fn mode(&self) -> LoggingMode {
        self.mode
    }

    fn log(&self, entry: OperationLogEntry) {
        self.entries.lock().push(entry);
    }
}

/// Emits each entry as a structured `tracing` event.
pub struct TracingOperationsLogger {
    mode: LoggingMode,
}

impl TracingOperationsLogger {
    pub fn new(mode: LoggingMode) -> Self {
        Self { mode }
    }
}

impl OperationsLogger for TracingOperationsLogger {
    fn mode(&self) -> LoggingMode {
        self.mode
    }

    fn log(&self, entry: OperationLogEntry) {
        let duration_ms = entry.duration.as_millis() as u64;
        if entry.success {
            info!(
                op = %entry.kind,
                scope = %entry.scope_path,
                duration_ms,
                "{}",
                entry.operand
            );
        } else {
            warn!(
                op = %entry.kind,
                scope = %entry.scope_path,
                duration_ms,
                exit_code = entry.exit_code,
                error = entry.error.as_deref().unwrap_or(""),
                "{}",
                entry.operand
            );
        }
    }
}
