//! Scoped view of a backend.
//!
//! A [`Scope`] confines every operation to `parent_root/scope_path`. Paths
//! are translated to parent-relative form and validated against the scope
//! path first, so a scope cannot be escaped even with input the parent alone
//! would accept. Nested scopes wrap the same root backend with a composed
//! scope path.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::OnceCell;
use tracing::debug;
use uuid::Uuid;

use super::boundary::{absolutize, join, relative_to, resolve_within};
use super::mcp::{create_transport, McpTransport};
use super::memory::MemoryBackend;
use super::{
    resolve_cwd, Backend, BackendType, ConnectionStatus, Content, Disposable, ExecOptions, FileBackend,
    FileStat, ReadOptions, RemoveOptions, StatusListener, Subscription,
};
use crate::error::{BackendError, Result};
use crate::oplog::{should_log_operation, OperationKind, OperationLogEntry, OperationsLogger};

/// Per-scope overrides, threaded through to operations.
#[derive(Clone, Default)]
pub struct ScopeConfig {
    /// Extra environment for `execute`, applied under per-call env.
    pub env: HashMap<String, String>,
    pub logger: Option<Arc<dyn OperationsLogger>>,
}

impl ScopeConfig {
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_logger(mut self, logger: Arc<dyn OperationsLogger>) -> Self {
        self.logger = Some(logger);
        self
    }

    /// Parent first, then child: child env keys win and a child logger
    /// replaces the parent's.
    pub fn merge(parent: &ScopeConfig, child: ScopeConfig) -> ScopeConfig {
        let mut env = parent.env.clone();
        env.extend(child.env);
        ScopeConfig {
            env,
            logger: child.logger.or_else(|| parent.logger.clone()),
        }
    }
}

impl std::fmt::Debug for ScopeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScopeConfig")
            .field("env", &self.env)
            .field("logger", &self.logger.is_some())
            .finish()
    }
}

struct ScopeInner {
    id: Uuid,
    parent: Backend,
    /// Relative to the parent root, no trailing separator; "." for the root.
    scope_path: String,
    /// Absolute boundary: parent root joined with `scope_path`.
    root: String,
    config: ScopeConfig,
    root_ready: OnceCell<()>,
}

/// Cheap-to-clone handle on a registered scope.
#[derive(Clone)]
pub struct Scope {
    inner: Arc<ScopeInner>,
}

impl Scope {
    pub(crate) fn new(parent: Backend, path: &str, config: ScopeConfig) -> Result<Self> {
        let parent_root = absolutize(parent.root());
        let root = resolve_within(path, &parent_root)?;
        let scope_path = match relative_to(&root, &parent_root) {
            Some("") => ".".to_string(),
            Some(rest) => rest.to_string(),
            None => return Err(BackendError::path_escape(path)),
        };
        Ok(Self::register(parent, scope_path, root, config))
    }

    fn register(parent: Backend, scope_path: String, root: String, config: ScopeConfig) -> Self {
        let id = Uuid::new_v4();
        parent.lifecycle().register_scope(id, scope_path.clone());
        debug!("Scope {id} registered at {scope_path}");
        Self {
            inner: Arc::new(ScopeInner {
                id,
                parent,
                scope_path,
                root,
                config,
                root_ready: OnceCell::new(),
            }),
        }
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn scope_path(&self) -> &str {
        &self.inner.scope_path
    }

    pub fn parent(&self) -> &Backend {
        &self.inner.parent
    }

    pub fn config(&self) -> &ScopeConfig {
        &self.inner.config
    }

    /// Nested scope under this one; the composed path is relative to the
    /// same root backend and `config` is merged over this scope's.
    pub fn scope(&self, path: &str, config: ScopeConfig) -> Result<Scope> {
        let nested_path = resolve_within(path, &self.inner.scope_path)?;
        let parent_root = absolutize(self.inner.parent.root());
        let root = resolve_within(&nested_path, &parent_root)?;
        let merged = ScopeConfig::merge(&self.inner.config, config);
        Ok(Self::register(
            self.inner.parent.clone(),
            nested_path,
            root,
            merged,
        ))
    }

    fn memory_parent(&self, operation: &'static str) -> Result<&MemoryBackend> {
        self.inner
            .parent
            .as_memory()
            .map(|memory| &**memory)
            .ok_or(BackendError::NotImplemented {
                operation,
                backend: self.inner.parent.backend_type(),
            })
    }

    /// Prefix of this scope's keys in the parent store; empty at the root.
    fn key_prefix(&self) -> String {
        match self.inner.scope_path.as_str() {
            "." => String::new(),
            path => format!("{path}/"),
        }
    }

    /// Removes one key of a memory scope. Missing keys are ignored.
    pub fn delete(&self, path: &str) -> Result<()> {
        let memory = self.memory_parent("delete")?;
        let target = self.to_parent_path(path)?;
        memory.delete(&target)
    }

    /// Removes every key of a memory scope, leaving the rest of the store.
    pub fn clear(&self) -> Result<()> {
        let memory = self.memory_parent("clear")?;
        for key in memory.list_keys(Some(&self.key_prefix())) {
            memory.delete(&key)?;
        }
        Ok(())
    }

    /// Sorted keys of a memory scope, relative to the scope and optionally
    /// filtered by a raw prefix.
    pub fn list_keys(&self, prefix: Option<&str>) -> Result<Vec<String>> {
        let memory = self.memory_parent("list_keys")?;
        let scope_prefix = self.key_prefix();
        let wanted = prefix.unwrap_or("");
        Ok(memory
            .list_keys(Some(&scope_prefix))
            .into_iter()
            .filter_map(|key| key.strip_prefix(scope_prefix.as_str()).map(str::to_string))
            .filter(|key| key.starts_with(wanted))
            .collect())
    }

    /// MCP transport rooted at this scope, tracked by the root backend.
    pub fn mcp_transport(&self) -> Arc<McpTransport> {
        create_transport(&self.inner.parent, Some(&self.inner.scope_path))
    }

    /// Rewrites a scope-relative (or scope-absolute) path into one relative
    /// to the parent root.
    fn to_parent_path(&self, path: &str) -> Result<String> {
        if path.starts_with('/') {
            if let Some(rest) = relative_to(&absolutize(path), &self.inner.root) {
                return Ok(if rest.is_empty() {
                    self.inner.scope_path.clone()
                } else {
                    join(&self.inner.scope_path, rest)
                });
            }
        }
        resolve_within(path, &self.inner.scope_path)
    }

    /// Creates the scope root once; concurrent first callers wait on the same
    /// attempt and a failed attempt is retried by the next caller.
    async fn ensure_root(&self) -> Result<()> {
        self.inner
            .root_ready
            .get_or_try_init(|| async {
                let parent = &self.inner.parent;
                let scope_path = &self.inner.scope_path;
                if !parent.exists(scope_path).await? {
                    parent.make_dir(scope_path, true).await?;
                }
                Ok::<(), BackendError>(())
            })
            .await?;
        Ok(())
    }

    fn record<T>(
        &self,
        kind: OperationKind,
        operand: &str,
        started: (chrono::DateTime<Utc>, Instant),
        result: &Result<T>,
        stdout: impl FnOnce(&T) -> Option<String>,
    ) {
        let Some(logger) = &self.inner.config.logger else {
            return;
        };
        if !should_log_operation(kind, logger.mode()) {
            return;
        }
        let outcome = match result {
            Ok(value) => Ok(stdout(value)),
            Err(e) => Err(e.to_string()),
        };
        let entry = OperationLogEntry::new(
            kind,
            self.inner.scope_path.clone(),
            operand,
            started.0,
            started.1.elapsed(),
            outcome,
        );
        let entry = match (kind, result) {
            (OperationKind::Exec, Ok(_)) => entry.with_process(0, None),
            (OperationKind::Exec, Err(BackendError::ExecFailed { exit_code, message, .. })) => {
                entry.with_process(*exit_code, Some(message.clone()))
            }
            _ => entry,
        };
        logger.log(entry);
    }
}

fn now() -> (chrono::DateTime<Utc>, Instant) {
    (Utc::now(), Instant::now())
}

#[async_trait]
impl FileBackend for Scope {
    fn backend_type(&self) -> BackendType {
        self.inner.parent.backend_type()
    }

    fn root(&self) -> &str {
        &self.inner.root
    }

    fn status(&self) -> ConnectionStatus {
        self.inner.parent.status()
    }

    fn subscribe(&self, listener: StatusListener) -> Subscription {
        self.inner.parent.subscribe(listener)
    }

    fn track_disposable(&self, resource: Arc<dyn Disposable>) {
        self.inner.parent.track_disposable(resource);
    }

    fn list_active_scopes(&self) -> Vec<String> {
        self.inner.parent.list_active_scopes()
    }

    fn on_child_destroyed(&self, scope_id: Uuid) {
        self.inner.parent.on_child_destroyed(scope_id);
    }

    /// Deregisters from the root backend. The parent is left untouched.
    async fn destroy(&self) -> Result<()> {
        self.inner.parent.on_child_destroyed(self.inner.id);
        Ok(())
    }

    async fn execute(&self, command: &str, options: ExecOptions) -> Result<Content> {
        let started = now();
        let result = async {
            // a caller cwd is confined to the scope like any other path
            let cwd = resolve_cwd(&self.inner.root, options.cwd.as_deref())?;
            self.ensure_root().await?;
            let mut env = self.inner.config.env.clone();
            env.extend(options.env);
            let scoped = ExecOptions {
                encoding: options.encoding,
                cwd: Some(cwd),
                env,
            };
            self.inner.parent.execute(command, scoped).await
        }
        .await;
        self.record(OperationKind::Exec, command, started, &result, |out| {
            Some(out.clone().into_text())
        });
        result
    }

    async fn read(&self, path: &str, options: ReadOptions) -> Result<Content> {
        let started = now();
        let result = async {
            let target = self.to_parent_path(path)?;
            self.inner.parent.read(&target, options).await
        }
        .await;
        self.record(OperationKind::Read, path, started, &result, |_| None);
        result
    }

    async fn write(&self, path: &str, content: Content) -> Result<()> {
        let started = now();
        let result = async {
            let target = self.to_parent_path(path)?;
            self.ensure_root().await?;
            self.inner.parent.write(&target, content).await
        }
        .await;
        self.record(OperationKind::Write, path, started, &result, |_| None);
        result
    }

    async fn rename(&self, from: &str, to: &str) -> Result<()> {
        let started = now();
        let result = async {
            let source = self.to_parent_path(from)?;
            let target = self.to_parent_path(to)?;
            self.ensure_root().await?;
            self.inner.parent.rename(&source, &target).await
        }
        .await;
        self.record(
            OperationKind::Rename,
            &format!("{from} -> {to}"),
            started,
            &result,
            |_| None,
        );
        result
    }

    async fn remove(&self, path: &str, options: RemoveOptions) -> Result<()> {
        let started = now();
        let result = async {
            let target = self.to_parent_path(path)?;
            self.inner.parent.remove(&target, options).await
        }
        .await;
        self.record(OperationKind::Remove, path, started, &result, |_| None);
        result
    }

    async fn list(&self, path: &str) -> Result<Vec<String>> {
        let started = now();
        let result = async {
            let target = self.to_parent_path(path)?;
            self.ensure_root().await?;
            self.inner.parent.list(&target).await
        }
        .await;
        self.record(OperationKind::ListDir, path, started, &result, |_| None);
        result
    }

    async fn make_dir(&self, path: &str, recursive: bool) -> Result<()> {
        let started = now();
        let result = async {
            let target = self.to_parent_path(path)?;
            self.ensure_root().await?;
            self.inner.parent.make_dir(&target, recursive).await
        }
        .await;
        self.record(OperationKind::MakeDir, path, started, &result, |_| None);
        result
    }

    async fn touch(&self, path: &str) -> Result<()> {
        let started = now();
        let result = async {
            let target = self.to_parent_path(path)?;
            self.ensure_root().await?;
            self.inner.parent.touch(&target).await
        }
        .await;
        self.record(OperationKind::Touch, path, started, &result, |_| None);
        result
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        let started = now();
        let result = async {
            let target = self.to_parent_path(path)?;
            self.inner.parent.exists(&target).await
        }
        .await;
        self.record(OperationKind::Exists, path, started, &result, |_| None);
        result
    }

    async fn stat(&self, path: &str) -> Result<FileStat> {
        let started = now();
        let result = async {
            let target = self.to_parent_path(path)?;
            self.inner.parent.stat(&target).await
        }
        .await;
        self.record(OperationKind::Stat, path, started, &result, |_| None);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{IsolationMode, LocalConfig, MemoryConfig};
    use crate::error::ErrorKind;
    use crate::oplog::{LoggingMode, MemoryOperationsLogger};
    use crate::backends::{LocalBackend, MemoryBackend};

    fn memory() -> Backend {
        Backend::from(MemoryBackend::new(MemoryConfig::default()).unwrap())
    }

    async fn local() -> (tempfile::TempDir, Backend) {
        let dir = tempfile::tempdir().unwrap();
        let mut config = LocalConfig::new(dir.path().to_string_lossy());
        config.isolation = IsolationMode::Software;
        let backend = Backend::from(LocalBackend::new(config).await.unwrap());
        (dir, backend)
    }

    // ── paths ───────────────────────────────────────────

    #[tokio::test]
    async fn test_scope_path_is_normalized() {
        let backend = memory();
        let scope = backend.scope("users/./alice/", ScopeConfig::default()).unwrap();
        assert_eq!(scope.scope_path(), "users/alice");
        assert_eq!(scope.root(), "/users/alice");
    }

    #[tokio::test]
    async fn test_scope_cannot_be_created_outside_parent() {
        let backend = memory();
        let err = backend.scope("../elsewhere", ScopeConfig::default()).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::PathEscape);
    }

    #[tokio::test]
    async fn test_writes_land_under_scope() {
        let backend = memory();
        let scope = backend.scope("users/alice", ScopeConfig::default()).unwrap();
        scope.write("notes.md", Content::from("hi")).await.unwrap();
        assert!(backend.exists("users/alice/notes.md").await.unwrap());
        assert_eq!(scope.list(".").await.unwrap(), vec!["notes.md"]);
    }

    #[tokio::test]
    async fn test_scope_escape_rejected() {
        let backend = memory();
        let scope = backend.scope("users/alice", ScopeConfig::default()).unwrap();
        let err = scope
            .write("../bob/steal.txt", Content::from("x"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PathEscape);
        assert!(!backend.exists("users/bob/steal.txt").await.unwrap());
    }

    #[tokio::test]
    async fn test_absolute_input_inside_scope_root_is_rewritten() {
        let backend = memory();
        let scope = backend.scope("users/alice", ScopeConfig::default()).unwrap();
        scope.write("/users/alice/a.txt", Content::from("1")).await.unwrap();
        // an absolute path outside the scope lands inside it
        scope.write("/users/bob/b.txt", Content::from("2")).await.unwrap();

        assert!(backend.exists("users/alice/a.txt").await.unwrap());
        assert!(backend.exists("users/alice/users/bob/b.txt").await.unwrap());
        assert!(!backend.exists("users/bob/b.txt").await.unwrap());
    }

    #[tokio::test]
    async fn test_nested_scope_composes_paths() {
        let backend = memory();
        let outer = backend.scope("p1", ScopeConfig::default()).unwrap();
        let inner = outer.scope("p2/", ScopeConfig::default()).unwrap();
        assert_eq!(inner.scope_path(), "p1/p2");

        inner.write("f.txt", Content::from("x")).await.unwrap();
        assert!(backend.exists("p1/p2/f.txt").await.unwrap());
        assert!(outer.exists("p2/f.txt").await.unwrap());

        assert!(outer.scope("../x", ScopeConfig::default()).is_err());
    }

    #[tokio::test]
    async fn test_memory_scope_key_helpers() {
        let backend = Backend::from(
            MemoryBackend::new(MemoryConfig {
                root: "/".to_string(),
                initial_data: [("users/alice/a.txt", "1"), ("users/alice/d/b.txt", "2"), ("users/bob/c.txt", "3")]
                    .into_iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            })
            .unwrap(),
        );
        let alice = backend.scope("users/alice", ScopeConfig::default()).unwrap();
        assert_eq!(alice.list_keys(None).unwrap(), vec!["a.txt", "d/b.txt"]);
        assert_eq!(alice.list_keys(Some("d/")).unwrap(), vec!["d/b.txt"]);

        alice.delete("a.txt").unwrap();
        alice.delete("a.txt").unwrap();
        assert_eq!(alice.list_keys(None).unwrap(), vec!["d/b.txt"]);

        alice.clear().unwrap();
        assert!(alice.list_keys(None).unwrap().is_empty());
        assert!(backend.exists("users/bob/c.txt").await.unwrap());
        assert!(alice.delete("../bob/c.txt").is_err());
    }

    #[tokio::test]
    async fn test_key_helpers_need_memory_parent() {
        let (_dir, backend) = local().await;
        let scope = backend.scope("proj", ScopeConfig::default()).unwrap();
        assert_eq!(scope.clear().unwrap_err().kind(), ErrorKind::NotImplemented);
    }

    // ── lifecycle ───────────────────────────────────────

    #[tokio::test]
    async fn test_scopes_registered_and_deregistered() {
        let backend = memory();
        let a = backend.scope("a", ScopeConfig::default()).unwrap();
        let b = a.scope("b", ScopeConfig::default()).unwrap();
        assert_eq!(backend.list_active_scopes(), vec!["a", "a/b"]);
        assert_eq!(b.list_active_scopes(), vec!["a", "a/b"]);

        a.destroy().await.unwrap();
        assert_eq!(backend.list_active_scopes(), vec!["a/b"]);
        assert_eq!(backend.status(), ConnectionStatus::Connected);

        backend.destroy().await.unwrap();
        assert!(backend.list_active_scopes().is_empty());
        assert_eq!(b.status(), ConnectionStatus::Destroyed);
    }

    // ── local ───────────────────────────────────────────

    #[tokio::test]
    async fn test_local_scope_root_created_lazily() {
        let (dir, backend) = local().await;
        let scope = backend.scope("proj", ScopeConfig::default()).unwrap();
        assert!(!dir.path().join("proj").exists());

        scope.touch("README.md").await.unwrap();
        assert!(dir.path().join("proj/README.md").is_file());
    }

    #[tokio::test]
    async fn test_local_scope_exec_runs_in_scope_with_env() {
        let (_dir, backend) = local().await;
        let scope = backend
            .scope("proj", ScopeConfig::default().with_env("STAGE", "scope"))
            .unwrap();

        let options = ExecOptions {
            env: [("EXTRA".to_string(), "call".to_string())].into_iter().collect(),
            ..Default::default()
        };
        let out = scope
            .execute("pwd; echo $STAGE $EXTRA", options)
            .await
            .unwrap()
            .into_text();
        let lines: Vec<&str> = out.lines().collect();
        assert!(lines[0].ends_with("/proj"), "{out}");
        assert_eq!(lines[1], "scope call");
    }

    #[tokio::test]
    async fn test_failed_exec_logs_exit_code_and_stderr() {
        let (_dir, backend) = local().await;
        let logger = Arc::new(MemoryOperationsLogger::new(LoggingMode::Standard));
        let scope = backend
            .scope("proj", ScopeConfig::default().with_logger(logger.clone()))
            .unwrap();

        scope.execute("true", ExecOptions::default()).await.unwrap();
        let _ = scope
            .execute("echo broken >&2; exit 3", ExecOptions::default())
            .await;

        let entries = logger.entries_by_kind(OperationKind::Exec);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].exit_code(), Some(0));
        assert_eq!(entries[1].exit_code(), Some(3));
        assert_eq!(entries[1].stderr(), Some("broken"));
        assert!(!entries[1].success());
    }

    #[tokio::test]
    async fn test_local_scope_exec_honors_cwd_inside_scope() {
        let (_dir, backend) = local().await;
        let scope = backend.scope("proj", ScopeConfig::default()).unwrap();
        scope.make_dir("src", true).await.unwrap();

        let in_src = ExecOptions {
            cwd: Some("src".to_string()),
            ..Default::default()
        };
        let out = scope.execute("pwd", in_src).await.unwrap().into_text();
        assert!(out.ends_with("/proj/src"), "{out}");

        let outside = ExecOptions {
            cwd: Some("../other".to_string()),
            ..Default::default()
        };
        let err = scope.execute("pwd", outside).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PathEscape);
    }

    #[tokio::test]
    async fn test_concurrent_first_writes_share_root_creation() {
        let (dir, backend) = local().await;
        let scope = backend.scope("shared", ScopeConfig::default()).unwrap();

        let writes = (0..8).map(|i| {
            let scope = scope.clone();
            async move { scope.write(&format!("f{i}.txt"), Content::from("x")).await }
        });
        for result in futures::future::join_all(writes).await {
            result.unwrap();
        }
        assert_eq!(std::fs::read_dir(dir.path().join("shared")).unwrap().count(), 8);
    }

    // ── config and logging ──────────────────────────────

    #[test]
    fn test_config_merge_child_wins() {
        let logger: Arc<dyn OperationsLogger> = Arc::new(MemoryOperationsLogger::new(LoggingMode::Standard));
        let parent = ScopeConfig::default()
            .with_env("A", "parent")
            .with_env("B", "parent")
            .with_logger(Arc::clone(&logger));
        let child = ScopeConfig::default().with_env("B", "child");

        let merged = ScopeConfig::merge(&parent, child);
        assert_eq!(merged.env["A"], "parent");
        assert_eq!(merged.env["B"], "child");
        assert!(merged.logger.is_some());
    }

    #[tokio::test]
    async fn test_operations_logged_per_mode() {
        let logger = Arc::new(MemoryOperationsLogger::new(LoggingMode::Standard));
        let backend = memory();
        let scope = backend
            .scope("ws", ScopeConfig::default().with_logger(logger.clone()))
            .unwrap();

        scope.write("a.txt", Content::from("x")).await.unwrap();
        scope.read("a.txt", ReadOptions::default()).await.unwrap();
        let _ = scope.write("../escape", Content::from("x")).await;

        let entries = logger.entries();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].kind(), OperationKind::Write);
        assert!(entries[0].success());
        assert_eq!(entries[0].scope_path(), "ws");
        assert!(!entries[1].success());
        assert!(entries[1].error().is_some_and(|e| e.contains("escape")));
    }
}
