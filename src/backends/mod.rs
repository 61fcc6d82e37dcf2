pub mod boundary;
pub mod isolation;
pub mod local;
pub mod mcp;
pub mod memory;
pub mod remote;
pub mod scoped;
pub mod status;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::BackendConfig;
use crate::error::{BackendError, Result};

pub use local::LocalBackend;
pub use mcp::{McpLaunch, McpTransport};
pub use memory::MemoryBackend;
pub use remote::{ExecOutput, RemoteBackend, RemoteTransport, TransportError};
pub use scoped::{Scope, ScopeConfig};
pub use status::{ConnectionStatus, StatusChangeEvent, StatusListener, StatusManager, Subscription};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendType {
    Local,
    Memory,
    Remote,
}

impl std::fmt::Display for BackendType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            BackendType::Local => "local",
            BackendType::Memory => "memory",
            BackendType::Remote => "remote",
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Encoding {
    #[default]
    Text,
    Binary,
}

/// File payload or command output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Content {
    Text(String),
    Binary(Vec<u8>),
}

impl Content {
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Content::Text(text) => text.as_bytes(),
            Content::Binary(bytes) => bytes,
        }
    }

    pub fn into_bytes(self) -> Vec<u8> {
        match self {
            Content::Text(text) => text.into_bytes(),
            Content::Binary(bytes) => bytes,
        }
    }

    /// Text view; binary payloads are decoded lossily.
    pub fn into_text(self) -> String {
        match self {
            Content::Text(text) => text,
            Content::Binary(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Content::Text(text) => Some(text),
            Content::Binary(_) => None,
        }
    }

    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.as_bytes().is_empty()
    }

    /// Re-encodes into the requested representation.
    pub fn with_encoding(self, encoding: Encoding) -> Content {
        match encoding {
            Encoding::Text => Content::Text(self.into_text()),
            Encoding::Binary => Content::Binary(self.into_bytes()),
        }
    }
}

impl From<&str> for Content {
    fn from(text: &str) -> Self {
        Content::Text(text.to_string())
    }
}

impl From<String> for Content {
    fn from(text: String) -> Self {
        Content::Text(text)
    }
}

impl From<Vec<u8>> for Content {
    fn from(bytes: Vec<u8>) -> Self {
        Content::Binary(bytes)
    }
}

#[derive(Debug, Clone, Default)]
pub struct ExecOptions {
    pub encoding: Encoding,
    /// Working directory; must resolve inside the backend root.
    pub cwd: Option<String>,
    pub env: HashMap<String, String>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ReadOptions {
    pub encoding: Encoding,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RemoveOptions {
    pub recursive: bool,
    /// Missing paths are not an error.
    pub force: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileStat {
    pub is_file: bool,
    pub is_directory: bool,
    pub size: u64,
    pub modified: DateTime<Utc>,
}

/// A resource whose lifetime is bound to a backend (MCP client, tunnel...).
/// Disposed when the owning backend is destroyed; failures are logged.
#[async_trait]
pub trait Disposable: Send + Sync {
    async fn dispose(&self) -> anyhow::Result<()>;
}

/// The uniform contract every backend variant and every scope satisfies.
///
/// Path-taking operations resolve their operand inside [`FileBackend::root`]
/// before touching storage, so a rejected path never causes a side effect.
#[async_trait]
pub trait FileBackend: Send + Sync {
    fn backend_type(&self) -> BackendType;

    /// Absolute boundary of this backend or scope.
    fn root(&self) -> &str;

    fn status(&self) -> ConnectionStatus;

    fn subscribe(&self, listener: StatusListener) -> Subscription;

    fn track_disposable(&self, resource: Arc<dyn Disposable>);

    /// Scope paths registered at the root backend, in registration order.
    fn list_active_scopes(&self) -> Vec<String>;

    fn on_child_destroyed(&self, scope_id: Uuid);

    /// Idempotent. Scopes only deregister themselves; root backends dispose
    /// tracked resources, detach scopes and move to `Destroyed`.
    async fn destroy(&self) -> Result<()>;

    async fn execute(&self, command: &str, options: ExecOptions) -> Result<Content>;

    async fn read(&self, path: &str, options: ReadOptions) -> Result<Content>;

    async fn write(&self, path: &str, content: Content) -> Result<()>;

    async fn rename(&self, from: &str, to: &str) -> Result<()>;

    async fn remove(&self, path: &str, options: RemoveOptions) -> Result<()>;

    async fn list(&self, path: &str) -> Result<Vec<String>>;

    async fn make_dir(&self, path: &str, recursive: bool) -> Result<()>;

    async fn touch(&self, path: &str) -> Result<()>;

    async fn exists(&self, path: &str) -> Result<bool>;

    async fn stat(&self, path: &str) -> Result<FileStat>;
}

const TRUNCATION_RESERVE: usize = 50;

/// Working directory for `execute`: the root when unset, an absolute path
/// only if already inside the root, a relative path resolved against it.
pub(crate) fn resolve_cwd(root: &str, cwd: Option<&str>) -> Result<String> {
    match cwd {
        None | Some("") => Ok(root.to_string()),
        Some(dir) if dir.starts_with(boundary::SEPARATOR) => {
            boundary::assert_absolute_within(dir, root)?;
            Ok(boundary::normalize(dir))
        }
        Some(dir) => boundary::resolve_within(dir, root),
    }
}

/// Caps text output at `max` characters, replacing the tail with a marker
/// that states the original length.
pub(crate) fn truncate_output(output: String, max: Option<usize>) -> String {
    let Some(max) = max else {
        return output;
    };
    let total = output.chars().count();
    if total <= max {
        return output;
    }
    let keep = max.saturating_sub(TRUNCATION_RESERVE);
    let head: String = output.chars().take(keep).collect();
    format!(
        "{head}\n\n... [Output truncated. Full output was {total} characters, showing first {keep}]"
    )
}

/// Shapes a finished process into the contract's output or `ExecFailed`.
pub(crate) fn finish_exec(
    command: &str,
    exit_code: i32,
    stdout: Vec<u8>,
    stderr: &[u8],
    encoding: Encoding,
    max_output_length: Option<usize>,
) -> Result<Content> {
    if exit_code != 0 {
        let stderr = String::from_utf8_lossy(stderr).trim().to_string();
        let message = if stderr.is_empty() {
            String::from_utf8_lossy(&stdout).trim().to_string()
        } else {
            stderr
        };
        return Err(BackendError::ExecFailed {
            command: command.to_string(),
            exit_code,
            message,
        });
    }

    Ok(match encoding {
        Encoding::Binary => Content::Binary(stdout),
        Encoding::Text => {
            let text = String::from_utf8_lossy(&stdout).trim().to_string();
            Content::Text(truncate_output(text, max_output_length))
        }
    })
}

/// State every root backend shares: status, tracked resources, scopes.
pub(crate) struct Lifecycle {
    status: StatusManager,
    disposables: Mutex<Vec<Arc<dyn Disposable>>>,
    scopes: Mutex<Vec<(Uuid, String)>>,
}

impl Lifecycle {
    pub(crate) fn new(initial: ConnectionStatus) -> Self {
        Self {
            status: StatusManager::new(initial),
            disposables: Mutex::new(Vec::new()),
            scopes: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn status_manager(&self) -> &StatusManager {
        &self.status
    }

    pub(crate) fn status(&self) -> ConnectionStatus {
        self.status.status()
    }

    pub(crate) fn subscribe(&self, listener: StatusListener) -> Subscription {
        self.status.subscribe(listener)
    }

    pub(crate) fn track(&self, resource: Arc<dyn Disposable>) {
        self.disposables.lock().push(resource);
    }

    pub(crate) fn register_scope(&self, id: Uuid, scope_path: String) {
        self.scopes.lock().push((id, scope_path));
    }

    pub(crate) fn deregister_scope(&self, id: Uuid) {
        self.scopes.lock().retain(|(scope_id, _)| *scope_id != id);
    }

    pub(crate) fn active_scopes(&self) -> Vec<String> {
        self.scopes.lock().iter().map(|(_, path)| path.clone()).collect()
    }

    pub(crate) fn is_destroyed(&self) -> bool {
        self.status() == ConnectionStatus::Destroyed
    }

    /// Disposes tracked resources, detaches scopes and performs the terminal
    /// transition. Returns `false` if already destroyed.
    pub(crate) async fn destroy(&self) -> bool {
        if self.is_destroyed() {
            return false;
        }

        let disposables: Vec<_> = std::mem::take(&mut *self.disposables.lock());
        for resource in disposables {
            if let Err(e) = resource.dispose().await {
                warn!("Failed to dispose tracked resource: {e:#}");
            }
        }

        self.scopes.lock().clear();
        self.status.destroy();
        true
    }
}

/// A backend instance of one of the known kinds.
///
/// Cloning is cheap and yields a handle to the same instance.
#[derive(Clone)]
pub enum Backend {
    Local(Arc<LocalBackend>),
    Memory(Arc<MemoryBackend>),
    Remote(Arc<RemoteBackend>),
}

macro_rules! dispatch {
    ($self:ident, $b:ident => $call:expr) => {
        match $self {
            Backend::Local($b) => $call,
            Backend::Memory($b) => $call,
            Backend::Remote($b) => $call,
        }
    };
}

impl Backend {
    /// Builds a local or memory backend from configuration. Remote backends
    /// need a transport and are built with [`RemoteBackend::new`].
    pub async fn from_config(config: &BackendConfig) -> Result<Self> {
        match config {
            BackendConfig::Local(local) => {
                Ok(Backend::Local(Arc::new(LocalBackend::new(local.clone()).await?)))
            }
            BackendConfig::Memory(memory) => {
                Ok(Backend::Memory(Arc::new(MemoryBackend::new(memory.clone())?)))
            }
            BackendConfig::Remote(_) => Err(BackendError::invalid_config(
                "remote backends require a transport; construct them with RemoteBackend::new",
            )),
        }
    }

    /// Restricted view of this backend confined to `path`.
    pub fn scope(&self, path: &str, config: ScopeConfig) -> Result<Scope> {
        Scope::new(self.clone(), path, config)
    }

    /// MCP transport serving this backend, closed when the backend is
    /// destroyed.
    pub fn mcp_transport(&self) -> Arc<McpTransport> {
        mcp::create_transport(self, None)
    }

    /// True when both handles point at the same instance.
    pub fn ptr_eq(&self, other: &Backend) -> bool {
        match (self, other) {
            (Backend::Local(a), Backend::Local(b)) => Arc::ptr_eq(a, b),
            (Backend::Memory(a), Backend::Memory(b)) => Arc::ptr_eq(a, b),
            (Backend::Remote(a), Backend::Remote(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }

    pub fn as_local(&self) -> Option<&Arc<LocalBackend>> {
        match self {
            Backend::Local(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_memory(&self) -> Option<&Arc<MemoryBackend>> {
        match self {
            Backend::Memory(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_remote(&self) -> Option<&Arc<RemoteBackend>> {
        match self {
            Backend::Remote(b) => Some(b),
            _ => None,
        }
    }

    pub(crate) fn lifecycle(&self) -> &Lifecycle {
        dispatch!(self, b => b.lifecycle())
    }
}

impl From<LocalBackend> for Backend {
    fn from(backend: LocalBackend) -> Self {
        Backend::Local(Arc::new(backend))
    }
}

impl From<MemoryBackend> for Backend {
    fn from(backend: MemoryBackend) -> Self {
        Backend::Memory(Arc::new(backend))
    }
}

impl From<RemoteBackend> for Backend {
    fn from(backend: RemoteBackend) -> Self {
        Backend::Remote(Arc::new(backend))
    }
}

#[async_trait]
impl FileBackend for Backend {
    fn backend_type(&self) -> BackendType {
        match self {
            Backend::Local(_) => BackendType::Local,
            Backend::Memory(_) => BackendType::Memory,
            Backend::Remote(_) => BackendType::Remote,
        }
    }

    fn root(&self) -> &str {
        dispatch!(self, b => b.root())
    }

    fn status(&self) -> ConnectionStatus {
        dispatch!(self, b => b.status())
    }

    fn subscribe(&self, listener: StatusListener) -> Subscription {
        dispatch!(self, b => b.subscribe(listener))
    }

    fn track_disposable(&self, resource: Arc<dyn Disposable>) {
        dispatch!(self, b => b.track_disposable(resource))
    }

    fn list_active_scopes(&self) -> Vec<String> {
        dispatch!(self, b => b.list_active_scopes())
    }

    fn on_child_destroyed(&self, scope_id: Uuid) {
        debug!("Scope {scope_id} detached from {} backend", self.backend_type());
        dispatch!(self, b => b.on_child_destroyed(scope_id))
    }

    async fn destroy(&self) -> Result<()> {
        dispatch!(self, b => b.destroy().await)
    }

    async fn execute(&self, command: &str, options: ExecOptions) -> Result<Content> {
        dispatch!(self, b => b.execute(command, options).await)
    }

    async fn read(&self, path: &str, options: ReadOptions) -> Result<Content> {
        dispatch!(self, b => b.read(path, options).await)
    }

    async fn write(&self, path: &str, content: Content) -> Result<()> {
        dispatch!(self, b => b.write(path, content).await)
    }

    async fn rename(&self, from: &str, to: &str) -> Result<()> {
        dispatch!(self, b => b.rename(from, to).await)
    }

    async fn remove(&self, path: &str, options: RemoveOptions) -> Result<()> {
        dispatch!(self, b => b.remove(path, options).await)
    }

    async fn list(&self, path: &str) -> Result<Vec<String>> {
        dispatch!(self, b => b.list(path).await)
    }

    async fn make_dir(&self, path: &str, recursive: bool) -> Result<()> {
        dispatch!(self, b => b.make_dir(path, recursive).await)
    }

    async fn touch(&self, path: &str) -> Result<()> {
        dispatch!(self, b => b.touch(path).await)
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        dispatch!(self, b => b.exists(path).await)
    }

    async fn stat(&self, path: &str) -> Result<FileStat> {
        dispatch!(self, b => b.stat(path).await)
    }
}
