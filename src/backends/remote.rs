//! Remote backend over a [`RemoteTransport`] session.
//!
//! Paths are validated and commands screened locally, before anything goes
//! over the wire. The transport (SSH, websocket tunnel...) is a collaborator:
//! this module only owns the connection lifecycle.
//!
//! Lifecycle: starts `Disconnected` and connects lazily on the first
//! operation (`Connecting` -> `Connected`). A retriable transport failure
//! drops the backend to `Disconnected` and is returned to the caller; the
//! next operation re-establishes the session through `Reconnecting` with
//! capped exponential backoff, ending in `Disconnected` once retries run out.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::boundary::{absolutize, resolve_within};
use super::{
    finish_exec, resolve_cwd, BackendType, ConnectionStatus, Content, Disposable, ExecOptions,
    FileBackend, FileStat, Lifecycle, ReadOptions, RemoveOptions, StatusListener, Subscription,
};
use crate::backoff::Backoff;
use crate::config::RemoteConfig;
use crate::error::{BackendError, Result};
use crate::safety::SafetyPolicy;

/// Failure reported by a transport.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Network-level failure (connection reset, channel closed...).
    #[error("transport failure: {0}")]
    Transient(String),

    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    /// The remote side executed the request and reported a typed failure.
    #[error(transparent)]
    Remote(#[from] BackendError),

    /// Permanent failure (authentication, protocol mismatch...).
    #[error("{0}")]
    Fatal(String),
}

impl TransportError {
    /// Whether the session should be considered lost.
    pub fn is_retriable(&self) -> bool {
        matches!(self, TransportError::Transient(_) | TransportError::Timeout(_))
    }
}

/// Completed remote process.
#[derive(Debug, Clone, Default)]
pub struct ExecOutput {
    pub exit_code: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

/// Session to a remote agent daemon. All paths given to it are absolute and
/// already validated against the backend root.
#[async_trait]
pub trait RemoteTransport: Send + Sync {
    async fn connect(&self, config: &RemoteConfig) -> Result<(), TransportError>;
    async fn close(&self) -> Result<(), TransportError>;
    async fn run(
        &self,
        command: &str,
        cwd: &str,
        env: &HashMap<String, String>,
    ) -> Result<ExecOutput, TransportError>;
    async fn read_file(&self, path: &str) -> Result<Vec<u8>, TransportError>;
    async fn write_file(&self, path: &str, data: &[u8]) -> Result<(), TransportError>;
    async fn rename(&self, from: &str, to: &str) -> Result<(), TransportError>;
    async fn remove(&self, path: &str, options: RemoveOptions) -> Result<(), TransportError>;
    async fn list_dir(&self, path: &str) -> Result<Vec<String>, TransportError>;
    async fn make_dir(&self, path: &str, recursive: bool) -> Result<(), TransportError>;
    async fn touch(&self, path: &str) -> Result<(), TransportError>;
    async fn exists(&self, path: &str) -> Result<bool, TransportError>;
    async fn stat(&self, path: &str) -> Result<FileStat, TransportError>;
}

pub struct RemoteBackend {
    root: String,
    config: RemoteConfig,
    transport: Arc<dyn RemoteTransport>,
    policy: SafetyPolicy,
    lifecycle: Lifecycle,
    /// Serializes connection attempts; holds the reconnection schedule.
    session: AsyncMutex<Backoff>,
    ever_connected: AtomicBool,
}

impl RemoteBackend {
    pub fn new(config: RemoteConfig, transport: Arc<dyn RemoteTransport>) -> Self {
        let backoff = Backoff::from_config(&config.reconnection);
        Self {
            root: absolutize(&config.root),
            config,
            transport,
            policy: SafetyPolicy::new(),
            lifecycle: Lifecycle::new(ConnectionStatus::Disconnected),
            session: AsyncMutex::new(backoff),
            ever_connected: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &RemoteConfig {
        &self.config
    }

    pub(crate) fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    fn set_status(&self, to: ConnectionStatus, error: Option<String>) {
        self.lifecycle.status_manager().set_status(to, error);
    }

    /// Establishes the session if needed. Cheap when already connected.
    pub async fn connect(&self) -> Result<()> {
        if self.status() == ConnectionStatus::Connected {
            return Ok(());
        }
        let mut backoff = self.session.lock().await;

        match self.status() {
            ConnectionStatus::Connected => Ok(()),
            ConnectionStatus::Destroyed => Err(BackendError::ConnectionClosed {
                message: "backend destroyed".to_string(),
            }),
            _ if !self.ever_connected.load(Ordering::SeqCst) => self.first_connect(&mut backoff).await,
            _ if self.config.reconnection.enabled => self.reconnect(&mut backoff).await,
            _ => Err(BackendError::ConnectionClosed {
                message: "connection lost and reconnection is disabled".to_string(),
            }),
        }
    }

    async fn first_connect(&self, backoff: &mut Backoff) -> Result<()> {
        self.set_status(ConnectionStatus::Connecting, None);
        match self.timed(self.transport.connect(&self.config)).await {
            Ok(()) => {
                self.connected(backoff);
                Ok(())
            }
            Err(e) => {
                warn!("Connection to {}:{} failed: {e}", self.config.host, self.config.port);
                self.set_status(ConnectionStatus::Disconnected, Some(e.to_string()));
                Err(connect_error(e))
            }
        }
    }

    async fn reconnect(&self, backoff: &mut Backoff) -> Result<()> {
        let max_retries = self.config.reconnection.max_retries;
        self.set_status(ConnectionStatus::Reconnecting, None);

        loop {
            let error = match self.timed(self.transport.connect(&self.config)).await {
                Ok(()) => {
                    info!("Reconnected to {}:{}", self.config.host, self.config.port);
                    self.connected(backoff);
                    return Ok(());
                }
                Err(e) => e,
            };

            if !error.is_retriable() {
                self.set_status(ConnectionStatus::Disconnected, Some(error.to_string()));
                return Err(connect_error(error));
            }
            if backoff.exceeded_max_attempts(max_retries) {
                let message = format!(
                    "reconnection failed after {} attempts: {error}",
                    backoff.attempt() + 1
                );
                warn!("{message}");
                self.set_status(ConnectionStatus::Disconnected, Some(message.clone()));
                backoff.reset();
                return Err(BackendError::ConnectionClosed { message });
            }

            let delay = backoff.next_delay();
            warn!(
                "Reconnect attempt {} failed: {error}. Retrying in {delay:?}",
                backoff.attempt()
            );
            tokio::time::sleep(delay).await;
        }
    }

    fn connected(&self, backoff: &mut Backoff) {
        backoff.reset();
        self.ever_connected.store(true, Ordering::SeqCst);
        self.set_status(ConnectionStatus::Connected, None);
    }

    async fn timed<T>(
        &self,
        call: impl Future<Output = Result<T, TransportError>>,
    ) -> Result<T, TransportError> {
        match self.config.operation_timeout() {
            Some(limit) => tokio::time::timeout(limit, call)
                .await
                .unwrap_or(Err(TransportError::Timeout(limit))),
            None => call.await,
        }
    }

    /// Maps a transport outcome onto the contract. A lost session marks the
    /// backend disconnected; the call itself is not retried.
    fn settle<T>(
        &self,
        result: Result<T, TransportError>,
        failure: impl FnOnce(String) -> BackendError,
    ) -> Result<T> {
        match result {
            Ok(value) => Ok(value),
            Err(TransportError::Remote(e)) => Err(e),
            Err(TransportError::Fatal(message)) => Err(failure(message)),
            Err(e) => {
                let message = e.to_string();
                warn!("Remote session lost: {message}");
                self.set_status(ConnectionStatus::Disconnected, Some(message.clone()));
                Err(BackendError::ConnectionClosed { message })
            }
        }
    }

    fn resolve(&self, path: &str) -> Result<String> {
        resolve_within(path, &self.root)
    }
}

fn connect_error(error: TransportError) -> BackendError {
    match error {
        TransportError::Remote(e) => e,
        other => BackendError::ConnectionClosed {
            message: other.to_string(),
        },
    }
}

fn read_failed(path: &str) -> impl FnOnce(String) -> BackendError + '_ {
    move |message| BackendError::ReadFailed {
        path: path.to_string(),
        message,
    }
}

fn write_failed(path: &str) -> impl FnOnce(String) -> BackendError + '_ {
    move |message| BackendError::WriteFailed {
        path: path.to_string(),
        message,
    }
}

#[async_trait]
impl FileBackend for RemoteBackend {
    fn backend_type(&self) -> BackendType {
        BackendType::Remote
    }

    fn root(&self) -> &str {
        &self.root
    }

    fn status(&self) -> ConnectionStatus {
        self.lifecycle.status()
    }

    fn subscribe(&self, listener: StatusListener) -> Subscription {
        self.lifecycle.subscribe(listener)
    }

    fn track_disposable(&self, resource: Arc<dyn Disposable>) {
        self.lifecycle.track(resource);
    }

    fn list_active_scopes(&self) -> Vec<String> {
        self.lifecycle.active_scopes()
    }

    fn on_child_destroyed(&self, scope_id: Uuid) {
        self.lifecycle.deregister_scope(scope_id);
    }

    /// Completes the terminal transition even when closing the session
    /// fails; the close error is returned afterwards.
    async fn destroy(&self) -> Result<()> {
        let _session = self.session.lock().await;
        if !self.lifecycle.destroy().await {
            return Ok(());
        }
        info!("Remote backend {}:{} destroyed", self.config.host, self.config.port);

        if !self.ever_connected.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.transport
            .close()
            .await
            .map_err(|e| BackendError::ConnectionClosed {
                message: format!("failed to close session: {e}"),
            })
    }

    async fn execute(&self, command: &str, options: ExecOptions) -> Result<Content> {
        if command.trim().is_empty() {
            return Err(BackendError::EmptyCommand);
        }
        if self.config.prevent_dangerous {
            self.policy.enforce(command, None)?;
        }
        let cwd = resolve_cwd(&self.root, options.cwd.as_deref())?;
        let mut env = options.env;
        env.entry("HOME".to_string()).or_insert_with(|| cwd.clone());

        self.connect().await?;
        debug!("remote exec in {cwd}: {command}");
        let result = self.timed(self.transport.run(command, &cwd, &env)).await;
        let output = self.settle(result, |message| BackendError::ExecFailed {
            command: command.to_string(),
            exit_code: -1,
            message,
        })?;

        finish_exec(
            command,
            output.exit_code,
            output.stdout,
            &output.stderr,
            options.encoding,
            self.config.max_output_length,
        )
    }

    async fn read(&self, path: &str, options: ReadOptions) -> Result<Content> {
        let full = self.resolve(path)?;
        self.connect().await?;
        let result = self.timed(self.transport.read_file(&full)).await;
        let bytes = self.settle(result, read_failed(path))?;
        Ok(Content::Binary(bytes).with_encoding(options.encoding))
    }

    async fn write(&self, path: &str, content: Content) -> Result<()> {
        let full = self.resolve(path)?;
        self.connect().await?;
        let result = self.timed(self.transport.write_file(&full, content.as_bytes())).await;
        self.settle(result, write_failed(path))
    }

    async fn rename(&self, from: &str, to: &str) -> Result<()> {
        let full_from = self.resolve(from)?;
        let full_to = self.resolve(to)?;
        self.connect().await?;
        let result = self.timed(self.transport.rename(&full_from, &full_to)).await;
        self.settle(result, write_failed(from))
    }

    async fn remove(&self, path: &str, options: RemoveOptions) -> Result<()> {
        let full = self.resolve(path)?;
        self.connect().await?;
        let result = self.timed(self.transport.remove(&full, options)).await;
        self.settle(result, write_failed(path))
    }

    async fn list(&self, path: &str) -> Result<Vec<String>> {
        let full = self.resolve(path)?;
        self.connect().await?;
        let result = self.timed(self.transport.list_dir(&full)).await;
        let mut names = self.settle(result, |message| BackendError::ListFailed {
            path: path.to_string(),
            message,
        })?;
        names.sort();
        Ok(names)
    }

    async fn make_dir(&self, path: &str, recursive: bool) -> Result<()> {
        let full = self.resolve(path)?;
        self.connect().await?;
        let result = self.timed(self.transport.make_dir(&full, recursive)).await;
        self.settle(result, write_failed(path))
    }

    async fn touch(&self, path: &str) -> Result<()> {
        let full = self.resolve(path)?;
        self.connect().await?;
        let result = self.timed(self.transport.touch(&full)).await;
        self.settle(result, write_failed(path))
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        let full = self.resolve(path)?;
        self.connect().await?;
        let result = self.timed(self.transport.exists(&full)).await;
        self.settle(result, read_failed(path))
    }

    async fn stat(&self, path: &str) -> Result<FileStat> {
        let full = self.resolve(path)?;
        self.connect().await?;
        let result = self.timed(self.transport.stat(&full)).await;
        self.settle(result, read_failed(path))
    }
}
