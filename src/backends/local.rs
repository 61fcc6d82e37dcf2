//! Local filesystem + shell backend.
//!
//! The root is a real directory, created at construction. Commands run
//! through `bash -c` / `sh -c`, either directly or wrapped by an
//! [`IsolationLauncher`] when namespace isolation is active.

use std::io::ErrorKind as IoErrorKind;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::process::Command;
use tracing::{debug, info};
use uuid::Uuid;

use super::boundary::{normalize, resolve_within};
use super::isolation::{BubblewrapLauncher, IsolationLauncher};
use super::{
    finish_exec, resolve_cwd, BackendType, ConnectionStatus, Content, Disposable, Encoding,
    ExecOptions, FileBackend, FileStat, Lifecycle, ReadOptions, RemoveOptions, StatusListener,
    Subscription,
};
use crate::config::{IsolationMode, LocalConfig, ShellPreference};
use crate::error::{BackendError, Result};
use crate::safety::{DangerousHandler, SafetyPolicy};

pub struct LocalBackend {
    root: String,
    isolation: IsolationMode,
    shell: String,
    prevent_dangerous: bool,
    policy: SafetyPolicy,
    max_output_length: Option<usize>,
    on_dangerous: Option<DangerousHandler>,
    launcher: Arc<dyn IsolationLauncher>,
    lifecycle: Lifecycle,
}

impl LocalBackend {
    pub async fn new(config: LocalConfig) -> Result<Self> {
        Self::with_launcher(config, Arc::new(BubblewrapLauncher::new())).await
    }

    pub async fn with_launcher(
        config: LocalConfig,
        launcher: Arc<dyn IsolationLauncher>,
    ) -> Result<Self> {
        let root = absolute_root(&config.root)?;
        tokio::fs::create_dir_all(&root)
            .await
            .map_err(|e| BackendError::WriteFailed {
                path: root.clone(),
                message: e.to_string(),
            })?;

        let isolation = match config.isolation {
            IsolationMode::Auto if launcher.is_available() => IsolationMode::Namespace,
            IsolationMode::Auto => IsolationMode::Software,
            IsolationMode::Namespace if !launcher.is_available() => {
                return Err(BackendError::MissingUtilities {
                    utility: launcher.name().to_string(),
                });
            }
            other => other,
        };

        let shell = detect_shell(config.shell);
        if config.validate_utils && which::which(&shell).is_err() {
            return Err(BackendError::MissingUtilities { utility: shell });
        }

        let policy = SafetyPolicy::with_allowed(&config.allowed_commands)?;

        info!("Local backend ready at {root} (isolation: {isolation:?}, shell: {shell})");

        Ok(Self {
            root,
            isolation,
            shell,
            prevent_dangerous: config.prevent_dangerous,
            policy,
            max_output_length: config.max_output_length,
            on_dangerous: None,
            launcher,
            lifecycle: Lifecycle::new(ConnectionStatus::Connected),
        })
    }

    /// Intercepts dangerous commands with `handler` instead of failing them.
    pub fn with_dangerous_handler(mut self, handler: DangerousHandler) -> Self {
        self.on_dangerous = Some(handler);
        self
    }

    /// Effective isolation after auto-detection.
    pub fn isolation(&self) -> IsolationMode {
        self.isolation
    }

    pub fn shell(&self) -> &str {
        &self.shell
    }

    pub(crate) fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    fn resolve(&self, path: &str) -> Result<String> {
        resolve_within(path, &self.root)
    }

    async fn ensure_parent(&self, full: &str, path: &str) -> Result<()> {
        if let Some(parent) = Path::new(full).parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| BackendError::WriteFailed {
                    path: path.to_string(),
                    message: e.to_string(),
                })?;
        }
        Ok(())
    }
}

fn absolute_root(root: &str) -> Result<String> {
    let absolute = std::path::absolute(root)
        .map_err(|e| BackendError::invalid_config(format!("invalid root '{root}': {e}")))?;
    Ok(normalize(&absolute.to_string_lossy()))
}

fn detect_shell(preference: ShellPreference) -> String {
    match preference {
        ShellPreference::Bash => "bash".to_string(),
        ShellPreference::Sh => "sh".to_string(),
        ShellPreference::Auto if which::which("bash").is_ok() => "bash".to_string(),
        ShellPreference::Auto => "sh".to_string(),
    }
}

fn empty_output(encoding: Encoding) -> Content {
    match encoding {
        Encoding::Text => Content::Text(String::new()),
        Encoding::Binary => Content::Binary(Vec::new()),
    }
}

#[async_trait]
impl FileBackend for LocalBackend {
    fn backend_type(&self) -> BackendType {
        BackendType::Local
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

    async fn destroy(&self) -> Result<()> {
        if self.lifecycle.destroy().await {
            info!("Local backend at {} destroyed", self.root);
        }
        Ok(())
    }

    async fn execute(&self, command: &str, options: ExecOptions) -> Result<Content> {
        if command.trim().is_empty() {
            return Err(BackendError::EmptyCommand);
        }
        if self.prevent_dangerous && self.policy.enforce(command, self.on_dangerous.as_ref())? {
            return Ok(empty_output(options.encoding));
        }

        let cwd = resolve_cwd(&self.root, options.cwd.as_deref())?;
        let shell_argv = vec![self.shell.clone(), "-c".to_string(), command.to_string()];

        let (argv, home) = if self.isolation == IsolationMode::Namespace {
            let home = self.launcher.sandbox_path(&self.root, &cwd);
            (self.launcher.wrap(shell_argv, &self.root, &cwd), home)
        } else {
            (shell_argv, cwd.clone())
        };

        debug!("exec in {cwd}: {command}");

        let mut process = Command::new(&argv[0]);
        process
            .args(&argv[1..])
            .env("HOME", &home)
            .envs(&options.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if self.isolation != IsolationMode::Namespace {
            process.current_dir(&cwd);
        }

        let output = process
            .output()
            .await
            .map_err(|e| BackendError::ExecFailed {
                command: command.to_string(),
                exit_code: -1,
                message: format!("failed to spawn {}: {e}", argv[0]),
            })?;

        finish_exec(
            command,
            output.status.code().unwrap_or(-1),
            output.stdout,
            &output.stderr,
            options.encoding,
            self.max_output_length,
        )
    }

    async fn read(&self, path: &str, options: ReadOptions) -> Result<Content> {
        let full = self.resolve(path)?;
        let read_failed = |e: std::io::Error| BackendError::ReadFailed {
            path: path.to_string(),
            message: e.to_string(),
        };
        match options.encoding {
            Encoding::Binary => Ok(Content::Binary(tokio::fs::read(&full).await.map_err(read_failed)?)),
            Encoding::Text => Ok(Content::Text(
                tokio::fs::read_to_string(&full).await.map_err(read_failed)?,
            )),
        }
    }

    async fn write(&self, path: &str, content: Content) -> Result<()> {
        let full = self.resolve(path)?;
        self.ensure_parent(&full, path).await?;
        tokio::fs::write(&full, content.as_bytes())
            .await
            .map_err(|e| BackendError::WriteFailed {
                path: path.to_string(),
                message: e.to_string(),
            })
    }

    async fn rename(&self, from: &str, to: &str) -> Result<()> {
        let full_from = self.resolve(from)?;
        let full_to = self.resolve(to)?;
        self.ensure_parent(&full_to, to).await?;
        tokio::fs::rename(&full_from, &full_to)
            .await
            .map_err(|e| BackendError::WriteFailed {
                path: from.to_string(),
                message: format!("rename to {to} failed: {e}"),
            })
    }

    async fn remove(&self, path: &str, options: RemoveOptions) -> Result<()> {
        let full = self.resolve(path)?;
        let write_failed = |message: String| BackendError::WriteFailed {
            path: path.to_string(),
            message,
        };
        if full == self.root {
            return Err(write_failed("refusing to remove the backend root".to_string()));
        }

        let metadata = match tokio::fs::symlink_metadata(&full).await {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == IoErrorKind::NotFound => {
                if options.force {
                    return Ok(());
                }
                return Err(write_failed("File not found".to_string()));
            }
            Err(e) => return Err(write_failed(e.to_string())),
        };

        let result = if metadata.is_dir() {
            if options.recursive {
                tokio::fs::remove_dir_all(&full).await
            } else {
                tokio::fs::remove_dir(&full).await
            }
        } else {
            tokio::fs::remove_file(&full).await
        };

        match result {
            Ok(()) => Ok(()),
            // raced with another remover
            Err(e) if e.kind() == IoErrorKind::NotFound && options.force => Ok(()),
            Err(e) => Err(write_failed(e.to_string())),
        }
    }

    async fn list(&self, path: &str) -> Result<Vec<String>> {
        let full = self.resolve(path)?;
        let list_failed = |e: std::io::Error| BackendError::ListFailed {
            path: path.to_string(),
            message: e.to_string(),
        };

        let mut entries = tokio::fs::read_dir(&full).await.map_err(list_failed)?;
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(list_failed)? {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        names.sort();
        Ok(names)
    }

    async fn make_dir(&self, path: &str, recursive: bool) -> Result<()> {
        let full = self.resolve(path)?;
        let result = if recursive {
            tokio::fs::create_dir_all(&full).await
        } else {
            tokio::fs::create_dir(&full).await
        };
        result.map_err(|e| BackendError::WriteFailed {
            path: path.to_string(),
            message: e.to_string(),
        })
    }

    async fn touch(&self, path: &str) -> Result<()> {
        let full = self.resolve(path)?;
        self.ensure_parent(&full, path).await?;
        let write_failed = |e: std::io::Error| BackendError::WriteFailed {
            path: path.to_string(),
            message: e.to_string(),
        };

        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&full)
            .await
            .map_err(write_failed)?;
        file.into_std()
            .await
            .set_modified(SystemTime::now())
            .map_err(write_failed)
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        let full = self.resolve(path)?;
        Ok(tokio::fs::try_exists(&full).await.unwrap_or(false))
    }

    async fn stat(&self, path: &str) -> Result<FileStat> {
        let full = self.resolve(path)?;
        let read_failed = |e: std::io::Error| BackendError::ReadFailed {
            path: path.to_string(),
            message: e.to_string(),
        };
        let metadata = tokio::fs::metadata(&full).await.map_err(read_failed)?;
        let modified = metadata.modified().map_err(read_failed)?;
        Ok(FileStat {
            is_file: metadata.is_file(),
            is_directory: metadata.is_dir(),
            size: metadata.len(),
            modified: DateTime::<Utc>::from(modified),
        })
    }
}
