//! MCP transports bound to a backend.
//!
//! Local and memory backends are served by an `agent-backend` daemon
//! spawned over stdio and rooted at the backend (or scope) root. Remote
//! backends expose MCP over HTTP on the daemon host. Every transport is
//! tracked by its backend and closed when the backend is destroyed.

use std::collections::BTreeMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tracing::{debug, info};

use super::boundary::normalize;
use super::{Backend, Disposable, FileBackend};
use crate::error::{BackendError, Result};

/// Daemon binary launched for stdio transports.
pub const DAEMON_PROGRAM: &str = "agent-backend";

/// How an MCP client reaches the server for a backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum McpLaunch {
    Stdio { program: String, args: Vec<String> },
    Http { url: String, headers: BTreeMap<String, String> },
}

impl McpLaunch {
    /// Launch description for `backend`, narrowed to `scope_path` (relative
    /// to the backend root) when given.
    pub fn for_backend(backend: &Backend, scope_path: Option<&str>) -> McpLaunch {
        let scope_path = scope_path.filter(|p| !p.is_empty() && *p != ".");
        let effective_root = match scope_path {
            Some(scope) => normalize(&format!("{}/{scope}", backend.root())),
            None => backend.root().to_string(),
        };

        match backend {
            Backend::Local(local) => {
                let args = [
                    "daemon",
                    "--rootDir",
                    effective_root.as_str(),
                    "--local-only",
                    "--isolation",
                    local.isolation().as_str(),
                    "--shell",
                    local.shell(),
                ];
                McpLaunch::stdio(&args)
            }
            Backend::Memory(_) => {
                McpLaunch::stdio(&["--backend", "memory", "--rootDir", effective_root.as_str()])
            }
            Backend::Remote(remote) => {
                let config = remote.config();
                let mut headers = BTreeMap::new();
                if let Some(token) = &config.auth_token {
                    headers.insert("Authorization".to_string(), format!("Bearer {token}"));
                }
                headers.insert("X-Root-Dir".to_string(), backend.root().to_string());
                if let Some(scope) = scope_path {
                    headers.insert("X-Scope-Path".to_string(), scope.to_string());
                }
                McpLaunch::Http {
                    url: config.mcp_url(),
                    headers,
                }
            }
        }
    }

    fn stdio(args: &[&str]) -> McpLaunch {
        McpLaunch::Stdio {
            program: DAEMON_PROGRAM.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
        }
    }
}

/// A transport whose server process (for stdio launches) lives until the
/// transport is closed.
pub struct McpTransport {
    launch: McpLaunch,
    child: Mutex<Option<Child>>,
    closed: AtomicBool,
}

impl McpTransport {
    pub fn new(launch: McpLaunch) -> Self {
        Self {
            launch,
            child: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    pub fn launch(&self) -> &McpLaunch {
        &self.launch
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Starts the stdio server and hands back its pipes for a client
    /// session. HTTP transports have nothing to spawn.
    pub fn spawn(&self) -> Result<(ChildStdin, ChildStdout)> {
        let McpLaunch::Stdio { program, args } = &self.launch else {
            return Err(BackendError::invalid_config(
                "HTTP MCP transports are connected by the client, not spawned",
            ));
        };
        let failed = |message: String| BackendError::ExecFailed {
            command: program.clone(),
            exit_code: -1,
            message,
        };
        if self.is_closed() {
            return Err(BackendError::ConnectionClosed {
                message: "MCP transport closed".to_string(),
            });
        }

        let mut slot = self.child.lock();
        if slot.is_some() {
            return Err(failed("MCP server already running".to_string()));
        }
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| failed(e.to_string()))?;

        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            return Err(failed("server pipes unavailable".to_string()));
        };
        info!("MCP server started: {program} {}", args.join(" "));
        *slot = Some(child);
        Ok((stdin, stdout))
    }

    pub fn is_running(&self) -> bool {
        match self.child.lock().as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    /// Stops the server process if one was spawned. Idempotent.
    pub async fn close(&self) -> anyhow::Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let child = self.child.lock().take();
        if let Some(mut child) = child {
            if matches!(child.try_wait(), Ok(None)) {
                child.kill().await?;
            }
            debug!("MCP server stopped");
        }
        Ok(())
    }
}

#[async_trait]
impl Disposable for McpTransport {
    async fn dispose(&self) -> anyhow::Result<()> {
        self.close().await
    }
}

/// Builds the transport for `backend` (optionally narrowed to a scope) and
/// ties its lifetime to the backend.
pub(crate) fn create_transport(backend: &Backend, scope_path: Option<&str>) -> Arc<McpTransport> {
    let transport = Arc::new(McpTransport::new(McpLaunch::for_backend(backend, scope_path)));
    backend.track_disposable(transport.clone());
    debug!("MCP transport created for {} backend at {}", backend.backend_type(), backend.root());
    transport
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::remote::{ExecOutput, RemoteTransport, TransportError};
    use crate::backends::{FileStat, LocalBackend, MemoryBackend, RemoteBackend, RemoveOptions, ScopeConfig};
    use crate::config::{IsolationMode, LocalConfig, MemoryConfig, RemoteConfig};
    use crate::error::ErrorKind;
    use std::collections::HashMap;

    fn args_of(launch: &McpLaunch) -> Vec<String> {
        match launch {
            McpLaunch::Stdio { args, .. } => args.clone(),
            McpLaunch::Http { .. } => panic!("expected stdio launch"),
        }
    }

    fn memory() -> Backend {
        Backend::from(
            MemoryBackend::new(MemoryConfig {
                root: "/mem".to_string(),
                ..MemoryConfig::default()
            })
            .unwrap(),
        )
    }

    /// Transport that is never connected; only its config matters here.
    struct Unreachable;

    #[async_trait]
    impl RemoteTransport for Unreachable {
        async fn connect(&self, _: &RemoteConfig) -> Result<(), TransportError> {
            Err(TransportError::Fatal("unreachable".into()))
        }
        async fn close(&self) -> Result<(), TransportError> {
            Ok(())
        }
        async fn run(&self, _: &str, _: &str, _: &HashMap<String, String>) -> Result<ExecOutput, TransportError> {
            Err(TransportError::Fatal("unreachable".into()))
        }
        async fn read_file(&self, _: &str) -> Result<Vec<u8>, TransportError> {
            Err(TransportError::Fatal("unreachable".into()))
        }
        async fn write_file(&self, _: &str, _: &[u8]) -> Result<(), TransportError> {
            Err(TransportError::Fatal("unreachable".into()))
        }
        async fn rename(&self, _: &str, _: &str) -> Result<(), TransportError> {
            Err(TransportError::Fatal("unreachable".into()))
        }
        async fn remove(&self, _: &str, _: RemoveOptions) -> Result<(), TransportError> {
            Err(TransportError::Fatal("unreachable".into()))
        }
        async fn list_dir(&self, _: &str) -> Result<Vec<String>, TransportError> {
            Err(TransportError::Fatal("unreachable".into()))
        }
        async fn make_dir(&self, _: &str, _: bool) -> Result<(), TransportError> {
            Err(TransportError::Fatal("unreachable".into()))
        }
        async fn touch(&self, _: &str) -> Result<(), TransportError> {
            Err(TransportError::Fatal("unreachable".into()))
        }
        async fn exists(&self, _: &str) -> Result<bool, TransportError> {
            Err(TransportError::Fatal("unreachable".into()))
        }
        async fn stat(&self, _: &str) -> Result<FileStat, TransportError> {
            Err(TransportError::Fatal("unreachable".into()))
        }
    }

    // ── launch specs ────────────────────────────────────

    #[tokio::test]
    async fn test_local_launch_carries_root_isolation_and_shell() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = LocalConfig::new(dir.path().to_string_lossy());
        config.isolation = IsolationMode::Software;
        let local = LocalBackend::new(config).await.unwrap();
        let shell = local.shell().to_string();
        let backend = Backend::from(local);

        let launch = McpLaunch::for_backend(&backend, None);
        let McpLaunch::Stdio { program, args } = &launch else {
            panic!("expected stdio launch");
        };
        assert_eq!(program, DAEMON_PROGRAM);
        assert_eq!(
            args,
            &vec![
                "daemon".to_string(),
                "--rootDir".to_string(),
                backend.root().to_string(),
                "--local-only".to_string(),
                "--isolation".to_string(),
                "software".to_string(),
                "--shell".to_string(),
                shell,
            ]
        );
    }

    #[tokio::test]
    async fn test_memory_launch() {
        let launch = McpLaunch::for_backend(&memory(), None);
        assert_eq!(args_of(&launch), vec!["--backend", "memory", "--rootDir", "/mem"]);
    }

    #[tokio::test]
    async fn test_scope_transport_uses_composed_root() {
        let backend = memory();
        let scope = backend
            .scope("users", ScopeConfig::default())
            .unwrap()
            .scope("alice", ScopeConfig::default())
            .unwrap();

        let transport = scope.mcp_transport();
        assert_eq!(
            args_of(transport.launch()),
            vec!["--backend", "memory", "--rootDir", "/mem/users/alice"]
        );
    }

    #[tokio::test]
    async fn test_remote_launch_is_http_with_headers() {
        let mut config = RemoteConfig::new("/srv/ws", "daemon.test");
        config.auth_token = Some("s3cret".to_string());
        config.mcp_port = 4100;
        let backend = Backend::from(RemoteBackend::new(config, Arc::new(Unreachable)));

        let McpLaunch::Http { url, headers } = McpLaunch::for_backend(&backend, Some("team/a")) else {
            panic!("expected http launch");
        };
        assert_eq!(url, "http://daemon.test:4100/mcp");
        assert_eq!(headers.get("Authorization").map(String::as_str), Some("Bearer s3cret"));
        assert_eq!(headers.get("X-Root-Dir").map(String::as_str), Some("/srv/ws"));
        assert_eq!(headers.get("X-Scope-Path").map(String::as_str), Some("team/a"));
    }

    // ── lifetime ────────────────────────────────────────

    #[tokio::test]
    async fn test_http_transport_cannot_spawn() {
        let transport = McpTransport::new(McpLaunch::Http {
            url: "http://h:1/mcp".to_string(),
            headers: BTreeMap::new(),
        });
        let err = transport.spawn().err().unwrap();
        assert_eq!(err.kind(), ErrorKind::InvalidConfiguration);
    }

    #[tokio::test]
    async fn test_backend_destroy_closes_tracked_transport() {
        let backend = memory();
        let transport = backend.mcp_transport();
        backend.destroy().await.unwrap();
        assert!(transport.is_closed());
        assert_eq!(
            transport.spawn().err().map(|e| e.kind()),
            Some(ErrorKind::ConnectionClosed)
        );
    }

    #[tokio::test]
    async fn test_close_stops_server_process() {
        let transport = McpTransport::new(McpLaunch::Stdio {
            program: "sleep".to_string(),
            args: vec!["30".to_string()],
        });
        let _pipes = transport.spawn().unwrap();
        assert!(transport.is_running());
        assert!(transport.spawn().is_err());

        transport.close().await.unwrap();
        transport.close().await.unwrap();
        assert!(!transport.is_running());
    }
}
