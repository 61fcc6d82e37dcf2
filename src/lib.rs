//! Uniform file and command-execution backends for agents working in a
//! bounded workspace.
//!
//! A [`Backend`] is a local directory with a shell, an in-memory key/value
//! stand-in for a filesystem, or a remote daemon. Every path is confined to
//! the backend root, commands are screened by the [`safety`] classifier, and
//! [`Scope`]s subdivide a workspace into nested sandboxes. The [`pool`]
//! shares live backends between concurrent callers.

pub mod backends;
pub mod backoff;
pub mod config;
pub mod error;
pub mod oplog;
pub mod pool;
pub mod safety;

pub use backends::{
    Backend, BackendType, ConnectionStatus, Content, Encoding, ExecOptions, FileBackend,
    FileStat, LocalBackend, MemoryBackend, ReadOptions, RemoteBackend, RemoteTransport,
    RemoveOptions, Scope, ScopeConfig, StatusChangeEvent,
};
pub use config::{BackendConfig, Config, ConfigLayer};
pub use error::{BackendError, ErrorKind, Result};
pub use pool::{BackendPoolManager, PoolLease, PoolOptions, PoolStats};
pub use safety::{SafetyPolicy, Verdict};
