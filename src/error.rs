//! Error taxonomy shared by every backend.
//!
//! Each variant maps to one stable [`ErrorKind`] and carries the operand that
//! triggered it (command, path or key) so callers can react programmatically
//! instead of matching on message text.

use thiserror::Error;

use crate::backends::BackendType;

/// Stable, machine-readable failure kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    EmptyCommand,
    UnsafeCommand,
    DangerousOperation,
    ExecFailed,
    ReadFailed,
    WriteFailed,
    ListFailed,
    PathEscape,
    MissingUtilities,
    InvalidConfiguration,
    KeyNotFound,
    NotImplemented,
    ConnectionClosed,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::EmptyCommand => "EMPTY_COMMAND",
            ErrorKind::UnsafeCommand => "UNSAFE_COMMAND",
            ErrorKind::DangerousOperation => "DANGEROUS_OPERATION",
            ErrorKind::ExecFailed => "EXEC_FAILED",
            ErrorKind::ReadFailed => "READ_FAILED",
            ErrorKind::WriteFailed => "WRITE_FAILED",
            ErrorKind::ListFailed => "LS_FAILED",
            ErrorKind::PathEscape => "PATH_ESCAPE_ATTEMPT",
            ErrorKind::MissingUtilities => "MISSING_UTILITIES",
            ErrorKind::InvalidConfiguration => "INVALID_CONFIGURATION",
            ErrorKind::KeyNotFound => "KEY_NOT_FOUND",
            ErrorKind::NotImplemented => "NOT_IMPLEMENTED",
            ErrorKind::ConnectionClosed => "CONNECTION_CLOSED",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("Command cannot be empty")]
    EmptyCommand,

    #[error("{reason}")]
    UnsafeCommand { command: String, reason: String },

    #[error("Dangerous operation blocked: {command}")]
    DangerousOperation { command: String },

    /// `exit_code` is -1 when the process was terminated by a signal.
    #[error("Command execution failed with exit code {exit_code}: {message}")]
    ExecFailed {
        command: String,
        exit_code: i32,
        message: String,
    },

    #[error("Failed to read {path}: {message}")]
    ReadFailed { path: String, message: String },

    #[error("Failed to write {path}: {message}")]
    WriteFailed { path: String, message: String },

    #[error("Failed to read directory {path}: {message}")]
    ListFailed { path: String, message: String },

    #[error("Path escapes scope boundary: {path}")]
    PathEscape { path: String },

    #[error("Required utility not available: {utility}")]
    MissingUtilities { utility: String },

    #[error("Invalid configuration: {message}")]
    InvalidConfiguration { message: String },

    #[error("Key not found: {key}")]
    KeyNotFound { key: String, operation: &'static str },

    #[error("Operation '{operation}' not implemented for {backend} backend")]
    NotImplemented {
        operation: &'static str,
        backend: BackendType,
    },

    #[error("Connection closed: {message}")]
    ConnectionClosed { message: String },
}

impl BackendError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            BackendError::EmptyCommand => ErrorKind::EmptyCommand,
            BackendError::UnsafeCommand { .. } => ErrorKind::UnsafeCommand,
            BackendError::DangerousOperation { .. } => ErrorKind::DangerousOperation,
            BackendError::ExecFailed { .. } => ErrorKind::ExecFailed,
            BackendError::ReadFailed { .. } => ErrorKind::ReadFailed,
            BackendError::WriteFailed { .. } => ErrorKind::WriteFailed,
            BackendError::ListFailed { .. } => ErrorKind::ListFailed,
            BackendError::PathEscape { .. } => ErrorKind::PathEscape,
            BackendError::MissingUtilities { .. } => ErrorKind::MissingUtilities,
            BackendError::InvalidConfiguration { .. } => ErrorKind::InvalidConfiguration,
            BackendError::KeyNotFound { .. } => ErrorKind::KeyNotFound,
            BackendError::NotImplemented { .. } => ErrorKind::NotImplemented,
            BackendError::ConnectionClosed { .. } => ErrorKind::ConnectionClosed,
        }
    }

    /// The command, path or key that triggered the failure, when there is one.
    pub fn operand(&self) -> Option<&str> {
        match self {
            BackendError::UnsafeCommand { command, .. }
            | BackendError::DangerousOperation { command }
            | BackendError::ExecFailed { command, .. } => Some(command),
            BackendError::ReadFailed { path, .. }
            | BackendError::WriteFailed { path, .. }
            | BackendError::ListFailed { path, .. }
            | BackendError::PathEscape { path } => Some(path),
            BackendError::MissingUtilities { utility } => Some(utility),
            BackendError::KeyNotFound { key, .. } => Some(key),
            BackendError::NotImplemented { operation, .. } => Some(operation),
            BackendError::EmptyCommand
            | BackendError::InvalidConfiguration { .. }
            | BackendError::ConnectionClosed { .. } => None,
        }
    }

    pub(crate) fn path_escape(path: impl Into<String>) -> Self {
        BackendError::PathEscape { path: path.into() }
    }

    pub(crate) fn invalid_config(message: impl Into<String>) -> Self {
        BackendError::InvalidConfiguration {
            message: message.into(),
        }
    }
}

pub type Result<T, E = BackendError> = std::result::Result<T, E>;
