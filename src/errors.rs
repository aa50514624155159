use std::path::PathBuf;
use std::process::ExitStatus;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum BackupError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// `status` is `None` when the tool could not be started at all.
    #[error("Archive command failed ({}): {stderr}", describe_status(.status))]
    ArchiveCommandFailed {
        status: Option<ExitStatus>,
        stderr: String,
    },

    #[error("Database dump failed: {0}")]
    DumpFailed(String),

    #[error("Workspace error at {path}: {source}")]
    Workspace {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Another backup run holds the lock at {0}")]
    AlreadyRunning(PathBuf),

    #[error("Storage operation failed: {0}")]
    Storage(#[from] StorageError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl BackupError {
    /// Short name of the pipeline stage an error belongs to, for log fields.
    pub fn stage(&self) -> &'static str {
        match self {
            BackupError::Configuration(_) | BackupError::AlreadyRunning(_) => "setup",
            BackupError::ArchiveCommandFailed { .. } => "archive",
            BackupError::DumpFailed(_) => "dump",
            BackupError::Workspace { .. } => "workspace",
            BackupError::Storage(_) => "storage",
            BackupError::Io(_) => "io",
        }
    }
}

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Remote storage error on {path}: {message}")]
    Remote { path: String, message: String },

    #[error("Path not found: {0}")]
    NotFound(String),
}

impl StorageError {
    pub fn io(path: impl Into<String>, source: std::io::Error) -> Self {
        StorageError::Io { path: path.into(), source }
    }

    pub fn remote(path: impl Into<String>, message: impl ToString) -> Self {
        StorageError::Remote {
            path: path.into(),
            message: message.to_string(),
        }
    }
}

fn describe_status(status: &Option<ExitStatus>) -> String {
    match status {
        Some(status) => status.to_string(),
        None => "not started".to_string(),
    }
}

pub type Result<T> = std::result::Result<T, BackupError>;
