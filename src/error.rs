use std::path::PathBuf;

use thiserror::Error;

/// Failures while querying the version manifest or downloading a server jar.
#[derive(Debug, Error)]
pub enum VersionError {
    #[error("Manifest unreachable: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Malformed manifest: {0}")]
    Parse(String),

    #[error("No '{0}' entry in manifest")]
    MissingChannel(String),

    #[error("SHA-1 mismatch for {path:?}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        path: PathBuf,
        expected: String,
        actual: String,
    },

    #[error("Failed to write download to {path:?}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Failures while archiving the world directory or server jar.
#[derive(Debug, Error)]
pub enum BackupError {
    #[error("Backup source does not exist: {0:?}")]
    MissingSource(PathBuf),

    #[error("IO error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Archive error: {0}")]
    Archive(#[from] zip::result::ZipError),

    #[error("Archive task was cancelled")]
    TaskCancelled,
}

/// Failures in the supervised server process lifecycle.
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("Server is already running")]
    AlreadyRunning,

    #[error("Server is not running")]
    NotRunning,

    #[error("Failed to spawn server process: {0}")]
    Spawn(std::io::Error),

    #[error("Failed to access child stdout pipe")]
    NoStdoutPipe,

    #[error("Failed to access child stderr pipe")]
    NoStderrPipe,

    #[error("Failed to access child stdin pipe")]
    NoStdinPipe,

    #[error("Failed to write to stdin")]
    StdinWriteFailed,

    #[error("Failed to terminate server process: {0}")]
    Kill(std::io::Error),
}

/// Failures while loading, validating, or persisting the manager configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Malformed config: {0}")]
    Parse(#[from] serde_json::Error),
}
