use std::path::PathBuf;

use thiserror::Error;

/// Failures while reading one session file or one directory of session files.
#[derive(Debug, Error)]
pub enum ScanError {
    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid JSON in {}: {source}", path.display())]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("session {} failed validation: {reason}", path.display())]
    InvalidSession { path: PathBuf, reason: String },
    #[error("failed to enumerate directory {}: {source}", path.display())]
    Directory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Failures while setting up a change notifier.
#[derive(Debug, Error)]
pub enum WatchError {
    #[error("filesystem watcher failed: {0}")]
    Notify(#[from] notify::Error),
    #[error("invalid watch pattern: {0}")]
    Pattern(#[from] glob::PatternError),
    #[error("change notifier requires a running tokio runtime")]
    Runtime,
}
