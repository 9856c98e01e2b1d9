//! Error types for the watcher layer.

use std::path::PathBuf;
use thiserror::Error;

/// Errors from watcher operations.
///
/// None of these are fatal to the orchestrator: they are logged and turned
/// into content transitions (`Unreliable`, skipped update) by the watchers.
#[derive(Error, Debug)]
pub enum WatchError {
    #[error("Failed to initialize watcher: {reason}")]
    InitFailed { reason: String },

    #[error("Cannot watch path {path}: {reason}")]
    PathWatchFailed { path: PathBuf, reason: String },

    #[error("Failed to read {path}: {reason}")]
    FileRead { path: PathBuf, reason: String },

    #[error("File system event error: {details}")]
    Event { details: String },

    #[error("Channel closed unexpectedly")]
    ChannelClosed,
}

impl From<notify::Error> for WatchError {
    fn from(e: notify::Error) -> Self {
        WatchError::InitFailed {
            reason: e.to_string(),
        }
    }
}
