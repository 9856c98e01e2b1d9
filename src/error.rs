//! Error taxonomy for configuration loading, the engine seam and
//! editor/disk reconciliation.

use std::path::PathBuf;
use thiserror::Error;

/// Failures while reading, parsing or resolving a project configuration.
///
/// All of these are recoverable: the Config Watcher reports them and
/// publishes an absent configuration instead.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Cannot read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed configuration {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Cannot resolve rule '{reference}': {reason}")]
    Resolve { reference: String, reason: String },

    #[error("Rule '{pattern}' in session '{session}' names no rule and the session has no context")]
    MissingRule { session: String, pattern: String },

    #[error("Invalid pattern '{pattern}': {reason}")]
    Pattern { pattern: String, reason: String },

    #[error("Settings error: {0}")]
    Settings(#[from] Box<figment::Error>),
}

/// Errors reported by a rule-evaluation engine implementation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("Artifact context already exists for {path}")]
    AlreadyExists { path: PathBuf },

    #[error("No artifact context for {path}")]
    UnknownContext { path: PathBuf },

    #[error("Rule '{rule}' is not understood by this engine")]
    ForeignRule { rule: String },

    #[error("Engine rejected the request: {reason}")]
    Rejected { reason: String },
}

/// Invariant violations found while arbitrating editor and disk authority.
///
/// These are fatal for the affected path: state for it is left untouched and
/// the error is surfaced to the host instead of being guessed away.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReconcileError {
    #[error("Artifact context already exists at {path} in session '{session}'")]
    Conflict { session: String, path: PathBuf },

    #[error("Expected an artifact context for {path} in session '{session}'")]
    MissingArtifactContext { session: String, path: PathBuf },

    #[error("Engine failure for {path}: {source}")]
    Engine {
        path: PathBuf,
        #[source]
        source: EngineError,
    },
}
