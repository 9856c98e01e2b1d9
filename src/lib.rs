//! Live validation orchestrator.
//!
//! Tracks a set of project roots, loads each root's configuration file, and
//! keeps one validation session per declared session alive. Files matching
//! the configured globs are fed to the sessions from disk, unless an editor
//! buffer holds the path, in which case the buffer text wins until it closes.
//! Results flow to an [`IssueSink`].

pub mod config;
pub mod configuration;
pub mod engine;
pub mod error;
pub mod logging;
pub mod project;
pub mod runtime;
pub mod sink;
pub mod watcher;

pub use config::{LoggingConfig, Settings};
pub use configuration::Configuration;
pub use engine::json::{JsonEngine, json_rules};
pub use engine::{
    ArtifactContext, ContextObserver, Issue, IssueLocation, Rule, RuleEngine, RuleRegistry,
    RuleResolver, Session, Severity,
};
pub use error::{ConfigError, EngineError, ReconcileError};
pub use project::{BufferId, EditorEvent, ProjectManager};
pub use runtime::{HostEvent, Orchestrator, OrchestratorBuilder, OrchestratorHandle};
pub use sink::{IssueSink, MemorySink, Message, MessageLocation};
pub use watcher::{FileContent, ManualBackend, NotifyBackend, WatchBackend, WatchError};
