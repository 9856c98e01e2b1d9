//! Projects, their validation sessions, and editor/disk arbitration.
//!
//! ```text
//! ProjectManager
//!   ├── Project (per root)
//!   │     ├── ConfigWatcher
//!   │     └── SessionRegistry
//!   │           ├── Sessions (engine)
//!   │           ├── FileWatchers
//!   │           └── Globs
//!   └── EditorSynchronizer (shared by all projects)
//! ```
//!
//! Watcher subscriptions never call into the manager directly. They forward
//! a [`ProjectEvent`] tagged with the ids of their owners through an
//! [`EventForwarder`]; events whose owner is gone are dropped on arrival.

mod editor;
mod manager;
mod registry;

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

pub use editor::{AuthorityView, BufferId, ContextKey, EditorContext, EditorEvent, EditorSynchronizer};
pub use manager::{Project, ProjectManager};
pub use registry::{ContextChange, Glob, SessionRegistry, SinkObserver, WatchContext};

use crate::configuration::Configuration;
use crate::watcher::{FileContent, WatchId};

/// Absolute form of a host-supplied path.
pub(crate) fn normalize_path(path: PathBuf) -> PathBuf {
    if path.is_absolute() {
        path
    } else {
        std::path::absolute(&path).unwrap_or(path)
    }
}

/// Identity of a tracked project.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProjectId(u64);

impl ProjectId {
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ProjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "project#{}", self.0)
    }
}

/// Identity of one live session. Unique across rebuilds, so state keyed by
/// a disposed session can never be confused with its successor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionKey(u64);

impl SessionKey {
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session#{}", self.0)
    }
}

/// Notifications produced by watcher subscriptions.
#[derive(Debug, Clone, PartialEq)]
pub enum ProjectEvent {
    /// The project's Config Watcher published a value.
    Config {
        project: ProjectId,
        config: Option<Arc<Configuration>>,
    },
    /// One of the project's File Watchers published an update.
    File {
        project: ProjectId,
        watch: WatchId,
        path: PathBuf,
        content: FileContent,
    },
}

/// Delivers [`ProjectEvent`]s back to the owner of the project manager.
#[derive(Clone)]
pub struct EventForwarder(Arc<dyn Fn(ProjectEvent) + Send + Sync>);

impl EventForwarder {
    pub fn new<F>(forward: F) -> Self
    where
        F: Fn(ProjectEvent) + Send + Sync + 'static,
    {
        Self(Arc::new(forward))
    }

    pub fn send(&self, event: ProjectEvent) {
        (self.0)(event)
    }
}

impl fmt::Debug for EventForwarder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("EventForwarder")
    }
}
