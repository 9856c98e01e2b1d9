//! Issue sink seam.
//!
//! The sink consumes diagnostics keyed by path. An empty message list clears
//! the diagnostics for that path.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::engine::{Issue, Severity};

/// Location of a message: file plus `[[start_row, start_col], [end_row, end_col]]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageLocation {
    pub file: PathBuf,
    pub position: [[u32; 2]; 2],
}

/// A diagnostic in the shape hosts display.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub severity: Severity,
    pub location: MessageLocation,
    pub excerpt: String,
}

impl Message {
    pub fn from_issue(file: &Path, issue: &Issue) -> Self {
        let loc = issue.location;
        Self {
            severity: issue.severity,
            location: MessageLocation {
                file: file.to_path_buf(),
                position: [[loc.row_start, loc.col_start], [loc.row_end, loc.col_end]],
            },
            excerpt: format!("Type: {}; {}", issue.kind, issue.message),
        }
    }
}

/// Convert an engine issue list into sink messages for `file`.
pub fn messages_for(file: &Path, issues: &[Issue]) -> Vec<Message> {
    issues
        .iter()
        .map(|issue| Message::from_issue(file, issue))
        .collect()
}

/// Consumer of computed diagnostics.
pub trait IssueSink: Send + Sync {
    fn set_messages(&self, path: &Path, messages: Vec<Message>);

    /// Release the sink. Called once, last, during orchestrator shutdown.
    fn dispose(&self);
}

#[derive(Debug, Default)]
struct MemoryState {
    latest: HashMap<PathBuf, Vec<Message>>,
    calls: Vec<(PathBuf, Vec<Message>)>,
    disposed: usize,
}

/// In-memory sink keeping the latest messages per path and a call log.
#[derive(Debug, Default)]
pub struct MemorySink {
    state: Mutex<MemoryState>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Latest messages for `path`, `None` if never reported.
    pub fn messages(&self, path: &Path) -> Option<Vec<Message>> {
        self.state.lock().latest.get(path).cloned()
    }

    /// Paths whose latest message list is non-empty.
    pub fn paths_with_messages(&self) -> Vec<PathBuf> {
        let state = self.state.lock();
        let mut paths: Vec<PathBuf> = state
            .latest
            .iter()
            .filter(|(_, messages)| !messages.is_empty())
            .map(|(path, _)| path.clone())
            .collect();
        paths.sort();
        paths
    }

    /// Every `set_messages` call in order.
    pub fn calls(&self) -> Vec<(PathBuf, Vec<Message>)> {
        self.state.lock().calls.clone()
    }

    /// `set_messages` calls made for `path`.
    pub fn calls_for(&self, path: &Path) -> Vec<Vec<Message>> {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|(p, _)| p == path)
            .map(|(_, messages)| messages.clone())
            .collect()
    }

    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }

    pub fn dispose_count(&self) -> usize {
        self.state.lock().disposed
    }
}

impl IssueSink for MemorySink {
    fn set_messages(&self, path: &Path, messages: Vec<Message>) {
        crate::debug_event!("sink", "messages", "{} ({})", path.display(), messages.len());
        let mut state = self.state.lock();
        state.calls.push((path.to_path_buf(), messages.clone()));
        state.latest.insert(path.to_path_buf(), messages);
    }

    fn dispose(&self) {
        let mut state = self.state.lock();
        state.latest.clear();
        state.disposed += 1;
    }
}
