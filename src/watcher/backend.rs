//! Watch primitives.
//!
//! A [`WatchBackend`] turns a root directory into a stream of [`RawEvent`]s
//! tagged with the [`WatchId`] that requested it. Events flow into a tokio
//! channel owned by the orchestrator loop; dropping the returned
//! [`WatchGuard`] stops delivery.
//!
//! Two backends exist:
//! - [`NotifyBackend`]: one `notify::RecommendedWatcher` per watch
//! - [`ManualBackend`]: deterministic, events are injected with
//!   [`ManualBackend::emit`]. Used by tests and by hosts that already own a
//!   file watching facility.

use std::any::Any;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use notify::event::{ModifyKind, RenameMode};
use notify::{Event, EventKind, RecursiveMode, Watcher};
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::WatchError;

/// Identity of one watch registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WatchId(u64);

impl WatchId {
    /// Allocate a process-unique id.
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    pub fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for WatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "watch#{}", self.0)
    }
}

/// What happened to a path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawEventKind {
    Added,
    Changed,
    Removed,
    /// The watch primitive reported a failure for this path.
    Error(String),
}

/// A normalized file system event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEvent {
    pub watch: WatchId,
    pub kind: RawEventKind,
    /// Absolute path the event refers to.
    pub path: PathBuf,
}

pub type RawEventSender = mpsc::UnboundedSender<RawEvent>;
pub type RawEventReceiver = mpsc::UnboundedReceiver<RawEvent>;

/// Keeps a watch registration alive.
pub struct WatchGuard {
    _inner: Box<dyn Any + Send>,
}

impl WatchGuard {
    pub fn new<T: Any + Send>(inner: T) -> Self {
        Self {
            _inner: Box::new(inner),
        }
    }
}

impl fmt::Debug for WatchGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("WatchGuard")
    }
}

/// Source of raw file system events.
pub trait WatchBackend: Send + Sync {
    /// Start watching `root`. Events for `root` (recursively when asked) are
    /// sent to `events` tagged with `id` until the guard is dropped.
    fn watch(
        &self,
        id: WatchId,
        root: &Path,
        recursive: bool,
        events: &RawEventSender,
    ) -> Result<WatchGuard, WatchError>;
}

fn absolute(root: &Path, path: PathBuf) -> PathBuf {
    if path.is_absolute() {
        path
    } else {
        root.join(path)
    }
}

/// Translate one notify result into raw events.
pub fn translate(watch: WatchId, root: &Path, res: notify::Result<Event>) -> Vec<RawEvent> {
    let event = match res {
        Ok(event) => event,
        Err(e) => {
            let details = WatchError::Event {
                details: e.to_string(),
            }
            .to_string();
            crate::debug_event!("watcher", "error", "{details}");
            let paths = if e.paths.is_empty() {
                vec![root.to_path_buf()]
            } else {
                e.paths
            };
            return paths
                .into_iter()
                .map(|path| RawEvent {
                    watch,
                    kind: RawEventKind::Error(details.clone()),
                    path: absolute(root, path),
                })
                .collect();
        }
    };

    let make = |kind: RawEventKind, path: PathBuf| RawEvent {
        watch,
        kind,
        path: absolute(root, path),
    };

    match event.kind {
        EventKind::Create(_) => event
            .paths
            .into_iter()
            .map(|p| make(RawEventKind::Added, p))
            .collect(),
        EventKind::Remove(_) => event
            .paths
            .into_iter()
            .map(|p| make(RawEventKind::Removed, p))
            .collect(),
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
            let mut paths = event.paths.into_iter();
            let mut out = Vec::with_capacity(2);
            if let Some(from) = paths.next() {
                out.push(make(RawEventKind::Removed, from));
            }
            if let Some(to) = paths.next() {
                out.push(make(RawEventKind::Added, to));
            }
            out
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => event
            .paths
            .into_iter()
            .map(|p| make(RawEventKind::Removed, p))
            .collect(),
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => event
            .paths
            .into_iter()
            .map(|p| make(RawEventKind::Added, p))
            .collect(),
        EventKind::Modify(ModifyKind::Name(_)) => event
            .paths
            .into_iter()
            .map(|p| {
                let p = absolute(root, p);
                // Direction unknown: the file system is the judge
                let kind = if p.exists() {
                    RawEventKind::Added
                } else {
                    RawEventKind::Removed
                };
                make(kind, p)
            })
            .collect(),
        EventKind::Modify(_) => event
            .paths
            .into_iter()
            .map(|p| make(RawEventKind::Changed, p))
            .collect(),
        _ => Vec::new(),
    }
}

/// Backend built on `notify::RecommendedWatcher`.
#[derive(Debug, Default, Clone, Copy)]
pub struct NotifyBackend;

impl NotifyBackend {
    pub fn new() -> Self {
        Self
    }
}

impl WatchBackend for NotifyBackend {
    fn watch(
        &self,
        id: WatchId,
        root: &Path,
        recursive: bool,
        events: &RawEventSender,
    ) -> Result<WatchGuard, WatchError> {
        let tx = events.clone();
        let watch_root = root.to_path_buf();

        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
            for event in translate(id, &watch_root, res) {
                // Loop gone means shutdown, nothing left to tell
                let _ = tx.send(event);
            }
        })?;

        let mode = if recursive {
            RecursiveMode::Recursive
        } else {
            RecursiveMode::NonRecursive
        };

        watcher
            .watch(root, mode)
            .map_err(|e| WatchError::PathWatchFailed {
                path: root.to_path_buf(),
                reason: e.to_string(),
            })?;

        crate::debug_event!("watcher", "watching", "{id} {}", root.display());
        Ok(WatchGuard::new(watcher))
    }
}

#[derive(Debug)]
struct Registration {
    id: WatchId,
    root: PathBuf,
    recursive: bool,
    events: RawEventSender,
}

struct ManualRegistration {
    id: WatchId,
    registrations: Arc<Mutex<Vec<Registration>>>,
}

impl Drop for ManualRegistration {
    fn drop(&mut self) {
        self.registrations.lock().retain(|r| r.id != self.id);
    }
}

/// Deterministic backend: nothing happens until [`emit`](Self::emit) is called.
#[derive(Debug, Default, Clone)]
pub struct ManualBackend {
    registrations: Arc<Mutex<Vec<Registration>>>,
}

impl ManualBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver an event for `path` to every live watch covering it.
    ///
    /// Returns the number of watches the event was delivered to.
    pub fn emit(&self, path: impl AsRef<Path>, kind: RawEventKind) -> usize {
        let path = path.as_ref();
        let registrations = self.registrations.lock();
        let mut delivered = 0;

        for registration in registrations.iter() {
            let covered = if registration.recursive {
                path.starts_with(&registration.root)
            } else {
                path.parent() == Some(registration.root.as_path()) || path == registration.root
            };
            if !covered {
                continue;
            }

            let event = RawEvent {
                watch: registration.id,
                kind: kind.clone(),
                path: path.to_path_buf(),
            };
            if registration.events.send(event).is_ok() {
                delivered += 1;
            }
        }

        delivered
    }

    /// Live registrations as `(id, root)`.
    pub fn active(&self) -> Vec<(WatchId, PathBuf)> {
        self.registrations
            .lock()
            .iter()
            .map(|r| (r.id, r.root.clone()))
            .collect()
    }

    pub fn active_count(&self) -> usize {
        self.registrations.lock().len()
    }
}

impl WatchBackend for ManualBackend {
    fn watch(
        &self,
        id: WatchId,
        root: &Path,
        recursive: bool,
        events: &RawEventSender,
    ) -> Result<WatchGuard, WatchError> {
        if !root.is_dir() {
            return Err(WatchError::PathWatchFailed {
                path: root.to_path_buf(),
                reason: "not a directory".to_string(),
            });
        }

        self.registrations.lock().push(Registration {
            id,
            root: root.to_path_buf(),
            recursive,
            events: events.clone(),
        });

        Ok(WatchGuard::new(ManualRegistration {
            id,
            registrations: Arc::clone(&self.registrations),
        }))
    }
}
