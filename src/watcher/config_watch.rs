//! Watcher for the per-project configuration file.
//!
//! The watch is registered on the project root (non-recursive) and filtered
//! down to the configuration file name. Every added or changed event re-reads
//! the whole file, so a burst of events simply ends with the last parse.
//! Anything that goes wrong publishes `None`: subscribers never keep a stale
//! configuration around.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::backend::{RawEvent, RawEventKind, RawEventSender, WatchBackend, WatchGuard, WatchId};
use super::subscribers::Subscribers;
use super::WatchError;
use crate::configuration::Configuration;
use crate::engine::RuleResolver;

type ConfigCallback = dyn FnMut(Option<&Arc<Configuration>>) + Send;

/// Watches one project's configuration file.
pub struct ConfigWatcher {
    id: WatchId,
    root: PathBuf,
    file_path: PathBuf,
    resolver: Arc<dyn RuleResolver>,
    current: Option<Arc<Configuration>>,
    subscribers: Subscribers<ConfigCallback>,
    _guard: Option<WatchGuard>,
}

impl ConfigWatcher {
    /// Start watching `root/file_name`, loading it first if present.
    pub async fn watch(
        root: &Path,
        file_name: &str,
        resolver: Arc<dyn RuleResolver>,
        backend: &dyn WatchBackend,
        events: &RawEventSender,
    ) -> Result<Self, WatchError> {
        if root.as_os_str().is_empty() {
            return Err(WatchError::InitFailed {
                reason: "project root is empty".to_string(),
            });
        }
        if file_name.is_empty() || Path::new(file_name).components().count() != 1 {
            return Err(WatchError::InitFailed {
                reason: format!("'{file_name}' is not a plain file name"),
            });
        }

        let id = WatchId::next();
        let guard = backend.watch(id, root, false, events)?;

        let mut watcher = Self {
            id,
            root: root.to_path_buf(),
            file_path: root.join(file_name),
            resolver,
            current: None,
            subscribers: Subscribers::new(),
            _guard: Some(guard),
        };

        if watcher.file_path.is_file() {
            watcher.current =
                Self::load(&watcher.file_path, &watcher.root, watcher.resolver.as_ref()).await;
        }

        crate::debug_event!(
            "config",
            "watching",
            "{id} {} (loaded: {})",
            watcher.file_path.display(),
            watcher.current.is_some()
        );
        Ok(watcher)
    }

    pub fn id(&self) -> WatchId {
        self.id
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn file_path(&self) -> &Path {
        &self.file_path
    }

    pub fn current(&self) -> Option<&Arc<Configuration>> {
        self.current.as_ref()
    }

    pub fn is_disposed(&self) -> bool {
        self.subscribers.is_closed()
    }

    /// Subscribe to updates. The callback is invoked immediately with the
    /// current value, then on every change.
    pub fn on_update<F>(&mut self, mut callback: F) -> &mut Self
    where
        F: FnMut(Option<&Arc<Configuration>>) + Send + 'static,
    {
        if self.is_disposed() {
            return self;
        }
        callback(self.current.as_ref());
        self.subscribers.add(Box::new(callback));
        self
    }

    /// Apply one raw event from the backend.
    pub async fn handle(&mut self, event: RawEvent) {
        if self.is_disposed() || event.watch != self.id {
            return;
        }

        let watch_failed = matches!(event.kind, RawEventKind::Error(_)) && event.path == self.root;
        if event.path != self.file_path && !watch_failed {
            return;
        }

        match event.kind {
            RawEventKind::Added | RawEventKind::Changed => {
                self.current = Self::load(&self.file_path, &self.root, self.resolver.as_ref()).await;
            }
            RawEventKind::Removed => {
                crate::log_event!("config", "removed", "{}", self.file_path.display());
                self.current = None;
            }
            RawEventKind::Error(details) => {
                if self.file_path.exists() {
                    tracing::error!(
                        "[config] watch error for {}: {details}",
                        self.file_path.display()
                    );
                }
                self.current = None;
            }
        }

        self.notify();
    }

    /// Invoke every subscriber one final time with `None`, then release the
    /// watch. Idempotent.
    pub fn dispose(&mut self) {
        if self.is_disposed() {
            return;
        }
        for callback in self.subscribers.iter_mut() {
            callback(None);
        }
        self.subscribers.close();
        self.current = None;
        self._guard = None;
        crate::debug_event!("config", "disposed", "{}", self.file_path.display());
    }

    fn notify(&mut self) {
        let current = self.current.clone();
        for callback in self.subscribers.iter_mut() {
            callback(current.as_ref());
        }
    }

    /// Borrows only what it needs: the watcher itself is not `Sync`.
    async fn load(
        file_path: &Path,
        root: &Path,
        resolver: &dyn RuleResolver,
    ) -> Option<Arc<Configuration>> {
        match Configuration::load(file_path, root, resolver).await {
            Ok(config) => {
                crate::log_event!(
                    "config",
                    "loaded",
                    "{} ({} sessions)",
                    file_path.display(),
                    config.sessions().len()
                );
                Some(Arc::new(config))
            }
            Err(e) => {
                tracing::error!("[config] {e}");
                None
            }
        }
    }
}
