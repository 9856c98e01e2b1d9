//! Glob-scoped file watcher.
//!
//! A [`FileWatcher`] tracks the content of every file under its root that
//! matches its [`RootedPattern`]. Construction registers the backend watch
//! and then scans the root, so the initial state is known before any event
//! is processed. Events are applied through [`FileWatcher::handle`] by the
//! loop that owns the watcher.
//!
//! Directory events are expanded: a removed directory removes every known
//! file under it, and an added directory is walked for matching files. Files
//! that are not valid UTF-8 are reported as [`FileContent::Unreliable`].

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use walkdir::WalkDir;

use super::backend::{RawEvent, RawEventKind, RawEventSender, WatchBackend, WatchGuard, WatchId};
use super::pattern::RootedPattern;
use super::subscribers::Subscribers;
use super::WatchError;

/// What is known about a watched file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileContent {
    /// The file is gone, or the watcher is shutting down.
    Removed,
    /// The watch reported an error; content is not trustworthy.
    Unreliable,
    Content(Arc<str>),
}

impl FileContent {
    pub fn text(text: impl Into<Arc<str>>) -> Self {
        Self::Content(text.into())
    }

    /// Content as handed to the engine: `None` for unreliable content.
    ///
    /// Only meaningful for non-removed content.
    pub fn as_engine_input(&self) -> Option<&str> {
        match self {
            Self::Content(text) => Some(text.as_ref()),
            Self::Unreliable | Self::Removed => None,
        }
    }

    pub fn is_removed(&self) -> bool {
        matches!(self, Self::Removed)
    }
}

type FileCallback = dyn FnMut(&Path, &FileContent) + Send;

/// Watches the files matching one pattern.
pub struct FileWatcher {
    id: WatchId,
    pattern: RootedPattern,
    current: BTreeMap<PathBuf, FileContent>,
    subscribers: Subscribers<FileCallback>,
    follow_links: bool,
    _guard: Option<WatchGuard>,
}

impl FileWatcher {
    /// Start watching `pattern`, reading every currently matching file.
    pub async fn watch(
        pattern: RootedPattern,
        backend: &dyn WatchBackend,
        events: &RawEventSender,
        follow_links: bool,
    ) -> Result<Self, WatchError> {
        let id = WatchId::next();
        let guard = backend.watch(id, pattern.root(), true, events)?;

        let mut watcher = Self {
            id,
            pattern,
            current: BTreeMap::new(),
            subscribers: Subscribers::new(),
            follow_links,
            _guard: Some(guard),
        };

        for path in scan(watcher.pattern.root(), &watcher.pattern, follow_links) {
            watcher.read_into_current(&path).await;
        }

        crate::debug_event!(
            "files",
            "watching",
            "{id} {} ({} files)",
            watcher.pattern.as_str(),
            watcher.current.len()
        );
        Ok(watcher)
    }

    pub fn id(&self) -> WatchId {
        self.id
    }

    pub fn pattern(&self) -> &RootedPattern {
        &self.pattern
    }

    /// Last known content for `path`.
    pub fn current(&self, path: &Path) -> Option<&FileContent> {
        self.current.get(path)
    }

    /// Paths with known content, sorted.
    pub fn known_paths(&self) -> impl Iterator<Item = &Path> {
        self.current.keys().map(PathBuf::as_path)
    }

    pub fn is_disposed(&self) -> bool {
        self.subscribers.is_closed()
    }

    /// Subscribe to updates. Every known `(path, content)` pair is replayed
    /// to the callback before it is attached.
    pub fn on_update<F>(&mut self, mut callback: F) -> &mut Self
    where
        F: FnMut(&Path, &FileContent) + Send + 'static,
    {
        if self.is_disposed() {
            return self;
        }
        for (path, content) in &self.current {
            callback(path, content);
        }
        self.subscribers.add(Box::new(callback));
        self
    }

    /// Apply one raw event from the backend.
    pub async fn handle(&mut self, event: RawEvent) {
        if self.is_disposed() || event.watch != self.id {
            return;
        }

        let path = if event.path.is_absolute() {
            event.path
        } else {
            self.pattern.root().join(event.path)
        };

        if let RawEventKind::Error(details) = &event.kind
            && path == self.pattern.root()
        {
            self.mark_all_unreliable(details);
            return;
        }

        match &event.kind {
            RawEventKind::Removed => self.remove_nested(&path),
            RawEventKind::Added | RawEventKind::Changed if path.is_dir() => {
                self.read_directory(&path).await;
                return;
            }
            _ => {}
        }

        if !self.pattern.matches(&path) {
            return;
        }

        match event.kind {
            RawEventKind::Added | RawEventKind::Changed => {
                if self.read_into_current(&path).await
                    && let Some(content) = self.current.get(&path).cloned()
                {
                    self.notify(&path, &content);
                }
            }
            RawEventKind::Removed => {
                self.current.remove(&path);
                self.notify(&path, &FileContent::Removed);
            }
            RawEventKind::Error(details) => {
                if path.exists() {
                    tracing::warn!("[files] watch error for {}: {details}", path.display());
                }
                self.current.insert(path.clone(), FileContent::Unreliable);
                self.notify(&path, &FileContent::Unreliable);
            }
        }
    }

    /// Notify `Removed` once per known path, then release the watch.
    /// Idempotent.
    pub fn dispose(&mut self) {
        if self.is_disposed() {
            return;
        }

        for callback in self.subscribers.iter_mut() {
            for path in self.current.keys() {
                callback(path, &FileContent::Removed);
            }
        }

        self.subscribers.close();
        self.current.clear();
        self._guard = None;
        crate::debug_event!("files", "disposed", "{} {}", self.id, self.pattern.as_str());
    }

    fn notify(&mut self, path: &Path, content: &FileContent) {
        for callback in self.subscribers.iter_mut() {
            callback(path, content);
        }
    }

    /// Known files below a removed directory are removed with it.
    fn remove_nested(&mut self, dir: &Path) {
        let nested: Vec<PathBuf> = self
            .current
            .range(dir.to_path_buf()..)
            .map(|(path, _)| path)
            .take_while(|path| path.starts_with(dir))
            .filter(|path| path.as_path() != dir)
            .cloned()
            .collect();

        for path in nested {
            self.current.remove(&path);
            self.notify(&path, &FileContent::Removed);
        }
    }

    /// Read every matching file under a directory that appeared.
    async fn read_directory(&mut self, dir: &Path) {
        for path in scan(dir, &self.pattern, self.follow_links) {
            if self.read_into_current(&path).await
                && let Some(content) = self.current.get(&path).cloned()
            {
                self.notify(&path, &content);
            }
        }
    }

    /// The whole watch failed: every known file becomes unreliable.
    fn mark_all_unreliable(&mut self, details: &str) {
        tracing::warn!(
            "[files] watch error for {}: {details}",
            self.pattern.root().display()
        );
        let paths: Vec<PathBuf> = self.current.keys().cloned().collect();
        for path in paths {
            self.current.insert(path.clone(), FileContent::Unreliable);
            self.notify(&path, &FileContent::Unreliable);
        }
    }

    /// Read `path` into `current`. A failed read leaves `current` untouched.
    async fn read_into_current(&mut self, path: &Path) -> bool {
        match tokio::fs::read(path).await {
            Ok(bytes) => {
                let content = match String::from_utf8(bytes) {
                    Ok(text) => FileContent::text(text),
                    Err(_) => {
                        tracing::warn!("[files] {} is not valid UTF-8", path.display());
                        FileContent::Unreliable
                    }
                };
                self.current.insert(path.to_path_buf(), content);
                true
            }
            Err(e) => {
                let error = WatchError::FileRead {
                    path: path.to_path_buf(),
                    reason: e.to_string(),
                };
                tracing::warn!("[files] {error}");
                false
            }
        }
    }
}

/// Files under `dir` that match, in walk order.
fn scan(dir: &Path, pattern: &RootedPattern, follow_links: bool) -> Vec<PathBuf> {
    WalkDir::new(dir)
        .follow_links(follow_links)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| entry.into_path())
        .filter(|path| pattern.matches(path))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::watcher::ManualBackend;
    use parking_lot::Mutex;
    use std::fs;
    use tempfile::TempDir;
    use tokio::sync::mpsc;

    type Seen = Arc<Mutex<Vec<(PathBuf, FileContent)>>>;

    fn recorder(watcher: &mut FileWatcher) -> Seen {
        let seen: Seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        watcher.on_update(move |path, content| sink.lock().push((path.to_path_buf(), content.clone())));
        seen
    }

    fn event(watcher: &FileWatcher, kind: RawEventKind, path: PathBuf) -> RawEvent {
        RawEvent {
            watch: watcher.id(),
            kind,
            path,
        }
    }

    #[tokio::test]
    async fn test_initial_scan_and_replay() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        fs::create_dir_all(root.join("files")).unwrap();
        fs::write(root.join("files/a.json"), "{}").unwrap();
        fs::write(root.join("files/b.txt"), "ignored").unwrap();

        let backend = ManualBackend::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let pattern = RootedPattern::new(root, "**/*.json").unwrap();
        let mut watcher = FileWatcher::watch(pattern, &backend, &tx, false).await.unwrap();

        let a = root.join("files/a.json");
        assert_eq!(watcher.current(&a), Some(&FileContent::text("{}")));
        assert_eq!(watcher.known_paths().count(), 1);

        let seen = recorder(&mut watcher);
        assert_eq!(seen.lock().clone(), vec![(a, FileContent::text("{}"))]);
    }

    #[tokio::test]
    async fn test_events_update_current_and_notify() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();

        let backend = ManualBackend::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let pattern = RootedPattern::new(root, "*.json").unwrap();
        let mut watcher = FileWatcher::watch(pattern, &backend, &tx, false).await.unwrap();
        let seen = recorder(&mut watcher);

        let path = root.join("a.json");
        fs::write(&path, "[1]").unwrap();
        watcher.handle(event(&watcher, RawEventKind::Added, path.clone())).await;
        assert_eq!(watcher.current(&path), Some(&FileContent::text("[1]")));

        watcher
            .handle(event(&watcher, RawEventKind::Error("boom".into()), path.clone()))
            .await;
        assert_eq!(watcher.current(&path), Some(&FileContent::Unreliable));

        fs::remove_file(&path).unwrap();
        watcher.handle(event(&watcher, RawEventKind::Removed, path.clone())).await;
        assert!(watcher.current(&path).is_none());

        // Non-matching paths are ignored
        watcher
            .handle(event(&watcher, RawEventKind::Added, root.join("a.txt")))
            .await;

        let kinds: Vec<FileContent> = seen.lock().iter().map(|(_, c)| c.clone()).collect();
        assert_eq!(
            kinds,
            vec![FileContent::text("[1]"), FileContent::Unreliable, FileContent::Removed]
        );
    }

    #[tokio::test]
    async fn test_failed_read_keeps_last_content() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        let path = root.join("a.json");
        fs::write(&path, "{}").unwrap();

        let backend = ManualBackend::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let pattern = RootedPattern::new(root, "*.json").unwrap();
        let mut watcher = FileWatcher::watch(pattern, &backend, &tx, false).await.unwrap();
        let seen = recorder(&mut watcher);
        seen.lock().clear();

        // Changed event for a file that vanished before the read
        fs::remove_file(&path).unwrap();
        watcher.handle(event(&watcher, RawEventKind::Changed, path.clone())).await;

        assert_eq!(watcher.current(&path), Some(&FileContent::text("{}")));
        assert!(seen.lock().is_empty());
    }

    #[tokio::test]
    async fn test_dispose_notifies_removed_once_and_releases_watch() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        fs::write(root.join("a.json"), "{}").unwrap();
        fs::write(root.join("b.json"), "{}").unwrap();

        let backend = ManualBackend::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let pattern = RootedPattern::new(root, "*.json").unwrap();
        let mut watcher = FileWatcher::watch(pattern, &backend, &tx, false).await.unwrap();
        assert_eq!(backend.active_count(), 1);

        let seen = recorder(&mut watcher);
        seen.lock().clear();

        watcher.dispose();
        watcher.dispose();
        assert!(watcher.is_disposed());
        assert_eq!(backend.active_count(), 0);

        let removed = seen.lock().clone();
        assert_eq!(removed.len(), 2);
        assert!(removed.iter().all(|(_, c)| c.is_removed()));

        // Events after dispose are no-ops
        fs::write(root.join("c.json"), "{}").unwrap();
        let late = RawEvent {
            watch: watcher.id(),
            kind: RawEventKind::Added,
            path: root.join("c.json"),
        };
        watcher.handle(late).await;
        assert_eq!(seen.lock().len(), 2);
        assert!(watcher.current(&root.join("c.json")).is_none());
    }

    #[tokio::test]
    async fn test_root_error_marks_everything_unreliable() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        fs::write(root.join("a.json"), "{}").unwrap();

        let backend = ManualBackend::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let pattern = RootedPattern::new(root, "*.json").unwrap();
        let mut watcher = FileWatcher::watch(pattern, &backend, &tx, false).await.unwrap();

        let root_error = event(&watcher, RawEventKind::Error("overflow".into()), root.to_path_buf());
        watcher.handle(root_error).await;
        assert_eq!(
            watcher.current(&root.join("a.json")),
            Some(&FileContent::Unreliable)
        );
    }

    #[tokio::test]
    async fn test_directory_move_moves_known_files() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        fs::create_dir_all(root.join("files/deep")).unwrap();
        fs::write(root.join("files/a.json"), "{}").unwrap();
        fs::write(root.join("files/deep/b.json"), "[]").unwrap();
        fs::write(root.join("files2.json"), "{}").unwrap();

        let backend = ManualBackend::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let pattern = RootedPattern::new(root, "**/*.json").unwrap();
        let mut watcher = FileWatcher::watch(pattern, &backend, &tx, false).await.unwrap();
        let seen = recorder(&mut watcher);
        seen.lock().clear();

        // A directory rename arrives as remove(old dir) + add(new dir)
        fs::rename(root.join("files"), root.join("moved")).unwrap();
        watcher
            .handle(event(&watcher, RawEventKind::Removed, root.join("files")))
            .await;
        watcher
            .handle(event(&watcher, RawEventKind::Added, root.join("moved")))
            .await;

        let known: Vec<PathBuf> = watcher.known_paths().map(Path::to_path_buf).collect();
        assert_eq!(
            known,
            vec![
                root.join("files2.json"),
                root.join("moved/a.json"),
                root.join("moved/deep/b.json"),
            ]
        );

        let events = seen.lock().clone();
        assert_eq!(
            events,
            vec![
                (root.join("files/a.json"), FileContent::Removed),
                (root.join("files/deep/b.json"), FileContent::Removed),
                (root.join("moved/a.json"), FileContent::text("{}")),
                (root.join("moved/deep/b.json"), FileContent::text("[]")),
            ]
        );
    }

    #[tokio::test]
    async fn test_removed_directory_without_known_files_is_quiet() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        fs::write(root.join("a.json"), "{}").unwrap();

        let backend = ManualBackend::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let pattern = RootedPattern::new(root, "*.json").unwrap();
        let mut watcher = FileWatcher::watch(pattern, &backend, &tx, false).await.unwrap();
        let seen = recorder(&mut watcher);
        seen.lock().clear();

        watcher
            .handle(event(&watcher, RawEventKind::Removed, root.join("empty")))
            .await;
        assert!(seen.lock().is_empty());
        assert!(watcher.current(&root.join("a.json")).is_some());
    }

    #[tokio::test]
    async fn test_non_utf8_file_is_unreliable() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();

        let backend = ManualBackend::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let pattern = RootedPattern::new(root, "*.json").unwrap();
        let mut watcher = FileWatcher::watch(pattern, &backend, &tx, false).await.unwrap();
        let seen = recorder(&mut watcher);

        let path = root.join("binary.json");
        fs::write(&path, [0xff, 0xfe, 0x7b]).unwrap();
        watcher.handle(event(&watcher, RawEventKind::Added, path.clone())).await;

        assert_eq!(watcher.current(&path), Some(&FileContent::Unreliable));
        assert_eq!(seen.lock().clone(), vec![(path, FileContent::Unreliable)]);
    }

    #[tokio::test]
    async fn test_missing_root_fails() {
        let backend = ManualBackend::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let pattern = RootedPattern::new(Path::new("/definitely/not/here"), "*.json").unwrap();
        assert!(FileWatcher::watch(pattern, &backend, &tx, false).await.is_err());
    }
}
