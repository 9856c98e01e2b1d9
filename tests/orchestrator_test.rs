//! End-to-end tests for the orchestrator loop.
//!
//! File system events are injected through `ManualBackend` and the loop is
//! driven with `drain()`, so every assertion sees a settled state.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rapture_lint::watcher::RawEventKind;
use rapture_lint::{
    BufferId, JsonEngine, ManualBackend, MemorySink, Orchestrator, OrchestratorHandle,
    ReconcileError, Settings, json_rules,
};
use tempfile::TempDir;
use tokio::sync::mpsc;

const CONFIG: &str = r#"{ "sessions": [ { "id": "A", "rules": [ { "pattern": "**/*.json", "rule": "json" } ] } ] }"#;

struct Harness {
    dir: TempDir,
    backend: ManualBackend,
    sink: Arc<MemorySink>,
    orchestrator: Orchestrator,
    handle: OrchestratorHandle,
    fatal: mpsc::UnboundedReceiver<ReconcileError>,
}

impl Harness {
    fn new() -> Self {
        Self::with_debounce(0)
    }

    fn with_debounce(debounce_ms: u64) -> Self {
        let dir = TempDir::new().unwrap();
        let backend = ManualBackend::new();
        let sink = Arc::new(MemorySink::new());
        let (fatal_tx, fatal) = mpsc::unbounded_channel();

        let (orchestrator, handle) = Orchestrator::builder()
            .settings(Settings {
                debounce_ms,
                ..Settings::default()
            })
            .engine(Arc::new(JsonEngine::new()))
            .resolver(Arc::new(json_rules()))
            .sink(sink.clone())
            .backend(Arc::new(backend.clone()))
            .fatal_errors(fatal_tx)
            .build()
            .unwrap();

        Self {
            dir,
            backend,
            sink,
            orchestrator,
            handle,
            fatal,
        }
    }

    fn root(&self) -> PathBuf {
        self.dir.path().to_path_buf()
    }

    fn path(&self, relative: &str) -> PathBuf {
        self.dir.path().join(relative)
    }

    /// Write a file and report it to the watchers.
    fn write(&self, relative: &str, content: &str) -> PathBuf {
        let path = self.path(relative);
        let existed = path.exists();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(&path, content).unwrap();
        let kind = if existed {
            RawEventKind::Changed
        } else {
            RawEventKind::Added
        };
        self.backend.emit(&path, kind);
        path
    }

    fn remove(&self, relative: &str) -> PathBuf {
        let path = self.path(relative);
        fs::remove_file(&path).unwrap();
        self.backend.emit(&path, RawEventKind::Removed);
        path
    }

    async fn settle(&mut self) {
        self.orchestrator.drain().await;
    }

    fn message_count(&self, path: &Path) -> Option<usize> {
        self.sink.messages(path).map(|messages| messages.len())
    }

    fn context_count(&self, root: &Path) -> usize {
        let registry = self
            .orchestrator
            .manager()
            .project(root)
            .unwrap()
            .registry();
        registry
            .session_keys()
            .into_iter()
            .filter_map(|key| registry.session(key))
            .map(|session| session.context_count())
            .sum()
    }

    fn session_count(&self, root: &Path) -> usize {
        self.orchestrator
            .manager()
            .project(root)
            .unwrap()
            .registry()
            .session_count()
    }
}

#[tokio::test]
async fn test_activation_validates_and_deactivation_clears() {
    let mut h = Harness::new();
    fs::write(h.path(".rapturelintrc"), CONFIG).unwrap();
    let good = h.path("good.json");
    let bad = h.path("nested/bad.json");
    fs::write(&good, "{}").unwrap();
    fs::create_dir_all(h.path("nested")).unwrap();
    fs::write(&bad, "{").unwrap();

    h.handle.set_project_paths([h.root()]).unwrap();
    h.settle().await;

    assert_eq!(h.orchestrator.manager().project_count(), 1);
    assert_eq!(h.message_count(&good), Some(0));
    assert_eq!(h.message_count(&bad), Some(1));
    assert_eq!(h.context_count(&h.root()), 2);
    // Config watcher plus one file watcher
    assert_eq!(h.backend.active_count(), 2);

    h.handle.set_project_paths(Vec::<PathBuf>::new()).unwrap();
    h.settle().await;

    assert_eq!(h.orchestrator.manager().project_count(), 0);
    assert_eq!(h.message_count(&bad), Some(0));
    assert_eq!(h.backend.active_count(), 0);
}

#[tokio::test]
async fn test_created_file_is_validated_once() {
    let mut h = Harness::new();
    fs::write(h.path(".rapturelintrc"), CONFIG).unwrap();
    h.handle.set_project_paths([h.root()]).unwrap();
    h.settle().await;
    assert_eq!(h.context_count(&h.root()), 0);

    let created = h.write("fresh.json", "[1, 2");
    h.settle().await;

    assert_eq!(h.context_count(&h.root()), 1);
    assert_eq!(h.sink.calls_for(&created).len(), 1);
    assert_eq!(h.message_count(&created), Some(1));

    h.write("fresh.json", "[1, 2]");
    h.settle().await;
    assert_eq!(h.message_count(&created), Some(0));

    h.remove("fresh.json");
    h.settle().await;
    assert_eq!(h.context_count(&h.root()), 0);
    assert_eq!(h.message_count(&created), Some(0));
}

#[tokio::test]
async fn test_non_matching_files_are_ignored() {
    let mut h = Harness::new();
    fs::write(h.path(".rapturelintrc"), CONFIG).unwrap();
    h.handle.set_project_paths([h.root()]).unwrap();
    h.settle().await;

    let notes = h.write("notes.txt", "{");
    h.settle().await;

    assert!(h.sink.calls_for(&notes).is_empty());
    assert_eq!(h.context_count(&h.root()), 0);
}

#[tokio::test]
async fn test_changes_wait_for_the_debounce_window() {
    let mut h = Harness::with_debounce(30);
    fs::write(h.path(".rapturelintrc"), CONFIG).unwrap();
    h.handle.set_project_paths([h.root()]).unwrap();
    h.settle().await;

    let created = h.write("late.json", "{");
    h.backend.emit(&created, RawEventKind::Changed);
    h.settle().await;
    assert!(h.sink.calls_for(&created).is_empty());

    tokio::time::sleep(std::time::Duration::from_millis(60)).await;
    h.settle().await;
    assert_eq!(h.sink.calls_for(&created).len(), 1);
    assert_eq!(h.message_count(&created), Some(1));
}

#[tokio::test]
async fn test_editor_buffer_wins_over_disk_until_closed() {
    let mut h = Harness::new();
    fs::write(h.path(".rapturelintrc"), CONFIG).unwrap();
    let good = h.path("good.json");
    fs::write(&good, "{}").unwrap();
    h.handle.set_project_paths([h.root()]).unwrap();
    h.settle().await;
    assert_eq!(h.message_count(&good), Some(0));

    let buffer = BufferId(1);
    h.handle.open_buffer(buffer, Some(good.clone()), "{").unwrap();
    h.settle().await;
    assert_eq!(h.message_count(&good), Some(1));

    // Disk changes while the buffer is open do not reach the session
    h.write("good.json", "[1]");
    h.settle().await;
    assert_eq!(h.message_count(&good), Some(1));

    h.handle.change_buffer_text(buffer, r#"{ "a": 1 }"#).unwrap();
    h.settle().await;
    assert_eq!(h.message_count(&good), Some(0));

    h.handle.change_buffer_text(buffer, "{").unwrap();
    h.settle().await;
    assert_eq!(h.message_count(&good), Some(1));

    // Closing hands the path back to the latest disk content
    h.handle.close_buffer(buffer).unwrap();
    h.settle().await;
    assert_eq!(h.message_count(&good), Some(0));
    assert_eq!(h.context_count(&h.root()), 1);
    assert!(h.fatal.try_recv().is_err());
}

#[tokio::test]
async fn test_deleted_file_stays_while_buffer_is_open() {
    let mut h = Harness::new();
    fs::write(h.path(".rapturelintrc"), CONFIG).unwrap();
    let doomed = h.path("doomed.json");
    fs::write(&doomed, "[").unwrap();
    h.handle.set_project_paths([h.root()]).unwrap();
    h.settle().await;

    let buffer = BufferId(9);
    h.handle.open_buffer(buffer, Some(doomed.clone()), "{").unwrap();
    h.settle().await;
    assert_eq!(h.message_count(&doomed), Some(1));

    // The editor keeps the context alive after the file is deleted
    h.remove("doomed.json");
    h.settle().await;
    assert_eq!(h.context_count(&h.root()), 1);
    assert_eq!(h.message_count(&doomed), Some(1));

    h.sink.clear_calls();
    h.handle.close_buffer(buffer).unwrap();
    h.settle().await;

    assert_eq!(h.context_count(&h.root()), 0);
    assert_eq!(h.sink.calls_for(&doomed), vec![Vec::new()]);
    assert!(h.fatal.try_recv().is_err());
}

#[tokio::test]
async fn test_moved_directory_moves_diagnostics() {
    let mut h = Harness::new();
    fs::write(h.path(".rapturelintrc"), CONFIG).unwrap();
    fs::create_dir_all(h.path("files")).unwrap();
    fs::write(h.path("files/a.json"), "{").unwrap();
    h.handle.set_project_paths([h.root()]).unwrap();
    h.settle().await;
    assert_eq!(h.message_count(&h.path("files/a.json")), Some(1));

    fs::rename(h.path("files"), h.path("moved")).unwrap();
    h.backend.emit(h.path("files"), RawEventKind::Removed);
    h.backend.emit(h.path("moved"), RawEventKind::Added);
    h.settle().await;

    assert_eq!(h.message_count(&h.path("files/a.json")), Some(0));
    assert_eq!(h.message_count(&h.path("moved/a.json")), Some(1));
    assert_eq!(h.context_count(&h.root()), 1);
}

#[tokio::test]
async fn test_dot_prefixed_pattern_validates_files() {
    let mut h = Harness::new();
    fs::write(
        h.path(".rapturelintrc"),
        r#"{ "sessions": [ { "id": "A", "rules": [ { "pattern": "./files/*.json", "rule": "json" } ] } ] }"#,
    )
    .unwrap();
    fs::create_dir_all(h.path("files")).unwrap();
    let bad = h.path("files/bad.json");
    fs::write(&bad, "{").unwrap();

    h.handle.set_project_paths([h.root()]).unwrap();
    h.settle().await;

    assert_eq!(h.message_count(&bad), Some(1));
}

#[tokio::test]
async fn test_buffer_renamed_away_from_missing_file_is_disposed() {
    let mut h = Harness::new();
    fs::write(h.path(".rapturelintrc"), CONFIG).unwrap();
    h.handle.set_project_paths([h.root()]).unwrap();
    h.settle().await;

    let draft = h.path("draft.json");
    let buffer = BufferId(7);
    h.handle.open_buffer(buffer, Some(draft.clone()), "{").unwrap();
    h.settle().await;
    assert_eq!(h.context_count(&h.root()), 1);
    assert_eq!(h.message_count(&draft), Some(1));

    h.handle
        .change_buffer_path(buffer, Some(h.path("draft.txt")))
        .unwrap();
    h.settle().await;

    assert_eq!(h.context_count(&h.root()), 0);
    assert_eq!(h.message_count(&draft), Some(0));
    let cleared = h
        .sink
        .calls_for(&draft)
        .into_iter()
        .filter(|messages| messages.is_empty())
        .count();
    assert_eq!(cleared, 1);
    assert!(h.fatal.try_recv().is_err());
}

#[tokio::test]
async fn test_rename_keeps_context_and_moves_messages() {
    let mut h = Harness::new();
    fs::write(h.path(".rapturelintrc"), CONFIG).unwrap();
    h.handle.set_project_paths([h.root()]).unwrap();
    h.settle().await;

    let before = h.path("before.json");
    let after = h.path("after.json");
    let buffer = BufferId(3);
    h.handle.open_buffer(buffer, Some(before.clone()), "[").unwrap();
    h.settle().await;

    h.handle.change_buffer_path(buffer, Some(after.clone())).unwrap();
    h.settle().await;

    assert_eq!(h.context_count(&h.root()), 1);
    assert_eq!(h.message_count(&before), Some(0));
    assert_eq!(h.message_count(&after), Some(1));
    assert_eq!(h.orchestrator.manager().editors().len(), 1);
}

#[tokio::test]
async fn test_rename_onto_live_context_is_fatal() {
    let mut h = Harness::new();
    fs::write(h.path(".rapturelintrc"), CONFIG).unwrap();
    let a = h.path("a.json");
    let b = h.path("b.json");
    fs::write(&a, "{}").unwrap();
    fs::write(&b, "{}").unwrap();
    h.handle.set_project_paths([h.root()]).unwrap();
    h.settle().await;

    let buffer = BufferId(1);
    h.handle.open_buffer(buffer, Some(a.clone()), "{}").unwrap();
    h.settle().await;
    assert!(h.fatal.try_recv().is_err());

    h.handle.change_buffer_path(buffer, Some(b.clone())).unwrap();
    h.settle().await;

    match h.fatal.try_recv() {
        Ok(ReconcileError::Conflict { path, .. }) => assert_eq!(path, b),
        other => panic!("expected a conflict, got {other:?}"),
    }
}

#[tokio::test]
async fn test_config_becomes_valid_then_disappears() {
    let mut h = Harness::new();
    fs::write(h.path(".rapturelintrc"), "{ not json").unwrap();
    let test_json = h.path("test.json");
    fs::write(&test_json, "{").unwrap();

    h.handle.set_project_paths([h.root()]).unwrap();
    h.settle().await;
    assert_eq!(h.session_count(&h.root()), 0);
    assert_eq!(h.message_count(&test_json), None);

    h.write(".rapturelintrc", CONFIG);
    h.settle().await;
    assert_eq!(h.session_count(&h.root()), 1);
    assert_eq!(h.message_count(&test_json), Some(1));

    h.remove(".rapturelintrc");
    h.settle().await;
    assert_eq!(h.session_count(&h.root()), 0);
    assert_eq!(h.message_count(&test_json), Some(0));
    // Config watcher stays registered
    assert_eq!(h.backend.active_count(), 1);
}

#[tokio::test]
async fn test_open_buffer_is_claimed_when_config_appears() {
    let mut h = Harness::new();
    let good = h.path("good.json");
    fs::write(&good, "{}").unwrap();
    h.handle.set_project_paths([h.root()]).unwrap();
    h.settle().await;

    h.handle.open_buffer(BufferId(4), Some(good.clone()), "{").unwrap();
    h.handle.open_buffer(BufferId(5), None, "{").unwrap();
    h.settle().await;
    assert_eq!(h.message_count(&good), None);

    h.write(".rapturelintrc", CONFIG);
    h.settle().await;

    // Buffer text, not the valid disk content
    assert_eq!(h.message_count(&good), Some(1));
    assert_eq!(h.context_count(&h.root()), 1);
}

#[tokio::test]
async fn test_removing_one_project_leaves_the_other() {
    let mut h = Harness::new();
    for project in ["one", "two"] {
        fs::create_dir_all(h.path(project)).unwrap();
        fs::write(h.path(&format!("{project}/.rapturelintrc")), CONFIG).unwrap();
        fs::write(h.path(&format!("{project}/bad.json")), "{").unwrap();
    }
    let one = h.path("one");
    let two = h.path("two");

    h.handle
        .set_project_paths([one.clone(), two.clone()])
        .unwrap();
    h.settle().await;
    assert_eq!(h.orchestrator.manager().project_roots(), vec![one.clone(), two.clone()]);

    h.handle.set_project_paths([two.clone()]).unwrap();
    h.settle().await;

    assert_eq!(h.orchestrator.manager().project_count(), 1);
    assert_eq!(h.message_count(&one.join("bad.json")), Some(0));
    assert_eq!(h.message_count(&two.join("bad.json")), Some(1));

    h.write("two/bad.json", "{}");
    h.settle().await;
    assert_eq!(h.message_count(&two.join("bad.json")), Some(0));
}

#[tokio::test]
async fn test_stop_tears_down_everything() {
    let mut h = Harness::new();
    fs::write(h.path(".rapturelintrc"), CONFIG).unwrap();
    fs::write(h.path("bad.json"), "{").unwrap();
    h.handle.set_project_paths([h.root()]).unwrap();
    h.handle
        .open_buffer(BufferId(1), Some(h.path("bad.json")), "{")
        .unwrap();
    h.settle().await;

    h.handle.stop().unwrap();
    h.settle().await;

    assert!(h.orchestrator.is_stopped());
    assert_eq!(h.orchestrator.manager().project_count(), 0);
    assert!(h.orchestrator.manager().editors().is_empty());
    assert_eq!(h.backend.active_count(), 0);
    assert_eq!(h.sink.dispose_count(), 1);
}

#[tokio::test]
async fn test_notify_backend_follows_real_changes() {
    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join(".rapturelintrc"), CONFIG).unwrap();
    let watched = dir.path().join("watched.json");
    fs::write(&watched, "{}").unwrap();

    let sink = Arc::new(MemorySink::new());
    let (orchestrator, handle) = Orchestrator::builder()
        .settings(Settings {
            debounce_ms: 10,
            tick_ms: 5,
            ..Settings::default()
        })
        .engine(Arc::new(JsonEngine::new()))
        .resolver(Arc::new(json_rules()))
        .sink(sink.clone())
        .build()
        .unwrap();
    let task = tokio::spawn(orchestrator.run());

    handle.set_project_paths([dir.path().to_path_buf()]).unwrap();
    assert!(wait_for(&sink, &watched, 0).await);

    fs::write(&watched, "{").unwrap();
    assert!(wait_for(&sink, &watched, 1).await);

    handle.stop().unwrap();
    tokio::time::timeout(std::time::Duration::from_secs(5), task)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(sink.dispose_count(), 1);
}

/// Poll until `path` has exactly `count` messages, for at most ten seconds.
async fn wait_for(sink: &MemorySink, path: &Path, count: usize) -> bool {
    for _ in 0..200 {
        if sink.messages(path).map(|m| m.len()) == Some(count) {
            return true;
        }
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    }
    false
}
