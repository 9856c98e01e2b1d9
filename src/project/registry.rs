//! Session Registry: one configuration turned into live sessions, file
//! watchers and glob bindings for a single project.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::editor::AuthorityView;
use super::{EventForwarder, ProjectEvent, ProjectId, SessionKey};
use crate::configuration::Configuration;
use crate::engine::{ContextObserver, Issue, Rule, RuleEngine, Session};
use crate::error::{EngineError, ReconcileError};
use crate::sink::{IssueSink, messages_for};
use crate::watcher::{FileContent, FileWatcher, RawEventSender, RootedPattern, WatchBackend, WatchId};

/// Everything needed to start file watchers.
#[derive(Clone)]
pub struct WatchContext {
    pub backend: Arc<dyn WatchBackend>,
    pub raw_events: RawEventSender,
    pub follow_links: bool,
}

/// Pushes artifact context notifications to the issue sink.
pub struct SinkObserver {
    sink: Arc<dyn IssueSink>,
}

impl SinkObserver {
    pub fn new(sink: Arc<dyn IssueSink>) -> Self {
        Self { sink }
    }

    pub fn publish(&self, path: &Path, issues: &[Issue]) {
        self.sink.set_messages(path, messages_for(path, issues));
    }
}

impl ContextObserver for SinkObserver {
    fn issues_changed(&self, path: &Path, issues: &[Issue]) {
        self.publish(path, issues);
    }

    fn disposed(&self, path: &Path) {
        self.sink.set_messages(path, Vec::new());
    }
}

/// A rule declaration bound to its live session.
#[derive(Debug, Clone)]
pub struct Glob {
    pub session: SessionKey,
    pub pattern: RootedPattern,
    pub rule: Rule,
    /// Watcher feeding this glob, `None` if it could not be started.
    pub watch: Option<WatchId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextChange {
    Created,
    Updated,
}

struct SessionSlot {
    key: SessionKey,
    session: Box<dyn Session>,
}

pub struct SessionRegistry {
    project: ProjectId,
    root: PathBuf,
    engine: Arc<dyn RuleEngine>,
    observer: Arc<SinkObserver>,
    sessions: Vec<SessionSlot>,
    watchers: Vec<FileWatcher>,
    globs: Vec<Glob>,
}

impl SessionRegistry {
    pub fn new(
        project: ProjectId,
        root: impl Into<PathBuf>,
        engine: Arc<dyn RuleEngine>,
        sink: Arc<dyn IssueSink>,
    ) -> Self {
        Self {
            project,
            root: root.into(),
            engine,
            observer: Arc::new(SinkObserver::new(sink)),
            sessions: Vec::new(),
            watchers: Vec::new(),
            globs: Vec::new(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn globs(&self) -> &[Glob] {
        &self.globs
    }

    pub fn session_keys(&self) -> Vec<SessionKey> {
        self.sessions.iter().map(|slot| slot.key).collect()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn watcher_count(&self) -> usize {
        self.watchers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty() && self.watchers.is_empty() && self.globs.is_empty()
    }

    pub fn has_session(&self, key: SessionKey) -> bool {
        self.sessions.iter().any(|slot| slot.key == key)
    }

    /// Declared id of a live session, for diagnostics.
    pub fn session_label(&self, key: SessionKey) -> String {
        self.session(key)
            .map(|session| session.id().to_string())
            .unwrap_or_else(|| key.to_string())
    }

    pub fn session(&self, key: SessionKey) -> Option<&dyn Session> {
        self.sessions
            .iter()
            .find(|slot| slot.key == key)
            .map(|slot| slot.session.as_ref())
    }

    fn session_mut(&mut self, key: SessionKey) -> Option<&mut Box<dyn Session>> {
        self.sessions
            .iter_mut()
            .find(|slot| slot.key == key)
            .map(|slot| &mut slot.session)
    }

    pub fn has_watcher(&self, id: WatchId) -> bool {
        self.watchers.iter().any(|w| w.id() == id)
    }

    pub fn watcher_mut(&mut self, id: WatchId) -> Option<&mut FileWatcher> {
        self.watchers.iter_mut().find(|w| w.id() == id)
    }

    /// Dispose file watchers, then sessions. Returns the keys of the
    /// disposed sessions. Idempotent.
    pub fn teardown(&mut self) -> Vec<SessionKey> {
        for watcher in &mut self.watchers {
            watcher.dispose();
        }
        self.watchers.clear();
        self.globs.clear();

        let keys = self.session_keys();
        for slot in &mut self.sessions {
            slot.session.dispose();
        }
        self.sessions.clear();

        if !keys.is_empty() {
            crate::debug_event!("registry", "torn down", "{} ({} sessions)", self.root.display(), keys.len());
        }
        keys
    }

    /// Create sessions, watchers and globs for `config`, in declaration
    /// order. Expects a torn down registry.
    pub async fn build(
        &mut self,
        config: &Configuration,
        watch: &WatchContext,
        forwarder: &EventForwarder,
    ) {
        for declaration in config.sessions() {
            let key = SessionKey::next();
            let session = self.engine.create_session(&declaration.id);
            self.sessions.push(SessionSlot { key, session });

            for rule in &declaration.rules {
                let pattern = match RootedPattern::new(&self.root, &rule.pattern) {
                    Ok(pattern) => pattern,
                    Err(e) => {
                        tracing::error!("[registry] {e}");
                        continue;
                    }
                };

                let watch_id = match FileWatcher::watch(
                    pattern.clone(),
                    watch.backend.as_ref(),
                    &watch.raw_events,
                    watch.follow_links,
                )
                .await
                {
                    Ok(mut watcher) => {
                        let id = watcher.id();
                        let project = self.project;
                        let forwarder = forwarder.clone();
                        watcher.on_update(move |path, content| {
                            forwarder.send(ProjectEvent::File {
                                project,
                                watch: id,
                                path: path.to_path_buf(),
                                content: content.clone(),
                            })
                        });
                        self.watchers.push(watcher);
                        Some(id)
                    }
                    Err(e) => {
                        tracing::warn!("[registry] cannot watch {}: {e}", pattern.as_str());
                        None
                    }
                };

                self.globs.push(Glob {
                    session: key,
                    pattern,
                    rule: rule.rule.clone(),
                    watch: watch_id,
                });
            }
        }

        crate::log_event!(
            "registry",
            "built",
            "{} ({} sessions, {} globs)",
            self.root.display(),
            self.sessions.len(),
            self.globs.len()
        );
    }

    /// Apply one File Watcher update unless an editor owns the path.
    pub fn apply_file_update(
        &mut self,
        watch: WatchId,
        path: &Path,
        content: &FileContent,
        authority: &dyn AuthorityView,
    ) {
        let Some(glob) = self.globs.iter().find(|g| g.watch == Some(watch)) else {
            crate::debug_event!("registry", "stale update", "{watch} {}", path.display());
            return;
        };
        let session = glob.session;
        let rule = glob.rule.clone();

        if authority.is_claimed(session, path) {
            crate::debug_event!("registry", "editor owns", "{}", path.display());
            return;
        }

        match content {
            FileContent::Removed => {
                self.dispose_context(session, path);
            }
            other => {
                if let Err(e) = self.upsert_context(session, path, &rule, other.as_engine_input()) {
                    tracing::error!("[registry] {}: {e}", path.display());
                }
            }
        }
    }

    pub fn has_context(&self, key: SessionKey, path: &Path) -> bool {
        self.session(key)
            .is_some_and(|session| session.artifact_context(path).is_some())
    }

    /// Create the context for `path`, or update it if it already exists.
    pub fn upsert_context(
        &mut self,
        key: SessionKey,
        path: &Path,
        rule: &Rule,
        content: Option<&str>,
    ) -> Result<ContextChange, EngineError> {
        let observer = Arc::clone(&self.observer);
        let session = self
            .session_mut(key)
            .ok_or_else(|| EngineError::Rejected {
                reason: format!("{key} is not live"),
            })?;

        if let Some(context) = session.artifact_context_mut(path) {
            context.update(content);
            return Ok(ContextChange::Updated);
        }

        session.create_artifact_context(path, rule, content, observer.clone())?;
        if let Some(context) = session.artifact_context(path) {
            observer.publish(path, &context.issues());
        }
        crate::debug_event!("registry", "created", "{} in {key}", path.display());
        Ok(ContextChange::Created)
    }

    /// Update an existing context. Returns `false` if there is none.
    pub fn update_context(&mut self, key: SessionKey, path: &Path, content: Option<&str>) -> bool {
        match self
            .session_mut(key)
            .and_then(|session| session.artifact_context_mut(path))
        {
            Some(context) => {
                context.update(content);
                true
            }
            None => false,
        }
    }

    /// Move a context from `old` to `new`, keeping its engine state.
    pub fn rename_context(
        &mut self,
        key: SessionKey,
        old: &Path,
        new: &Path,
    ) -> Result<(), ReconcileError> {
        let label = self.session_label(key);
        let observer = Arc::clone(&self.observer);
        let Some(session) = self.session_mut(key) else {
            return Err(ReconcileError::MissingArtifactContext {
                session: label,
                path: old.to_path_buf(),
            });
        };

        if session.artifact_context(new).is_some() {
            return Err(ReconcileError::Conflict {
                session: label,
                path: new.to_path_buf(),
            });
        }
        if session.artifact_context(old).is_none() {
            return Err(ReconcileError::MissingArtifactContext {
                session: label,
                path: old.to_path_buf(),
            });
        }

        session
            .update_context_id(old, new)
            .map_err(|source| ReconcileError::Engine {
                path: new.to_path_buf(),
                source,
            })?;

        // Diagnostics follow the context to its new path
        observer.disposed(old);
        if let Some(context) = session.artifact_context(new) {
            observer.publish(new, &context.issues());
        }
        crate::debug_event!("registry", "renamed", "{} -> {}", old.display(), new.display());
        Ok(())
    }

    /// Dispose the context for `path`. Returns whether one existed.
    pub fn dispose_context(&mut self, key: SessionKey, path: &Path) -> bool {
        let disposed = self
            .session_mut(key)
            .is_some_and(|session| session.dispose_artifact_context(path));
        if disposed {
            crate::debug_event!("registry", "disposed", "{} in {key}", path.display());
        }
        disposed
    }

    /// What the session's file watchers currently know about `path`.
    pub fn disk_content(&self, key: SessionKey, path: &Path) -> Option<FileContent> {
        self.globs
            .iter()
            .filter(|glob| glob.session == key && glob.pattern.matches(path))
            .filter_map(|glob| glob.watch)
            .filter_map(|id| self.watchers.iter().find(|w| w.id() == id))
            .find_map(|watcher| watcher.current(path).cloned())
    }
}
