//! Editor Synchronizer.
//!
//! Open buffers take authority over the artifact contexts their path maps
//! to. Authority is tracked per (session, path) as the set of buffers
//! claiming it; while that set is non-empty, disk updates for the pair are
//! ignored. When the last claim goes away, the context is handed back to the
//! disk view: refreshed from what the file watcher knows, or disposed if the
//! file is gone.
//!
//! Every path transition of a buffer runs one reconciliation pass over the
//! globs of every project. Within a registry, each session acts once per
//! pass: its globs are merged, so a path counts as matched if any of the
//! session's globs match it.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};

use super::SessionKey;
use super::registry::{Glob, SessionRegistry};
use crate::engine::Rule;
use crate::error::ReconcileError;

/// Host-assigned identity of an open buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferId(pub u64);

impl fmt::Display for BufferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "buffer#{}", self.0)
    }
}

/// An artifact context address: one path inside one live session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContextKey {
    pub session: SessionKey,
    pub path: PathBuf,
}

impl ContextKey {
    pub fn new(session: SessionKey, path: impl Into<PathBuf>) -> Self {
        Self {
            session,
            path: path.into(),
        }
    }
}

/// Answers whether an editor currently owns a (session, path) pair.
pub trait AuthorityView {
    fn is_claimed(&self, session: SessionKey, path: &Path) -> bool;
}

/// Buffer lifecycle notifications from the host editor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EditorEvent {
    Opened {
        buffer: BufferId,
        path: Option<PathBuf>,
        text: String,
    },
    PathChanged {
        buffer: BufferId,
        path: Option<PathBuf>,
    },
    TextChanged {
        buffer: BufferId,
        text: String,
    },
    Closed {
        buffer: BufferId,
    },
}

/// State of one open buffer.
#[derive(Debug, Clone)]
pub struct EditorContext {
    id: BufferId,
    path: Option<PathBuf>,
    text: String,
    backs: BTreeSet<ContextKey>,
}

impl EditorContext {
    pub fn id(&self) -> BufferId {
        self.id
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    /// Artifact contexts this buffer currently backs.
    pub fn backs(&self) -> impl Iterator<Item = &ContextKey> {
        self.backs.iter()
    }
}

/// Per-session outcome of matching one pass's paths against a registry.
struct SessionMatch {
    session: SessionKey,
    old_rule: Option<Rule>,
    new_rule: Option<Rule>,
}

fn session_matches(globs: &[Glob], old: Option<&Path>, new: Option<&Path>) -> Vec<SessionMatch> {
    let mut matches: Vec<SessionMatch> = Vec::new();

    for glob in globs {
        let index = match matches.iter().position(|m| m.session == glob.session) {
            Some(index) => index,
            None => {
                matches.push(SessionMatch {
                    session: glob.session,
                    old_rule: None,
                    new_rule: None,
                });
                matches.len() - 1
            }
        };
        let entry = &mut matches[index];

        // First declared matching glob provides the rule
        if entry.old_rule.is_none() && old.is_some_and(|p| glob.pattern.matches(p)) {
            entry.old_rule = Some(glob.rule.clone());
        }
        if entry.new_rule.is_none() && new.is_some_and(|p| glob.pattern.matches(p)) {
            entry.new_rule = Some(glob.rule.clone());
        }
    }

    matches
}

/// Keep the first error of a pass; later ones are only logged.
fn keep_first(result: &mut Result<(), ReconcileError>, outcome: Result<(), ReconcileError>) {
    if let Err(e) = outcome {
        if result.is_ok() {
            *result = Err(e);
        } else {
            tracing::error!("[editor] {e}");
        }
    }
}

#[derive(Debug, Default)]
pub struct EditorSynchronizer {
    contexts: BTreeMap<BufferId, EditorContext>,
    claims: HashMap<ContextKey, BTreeSet<BufferId>>,
}

impl EditorSynchronizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn context(&self, buffer: BufferId) -> Option<&EditorContext> {
        self.contexts.get(&buffer)
    }

    pub fn contexts(&self) -> impl Iterator<Item = &EditorContext> {
        self.contexts.values()
    }

    pub fn len(&self) -> usize {
        self.contexts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contexts.is_empty()
    }

    /// Number of buffers claiming `(session, path)`.
    pub fn claimants(&self, session: SessionKey, path: &Path) -> usize {
        self.claims
            .get(&ContextKey::new(session, path))
            .map_or(0, BTreeSet::len)
    }

    /// Dispatch one host event.
    pub fn handle(
        &mut self,
        event: EditorEvent,
        registries: &mut [&mut SessionRegistry],
    ) -> Result<(), ReconcileError> {
        match event {
            EditorEvent::Opened { buffer, path, text } => self.open(buffer, path, text, registries),
            EditorEvent::PathChanged { buffer, path } => self.change_path(buffer, path, registries),
            EditorEvent::TextChanged { buffer, text } => self.change_text(buffer, text, registries),
            EditorEvent::Closed { buffer } => self.close(buffer, registries),
        }
    }

    /// A buffer was opened. Reopening a known id closes it first.
    pub fn open(
        &mut self,
        buffer: BufferId,
        path: Option<PathBuf>,
        text: String,
        registries: &mut [&mut SessionRegistry],
    ) -> Result<(), ReconcileError> {
        let mut result = Ok(());
        if self.contexts.contains_key(&buffer) {
            keep_first(&mut result, self.close(buffer, registries));
        }

        crate::debug_event!("editor", "opened", "{buffer} {path:?}");
        self.contexts.insert(
            buffer,
            EditorContext {
                id: buffer,
                path: path.clone(),
                text,
                backs: BTreeSet::new(),
            },
        );
        keep_first(&mut result, self.reconcile(buffer, None, path.as_deref(), registries));
        result
    }

    /// The buffer's path changed (save-as, rename, first save).
    pub fn change_path(
        &mut self,
        buffer: BufferId,
        path: Option<PathBuf>,
        registries: &mut [&mut SessionRegistry],
    ) -> Result<(), ReconcileError> {
        let Some(context) = self.contexts.get_mut(&buffer) else {
            crate::debug_event!("editor", "unknown buffer", "{buffer}");
            return Ok(());
        };
        let old = std::mem::replace(&mut context.path, path.clone());
        crate::debug_event!("editor", "path changed", "{buffer} {old:?} -> {path:?}");
        self.reconcile(buffer, old.as_deref(), path.as_deref(), registries)
    }

    /// The buffer's text settled. Every backed context gets the new text.
    pub fn change_text(
        &mut self,
        buffer: BufferId,
        text: String,
        registries: &mut [&mut SessionRegistry],
    ) -> Result<(), ReconcileError> {
        let Some(context) = self.contexts.get_mut(&buffer) else {
            crate::debug_event!("editor", "unknown buffer", "{buffer}");
            return Ok(());
        };
        context.text = text;

        let mut result = Ok(());
        for key in &context.backs {
            let outcome = match registries.iter_mut().find(|r| r.has_session(key.session)) {
                Some(registry) => {
                    if registry.update_context(key.session, &key.path, Some(&context.text)) {
                        Ok(())
                    } else {
                        Err(ReconcileError::MissingArtifactContext {
                            session: registry.session_label(key.session),
                            path: key.path.clone(),
                        })
                    }
                }
                None => Err(ReconcileError::MissingArtifactContext {
                    session: key.session.to_string(),
                    path: key.path.clone(),
                }),
            };
            keep_first(&mut result, outcome);
        }
        result
    }

    /// The buffer was closed: authority returns to disk.
    pub fn close(
        &mut self,
        buffer: BufferId,
        registries: &mut [&mut SessionRegistry],
    ) -> Result<(), ReconcileError> {
        let Some(context) = self.contexts.get(&buffer) else {
            return Ok(());
        };
        let old = context.path.clone();
        let result = self.reconcile(buffer, old.as_deref(), None, registries);

        if let Some(context) = self.contexts.remove(&buffer) {
            for key in &context.backs {
                self.drop_claim(buffer, key);
            }
        }
        crate::debug_event!("editor", "closed", "{buffer}");
        result
    }

    /// Claim matching paths of open buffers for a freshly built registry.
    pub fn claim_globs(&mut self, registry: &mut SessionRegistry) -> Result<(), ReconcileError> {
        let open: Vec<(BufferId, PathBuf)> = self
            .contexts
            .values()
            .filter_map(|c| c.path.clone().map(|p| (c.id, p)))
            .collect();

        let mut result = Ok(());
        for (buffer, path) in open {
            keep_first(
                &mut result,
                self.reconcile_registry(buffer, None, Some(&path), registry),
            );
        }
        result
    }

    /// Drop all bookkeeping for sessions that no longer exist.
    pub fn forget_sessions(&mut self, keys: &[SessionKey]) {
        if keys.is_empty() {
            return;
        }
        self.claims.retain(|key, _| !keys.contains(&key.session));
        for context in self.contexts.values_mut() {
            context.backs.retain(|key| !keys.contains(&key.session));
        }
    }

    /// Release every buffer without touching any session.
    pub fn release_all(&mut self) {
        self.contexts.clear();
        self.claims.clear();
    }

    /// One reconciliation pass for `buffer` moving from `old` to `new`.
    fn reconcile(
        &mut self,
        buffer: BufferId,
        old: Option<&Path>,
        new: Option<&Path>,
        registries: &mut [&mut SessionRegistry],
    ) -> Result<(), ReconcileError> {
        if old == new {
            return Ok(());
        }
        let mut result = Ok(());
        for registry in registries.iter_mut() {
            keep_first(&mut result, self.reconcile_registry(buffer, old, new, registry));
        }
        result
    }

    fn reconcile_registry(
        &mut self,
        buffer: BufferId,
        old: Option<&Path>,
        new: Option<&Path>,
        registry: &mut SessionRegistry,
    ) -> Result<(), ReconcileError> {
        let text = self
            .contexts
            .get(&buffer)
            .map(|c| c.text.clone())
            .unwrap_or_default();

        let mut result = Ok(());
        for m in session_matches(registry.globs(), old, new) {
            let old_hit = old.zip(m.old_rule.as_ref());
            let new_hit = new.zip(m.new_rule.as_ref());
            let outcome = match (old_hit, new_hit) {
                (Some((old, old_rule)), Some((new, rule))) => {
                    self.rename(buffer, m.session, (old, old_rule), (new, rule), &text, registry)
                }
                (Some((old, _)), None) => self.release_to_disk(buffer, m.session, old, registry),
                (None, Some((new, rule))) => self.adopt(buffer, m.session, new, rule, &text, registry),
                (None, None) => Ok(()),
            };
            keep_first(&mut result, outcome);
        }
        result
    }

    /// Both paths match: move the context in place.
    fn rename(
        &mut self,
        buffer: BufferId,
        session: SessionKey,
        (old, old_rule): (&Path, &Rule),
        (new, rule): (&Path, &Rule),
        text: &str,
        registry: &mut SessionRegistry,
    ) -> Result<(), ReconcileError> {
        let old_key = ContextKey::new(session, old);
        let held = self.backs(buffer, &old_key);
        self.drop_claim(buffer, &old_key);

        // Other buffers keep the old context: start a new one instead
        if !held || self.is_claimed_key(&old_key) {
            return self.adopt(buffer, session, new, rule, text, registry);
        }

        if let Err(e) = registry.rename_context(session, old, new) {
            // Leave the old claim as it was
            self.add_claim(buffer, old_key);
            return Err(e);
        }
        self.add_claim(buffer, ContextKey::new(session, new));

        // A file left behind on disk goes back to the disk view
        if let Some(content) = registry.disk_content(session, old)
            && !content.is_removed()
        {
            registry
                .upsert_context(session, old, old_rule, content.as_engine_input())
                .map_err(|source| ReconcileError::Engine {
                    path: old.to_path_buf(),
                    source,
                })?;
        }
        Ok(())
    }

    /// Only the old path matches: hand the context back to disk.
    fn release_to_disk(
        &mut self,
        buffer: BufferId,
        session: SessionKey,
        old: &Path,
        registry: &mut SessionRegistry,
    ) -> Result<(), ReconcileError> {
        let key = ContextKey::new(session, old);
        let held = self.backs(buffer, &key);
        self.drop_claim(buffer, &key);
        if !held || self.is_claimed_key(&key) {
            return Ok(());
        }

        let handed_back = match registry.disk_content(session, old) {
            Some(content) if !content.is_removed() => {
                registry.update_context(session, old, content.as_engine_input())
            }
            _ => registry.dispose_context(session, old),
        };

        if handed_back {
            Ok(())
        } else {
            Err(ReconcileError::MissingArtifactContext {
                session: registry.session_label(session),
                path: old.to_path_buf(),
            })
        }
    }

    /// Only the new path matches: the buffer takes over (or creates) the
    /// context.
    fn adopt(
        &mut self,
        buffer: BufferId,
        session: SessionKey,
        new: &Path,
        rule: &Rule,
        text: &str,
        registry: &mut SessionRegistry,
    ) -> Result<(), ReconcileError> {
        self.add_claim(buffer, ContextKey::new(session, new));
        if let Err(source) = registry.upsert_context(session, new, rule, Some(text)) {
            self.drop_claim(buffer, &ContextKey::new(session, new));
            return Err(ReconcileError::Engine {
                path: new.to_path_buf(),
                source,
            });
        }
        Ok(())
    }

    fn backs(&self, buffer: BufferId, key: &ContextKey) -> bool {
        self.contexts
            .get(&buffer)
            .is_some_and(|c| c.backs.contains(key))
    }

    fn is_claimed_key(&self, key: &ContextKey) -> bool {
        self.claims.get(key).is_some_and(|set| !set.is_empty())
    }

    fn add_claim(&mut self, buffer: BufferId, key: ContextKey) {
        if let Some(context) = self.contexts.get_mut(&buffer) {
            context.backs.insert(key.clone());
        }
        self.claims.entry(key).or_default().insert(buffer);
    }

    fn drop_claim(&mut self, buffer: BufferId, key: &ContextKey) {
        if let Some(context) = self.contexts.get_mut(&buffer) {
            context.backs.remove(key);
        }
        if let Some(set) = self.claims.get_mut(key) {
            set.remove(&buffer);
            if set.is_empty() {
                self.claims.remove(key);
            }
        }
    }
}

impl AuthorityView for EditorSynchronizer {
    fn is_claimed(&self, session: SessionKey, path: &Path) -> bool {
        self.is_claimed_key(&ContextKey::new(session, path))
    }
}
