//! Project Manager: the tracked project set and everything it owns.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use indexmap::{IndexMap, IndexSet};

use super::editor::{EditorEvent, EditorSynchronizer};
use super::registry::{SessionRegistry, WatchContext};
use super::{EventForwarder, ProjectEvent, ProjectId, SessionKey, normalize_path};
use crate::config::Settings;
use crate::configuration::Configuration;
use crate::engine::{RuleEngine, RuleResolver};
use crate::error::ReconcileError;
use crate::sink::IssueSink;
use crate::watcher::{ConfigWatcher, FileContent, RawEvent, WatchId};

/// One open project root.
pub struct Project {
    id: ProjectId,
    root: PathBuf,
    config_watcher: ConfigWatcher,
    config: Option<Arc<Configuration>>,
    registry: SessionRegistry,
}

impl Project {
    pub fn id(&self) -> ProjectId {
        self.id
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Configuration the registry was last built from.
    pub fn config(&self) -> Option<&Arc<Configuration>> {
        self.config.as_ref()
    }

    pub fn config_watcher(&self) -> &ConfigWatcher {
        &self.config_watcher
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    /// Config Watcher first, then the registry contents.
    fn dispose(&mut self) -> Vec<SessionKey> {
        self.config_watcher.dispose();
        self.config = None;
        self.registry.teardown()
    }
}

pub struct ProjectManager {
    config_file_name: String,
    engine: Arc<dyn RuleEngine>,
    resolver: Arc<dyn RuleResolver>,
    sink: Arc<dyn IssueSink>,
    watch: WatchContext,
    forwarder: EventForwarder,
    projects: IndexMap<PathBuf, Project>,
    editors: EditorSynchronizer,
}

impl ProjectManager {
    pub fn new(
        settings: &Settings,
        engine: Arc<dyn RuleEngine>,
        resolver: Arc<dyn RuleResolver>,
        sink: Arc<dyn IssueSink>,
        watch: WatchContext,
        forwarder: EventForwarder,
    ) -> Self {
        Self {
            config_file_name: settings.config_file_name.clone(),
            engine,
            resolver,
            sink,
            watch,
            forwarder,
            projects: IndexMap::new(),
            editors: EditorSynchronizer::new(),
        }
    }

    pub fn project_count(&self) -> usize {
        self.projects.len()
    }

    /// Tracked roots in creation order.
    pub fn project_roots(&self) -> Vec<PathBuf> {
        self.projects.keys().cloned().collect()
    }

    pub fn project(&self, root: &Path) -> Option<&Project> {
        self.projects.get(&normalize_path(root.to_path_buf()))
    }

    pub fn projects(&self) -> impl Iterator<Item = &Project> {
        self.projects.values()
    }

    pub fn editors(&self) -> &EditorSynchronizer {
        &self.editors
    }

    /// Replace the tracked project set. Roots present before and after are
    /// left untouched.
    pub async fn set_project_paths(&mut self, paths: impl IntoIterator<Item = PathBuf>) {
        let wanted: IndexSet<PathBuf> = paths.into_iter().map(normalize_path).collect();

        let stale: Vec<PathBuf> = self
            .projects
            .keys()
            .filter(|root| !wanted.contains(*root))
            .cloned()
            .collect();
        for root in stale {
            if let Some(mut project) = self.projects.shift_remove(&root) {
                let keys = project.dispose();
                self.editors.forget_sessions(&keys);
                crate::log_event!("projects", "removed", "{}", root.display());
            }
        }

        for root in wanted {
            if !self.projects.contains_key(&root) {
                self.add_project(root).await;
            }
        }
    }

    async fn add_project(&mut self, root: PathBuf) {
        let id = ProjectId::next();
        let mut config_watcher = match ConfigWatcher::watch(
            &root,
            &self.config_file_name,
            Arc::clone(&self.resolver),
            self.watch.backend.as_ref(),
            &self.watch.raw_events,
        )
        .await
        {
            Ok(watcher) => watcher,
            Err(e) => {
                tracing::warn!("[projects] cannot track {}: {e}", root.display());
                return;
            }
        };

        let forwarder = self.forwarder.clone();
        config_watcher.on_update(move |config| {
            forwarder.send(ProjectEvent::Config {
                project: id,
                config: config.cloned(),
            })
        });

        let registry = SessionRegistry::new(
            id,
            root.clone(),
            Arc::clone(&self.engine),
            Arc::clone(&self.sink),
        );
        crate::log_event!("projects", "added", "{id} {}", root.display());
        self.projects.insert(
            root.clone(),
            Project {
                id,
                root,
                config_watcher,
                config: None,
                registry,
            },
        );
    }

    /// Rebuild a project's registry for a newly published configuration.
    pub async fn apply_config(
        &mut self,
        project: ProjectId,
        config: Option<Arc<Configuration>>,
    ) -> Result<(), ReconcileError> {
        let Some(project) = self.projects.values_mut().find(|p| p.id == project) else {
            crate::debug_event!("projects", "stale config", "{project}");
            return Ok(());
        };

        let unchanged = match (&project.config, &config) {
            (None, None) => true,
            (Some(current), Some(next)) => Arc::ptr_eq(current, next),
            _ => false,
        };
        if unchanged {
            return Ok(());
        }

        project.config = config.clone();
        let keys = project.registry.teardown();
        self.editors.forget_sessions(&keys);

        match config {
            Some(config) => {
                project
                    .registry
                    .build(&config, &self.watch, &self.forwarder)
                    .await;
                self.editors.claim_globs(&mut project.registry)
            }
            None => {
                crate::log_event!("projects", "no configuration", "{}", project.root.display());
                Ok(())
            }
        }
    }

    /// Route one File Watcher update to its project.
    pub fn apply_file_update(
        &mut self,
        project: ProjectId,
        watch: WatchId,
        path: &Path,
        content: &FileContent,
    ) {
        match self.projects.values_mut().find(|p| p.id == project) {
            Some(project) => {
                project
                    .registry
                    .apply_file_update(watch, path, content, &self.editors)
            }
            None => crate::debug_event!("projects", "stale update", "{project} {}", path.display()),
        }
    }

    /// Route one raw file system event to the watcher that registered it.
    pub async fn handle_raw_event(&mut self, event: RawEvent) {
        for project in self.projects.values_mut() {
            if project.config_watcher.id() == event.watch {
                project.config_watcher.handle(event).await;
                return;
            }
            if let Some(watcher) = project.registry.watcher_mut(event.watch) {
                watcher.handle(event).await;
                return;
            }
        }
        crate::debug_event!("projects", "stale event", "{} {}", event.watch, event.path.display());
    }

    /// Apply one host editor event across every project.
    pub fn handle_editor_event(&mut self, event: EditorEvent) -> Result<(), ReconcileError> {
        let event = match event {
            EditorEvent::Opened { buffer, path, text } => EditorEvent::Opened {
                buffer,
                path: path.map(normalize_path),
                text,
            },
            EditorEvent::PathChanged { buffer, path } => EditorEvent::PathChanged {
                buffer,
                path: path.map(normalize_path),
            },
            other => other,
        };

        let mut registries: Vec<&mut SessionRegistry> = self
            .projects
            .values_mut()
            .map(|project| &mut project.registry)
            .collect();
        self.editors.handle(event, &mut registries)
    }

    /// Dispose every project in reverse creation order, then release all
    /// editor contexts. Idempotent.
    pub fn shutdown(&mut self) {
        while let Some((root, mut project)) = self.projects.pop() {
            project.dispose();
            crate::debug_event!("projects", "disposed", "{}", root.display());
        }
        self.editors.release_all();
    }
}
