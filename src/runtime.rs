//! Orchestrator event loop.
//!
//! Every state change happens on this loop, one event at a time:
//! - raw file system events from the watch backend
//! - project events forwarded by watcher subscriptions
//! - host events (project set, editor buffers, stop)
//! - a periodic tick flushing debounced file changes
//!
//! ```ignore
//! let (orchestrator, handle) = Orchestrator::builder()
//!     .engine(Arc::new(JsonEngine::new()))
//!     .resolver(Arc::new(json_rules()))
//!     .sink(sink)
//!     .build()?;
//! tokio::spawn(orchestrator.run());
//! handle.set_project_paths([root])?;
//! ```

use std::ops::ControlFlow;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::time::{Duration, sleep};

use crate::config::Settings;
use crate::engine::{RuleEngine, RuleResolver};
use crate::error::ReconcileError;
use crate::project::{BufferId, EditorEvent, EventForwarder, ProjectEvent, ProjectManager, WatchContext};
use crate::sink::IssueSink;
use crate::watcher::{
    Debouncer, NotifyBackend, RawEvent, RawEventKind, RawEventReceiver, WatchBackend, WatchError,
    WatchId,
};

/// Requests from the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostEvent {
    /// Replace the set of open project roots.
    SetProjectPaths(Vec<PathBuf>),
    Editor(EditorEvent),
    /// Tear everything down and leave the loop.
    Stop,
}

#[derive(Debug)]
enum LoopEvent {
    Project(ProjectEvent),
    Host(HostEvent),
}

/// Cloneable host-side handle to a running orchestrator.
#[derive(Debug, Clone)]
pub struct OrchestratorHandle {
    tx: mpsc::UnboundedSender<LoopEvent>,
}

impl OrchestratorHandle {
    pub fn send(&self, event: HostEvent) -> Result<(), WatchError> {
        self.tx
            .send(LoopEvent::Host(event))
            .map_err(|_| WatchError::ChannelClosed)
    }

    pub fn set_project_paths<I, P>(&self, paths: I) -> Result<(), WatchError>
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        self.send(HostEvent::SetProjectPaths(
            paths.into_iter().map(Into::into).collect(),
        ))
    }

    pub fn open_buffer(
        &self,
        buffer: BufferId,
        path: Option<PathBuf>,
        text: impl Into<String>,
    ) -> Result<(), WatchError> {
        self.send(HostEvent::Editor(EditorEvent::Opened {
            buffer,
            path,
            text: text.into(),
        }))
    }

    pub fn change_buffer_path(&self, buffer: BufferId, path: Option<PathBuf>) -> Result<(), WatchError> {
        self.send(HostEvent::Editor(EditorEvent::PathChanged { buffer, path }))
    }

    pub fn change_buffer_text(&self, buffer: BufferId, text: impl Into<String>) -> Result<(), WatchError> {
        self.send(HostEvent::Editor(EditorEvent::TextChanged {
            buffer,
            text: text.into(),
        }))
    }

    pub fn close_buffer(&self, buffer: BufferId) -> Result<(), WatchError> {
        self.send(HostEvent::Editor(EditorEvent::Closed { buffer }))
    }

    pub fn stop(&self) -> Result<(), WatchError> {
        self.send(HostEvent::Stop)
    }
}

/// Owns all orchestrator state and the loop that mutates it.
pub struct Orchestrator {
    manager: ProjectManager,
    sink: Arc<dyn IssueSink>,
    raw_rx: RawEventReceiver,
    events_rx: mpsc::UnboundedReceiver<LoopEvent>,
    debouncer: Debouncer<(WatchId, PathBuf)>,
    tick: Duration,
    fatal: Option<mpsc::UnboundedSender<ReconcileError>>,
    stopped: bool,
}

impl Orchestrator {
    pub fn builder() -> OrchestratorBuilder {
        OrchestratorBuilder::new()
    }

    pub fn manager(&self) -> &ProjectManager {
        &self.manager
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    /// Run until [`HostEvent::Stop`] has been processed.
    pub async fn run(mut self) {
        crate::log_event!("runtime", "started");

        loop {
            // Periodic check for debounced events
            let timeout = sleep(self.tick);
            tokio::pin!(timeout);

            tokio::select! {
                Some(raw) = self.raw_rx.recv() => {
                    self.on_raw(raw).await;
                }

                Some(event) = self.events_rx.recv() => {
                    if self.dispatch(event).await.is_break() {
                        break;
                    }
                }

                _ = &mut timeout => {
                    self.flush_debounced().await;
                }
            }
        }

        crate::log_event!("runtime", "stopped");
    }

    /// Process every queued event without waiting, including debounced
    /// changes that are already due. Returns the number of events handled.
    pub async fn drain(&mut self) -> usize {
        let mut processed = 0;

        loop {
            if let Ok(raw) = self.raw_rx.try_recv() {
                processed += 1;
                self.on_raw(raw).await;
                continue;
            }

            if let Ok(event) = self.events_rx.try_recv() {
                processed += 1;
                if self.dispatch(event).await.is_break() {
                    break;
                }
                continue;
            }

            let ready = self.debouncer.take_ready();
            if ready.is_empty() {
                break;
            }
            processed += ready.len();
            self.process_ready(ready).await;
        }

        processed
    }

    /// Dispose projects (reverse creation order), release editors, then the
    /// sink. Idempotent.
    pub fn shutdown(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        self.debouncer.clear();
        self.manager.shutdown();
        self.sink.dispose();
        crate::log_event!("runtime", "shut down");
    }

    async fn on_raw(&mut self, event: RawEvent) {
        if self.stopped {
            return;
        }

        match event.kind {
            RawEventKind::Added | RawEventKind::Changed if !self.debouncer.is_immediate() => {
                self.debouncer.record((event.watch, event.path));
            }
            RawEventKind::Removed => {
                // Handle deletions immediately
                self.debouncer.remove(&(event.watch, event.path.clone()));
                self.manager.handle_raw_event(event).await;
            }
            _ => self.manager.handle_raw_event(event).await,
        }
    }

    async fn flush_debounced(&mut self) {
        let ready = self.debouncer.take_ready();
        self.process_ready(ready).await;
    }

    async fn process_ready(&mut self, ready: Vec<(WatchId, PathBuf)>) {
        for (watch, path) in ready {
            let event = RawEvent {
                watch,
                kind: RawEventKind::Changed,
                path,
            };
            self.manager.handle_raw_event(event).await;
        }
    }

    async fn dispatch(&mut self, event: LoopEvent) -> ControlFlow<()> {
        if self.stopped {
            return ControlFlow::Break(());
        }

        match event {
            LoopEvent::Project(ProjectEvent::Config { project, config }) => {
                let result = self.manager.apply_config(project, config).await;
                self.report(result);
            }
            LoopEvent::Project(ProjectEvent::File {
                project,
                watch,
                path,
                content,
            }) => {
                self.manager
                    .apply_file_update(project, watch, &path, &content);
            }
            LoopEvent::Host(HostEvent::SetProjectPaths(paths)) => {
                self.manager.set_project_paths(paths).await;
            }
            LoopEvent::Host(HostEvent::Editor(event)) => {
                let result = self.manager.handle_editor_event(event);
                self.report(result);
            }
            LoopEvent::Host(HostEvent::Stop) => {
                self.shutdown();
                return ControlFlow::Break(());
            }
        }

        ControlFlow::Continue(())
    }

    fn report(&self, result: Result<(), ReconcileError>) {
        if let Err(e) = result {
            tracing::error!("[runtime] reconciliation failed: {e}");
            if let Some(fatal) = &self.fatal {
                let _ = fatal.send(e);
            }
        }
    }
}

/// Builder for constructing an [`Orchestrator`].
pub struct OrchestratorBuilder {
    settings: Settings,
    engine: Option<Arc<dyn RuleEngine>>,
    resolver: Option<Arc<dyn RuleResolver>>,
    sink: Option<Arc<dyn IssueSink>>,
    backend: Option<Arc<dyn WatchBackend>>,
    fatal: Option<mpsc::UnboundedSender<ReconcileError>>,
}

impl OrchestratorBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self {
            settings: Settings::default(),
            engine: None,
            resolver: None,
            sink: None,
            backend: None,
            fatal: None,
        }
    }

    pub fn settings(mut self, settings: Settings) -> Self {
        self.settings = settings;
        self
    }

    /// Set the rule-evaluation engine.
    pub fn engine(mut self, engine: Arc<dyn RuleEngine>) -> Self {
        self.engine = Some(engine);
        self
    }

    /// Set the resolver for rule references in configuration files.
    pub fn resolver(mut self, resolver: Arc<dyn RuleResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Set the issue sink.
    pub fn sink(mut self, sink: Arc<dyn IssueSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Replace the default `notify` backend.
    pub fn backend(mut self, backend: Arc<dyn WatchBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Receive reconciliation invariant violations.
    pub fn fatal_errors(mut self, tx: mpsc::UnboundedSender<ReconcileError>) -> Self {
        self.fatal = Some(tx);
        self
    }

    pub fn build(self) -> Result<(Orchestrator, OrchestratorHandle), WatchError> {
        let engine = self.engine.ok_or_else(|| WatchError::InitFailed {
            reason: "Engine is required".to_string(),
        })?;
        let resolver = self.resolver.ok_or_else(|| WatchError::InitFailed {
            reason: "Resolver is required".to_string(),
        })?;
        let sink = self.sink.ok_or_else(|| WatchError::InitFailed {
            reason: "Sink is required".to_string(),
        })?;
        let backend = self
            .backend
            .unwrap_or_else(|| Arc::new(NotifyBackend::new()));

        let (raw_tx, raw_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let forward_tx = events_tx.clone();
        let forwarder = EventForwarder::new(move |event| {
            // Closed only after the loop is gone
            let _ = forward_tx.send(LoopEvent::Project(event));
        });

        let manager = ProjectManager::new(
            &self.settings,
            engine,
            resolver,
            Arc::clone(&sink),
            WatchContext {
                backend,
                raw_events: raw_tx,
                follow_links: self.settings.follow_links,
            },
            forwarder,
        );

        let orchestrator = Orchestrator {
            manager,
            sink,
            raw_rx,
            events_rx,
            debouncer: Debouncer::new(self.settings.debounce_ms),
            tick: Duration::from_millis(self.settings.tick_ms.max(1)),
            fatal: self.fatal,
            stopped: false,
        };

        Ok((orchestrator, OrchestratorHandle { tx: events_tx }))
    }
}

impl Default for OrchestratorBuilder {
    fn default() -> Self {
        Self::new()
    }
}
