//! File system watching.
//!
//! # Architecture
//!
//! ```text
//! WatchBackend (notify / manual)
//!   - one registration per watcher, tagged with a WatchId
//!   - RawEvents flow into the orchestrator's channel
//!         |
//!    +----+------------+
//!    |                 |
//! ConfigWatcher     FileWatcher (one per glob)
//!   current: Option     current: path -> FileContent
//!   subscribers         subscribers
//! ```
//!
//! Watchers do not own a task. The orchestrator loop routes each raw event
//! to the watcher whose id it carries, and the watcher updates its state and
//! notifies subscribers synchronously.

mod backend;
mod config_watch;
mod debouncer;
mod error;
mod file_watch;
mod pattern;
mod subscribers;

pub use backend::{
    ManualBackend, NotifyBackend, RawEvent, RawEventKind, RawEventReceiver, RawEventSender,
    WatchBackend, WatchGuard, WatchId, translate,
};
pub use config_watch::ConfigWatcher;
pub use debouncer::Debouncer;
pub use error::WatchError;
pub use file_watch::{FileContent, FileWatcher};
pub use pattern::RootedPattern;
pub use subscribers::Subscribers;
