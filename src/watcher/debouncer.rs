//! Debouncing of file change events.
//!
//! Editors and formatters often write a file several times in quick
//! succession. Added/changed events are held until their key has been quiet
//! for the configured duration, then released once.

use std::collections::HashMap;
use std::hash::Hash;
use std::time::{Duration, Instant};

/// Debounces events by key.
///
/// Records change timestamps and returns keys that have been stable
/// for the configured duration.
#[derive(Debug)]
pub struct Debouncer<K> {
    /// Pending changes: key -> last change timestamp.
    pending: HashMap<K, Instant>,
    /// How long a key must be stable before processing.
    duration: Duration,
}

impl<K: Eq + Hash + Clone> Debouncer<K> {
    /// Create a new debouncer with the given duration in milliseconds.
    pub fn new(debounce_ms: u64) -> Self {
        Self {
            pending: HashMap::new(),
            duration: Duration::from_millis(debounce_ms),
        }
    }

    /// Zero duration means events pass straight through.
    pub fn is_immediate(&self) -> bool {
        self.duration.is_zero()
    }

    /// Record a change event, resetting the timer for this key.
    pub fn record(&mut self, key: K) {
        self.pending.insert(key, Instant::now());
    }

    /// Forget a key (e.g. when its file is deleted).
    pub fn remove(&mut self, key: &K) -> bool {
        self.pending.remove(key).is_some()
    }

    /// Drop every pending key.
    pub fn clear(&mut self) {
        self.pending.clear();
    }

    /// Take all keys that have been stable for the debounce duration.
    pub fn take_ready(&mut self) -> Vec<K> {
        let now = Instant::now();
        let mut ready = Vec::new();

        self.pending.retain(|key, last_change| {
            if now.duration_since(*last_change) >= self.duration {
                ready.push(key.clone());
                false
            } else {
                true
            }
        });

        ready
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}
