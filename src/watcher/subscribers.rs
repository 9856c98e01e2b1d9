//! Callback lists shared by the watchers.

/// Ordered list of subscriber callbacks.
///
/// Once closed, the list drops its callbacks and silently ignores new ones.
pub struct Subscribers<F: ?Sized> {
    callbacks: Vec<Box<F>>,
    closed: bool,
}

impl<F: ?Sized> Subscribers<F> {
    pub fn new() -> Self {
        Self {
            callbacks: Vec::new(),
            closed: false,
        }
    }

    /// Append a callback. Returns `false` if the list is closed.
    pub fn add(&mut self, callback: Box<F>) -> bool {
        if self.closed {
            return false;
        }
        self.callbacks.push(callback);
        true
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Box<F>> {
        self.callbacks.iter_mut()
    }

    /// Drop every callback and refuse new ones.
    pub fn close(&mut self) {
        self.closed = true;
        self.callbacks.clear();
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn len(&self) -> usize {
        self.callbacks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.callbacks.is_empty()
    }
}

impl<F: ?Sized> Default for Subscribers<F> {
    fn default() -> Self {
        Self::new()
    }
}
