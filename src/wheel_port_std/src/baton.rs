//! Hand-off of the simulated processor between threads
//!
//! Every simulated execution context is backed by an OS thread. Exactly one
//! of them, the holder of the baton, runs at a time; the others are blocked
//! in [`Baton::wait`].
use std::{
    sync::{Condvar, Mutex, MutexGuard},
    time::{Duration, Instant},
};

/// Identifies the execution context allowed to run. `0` means none.
pub(crate) struct Baton {
    holder: Mutex<usize>,
    cond: Condvar,
}

impl Baton {
    pub(crate) const fn new() -> Self {
        Self {
            holder: Mutex::new(0),
            cond: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, usize> {
        // A panicking context never holds the lock across user code
        self.holder.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Give the processor to the context `to`.
    pub(crate) fn pass(&self, to: usize) {
        log::trace!("baton -> {to}");
        *self.lock() = to;
        self.cond.notify_all();
    }

    /// Block until the context `id` receives the processor.
    #[cfg(test)]
    pub(crate) fn wait(&self, id: usize) {
        self.wait_unless(id, || false);
    }

    /// Block until the context `id` receives the processor or `cancel`
    /// returns `true`. Returns `false` if cancelled. `cancel` is evaluated
    /// with the baton locked, so a canceller must call [`Self::wake_all`]
    /// after making it return `true`.
    pub(crate) fn wait_unless(&self, id: usize, cancel: impl Fn() -> bool) -> bool {
        let mut holder = self.lock();
        while *holder != id {
            if cancel() {
                return false;
            }
            holder = self.cond.wait(holder).unwrap_or_else(|e| e.into_inner());
        }
        true
    }

    /// Make every waiter re-evaluate its cancellation condition.
    pub(crate) fn wake_all(&self) {
        let _holder = self.lock();
        self.cond.notify_all();
    }

    /// Like [`Self::wait`], but gives up after `timeout`. Returns `false` on
    /// timeout.
    pub(crate) fn wait_timeout(&self, id: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut holder = self.lock();
        while *holder != id {
            let Some(left) = deadline.checked_duration_since(Instant::now()) else {
                return false;
            };
            holder = self
                .cond
                .wait_timeout(holder, left)
                .unwrap_or_else(|e| e.into_inner())
                .0;
        }
        true
    }
}
