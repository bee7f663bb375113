//! Task ready queue implementation (internal use only).
use core::{fmt, ops};

use crate::{
    config::NUM_PRIORITY_LEVELS,
    utils::{
        intrusive_list::{Link, ListAccessor, ListHead},
        PrioBitmap, PrioBitmap32,
    },
    TaskId,
};

/// The per-task data the ready queue needs.
pub(crate) trait ReadyEntry {
    /// The effective priority the entry is queued at.
    fn priority(&self) -> u8;

    fn ready_link(&mut self) -> &mut Option<Link<TaskId>>;

    /// Reset the round-robin slice counter.
    fn reset_slices(&mut self);
}

/// 32 FIFO buckets of Ready tasks indexed by effective priority, with a
/// bitmap of non-empty buckets.
pub(crate) struct ReadyQueue {
    heads: [ListHead<TaskId>; NUM_PRIORITY_LEVELS],
    bitmap: PrioBitmap32,
    /// The head of the most urgent non-empty bucket.
    highest: Option<TaskId>,
}

impl ReadyQueue {
    pub(crate) fn new() -> Self {
        Self {
            heads: [ListHead::new(); NUM_PRIORITY_LEVELS],
            bitmap: PrioBitmap32::default(),
            highest: None,
        }
    }

    /// Get the most urgent ready task, i.e., the head of the lowest-indexed
    /// non-empty bucket. The caller substitutes the idle task for `None`.
    #[inline]
    pub(crate) fn highest(&self) -> Option<TaskId> {
        self.highest
    }

    /// Get a flag indicating whether the bucket for `priority` contains any
    /// task.
    #[cfg(test)]
    pub(crate) fn has_priority(&self, priority: u8) -> bool {
        self.bitmap.get(priority as usize)
    }

    fn refresh_highest(&mut self) {
        self.highest = self
            .bitmap
            .find_set()
            .and_then(|priority| self.heads[priority].first);
    }

    /// Append `task` to its priority bucket and reset its slice counter.
    pub(crate) fn push_back<Pool, E>(&mut self, pool: &mut Pool, task: TaskId)
    where
        Pool: ops::IndexMut<TaskId, Output = E> + ?Sized,
        E: ReadyEntry,
    {
        pool[task].reset_slices();
        self.insert(pool, task, false);
    }

    /// Prepend `task` to its priority bucket. Its slice counter is preserved.
    pub(crate) fn push_front<Pool, E>(&mut self, pool: &mut Pool, task: TaskId)
    where
        Pool: ops::IndexMut<TaskId, Output = E> + ?Sized,
        E: ReadyEntry,
    {
        self.insert(pool, task, true);
    }

    fn insert<Pool, E>(&mut self, pool: &mut Pool, task: TaskId, at_head: bool)
    where
        Pool: ops::IndexMut<TaskId, Output = E> + ?Sized,
        E: ReadyEntry,
    {
        let priority = pool[task].priority() as usize;
        let mut accessor = ListAccessor::new(&mut self.heads[priority], pool, E::ready_link);
        if at_head {
            accessor.push_front(task);
        } else {
            accessor.push_back(task);
        }

        self.bitmap.set(priority);
        self.refresh_highest();
    }

    /// Remove `task` from its priority bucket. `task` must be queued at its
    /// current effective priority.
    pub(crate) fn remove<Pool, E>(&mut self, pool: &mut Pool, task: TaskId)
    where
        Pool: ops::IndexMut<TaskId, Output = E> + ?Sized,
        E: ReadyEntry,
    {
        let priority = pool[task].priority() as usize;
        let mut accessor = ListAccessor::new(&mut self.heads[priority], pool, E::ready_link);
        accessor.remove(task);

        if accessor.is_empty() {
            self.bitmap.clear(priority);
        }
        if self.highest == Some(task) {
            self.refresh_highest();
        }
    }
}

impl fmt::Debug for ReadyQueue {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ReadyQueue")
            .field("bitmap", &self.bitmap)
            .field("highest", &self.highest)
            .finish()
    }
}
