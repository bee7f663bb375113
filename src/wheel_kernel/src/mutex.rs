//! Mutexes with priority inheritance
//!
//! A mutex's *ceiling* is the effective priority of its most urgent waiter
//! (the head of its priority-ordered wait queue), or `None` if nobody waits
//! for it. A task's effective priority is the minimum (most urgent) of its
//! base priority and the ceilings of the mutexes it owns.
//!
//! Whenever a wait queue's head or a task's effective priority changes, the
//! change is propagated along the lock-wait chain:
//!
//! ```text
//!   H ──waits──> M2 ──owned by──> L2 ──waits──> M1 ──owned by──> L1
//! ```
//!
//! The propagation is a loop that moves one link per iteration and stops as
//! soon as a ceiling or an effective priority stays the same. Cyclic waits
//! are not detected; a cycle can't change any priority after it has been
//! traversed once, so the loop still terminates.
use crate::{
    config::WAIT_FOREVER,
    error::{KernelError, KernelResult},
    state::KernelCore,
    task::TaskCb,
    utils::intrusive_list::{Link, ListAccessor, ListHead},
    wait::{WaitObject, WaitOutcome, WakeReason},
    Kernel, MutexId, Port, TaskId,
};

/// *Mutex control block* - the state data of a mutex.
#[derive(Debug)]
pub(crate) struct MutexCb {
    /// The task that currently owns the mutex lock.
    pub(crate) owner: Option<TaskId>,
    /// The number of times the owner has locked the mutex.
    pub(crate) recursion: u32,
    pub(crate) ceiling: Option<u8>,
    /// Sorted by effective priority, FIFO among equals.
    pub(crate) waiters: ListHead<TaskId>,
    /// The link in the owner's owned-mutex list.
    pub(crate) owned_link: Option<Link<MutexId>>,
}

impl MutexCb {
    pub(crate) const fn new() -> Self {
        Self {
            owner: None,
            recursion: 0,
            ceiling: None,
            waiters: ListHead::new(),
            owned_link: None,
        }
    }
}

/// A snapshot of a mutex's state returned by [`Kernel::mutex_info`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MutexInfo {
    pub owner: Option<TaskId>,
    pub recursion: u32,
    /// The effective priority of the most urgent waiter.
    pub ceiling: Option<u8>,
    /// The number of waiting tasks.
    pub waiters: usize,
}

fn owned_link(mutex: &mut MutexCb) -> &mut Option<Link<MutexId>> {
    &mut mutex.owned_link
}

impl<P: Port> KernelCore<P> {
    fn mutex(&self, mutex: MutexId) -> KernelResult<&MutexCb> {
        self.mutexes.get(mutex).ok_or(KernelError::InvalidArgument)
    }

    /// Calculate the effective priority `task` should have, from its base
    /// priority and the ceilings of the mutexes it owns.
    pub(crate) fn inherited_priority(&mut self, task: TaskId) -> u8 {
        let cb: &mut TaskCb<P> = &mut self.tasks[task];
        let mut priority = cb.base_priority;
        ListAccessor::new(&mut cb.owned_mutexes, &mut self.mutexes, owned_link).for_each(
            |_, mutex| {
                if let Some(ceiling) = mutex.ceiling {
                    priority = priority.min(ceiling);
                }
            },
        );
        priority
    }

    /// Change the effective priority of `task`, moving it within the ready
    /// queue or the wait queue of the mutex it's waiting for.
    fn set_effective_priority(&mut self, task: TaskId, priority: u8) {
        let old = self.tasks[task].priority;
        if old == priority {
            return;
        }
        log::trace!("{task:?}: effective priority {old} -> {priority}");

        let queued = self.tasks[task].ready_link.is_some();
        if queued {
            self.ready.remove(&mut self.tasks, task);
        }

        self.tasks[task].priority = priority;

        if queued {
            if priority < old {
                self.ready.push_back(&mut self.tasks, task);
            } else {
                // A task losing its boost keeps its turn
                self.ready.push_front(&mut self.tasks, task);
            }
        }

        if let Some(obj @ WaitObject::Mutex(_)) = self.tasks[task].wait {
            self.wait_queue(obj).remove(task);
            self.insert_by_priority(obj, task);
        }
    }

    /// Recalculate the effective priority of `task` and propagate the change
    /// along the chain of mutexes it waits for.
    pub(crate) fn update_priority(&mut self, task: TaskId) {
        let priority = self.inherited_priority(task);
        if priority == self.tasks[task].priority {
            return;
        }
        self.set_effective_priority(task, priority);

        if let Some(next) = self.tasks[task].wanted_mutex {
            self.mutex_waiters_changed(next);
        }
    }

    /// Recalculate the ceiling of `mutex` after its wait queue changed, and
    /// propagate the change to its owner and onward.
    pub(crate) fn mutex_waiters_changed(&mut self, mut mutex: MutexId) {
        loop {
            let ceiling = self.mutexes[mutex]
                .waiters
                .first
                .map(|head| self.tasks[head].priority);

            let cb = &mut self.mutexes[mutex];
            if cb.ceiling == ceiling {
                return;
            }
            cb.ceiling = ceiling;

            let Some(owner) = cb.owner else { return };
            let priority = self.inherited_priority(owner);
            if priority == self.tasks[owner].priority {
                return;
            }
            self.set_effective_priority(owner, priority);

            match self.tasks[owner].wanted_mutex {
                Some(next) => mutex = next,
                None => return,
            }
        }
    }

    /// Give `mutex` to `task`, which must not be waiting for it.
    fn set_owner(&mut self, mutex: MutexId, task: TaskId) {
        let ceiling = self.mutexes[mutex]
            .waiters
            .first
            .map(|head| self.tasks[head].priority);

        let cb = &mut self.mutexes[mutex];
        debug_assert!(cb.owner.is_none());
        cb.owner = Some(task);
        cb.recursion = 1;
        cb.ceiling = ceiling;

        ListAccessor::new(
            &mut self.tasks[task].owned_mutexes,
            &mut self.mutexes,
            owned_link,
        )
        .push_back(mutex);

        self.update_priority(task);
    }

    /// Release `mutex` entirely and hand it over to its most urgent waiter.
    pub(crate) fn release_mutex(&mut self, mutex: MutexId) {
        let Some(owner) = self.mutexes[mutex].owner.take() else {
            return;
        };
        self.mutexes[mutex].recursion = 0;

        ListAccessor::new(
            &mut self.tasks[owner].owned_mutexes,
            &mut self.mutexes,
            owned_link,
        )
        .remove(mutex);

        // Restore the former owner's priority first
        self.update_priority(owner);

        if let Some(next) = self.mutexes[mutex].waiters.first {
            log::trace!("{mutex:?}: ownership passes from {owner:?} to {next:?}");
            self.tasks[next].wanted_mutex = None;
            self.wake_task(next, WakeReason::Woken);
            self.set_owner(mutex, next);
        } else {
            self.mutexes[mutex].ceiling = None;
        }
    }

    /// Release every mutex owned by `task`.
    pub(crate) fn abandon_mutexes(&mut self, task: TaskId) {
        while let Some(mutex) = self.tasks[task].owned_mutexes.first {
            self.release_mutex(mutex);
        }
    }

    /// Lock `mutex` for the running task, or enqueue it.
    pub(crate) fn mutex_lock(&mut self, mutex: MutexId, timeout: u32) -> KernelResult<WaitOutcome<()>> {
        let task = self.current_task()?;
        let owner = self.mutex(mutex)?.owner;

        match owner {
            None => {
                self.set_owner(mutex, task);
                Ok(WaitOutcome::Acquired(()))
            }
            Some(owner) if owner == task => {
                let cb = &mut self.mutexes[mutex];
                cb.recursion = cb.recursion.checked_add(1).ok_or(KernelError::Overflow)?;
                Ok(WaitOutcome::Acquired(()))
            }
            Some(_) if timeout == 0 => Err(KernelError::WouldBlock),
            Some(_) => {
                self.block_current(WaitObject::Mutex(mutex), timeout)?;
                self.tasks[task].wanted_mutex = Some(mutex);
                self.mutex_waiters_changed(mutex);
                Ok(WaitOutcome::Blocked)
            }
        }
    }

    pub(crate) fn mutex_unlock(&mut self, mutex: MutexId) -> KernelResult<()> {
        let task = self.current_task()?;
        let cb = self.mutexes.get_mut(mutex).ok_or(KernelError::InvalidArgument)?;
        if cb.owner != Some(task) {
            return Err(KernelError::NotOwner);
        }

        cb.recursion -= 1;
        if cb.recursion == 0 {
            self.release_mutex(mutex);
        }
        Ok(())
    }
}

impl<P: Port> Kernel<P> {
    /// Create an unlocked mutex.
    pub fn mutex_init(&self) -> KernelResult<MutexId> {
        self.run_exclusive_task_only(|_, core| {
            core.mutexes
                .insert(MutexCb::new())
                .map_err(|_| KernelError::ResourceExhausted)
        })
    }

    #[inline]
    pub fn mutex_lock(&self, mutex: MutexId) -> KernelResult<()> {
        self.mutex_timedlock(mutex, WAIT_FOREVER)
    }

    /// Lock the mutex, waiting for at most `timeout` ticks. A task that
    /// already owns the mutex locks it recursively.
    ///
    /// While the calling task waits, the owner inherits its priority.
    ///
    /// Before the kernel starts, this validates `mutex` and does nothing
    /// else.
    pub fn mutex_timedlock(&self, mutex: MutexId, timeout: u32) -> KernelResult<()> {
        if self.is_pre_kernel(mutex)? {
            return Ok(());
        }
        let outcome = self.run_exclusive_may_block(|_, core| core.mutex_lock(mutex, timeout))?;
        self.finish_wait(outcome, drop)
    }

    /// Lock the mutex if it's available.
    pub fn mutex_trylock(&self, mutex: MutexId) -> KernelResult<()> {
        self.run_exclusive_task_only(|_, core| {
            if core.current.is_none() {
                return core.mutex(mutex).map(drop);
            }
            core.mutex_lock(mutex, 0).map(drop)
        })
    }

    /// Unlock the mutex. The ownership passes to the most urgent waiter when
    /// the recursion count reaches zero.
    pub fn mutex_unlock(&self, mutex: MutexId) -> KernelResult<()> {
        self.run_exclusive_task_only(|_, core| {
            if core.current.is_none() {
                return core.mutex(mutex).map(drop);
            }
            core.mutex_unlock(mutex)
        })
    }

    pub fn mutex_info(&self, mutex: MutexId) -> KernelResult<MutexInfo> {
        self.with_core(|_, core| {
            let cb = core.mutex(mutex)?;
            let (owner, recursion, ceiling) = (cb.owner, cb.recursion, cb.ceiling);
            let mut waiters = 0;
            core.wait_queue(WaitObject::Mutex(mutex))
                .for_each(|_, _| waiters += 1);
            Ok(MutexInfo {
                owner,
                recursion,
                ceiling,
                waiters,
            })
        })
    }

    /// Check whether the kernel is in the pre-kernel phase, validating
    /// `mutex` on the way.
    fn is_pre_kernel(&self, mutex: MutexId) -> KernelResult<bool> {
        if self.port().interrupt_nesting() > 0 {
            return Err(KernelError::BadContext);
        }
        self.with_core(|_, core| {
            core.mutex(mutex)?;
            Ok(core.current.is_none())
        })
    }
}
