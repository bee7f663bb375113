//! Wait queues shared by the blocking primitives
use crate::{
    config::WAIT_FOREVER,
    error::{KernelError, KernelResult},
    state::KernelCore,
    task::{TaskCb, TaskState},
    tick::TickEvent,
    utils::{
        intrusive_list::{Link, ListAccessor},
        Pool,
    },
    EventId, Kernel, MutexId, Port, SemaphoreId, TaskId,
};

/// The object a Pending task is waiting on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WaitObject {
    /// Priority-ordered.
    Mutex(MutexId),
    Semaphore(SemaphoreId),
    Event(EventId),
}

/// Why a blocked task was made Ready again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WakeReason {
    Woken,
    TimedOut,
}

/// The result of an operation that may block the calling task.
#[derive(Debug)]
pub(crate) enum WaitOutcome<T> {
    /// The operation completed without blocking.
    Acquired(T),
    /// The caller was enqueued. It reads the result from its control block
    /// once it's resumed.
    Blocked,
}

type WaitLinkFn<P> = fn(&mut TaskCb<P>) -> &mut Option<Link<TaskId>>;

pub(crate) type WaitQueue<'a, P> =
    ListAccessor<'a, TaskId, Pool<TaskId, TaskCb<P>>, WaitLinkFn<P>>;

fn wait_link<P: Port>(task: &mut TaskCb<P>) -> &mut Option<Link<TaskId>> {
    &mut task.wait_link
}

impl<P: Port> KernelCore<P> {
    /// Get the wait queue of `obj`. `obj` must exist.
    pub(crate) fn wait_queue(&mut self, obj: WaitObject) -> WaitQueue<'_, P> {
        let head = match obj {
            WaitObject::Mutex(m) => &mut self.mutexes[m].waiters,
            WaitObject::Semaphore(s) => &mut self.semaphores[s].waiters,
            WaitObject::Event(e) => &mut self.events[e].waiters,
        };
        ListAccessor::new(head, &mut self.tasks, wait_link::<P> as WaitLinkFn<P>)
    }

    /// Insert a task into the wait queue of the mutex it waits for, keeping
    /// the queue sorted by effective priority (FIFO among equals).
    pub(crate) fn insert_by_priority(&mut self, obj: WaitObject, task: TaskId) {
        let priority = self.tasks[task].priority;
        let mut queue = self.wait_queue(obj);
        let at = queue.find(|_, waiter| waiter.priority > priority);
        queue.insert(task, at);
    }

    /// Make `task` Ready if nothing else holds it. The idle task is never
    /// queued.
    pub(crate) fn make_ready(&mut self, task: TaskId, at_head: bool) {
        let cb = &self.tasks[task];
        if !cb.st.is_empty() || cb.ready_link.is_some() || Some(task) == self.idle {
            return;
        }
        if at_head {
            self.ready.push_front(&mut self.tasks, task);
        } else {
            self.ready.push_back(&mut self.tasks, task);
        }
    }

    /// Remove `task` from the ready queue if it's there.
    pub(crate) fn unready(&mut self, task: TaskId) {
        if self.tasks[task].ready_link.is_some() {
            self.ready.remove(&mut self.tasks, task);
        }
    }

    /// Block the running task on `obj`. Arms a timeout unless `timeout` is
    /// [`WAIT_FOREVER`]. Nothing is modified on failure.
    pub(crate) fn block_current(&mut self, obj: WaitObject, timeout: u32) -> KernelResult<()> {
        let task = self.current_task()?;

        let tick = if timeout == WAIT_FOREVER {
            None
        } else {
            Some(self.ticks.arm(timeout, TickEvent::Task(task))?)
        };

        self.unready(task);

        let cb = &mut self.tasks[task];
        cb.st.insert(TaskState::PEND);
        if tick.is_some() {
            cb.st.insert(TaskState::DELAY);
        }
        cb.tick = tick;
        cb.wait = Some(obj);
        cb.wake = None;

        match obj {
            WaitObject::Mutex(_) => self.insert_by_priority(obj, task),
            WaitObject::Semaphore(_) | WaitObject::Event(_) => self.wait_queue(obj).push_back(task),
        }

        log::trace!("{task:?} blocks on {obj:?} (timeout = {timeout})");
        Ok(())
    }

    /// Remove `task` from its wait queue and the tick queue, record `reason`,
    /// and append it to the ready queue unless it's also suspended.
    pub(crate) fn wake_task(&mut self, task: TaskId, reason: WakeReason) {
        if let Some(obj) = self.tasks[task].wait.take() {
            self.wait_queue(obj).remove(task);
        }
        if let Some(key) = self.tasks[task].tick.take() {
            self.ticks.cancel(key);
        }

        let cb = &mut self.tasks[task];
        cb.st.remove(TaskState::PEND | TaskState::DELAY);
        cb.wake = Some(reason);

        self.make_ready(task, false);
    }

    /// Wake a Pending task without satisfying its wait. Priority
    /// inheritance is updated if it was waiting for a mutex.
    pub(crate) fn abort_wait(&mut self, task: TaskId, reason: WakeReason) {
        let wanted = self.tasks[task].wanted_mutex.take();
        self.wake_task(task, reason);
        if let Some(mutex) = wanted {
            self.mutex_waiters_changed(mutex);
        }
    }

    /// End whatever wait or delay `task` is in.
    pub(crate) fn cancel_wait(&mut self, task: TaskId) {
        let st = self.tasks[task].st;
        if st.contains(TaskState::PEND) {
            self.abort_wait(task, WakeReason::Woken);
        } else if st.contains(TaskState::DELAY) {
            if let Some(key) = self.tasks[task].tick.take() {
                self.ticks.cancel(key);
            }
            self.tasks[task].st.remove(TaskState::DELAY);
        }
    }

    /// Handle the expiry of a task's tick node.
    pub(crate) fn on_task_timeout(&mut self, task: TaskId) {
        // The node was already popped
        self.tasks[task].tick = None;

        let st = self.tasks[task].st;
        if st.contains(TaskState::PEND) {
            log::trace!("{task:?} timed out");
            self.abort_wait(task, WakeReason::TimedOut);
        } else if st.contains(TaskState::DELAY) {
            self.tasks[task].st.remove(TaskState::DELAY);
            self.make_ready(task, false);
        }
    }
}

impl<P: Port> Kernel<P> {
    /// Get the result of the wait the calling task just returned from, and
    /// the event bits it received.
    pub(crate) fn wait_result(&self) -> KernelResult<u32> {
        self.with_core(|_, core| {
            let task = core.current_task()?;
            let cb = &mut core.tasks[task];
            let received = core::mem::take(&mut cb.received);
            match cb.wake.take() {
                Some(WakeReason::Woken) => Ok(received),
                Some(WakeReason::TimedOut) => Err(KernelError::Timeout),
                None => Err(KernelError::WouldBlock),
            }
        })
    }

    /// Convert a [`WaitOutcome`] into the value the blocking call returns.
    pub(crate) fn finish_wait<T>(
        &self,
        outcome: WaitOutcome<T>,
        from_bits: impl FnOnce(u32) -> T,
    ) -> KernelResult<T> {
        match outcome {
            WaitOutcome::Acquired(x) => Ok(x),
            WaitOutcome::Blocked => self.wait_result().map(from_bits),
        }
    }
}
