//! The kernel state guarded by the critical section
use alloc::vec::Vec;

use crate::{
    config::KernelConfig,
    error::{KernelError, KernelResult},
    event::EventCb,
    msg_queue::MsgQueueCb,
    mutex::MutexCb,
    semaphore::SemaphoreCb,
    task::{readyqueue::ReadyQueue, TaskCb},
    tick::{TickEvent, TickQueue},
    timer::TimerCb,
    utils::Pool,
    EventId, MsgQueueId, MutexId, Port, SemaphoreId, TaskId, TimerId,
};

/// Everything the critical section protects.
pub(crate) struct KernelCore<P: Port> {
    /// The task registry.
    pub(crate) tasks: Pool<TaskId, TaskCb<P>>,
    pub(crate) ready: ReadyQueue,
    pub(crate) ticks: TickQueue<TickEvent<P>>,
    pub(crate) mutexes: Pool<MutexId, MutexCb>,
    pub(crate) semaphores: Pool<SemaphoreId, SemaphoreCb>,
    pub(crate) events: Pool<EventId, EventCb>,
    pub(crate) timers: Pool<TimerId, TimerCb<P>>,
    pub(crate) queues: Pool<MsgQueueId, MsgQueueCb>,

    /// The running task. `None` in the pre-kernel phase.
    pub(crate) current: Option<TaskId>,
    pub(crate) idle: Option<TaskId>,
    /// The scheduler lock count. The running task is not preempted while
    /// it's non-zero.
    pub(crate) sched_lock: u32,
    pub(crate) tick_count: u64,
    pub(crate) round_robin_slices: u32,

    /// The number of tasks counted against `KernelConfig::max_tasks`.
    pub(crate) user_tasks: usize,
    pub(crate) max_user_tasks: usize,
    /// The number of armed raw tick callbacks, which are limited so that a
    /// blocking task can always arm its timeout.
    pub(crate) raw_ticks: usize,
    pub(crate) max_raw_ticks: usize,
    pub(crate) raw_tick_seq: u32,
    /// Exited tasks waiting for the deferred-work worker. Preallocated for
    /// every task slot.
    pub(crate) zombies: Vec<TaskId>,
}

impl<P: Port> KernelCore<P> {
    pub(crate) fn new(config: &KernelConfig) -> Self {
        Self {
            tasks: Pool::with_capacity(config.task_capacity()),
            ready: ReadyQueue::new(),
            ticks: TickQueue::with_capacity(config.tick_capacity()),
            // Each message queue owns a mutex and two semaphores
            mutexes: Pool::with_capacity(config.max_mutexes + config.max_message_queues),
            semaphores: Pool::with_capacity(
                config.max_semaphores + config.max_message_queues * 2,
            ),
            // The deferred-work queue owns one event group
            events: Pool::with_capacity(config.max_event_groups + 1),
            timers: Pool::with_capacity(config.max_timers),
            queues: Pool::with_capacity(config.max_message_queues),
            current: None,
            idle: None,
            sched_lock: 0,
            tick_count: 0,
            round_robin_slices: config.round_robin_slices,
            user_tasks: 0,
            max_user_tasks: config.max_tasks,
            raw_ticks: 0,
            max_raw_ticks: config.task_capacity(),
            raw_tick_seq: 0,
            zombies: Vec::with_capacity(config.task_capacity()),
        }
    }

    /// Allocate the event group used by the deferred-work queue.
    pub(crate) fn reserve_event(&mut self) -> KernelResult<EventId> {
        self.events
            .insert(EventCb::new())
            .map_err(|_| KernelError::ResourceExhausted)
    }

    /// Get the running task. Fails with [`KernelError::BadContext`] in the
    /// pre-kernel phase.
    #[inline]
    pub(crate) fn current_task(&self) -> KernelResult<TaskId> {
        self.current.ok_or(KernelError::BadContext)
    }

    /// Check that the running task may be suspended.
    pub(crate) fn expect_waitable_context(&self) -> KernelResult<()> {
        let current = self.current_task()?;
        if self.sched_lock > 0 || Some(current) == self.idle {
            Err(KernelError::BadContext)
        } else {
            Ok(())
        }
    }

    /// Get a live (not exited) task.
    pub(crate) fn live_task(&self, task: TaskId) -> KernelResult<&TaskCb<P>> {
        match self.tasks.get(task) {
            Some(cb) if !cb.is_dead() => Ok(cb),
            _ => Err(KernelError::InvalidArgument),
        }
    }

    /// Decide the task to run next. Updates `current` and returns the
    /// contexts to switch between if it's different from the running one.
    pub(crate) fn choose_running_task(&mut self) -> Option<(*const P::Context, *const P::Context)> {
        let current = self.current?;
        let idle = self.idle?;

        if self.sched_lock > 0 && self.tasks[current].st.is_empty() {
            // The running task can continue and mustn't be preempted
            return None;
        }

        // The idle task is never queued. It competes with the ready queue
        // only while it inherits a priority from a mutex it owns.
        let next = match self.ready.highest() {
            Some(task) if self.tasks[task].priority <= self.tasks[idle].priority => task,
            _ => idle,
        };
        if next == current {
            return None;
        }

        log::trace!("switching from {current:?} to {next:?}");
        self.current = Some(next);

        let from: *const P::Context = &*self.tasks[current].context;
        let to: *const P::Context = &*self.tasks[next].context;
        Some((from, to))
    }
}
