//! Static kernel configuration
use crate::error::{KernelError, KernelResult};

/// The number of task priority levels. `0` is the most urgent.
pub const NUM_PRIORITY_LEVELS: usize = 32;

/// The least urgent task priority.
pub const LOWEST_PRIORITY: u8 = (NUM_PRIORITY_LEVELS - 1) as u8;

/// Timeout value meaning "wait until satisfied".
pub const WAIT_FOREVER: u32 = u32::MAX;

/// The capacity of the critical-job ring.
pub const JOB_RING_CAPACITY: usize = 64;

/// Task stacks are rounded up to this many bytes.
pub const STACK_ALIGN: usize = 8;

/// The byte a fresh stack is filled with, used to estimate stack usage.
pub const STACK_FILL: u8 = 0xee;

/// The maximum length of a task name in bytes.
pub const TASK_NAME_LEN: usize = 16;

/// Capacities and tunables of a [`Kernel`](crate::Kernel) instance.
///
/// All arenas are preallocated by [`Kernel::new`](crate::Kernel::new), so
/// object creation never reallocates.
///
/// # Examples
///
/// ```
/// use wheel_kernel::KernelConfig;
/// const CFG: KernelConfig = KernelConfig::new()
///     .with_max_tasks(4)
///     .with_round_robin_slices(3);
/// assert_eq!(CFG.max_tasks, 4);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelConfig {
    /// The maximum number of user tasks. The idle task and the deferred-work
    /// worker are accounted for separately.
    pub max_tasks: usize,
    pub max_mutexes: usize,
    pub max_semaphores: usize,
    /// The maximum number of user event groups. The deferred-work queue
    /// reserves one more.
    pub max_event_groups: usize,
    pub max_timers: usize,
    pub max_message_queues: usize,
    /// The number of ticks a task may run before yielding to an
    /// equal-priority peer.
    pub round_robin_slices: u32,
    /// The capacity of each of the 32 deferred-work FIFOs.
    pub deferred_queue_depth: usize,
    /// The stack size of the deferred-work worker task.
    pub deferred_stack_size: usize,
}

impl KernelConfig {
    pub const fn new() -> Self {
        Self {
            max_tasks: 16,
            max_mutexes: 16,
            max_semaphores: 16,
            max_event_groups: 16,
            max_timers: 8,
            max_message_queues: 4,
            round_robin_slices: 5,
            deferred_queue_depth: 8,
            deferred_stack_size: 0x200,
        }
    }

    pub const fn with_max_tasks(self, max_tasks: usize) -> Self {
        Self { max_tasks, ..self }
    }

    pub const fn with_max_mutexes(self, max_mutexes: usize) -> Self {
        Self {
            max_mutexes,
            ..self
        }
    }

    pub const fn with_max_semaphores(self, max_semaphores: usize) -> Self {
        Self {
            max_semaphores,
            ..self
        }
    }

    pub const fn with_max_event_groups(self, max_event_groups: usize) -> Self {
        Self {
            max_event_groups,
            ..self
        }
    }

    pub const fn with_max_timers(self, max_timers: usize) -> Self {
        Self { max_timers, ..self }
    }

    pub const fn with_max_message_queues(self, max_message_queues: usize) -> Self {
        Self {
            max_message_queues,
            ..self
        }
    }

    pub const fn with_round_robin_slices(self, round_robin_slices: u32) -> Self {
        Self {
            round_robin_slices,
            ..self
        }
    }

    pub const fn with_deferred_queue_depth(self, deferred_queue_depth: usize) -> Self {
        Self {
            deferred_queue_depth,
            ..self
        }
    }

    pub const fn with_deferred_stack_size(self, deferred_stack_size: usize) -> Self {
        Self {
            deferred_stack_size,
            ..self
        }
    }

    /// Check the configuration for values the kernel can't work with.
    pub fn validate(&self) -> KernelResult<()> {
        if self.round_robin_slices == 0
            || self.deferred_queue_depth == 0
            || self.deferred_stack_size == 0
        {
            return Err(KernelError::InvalidArgument);
        }
        Ok(())
    }

    /// The capacity of the task arena, including the idle task and the
    /// deferred-work worker.
    pub(crate) const fn task_capacity(&self) -> usize {
        self.max_tasks + 2
    }

    /// The capacity of the tick queue: every task and every timer can have at
    /// most one node armed, plus one raw node per task.
    pub(crate) const fn tick_capacity(&self) -> usize {
        self.task_capacity() * 2 + self.max_timers
    }
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self::new()
    }
}
