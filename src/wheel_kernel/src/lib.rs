//! The concurrency core of a small real-time kernel for single-core
//! microcontrollers.
//!
//! This crate provides a preemptive, priority-based scheduler with
//! round-robin among equal priorities, and the synchronization primitives
//! built on it:
//!
//!  - [mutexes](Kernel::mutex_lock) with transitive priority inheritance
//!  - counting [semaphores](Kernel::sem_wait)
//!  - [event-flag groups](Kernel::event_recv) with ALL/ANY waits
//!  - bounded [message queues](Kernel::mq_send)
//!  - one-shot and repeating [software timers](Kernel::timer_start) driven by
//!    a delta-encoded tick queue
//!  - a [deferred-work queue](Kernel::defer_submit) serviced by a dedicated
//!    task
//!
//! # Kernel context
//!
//! All kernel state lives in one [`Kernel`] value, created by
//! [`Kernel::new`] and started by [`Kernel::start`]. Tasks receive a
//! `&'static Kernel`, so the value must outlive every task (typically it's
//! placed in a `static` or leaked).
//!
//! The kernel is hardware-agnostic. Context switching and interrupt masking
//! are provided by a [`Port`] implementation. `wheel_port_std` is a port that
//! runs the kernel in a hosted environment.
//!
//! # Critical sections
//!
//! Every operation that mutates kernel state is executed as a job by the
//! critical-section executor. A job submitted while another job is running
//! (e.g., by an interrupt handler that preempted the owner) is appended to a
//! 64-entry ring and executed by the owner before it leaves. The outermost
//! exit reschedules, which may switch to another task.
//!
//! Operations fall into three classes:
//!
//!  - *Always* (e.g., [`Kernel::sem_post`], [`Kernel::tick`]): callable from
//!    anywhere, including interrupt handlers and timer callbacks. When
//!    invoked inside a critical section, the operation is queued and `Ok(())`
//!    is returned immediately. Failures of queued operations are logged.
//!  - *Task only* (e.g., [`Kernel::mutex_unlock`], [`Kernel::timer_delete`]):
//!    rejected with [`KernelError::BadContext`] in interrupt context.
//!  - *May block* (e.g., [`Kernel::sem_wait`]): additionally rejected when the
//!    scheduler is locked and in the idle task.
//!
//! Both restricted classes are also rejected inside a critical section, i.e.,
//! from timer and tick callbacks.
#![cfg_attr(not(test), no_std)]
#![warn(clippy::all)]
#![allow(clippy::new_without_default)]

extern crate alloc;

#[macro_use]
pub mod utils;

pub mod config;
mod critical;
mod defer;
pub mod error;
mod event;
pub mod hal;
mod klock;
mod msg_queue;
mod mutex;
mod semaphore;
mod state;
mod task;
mod tick;
mod timer;
mod wait;

#[cfg(test)]
mod test_port;

use core::sync::atomic::AtomicBool;
use spin::Mutex as SpinMutex;

pub use self::{
    config::{KernelConfig, LOWEST_PRIORITY, NUM_PRIORITY_LEVELS, WAIT_FOREVER},
    defer::DeferredFn,
    error::{result_code, KernelError, KernelResult},
    event::EventMode,
    mutex::MutexInfo,
    task::{TaskEntry, TaskInfo, TaskName, TaskState},
    tick::{TickCallback, TickHandle},
    timer::{TimerCallback, TimerMode},
};

define_id! {
    /// Identifies a task.
    pub struct TaskId;
}

define_id! {
    /// Identifies a mutex.
    pub struct MutexId;
}

define_id! {
    /// Identifies a counting semaphore.
    pub struct SemaphoreId;
}

define_id! {
    /// Identifies an event-flag group.
    pub struct EventId;
}

define_id! {
    /// Identifies a software timer.
    pub struct TimerId;
}

define_id! {
    /// Identifies a message queue.
    pub struct MsgQueueId;
}

/// Architecture-specific operations consumed by the kernel.
///
/// # Safety
///
/// Exactly one execution context may run at a time. `irq_lock` must exclude
/// every interrupt handler until the matching `irq_unlock`.
///
/// An implementation that takes interrupts must call [`Kernel::dispatch`]
/// when the outermost handler returns, and must report the nesting level
/// through [`Self::interrupt_nesting`]. The kernel never switches contexts
/// while `interrupt_nesting() > 0`.
pub unsafe trait Port: Send + Sync + Sized + 'static {
    /// The saved execution context of a task. The kernel keeps it boxed, so
    /// its address is stable for the task's lifetime.
    type Context: Send + 'static;

    /// Build the initial context of a new task. When first switched to, the
    /// task starts executing `entry(arg)` on `stack`. `entry` never returns.
    fn init_context(&self, stack: &mut [u8], entry: fn(usize), arg: usize) -> Self::Context;

    /// Describe the calling execution context. It's used for the idle task,
    /// which is the context that called [`Kernel::start`].
    fn adopt_context(&self) -> Self::Context;

    /// Get the address the task will resume at.
    fn resume_address(&self, context: &Self::Context) -> usize;

    /// Make a task that is not running resume at `entry` instead of the point
    /// where it was suspended. `entry` never returns.
    fn set_resume_address(&self, context: &Self::Context, entry: fn(usize));

    /// Set the argument passed to the resume point set by
    /// [`Self::set_resume_address`].
    fn set_argument(&self, context: &Self::Context, arg: usize);

    /// Save the current execution state to `from` and resume `to`. Returns
    /// when `from` is resumed.
    ///
    /// # Safety
    ///
    /// `from` must describe the calling context. Interrupts are masked by
    /// the caller. `from` must not be accessed after `to` starts running,
    /// since the kernel may release it while it's not running.
    unsafe fn switch_context(&self, from: &Self::Context, to: &Self::Context);

    /// Mask interrupts. Returns the key to pass to [`Self::irq_unlock`].
    fn irq_lock(&self) -> usize;

    /// Restore the interrupt mask state saved by [`Self::irq_lock`].
    ///
    /// # Safety
    ///
    /// `key` must be the value returned by the matching `irq_lock` call.
    unsafe fn irq_unlock(&self, key: usize);

    /// Get the interrupt nesting level. `0` means task context.
    fn interrupt_nesting(&self) -> usize;
}

/// The kernel context.
pub struct Kernel<P: Port> {
    port: P,
    config: KernelConfig,
    /// Set while a critical section is active.
    in_critical: AtomicBool,
    started: AtomicBool,
    /// Jobs submitted while a critical section was active.
    jobs: SpinMutex<critical::JobRing<P>>,
    deferred: defer::DeferQueue<P>,
    /// The event group the deferred-work worker waits on.
    defer_event: EventId,
    core: klock::CriticalCell<state::KernelCore<P>>,
}

impl<P: Port> Kernel<P> {
    /// Construct a kernel context. Preallocates every object arena.
    pub fn new(port: P, config: KernelConfig) -> KernelResult<Self> {
        config.validate()?;

        let mut core = state::KernelCore::new(&config);
        let defer_event = core.reserve_event()?;

        log::debug!("kernel created with {config:?}");

        Ok(Self {
            port,
            config,
            in_critical: AtomicBool::new(false),
            started: AtomicBool::new(false),
            jobs: SpinMutex::new(critical::JobRing::new()),
            deferred: defer::DeferQueue::new(config.deferred_queue_depth),
            defer_event,
            core: klock::CriticalCell::new(core),
        })
    }

    /// Get the port.
    #[inline]
    pub fn port(&self) -> &P {
        &self.port
    }

    /// Get the configuration the kernel was created with.
    #[inline]
    pub fn config(&self) -> &KernelConfig {
        &self.config
    }
}
