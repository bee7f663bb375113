//! Tasks
use alloc::{boxed::Box, vec::Vec};
use core::{fmt, sync::atomic::Ordering};

use crate::{
    config::{LOWEST_PRIORITY, STACK_ALIGN, STACK_FILL},
    critical::Job,
    defer,
    error::{KernelError, KernelResult},
    event::EventMode,
    state::KernelCore,
    tick::{TickEvent, TickKey},
    utils::intrusive_list::{Link, ListHead},
    wait::{WaitObject, WakeReason},
    Kernel, MutexId, Port, TaskId,
};

pub(crate) mod readyqueue;
use self::readyqueue::ReadyEntry;

/// The fixed-capacity buffer holding a task's name.
pub type TaskName = arrayvec::ArrayString<{ crate::config::TASK_NAME_LEN }>;

/// The entry function of a task. The task deletes itself when it returns.
pub type TaskEntry<P> = fn(&'static Kernel<P>, usize);

bitflags::bitflags! {
    /// The state of a task. The flags are independent; a task with none of
    /// them set is Ready (or Running).
    pub struct TaskState: u8 {
        /// Stopped by [`Kernel::task_suspend`] or not started yet.
        const SUSPEND = 1 << 0;
        /// Waiting for a mutex, a semaphore, or an event group.
        const PEND = 1 << 1;
        /// Armed in the tick queue, by a delay or a timed wait.
        const DELAY = 1 << 2;
        /// Exited, waiting to be reaped.
        const DEAD = 1 << 3;
    }
}

/// A snapshot of a task's state returned by [`Kernel::task_info`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskInfo {
    pub id: TaskId,
    pub name: TaskName,
    /// The address of the entry function. `0` for the idle task.
    pub entry: usize,
    pub resume_address: usize,
    pub base_priority: u8,
    /// The effective priority.
    pub priority: u8,
    pub state: TaskState,
    pub stack_size: usize,
    /// The number of stack bytes that were never written.
    pub stack_unused: usize,
}

/// *Task control block* - the state data of a task.
pub(crate) struct TaskCb<P: Port> {
    pub(crate) name: TaskName,
    /// `None` for the idle task.
    pub(crate) entry: Option<TaskEntry<P>>,
    pub(crate) arg: usize,
    pub(crate) context: Box<P::Context>,
    pub(crate) stack: Box<[u8]>,
    /// Tasks owned by the kernel, which don't count against
    /// `KernelConfig::max_tasks` and can't be deleted.
    pub(crate) system: bool,

    pub(crate) st: TaskState,
    /// The base priority. `0` is the most urgent.
    pub(crate) base_priority: u8,
    /// The effective priority, raised by priority inheritance.
    pub(crate) priority: u8,
    /// The number of ticks consumed since the task was last queued.
    pub(crate) slices: u32,

    pub(crate) owned_mutexes: ListHead<MutexId>,
    /// The mutex the task is blocked on.
    pub(crate) wanted_mutex: Option<MutexId>,

    pub(crate) ready_link: Option<Link<TaskId>>,
    pub(crate) wait_link: Option<Link<TaskId>>,
    pub(crate) wait: Option<WaitObject>,
    pub(crate) event_wanted: u32,
    pub(crate) event_mode: EventMode,
    /// The event bits delivered to the task when its wait completed.
    pub(crate) received: u32,
    pub(crate) wake: Option<WakeReason>,
    pub(crate) tick: Option<TickKey>,
}

impl<P: Port> TaskCb<P> {
    /// Construct a Suspended task.
    pub(crate) fn new(
        name: TaskName,
        priority: u8,
        entry: Option<TaskEntry<P>>,
        arg: usize,
        context: Box<P::Context>,
        stack: Box<[u8]>,
        system: bool,
    ) -> Self {
        Self {
            name,
            entry,
            arg,
            context,
            stack,
            system,
            st: TaskState::SUSPEND,
            base_priority: priority,
            priority,
            slices: 0,
            owned_mutexes: ListHead::new(),
            wanted_mutex: None,
            ready_link: None,
            wait_link: None,
            wait: None,
            event_wanted: 0,
            event_mode: EventMode::Any,
            received: 0,
            wake: None,
            tick: None,
        }
    }

    /// Construct the control block of the idle task, which runs on the
    /// context that started the kernel.
    pub(crate) fn idle(context: Box<P::Context>) -> Self {
        let mut cb = Self::new(
            TaskName::from("idle").unwrap_or_default(),
            LOWEST_PRIORITY,
            None,
            0,
            context,
            Box::default(),
            true,
        );
        cb.st = TaskState::empty();
        cb
    }

    #[inline]
    pub(crate) fn is_dead(&self) -> bool {
        self.st.contains(TaskState::DEAD)
    }

    fn info(&self, port: &P, id: TaskId) -> TaskInfo {
        TaskInfo {
            id,
            name: self.name,
            entry: self.entry.map_or(0, |f| f as usize),
            resume_address: port.resume_address(&self.context),
            base_priority: self.base_priority,
            priority: self.priority,
            state: self.st,
            stack_size: self.stack.len(),
            stack_unused: self.stack.iter().take_while(|&&b| b == STACK_FILL).count(),
        }
    }
}

impl<P: Port> ReadyEntry for TaskCb<P> {
    #[inline]
    fn priority(&self) -> u8 {
        self.priority
    }

    #[inline]
    fn ready_link(&mut self) -> &mut Option<Link<TaskId>> {
        &mut self.ready_link
    }

    #[inline]
    fn reset_slices(&mut self) {
        self.slices = 0;
    }
}

impl<P: Port> fmt::Debug for TaskCb<P> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TaskCb")
            .field("self", &(self as *const _))
            .field("name", &self.name)
            .field("st", &self.st)
            .field("base_priority", &self.base_priority)
            .field("priority", &self.priority)
            .field("owned_mutexes", &self.owned_mutexes)
            .field("wanted_mutex", &self.wanted_mutex)
            .field("wait", &self.wait)
            .field("tick", &self.tick)
            .finish()
    }
}

/// Allocate a stack of at least `size` bytes filled with [`STACK_FILL`].
fn alloc_stack(size: usize) -> KernelResult<Box<[u8]>> {
    let size = size
        .checked_add(STACK_ALIGN - 1)
        .ok_or(KernelError::InvalidArgument)?
        & !(STACK_ALIGN - 1);

    let mut stack = Vec::new();
    stack
        .try_reserve_exact(size)
        .map_err(|_| KernelError::ResourceExhausted)?;
    stack.resize(size, STACK_FILL);
    Ok(stack.into_boxed_slice())
}

/// The first code a new task executes.
fn task_trampoline<P: Port>(kernel: usize) {
    // Safety: `kernel` was derived from the `&'static Kernel<P>` that created
    //         the task
    let kernel = unsafe { &*(kernel as *const Kernel<P>) };

    let entry = kernel.with_core(|_, core| {
        let cb = &core.tasks[core.current_task()?];
        Ok((cb.entry, cb.arg))
    });

    match entry {
        Ok((Some(entry), arg)) => entry(kernel, arg),
        Ok((None, _)) => {}
        Err(e) => log::warn!("failed to start a task: {e:?}"),
    }

    exit_current(kernel)
}

/// The resume point of a task deleted by another task.
fn exit_trampoline<P: Port>(kernel: usize) {
    // Safety: See `task_trampoline`
    let kernel = unsafe { &*(kernel as *const Kernel<P>) };
    exit_current(kernel)
}

fn exit_current<P: Port>(kernel: &'static Kernel<P>) -> ! {
    let result = kernel.run_exclusive_always(Job::new(exit_job::<P>, 0, 0));
    unreachable!("an exited task was resumed ({result:?})")
}

impl<P: Port> KernelCore<P> {
    pub(crate) fn live_task_mut(&mut self, task: TaskId) -> KernelResult<&mut TaskCb<P>> {
        match self.tasks.get_mut(task) {
            Some(cb) if !cb.is_dead() => Ok(cb),
            _ => Err(KernelError::InvalidArgument),
        }
    }

    /// Register a task. Gives the control block back if there's no room.
    fn insert_task(&mut self, cb: TaskCb<P>) -> Result<TaskId, TaskCb<P>> {
        if !cb.system && self.user_tasks >= self.max_user_tasks {
            return Err(cb);
        }
        let system = cb.system;
        let task = self.tasks.insert(cb)?;
        if !system {
            self.user_tasks += 1;
        }
        Ok(task)
    }

    /// Terminate the running task `task`. It stays in the registry as DEAD
    /// until the deferred-work worker reaps it.
    pub(crate) fn retire_current(&mut self, kernel: &Kernel<P>, task: TaskId) -> KernelResult<()> {
        self.sched_lock = 0;
        self.unready(task);
        if let Some(key) = self.tasks[task].tick.take() {
            self.ticks.cancel(key);
        }
        self.abandon_mutexes(task);

        let cb = &mut self.tasks[task];
        cb.st = TaskState::DEAD;
        if !cb.system {
            self.user_tasks -= 1;
        }
        log::debug!("{task:?} exited");

        // `zombies` has room for every task, so reaping can't be refused
        // like deferred work
        self.zombies.push(task);
        self.event_send(kernel.defer_event, defer::level_bit(LOWEST_PRIORITY as usize))
    }

    /// Delay or yield the running task.
    fn delay_current(&mut self, ticks: u32) -> KernelResult<()> {
        let task = self.current_task()?;

        if ticks == 0 {
            // Move to the tail of the bucket
            self.unready(task);
            self.make_ready(task, false);
            return Ok(());
        }

        let key = self.ticks.arm(ticks, TickEvent::Task(task))?;
        self.unready(task);
        let cb = &mut self.tasks[task];
        cb.st.insert(TaskState::DELAY);
        cb.tick = Some(key);
        Ok(())
    }
}

fn task_id(raw: usize) -> KernelResult<TaskId> {
    TaskId::from_raw(raw).ok_or(KernelError::InvalidArgument)
}

fn exit_job<P: Port>(
    kernel: &Kernel<P>,
    core: &mut KernelCore<P>,
    _: usize,
    _: usize,
) -> KernelResult<()> {
    let task = core.current_task()?;
    core.retire_current(kernel, task)
}

fn delete_job<P: Port>(
    kernel: &Kernel<P>,
    core: &mut KernelCore<P>,
    task: usize,
    _: usize,
) -> KernelResult<()> {
    let task = task_id(task)?;
    if core.live_task_mut(task)?.system {
        return Err(KernelError::InvalidArgument);
    }

    if Some(task) == core.current {
        return core.retire_current(kernel, task);
    }

    // Make the task delete itself the next time it runs
    let context = &*core.tasks[task].context;
    kernel.port.set_resume_address(context, exit_trampoline::<P>);
    kernel
        .port
        .set_argument(context, kernel as *const Kernel<P> as usize);

    core.cancel_wait(task);
    core.tasks[task].st.remove(TaskState::SUSPEND);
    core.make_ready(task, false);
    Ok(())
}

fn resume_job<P: Port>(
    _: &Kernel<P>,
    core: &mut KernelCore<P>,
    task: usize,
    _: usize,
) -> KernelResult<()> {
    let task = task_id(task)?;
    core.live_task_mut(task)?.st.remove(TaskState::SUSPEND);
    core.make_ready(task, false);
    Ok(())
}

fn suspend_job<P: Port>(
    _: &Kernel<P>,
    core: &mut KernelCore<P>,
    task: usize,
    _: usize,
) -> KernelResult<()> {
    let task = task_id(task)?;
    core.live_task_mut(task)?;
    if Some(task) == core.idle {
        return Err(KernelError::InvalidArgument);
    }
    core.unready(task);
    core.tasks[task].st.insert(TaskState::SUSPEND);
    Ok(())
}

fn prio_set_job<P: Port>(
    _: &Kernel<P>,
    core: &mut KernelCore<P>,
    task: usize,
    priority: usize,
) -> KernelResult<()> {
    let task = task_id(task)?;
    if priority > LOWEST_PRIORITY as usize || Some(task) == core.idle {
        return Err(KernelError::InvalidArgument);
    }

    let cb = core.live_task_mut(task)?;
    if cb.wanted_mutex.is_some() {
        return Err(KernelError::InvalidArgument);
    }
    cb.base_priority = priority as u8;

    let effective = core.inherited_priority(task);
    let queued = core.tasks[task].ready_link.is_some();
    if queued {
        core.ready.remove(&mut core.tasks, task);
    }
    core.tasks[task].priority = effective;
    if queued {
        core.ready.push_back(&mut core.tasks, task);
    }
    Ok(())
}

fn unlock_job<P: Port>(
    _: &Kernel<P>,
    core: &mut KernelCore<P>,
    _: usize,
    _: usize,
) -> KernelResult<()> {
    core.sched_lock = core
        .sched_lock
        .checked_sub(1)
        .ok_or(KernelError::BadContext)?;
    Ok(())
}

impl<P: Port> Kernel<P> {
    /// Release the control blocks of exited tasks. Runs on the deferred-work
    /// worker so that no stack is freed while it's in use.
    pub(crate) fn reap_zombies(&self) {
        loop {
            let reaped = self.run_exclusive_task_only(|_, core| {
                Ok(core
                    .zombies
                    .pop()
                    .and_then(|task| Some((task, core.tasks.remove(task)?))))
            });

            match reaped {
                // Drop the stack outside the critical section
                Ok(Some((task, cb))) => {
                    drop(cb);
                    log::debug!("{task:?} reaped");
                }
                Ok(None) => break,
                Err(e) => {
                    log::warn!("failed to reap exited tasks: {e:?}");
                    break;
                }
            }
        }
    }
}

/// Task management
impl<P: Port> Kernel<P> {
    /// Start the kernel. The calling context becomes the idle task.
    ///
    /// This creates the deferred-work worker and switches to the most urgent
    /// ready task. It returns whenever no other task is ready; the caller
    /// then acts as the idle task and must not block.
    pub fn start(&'static self) -> KernelResult<()> {
        if self.port.interrupt_nesting() > 0 || self.started.load(Ordering::Acquire) {
            return Err(KernelError::BadContext);
        }

        let mut stack = alloc_stack(self.config.deferred_stack_size)?;
        let worker_context = Box::new(self.port.init_context(
            &mut stack,
            task_trampoline::<P>,
            self as *const Self as usize,
        ));
        let worker = TaskCb::new(
            TaskName::from("defer").unwrap_or_default(),
            0,
            Some(defer::worker::<P>),
            0,
            worker_context,
            stack,
            true,
        );
        let idle = TaskCb::idle(Box::new(self.port.adopt_context()));

        // Only a start that got this far can't be retried
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(KernelError::BadContext);
        }
        let Some(mut guard) = self.try_enter() else {
            self.started.store(false, Ordering::Release);
            return Err(KernelError::BadContext);
        };
        guard.run(|_, core| {
            let worker = core
                .insert_task(worker)
                .map_err(|_| KernelError::ResourceExhausted)?;
            core.tasks[worker].st = TaskState::empty();
            core.make_ready(worker, false);

            let idle = core
                .tasks
                .insert(idle)
                .map_err(|_| KernelError::ResourceExhausted)?;
            core.idle = Some(idle);
            core.current = Some(idle);

            log::debug!("kernel started (idle = {idle:?}, worker = {worker:?})");
            Ok(())
        })
        // Dropping `guard` switches to the most urgent task
    }

    /// Create a Suspended task. Call [`Self::task_resume`] to start it.
    ///
    /// `priority` is in `0..=31` (`0` is the most urgent). `stack_size` is
    /// rounded up to a multiple of 8 bytes.
    pub fn task_create(
        &'static self,
        name: &str,
        priority: u8,
        stack_size: usize,
        entry: TaskEntry<P>,
        arg: usize,
    ) -> KernelResult<TaskId> {
        let name = TaskName::from(name).map_err(|_| KernelError::InvalidArgument)?;
        if priority > LOWEST_PRIORITY || stack_size == 0 {
            return Err(KernelError::InvalidArgument);
        }

        // Allocate in task context
        let mut stack = alloc_stack(stack_size)?;
        let context = Box::new(self.port.init_context(
            &mut stack,
            task_trampoline::<P>,
            self as *const Self as usize,
        ));
        let cb = TaskCb::new(name, priority, Some(entry), arg, context, stack, false);

        match self.run_exclusive_task_only(|_, core| Ok(core.insert_task(cb)))? {
            Ok(task) => {
                log::debug!("created {task:?} ({name:?}, priority {priority})");
                Ok(task)
            }
            Err(cb) => {
                drop(cb);
                Err(KernelError::ResourceExhausted)
            }
        }
    }

    /// Create and start a task.
    pub fn task_spawn(
        &'static self,
        name: &str,
        priority: u8,
        stack_size: usize,
        entry: TaskEntry<P>,
        arg: usize,
    ) -> KernelResult<TaskId> {
        let task = self.task_create(name, priority, stack_size, entry, arg)?;
        self.task_resume(task)?;
        Ok(task)
    }

    /// Delete a task. The running task exits immediately; another task exits
    /// the next time it's scheduled. Mutexes owned by the task are released.
    pub fn task_delete(&self, task: TaskId) -> KernelResult<()> {
        self.run_exclusive_always(Job::new(delete_job::<P>, task.into_raw(), 0))
    }

    /// Make a Suspended task runnable. It becomes Ready unless it's also
    /// waiting or delayed.
    pub fn task_resume(&self, task: TaskId) -> KernelResult<()> {
        self.run_exclusive_always(Job::new(resume_job::<P>, task.into_raw(), 0))
    }

    pub fn task_suspend(&self, task: TaskId) -> KernelResult<()> {
        self.run_exclusive_always(Job::new(suspend_job::<P>, task.into_raw(), 0))
    }

    /// Get the effective priority of a task.
    pub fn task_prio_get(&self, task: TaskId) -> KernelResult<u8> {
        self.with_core(|_, core| Ok(core.live_task(task)?.priority))
    }

    /// Set the base priority of a task. Fails with
    /// [`KernelError::InvalidArgument`] while the task waits for a mutex.
    pub fn task_prio_set(&self, task: TaskId, priority: u8) -> KernelResult<()> {
        self.run_exclusive_always(Job::new(
            prio_set_job::<P>,
            task.into_raw(),
            priority as usize,
        ))
    }

    /// Block the running task for `ticks` ticks. `0` yields the processor to
    /// the other ready tasks of the same priority.
    pub fn task_delay(&self, ticks: u32) -> KernelResult<()> {
        self.run_exclusive_may_block(|_, core| core.delay_current(ticks))
    }

    /// Lock the scheduler. The running task isn't preempted until a matching
    /// [`Self::task_unlock`].
    pub fn task_lock(&self) -> KernelResult<()> {
        self.run_exclusive_task_only(|_, core| {
            core.sched_lock = core
                .sched_lock
                .checked_add(1)
                .ok_or(KernelError::Overflow)?;
            Ok(())
        })
    }

    pub fn task_unlock(&self) -> KernelResult<()> {
        self.run_exclusive_always(Job::new(unlock_job::<P>, 0, 0))
    }

    /// Get the running task (the interrupted task in an interrupt handler).
    pub fn current_task(&self) -> KernelResult<TaskId> {
        self.with_core(|_, core| core.current_task())
    }

    pub fn task_state(&self, task: TaskId) -> KernelResult<TaskState> {
        self.with_core(|_, core| {
            core.tasks
                .get(task)
                .map(|cb| cb.st)
                .ok_or(KernelError::InvalidArgument)
        })
    }

    pub fn task_info(&self, task: TaskId) -> KernelResult<TaskInfo> {
        self.with_core(|kernel, core| {
            core.tasks
                .get(task)
                .map(|cb| cb.info(&kernel.port, task))
                .ok_or(KernelError::InvalidArgument)
        })
    }

    /// Replace the contents of `out` with a snapshot of every task.
    pub fn task_list(&self, out: &mut Vec<TaskInfo>) -> KernelResult<()> {
        out.clear();
        // Don't allocate in the critical section
        out.reserve(self.config.task_capacity());
        self.with_core(|kernel, core| {
            out.extend(core.tasks.iter().map(|(id, cb)| cb.info(&kernel.port, id)));
            Ok(())
        })
    }
}
