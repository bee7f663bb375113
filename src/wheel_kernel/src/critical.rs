//! The critical-section executor
use core::sync::atomic::Ordering;

use crate::{
    config::JOB_RING_CAPACITY, error::KernelError, klock::IrqGuard, state::KernelCore, Kernel,
    KernelResult, Port,
};

/// The function type of a critical job.
pub(crate) type JobFn<P> = fn(&Kernel<P>, &mut KernelCore<P>, usize, usize) -> KernelResult<()>;

/// A unit of kernel-state mutation that can be queued.
pub(crate) struct Job<P: Port> {
    pub(crate) func: JobFn<P>,
    pub(crate) arg1: usize,
    pub(crate) arg2: usize,
}

impl<P: Port> Clone for Job<P> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<P: Port> Copy for Job<P> {}

impl<P: Port> Job<P> {
    #[inline]
    pub(crate) const fn new(func: JobFn<P>, arg1: usize, arg2: usize) -> Self {
        Self { func, arg1, arg2 }
    }
}

/// Fixed-capacity FIFO of jobs submitted while a critical section was
/// active.
pub(crate) struct JobRing<P: Port> {
    slots: [Option<Job<P>>; JOB_RING_CAPACITY],
    head: usize,
    len: usize,
}

impl<P: Port> JobRing<P> {
    pub(crate) const fn new() -> Self {
        Self {
            slots: [None; JOB_RING_CAPACITY],
            head: 0,
            len: 0,
        }
    }

    fn push(&mut self, job: Job<P>) -> Result<(), Job<P>> {
        if self.len == JOB_RING_CAPACITY {
            return Err(job);
        }
        self.slots[(self.head + self.len) % JOB_RING_CAPACITY] = Some(job);
        self.len += 1;
        Ok(())
    }

    fn pop(&mut self) -> Option<Job<P>> {
        if self.len == 0 {
            return None;
        }
        let job = self.slots[self.head].take();
        self.head = (self.head + 1) % JOB_RING_CAPACITY;
        self.len -= 1;
        job
    }
}

/// RAII guard representing the ownership of the critical section. Dropping
/// it drains the job ring, releases the critical section, and reschedules.
pub(crate) struct CriticalGuard<'a, P: Port> {
    kernel: &'a Kernel<P>,
}

impl<P: Port> CriticalGuard<'_, P> {
    /// Run `f` with the kernel state.
    #[inline]
    pub(crate) fn run<R>(&mut self, f: impl FnOnce(&Kernel<P>, &mut KernelCore<P>) -> R) -> R {
        let mut core = self.kernel.core.borrow_mut();
        f(self.kernel, &mut core)
    }
}

impl<P: Port> Drop for CriticalGuard<'_, P> {
    fn drop(&mut self) {
        let kernel = self.kernel;
        loop {
            let job = {
                let _irq = IrqGuard::new(&kernel.port);
                let job = kernel.jobs.lock().pop();
                if job.is_none() {
                    // Release the critical section in the same interrupt-free
                    // window that found the ring empty
                    kernel.in_critical.store(false, Ordering::Release);
                }
                job
            };

            let Some(job) = job else { break };

            log::trace!("running a queued job");
            let result = {
                let mut core = kernel.core.borrow_mut();
                (job.func)(kernel, &mut core, job.arg1, job.arg2)
            };
            if let Err(e) = result {
                log::warn!("queued kernel job failed: {e:?}");
            }
        }

        kernel.dispatch();
    }
}

impl<P: Port> Kernel<P> {
    /// Take the critical section. Returns `None` if it's already taken.
    pub(crate) fn try_enter(&self) -> Option<CriticalGuard<'_, P>> {
        let _irq = IrqGuard::new(&self.port);
        if self.in_critical.load(Ordering::Acquire) {
            None
        } else {
            self.in_critical.store(true, Ordering::Relaxed);
            Some(CriticalGuard { kernel: self })
        }
    }

    /// Execute `job` in the critical section. If the critical section is
    /// already active, the job is appended to the job ring instead and
    /// executed by the owner before it leaves; `Ok(())` is returned in this
    /// case. Callable from any context.
    ///
    /// Returns [`KernelError::QueueFull`] if the job ring is exhausted. The
    /// job is dropped.
    pub(crate) fn run_exclusive_always(&self, job: Job<P>) -> KernelResult<()> {
        let mut guard = {
            let _irq = IrqGuard::new(&self.port);
            if self.in_critical.load(Ordering::Acquire) {
                return self.jobs.lock().push(job).map_err(|_| {
                    log::warn!("critical job ring is full; dropping a job");
                    KernelError::QueueFull
                });
            }
            self.in_critical.store(true, Ordering::Relaxed);
            CriticalGuard { kernel: self }
        };

        guard.run(|kernel, core| (job.func)(kernel, core, job.arg1, job.arg2))
    }

    /// Execute `f` in the critical section. The caller may be suspended by
    /// `f` when the critical section is left.
    ///
    /// Fails with [`KernelError::BadContext`] without running `f` in an
    /// interrupt handler, inside another critical job, in the pre-kernel
    /// phase, in the idle task, or while the scheduler is locked.
    pub(crate) fn run_exclusive_may_block<R>(
        &self,
        f: impl FnOnce(&Kernel<P>, &mut KernelCore<P>) -> KernelResult<R>,
    ) -> KernelResult<R> {
        if self.port.interrupt_nesting() > 0 {
            return Err(KernelError::BadContext);
        }
        let mut guard = self.try_enter().ok_or(KernelError::BadContext)?;
        guard.run(|kernel, core| {
            core.expect_waitable_context()?;
            f(kernel, core)
        })
    }

    /// Execute `f` in the critical section.
    ///
    /// Fails with [`KernelError::BadContext`] without running `f` in an
    /// interrupt handler or inside another critical job.
    pub(crate) fn run_exclusive_task_only<R>(
        &self,
        f: impl FnOnce(&Kernel<P>, &mut KernelCore<P>) -> KernelResult<R>,
    ) -> KernelResult<R> {
        if self.port.interrupt_nesting() > 0 {
            return Err(KernelError::BadContext);
        }
        let mut guard = self.try_enter().ok_or(KernelError::BadContext)?;
        guard.run(f)
    }

    /// Execute a read-mostly `f` in the critical section. Callable from
    /// interrupt handlers, but not inside another critical job.
    pub(crate) fn with_core<R>(
        &self,
        f: impl FnOnce(&Kernel<P>, &mut KernelCore<P>) -> KernelResult<R>,
    ) -> KernelResult<R> {
        let mut guard = self.try_enter().ok_or(KernelError::BadContext)?;
        guard.run(f)
    }

    /// The reschedule point. Switches to the most urgent ready task if it's
    /// not the running one.
    ///
    /// Does nothing in an interrupt handler or while a critical section is
    /// active. A port must call this when the outermost interrupt handler
    /// returns.
    pub fn dispatch(&self) {
        if self.port.interrupt_nesting() > 0 {
            return;
        }

        let _irq = IrqGuard::new(&self.port);
        if self.in_critical.load(Ordering::Acquire) {
            return;
        }

        let switch = self.core.borrow_mut().choose_running_task();
        if let Some((from, to)) = switch {
            log::trace!("dispatch: switching from {from:p} to {to:p}");
            // Safety: Both contexts are boxed in live task control blocks.
            //         A control block is released only by the deferred-work
            //         worker after its task has stopped running, and the port
            //         doesn't touch `from` after `to` starts running.
            unsafe { self.port.switch_context(&*from, &*to) };
        }
    }
}
