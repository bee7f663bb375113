//! Semaphores
use crate::{
    config::WAIT_FOREVER,
    critical::Job,
    error::{KernelError, KernelResult},
    state::KernelCore,
    utils::intrusive_list::ListHead,
    wait::{WaitObject, WaitOutcome, WakeReason},
    Kernel, Port, SemaphoreId, TaskId,
};

/// *Semaphore control block* - the state data of a semaphore.
#[derive(Debug)]
pub(crate) struct SemaphoreCb {
    pub(crate) count: u32,
    /// FIFO. Non-empty only while `count == 0`.
    pub(crate) waiters: ListHead<TaskId>,
}

impl SemaphoreCb {
    pub(crate) const fn new(count: u32) -> Self {
        Self {
            count,
            waiters: ListHead::new(),
        }
    }
}

impl<P: Port> KernelCore<P> {
    /// Take one unit, or block the running task if there's none.
    pub(crate) fn sem_wait(
        &mut self,
        sem: SemaphoreId,
        timeout: u32,
    ) -> KernelResult<WaitOutcome<()>> {
        let cb = self
            .semaphores
            .get_mut(sem)
            .ok_or(KernelError::InvalidArgument)?;

        if cb.count > 0 {
            cb.count -= 1;
            Ok(WaitOutcome::Acquired(()))
        } else if timeout == 0 {
            Err(KernelError::WouldBlock)
        } else {
            self.block_current(WaitObject::Semaphore(sem), timeout)?;
            Ok(WaitOutcome::Blocked)
        }
    }

    /// Hand one unit to the first waiter, or deposit it.
    pub(crate) fn sem_post(&mut self, sem: SemaphoreId) -> KernelResult<()> {
        let cb = self
            .semaphores
            .get_mut(sem)
            .ok_or(KernelError::InvalidArgument)?;

        if let Some(waiter) = cb.waiters.first {
            // The unit goes directly to the waiter
            self.wake_task(waiter, WakeReason::Woken);
        } else {
            cb.count = cb.count.checked_add(1).ok_or(KernelError::Overflow)?;
        }
        Ok(())
    }
}

fn sem_post_job<P: Port>(
    _: &Kernel<P>,
    core: &mut KernelCore<P>,
    sem: usize,
    _: usize,
) -> KernelResult<()> {
    let sem = SemaphoreId::from_raw(sem).ok_or(KernelError::InvalidArgument)?;
    core.sem_post(sem)
}

impl<P: Port> Kernel<P> {
    /// Create a counting semaphore.
    pub fn sem_init(&self, count: u32) -> KernelResult<SemaphoreId> {
        self.run_exclusive_task_only(|_, core| {
            core.semaphores
                .insert(SemaphoreCb::new(count))
                .map_err(|_| KernelError::ResourceExhausted)
        })
    }

    #[inline]
    pub fn sem_wait(&self, sem: SemaphoreId) -> KernelResult<()> {
        self.sem_timedwait(sem, WAIT_FOREVER)
    }

    /// Take one unit, waiting for at most `timeout` ticks.
    ///
    /// Waiters are served in arrival order. `timeout == 0` fails with
    /// [`KernelError::WouldBlock`] instead of waiting.
    pub fn sem_timedwait(&self, sem: SemaphoreId, timeout: u32) -> KernelResult<()> {
        let outcome = self.run_exclusive_may_block(|_, core| core.sem_wait(sem, timeout))?;
        self.finish_wait(outcome, drop)
    }

    /// Take one unit if it's available.
    pub fn sem_trywait(&self, sem: SemaphoreId) -> KernelResult<()> {
        self.run_exclusive_task_only(|_, core| core.sem_wait(sem, 0))
            .map(drop)
    }

    /// Release one unit. Fails with [`KernelError::Overflow`] if the count
    /// would exceed `u32::MAX`.
    pub fn sem_post(&self, sem: SemaphoreId) -> KernelResult<()> {
        self.run_exclusive_always(Job::new(sem_post_job::<P>, sem.into_raw(), 0))
    }

    /// Get the number of units available.
    pub fn sem_count(&self, sem: SemaphoreId) -> KernelResult<u32> {
        self.with_core(|_, core| {
            core.semaphores
                .get(sem)
                .map(|cb| cb.count)
                .ok_or(KernelError::InvalidArgument)
        })
    }
}
