//! Deferred-work queue
//!
//! Work that can't run in the submitter's context (typically an interrupt
//! handler) is queued in one of 32 FIFOs and executed by a dedicated worker
//! task. Level `p` is signalled by bit `31 - p` of an event group, so a
//! leading-zero count finds the most urgent pending level. The worker also
//! reaps exited tasks whenever it services the least urgent level.
use alloc::collections::VecDeque;
use core::array;
use spin::Mutex as SpinMutex;

use crate::{
    config::{LOWEST_PRIORITY, NUM_PRIORITY_LEVELS, WAIT_FOREVER},
    error::{KernelError, KernelResult},
    event::EventMode,
    klock::IrqGuard,
    utils::leading_zeros,
    Kernel, Port,
};

/// The function type of deferred work.
pub type DeferredFn<P> = fn(&Kernel<P>, usize);

struct Deferred<P: Port> {
    func: DeferredFn<P>,
    arg: usize,
}

/// 32 bounded FIFOs of deferred work. Protected by the port's interrupt
/// mask, not by the critical section, so it's usable from anywhere.
pub(crate) struct DeferQueue<P: Port> {
    levels: SpinMutex<[VecDeque<Deferred<P>>; NUM_PRIORITY_LEVELS]>,
    depth: usize,
}

#[inline]
pub(crate) fn level_bit(priority: usize) -> u32 {
    1 << (NUM_PRIORITY_LEVELS - 1 - priority)
}

impl<P: Port> DeferQueue<P> {
    /// Construct a queue holding up to `depth` items per level. Every level
    /// is preallocated.
    pub(crate) fn new(depth: usize) -> Self {
        Self {
            levels: SpinMutex::new(array::from_fn(|_| VecDeque::with_capacity(depth))),
            depth,
        }
    }

    fn push(&self, port: &P, priority: usize, item: Deferred<P>) -> KernelResult<()> {
        let _irq = IrqGuard::new(port);
        let mut levels = self.levels.lock();
        let level = &mut levels[priority];
        if level.len() >= self.depth {
            return Err(KernelError::QueueFull);
        }
        level.push_back(item);
        Ok(())
    }

    fn pop(&self, port: &P, priority: usize) -> Option<Deferred<P>> {
        let _irq = IrqGuard::new(port);
        self.levels.lock()[priority].pop_front()
    }

    /// Execute the pending work of every level in `bits`, most urgent level
    /// first. Each level is drained completely before the next one.
    fn run(&self, kernel: &Kernel<P>, mut bits: u32) {
        while bits != 0 {
            let priority = leading_zeros(bits) as usize;
            bits &= !level_bit(priority);

            while let Some(item) = self.pop(&kernel.port, priority) {
                (item.func)(kernel, item.arg);
            }
        }
    }
}

/// The entry function of the deferred-work worker task.
pub(crate) fn worker<P: Port>(kernel: &'static Kernel<P>, _: usize) {
    log::debug!("deferred-work worker started");
    loop {
        match kernel.event_recv(kernel.defer_event, u32::MAX, EventMode::Any, WAIT_FOREVER) {
            Ok(bits) => {
                kernel.deferred.run(kernel, bits);
                if bits & level_bit(LOWEST_PRIORITY as usize) != 0 {
                    kernel.reap_zombies();
                }
            }
            Err(e) => log::warn!("deferred-work worker failed to wait: {e:?}"),
        }
    }
}

impl<P: Port> Kernel<P> {
    /// Queue `func(kernel, arg)` for execution by the deferred-work worker.
    /// Callable from anywhere, including interrupt handlers.
    ///
    /// `priority` is in `0..=31` (`0` is the most urgent). Items of the same
    /// priority run in submission order. Fails with
    /// [`KernelError::QueueFull`] if the level already holds
    /// [`KernelConfig::deferred_queue_depth`](crate::KernelConfig::deferred_queue_depth)
    /// items.
    pub fn defer_submit(&self, func: DeferredFn<P>, arg: usize, priority: u8) -> KernelResult<()> {
        let priority = priority as usize;
        if priority >= NUM_PRIORITY_LEVELS {
            return Err(KernelError::InvalidArgument);
        }

        if let Err(e) = self.deferred.push(&self.port, priority, Deferred { func, arg }) {
            log::warn!("deferred-work level {priority} is full");
            return Err(e);
        }

        self.event_send(self.defer_event, level_bit(priority))
    }
}
