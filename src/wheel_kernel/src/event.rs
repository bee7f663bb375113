//! Event groups
use crate::{
    critical::Job,
    error::{KernelError, KernelResult},
    state::KernelCore,
    utils::intrusive_list::ListHead,
    wait::{WaitObject, WaitOutcome, WakeReason},
    EventId, Kernel, Port, TaskId,
};

/// Specifies the condition an event-group wait is satisfied by.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EventMode {
    /// All of the wanted bits must be set.
    All = 1,
    /// At least one of the wanted bits must be set.
    Any = 2,
}

impl EventMode {
    /// Get the bits of `flags` that satisfy a wait for `wanted`, or `None` if
    /// the wait isn't satisfied.
    #[inline]
    fn matched(self, flags: u32, wanted: u32) -> Option<u32> {
        let hit = flags & wanted;
        let satisfied = match self {
            EventMode::All => hit == wanted,
            EventMode::Any => hit != 0,
        };
        if satisfied {
            Some(hit)
        } else {
            None
        }
    }
}

/// *Event group control block* - the state data of an event group.
#[derive(Debug)]
pub(crate) struct EventCb {
    pub(crate) flags: u32,
    /// FIFO.
    pub(crate) waiters: ListHead<TaskId>,
}

impl EventCb {
    pub(crate) const fn new() -> Self {
        Self {
            flags: 0,
            waiters: ListHead::new(),
        }
    }
}

impl<P: Port> KernelCore<P> {
    /// Take the wanted bits if the condition holds, or block the running
    /// task.
    pub(crate) fn event_recv(
        &mut self,
        event: EventId,
        wanted: u32,
        mode: EventMode,
        timeout: u32,
    ) -> KernelResult<WaitOutcome<u32>> {
        let cb = self.events.get_mut(event).ok_or(KernelError::InvalidArgument)?;

        if let Some(hit) = mode.matched(cb.flags, wanted) {
            cb.flags &= !hit;
            return Ok(WaitOutcome::Acquired(hit));
        }
        if timeout == 0 {
            return Err(KernelError::WouldBlock);
        }

        self.block_current(WaitObject::Event(event), timeout)?;

        let task = self.current_task()?;
        let cb = &mut self.tasks[task];
        cb.event_wanted = wanted;
        cb.event_mode = mode;
        cb.received = 0;
        Ok(WaitOutcome::Blocked)
    }

    /// Set `bits` and wake the waiters they satisfy, in arrival order. Each
    /// woken waiter consumes the bits it matched.
    pub(crate) fn event_send(&mut self, event: EventId, bits: u32) -> KernelResult<()> {
        let cb = self.events.get_mut(event).ok_or(KernelError::InvalidArgument)?;
        cb.flags |= bits;

        let obj = WaitObject::Event(event);
        let mut cursor = cb.waiters.first;
        while let Some(task) = cursor {
            let flags = self.events[event].flags;
            if flags == 0 {
                break;
            }

            cursor = self.wait_queue(obj).next(task);

            let waiter = &mut self.tasks[task];
            if let Some(hit) = waiter.event_mode.matched(flags, waiter.event_wanted) {
                waiter.received = hit;
                self.events[event].flags &= !hit;
                self.wake_task(task, WakeReason::Woken);
            }
        }
        Ok(())
    }
}

fn event_send_job<P: Port>(
    _: &Kernel<P>,
    core: &mut KernelCore<P>,
    event: usize,
    bits: usize,
) -> KernelResult<()> {
    let event = EventId::from_raw(event).ok_or(KernelError::InvalidArgument)?;
    core.event_send(event, bits as u32)
}

impl<P: Port> Kernel<P> {
    /// Create an event group with no bits set.
    pub fn event_create(&self) -> KernelResult<EventId> {
        self.run_exclusive_task_only(|_, core| {
            core.events
                .insert(EventCb::new())
                .map_err(|_| KernelError::ResourceExhausted)
        })
    }

    /// Clear every bit of an existing event group.
    pub fn event_init(&self, event: EventId) -> KernelResult<()> {
        self.run_exclusive_task_only(|_, core| {
            let cb = core.events.get_mut(event).ok_or(KernelError::InvalidArgument)?;
            cb.flags = 0;
            Ok(())
        })
    }

    /// Wait until the bits in `wanted` satisfy `mode`, for at most `timeout`
    /// ticks. The matched bits are cleared and returned.
    ///
    /// `timeout == 0` fails with [`KernelError::WouldBlock`] instead of
    /// waiting. [`WAIT_FOREVER`](crate::WAIT_FOREVER) waits indefinitely.
    pub fn event_recv(
        &self,
        event: EventId,
        wanted: u32,
        mode: EventMode,
        timeout: u32,
    ) -> KernelResult<u32> {
        if wanted == 0 {
            return Err(KernelError::InvalidArgument);
        }
        let outcome = self.run_exclusive_may_block(|_, core| {
            core.event_recv(event, wanted, mode, timeout)
        })?;
        self.finish_wait(outcome, |bits| bits)
    }

    /// Take the bits without waiting. Usable before the kernel starts.
    pub fn event_tryrecv(&self, event: EventId, wanted: u32, mode: EventMode) -> KernelResult<u32> {
        if wanted == 0 {
            return Err(KernelError::InvalidArgument);
        }
        match self.run_exclusive_task_only(|_, core| core.event_recv(event, wanted, mode, 0))? {
            WaitOutcome::Acquired(bits) => Ok(bits),
            WaitOutcome::Blocked => unreachable!(),
        }
    }

    /// Set `bits` in the event group.
    pub fn event_send(&self, event: EventId, bits: u32) -> KernelResult<()> {
        if bits == 0 {
            return Err(KernelError::InvalidArgument);
        }
        self.run_exclusive_always(Job::new(
            event_send_job::<P>,
            event.into_raw(),
            bits as usize,
        ))
    }

    /// Get the bits currently set.
    pub fn event_flags(&self, event: EventId) -> KernelResult<u32> {
        self.with_core(|_, core| {
            core.events
                .get(event)
                .map(|cb| cb.flags)
                .ok_or(KernelError::InvalidArgument)
        })
    }
}
