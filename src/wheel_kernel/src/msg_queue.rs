//! Message queues
//!
//! A message queue is a fixed set of equally sized slots, a mutex guarding
//! the slot lists, and two semaphores counting the free and the filled
//! slots. Senders wait on the free count and receivers on the filled count,
//! so no allocation happens after creation.
use alloc::{boxed::Box, collections::VecDeque, vec::Vec};
use core::mem::align_of;

use crate::{
    config::WAIT_FOREVER,
    error::{KernelError, KernelResult},
    mutex::MutexCb,
    semaphore::SemaphoreCb,
    state::KernelCore,
    Kernel, MsgQueueId, MutexId, Port, SemaphoreId,
};

/// *Message queue control block* - the state data of a message queue.
pub(crate) struct MsgQueueCb {
    /// The slot size in bytes, a multiple of the pointer alignment.
    msg_size: usize,
    slots: Slots,
    slots_free: SemaphoreId,
    slots_filled: SemaphoreId,
    lock: MutexId,
}

/// The heap-allocated part of a message queue.
struct Slots {
    storage: Box<[u8]>,
    /// The number of bytes stored in each slot.
    lens: Box<[usize]>,
    free: VecDeque<usize>,
    /// Consumed FIFO.
    filled: VecDeque<usize>,
}

/// The kernel objects a message queue is built on.
#[derive(Debug, Clone, Copy)]
struct Handles {
    slots_free: SemaphoreId,
    slots_filled: SemaphoreId,
    lock: MutexId,
}

impl MsgQueueCb {
    fn handles(&self) -> Handles {
        Handles {
            slots_free: self.slots_free,
            slots_filled: self.slots_filled,
            lock: self.lock,
        }
    }

    fn slot_mut(&mut self, slot: usize) -> &mut [u8] {
        &mut self.slots.storage[slot * self.msg_size..][..self.msg_size]
    }

    /// Copy `msg` into a free slot. The caller holds a unit of `slots_free`.
    fn push(&mut self, msg: &[u8]) -> KernelResult<usize> {
        let slot = self.slots.free.pop_front().ok_or(KernelError::QueueFull)?;
        let len = msg.len().min(self.msg_size);
        self.slot_mut(slot)[..len].copy_from_slice(&msg[..len]);
        self.slots.lens[slot] = len;
        self.slots.filled.push_back(slot);
        Ok(len)
    }

    /// Copy the oldest message into `buf`. The caller holds a unit of
    /// `slots_filled`.
    fn pop(&mut self, buf: &mut [u8]) -> KernelResult<usize> {
        let slot = self.slots.filled.pop_front().ok_or(KernelError::WouldBlock)?;
        let len = buf.len().min(self.slots.lens[slot]);
        buf[..len].copy_from_slice(&self.slot_mut(slot)[..len]);
        self.slots.free.push_back(slot);
        Ok(len)
    }
}

impl<P: Port> KernelCore<P> {
    fn queue_mut(&mut self, mq: MsgQueueId) -> KernelResult<&mut MsgQueueCb> {
        self.queues.get_mut(mq).ok_or(KernelError::InvalidArgument)
    }
}

impl<P: Port> Kernel<P> {
    /// Create a message queue of `capacity` slots holding up to `msg_size`
    /// bytes each.
    pub fn mq_create(&self, msg_size: usize, capacity: usize) -> KernelResult<MsgQueueId> {
        if msg_size == 0 || capacity == 0 {
            return Err(KernelError::InvalidArgument);
        }
        let msg_size = msg_size
            .checked_add(align_of::<usize>() - 1)
            .ok_or(KernelError::InvalidArgument)?
            & !(align_of::<usize>() - 1);
        let bytes = msg_size
            .checked_mul(capacity)
            .ok_or(KernelError::ResourceExhausted)?;

        // Allocate everything before entering the critical section
        let mut storage = Vec::new();
        storage
            .try_reserve_exact(bytes)
            .map_err(|_| KernelError::ResourceExhausted)?;
        storage.resize(bytes, 0);
        let mut free = VecDeque::new();
        free.try_reserve_exact(capacity)
            .map_err(|_| KernelError::ResourceExhausted)?;
        free.extend(0..capacity);
        let mut filled = VecDeque::new();
        filled
            .try_reserve_exact(capacity)
            .map_err(|_| KernelError::ResourceExhausted)?;
        let mut lens = Vec::new();
        lens.try_reserve_exact(capacity)
            .map_err(|_| KernelError::ResourceExhausted)?;
        lens.resize(capacity, 0);

        let count = u32::try_from(capacity).map_err(|_| KernelError::InvalidArgument)?;

        let slots = Slots {
            storage: storage.into_boxed_slice(),
            lens: lens.into_boxed_slice(),
            free,
            filled,
        };

        let result = self.run_exclusive_task_only(move |_, core| {
            if core.queues.is_full()
                || core.mutexes.is_full()
                || core.semaphores.available() < 2
            {
                // Give the buffers back to be released outside
                return Ok(Err(slots));
            }

            let lock = core
                .mutexes
                .insert(MutexCb::new())
                .map_err(|_| KernelError::ResourceExhausted)?;
            let slots_free = core
                .semaphores
                .insert(SemaphoreCb::new(count))
                .map_err(|_| KernelError::ResourceExhausted)?;
            let slots_filled = core
                .semaphores
                .insert(SemaphoreCb::new(0))
                .map_err(|_| KernelError::ResourceExhausted)?;

            let cb = MsgQueueCb {
                msg_size,
                slots,
                slots_free,
                slots_filled,
                lock,
            };
            Ok(core.queues.insert(cb).map_err(|cb| cb.slots))
        })?;

        match result {
            Ok(mq) => {
                log::debug!("created {mq:?} ({capacity} x {msg_size} bytes)");
                Ok(mq)
            }
            Err(slots) => {
                drop(slots);
                Err(KernelError::ResourceExhausted)
            }
        }
    }

    /// Message queues can't be deleted. Always fails with
    /// [`KernelError::Unimplemented`].
    pub fn mq_delete(&self, _mq: MsgQueueId) -> KernelResult<()> {
        Err(KernelError::Unimplemented)
    }

    #[inline]
    pub fn mq_send(&self, mq: MsgQueueId, msg: &[u8]) -> KernelResult<usize> {
        self.mq_timedsend(mq, msg, WAIT_FOREVER)
    }

    /// Append a message, waiting for at most `timeout` ticks for a free
    /// slot. Returns the number of bytes stored, which is `msg.len()`
    /// truncated to the slot size.
    ///
    /// `timeout == 0` fails with [`KernelError::WouldBlock`] instead of
    /// waiting, and is also accepted before the kernel starts.
    pub fn mq_timedsend(&self, mq: MsgQueueId, msg: &[u8], timeout: u32) -> KernelResult<usize> {
        if msg.is_empty() {
            return Err(KernelError::InvalidArgument);
        }
        let handles = self.mq_handles(mq)?;

        self.take_slot(handles.slots_free, timeout)?;
        match self.with_slot_lock(handles.lock, |core| core.queue_mut(mq)?.push(msg)) {
            Ok(len) => {
                self.sem_post(handles.slots_filled)?;
                Ok(len)
            }
            Err(e) => {
                self.give_back(handles.slots_free);
                Err(e)
            }
        }
    }

    #[inline]
    pub fn mq_recv(&self, mq: MsgQueueId, buf: &mut [u8]) -> KernelResult<usize> {
        self.mq_timedrecv(mq, buf, WAIT_FOREVER)
    }

    /// Remove the oldest message, waiting for at most `timeout` ticks for
    /// one to arrive. Returns the number of bytes copied into `buf`, which
    /// is the message length truncated to `buf.len()`.
    pub fn mq_timedrecv(&self, mq: MsgQueueId, buf: &mut [u8], timeout: u32) -> KernelResult<usize> {
        if buf.is_empty() {
            return Err(KernelError::InvalidArgument);
        }
        let handles = self.mq_handles(mq)?;

        self.take_slot(handles.slots_filled, timeout)?;
        match self.with_slot_lock(handles.lock, |core| core.queue_mut(mq)?.pop(buf)) {
            Ok(len) => {
                self.sem_post(handles.slots_free)?;
                Ok(len)
            }
            Err(e) => {
                self.give_back(handles.slots_filled);
                Err(e)
            }
        }
    }

    /// Get the number of messages waiting to be received.
    pub fn mq_len(&self, mq: MsgQueueId) -> KernelResult<usize> {
        self.with_core(|_, core| Ok(core.queue_mut(mq)?.slots.filled.len()))
    }

    fn mq_handles(&self, mq: MsgQueueId) -> KernelResult<Handles> {
        self.with_core(|_, core| Ok(core.queue_mut(mq)?.handles()))
    }

    /// Take a unit of `sem`. Waiting is attempted only if none is
    /// available, so that a non-waiting transfer also works before the
    /// kernel starts.
    fn take_slot(&self, sem: SemaphoreId, timeout: u32) -> KernelResult<()> {
        match self.sem_trywait(sem) {
            Err(KernelError::WouldBlock) if timeout != 0 => self.sem_timedwait(sem, timeout),
            result => result,
        }
    }

    /// Return a semaphore unit taken for a transfer that didn't happen.
    fn give_back(&self, sem: SemaphoreId) {
        if let Err(e) = self.sem_post(sem) {
            log::warn!("failed to return a slot to {sem:?}: {e:?}");
        }
    }

    /// Run `f` on the slot lists while holding the queue's mutex.
    fn with_slot_lock<R>(
        &self,
        lock: MutexId,
        f: impl FnOnce(&mut KernelCore<P>) -> KernelResult<R>,
    ) -> KernelResult<R> {
        // The idle task can't wait, but it gets through an uncontended lock
        match self.mutex_trylock(lock) {
            Err(KernelError::WouldBlock) => self.mutex_lock(lock)?,
            result => result?,
        }
        let result = self.run_exclusive_task_only(|_, core| f(core));
        if let Err(e) = self.mutex_unlock(lock) {
            log::warn!("failed to unlock {lock:?}: {e:?}");
        }
        result
    }
}
