//! Manages timeouts (timed events) and the tick counter.
//!
//! # Delta Encoding
//!
//! Pending timeouts are kept in a list sorted by expiry. Each node stores the
//! number of ticks remaining *after the previous node expires*, so the
//! absolute remaining time of a node is the sum of the deltas up to and
//! including it:
//!
//! ```text
//!  head
//!   │
//!   v
//! ┌───┐   ┌───┐   ┌───┐
//! │ 3 ├──>│ 2 ├──>│ 5 │      deltas
//! └───┘   └───┘   └───┘
//!   3       5      10        absolute
//! ```
//!
//! Advancing time only touches the head, and expired nodes are always at the
//! front. A node inserted between two others takes the remainder and
//! decreases the delta of its successor by the same amount.
//!
//! Nodes with equal expiries fire in the order they were armed.
use crate::{
    critical::Job,
    error::{KernelError, KernelResult},
    state::KernelCore,
    utils::{
        intrusive_list::{Link, ListAccessor, ListHead},
        Pool,
    },
    Kernel, Port, TaskId, TimerId,
};

define_id! {
    /// Identifies a node in [`TickQueue`].
    pub(crate) struct TickKey;
}

/// The function type of a raw tick-queue callback.
pub type TickCallback<P> = fn(&Kernel<P>, usize);

/// A handle to a raw tick-queue node armed by [`Kernel::tick_arm`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TickHandle {
    key: TickKey,
    seq: u32,
}

/// What to do when a node expires.
pub(crate) enum TickEvent<P: Port> {
    /// Time out the wait or delay of a task.
    Task(TaskId),
    Timer(TimerId),
    /// Call a function registered by [`Kernel::tick_arm`].
    Raw {
        func: TickCallback<P>,
        arg: usize,
        seq: u32,
    },
}

struct TickNode<T> {
    /// The number of ticks remaining after the previous node expires.
    ticks_left: u32,
    payload: T,
    link: Option<Link<TickKey>>,
}

fn node_link<T>(node: &mut TickNode<T>) -> &mut Option<Link<TickKey>> {
    &mut node.link
}

/// A delta-encoded list of pending timeouts.
pub(crate) struct TickQueue<T> {
    nodes: Pool<TickKey, TickNode<T>>,
    head: ListHead<TickKey>,
}

impl<T> TickQueue<T> {
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        Self {
            nodes: Pool::with_capacity(capacity),
            head: ListHead::new(),
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.nodes.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.head.is_empty()
    }

    /// Register `payload` to expire after `ticks` ticks.
    pub(crate) fn arm(&mut self, ticks: u32, payload: T) -> KernelResult<TickKey> {
        let key = self
            .nodes
            .insert(TickNode {
                ticks_left: 0,
                payload,
                link: None,
            })
            .map_err(|_| KernelError::ResourceExhausted)?;

        let mut remaining = ticks;
        let mut list = ListAccessor::new(&mut self.head, &mut self.nodes, node_link);

        // Find the first node expiring strictly later than the new one
        let at = list.find(|_, node| {
            if remaining < node.ticks_left {
                true
            } else {
                remaining -= node.ticks_left;
                false
            }
        });

        if let Some(at) = at {
            list.pool()[at].ticks_left -= remaining;
        }
        list.pool()[key].ticks_left = remaining;
        list.insert(key, at);

        Ok(key)
    }

    /// Unregister a node. Returns its payload, or `None` if `key` doesn't
    /// name an armed node.
    pub(crate) fn cancel(&mut self, key: TickKey) -> Option<T> {
        if !self.nodes.contains(key) {
            return None;
        }

        let mut list = ListAccessor::new(&mut self.head, &mut self.nodes, node_link);
        let next = list.next(key);
        let ticks_left = list.pool()[key].ticks_left;
        list.remove(key);

        // Fold the delta into the successor so that its expiry is unchanged
        if let Some(next) = next {
            list.pool()[next].ticks_left += ticks_left;
        }

        self.nodes.remove(key).map(|node| node.payload)
    }

    /// Get the payload of an armed node.
    pub(crate) fn get(&self, key: TickKey) -> Option<&T> {
        self.nodes.get(key).map(|node| &node.payload)
    }

    /// Consume `ticks` ticks from the head node. The head's delta is floored
    /// at zero; the excess is not carried into later nodes.
    pub(crate) fn advance(&mut self, ticks: u32) {
        if let Some(first) = self.head.first {
            let node = &mut self.nodes[first];
            node.ticks_left = node.ticks_left.saturating_sub(ticks);
        }
    }

    /// Remove and return the head node if it has expired.
    pub(crate) fn pop_expired(&mut self) -> Option<(TickKey, T)> {
        let first = self.head.first?;
        if self.nodes[first].ticks_left != 0 {
            return None;
        }

        ListAccessor::new(&mut self.head, &mut self.nodes, node_link).remove(first);
        self.nodes.remove(first).map(|node| (first, node.payload))
    }

    /// Get the number of ticks until the node expires.
    pub(crate) fn remaining(&mut self, key: TickKey) -> Option<u32> {
        if !self.nodes.contains(key) {
            return None;
        }

        let mut sum = 0u32;
        ListAccessor::new(&mut self.head, &mut self.nodes, node_link).find(|k, node| {
            sum = sum.saturating_add(node.ticks_left);
            k == key
        });
        Some(sum)
    }
}

impl<P: Port> KernelCore<P> {
    /// Fire every expired node. Handlers run in the critical section, so
    /// kernel calls they make are queued and run after this job.
    fn fire_expired(&mut self, kernel: &Kernel<P>) {
        while let Some((_, event)) = self.ticks.pop_expired() {
            match event {
                TickEvent::Task(task) => self.on_task_timeout(task),
                TickEvent::Timer(timer) => self.on_timer_expired(kernel, timer),
                TickEvent::Raw { func, arg, .. } => {
                    self.raw_ticks -= 1;
                    self.sched_lock += 1;
                    func(kernel, arg);
                    self.sched_lock -= 1;
                }
            }
        }
    }

    /// Charge `ticks` to the running task and rotate it within its priority
    /// bucket when its slice is used up.
    fn round_robin(&mut self, ticks: u32) {
        let Some(task) = self.current else { return };
        if Some(task) == self.idle {
            return;
        }

        let cb = &mut self.tasks[task];
        if !cb.st.is_empty() || cb.ready_link.is_none() {
            return;
        }

        cb.slices = cb.slices.saturating_add(ticks);
        if cb.slices >= self.round_robin_slices {
            log::trace!("{task:?} used up its slice");
            self.ready.remove(&mut self.tasks, task);
            self.ready.push_back(&mut self.tasks, task);
        }
    }
}

fn tick_job<P: Port>(
    kernel: &Kernel<P>,
    core: &mut KernelCore<P>,
    ticks: usize,
    _: usize,
) -> KernelResult<()> {
    let ticks = ticks as u32;
    core.tick_count = core.tick_count.wrapping_add(u64::from(ticks));

    if !core.ticks.is_empty() {
        core.ticks.advance(ticks);
        core.fire_expired(kernel);
    }

    core.round_robin(ticks);
    Ok(())
}

fn tick_cancel_job<P: Port>(
    _: &Kernel<P>,
    core: &mut KernelCore<P>,
    key: usize,
    seq: usize,
) -> KernelResult<()> {
    let key = TickKey::from_raw(key).ok_or(KernelError::InvalidArgument)?;
    match core.ticks.get(key) {
        Some(TickEvent::Raw { seq: s, .. }) if *s as usize == seq => {}
        _ => return Err(KernelError::InvalidArgument),
    }
    core.ticks.cancel(key);
    core.raw_ticks -= 1;
    Ok(())
}

/// The tick entry points
impl<P: Port> Kernel<P> {
    /// Announce one tick. Call this once per hardware timer interrupt.
    #[inline]
    pub fn tick(&self) -> KernelResult<()> {
        self.tick_announce(1)
    }

    /// Announce `ticks` ticks at once, e.g., after the timer interrupt was
    /// masked for a while.
    pub fn tick_announce(&self, ticks: u32) -> KernelResult<()> {
        self.run_exclusive_always(Job::new(tick_job::<P>, ticks as usize, 0))
    }

    /// Get the number of ticks announced since the kernel was created.
    pub fn tick_count(&self) -> KernelResult<u64> {
        self.with_core(|_, core| Ok(core.tick_count))
    }

    /// Call `func(kernel, arg)` after `ticks` ticks. `ticks == 0` fires on
    /// the next tick announcement.
    ///
    /// The callback runs inside the critical section. Kernel calls it makes
    /// are deferred until the expiry processing completes, and calls that
    /// must not run in a critical section fail with
    /// [`KernelError::BadContext`].
    pub fn tick_arm(
        &self,
        ticks: u32,
        func: TickCallback<P>,
        arg: usize,
    ) -> KernelResult<TickHandle> {
        self.with_core(|_, core| {
            if core.raw_ticks >= core.max_raw_ticks {
                return Err(KernelError::ResourceExhausted);
            }
            let seq = core.raw_tick_seq;
            let key = core.ticks.arm(ticks, TickEvent::Raw { func, arg, seq })?;
            core.raw_tick_seq = seq.wrapping_add(1);
            core.raw_ticks += 1;
            Ok(TickHandle { key, seq })
        })
    }

    /// Cancel a callback registered by [`Self::tick_arm`]. Fails with
    /// [`KernelError::InvalidArgument`] if it already fired.
    pub fn tick_cancel(&self, handle: TickHandle) -> KernelResult<()> {
        self.run_exclusive_always(Job::new(
            tick_cancel_job::<P>,
            handle.key.into_raw(),
            handle.seq as usize,
        ))
    }
}
