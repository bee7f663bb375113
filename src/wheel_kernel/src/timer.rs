//! Timers
use crate::{
    critical::Job,
    error::{KernelError, KernelResult},
    state::KernelCore,
    tick::{TickEvent, TickKey},
    Kernel, Port, TimerId,
};

/// The function type of a timer callback.
pub type TimerCallback<P> = fn(&Kernel<P>, usize);

/// Specifies whether a timer re-arms itself after firing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerMode {
    OneShot,
    /// Re-arm for the same interval each time the callback returns. The
    /// period is measured from the expiry, so lateness accumulates.
    Repeating,
}

/// *Timer control block* - the state data of a timer.
pub(crate) struct TimerCb<P: Port> {
    pub(crate) mode: TimerMode,
    /// The delay in ticks.
    pub(crate) interval: u32,
    pub(crate) callback: TimerCallback<P>,
    pub(crate) arg: usize,
    /// The tick node. `Some(_)` iff the timer is active.
    pub(crate) tick: Option<TickKey>,
}

impl<P: Port> TimerCb<P> {
    fn new(mode: TimerMode, interval: u32, callback: TimerCallback<P>, arg: usize) -> Self {
        Self {
            mode,
            interval,
            callback,
            arg,
            tick: None,
        }
    }
}

impl<P: Port> KernelCore<P> {
    fn timer_mut(&mut self, timer: TimerId) -> KernelResult<&mut TimerCb<P>> {
        self.timers.get_mut(timer).ok_or(KernelError::InvalidArgument)
    }

    fn start_timer(&mut self, timer: TimerId) -> KernelResult<()> {
        self.stop_timer(timer)?;
        let interval = self.timer_mut(timer)?.interval;
        let key = self.ticks.arm(interval, TickEvent::Timer(timer))?;
        self.timers[timer].tick = Some(key);
        Ok(())
    }

    fn stop_timer(&mut self, timer: TimerId) -> KernelResult<()> {
        if let Some(key) = self.timer_mut(timer)?.tick.take() {
            self.ticks.cancel(key);
        }
        Ok(())
    }

    /// Handle the expiry of a timer's tick node. The callback runs with the
    /// scheduler locked.
    pub(crate) fn on_timer_expired(&mut self, kernel: &Kernel<P>, timer: TimerId) {
        let Some(cb) = self.timers.get_mut(timer) else { return };
        cb.tick = None;
        let (callback, arg) = (cb.callback, cb.arg);

        self.sched_lock += 1;
        callback(kernel, arg);
        self.sched_lock -= 1;

        if self.timers[timer].mode == TimerMode::Repeating {
            if let Err(e) = self.start_timer(timer) {
                log::warn!("failed to re-arm {timer:?}: {e:?}");
            }
        }
    }
}

fn timer_start_job<P: Port>(
    _: &Kernel<P>,
    core: &mut KernelCore<P>,
    timer: usize,
    _: usize,
) -> KernelResult<()> {
    let timer = TimerId::from_raw(timer).ok_or(KernelError::InvalidArgument)?;
    core.start_timer(timer)
}

fn timer_stop_job<P: Port>(
    _: &Kernel<P>,
    core: &mut KernelCore<P>,
    timer: usize,
    _: usize,
) -> KernelResult<()> {
    let timer = TimerId::from_raw(timer).ok_or(KernelError::InvalidArgument)?;
    core.stop_timer(timer)
}

impl<P: Port> Kernel<P> {
    /// Create an inactive timer that calls `callback(kernel, arg)` `interval`
    /// ticks after it's started.
    ///
    /// The callback runs in the critical section of the tick announcement.
    /// Kernel calls made by it are executed after it returns, and blocking
    /// calls fail with [`KernelError::BadContext`].
    pub fn timer_create(
        &self,
        mode: TimerMode,
        interval: u32,
        callback: TimerCallback<P>,
        arg: usize,
    ) -> KernelResult<TimerId> {
        if interval == 0 {
            return Err(KernelError::InvalidArgument);
        }
        self.run_exclusive_task_only(|_, core| {
            core.timers
                .insert(TimerCb::new(mode, interval, callback, arg))
                .map_err(|_| KernelError::ResourceExhausted)
        })
    }

    /// Re-configure an existing timer. The timer is stopped.
    pub fn timer_init(
        &self,
        timer: TimerId,
        mode: TimerMode,
        interval: u32,
        callback: TimerCallback<P>,
        arg: usize,
    ) -> KernelResult<()> {
        if interval == 0 {
            return Err(KernelError::InvalidArgument);
        }
        self.run_exclusive_task_only(|_, core| {
            core.stop_timer(timer)?;
            core.timers[timer] = TimerCb::new(mode, interval, callback, arg);
            Ok(())
        })
    }

    /// Arm the timer for its interval. An active timer is restarted.
    pub fn timer_start(&self, timer: TimerId) -> KernelResult<()> {
        self.run_exclusive_always(Job::new(timer_start_job::<P>, timer.into_raw(), 0))
    }

    /// Disarm the timer. Does nothing if it's inactive.
    pub fn timer_stop(&self, timer: TimerId) -> KernelResult<()> {
        self.run_exclusive_always(Job::new(timer_stop_job::<P>, timer.into_raw(), 0))
    }

    /// Stop and destroy the timer. Its handle may be reused afterwards.
    pub fn timer_delete(&self, timer: TimerId) -> KernelResult<()> {
        self.run_exclusive_task_only(|_, core| {
            core.stop_timer(timer)?;
            core.timers.remove(timer);
            Ok(())
        })
    }

    pub fn timer_is_active(&self, timer: TimerId) -> KernelResult<bool> {
        self.with_core(|_, core| Ok(core.timer_mut(timer)?.tick.is_some()))
    }

    /// Get the number of ticks until the timer fires, or `None` if it's
    /// inactive.
    pub fn timer_remaining(&self, timer: TimerId) -> KernelResult<Option<u32>> {
        self.with_core(|_, core| match core.timer_mut(timer)?.tick {
            Some(key) => Ok(core.ticks.remaining(key)),
            None => Ok(None),
        })
    }
}
