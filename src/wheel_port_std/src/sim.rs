//! Simulated interrupt controller and timer
use spin::Mutex as SpinMutex;
use wheel_kernel::{
    hal::{HalTimer, InterruptController, IrqHandler},
    KernelError, KernelResult,
};

use crate::{NUM_INTERRUPT_LINES, TIMER_FREQUENCY};

#[derive(Clone, Copy)]
struct Line {
    handler: Option<(IrqHandler, usize)>,
    enabled: bool,
    pending: bool,
    /// Lower values are serviced first.
    priority: u8,
}

impl Line {
    const INIT: Self = Self {
        handler: None,
        enabled: false,
        pending: false,
        priority: u8::MAX,
    };
}

/// The simulated interrupt controller.
///
/// Pending lines are serviced when the running context is not masking
/// interrupts, in the order of priority (then line number).
pub struct SimIntc {
    lines: SpinMutex<[Line; NUM_INTERRUPT_LINES]>,
}

impl SimIntc {
    pub(crate) const fn new() -> Self {
        Self {
            lines: SpinMutex::new([Line::INIT; NUM_INTERRUPT_LINES]),
        }
    }

    fn update(&self, line: usize, f: impl FnOnce(&mut Line)) -> KernelResult<()> {
        let mut lines = self.lines.lock();
        let line = lines.get_mut(line).ok_or(KernelError::InvalidArgument)?;
        f(line);
        Ok(())
    }

    /// Mark `line` as pending. Use [`StdPort::pend_interrupt`] to also
    /// service it right away.
    ///
    /// [`StdPort::pend_interrupt`]: crate::StdPort::pend_interrupt
    pub fn pend(&self, line: usize) -> KernelResult<()> {
        self.update(line, |line| line.pending = true)
    }

    pub fn is_pending(&self, line: usize) -> KernelResult<bool> {
        let lines = self.lines.lock();
        lines
            .get(line)
            .map(|line| line.pending)
            .ok_or(KernelError::InvalidArgument)
    }

    /// Take the most urgent serviceable line.
    pub(crate) fn take_pending(&self) -> Option<(IrqHandler, usize)> {
        let mut lines = self.lines.lock();
        let line = lines
            .iter_mut()
            .filter(|line| line.pending && line.enabled && line.handler.is_some())
            .min_by_key(|line| line.priority)?;
        line.pending = false;
        line.handler
    }

    pub(crate) fn has_pending(&self) -> bool {
        let lines = self.lines.lock();
        lines
            .iter()
            .any(|line| line.pending && line.enabled && line.handler.is_some())
    }
}

impl InterruptController for SimIntc {
    fn num_lines(&self) -> usize {
        NUM_INTERRUPT_LINES
    }

    fn connect(&self, line: usize, handler: IrqHandler, arg: usize) -> KernelResult<()> {
        log::trace!("connect line {line}");
        self.update(line, |line| line.handler = Some((handler, arg)))
    }

    fn disconnect(&self, line: usize) -> KernelResult<()> {
        self.update(line, |line| {
            line.handler = None;
            line.enabled = false;
        })
    }

    fn enable(&self, line: usize) -> KernelResult<()> {
        self.update(line, |line| line.enabled = true)
    }

    fn disable(&self, line: usize) -> KernelResult<()> {
        self.update(line, |line| line.enabled = false)
    }

    fn set_priority(&self, line: usize, priority: u8) -> KernelResult<()> {
        self.update(line, |line| line.priority = priority)
    }
}

struct TimerState {
    handler: Option<(IrqHandler, usize)>,
    /// `None` while the timer is disabled.
    reload: Option<u32>,
    counter: u32,
}

/// The simulated periodic timer, clocked by
/// [`StdPort::advance_clock`](crate::StdPort::advance_clock) at
/// [`TIMER_FREQUENCY`].
pub struct SimTimer {
    state: SpinMutex<TimerState>,
}

impl SimTimer {
    pub(crate) const fn new() -> Self {
        Self {
            state: SpinMutex::new(TimerState {
                handler: None,
                reload: None,
                counter: 0,
            }),
        }
    }

    /// Count `cycles` input clock cycles. Returns the handler and the number
    /// of interrupts raised meanwhile.
    pub(crate) fn advance(&self, cycles: u32) -> Option<((IrqHandler, usize), u32)> {
        let mut state = self.state.lock();
        let (Some(handler), Some(reload)) = (state.handler, state.reload) else {
            return None;
        };

        let total = u64::from(state.counter) + u64::from(cycles);
        state.counter = (total % u64::from(reload)) as u32;
        let expiries = (total / u64::from(reload)) as u32;
        Some((handler, expiries))
    }
}

impl HalTimer for SimTimer {
    fn frequency(&self) -> u32 {
        TIMER_FREQUENCY
    }

    fn connect(&self, handler: IrqHandler, arg: usize) -> KernelResult<()> {
        self.state.lock().handler = Some((handler, arg));
        Ok(())
    }

    fn enable(&self, reload: u32) -> KernelResult<()> {
        if reload == 0 {
            return Err(KernelError::InvalidArgument);
        }
        let mut state = self.state.lock();
        state.reload = Some(reload);
        state.counter = 0;
        Ok(())
    }

    fn disable(&self) -> KernelResult<()> {
        self.state.lock().reload = None;
        Ok(())
    }

    fn counter(&self) -> u32 {
        self.state.lock().counter
    }
}
