//! Hardware capabilities consumed by the kernel and its board support
//!
//! A board registers implementations of these traits at startup. The kernel
//! itself only needs a periodic timer to drive the tick; see
//! [`sysclk_init`].
use crate::{
    error::{KernelError, KernelResult},
    Kernel, Port,
};

/// An interrupt service routine. Receives the argument it was connected
/// with.
pub type IrqHandler = fn(usize);

/// An interrupt controller.
///
/// The optional operations default to failing with
/// [`KernelError::Unimplemented`].
pub trait InterruptController {
    /// The number of interrupt lines.
    fn num_lines(&self) -> usize;

    /// Register `handler` for `line`. The line stays disabled.
    fn connect(&self, line: usize, handler: IrqHandler, arg: usize) -> KernelResult<()>;

    fn disconnect(&self, _line: usize) -> KernelResult<()> {
        Err(KernelError::Unimplemented)
    }

    fn enable(&self, line: usize) -> KernelResult<()>;

    fn disable(&self, line: usize) -> KernelResult<()>;

    fn set_priority(&self, _line: usize, _priority: u8) -> KernelResult<()> {
        Err(KernelError::Unimplemented)
    }
}

/// A periodic hardware timer.
pub trait HalTimer {
    /// The input clock frequency in hertz.
    fn frequency(&self) -> u32;

    /// Register the handler of the timer interrupt.
    fn connect(&self, handler: IrqHandler, arg: usize) -> KernelResult<()>;

    /// Start the timer, raising an interrupt every `reload` input clock
    /// cycles.
    fn enable(&self, reload: u32) -> KernelResult<()>;

    fn disable(&self) -> KernelResult<()>;

    /// Get the current counter value.
    fn counter(&self) -> u32 {
        0
    }
}

fn sysclk_handler<P: Port>(kernel: usize) {
    // Safety: `kernel` was derived from the `&'static Kernel<P>` passed to
    //         `sysclk_init`
    let kernel = unsafe { &*(kernel as *const Kernel<P>) };
    if let Err(e) = kernel.tick() {
        log::warn!("failed to announce a tick: {e:?}");
    }
}

/// Drive the kernel tick from `timer`, `tick_hz` times per second.
pub fn sysclk_init<P: Port>(
    kernel: &'static Kernel<P>,
    timer: &impl HalTimer,
    tick_hz: u32,
) -> KernelResult<()> {
    if tick_hz == 0 {
        return Err(KernelError::InvalidArgument);
    }
    let reload = timer.frequency() / tick_hz;
    if reload == 0 {
        return Err(KernelError::InvalidArgument);
    }

    timer.connect(sysclk_handler::<P>, kernel as *const Kernel<P> as usize)?;
    timer.enable(reload)?;
    log::debug!("system clock: {tick_hz} Hz (reload = {reload})");
    Ok(())
}
