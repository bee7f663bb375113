//! Simulation environment for running the wheel kernel on a hosted
//! environment.
//!
//! Every task is backed by an OS thread, and the processor is handed from
//! thread to thread on each context switch, so exactly one task runs at a
//! time. The thread that calls [`boot`] becomes the idle task and drives the
//! simulation: it advances the [simulated clock](StdPort::advance_clock) and
//! [raises interrupts](StdPort::pend_interrupt).
//!
//! Interrupts are taken synchronously by the running context, whenever it's
//! not masking them.
//!
//! ```no_run
//! use wheel_kernel::{hal, KernelConfig};
//! use wheel_port_std::StdPort;
//!
//! fn hello(kernel: &'static wheel_kernel::Kernel<StdPort>, _: usize) {
//!     log::info!("running at tick {:?}", kernel.tick_count());
//! }
//!
//! let kernel = wheel_port_std::boot(KernelConfig::new(), |kernel| {
//!     hal::sysclk_init(kernel, kernel.port().timer(), 1000)?;
//!     kernel.task_spawn("hello", 5, 0x1000, hello, 0)?;
//!     Ok(())
//! })
//! .unwrap();
//! kernel.port().advance_clock(5_000);
//! ```
use spin::Mutex as SpinMutex;
use std::{
    any::Any,
    cell::Cell,
    mem,
    panic::{self, AssertUnwindSafe},
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, OnceLock,
    },
    thread,
    time::Duration,
};
use wheel_kernel::{Kernel, KernelConfig, KernelResult, Port};

mod baton;
mod sim;

pub use self::sim::{SimIntc, SimTimer};

/// The number of lines of [`SimIntc`].
pub const NUM_INTERRUPT_LINES: usize = 64;

/// The input clock frequency of [`SimTimer`] in hertz.
pub const TIMER_FREQUENCY: u32 = 1_000_000;

/// How long the idle task waits for the processor before concluding that the
/// simulated system has hung.
const STALL_TIMEOUT: Duration = Duration::from_secs(30);

/// The state shared by the port and the threads backing the tasks.
struct Shared {
    baton: baton::Baton,
    irq_depth: AtomicUsize,
    nesting: AtomicUsize,
    next_context_id: AtomicUsize,
    idle: AtomicUsize,
    /// The number of task threads that haven't finished.
    threads: AtomicUsize,
    /// The message of a panic that occurred in a task thread.
    panic: SpinMutex<Option<String>>,
    kernel: OnceLock<&'static Kernel<StdPort>>,
    intc: SimIntc,
    timer: SimTimer,
}

/// The hosted [`Port`].
pub struct StdPort {
    shared: Arc<Shared>,
}

/// The saved execution context of a task.
///
/// Dropping it ends the backing thread, which must not be running.
pub struct TaskContext {
    state: Arc<ContextState>,
    shared: Arc<Shared>,
}

struct ContextState {
    id: usize,
    resume: SpinMutex<Resume>,
    /// The context was released. Its thread unwinds out of the kernel.
    retired: AtomicBool,
}

impl Drop for TaskContext {
    fn drop(&mut self) {
        self.state.retired.store(true, Ordering::Release);
        self.shared.baton.wake_all();
    }
}

/// The unwinding payload that ends the thread of a released context.
struct Retired;

thread_local! {
    /// The calling thread is unwinding after its context was released. It
    /// no longer owns the simulated processor, so it mustn't touch the
    /// interrupt state.
    static RETIRING: Cell<bool> = const { Cell::new(false) };
}

fn retiring() -> bool {
    RETIRING.with(Cell::get)
}

/// Where a context starts or resumes.
struct Resume {
    entry: Option<fn(usize)>,
    arg: usize,
    /// The backing thread has been created.
    started: bool,
    /// `entry` replaces the point where the context was suspended.
    redirected: bool,
}

impl Default for StdPort {
    fn default() -> Self {
        Self::new()
    }
}

impl StdPort {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                baton: baton::Baton::new(),
                irq_depth: AtomicUsize::new(0),
                nesting: AtomicUsize::new(0),
                next_context_id: AtomicUsize::new(1),
                idle: AtomicUsize::new(0),
                threads: AtomicUsize::new(0),
                panic: SpinMutex::new(None),
                kernel: OnceLock::new(),
                intc: SimIntc::new(),
                timer: SimTimer::new(),
            }),
        }
    }

    pub fn intc(&self) -> &SimIntc {
        &self.shared.intc
    }

    pub fn timer(&self) -> &SimTimer {
        &self.shared.timer
    }

    /// Get the number of OS threads backing tasks that are still alive. The
    /// thread of a reaped task finishes shortly after the reaping.
    pub fn task_threads(&self) -> usize {
        self.shared.threads.load(Ordering::Acquire)
    }

    /// Run `f` as an interrupt handler on the calling context. When the
    /// outermost handler returns, pending lines are serviced and the kernel
    /// reschedules.
    pub fn interrupt<R>(&self, f: impl FnOnce() -> R) -> R {
        let shared = &self.shared;
        shared.nesting.fetch_add(1, Ordering::Relaxed);
        let result = f();

        if shared.nesting.load(Ordering::Relaxed) == 1 {
            while let Some((handler, arg)) = shared.intc.take_pending() {
                handler(arg);
            }
        }

        if shared.nesting.fetch_sub(1, Ordering::Relaxed) == 1 {
            if let Some(kernel) = shared.kernel.get() {
                kernel.dispatch();
            }
        }
        result
    }

    /// Pend `line` and service it if interrupts aren't masked.
    pub fn pend_interrupt(&self, line: usize) -> KernelResult<()> {
        self.shared.intc.pend(line)?;
        self.service_interrupts();
        Ok(())
    }

    /// Advance the simulated clock by `cycles` cycles of [`TIMER_FREQUENCY`],
    /// taking the timer interrupts that occur meanwhile.
    pub fn advance_clock(&self, cycles: u32) {
        if let Some(((handler, arg), expiries)) = self.shared.timer.advance(cycles) {
            for _ in 0..expiries {
                self.interrupt(|| handler(arg));
            }
        }
    }

    fn service_interrupts(&self) {
        let shared = &self.shared;
        if shared.irq_depth.load(Ordering::Relaxed) == 0
            && shared.nesting.load(Ordering::Relaxed) == 0
            && shared.intc.has_pending()
        {
            self.interrupt(|| {});
        }
    }

    fn new_context(&self, entry: Option<fn(usize)>, arg: usize, started: bool) -> TaskContext {
        TaskContext {
            state: Arc::new(ContextState {
                id: self.shared.next_context_id.fetch_add(1, Ordering::Relaxed),
                resume: SpinMutex::new(Resume {
                    entry,
                    arg,
                    started,
                    redirected: false,
                }),
                retired: AtomicBool::new(false),
            }),
            shared: Arc::clone(&self.shared),
        }
    }

    /// Create the thread backing `context`. It waits for the processor
    /// before doing anything.
    fn spawn(&self, context: Arc<ContextState>) {
        let shared = Arc::clone(&self.shared);
        let id = context.id;
        shared.threads.fetch_add(1, Ordering::AcqRel);
        thread::Builder::new()
            .name(format!("task-{id}"))
            .spawn(move || {
                if !shared
                    .baton
                    .wait_unless(id, || context.retired.load(Ordering::Acquire))
                {
                    shared.threads.fetch_sub(1, Ordering::AcqRel);
                    return;
                }
                // A fresh context starts with interrupts unmasked
                shared.irq_depth.store(0, Ordering::Relaxed);

                let (entry, arg) = {
                    let mut resume = context.resume.lock();
                    resume.redirected = false;
                    (resume.entry, resume.arg)
                };
                drop(context);

                let Some(entry) = entry else {
                    unreachable!("context {id} has no entry point")
                };
                log::debug!("context {id} is now running");

                match panic::catch_unwind(AssertUnwindSafe(|| entry(arg))) {
                    Ok(()) => {}
                    Err(payload) if payload.is::<Retired>() => {
                        log::trace!("the thread of context {id} is finishing");
                    }
                    Err(payload) => {
                        // Let the idle task report the failure
                        *shared.panic.lock() = Some(panic_message(&*payload));
                        shared.baton.pass(shared.idle.load(Ordering::Relaxed));
                    }
                }
                shared.threads.fetch_sub(1, Ordering::AcqRel);
            })
            .expect("failed to spawn a task thread");
    }

    /// Block the calling thread, which backs `context`, until it's given the
    /// processor again.
    fn park(&self, context: &ContextState) {
        let shared = &self.shared;

        if context.id == shared.idle.load(Ordering::Relaxed) {
            if !shared.baton.wait_timeout(context.id, STALL_TIMEOUT) {
                panic!("the simulated system stalled");
            }
            if let Some(message) = shared.panic.lock().take() {
                panic!("a task panicked: {message}");
            }
        } else if !shared
            .baton
            .wait_unless(context.id, || context.retired.load(Ordering::Acquire))
        {
            // The task was reaped. Unwind to the thread's entry point without
            // touching the kernel or the interrupt state on the way.
            RETIRING.with(|r| r.set(true));
            panic::resume_unwind(Box::new(Retired));
        }

        let redirect = {
            let mut resume = context.resume.lock();
            if mem::take(&mut resume.redirected) {
                resume.entry.map(|entry| (entry, resume.arg))
            } else {
                None
            }
        };

        if let Some((entry, arg)) = redirect {
            log::trace!("context {} resumes at a new address", context.id);
            shared.irq_depth.store(0, Ordering::Relaxed);
            entry(arg);
            unreachable!("a redirected context returned");
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "(unknown payload)".to_owned()
    }
}

unsafe impl Port for StdPort {
    type Context = TaskContext;

    fn init_context(&self, _stack: &mut [u8], entry: fn(usize), arg: usize) -> TaskContext {
        // The backing thread has a stack of its own
        self.new_context(Some(entry), arg, false)
    }

    fn adopt_context(&self) -> TaskContext {
        let context = self.new_context(None, 0, true);
        let id = context.state.id;
        self.shared.idle.store(id, Ordering::Relaxed);
        self.shared.baton.pass(id);
        context
    }

    fn resume_address(&self, context: &TaskContext) -> usize {
        context
            .state
            .resume
            .lock()
            .entry
            .map_or(0, |entry| entry as usize)
    }

    fn set_resume_address(&self, context: &TaskContext, entry: fn(usize)) {
        let mut resume = context.state.resume.lock();
        resume.entry = Some(entry);
        resume.redirected = resume.started;
    }

    fn set_argument(&self, context: &TaskContext, arg: usize) {
        context.state.resume.lock().arg = arg;
    }

    unsafe fn switch_context(&self, from: &TaskContext, to: &TaskContext) {
        // `from` may be released while it's not running
        let from = Arc::clone(&from.state);
        let to_id = to.state.id;

        let first_run = !mem::replace(&mut to.state.resume.lock().started, true);
        if first_run {
            self.spawn(Arc::clone(&to.state));
        }

        log::trace!("switch_context({} -> {to_id})", from.id);
        self.shared.baton.pass(to_id);
        self.park(&from);
    }

    fn irq_lock(&self) -> usize {
        if retiring() {
            return 0;
        }
        self.shared.irq_depth.fetch_add(1, Ordering::Relaxed)
    }

    unsafe fn irq_unlock(&self, key: usize) {
        if retiring() {
            return;
        }
        self.shared.irq_depth.store(key, Ordering::Relaxed);
        if key == 0 {
            self.service_interrupts();
        }
    }

    fn interrupt_nesting(&self) -> usize {
        self.shared.nesting.load(Ordering::Relaxed)
    }
}

/// Create a kernel, let `init` populate it, and start it. The calling thread
/// becomes the idle task, and this function returns when no other task is
/// ready.
pub fn boot(
    config: KernelConfig,
    init: impl FnOnce(&'static Kernel<StdPort>) -> KernelResult<()>,
) -> KernelResult<&'static Kernel<StdPort>> {
    let _ = env_logger::try_init();

    let kernel: &'static Kernel<StdPort> = Box::leak(Box::new(Kernel::new(StdPort::new(), config)?));
    if kernel.port().shared.kernel.set(kernel).is_err() {
        unreachable!();
    }

    init(kernel)?;
    kernel.start()?;
    log::debug!("boot complete; the calling thread is now the idle task");
    Ok(kernel)
}
