//! A port that never actually switches contexts, for unit tests that exercise
//! kernel state without running tasks.
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Mutex, MutexGuard,
};

use crate::{
    state::KernelCore,
    task::{TaskCb, TaskName, TaskState},
    Kernel, KernelConfig, Port, TaskId,
};

#[derive(Default)]
pub(crate) struct TestPort {
    irq_depth: AtomicUsize,
    nesting: AtomicUsize,
    switches: AtomicUsize,
}

pub(crate) struct TestContext {
    resume_address: AtomicUsize,
    arg: AtomicUsize,
}

impl TestPort {
    /// Run `f` as if it were an interrupt handler.
    pub(crate) fn with_interrupt<R>(&self, f: impl FnOnce() -> R) -> R {
        self.nesting.fetch_add(1, Ordering::Relaxed);
        let result = f();
        self.nesting.fetch_sub(1, Ordering::Relaxed);
        result
    }

    pub(crate) fn switches(&self) -> usize {
        self.switches.load(Ordering::Relaxed)
    }
}

unsafe impl Port for TestPort {
    type Context = TestContext;

    fn init_context(&self, _stack: &mut [u8], entry: fn(usize), arg: usize) -> TestContext {
        TestContext {
            resume_address: AtomicUsize::new(entry as usize),
            arg: AtomicUsize::new(arg),
        }
    }

    fn adopt_context(&self) -> TestContext {
        TestContext {
            resume_address: AtomicUsize::new(0),
            arg: AtomicUsize::new(0),
        }
    }

    fn resume_address(&self, context: &TestContext) -> usize {
        context.resume_address.load(Ordering::Relaxed)
    }

    fn set_resume_address(&self, context: &TestContext, entry: fn(usize)) {
        context
            .resume_address
            .store(entry as usize, Ordering::Relaxed);
    }

    fn set_argument(&self, context: &TestContext, arg: usize) {
        context.arg.store(arg, Ordering::Relaxed);
    }

    unsafe fn switch_context(&self, _from: &TestContext, _to: &TestContext) {
        self.switches.fetch_add(1, Ordering::Relaxed);
    }

    fn irq_lock(&self) -> usize {
        self.irq_depth.fetch_add(1, Ordering::Relaxed)
    }

    unsafe fn irq_unlock(&self, key: usize) {
        self.irq_depth.store(key, Ordering::Relaxed);
    }

    fn interrupt_nesting(&self) -> usize {
        self.nesting.load(Ordering::Relaxed)
    }
}

/// Create a leaked kernel instance.
pub(crate) fn test_kernel() -> &'static Kernel<TestPort> {
    test_kernel_with(KernelConfig::new())
}

pub(crate) fn test_kernel_with(config: KernelConfig) -> &'static Kernel<TestPort> {
    let _ = env_logger::builder().is_test(true).try_init();
    Box::leak(Box::new(Kernel::new(TestPort::default(), config).unwrap()))
}

/// Serialize tests that share global state.
pub(crate) fn serialize() -> MutexGuard<'static, ()> {
    static LOCK: Mutex<()> = Mutex::new(());
    LOCK.lock().unwrap_or_else(|e| e.into_inner())
}

/// Create a kernel state whose running task is the idle task.
pub(crate) fn test_core() -> KernelCore<TestPort> {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut core = KernelCore::new(&KernelConfig::new());
    let idle = core
        .tasks
        .insert(TaskCb::idle(Box::new(TestPort::default().adopt_context())))
        .ok()
        .unwrap();
    core.idle = Some(idle);
    core.current = Some(idle);
    core
}

/// Add a Ready task to `core`.
pub(crate) fn add_task(core: &mut KernelCore<TestPort>, priority: u8) -> TaskId {
    let port = TestPort::default();
    let mut stack = [0u8; 8];
    let context = Box::new(port.init_context(&mut stack, |_| {}, 0));
    let mut cb = TaskCb::new(
        TaskName::from("test").unwrap(),
        priority,
        None,
        0,
        context,
        Box::default(),
        false,
    );
    cb.st = TaskState::empty();
    let task = core.tasks.insert(cb).ok().unwrap();
    core.make_ready(task, false);
    task
}
