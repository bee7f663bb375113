//! Deleting tasks in every state, and suspension.
use once_cell::sync::OnceCell;
use std::{
    thread,
    time::{Duration, Instant},
};
use wheel_kernel::{KernelConfig, KernelError, MutexId, SemaphoreId, TaskState};

use crate::{boot, tick, Log, System, STACK_SIZE};

struct Objects {
    mutex: MutexId,
    never: SemaphoreId,
}

static OBJECTS: OnceCell<Objects> = OnceCell::new();
static OWNER_LOG: Log<&'static str> = Log::new();

fn owner_body(kernel: &'static System, _: usize) {
    let objects = OBJECTS.get().unwrap();
    kernel.mutex_lock(objects.mutex).unwrap();
    let _ = kernel.sem_wait(objects.never);
    OWNER_LOG.push("owner woke up");
}

fn waiter_body(kernel: &'static System, _: usize) {
    let objects = OBJECTS.get().unwrap();
    kernel.mutex_lock(objects.mutex).unwrap();
    OWNER_LOG.push("waiter got it");
    kernel.mutex_unlock(objects.mutex).unwrap();
}

#[test]
fn deleting_an_owner_releases_its_mutexes() {
    let kernel = boot(KernelConfig::new(), |kernel| {
        let objects = Objects {
            mutex: kernel.mutex_init()?,
            never: kernel.sem_init(0)?,
        };
        assert!(OBJECTS.set(objects).is_ok());
        Ok(())
    });
    let objects = OBJECTS.get().unwrap();

    let owner = kernel.task_spawn("owner", 6, STACK_SIZE, owner_body, 0).unwrap();
    kernel.task_spawn("waiter", 4, STACK_SIZE, waiter_body, 0).unwrap();
    assert_eq!(kernel.task_state(owner), Ok(TaskState::PEND));
    assert_eq!(kernel.task_prio_get(owner), Ok(4));

    kernel.task_delete(owner).unwrap();
    assert_eq!(OWNER_LOG.get(), ["waiter got it"]);
    assert_eq!(kernel.task_state(owner), Err(KernelError::InvalidArgument));
    assert_eq!(kernel.mutex_info(objects.mutex).unwrap().owner, None);
    assert_eq!(kernel.sem_count(objects.never), Ok(0));
}

static SELF_LOG: Log<&'static str> = Log::new();

fn self_deleting_body(kernel: &'static System, _: usize) {
    SELF_LOG.push("before");
    let me = kernel.current_task().unwrap();
    let _ = kernel.task_delete(me);
    SELF_LOG.push("after");
}

#[test]
fn self_deletion_never_returns() {
    let kernel = boot(KernelConfig::new().with_max_tasks(1), |kernel| {
        kernel.task_spawn("doomed", 5, STACK_SIZE, self_deleting_body, 0)?;
        Ok(())
    });
    assert_eq!(SELF_LOG.get(), ["before"]);

    // The slot was released
    let mut tasks = Vec::new();
    kernel.task_list(&mut tasks).unwrap();
    assert!(tasks.iter().all(|info| info.name.as_str() != "doomed"));
    kernel
        .task_create("next", 5, STACK_SIZE, self_deleting_body, 0)
        .unwrap();
}

static UNSTARTED_LOG: Log<&'static str> = Log::new();

fn never_body(_: &'static System, _: usize) {
    UNSTARTED_LOG.push("ran");
}

#[test]
fn deleting_a_suspended_task() {
    let kernel = boot(KernelConfig::new(), |_| Ok(()));
    let task = kernel.task_create("never", 5, STACK_SIZE, never_body, 0).unwrap();
    assert_eq!(kernel.task_state(task), Ok(TaskState::SUSPEND));

    kernel.task_delete(task).unwrap();
    assert!(UNSTARTED_LOG.get().is_empty());
    assert_eq!(kernel.task_state(task), Err(KernelError::InvalidArgument));
    assert_eq!(kernel.task_delete(task), Err(KernelError::InvalidArgument));
}

static NAP_LOG: Log<u64> = Log::new();

fn napper_body(kernel: &'static System, _: usize) {
    kernel.task_delay(2).unwrap();
    NAP_LOG.push(kernel.tick_count().unwrap());
}

#[test]
fn suspension_outlasts_a_delay() {
    let kernel = boot(KernelConfig::new(), |_| Ok(()));
    let task = kernel.task_spawn("napper", 5, STACK_SIZE, napper_body, 0).unwrap();

    kernel.task_suspend(task).unwrap();
    assert_eq!(
        kernel.task_state(task),
        Ok(TaskState::DELAY | TaskState::SUSPEND)
    );

    for _ in 0..4 {
        tick(kernel);
    }
    assert!(NAP_LOG.get().is_empty());
    assert_eq!(kernel.task_state(task), Ok(TaskState::SUSPEND));

    kernel.task_resume(task).unwrap();
    assert_eq!(NAP_LOG.get(), [4]);
}

fn short_body(_: &'static System, _: usize) {}

fn blocked_body(kernel: &'static System, sem: usize) {
    let sem = SemaphoreId::from_raw(sem).unwrap();
    let _ = kernel.sem_wait(sem);
}

#[test]
fn reaped_tasks_release_their_threads() {
    let kernel = boot(KernelConfig::new(), |_| Ok(()));
    let sem = kernel.sem_init(0).unwrap();

    for _ in 0..3 {
        kernel.task_spawn("short", 5, STACK_SIZE, short_body, 0).unwrap();
    }
    let blocked: Vec<_> = (0..3)
        .map(|_| {
            kernel
                .task_spawn("blocked", 5, STACK_SIZE, blocked_body, sem.into_raw())
                .unwrap()
        })
        .collect();
    for task in blocked {
        kernel.task_delete(task).unwrap();
    }

    // Only the deferred-work worker's thread remains
    let deadline = Instant::now() + Duration::from_secs(10);
    while kernel.port().task_threads() > 1 {
        assert!(Instant::now() < deadline, "task threads were leaked");
        thread::sleep(Duration::from_millis(1));
    }
    assert_eq!(kernel.port().task_threads(), 1);
}

fn idle_work(_: &System, _: usize) {}

fn crowding_body(kernel: &'static System, _: usize) {
    // Keep the worker from draining the least urgent level before exiting
    kernel.task_lock().unwrap();
    kernel.defer_submit(idle_work, 0, 31).unwrap();
    assert_eq!(
        kernel.defer_submit(idle_work, 0, 31),
        Err(KernelError::QueueFull)
    );
}

#[test]
fn exit_is_reaped_with_a_full_deferred_level() {
    let kernel = boot(
        KernelConfig::new().with_max_tasks(1).with_deferred_queue_depth(1),
        |_| Ok(()),
    );
    let task = kernel.task_spawn("crowding", 5, STACK_SIZE, crowding_body, 0).unwrap();

    assert_eq!(kernel.task_state(task), Err(KernelError::InvalidArgument));
    kernel.task_create("next", 5, STACK_SIZE, short_body, 0).unwrap();
}
