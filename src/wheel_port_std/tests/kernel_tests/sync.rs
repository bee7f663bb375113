//! Semaphores and event flags shared between tasks.
use once_cell::sync::OnceCell;
use wheel_kernel::{EventId, EventMode, KernelConfig, KernelError, SemaphoreId, WAIT_FOREVER};

use crate::{boot, tick, Log, System, STACK_SIZE};

static SEM_LOG: Log<&'static str> = Log::new();

static SEM: OnceCell<SemaphoreId> = OnceCell::new();

fn sem_waiter_body(kernel: &'static System, name: usize) {
    kernel.sem_wait(*SEM.get().unwrap()).unwrap();
    SEM_LOG.push(["a", "b", "c"][name]);
}

#[test]
fn semaphore_serves_waiters_in_arrival_order() {
    let kernel = boot(KernelConfig::new(), |_| Ok(()));
    let sem = *SEM.get_or_init(|| kernel.sem_init(0).unwrap());

    // Arrival order differs from priority order
    kernel.task_spawn("a", 5, STACK_SIZE, sem_waiter_body, 0).unwrap();
    kernel.task_spawn("b", 3, STACK_SIZE, sem_waiter_body, 1).unwrap();
    kernel.task_spawn("c", 4, STACK_SIZE, sem_waiter_body, 2).unwrap();

    for expected in [&["a"][..], &["a", "b"], &["a", "b", "c"]] {
        kernel.sem_post(sem).unwrap();
        assert_eq!(SEM_LOG.get(), expected);
    }
    assert_eq!(kernel.sem_count(sem), Ok(0));

    kernel.sem_post(sem).unwrap();
    assert_eq!(kernel.sem_count(sem), Ok(1));
}

static TIMED_LOG: Log<Result<(), KernelError>> = Log::new();

fn timed_waiter_body(kernel: &'static System, sem: usize) {
    let sem = SemaphoreId::from_raw(sem).unwrap();
    TIMED_LOG.push(kernel.sem_timedwait(sem, 2));
    TIMED_LOG.push(kernel.sem_timedwait(sem, 2));
}

#[test]
fn semaphore_wait_times_out() {
    let kernel = boot(KernelConfig::new(), |_| Ok(()));
    let sem = kernel.sem_init(0).unwrap();
    kernel
        .task_spawn("waiter", 5, STACK_SIZE, timed_waiter_body, sem.into_raw())
        .unwrap();

    tick(kernel);
    assert!(TIMED_LOG.get().is_empty());
    tick(kernel);
    assert_eq!(TIMED_LOG.get(), [Err(KernelError::Timeout)]);

    kernel.sem_post(sem).unwrap();
    assert_eq!(TIMED_LOG.get(), [Err(KernelError::Timeout), Ok(())]);
}

static EVENT_LOG: Log<Result<u32, KernelError>> = Log::new();

fn all_waiter_body(kernel: &'static System, event: usize) {
    let event = EventId::from_raw(event).unwrap();
    EVENT_LOG.push(kernel.event_recv(event, 0b011, EventMode::All, WAIT_FOREVER));
}

fn any_waiter_body(kernel: &'static System, event: usize) {
    let event = EventId::from_raw(event).unwrap();
    EVENT_LOG.push(kernel.event_recv(event, 0b1000, EventMode::Any, 2));
}

#[test]
fn event_flags_wake_matching_waiters() {
    let kernel = boot(KernelConfig::new(), |_| Ok(()));
    let event = kernel.event_create().unwrap();
    kernel
        .task_spawn("all", 3, STACK_SIZE, all_waiter_body, event.into_raw())
        .unwrap();

    kernel.event_send(event, 0b001).unwrap();
    assert!(EVENT_LOG.get().is_empty());
    assert_eq!(kernel.event_flags(event), Ok(0b001));

    kernel.event_send(event, 0b110).unwrap();
    assert_eq!(EVENT_LOG.get(), [Ok(0b011)]);
    // Only the received bits are consumed
    assert_eq!(kernel.event_flags(event), Ok(0b100));

    kernel
        .task_spawn("any", 3, STACK_SIZE, any_waiter_body, event.into_raw())
        .unwrap();
    tick(kernel);
    tick(kernel);
    assert_eq!(EVENT_LOG.get(), [Ok(0b011), Err(KernelError::Timeout)]);
}
