//! Software timers and raw tick callbacks driving tasks.
use wheel_kernel::{KernelConfig, KernelError, SemaphoreId, TimerMode};

use crate::{boot, tick, Log, System, STACK_SIZE};

fn post(kernel: &System, sem: usize) {
    let sem = SemaphoreId::from_raw(sem).unwrap();
    // Runs in the critical section, so this is queued
    kernel.sem_post(sem).unwrap();
}

static PERIODIC_LOG: Log<u64> = Log::new();

fn periodic_body(kernel: &'static System, sem: usize) {
    let sem = SemaphoreId::from_raw(sem).unwrap();
    for _ in 0..3 {
        kernel.sem_wait(sem).unwrap();
        PERIODIC_LOG.push(kernel.tick_count().unwrap());
    }
}

#[test]
fn repeating_timer_paces_a_task() {
    let kernel = boot(KernelConfig::new(), |_| Ok(()));
    let sem = kernel.sem_init(0).unwrap();
    let timer = kernel
        .timer_create(TimerMode::Repeating, 2, post, sem.into_raw())
        .unwrap();
    kernel
        .task_spawn("periodic", 3, STACK_SIZE, periodic_body, sem.into_raw())
        .unwrap();

    kernel.timer_start(timer).unwrap();
    for _ in 0..6 {
        tick(kernel);
    }
    assert_eq!(PERIODIC_LOG.get(), [2, 4, 6]);
    assert_eq!(kernel.timer_remaining(timer), Ok(Some(2)));

    kernel.timer_stop(timer).unwrap();
    assert_eq!(kernel.timer_is_active(timer), Ok(false));
    tick(kernel);
    tick(kernel);
    assert_eq!(kernel.sem_count(sem), Ok(0));
}

#[test]
fn one_shot_timer_fires_once() {
    let kernel = boot(KernelConfig::new(), |_| Ok(()));
    let sem = kernel.sem_init(0).unwrap();
    let timer = kernel
        .timer_create(TimerMode::OneShot, 3, post, sem.into_raw())
        .unwrap();

    kernel.timer_start(timer).unwrap();
    tick(kernel);
    assert_eq!(kernel.timer_remaining(timer), Ok(Some(2)));
    // Restarting re-arms for the full interval
    kernel.timer_start(timer).unwrap();
    for _ in 0..2 {
        tick(kernel);
    }
    assert_eq!(kernel.sem_count(sem), Ok(0));

    for _ in 0..5 {
        tick(kernel);
    }
    assert_eq!(kernel.sem_count(sem), Ok(1));
    assert_eq!(kernel.timer_is_active(timer), Ok(false));

    kernel.timer_delete(timer).unwrap();
    assert_eq!(kernel.timer_start(timer), Err(KernelError::InvalidArgument));
}

#[test]
fn raw_tick_callback() {
    let kernel = boot(KernelConfig::new(), |_| Ok(()));
    let sem = kernel.sem_init(0).unwrap();

    let fired = kernel.tick_arm(2, post, sem.into_raw()).unwrap();
    let cancelled = kernel.tick_arm(2, post, sem.into_raw()).unwrap();
    kernel.tick_cancel(cancelled).unwrap();

    for _ in 0..3 {
        tick(kernel);
    }
    assert_eq!(kernel.sem_count(sem), Ok(1));
    assert_eq!(kernel.tick_cancel(fired), Err(KernelError::InvalidArgument));
}
