//! Preemption, round-robin, delays, and the scheduler lock.
use quickcheck::{QuickCheck, TestResult};
use wheel_kernel::{KernelConfig, KernelError, SemaphoreId};

use crate::{boot, tick, Log, System, STACK_SIZE};

static RR_LOG: Log<u8> = Log::new();

fn rr_body(kernel: &'static System, name: usize) {
    for _ in 0..4 {
        RR_LOG.push(name as u8);
        tick(kernel);
    }
}

#[test]
fn round_robin_rotates_equal_priorities() {
    let kernel = boot(KernelConfig::new().with_round_robin_slices(2), |kernel| {
        kernel.task_spawn("a", 5, STACK_SIZE, rr_body, b'A' as usize)?;
        kernel.task_spawn("b", 5, STACK_SIZE, rr_body, b'B' as usize)?;
        Ok(())
    });

    assert_eq!(RR_LOG.get(), b"AABBAABB");
    assert_eq!(kernel.tick_count(), Ok(8));
}

static LOCK_LOG: Log<&'static str> = Log::new();

fn urgent_body(kernel: &'static System, sem: usize) {
    let sem = SemaphoreId::from_raw(sem).unwrap();
    kernel.sem_wait(sem).unwrap();
    LOCK_LOG.push("urgent");
}

fn locker_body(kernel: &'static System, sem: usize) {
    let sem = SemaphoreId::from_raw(sem).unwrap();
    kernel.task_lock().unwrap();
    kernel.sem_post(sem).unwrap();
    LOCK_LOG.push("still running");
    assert_eq!(kernel.sem_timedwait(sem, 5), Err(KernelError::BadContext));
    assert_eq!(kernel.task_delay(1), Err(KernelError::BadContext));
    kernel.task_unlock().unwrap();
    LOCK_LOG.push("resumed");
}

#[test]
fn task_lock_defers_preemption() {
    boot(KernelConfig::new(), |kernel| {
        let sem = kernel.sem_init(0)?;
        kernel.task_spawn("urgent", 2, STACK_SIZE, urgent_body, sem.into_raw())?;
        kernel.task_spawn("locker", 10, STACK_SIZE, locker_body, sem.into_raw())?;
        Ok(())
    });

    assert_eq!(LOCK_LOG.get(), ["still running", "urgent", "resumed"]);
}

static DELAY_LOG: Log<(usize, u64)> = Log::new();

fn sleeper_body(kernel: &'static System, ticks: usize) {
    kernel.task_delay(ticks as u32).unwrap();
    DELAY_LOG.push((ticks, kernel.tick_count().unwrap()));
}

#[test]
fn delays_expire_in_order() {
    let kernel = boot(KernelConfig::new(), |kernel| {
        kernel.task_spawn("three", 4, STACK_SIZE, sleeper_body, 3)?;
        kernel.task_spawn("one", 5, STACK_SIZE, sleeper_body, 1)?;
        kernel.task_spawn("two", 6, STACK_SIZE, sleeper_body, 2)?;
        Ok(())
    });

    for _ in 0..5 {
        tick(kernel);
    }
    assert_eq!(DELAY_LOG.get(), [(1, 1), (2, 2), (3, 3)]);
}

static SHUFFLE_LOG: Log<(usize, u64)> = Log::new();

/// `arg` packs the spawn index and the delay.
fn shuffled_sleeper_body(kernel: &'static System, arg: usize) {
    let (index, ticks) = (arg >> 8, arg & 0xff);
    kernel.task_delay(ticks as u32).unwrap();
    SHUFFLE_LOG.push((index, kernel.tick_count().unwrap()));
}

#[test]
fn delays_wake_sorted_and_stable() {
    fn prop(delays: Vec<u8>) -> TestResult {
        let delays: Vec<u64> = delays.iter().take(6).map(|&d| u64::from(d % 20) + 1).collect();
        if delays.is_empty() {
            return TestResult::discard();
        }

        SHUFFLE_LOG.clear();
        let kernel = boot(KernelConfig::new(), |kernel| {
            for (index, &ticks) in delays.iter().enumerate() {
                let arg = (index << 8) | ticks as usize;
                kernel.task_spawn("sleeper", 5, STACK_SIZE, shuffled_sleeper_body, arg)?;
            }
            Ok(())
        });

        for _ in 0..=20 {
            tick(kernel);
        }

        let mut expected: Vec<(usize, u64)> = delays.iter().copied().enumerate().collect();
        // Stable, so equal delays keep the spawn order
        expected.sort_by_key(|&(_, ticks)| ticks);
        TestResult::from_bool(SHUFFLE_LOG.get() == expected)
    }

    QuickCheck::new()
        .tests(16)
        .quickcheck(prop as fn(Vec<u8>) -> TestResult);
}

#[test]
fn idle_cannot_wait() {
    let kernel = boot(KernelConfig::new(), |_| Ok(()));

    let sem = kernel.sem_init(0).unwrap();
    assert_eq!(kernel.sem_wait(sem), Err(KernelError::BadContext));
    assert_eq!(kernel.task_delay(1), Err(KernelError::BadContext));
    assert_eq!(kernel.sem_trywait(sem), Err(KernelError::WouldBlock));

    // Polling calls work, though
    kernel.sem_post(sem).unwrap();
    assert_eq!(kernel.sem_trywait(sem), Ok(()));
    assert_eq!(kernel.start(), Err(KernelError::BadContext));
}
