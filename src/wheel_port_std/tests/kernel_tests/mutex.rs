//! Priority inheritance observed from running tasks.
use once_cell::sync::OnceCell;
use wheel_kernel::{KernelConfig, KernelError, MutexId, SemaphoreId};

use crate::{boot, tick, Log, System, STACK_SIZE};

static PI_LOG: Log<String> = Log::new();

fn pi_high_body(kernel: &'static System, mutex: usize) {
    let mutex = MutexId::from_raw(mutex).unwrap();
    PI_LOG.push("H waits".to_owned());
    kernel.mutex_lock(mutex).unwrap();
    PI_LOG.push("H locked".to_owned());
    kernel.mutex_unlock(mutex).unwrap();
}

fn pi_low_body(kernel: &'static System, mutex: usize) {
    let me = kernel.current_task().unwrap();
    let mutex = MutexId::from_raw(mutex).unwrap();

    kernel.mutex_lock(mutex).unwrap();
    PI_LOG.push("L locked".to_owned());
    kernel
        .task_spawn("high", 2, STACK_SIZE, pi_high_body, mutex.into_raw())
        .unwrap();
    PI_LOG.push(format!("L at {}", kernel.task_prio_get(me).unwrap()));
    kernel.mutex_unlock(mutex).unwrap();
    PI_LOG.push(format!("L at {}", kernel.task_prio_get(me).unwrap()));
}

#[test]
fn owner_inherits_waiter_priority() {
    boot(KernelConfig::new(), |kernel| {
        let mutex = kernel.mutex_init()?;
        kernel.task_spawn("low", 10, STACK_SIZE, pi_low_body, mutex.into_raw())?;
        Ok(())
    });

    assert_eq!(
        PI_LOG.get(),
        ["L locked", "H waits", "L at 2", "H locked", "L at 10"]
    );
}

struct Chain {
    m1: MutexId,
    m2: MutexId,
    release: SemaphoreId,
}

static CHAIN: OnceCell<Chain> = OnceCell::new();
static CHAIN_LOG: Log<String> = Log::new();

fn chain_l1_body(kernel: &'static System, _: usize) {
    let chain = CHAIN.get().unwrap();
    let me = kernel.current_task().unwrap();
    kernel.mutex_lock(chain.m1).unwrap();
    kernel.sem_wait(chain.release).unwrap();
    kernel.mutex_unlock(chain.m1).unwrap();
    CHAIN_LOG.push(format!("L1 at {}", kernel.task_prio_get(me).unwrap()));
}

fn chain_l2_body(kernel: &'static System, _: usize) {
    let chain = CHAIN.get().unwrap();
    let me = kernel.current_task().unwrap();
    kernel.mutex_lock(chain.m2).unwrap();
    kernel.mutex_lock(chain.m1).unwrap();
    CHAIN_LOG.push("L2 got M1".to_owned());
    kernel.mutex_unlock(chain.m1).unwrap();
    kernel.mutex_unlock(chain.m2).unwrap();
    CHAIN_LOG.push(format!("L2 at {}", kernel.task_prio_get(me).unwrap()));
}

fn chain_h_body(kernel: &'static System, _: usize) {
    let chain = CHAIN.get().unwrap();
    kernel.mutex_lock(chain.m2).unwrap();
    CHAIN_LOG.push("H got M2".to_owned());
    kernel.mutex_unlock(chain.m2).unwrap();
}

#[test]
fn inheritance_follows_the_wait_chain() {
    let kernel = boot(KernelConfig::new(), |kernel| {
        let chain = Chain {
            m1: kernel.mutex_init()?,
            m2: kernel.mutex_init()?,
            release: kernel.sem_init(0)?,
        };
        assert!(CHAIN.set(chain).is_ok());
        Ok(())
    });
    let chain = CHAIN.get().unwrap();

    // Each task runs until it blocks
    let l1 = kernel.task_spawn("l1", 20, STACK_SIZE, chain_l1_body, 0).unwrap();
    let l2 = kernel.task_spawn("l2", 15, STACK_SIZE, chain_l2_body, 0).unwrap();
    assert_eq!(kernel.task_prio_get(l1), Ok(15));

    kernel.task_spawn("h", 3, STACK_SIZE, chain_h_body, 0).unwrap();
    assert_eq!(kernel.task_prio_get(l2), Ok(3));
    assert_eq!(kernel.task_prio_get(l1), Ok(3));
    assert_eq!(kernel.mutex_info(chain.m1).unwrap().ceiling, Some(3));

    kernel.sem_post(chain.release).unwrap();
    assert_eq!(
        CHAIN_LOG.get(),
        ["L2 got M1", "H got M2", "L2 at 15", "L1 at 20"]
    );
}

static TIMEOUT_LOG: Log<Result<(), KernelError>> = Log::new();

fn holder_body(kernel: &'static System, mutex: usize) {
    let mutex = MutexId::from_raw(mutex).unwrap();
    kernel.mutex_lock(mutex).unwrap();
    kernel.task_delay(10).unwrap();
    kernel.mutex_unlock(mutex).unwrap();
}

fn impatient_body(kernel: &'static System, mutex: usize) {
    let mutex = MutexId::from_raw(mutex).unwrap();
    TIMEOUT_LOG.push(kernel.mutex_timedlock(mutex, 3));
}

#[test]
fn timed_out_waiter_withdraws_its_boost() {
    let kernel = boot(KernelConfig::new(), |_| Ok(()));
    let mutex = kernel.mutex_init().unwrap();

    let holder = kernel
        .task_spawn("holder", 6, STACK_SIZE, holder_body, mutex.into_raw())
        .unwrap();
    kernel
        .task_spawn("impatient", 3, STACK_SIZE, impatient_body, mutex.into_raw())
        .unwrap();
    assert_eq!(kernel.task_prio_get(holder), Ok(3));
    assert_eq!(kernel.mutex_info(mutex).unwrap().waiters, 1);

    for _ in 0..3 {
        tick(kernel);
    }
    assert_eq!(TIMEOUT_LOG.get(), [Err(KernelError::Timeout)]);
    assert_eq!(kernel.task_prio_get(holder), Ok(6));

    let info = kernel.mutex_info(mutex).unwrap();
    assert_eq!((info.owner, info.waiters, info.ceiling), (Some(holder), 0, None));

    for _ in 0..7 {
        tick(kernel);
    }
    assert_eq!(kernel.mutex_info(mutex).unwrap().owner, None);
}

static IDLE_LOG: Log<String> = Log::new();

fn idle_rival_body(kernel: &'static System, mutex: usize) {
    let mutex = MutexId::from_raw(mutex).unwrap();
    IDLE_LOG.push("H waits".to_owned());
    kernel.mutex_lock(mutex).unwrap();
    IDLE_LOG.push("H locked".to_owned());
    kernel.mutex_unlock(mutex).unwrap();
}

fn idle_bystander_body(_: &'static System, _: usize) {
    IDLE_LOG.push("M ran".to_owned());
}

#[test]
fn boosted_idle_task_is_not_preempted() {
    let kernel = boot(KernelConfig::new(), |_| Ok(()));
    let mutex = kernel.mutex_init().unwrap();
    let idle = kernel.current_task().unwrap();

    kernel.mutex_trylock(mutex).unwrap();
    kernel
        .task_spawn("high", 2, STACK_SIZE, idle_rival_body, mutex.into_raw())
        .unwrap();
    assert_eq!(kernel.task_prio_get(idle), Ok(2));

    kernel
        .task_spawn("mid", 10, STACK_SIZE, idle_bystander_body, 0)
        .unwrap();
    IDLE_LOG.push("idle unlocks".to_owned());
    kernel.mutex_unlock(mutex).unwrap();

    assert_eq!(
        IDLE_LOG.get(),
        ["H waits", "idle unlocks", "H locked", "M ran"]
    );
    assert_eq!(kernel.task_prio_get(idle), Ok(31));
}
