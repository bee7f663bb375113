//! Deferred work submitted from interrupt handlers and tasks.
use wheel_kernel::{KernelConfig, KernelError};

use crate::{boot, Log, System};

static DEFER_LOG: Log<(char, String)> = Log::new();

fn record(kernel: &System, name: usize) {
    let me = kernel.current_task().unwrap();
    let runner = kernel.task_info(me).unwrap().name;
    DEFER_LOG.push((name as u8 as char, runner.to_string()));
}

#[test]
fn runs_on_the_worker_after_the_handler() {
    let kernel = boot(KernelConfig::new(), |_| Ok(()));

    kernel.port().interrupt(|| {
        kernel.defer_submit(record, 'x' as usize, 5).unwrap();
        kernel.defer_submit(record, 'y' as usize, 1).unwrap();
        kernel.defer_submit(record, 'z' as usize, 5).unwrap();
        assert_eq!(
            kernel.defer_submit(record, '!' as usize, 32),
            Err(KernelError::InvalidArgument)
        );
        // Nothing runs until the handler returns
        assert!(DEFER_LOG.get().is_empty());
    });

    // The first submission woke the worker with level 5 alone. Level 1 is
    // picked up by its next wait.
    let log = DEFER_LOG.get();
    let order: String = log.iter().map(|(name, _)| name).collect();
    assert_eq!(order, "xzy");
    assert!(log.iter().all(|(_, runner)| runner == "defer"));

    // Submitting from a task wakes the worker right away
    kernel.defer_submit(record, 'w' as usize, 31).unwrap();
    assert_eq!(DEFER_LOG.get().len(), 4);
}

static BATCH_LOG: Log<char> = Log::new();

fn record_batch(_: &System, name: usize) {
    BATCH_LOG.push(name as u8 as char);
}

fn submit_batch(kernel: &System, _: usize) {
    kernel.defer_submit(record_batch, 'x' as usize, 5).unwrap();
    kernel.defer_submit(record_batch, 'y' as usize, 1).unwrap();
    kernel.defer_submit(record_batch, 'z' as usize, 5).unwrap();
    BATCH_LOG.push('-');
}

#[test]
fn pending_levels_run_by_urgency() {
    let kernel = boot(KernelConfig::new(), |_| Ok(()));

    // Submitted while the worker is busy, so all three levels are pending
    // when it waits again
    kernel.defer_submit(submit_batch, 0, 31).unwrap();
    assert_eq!(BATCH_LOG.get(), ['-', 'y', 'x', 'z']);
}

fn noop(_: &System, _: usize) {}

#[test]
fn full_level_rejects_work() {
    let kernel = boot(KernelConfig::new().with_deferred_queue_depth(2), |_| Ok(()));

    kernel.port().interrupt(|| {
        kernel.defer_submit(noop, 0, 7).unwrap();
        kernel.defer_submit(noop, 0, 7).unwrap();
        assert_eq!(kernel.defer_submit(noop, 0, 7), Err(KernelError::QueueFull));
        // Other levels are independent
        kernel.defer_submit(noop, 0, 8).unwrap();
    });

    // Drained once the handler returned
    kernel.port().interrupt(|| {
        kernel.defer_submit(noop, 0, 7).unwrap();
    });
}
