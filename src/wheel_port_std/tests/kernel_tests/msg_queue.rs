//! Message queues between a task and the idle task.
use wheel_kernel::{KernelConfig, KernelError, MsgQueueId};

use crate::{boot, Log, System, STACK_SIZE};

static MQ_LOG: Log<String> = Log::new();

fn sender_body(kernel: &'static System, mq: usize) {
    let mq = MsgQueueId::from_raw(mq).unwrap();
    for (i, msg) in [&b"m1"[..], b"m2", b"m3"].iter().enumerate() {
        kernel.mq_send(mq, msg).unwrap();
        MQ_LOG.push(format!("sent {}", i + 1));
    }
}

#[test]
fn sender_blocks_while_full() {
    let kernel = boot(KernelConfig::new(), |_| Ok(()));
    let mq = kernel.mq_create(4, 2).unwrap();
    kernel
        .task_spawn("sender", 3, STACK_SIZE, sender_body, mq.into_raw())
        .unwrap();

    assert_eq!(MQ_LOG.get(), ["sent 1", "sent 2"]);
    assert_eq!(kernel.mq_len(mq), Ok(2));

    let mut buf = [0; 8];
    let len = kernel.mq_recv(mq, &mut buf).unwrap();
    assert_eq!(&buf[..len], b"m1");
    // Freeing a slot let the sender finish
    assert_eq!(MQ_LOG.get(), ["sent 1", "sent 2", "sent 3"]);

    for expected in [b"m2", b"m3"] {
        let len = kernel.mq_recv(mq, &mut buf).unwrap();
        assert_eq!(&buf[..len], expected);
    }
    assert_eq!(kernel.mq_timedrecv(mq, &mut buf, 0), Err(KernelError::WouldBlock));
    assert_eq!(kernel.mq_len(mq), Ok(0));
}

static RECV_LOG: Log<Result<Vec<u8>, KernelError>> = Log::new();

fn receiver_body(kernel: &'static System, mq: usize) {
    let mq = MsgQueueId::from_raw(mq).unwrap();
    let mut buf = [0; 3];
    for _ in 0..2 {
        let result = kernel.mq_recv(mq, &mut buf).map(|len| buf[..len].to_vec());
        RECV_LOG.push(result);
    }
}

#[test]
fn receiver_wakes_on_send() {
    let kernel = boot(KernelConfig::new(), |_| Ok(()));
    let mq = kernel.mq_create(8, 1).unwrap();
    kernel
        .task_spawn("receiver", 3, STACK_SIZE, receiver_body, mq.into_raw())
        .unwrap();
    assert!(RECV_LOG.get().is_empty());

    assert_eq!(kernel.mq_send(mq, b"hello"), Ok(5));
    // Truncated to the receive buffer
    assert_eq!(RECV_LOG.get(), [Ok(b"hel".to_vec())]);

    assert_eq!(kernel.mq_send(mq, b"!"), Ok(1));
    assert_eq!(RECV_LOG.get(), [Ok(b"hel".to_vec()), Ok(b"!".to_vec())]);
}
