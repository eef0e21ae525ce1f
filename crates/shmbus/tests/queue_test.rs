use shmbus::{OpenMode, SharedCircularQueue};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

static TEST_ID: AtomicUsize = AtomicUsize::new(0);

fn unique_name(tag: &str) -> String {
    format!(
        "/shmbus_queue_it_{tag}_{}_{}",
        std::process::id(),
        TEST_ID.fetch_add(1, Ordering::SeqCst)
    )
}

/// The literal capacity-two scenario: a full ring refuses `try_write` until
/// one element is drained, and order is preserved throughout.
#[test]
fn test_fifo_with_capacity_two() {
    let name = unique_name("fifo2");
    let queue = SharedCircularQueue::create(&name, 8, 2, OpenMode::ReadWrite).unwrap();

    assert!(queue.try_write(b"1").unwrap());
    assert!(queue.try_write(b"22").unwrap());
    assert!(
        !queue.try_write(b"333").unwrap(),
        "a full ring must refuse the third element"
    );
    assert!(queue.is_full());
    assert_eq!(queue.len(), 2);

    assert_eq!(queue.try_read().unwrap().unwrap(), b"1");
    assert!(queue.try_write(b"333").unwrap(), "one free slot again");

    assert_eq!(queue.try_read().unwrap().unwrap(), b"22");
    assert_eq!(queue.try_read().unwrap().unwrap(), b"333");
    assert!(queue.try_read().unwrap().is_none(), "ring is drained");

    SharedCircularQueue::unlink(&name).unwrap();
}

/// Four producers, four consumers. Nothing is lost, nothing is duplicated,
/// and each producer's messages appear in their original order within every
/// consumer's stream.
#[test]
fn test_mpmc_preserves_per_producer_order() {
    const PRODUCERS: u64 = 4;
    const CONSUMERS: usize = 4;
    const MESSAGES_PER_PRODUCER: u64 = 1000;

    let name = unique_name("mpmc");
    let root = SharedCircularQueue::create(&name, 16, 64, OpenMode::ReadWrite).unwrap();

    let producers: Vec<_> = (0..PRODUCERS)
        .map(|producer_id| {
            let queue = SharedCircularQueue::open(&name, OpenMode::WriteOnly).unwrap();
            thread::spawn(move || {
                for seq in 0..MESSAGES_PER_PRODUCER {
                    let mut message = [0u8; 16];
                    message[..8].copy_from_slice(&producer_id.to_le_bytes());
                    message[8..].copy_from_slice(&seq.to_le_bytes());
                    assert!(
                        queue.blocking_write(&message).unwrap(),
                        "queue closed while producing"
                    );
                }
            })
        })
        .collect();

    let consumers: Vec<_> = (0..CONSUMERS)
        .map(|_| {
            let queue = SharedCircularQueue::open(&name, OpenMode::ReadOnly).unwrap();
            thread::spawn(move || {
                let mut seen: Vec<(u64, u64)> = Vec::new();
                while let Some(message) = queue.blocking_read().unwrap() {
                    assert_eq!(message.len(), 16);
                    let mut producer_id = [0u8; 8];
                    let mut seq = [0u8; 8];
                    producer_id.copy_from_slice(&message[..8]);
                    seq.copy_from_slice(&message[8..]);
                    seen.push((u64::from_le_bytes(producer_id), u64::from_le_bytes(seq)));
                }
                seen
            })
        })
        .collect();

    for producer in producers {
        producer.join().unwrap();
    }
    // Everything is enqueued; close so the consumers drain and stop.
    root.close().unwrap();

    let mut totals: HashMap<u64, u64> = HashMap::new();
    for consumer in consumers {
        let seen = consumer.join().unwrap();
        // Within one consumer, each producer's subsequence must be ordered.
        let mut last_seq: HashMap<u64, u64> = HashMap::new();
        for (producer_id, seq) in seen {
            if let Some(previous) = last_seq.insert(producer_id, seq) {
                assert!(
                    previous < seq,
                    "producer {producer_id} out of order: {previous} before {seq}"
                );
            }
            *totals.entry(producer_id).or_default() += 1;
        }
    }

    assert_eq!(totals.len() as u64, PRODUCERS, "every producer was seen");
    for (producer_id, count) in totals {
        assert_eq!(
            count, MESSAGES_PER_PRODUCER,
            "producer {producer_id} lost or duplicated messages"
        );
    }

    SharedCircularQueue::unlink(&name).unwrap();
}

#[test]
fn test_blocking_read_wakes_on_write() {
    let name = unique_name("read_wake");
    let queue = SharedCircularQueue::create(&name, 8, 4, OpenMode::ReadWrite).unwrap();

    let consumer = {
        let queue = SharedCircularQueue::open(&name, OpenMode::ReadOnly).unwrap();
        thread::spawn(move || queue.blocking_read().unwrap())
    };

    thread::sleep(Duration::from_millis(30));
    assert!(queue.try_write(b"wake").unwrap());

    assert_eq!(consumer.join().unwrap().unwrap(), b"wake");
    SharedCircularQueue::unlink(&name).unwrap();
}

#[test]
fn test_blocking_write_wakes_on_read() {
    let name = unique_name("write_wake");
    let queue = SharedCircularQueue::create(&name, 8, 2, OpenMode::ReadWrite).unwrap();

    assert!(queue.try_write(b"a").unwrap());
    assert!(queue.try_write(b"b").unwrap());

    let producer = {
        let queue = SharedCircularQueue::open(&name, OpenMode::WriteOnly).unwrap();
        thread::spawn(move || queue.blocking_write(b"c").unwrap())
    };

    thread::sleep(Duration::from_millis(30));
    assert!(!producer.is_finished(), "writer must wait on a full ring");

    assert_eq!(queue.try_read().unwrap().unwrap(), b"a");
    assert!(producer.join().unwrap(), "freed slot accepts the write");

    assert_eq!(queue.try_read().unwrap().unwrap(), b"b");
    assert_eq!(queue.try_read().unwrap().unwrap(), b"c");

    SharedCircularQueue::unlink(&name).unwrap();
}

#[test]
fn test_close_wakes_a_blocked_consumer() {
    let name = unique_name("close_wakes_consumer");
    let queue = SharedCircularQueue::create(&name, 8, 2, OpenMode::ReadWrite).unwrap();

    let consumer = {
        let queue = SharedCircularQueue::open(&name, OpenMode::ReadOnly).unwrap();
        thread::spawn(move || {
            let result = queue.blocking_read().unwrap();
            (result, Instant::now())
        })
    };

    thread::sleep(Duration::from_millis(30));
    let closed_at = Instant::now();
    queue.close().unwrap();

    let (result, woke_at) = consumer.join().unwrap();
    assert!(result.is_none(), "a closed empty ring reads as None");
    assert!(
        woke_at.duration_since(closed_at) < Duration::from_millis(100),
        "consumer must wake within 100ms of close, took {:?}",
        woke_at.duration_since(closed_at)
    );

    SharedCircularQueue::unlink(&name).unwrap();
}

#[test]
fn test_close_wakes_a_blocked_producer_and_leftovers_drain() {
    let name = unique_name("close_wakes_producer");
    let queue = SharedCircularQueue::create(&name, 8, 2, OpenMode::ReadWrite).unwrap();

    assert!(queue.try_write(b"x").unwrap());
    assert!(queue.try_write(b"y").unwrap());

    let producer = {
        let queue = SharedCircularQueue::open(&name, OpenMode::WriteOnly).unwrap();
        thread::spawn(move || queue.blocking_write(b"z").unwrap())
    };

    thread::sleep(Duration::from_millis(30));
    assert!(!producer.is_finished(), "producer must park on the full ring");
    queue.close().unwrap();
    assert!(!producer.join().unwrap(), "producer observes the close");

    // Leftovers stay readable after close, then reads report closed
    // without blocking.
    assert_eq!(queue.blocking_read().unwrap().unwrap(), b"x");
    assert_eq!(queue.blocking_read().unwrap().unwrap(), b"y");
    let drained_at = Instant::now();
    assert!(queue.blocking_read().unwrap().is_none());
    assert!(
        drained_at.elapsed() < Duration::from_millis(100),
        "a drained closed queue must not block"
    );

    SharedCircularQueue::unlink(&name).unwrap();
}
