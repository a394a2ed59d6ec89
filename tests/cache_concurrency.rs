//! Cross-thread behavior of the extent buffer cache: single-fill misses,
//! pool backpressure, and write-back durability across cache instances.

use std::sync::mpsc;
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use extentfs::{ExtentDevice, FileDevice, IoEngine, MemDevice, Queue, QueueConfig};

const EXTENT_SIZE: usize = 4096;

fn queue_over(dev: Arc<dyn ExtentDevice>, buffers: usize) -> Arc<Queue> {
    let engine = Arc::new(IoEngine::new(dev, EXTENT_SIZE, 4).unwrap());
    Arc::new(
        Queue::create(
            engine,
            QueueConfig {
                reserved_buffers: buffers,
                ..QueueConfig::default()
            },
        )
        .unwrap(),
    )
}

#[test]
fn concurrent_misses_read_the_device_once() {
    let dev = MemDevice::new(EXTENT_SIZE * 8);
    dev.write_at(7 * EXTENT_SIZE as u64, &[0xAB; EXTENT_SIZE])
        .unwrap();
    let queue = queue_over(Arc::clone(&dev) as Arc<dyn ExtentDevice>, 8);

    let threads = 8;
    let barrier = Arc::new(Barrier::new(threads));
    let handles: Vec<_> = (0..threads)
        .map(|_| {
            let queue = Arc::clone(&queue);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                let handle = queue.read_extent(7).unwrap();
                assert_eq!(handle.data()[0], 0xAB);
                handle.put();
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    assert_eq!(dev.read_count(), 1);
    queue.check_invariants();
}

#[test]
fn distinct_extents_fill_independently() {
    let dev = MemDevice::new(EXTENT_SIZE * 32);
    let queue = queue_over(Arc::clone(&dev) as Arc<dyn ExtentDevice>, 32);

    let barrier = Arc::new(Barrier::new(16));
    let handles: Vec<_> = (0..16u32)
        .map(|eno| {
            let queue = Arc::clone(&queue);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                for _ in 0..50 {
                    let handle = queue.read_extent(eno).unwrap();
                    assert_eq!(handle.extent_no(), eno);
                    handle.put();
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    // One physical read per extent, everything after is a hit.
    assert_eq!(dev.read_count(), 16);
    queue.check_invariants();
}

#[test]
fn exhausted_pool_blocks_until_a_hold_drops() {
    let dev = MemDevice::new(EXTENT_SIZE * 8);
    let queue = queue_over(Arc::clone(&dev) as Arc<dyn ExtentDevice>, 2);

    let first = queue.read_extent(0).unwrap();
    let second = queue.read_extent(1).unwrap();

    let (tx, rx) = mpsc::channel();
    let waiter = {
        let queue = Arc::clone(&queue);
        thread::spawn(move || {
            let handle = queue.read_extent(2).unwrap();
            tx.send(()).unwrap();
            handle.put();
        })
    };

    // Both buffers are held: the third read cannot make progress yet.
    assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());

    first.put();
    rx.recv_timeout(Duration::from_secs(5))
        .expect("read should complete once a buffer is free");
    waiter.join().unwrap();
    second.put();
    queue.check_invariants();
}

#[test]
fn write_back_survives_a_fresh_cache() {
    let file = tempfile::NamedTempFile::new().unwrap();
    file.as_file().set_len((EXTENT_SIZE * 8) as u64).unwrap();

    {
        let dev = Arc::new(FileDevice::open(file.path()).unwrap());
        let queue = queue_over(dev as Arc<dyn ExtentDevice>, 4);
        let handle = queue.new_extent(3).unwrap();
        handle.data()[..8].copy_from_slice(b"durable!");
        handle.mark_dirty();
        handle.put();
        queue.flush().unwrap();
    }

    let dev = Arc::new(FileDevice::open(file.path()).unwrap());
    let queue = queue_over(dev as Arc<dyn ExtentDevice>, 4);
    let handle = queue.read_extent(3).unwrap();
    assert_eq!(&handle.data()[..8], b"durable!");
    handle.put();
}

#[test]
fn queue_drop_flushes_dirty_buffers() {
    let dev = MemDevice::new(EXTENT_SIZE * 8);

    {
        let queue = queue_over(Arc::clone(&dev) as Arc<dyn ExtentDevice>, 4);
        let handle = queue.new_extent(5).unwrap();
        handle.data()[0] = 0xC4;
        handle.mark_dirty();
        handle.put();
    }

    assert_eq!(dev.snapshot()[5 * EXTENT_SIZE], 0xC4);
}

#[test]
fn mixed_read_write_stress_keeps_lists_consistent() {
    let dev = MemDevice::new(EXTENT_SIZE * 16);
    let queue = queue_over(Arc::clone(&dev) as Arc<dyn ExtentDevice>, 4);

    let barrier = Arc::new(Barrier::new(4));
    let handles: Vec<_> = (0..4u32)
        .map(|id| {
            let queue = Arc::clone(&queue);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                for round in 0..100u32 {
                    let eno = (id * 37 + round) % 16;
                    let handle = queue.read_extent(eno).unwrap();
                    if round % 3 == 0 {
                        handle.data()[0] = id as u8;
                        handle.mark_dirty();
                    }
                    if round % 7 == 0 {
                        handle.release();
                    } else {
                        handle.put();
                    }
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    queue.flush().unwrap();
    queue.check_invariants();
}
