use std::alloc::{self, Layout};
use std::collections::HashSet;
use std::thread;

use nvm_queues::{MpmcQueue, MsQueue};

struct Region {
    ptr: *mut u8,
    layout: Layout,
}

impl Region {
    fn new(bytes: usize) -> Self {
        let layout = Layout::from_size_align(bytes, 4096).unwrap();
        let ptr = unsafe { alloc::alloc_zeroed(layout) };
        assert!(!ptr.is_null());
        Region { ptr, layout }
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        unsafe { alloc::dealloc(self.ptr, self.layout) };
    }
}

fn new_queue(capacity: usize) -> (&'static MsQueue<usize>, Region) {
    let region = Region::new(MsQueue::<usize>::shared_size(capacity));
    let queue = unsafe { MsQueue::init_in_shared(region.ptr, capacity) };
    (queue, region)
}

#[test]
fn test_fifo_single_thread() {
    let (queue, _region) = new_queue(16);

    assert!(queue.is_empty());
    assert_eq!(queue.dequeue(), None);

    queue.enqueue(10);
    queue.enqueue(20);
    assert!(!queue.is_empty());

    assert_eq!(queue.dequeue(), Some(10));
    assert_eq!(queue.dequeue(), Some(20));
    assert_eq!(queue.dequeue(), None);
    assert!(queue.is_empty());
}

#[test]
fn test_fifo_order_spsc() {
    const ITEMS: usize = 10_000;
    let (queue, _region) = new_queue(ITEMS);

    let producer = thread::spawn(move || {
        for i in 0..ITEMS {
            queue.enqueue(i);
        }
    });

    let consumer = thread::spawn(move || {
        let mut received = Vec::with_capacity(ITEMS);
        while received.len() < ITEMS {
            if let Some(item) = queue.dequeue() {
                received.push(item);
            } else {
                std::hint::spin_loop();
            }
        }
        received
    });

    producer.join().unwrap();
    let received = consumer.join().unwrap();

    let expected: Vec<usize> = (0..ITEMS).collect();
    assert_eq!(received, expected);
    assert!(queue.is_empty());
}

#[test]
fn test_no_loss_no_duplication_mpmc() {
    const PRODUCERS: usize = 4;
    const CONSUMERS: usize = 4;
    const ITEMS_PER_PRODUCER: usize = 5_000;
    const TOTAL: usize = PRODUCERS * ITEMS_PER_PRODUCER;

    let (queue, _region) = new_queue(TOTAL);

    let mut handles = Vec::new();
    for p in 0..PRODUCERS {
        handles.push(thread::spawn(move || {
            for i in 0..ITEMS_PER_PRODUCER {
                queue.enqueue(p * ITEMS_PER_PRODUCER + i);
            }
        }));
    }

    // Quotas sum to the item count, so every consumer terminates.
    const QUOTA: usize = TOTAL / CONSUMERS;
    let mut consumers = Vec::new();
    for _ in 0..CONSUMERS {
        consumers.push(thread::spawn(move || {
            let mut local = Vec::new();
            while local.len() < QUOTA {
                match queue.dequeue() {
                    Some(item) => local.push(item),
                    None => std::thread::yield_now(),
                }
            }
            local
        }));
    }

    for h in handles {
        h.join().unwrap();
    }

    let mut seen = HashSet::new();
    let mut count = 0usize;
    for c in consumers {
        for item in c.join().unwrap() {
            assert!(seen.insert(item), "duplicate item {}", item);
            count += 1;
        }
    }
    assert_eq!(count, TOTAL, "lost {} items", TOTAL - count);
    assert!(queue.is_empty());
}

#[test]
fn test_trait_interface() {
    let (queue, _region) = new_queue(8);

    assert!(MpmcQueue::push(queue, 7usize, 0).is_ok());
    assert_eq!(MpmcQueue::pop(queue, 1), Ok(7));
    assert!(MpmcQueue::pop(queue, 1).is_err());
    assert!(!MpmcQueue::is_full(queue));
}
