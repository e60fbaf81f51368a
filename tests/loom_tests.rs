use loom::model;
use loom::thread;

use std::alloc::{self, Layout};
use std::collections::HashSet;

use nvm_queues::MsQueue;

const NUM_PRODUCERS: usize = 2;
const ITEMS_PER_PRODUCER: usize = 3;
const TOTAL_ITEMS: usize = NUM_PRODUCERS * ITEMS_PER_PRODUCER;

#[test]
fn loom_ms_queue_no_loss() {
    model(|| {
        let bytes = MsQueue::<usize>::shared_size(TOTAL_ITEMS);
        let layout = Layout::from_size_align(bytes, 4096).unwrap();
        let mem = unsafe { alloc::alloc_zeroed(layout) };
        assert!(!mem.is_null());

        let queue: &'static MsQueue<usize> =
            unsafe { MsQueue::init_in_shared(mem, TOTAL_ITEMS) };

        let mut producers = Vec::new();
        for p_id in 0..NUM_PRODUCERS {
            producers.push(thread::spawn(move || {
                for i in 0..ITEMS_PER_PRODUCER {
                    queue.enqueue(p_id * ITEMS_PER_PRODUCER + i);
                }
            }));
        }

        let consumer = thread::spawn(move || {
            let mut received = HashSet::new();
            while received.len() < TOTAL_ITEMS {
                match queue.dequeue() {
                    Some(item) => {
                        assert!(received.insert(item), "duplicate item popped: {}", item);
                    }
                    None => thread::yield_now(),
                }
            }
            received
        });

        for p in producers {
            p.join().unwrap();
        }
        let received = consumer.join().unwrap();

        assert_eq!(received.len(), TOTAL_ITEMS);
        for p_id in 0..NUM_PRODUCERS {
            for i in 0..ITEMS_PER_PRODUCER {
                assert!(received.contains(&(p_id * ITEMS_PER_PRODUCER + i)));
            }
        }
        assert!(queue.is_empty());
    });
}
