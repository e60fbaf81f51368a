use std::alloc::{self, Layout};
use std::collections::HashSet;
use std::thread;

use nvm_queues::{BufferedQueue, MpmcQueue};

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

fn new_queue(
    num_threads: usize,
    capacity: usize,
) -> (&'static BufferedQueue<u64>, Region) {
    let region = Region::new(BufferedQueue::<u64>::shared_size(num_threads, capacity));
    let queue = unsafe { BufferedQueue::init_in_shared(region.ptr, num_threads, capacity) };
    (queue, region)
}

#[test]
fn test_fifo_single_thread() {
    let (queue, _region) = new_queue(1, 16);

    assert!(queue.is_empty());
    assert_eq!(queue.dequeue(), None);

    queue.enqueue(10);
    queue.enqueue(20);

    assert_eq!(queue.dequeue(), Some(10));
    assert_eq!(queue.dequeue(), Some(20));
    assert_eq!(queue.dequeue(), None);
    assert!(queue.is_empty());
}

#[test]
fn test_sync_covers_current_tail() {
    let (queue, _region) = new_queue(1, 16);

    assert_eq!(queue.snapshot_version(), -1);

    queue.enqueue(1);
    queue.enqueue(2);
    queue.enqueue(3);
    queue.sync(0);
    let first_version = queue.snapshot_version();
    assert!(first_version >= 0);

    // A later enqueue stays outside the installed snapshot.
    queue.enqueue(4);
    assert_eq!(queue.snapshot_version(), first_version);

    // The volatile view still has everything.
    assert_eq!(queue.dequeue(), Some(1));
    assert_eq!(queue.dequeue(), Some(2));
    assert_eq!(queue.dequeue(), Some(3));
    assert_eq!(queue.dequeue(), Some(4));
}

#[test]
fn test_sync_version_monotonic() {
    let (queue, _region) = new_queue(1, 64);

    let mut last = queue.snapshot_version();
    for i in 0..10 {
        queue.enqueue(i);
        queue.sync(0);
        let version = queue.snapshot_version();
        assert!(version >= last, "snapshot version went backwards");
        last = version;
    }
}

#[test]
fn test_reopen_drops_volatile_suffix() {
    let (queue, _region) = new_queue(1, 64);

    for i in 1..=5 {
        queue.enqueue(i);
    }
    queue.sync(0);
    for i in 6..=10 {
        queue.enqueue(i);
    }

    unsafe { queue.reopen() };

    let mut drained = Vec::new();
    while let Some(v) = queue.dequeue() {
        drained.push(v);
    }
    assert_eq!(drained, vec![1, 2, 3, 4, 5]);

    // The queue stays usable after a reopen.
    queue.enqueue(42);
    assert_eq!(queue.dequeue(), Some(42));
    assert_eq!(queue.dequeue(), None);
}

#[test]
fn test_reopen_covers_consumed_prefix() {
    let (queue, _region) = new_queue(1, 64);

    for i in 1..=6 {
        queue.enqueue(i);
    }
    assert_eq!(queue.dequeue(), Some(1));
    assert_eq!(queue.dequeue(), Some(2));
    queue.sync(0);

    unsafe { queue.reopen() };

    let mut drained = Vec::new();
    while let Some(v) = queue.dequeue() {
        drained.push(v);
    }
    // The snapshot was taken after two removals.
    assert_eq!(drained, vec![3, 4, 5, 6]);
}

// Enqueues racing with syncs must neither lose items nor leave a marker
// behind in a `next` link.
#[test]
fn test_sync_concurrent_with_operations() {
    const PRODUCERS: usize = 2;
    const ITEMS_PER_PRODUCER: usize = 2_000;
    const TOTAL: usize = PRODUCERS * ITEMS_PER_PRODUCER;

    let (queue, _region) = new_queue(PRODUCERS + 1, ITEMS_PER_PRODUCER);

    let mut producers = Vec::new();
    for p in 0..PRODUCERS {
        producers.push(thread::spawn(move || {
            for i in 0..ITEMS_PER_PRODUCER {
                queue.enqueue((p * ITEMS_PER_PRODUCER + i) as u64);
            }
        }));
    }

    let syncer = thread::spawn(move || {
        let mut last = -1i64;
        for _ in 0..200 {
            queue.sync(PRODUCERS);
            let version = queue.snapshot_version();
            assert!(version >= last);
            last = version;
        }
    });

    for p in producers {
        p.join().unwrap();
    }
    syncer.join().unwrap();

    // A final sync after quiescence covers the whole queue.
    queue.sync(PRODUCERS);

    let mut seen = HashSet::new();
    while let Some(v) = queue.dequeue() {
        assert!(seen.insert(v), "duplicate item {}", v);
    }
    assert_eq!(seen.len(), TOTAL);
    assert!(queue.is_empty());
}

#[test]
fn test_trait_interface() {
    let (queue, _region) = new_queue(1, 8);

    assert!(MpmcQueue::push(queue, 3u64, 0).is_ok());
    assert_eq!(MpmcQueue::pop(queue, 0), Ok(3));
    assert!(MpmcQueue::pop(queue, 0).is_err());
}

#[cfg(unix)]
mod crash_tests {
    use super::*;
    use nix::{
        libc,
        sys::wait::{waitpid, WaitStatus},
        unistd::{fork, ForkResult},
    };

    unsafe fn map_shared(bytes: usize) -> *mut u8 {
        let page_size = 4096;
        let aligned = (bytes + page_size - 1) & !(page_size - 1);
        let ptr = libc::mmap(
            std::ptr::null_mut(),
            aligned,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED | libc::MAP_ANONYMOUS,
            -1,
            0,
        );
        if ptr == libc::MAP_FAILED {
            panic!("mmap failed: {}", std::io::Error::last_os_error());
        }
        ptr.cast()
    }

    fn wait_for_exit(child: nix::unistd::Pid) {
        match waitpid(child, None).expect("waitpid failed") {
            WaitStatus::Exited(_, code) => assert_eq!(code, 0),
            other => panic!("unexpected child status: {:?}", other),
        }
    }

    // The child syncs halfway through its workload and dies. Only the
    // synced prefix is retained after the reopen.
    #[test]
    fn test_crash_retains_synced_prefix() {
        let size = BufferedQueue::<u64>::shared_size(1, 256);
        let mem = unsafe { map_shared(size) };
        let queue = unsafe { BufferedQueue::<u64>::init_in_shared(mem, 1, 256) };

        match unsafe { fork() } {
            Ok(ForkResult::Child) => {
                for i in 1..=50 {
                    queue.enqueue(i);
                }
                queue.sync(0);
                for i in 51..=100 {
                    queue.enqueue(i);
                }
                unsafe { libc::_exit(0) };
            }
            Ok(ForkResult::Parent { child }) => {
                wait_for_exit(child);
                unsafe { queue.reopen() };

                let mut drained = Vec::new();
                while let Some(v) = queue.dequeue() {
                    drained.push(v);
                }
                let expected: Vec<u64> = (1..=50).collect();
                assert_eq!(drained, expected);
            }
            Err(e) => panic!("fork failed: {}", e),
        }
    }

    // Without any sync the queue reopens empty.
    #[test]
    fn test_crash_without_sync_loses_everything() {
        let size = BufferedQueue::<u64>::shared_size(1, 64);
        let mem = unsafe { map_shared(size) };
        let queue = unsafe { BufferedQueue::<u64>::init_in_shared(mem, 1, 64) };

        match unsafe { fork() } {
            Ok(ForkResult::Child) => {
                for i in 1..=20 {
                    queue.enqueue(i);
                }
                unsafe { libc::_exit(0) };
            }
            Ok(ForkResult::Parent { child }) => {
                wait_for_exit(child);
                unsafe { queue.reopen() };
                assert_eq!(queue.dequeue(), None);
                assert!(queue.is_empty());
            }
            Err(e) => panic!("fork failed: {}", e),
        }
    }
}
