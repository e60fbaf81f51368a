use std::marker::PhantomData;
use std::mem;
use std::ptr;
use std::sync::atomic::{AtomicI64, AtomicPtr, AtomicUsize, Ordering};

use crossbeam_utils::CachePadded;

use crate::pmem::{Clflush, Persist};
use crate::MpmcQueue;

// Per-thread wrap-around pool span for markers and snapshot records.
const SYNC_POOL_SPAN: usize = 4096;

// Tag bit distinguishing a blocking marker from a regular node when it
// sits in a `next` field. Node alignment keeps the bit free.
const MARKER_TAG: usize = 1;

#[repr(C, align(64))]
struct Node<T> {
    value: Option<T>,
    next: AtomicPtr<Node<T>>,
}

// Temporarily spliced behind the tail to freeze it while a consistent
// (head, tail) pair is sampled. `head` stays null until the sample is
// taken; whoever sees the marker may complete the sample and unsplice it.
#[repr(C, align(64))]
struct SyncMarker<T> {
    version: i64,
    tail: AtomicPtr<Node<T>>,
    head: AtomicPtr<Node<T>>,
}

// The durably installed prefix: everything between `nvm_head` and
// `nvm_tail` was flushed before `version` was published.
#[repr(C, align(64))]
struct Snapshot<T> {
    nvm_tail: AtomicPtr<Node<T>>,
    nvm_head: AtomicPtr<Node<T>>,
    version: i64,
}

#[repr(C, align(64))]
struct MarkerPool<T> {
    base: *mut SyncMarker<T>,
    next: AtomicUsize,
}

#[repr(C, align(64))]
struct SnapshotPool<T> {
    base: *mut Snapshot<T>,
    next: AtomicUsize,
}

fn tag_marker<T>(marker: *mut SyncMarker<T>) -> *mut Node<T> {
    (marker as usize | MARKER_TAG) as *mut Node<T>
}

fn marker_of<T>(p: *mut Node<T>) -> Option<*mut SyncMarker<T>> {
    if p as usize & MARKER_TAG != 0 {
        Some(((p as usize) & !MARKER_TAG) as *mut SyncMarker<T>)
    } else {
        None
    }
}

/// Buffered durably linearizable FIFO queue. Enqueue and dequeue are the
/// plain volatile operations; `sync` atomically promotes the current
/// queue prefix to durable state. After a crash, only the prefix covered
/// by the last completed `sync` is retained.
#[repr(C)]
pub struct BufferedQueue<T: Send + Clone + 'static, P: Persist = Clflush> {
    head: CachePadded<AtomicPtr<Node<T>>>,
    tail: CachePadded<AtomicPtr<Node<T>>>,
    data: CachePadded<AtomicPtr<Snapshot<T>>>,
    counter: CachePadded<AtomicI64>,

    num_threads: usize,

    node_pool: *mut Node<T>,
    node_pool_size: usize,
    next_node: AtomicUsize,

    marker_pools: *mut MarkerPool<T>,
    snapshot_pools: *mut SnapshotPool<T>,

    _persist: PhantomData<P>,
}

unsafe impl<T: Send + Clone + 'static, P: Persist> Send for BufferedQueue<T, P> {}
unsafe impl<T: Send + Clone + 'static, P: Persist> Sync for BufferedQueue<T, P> {}

impl<T: Send + Clone + 'static, P: Persist> BufferedQueue<T, P> {
    /// Bytes needed for `num_threads` threads and at most `capacity`
    /// enqueues per thread.
    pub fn shared_size(num_threads: usize, capacity: usize) -> usize {
        let mut total = 0usize;
        let bump = |total: &mut usize, size: usize, align: usize| {
            *total = (*total + align - 1) & !(align - 1);
            *total += size;
        };

        bump(&mut total, mem::size_of::<Self>(), mem::align_of::<Self>());
        bump(
            &mut total,
            (num_threads * capacity + 1) * mem::size_of::<Node<T>>(),
            mem::align_of::<Node<T>>(),
        );
        bump(
            &mut total,
            num_threads * mem::size_of::<MarkerPool<T>>(),
            mem::align_of::<MarkerPool<T>>(),
        );
        bump(
            &mut total,
            num_threads * SYNC_POOL_SPAN * mem::size_of::<SyncMarker<T>>(),
            mem::align_of::<SyncMarker<T>>(),
        );
        bump(
            &mut total,
            num_threads * mem::size_of::<SnapshotPool<T>>(),
            mem::align_of::<SnapshotPool<T>>(),
        );
        bump(
            &mut total,
            (num_threads * SYNC_POOL_SPAN + 1) * mem::size_of::<Snapshot<T>>(),
            mem::align_of::<Snapshot<T>>(),
        );

        (total + 4095) & !4095
    }

    pub unsafe fn init_in_shared(
        mem_ptr: *mut u8,
        num_threads: usize,
        capacity: usize,
    ) -> &'static mut Self {
        assert!(num_threads <= crate::MAX_THREADS);

        let mut offset = 0usize;
        let align_and_advance = |off: &mut usize, size: usize, align: usize| -> *mut u8 {
            *off = (*off + align - 1) & !(align - 1);
            let p = mem_ptr.add(*off);
            *off += size;
            p
        };

        let q_ptr = align_and_advance(
            &mut offset,
            mem::size_of::<Self>(),
            mem::align_of::<Self>(),
        ) as *mut Self;
        let node_pool_size = num_threads * capacity + 1;
        let pool_ptr = align_and_advance(
            &mut offset,
            node_pool_size * mem::size_of::<Node<T>>(),
            mem::align_of::<Node<T>>(),
        ) as *mut Node<T>;
        let marker_pools_ptr = align_and_advance(
            &mut offset,
            num_threads * mem::size_of::<MarkerPool<T>>(),
            mem::align_of::<MarkerPool<T>>(),
        ) as *mut MarkerPool<T>;
        let markers_ptr = align_and_advance(
            &mut offset,
            num_threads * SYNC_POOL_SPAN * mem::size_of::<SyncMarker<T>>(),
            mem::align_of::<SyncMarker<T>>(),
        ) as *mut SyncMarker<T>;
        let snapshot_pools_ptr = align_and_advance(
            &mut offset,
            num_threads * mem::size_of::<SnapshotPool<T>>(),
            mem::align_of::<SnapshotPool<T>>(),
        ) as *mut SnapshotPool<T>;
        let snapshots_ptr = align_and_advance(
            &mut offset,
            (num_threads * SYNC_POOL_SPAN + 1) * mem::size_of::<Snapshot<T>>(),
            mem::align_of::<Snapshot<T>>(),
        ) as *mut Snapshot<T>;

        let dummy = pool_ptr;
        ptr::write(
            dummy,
            Node {
                value: None,
                next: AtomicPtr::new(ptr::null_mut()),
            },
        );
        P::barrier(dummy);

        for i in 0..num_threads {
            ptr::write(
                marker_pools_ptr.add(i),
                MarkerPool {
                    base: markers_ptr.add(i * SYNC_POOL_SPAN),
                    next: AtomicUsize::new(0),
                },
            );
            ptr::write(
                snapshot_pools_ptr.add(i),
                SnapshotPool {
                    base: snapshots_ptr.add(i * SYNC_POOL_SPAN),
                    next: AtomicUsize::new(0),
                },
            );
        }

        // The trailing snapshot slot holds the initial empty snapshot.
        let initial = snapshots_ptr.add(num_threads * SYNC_POOL_SPAN);
        ptr::write(
            initial,
            Snapshot {
                nvm_tail: AtomicPtr::new(dummy),
                nvm_head: AtomicPtr::new(dummy),
                version: -1,
            },
        );
        P::barrier(initial);

        ptr::addr_of_mut!((*q_ptr).head).write(CachePadded::new(AtomicPtr::new(dummy)));
        ptr::addr_of_mut!((*q_ptr).tail).write(CachePadded::new(AtomicPtr::new(dummy)));
        ptr::addr_of_mut!((*q_ptr).data).write(CachePadded::new(AtomicPtr::new(initial)));
        ptr::addr_of_mut!((*q_ptr).counter).write(CachePadded::new(AtomicI64::new(0)));
        ptr::addr_of_mut!((*q_ptr).num_threads).write(num_threads);
        ptr::addr_of_mut!((*q_ptr).node_pool).write(pool_ptr);
        ptr::addr_of_mut!((*q_ptr).node_pool_size).write(node_pool_size);
        ptr::addr_of_mut!((*q_ptr).next_node).write(AtomicUsize::new(1));
        ptr::addr_of_mut!((*q_ptr).marker_pools).write(marker_pools_ptr);
        ptr::addr_of_mut!((*q_ptr).snapshot_pools).write(snapshot_pools_ptr);
        P::barrier(ptr::addr_of!((*q_ptr).head));
        P::barrier(ptr::addr_of!((*q_ptr).tail));
        P::barrier(ptr::addr_of!((*q_ptr).data));

        &mut *q_ptr
    }

    unsafe fn allocate_node(&self, value: T) -> *mut Node<T> {
        let idx = self.next_node.fetch_add(1, Ordering::AcqRel);
        if idx >= self.node_pool_size {
            panic!("BufferedQueue: node pool exhausted");
        }
        let node = self.node_pool.add(idx);
        ptr::write(
            node,
            Node {
                value: Some(value),
                next: AtomicPtr::new(ptr::null_mut()),
            },
        );
        node
    }

    unsafe fn allocate_marker(&self, thread_id: usize) -> *mut SyncMarker<T> {
        let pool = &*self.marker_pools.add(thread_id);
        let idx = pool.next.fetch_add(1, Ordering::AcqRel) % SYNC_POOL_SPAN;
        let marker = pool.base.add(idx);
        ptr::write(
            marker,
            SyncMarker {
                version: 0,
                tail: AtomicPtr::new(ptr::null_mut()),
                head: AtomicPtr::new(ptr::null_mut()),
            },
        );
        marker
    }

    unsafe fn allocate_snapshot(&self, thread_id: usize) -> *mut Snapshot<T> {
        let pool = &*self.snapshot_pools.add(thread_id);
        let idx = pool.next.fetch_add(1, Ordering::AcqRel) % SYNC_POOL_SPAN;
        pool.base.add(idx)
    }

    // Completes the sample held by a marker someone spliced behind the
    // tail, then unsplices it. `tagged` is the value observed in the
    // `next` field.
    unsafe fn help_marker(&self, marker: *mut SyncMarker<T>, tagged: *mut Node<T>) {
        let sample = self.head.load(Ordering::Acquire);
        let _ = (*marker).head.compare_exchange(
            ptr::null_mut(),
            sample,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        let blocked = (*marker).tail.load(Ordering::Acquire);
        if !blocked.is_null() {
            let _ = (*blocked).next.compare_exchange(
                tagged,
                ptr::null_mut(),
                Ordering::AcqRel,
                Ordering::Acquire,
            );
        }
    }

    pub fn enqueue(&self, value: T) {
        let node = unsafe { self.allocate_node(value) };
        loop {
            let last = self.tail.load(Ordering::Acquire);
            let next = unsafe { (*last).next.load(Ordering::Acquire) };
            if last != self.tail.load(Ordering::Acquire) {
                continue;
            }
            if next.is_null() {
                if unsafe {
                    (*last)
                        .next
                        .compare_exchange(
                            ptr::null_mut(),
                            node,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_ok()
                } {
                    let _ =
                        self.tail
                            .compare_exchange(last, node, Ordering::AcqRel, Ordering::Acquire);
                    return;
                }
            } else if let Some(marker) = marker_of(next) {
                unsafe { self.help_marker(marker, next) };
            } else {
                let _ = self
                    .tail
                    .compare_exchange(last, next, Ordering::AcqRel, Ordering::Acquire);
            }
        }
    }

    pub fn dequeue(&self) -> Option<T> {
        loop {
            let first = self.head.load(Ordering::Acquire);
            let last = self.tail.load(Ordering::Acquire);
            let next = unsafe { (*first).next.load(Ordering::Acquire) };
            if first != self.head.load(Ordering::Acquire) {
                continue;
            }
            if first == last {
                if next.is_null() {
                    return None;
                }
                if let Some(marker) = marker_of(next) {
                    // A snapshot is being taken of an empty queue.
                    unsafe { self.help_marker(marker, next) };
                    return None;
                }
                let _ = self
                    .tail
                    .compare_exchange(last, next, Ordering::AcqRel, Ordering::Acquire);
            } else {
                let value = unsafe { (*next).value.clone() };
                if self
                    .head
                    .compare_exchange(first, next, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    return value;
                }
            }
        }
    }

    // Splices `marker` behind the tail to freeze it, samples head, and
    // unsplices. Returns false when a snapshot with a newer version was
    // already installed; on true, `marker` holds the sampled pair.
    unsafe fn block_the_tail(&self, marker: *mut SyncMarker<T>) -> bool {
        let curr = self.data.load(Ordering::Acquire);
        let my_ver = self.counter.fetch_add(1, Ordering::AcqRel);
        (*marker).version = my_ver;
        loop {
            if (*curr).version > my_ver {
                return false;
            }
            let last = self.tail.load(Ordering::Acquire);
            let next = (*last).next.load(Ordering::Acquire);
            if last != self.tail.load(Ordering::Acquire) {
                continue;
            }
            if next.is_null() {
                (*marker).tail.store(last, Ordering::Release);
                let tagged = tag_marker(marker);
                if (*last)
                    .next
                    .compare_exchange(ptr::null_mut(), tagged, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    let sample = self.head.load(Ordering::Acquire);
                    let _ = (*marker).head.compare_exchange(
                        ptr::null_mut(),
                        sample,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    );
                    let _ = (*last).next.compare_exchange(
                        tagged,
                        ptr::null_mut(),
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    );
                    return true;
                }
            } else if let Some(curr_marker) = marker_of(next) {
                if (*curr_marker).version > my_ver
                    || (*curr_marker).head.load(Ordering::Acquire).is_null()
                {
                    // A snapshot covering at least our range is in
                    // progress; finish it and adopt it.
                    self.help_marker(curr_marker, next);
                    (*marker).version = (*curr_marker).version;
                    (*marker)
                        .tail
                        .store((*curr_marker).tail.load(Ordering::Acquire), Ordering::Release);
                    (*marker)
                        .head
                        .store((*curr_marker).head.load(Ordering::Acquire), Ordering::Release);
                    return true;
                }
                // An older sync still blocks the tail; clear it and retry.
                self.help_marker(curr_marker, next);
            } else {
                let _ = self
                    .tail
                    .compare_exchange(last, next, Ordering::AcqRel, Ordering::Acquire);
            }
        }
    }

    // Flushes every node from `start` up to and including `end`.
    unsafe fn make_durable(&self, start: *mut Node<T>, end: *mut Node<T>) {
        let mut temp = start;
        P::barrier(temp);
        while temp != end {
            let next = (*temp).next.load(Ordering::Acquire);
            if next.is_null() {
                return;
            }
            P::barrier(next);
            temp = next;
        }
    }

    /// Publishes a new durable snapshot covering the queue as of the
    /// moment the tail was frozen. Returns without installing when a
    /// concurrent `sync` already installed a newer one.
    pub fn sync(&self, thread_id: usize) {
        debug_assert!(thread_id < self.num_threads);
        unsafe {
            loop {
                let curr = self.data.load(Ordering::Acquire);
                let marker = self.allocate_marker(thread_id);
                if !self.block_the_tail(marker) {
                    return;
                }
                // An adopted sample can carry a version the installed
                // snapshot already covers; never move `data` backwards.
                if (*marker).version <= (*curr).version {
                    return;
                }
                self.make_durable(
                    (*curr).nvm_tail.load(Ordering::Acquire),
                    (*marker).tail.load(Ordering::Acquire),
                );
                let snapshot = self.allocate_snapshot(thread_id);
                ptr::write(
                    snapshot,
                    Snapshot {
                        nvm_tail: AtomicPtr::new((*marker).tail.load(Ordering::Acquire)),
                        nvm_head: AtomicPtr::new((*marker).head.load(Ordering::Acquire)),
                        version: (*marker).version,
                    },
                );
                P::barrier(snapshot);
                if self
                    .data
                    .compare_exchange(curr, snapshot, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    P::barrier(ptr::addr_of!(self.data));
                    return;
                }
            }
        }
    }

    /// Version of the currently installed snapshot. Non-decreasing.
    pub fn snapshot_version(&self) -> i64 {
        unsafe { (*self.data.load(Ordering::Acquire)).version }
    }

    /// Resets the volatile view to the durable prefix. Call once after a
    /// crash, before normal operations resume; everything enqueued after
    /// the last completed `sync` is dropped.
    pub unsafe fn reopen(&self) {
        let snapshot = self.data.load(Ordering::Acquire);
        let nvm_head = (*snapshot).nvm_head.load(Ordering::Acquire);
        let nvm_tail = (*snapshot).nvm_tail.load(Ordering::Acquire);
        (*nvm_tail).next.store(ptr::null_mut(), Ordering::Release);
        P::barrier(ptr::addr_of!((*nvm_tail).next));
        self.head.store(nvm_head, Ordering::Release);
        self.tail.store(nvm_tail, Ordering::Release);
        P::barrier(ptr::addr_of!(self.head));
        P::barrier(ptr::addr_of!(self.tail));
    }

    pub fn is_empty(&self) -> bool {
        let head = self.head.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Acquire);
        if head != tail {
            return false;
        }
        let next = unsafe { (*head).next.load(Ordering::Acquire) };
        next.is_null() || marker_of(next).is_some()
    }

    pub fn is_full(&self) -> bool {
        self.next_node.load(Ordering::Acquire) >= self.node_pool_size
    }
}

impl<T: Send + Clone + 'static, P: Persist> MpmcQueue<T> for BufferedQueue<T, P> {
    type PushError = ();
    type PopError = ();

    fn push(&self, item: T, _thread_id: usize) -> Result<(), Self::PushError> {
        self.enqueue(item);
        Ok(())
    }

    fn pop(&self, _thread_id: usize) -> Result<T, Self::PopError> {
        self.dequeue().ok_or(())
    }

    fn is_empty(&self) -> bool {
        self.is_empty()
    }

    fn is_full(&self) -> bool {
        self.is_full()
    }
}
