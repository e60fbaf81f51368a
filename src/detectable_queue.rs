use std::marker::PhantomData;
use std::mem;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU64, AtomicUsize, Ordering};

use crossbeam_utils::CachePadded;

use crate::pmem::{Clflush, Persist};
use crate::MpmcQueue;

// How many times the per-thread log array can be replaced over the
// lifetime of one memory region, i.e. how many recoveries it supports.
const LOG_GENERATIONS: usize = 16;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(C)]
enum Action {
    Insert,
    Remove,
}

// Per-operation record. For an insert, `node` is set at creation and
// `status` becomes true once the node is known to be linked. For a
// remove, `node` is set once a node has been claimed and `status` means
// the queue was observed empty.
#[repr(C, align(64))]
struct LogEntry<T> {
    op_num: u64,
    action: Action,
    status: AtomicBool,
    node: AtomicPtr<Node<T>>,
}

#[repr(C, align(64))]
struct Node<T> {
    value: Option<T>,
    next: AtomicPtr<Node<T>>,
    log_enq: AtomicPtr<LogEntry<T>>,
    log_deq: AtomicPtr<LogEntry<T>>,
}

/// One per-thread log pointer, on its own cache line. The pointee is the
/// thread's most recent operation record.
#[repr(C, align(64))]
pub struct LogSlot<T> {
    entry: AtomicPtr<LogEntry<T>>,
}

// Per-thread bump pool of log entries.
#[repr(C, align(64))]
struct EntryPool<T> {
    base: *mut LogEntry<T>,
    next: AtomicUsize,
    size: usize,
}

impl<T> EntryPool<T> {
    unsafe fn allocate(
        &self,
        op_num: u64,
        action: Action,
        node: *mut Node<T>,
    ) -> *mut LogEntry<T> {
        let idx = self.next.fetch_add(1, Ordering::AcqRel);
        if idx >= self.size {
            panic!("DetectableQueue: log entry pool exhausted");
        }
        let entry = self.base.add(idx);
        ptr::write(
            entry,
            LogEntry {
                op_num,
                action,
                status: AtomicBool::new(false),
                node: AtomicPtr::new(node),
            },
        );
        entry
    }
}

// Volatile per-thread operation counter backing the common trait impl.
#[repr(C, align(64))]
struct OpCounter {
    next: AtomicU64,
}

/// Outcome of a thread's most recent operation, derived from the log
/// array that was live at the crash. Meaningful once `recover` has run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LastOp<T> {
    /// No operation was in flight.
    None,
    /// The insert with this operation number took effect.
    Enqueued(u64),
    /// The remove with this operation number claimed a node carrying this
    /// value.
    Dequeued(u64, T),
    /// The remove with this operation number observed an empty queue.
    DequeuedEmpty(u64),
}

/// Durably linearizable FIFO queue with detectable operations. Every
/// enqueue and dequeue first publishes a log entry in the calling
/// thread's slot; after a crash, `recover` completes whatever those
/// entries describe and `last_op` reports each thread's outcome.
#[repr(C)]
pub struct DetectableQueue<T: Send + Clone + 'static, P: Persist = Clflush> {
    head: CachePadded<AtomicPtr<Node<T>>>,
    tail: CachePadded<AtomicPtr<Node<T>>>,
    logs: CachePadded<AtomicPtr<LogSlot<T>>>,

    num_threads: usize,

    node_pool: *mut Node<T>,
    node_pool_size: usize,
    next_node: AtomicUsize,

    entry_pools: *mut EntryPool<T>,

    gen_pool: *mut LogSlot<T>,
    next_gen: AtomicUsize,

    op_counters: *mut OpCounter,

    _persist: PhantomData<P>,
}

unsafe impl<T: Send + Clone + 'static, P: Persist> Send for DetectableQueue<T, P> {}
unsafe impl<T: Send + Clone + 'static, P: Persist> Sync for DetectableQueue<T, P> {}

impl<T: Send + Clone + 'static, P: Persist> DetectableQueue<T, P> {
    /// Bytes needed for `num_threads` threads each performing at most
    /// `capacity` operations over the lifetime of the region.
    pub fn shared_size(num_threads: usize, capacity: usize) -> usize {
        let mut total = 0usize;
        let bump = |total: &mut usize, size: usize, align: usize| {
            *total = (*total + align - 1) & !(align - 1);
            *total += size;
        };

        bump(&mut total, mem::size_of::<Self>(), mem::align_of::<Self>());
        bump(
            &mut total,
            LOG_GENERATIONS * num_threads * mem::size_of::<LogSlot<T>>(),
            mem::align_of::<LogSlot<T>>(),
        );
        bump(
            &mut total,
            num_threads * mem::size_of::<EntryPool<T>>(),
            mem::align_of::<EntryPool<T>>(),
        );
        bump(
            &mut total,
            num_threads * capacity * mem::size_of::<LogEntry<T>>(),
            mem::align_of::<LogEntry<T>>(),
        );
        bump(
            &mut total,
            num_threads * mem::size_of::<OpCounter>(),
            mem::align_of::<OpCounter>(),
        );
        bump(
            &mut total,
            (num_threads * capacity + 1) * mem::size_of::<Node<T>>(),
            mem::align_of::<Node<T>>(),
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
        let gen_ptr = align_and_advance(
            &mut offset,
            LOG_GENERATIONS * num_threads * mem::size_of::<LogSlot<T>>(),
            mem::align_of::<LogSlot<T>>(),
        ) as *mut LogSlot<T>;
        let pools_ptr = align_and_advance(
            &mut offset,
            num_threads * mem::size_of::<EntryPool<T>>(),
            mem::align_of::<EntryPool<T>>(),
        ) as *mut EntryPool<T>;
        let entries_ptr = align_and_advance(
            &mut offset,
            num_threads * capacity * mem::size_of::<LogEntry<T>>(),
            mem::align_of::<LogEntry<T>>(),
        ) as *mut LogEntry<T>;
        let counters_ptr = align_and_advance(
            &mut offset,
            num_threads * mem::size_of::<OpCounter>(),
            mem::align_of::<OpCounter>(),
        ) as *mut OpCounter;
        let node_pool_size = num_threads * capacity + 1;
        let pool_ptr = align_and_advance(
            &mut offset,
            node_pool_size * mem::size_of::<Node<T>>(),
            mem::align_of::<Node<T>>(),
        ) as *mut Node<T>;

        let dummy = pool_ptr;
        ptr::write(
            dummy,
            Node {
                value: None,
                next: AtomicPtr::new(ptr::null_mut()),
                log_enq: AtomicPtr::new(ptr::null_mut()),
                log_deq: AtomicPtr::new(ptr::null_mut()),
            },
        );
        P::barrier(dummy);

        // Generation 0 is the initial log array.
        for i in 0..num_threads {
            let slot = gen_ptr.add(i);
            ptr::write(
                slot,
                LogSlot {
                    entry: AtomicPtr::new(ptr::null_mut()),
                },
            );
            P::barrier(slot);
        }

        for i in 0..num_threads {
            ptr::write(
                pools_ptr.add(i),
                EntryPool {
                    base: entries_ptr.add(i * capacity),
                    next: AtomicUsize::new(0),
                    size: capacity,
                },
            );
            ptr::write(
                counters_ptr.add(i),
                OpCounter {
                    next: AtomicU64::new(0),
                },
            );
        }

        ptr::addr_of_mut!((*q_ptr).head).write(CachePadded::new(AtomicPtr::new(dummy)));
        ptr::addr_of_mut!((*q_ptr).tail).write(CachePadded::new(AtomicPtr::new(dummy)));
        ptr::addr_of_mut!((*q_ptr).logs).write(CachePadded::new(AtomicPtr::new(gen_ptr)));
        ptr::addr_of_mut!((*q_ptr).num_threads).write(num_threads);
        ptr::addr_of_mut!((*q_ptr).node_pool).write(pool_ptr);
        ptr::addr_of_mut!((*q_ptr).node_pool_size).write(node_pool_size);
        ptr::addr_of_mut!((*q_ptr).next_node).write(AtomicUsize::new(1));
        ptr::addr_of_mut!((*q_ptr).entry_pools).write(pools_ptr);
        ptr::addr_of_mut!((*q_ptr).gen_pool).write(gen_ptr);
        ptr::addr_of_mut!((*q_ptr).next_gen).write(AtomicUsize::new(1));
        ptr::addr_of_mut!((*q_ptr).op_counters).write(counters_ptr);
        P::barrier(ptr::addr_of!((*q_ptr).head));
        P::barrier(ptr::addr_of!((*q_ptr).tail));
        P::barrier(ptr::addr_of!((*q_ptr).logs));

        &mut *q_ptr
    }

    /// The live log array. Capture this before calling `recover` so the
    /// pre-crash operations stay inspectable through `last_op`.
    pub fn logs(&self) -> *mut LogSlot<T> {
        self.logs.load(Ordering::Acquire)
    }

    unsafe fn allocate_node(&self, value: T) -> *mut Node<T> {
        let idx = self.next_node.fetch_add(1, Ordering::AcqRel);
        if idx >= self.node_pool_size {
            panic!("DetectableQueue: node pool exhausted");
        }
        let node = self.node_pool.add(idx);
        ptr::write(
            node,
            Node {
                value: Some(value),
                next: AtomicPtr::new(ptr::null_mut()),
                log_enq: AtomicPtr::new(ptr::null_mut()),
                log_deq: AtomicPtr::new(ptr::null_mut()),
            },
        );
        node
    }

    // Builds the node and its insert record, then publishes the record in
    // the thread's slot. Both objects are durable before the slot points
    // at them.
    unsafe fn create_enq_log(&self, value: T, thread_id: usize, op_num: u64) -> *mut Node<T> {
        let node = self.allocate_node(value);
        let entry = (*self.entry_pools.add(thread_id)).allocate(op_num, Action::Insert, node);
        (*node).log_enq.store(entry, Ordering::Release);
        P::barrier_opt(node);
        P::barrier(entry);

        let slot = self.logs().add(thread_id);
        (*slot).entry.store(entry, Ordering::Release);
        P::barrier(slot);
        node
    }

    unsafe fn create_deq_log(&self, thread_id: usize, op_num: u64) -> *mut LogEntry<T> {
        let entry =
            (*self.entry_pools.add(thread_id)).allocate(op_num, Action::Remove, ptr::null_mut());
        P::barrier(entry);

        let slot = self.logs().add(thread_id);
        (*slot).entry.store(entry, Ordering::Release);
        P::barrier(slot);
        entry
    }

    // Marks a node's insert record as linked. Safe on the dummy, whose
    // record pointer is null.
    unsafe fn mark_inserted(&self, node: *mut Node<T>) {
        let entry = (*node).log_enq.load(Ordering::Acquire);
        if !entry.is_null() {
            (*entry).status.store(true, Ordering::Release);
        }
    }

    /// `op_num` must be unique per thread and increase between calls.
    pub fn enqueue(&self, value: T, thread_id: usize, op_num: u64) {
        unsafe {
            let node = self.create_enq_log(value, thread_id, op_num);
            loop {
                let last = self.tail.load(Ordering::Acquire);
                let next = (*last).next.load(Ordering::Acquire);
                if last != self.tail.load(Ordering::Acquire) {
                    continue;
                }
                if next.is_null() {
                    if (*last)
                        .next
                        .compare_exchange(
                            ptr::null_mut(),
                            node,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_ok()
                    {
                        P::barrier_opt(ptr::addr_of!((*last).next));
                        self.mark_inserted(node);
                        let _ = self.tail.compare_exchange(
                            last,
                            node,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        );
                        return;
                    }
                } else {
                    P::barrier_opt(ptr::addr_of!((*last).next));
                    self.mark_inserted(next);
                    let _ = self
                        .tail
                        .compare_exchange(last, next, Ordering::AcqRel, Ordering::Acquire);
                }
            }
        }
    }

    /// `op_num` must be unique per thread and increase between calls.
    pub fn dequeue(&self, thread_id: usize, op_num: u64) -> Option<T> {
        unsafe {
            let log = self.create_deq_log(thread_id, op_num);
            loop {
                let first = self.head.load(Ordering::Acquire);
                let last = self.tail.load(Ordering::Acquire);
                let next = (*first).next.load(Ordering::Acquire);
                if first != self.head.load(Ordering::Acquire) {
                    continue;
                }
                if first == last {
                    if next.is_null() {
                        (*log).status.store(true, Ordering::Release);
                        P::barrier(ptr::addr_of!((*log).status));
                        return None;
                    }
                    P::barrier_opt(ptr::addr_of!((*last).next));
                    let _ = self
                        .tail
                        .compare_exchange(last, next, Ordering::AcqRel, Ordering::Acquire);
                } else {
                    // The record CAS is the claim; connecting the record to
                    // the node afterwards is what recovery reads back.
                    if (*next)
                        .log_deq
                        .compare_exchange(
                            ptr::null_mut(),
                            log,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_ok()
                    {
                        P::barrier(ptr::addr_of!((*next).log_deq));
                        (*log).node.store(next, Ordering::Release);
                        P::barrier_opt(ptr::addr_of!((*log).node));
                        let _ = self.head.compare_exchange(
                            first,
                            next,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        );
                        return (*next).value.clone();
                    } else if self.head.load(Ordering::Acquire) == first {
                        // Finish the winning thread's record before the
                        // head can move.
                        let winner = (*next).log_deq.load(Ordering::Acquire);
                        if !winner.is_null() {
                            (*winner).node.store(next, Ordering::Release);
                            P::barrier_opt(ptr::addr_of!((*winner).node));
                            let _ = self.head.compare_exchange(
                                first,
                                next,
                                Ordering::AcqRel,
                                Ordering::Acquire,
                            );
                        }
                    }
                }
            }
        }
    }

    /// Repairs the queue after a crash and completes every operation the
    /// surviving log array describes, then installs a fresh array.
    ///
    /// Must run before normal operations resume. `old_logs` is the value
    /// `logs()` returned on the crashed incarnation (still readable in
    /// the region).
    pub unsafe fn recover(&self, old_logs: *mut LogSlot<T>) {
        self.update_head();
        self.update_tail_and_status();
        self.finish_pending_ops(old_logs);
        self.install_fresh_logs(old_logs);
    }

    // Advances head past every node whose removal was already claimed,
    // finalizing the last such record on the way.
    unsafe fn update_head(&self) {
        let start = self.head.load(Ordering::Acquire);
        let mut temp = (*start).next.load(Ordering::Acquire);
        loop {
            if temp.is_null() {
                return;
            }
            let log = (*temp).log_deq.load(Ordering::Acquire);
            if log.is_null() {
                return;
            }
            let next = (*temp).next.load(Ordering::Acquire);
            let next_claimed = !next.is_null() && !(*next).log_deq.load(Ordering::Acquire).is_null();
            if !next_claimed {
                // `temp` is the last claimed node and becomes the new
                // dummy.
                P::barrier(ptr::addr_of!((*temp).log_deq));
                (*log).node.store(temp, Ordering::Release);
                P::barrier_opt(ptr::addr_of!((*log).node));
                let _ = self
                    .head
                    .compare_exchange(start, temp, Ordering::AcqRel, Ordering::Acquire);
                return;
            }
            temp = next;
        }
    }

    // Walks head to the end of the chain, marking every insert record as
    // linked so it cannot be replayed, and leaves tail on the last node.
    unsafe fn update_tail_and_status(&self) {
        let prev_tail = self.tail.load(Ordering::Acquire);
        let mut temp = self.head.load(Ordering::Acquire);
        self.mark_inserted(temp);
        loop {
            let next = (*temp).next.load(Ordering::Acquire);
            if next.is_null() {
                let _ = self
                    .tail
                    .compare_exchange(prev_tail, temp, Ordering::AcqRel, Ordering::Acquire);
                return;
            }
            if (*next).next.load(Ordering::Acquire).is_null() {
                P::barrier(ptr::addr_of!((*temp).next));
                self.mark_inserted(next);
                let _ = self
                    .tail
                    .compare_exchange(prev_tail, next, Ordering::AcqRel, Ordering::Acquire);
                return;
            }
            temp = next;
            self.mark_inserted(temp);
        }
    }

    unsafe fn finish_pending_ops(&self, old_logs: *mut LogSlot<T>) {
        for i in 0..self.num_threads {
            let entry = (*old_logs.add(i)).entry.load(Ordering::Acquire);
            if entry.is_null() {
                continue;
            }
            match (*entry).action {
                Action::Insert => self.finish_insert(entry),
                Action::Remove => self.finish_remove(entry),
            }
        }
    }

    unsafe fn finish_insert(&self, entry: *mut LogEntry<T>) {
        let node = (*entry).node.load(Ordering::Acquire);
        loop {
            if (*entry).status.load(Ordering::Acquire) {
                return;
            }
            if !node.is_null() && !(*node).log_deq.load(Ordering::Acquire).is_null() {
                // The node was already claimed by a remove, so the insert
                // must have taken effect earlier.
                (*entry).status.store(true, Ordering::Release);
                P::barrier(ptr::addr_of!((*entry).status));
                return;
            }
            let last = self.tail.load(Ordering::Acquire);
            let next = (*last).next.load(Ordering::Acquire);
            if last != self.tail.load(Ordering::Acquire) {
                continue;
            }
            if next.is_null() {
                let expected = ptr::null_mut();
                if (*last)
                    .next
                    .compare_exchange(expected, node, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    P::barrier(ptr::addr_of!((*last).next));
                    self.mark_inserted(node);
                    P::barrier(ptr::addr_of!((*entry).status));
                    let _ = self
                        .tail
                        .compare_exchange(last, node, Ordering::AcqRel, Ordering::Acquire);
                    return;
                }
            } else {
                P::barrier(ptr::addr_of!((*last).next));
                self.mark_inserted(next);
                let _ = self
                    .tail
                    .compare_exchange(last, next, Ordering::AcqRel, Ordering::Acquire);
            }
        }
    }

    unsafe fn finish_remove(&self, entry: *mut LogEntry<T>) {
        loop {
            if !(*entry).node.load(Ordering::Acquire).is_null()
                || (*entry).status.load(Ordering::Acquire)
            {
                return;
            }
            let first = self.head.load(Ordering::Acquire);
            let last = self.tail.load(Ordering::Acquire);
            let next = (*first).next.load(Ordering::Acquire);
            if first != self.head.load(Ordering::Acquire) {
                continue;
            }
            if first == last {
                if next.is_null() {
                    (*entry).status.store(true, Ordering::Release);
                    P::barrier(ptr::addr_of!((*entry).status));
                    return;
                }
                P::barrier(ptr::addr_of!((*last).next));
                self.mark_inserted(next);
                let _ = self
                    .tail
                    .compare_exchange(last, next, Ordering::AcqRel, Ordering::Acquire);
            } else if (*next)
                .log_deq
                .compare_exchange(ptr::null_mut(), entry, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                P::barrier(ptr::addr_of!((*next).log_deq));
                (*entry).node.store(next, Ordering::Release);
                P::barrier_opt(ptr::addr_of!((*entry).node));
                let _ = self
                    .head
                    .compare_exchange(first, next, Ordering::AcqRel, Ordering::Acquire);
                return;
            } else if self.head.load(Ordering::Acquire) == first {
                let winner = (*next).log_deq.load(Ordering::Acquire);
                if !winner.is_null() {
                    (*winner).node.store(next, Ordering::Release);
                    P::barrier_opt(ptr::addr_of!((*winner).node));
                    let _ = self
                        .head
                        .compare_exchange(first, next, Ordering::AcqRel, Ordering::Acquire);
                }
            }
        }
    }

    unsafe fn install_fresh_logs(&self, old_logs: *mut LogSlot<T>) {
        let gen = self.next_gen.fetch_add(1, Ordering::AcqRel);
        if gen >= LOG_GENERATIONS {
            panic!("DetectableQueue: log generation pool exhausted");
        }
        let fresh = self.gen_pool.add(gen * self.num_threads);
        for i in 0..self.num_threads {
            (*fresh.add(i)).entry.store(ptr::null_mut(), Ordering::Release);
            P::barrier_opt(fresh.add(i));
        }
        let _ = self
            .logs
            .compare_exchange(old_logs, fresh, Ordering::AcqRel, Ordering::Acquire);
        P::barrier(ptr::addr_of!(self.logs));
    }

    /// Outcome of the thread's most recent pre-crash operation, read from
    /// the log array that `recover` was given. `recover` has completed
    /// every such operation, so the answer is final.
    pub unsafe fn last_op(&self, old_logs: *mut LogSlot<T>, thread_id: usize) -> LastOp<T> {
        let entry = (*old_logs.add(thread_id)).entry.load(Ordering::Acquire);
        if entry.is_null() {
            return LastOp::None;
        }
        match (*entry).action {
            Action::Insert => LastOp::Enqueued((*entry).op_num),
            Action::Remove => {
                let node = (*entry).node.load(Ordering::Acquire);
                if node.is_null() {
                    LastOp::DequeuedEmpty((*entry).op_num)
                } else {
                    LastOp::Dequeued((*entry).op_num, (*node).value.clone().unwrap())
                }
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        let head = self.head.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Acquire);
        head == tail && unsafe { (*head).next.load(Ordering::Acquire).is_null() }
    }

    pub fn is_full(&self) -> bool {
        self.next_node.load(Ordering::Acquire) >= self.node_pool_size
    }
}

impl<T: Send + Clone + 'static, P: Persist> MpmcQueue<T> for DetectableQueue<T, P> {
    type PushError = ();
    type PopError = ();

    fn push(&self, item: T, thread_id: usize) -> Result<(), Self::PushError> {
        let op_num =
            unsafe { (*self.op_counters.add(thread_id)).next.fetch_add(1, Ordering::Relaxed) };
        self.enqueue(item, thread_id, op_num);
        Ok(())
    }

    fn pop(&self, thread_id: usize) -> Result<T, Self::PopError> {
        let op_num =
            unsafe { (*self.op_counters.add(thread_id)).next.fetch_add(1, Ordering::Relaxed) };
        self.dequeue(thread_id, op_num).ok_or(())
    }

    fn is_empty(&self) -> bool {
        self.is_empty()
    }

    fn is_full(&self) -> bool {
        self.is_full()
    }
}
