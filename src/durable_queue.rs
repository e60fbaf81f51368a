use std::marker::PhantomData;
use std::mem;
use std::ptr;
use std::sync::atomic::{AtomicI32, AtomicPtr, AtomicUsize, Ordering};

use crossbeam_utils::CachePadded;

use crate::pmem::{Clflush, Persist};
use crate::MpmcQueue;

// Queue node. `thread_id` is -1 until the node is claimed by a dequeuer;
// the claim CAS is what removes the node logically.
#[repr(C, align(64))]
struct Node<T> {
    value: Option<T>,
    next: AtomicPtr<Node<T>>,
    thread_id: AtomicI32,
}

/// Content of a per-thread result cell. A fresh cell starts out `Pending`
/// and is overwritten exactly once, by the owner or by a helper, before
/// the owning dequeue returns.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Removed<T> {
    Pending,
    Value(T),
    Empty,
}

// One result-cell pointer per thread, each on its own cache line.
#[repr(C, align(64))]
struct RemovedSlot<T> {
    cell: AtomicPtr<Removed<T>>,
}

/// Durably linearizable FIFO queue. Every completed enqueue and dequeue
/// survives a crash; the per-thread result cell additionally preserves a
/// dequeued value across a crash that hits after the claim but before the
/// caller observed the return value.
#[repr(C)]
pub struct DurableQueue<T: Send + Clone + 'static, P: Persist = Clflush> {
    head: CachePadded<AtomicPtr<Node<T>>>,
    tail: CachePadded<AtomicPtr<Node<T>>>,

    removed: *mut RemovedSlot<T>,
    num_threads: usize,

    node_pool: *mut Node<T>,
    node_pool_size: usize,
    next_node: AtomicUsize,

    cell_pool: *mut Removed<T>,
    cell_pool_size: usize,
    next_cell: AtomicUsize,

    _persist: PhantomData<P>,
}

unsafe impl<T: Send + Clone + 'static, P: Persist> Send for DurableQueue<T, P> {}
unsafe impl<T: Send + Clone + 'static, P: Persist> Sync for DurableQueue<T, P> {}

impl<T: Send + Clone + 'static, P: Persist> DurableQueue<T, P> {
    /// Bytes needed for `num_threads` threads each performing at most
    /// `capacity` operations.
    pub fn shared_size(num_threads: usize, capacity: usize) -> usize {
        let mut total = 0usize;
        let bump = |total: &mut usize, size: usize, align: usize| {
            *total = (*total + align - 1) & !(align - 1);
            *total += size;
        };

        bump(&mut total, mem::size_of::<Self>(), mem::align_of::<Self>());
        bump(
            &mut total,
            num_threads * mem::size_of::<RemovedSlot<T>>(),
            mem::align_of::<RemovedSlot<T>>(),
        );
        bump(
            &mut total,
            (num_threads * capacity + 1) * mem::size_of::<Node<T>>(),
            mem::align_of::<Node<T>>(),
        );
        bump(
            &mut total,
            num_threads * capacity * mem::size_of::<Removed<T>>(),
            mem::align_of::<Removed<T>>(),
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
        let removed_ptr = align_and_advance(
            &mut offset,
            num_threads * mem::size_of::<RemovedSlot<T>>(),
            mem::align_of::<RemovedSlot<T>>(),
        ) as *mut RemovedSlot<T>;
        let node_pool_size = num_threads * capacity + 1;
        let pool_ptr = align_and_advance(
            &mut offset,
            node_pool_size * mem::size_of::<Node<T>>(),
            mem::align_of::<Node<T>>(),
        ) as *mut Node<T>;
        let cell_pool_size = num_threads * capacity;
        let cell_ptr = align_and_advance(
            &mut offset,
            cell_pool_size * mem::size_of::<Removed<T>>(),
            mem::align_of::<Removed<T>>(),
        ) as *mut Removed<T>;

        let dummy = pool_ptr;
        ptr::write(
            dummy,
            Node {
                value: None,
                next: AtomicPtr::new(ptr::null_mut()),
                thread_id: AtomicI32::new(-1),
            },
        );
        P::barrier(dummy);

        for i in 0..num_threads {
            let slot = removed_ptr.add(i);
            ptr::write(
                slot,
                RemovedSlot {
                    cell: AtomicPtr::new(ptr::null_mut()),
                },
            );
            P::barrier(slot);
        }

        ptr::addr_of_mut!((*q_ptr).head).write(CachePadded::new(AtomicPtr::new(dummy)));
        ptr::addr_of_mut!((*q_ptr).tail).write(CachePadded::new(AtomicPtr::new(dummy)));
        ptr::addr_of_mut!((*q_ptr).removed).write(removed_ptr);
        ptr::addr_of_mut!((*q_ptr).num_threads).write(num_threads);
        ptr::addr_of_mut!((*q_ptr).node_pool).write(pool_ptr);
        ptr::addr_of_mut!((*q_ptr).node_pool_size).write(node_pool_size);
        ptr::addr_of_mut!((*q_ptr).next_node).write(AtomicUsize::new(1));
        ptr::addr_of_mut!((*q_ptr).cell_pool).write(cell_ptr);
        ptr::addr_of_mut!((*q_ptr).cell_pool_size).write(cell_pool_size);
        ptr::addr_of_mut!((*q_ptr).next_cell).write(AtomicUsize::new(0));
        P::barrier(ptr::addr_of!((*q_ptr).head));
        P::barrier(ptr::addr_of!((*q_ptr).tail));

        &mut *q_ptr
    }

    unsafe fn allocate_node(&self, value: T) -> *mut Node<T> {
        let idx = self.next_node.fetch_add(1, Ordering::AcqRel);
        if idx >= self.node_pool_size {
            panic!("DurableQueue: node pool exhausted");
        }
        let node = self.node_pool.add(idx);
        ptr::write(
            node,
            Node {
                value: Some(value),
                next: AtomicPtr::new(ptr::null_mut()),
                thread_id: AtomicI32::new(-1),
            },
        );
        node
    }

    unsafe fn allocate_cell(&self) -> *mut Removed<T> {
        let idx = self.next_cell.fetch_add(1, Ordering::AcqRel);
        if idx >= self.cell_pool_size {
            panic!("DurableQueue: result cell pool exhausted");
        }
        let cell = self.cell_pool.add(idx);
        ptr::write(cell, Removed::Pending);
        cell
    }

    pub fn enqueue(&self, value: T) {
        let node = unsafe { self.allocate_node(value) };
        // The node contents must be durable before the node can become
        // reachable.
        P::barrier(node);
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
                    P::barrier_opt(unsafe { ptr::addr_of!((*last).next) });
                    let _ =
                        self.tail
                            .compare_exchange(last, node, Ordering::AcqRel, Ordering::Acquire);
                    return;
                }
            } else {
                // The link is visible but maybe not yet durable; flush it
                // before promoting the tail past it.
                P::barrier_opt(unsafe { ptr::addr_of!((*last).next) });
                let _ = self
                    .tail
                    .compare_exchange(last, next, Ordering::AcqRel, Ordering::Acquire);
            }
        }
    }

    pub fn dequeue(&self, thread_id: usize) -> Option<T> {
        debug_assert!(thread_id < self.num_threads);
        unsafe {
            let cell = self.allocate_cell();
            P::barrier(cell);
            let slot = &(*self.removed.add(thread_id)).cell;
            slot.store(cell, Ordering::Release);
            P::barrier(slot as *const AtomicPtr<Removed<T>>);

            loop {
                let first = self.head.load(Ordering::Acquire);
                let last = self.tail.load(Ordering::Acquire);
                let next = (*first).next.load(Ordering::Acquire);
                if first != self.head.load(Ordering::Acquire) {
                    continue;
                }
                if first == last {
                    if next.is_null() {
                        ptr::write(cell, Removed::Empty);
                        P::barrier(cell);
                        return None;
                    }
                    P::barrier_opt(ptr::addr_of!((*last).next));
                    let _ = self
                        .tail
                        .compare_exchange(last, next, Ordering::AcqRel, Ordering::Acquire);
                } else {
                    let value = (*next).value.clone().unwrap();
                    // Claiming the node is the removal; the head CAS below
                    // is bookkeeping that anyone may finish.
                    if (*next)
                        .thread_id
                        .compare_exchange(
                            -1,
                            thread_id as i32,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_ok()
                    {
                        P::barrier(ptr::addr_of!((*next).thread_id));
                        ptr::write(cell, Removed::Value(value.clone()));
                        P::barrier_opt(cell);
                        let _ = self.head.compare_exchange(
                            first,
                            next,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        );
                        return Some(value);
                    } else {
                        // Lost the claim; publish the winner's result into
                        // its cell so the winner's crash cannot lose it.
                        let winner = (*next).thread_id.load(Ordering::Acquire);
                        if winner >= 0 && self.head.load(Ordering::Acquire) == first {
                            P::barrier(ptr::addr_of!((*next).thread_id));
                            let wcell =
                                (*self.removed.add(winner as usize)).cell.load(Ordering::Acquire);
                            if !wcell.is_null() {
                                ptr::write(wcell, Removed::Value(value));
                                P::barrier_opt(wcell);
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
    }

    /// Reads the per-thread result cell. `None` when the thread has not
    /// yet started a dequeue on this queue.
    pub fn last_removed(&self, thread_id: usize) -> Option<Removed<T>> {
        unsafe {
            let cell = (*self.removed.add(thread_id)).cell.load(Ordering::Acquire);
            if cell.is_null() {
                None
            } else {
                Some((*cell).clone())
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

impl<T: Send + Clone + 'static, P: Persist> MpmcQueue<T> for DurableQueue<T, P> {
    type PushError = ();
    type PopError = ();

    fn push(&self, item: T, _thread_id: usize) -> Result<(), Self::PushError> {
        self.enqueue(item);
        Ok(())
    }

    fn pop(&self, thread_id: usize) -> Result<T, Self::PopError> {
        self.dequeue(thread_id).ok_or(())
    }

    fn is_empty(&self) -> bool {
        self.is_empty()
    }

    fn is_full(&self) -> bool {
        self.is_full()
    }
}
