use std::mem;
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

use crossbeam_utils::CachePadded;

use crate::MpmcQueue;

// Node structure shared by head/tail chain. The dummy node carries no
// value.
#[repr(C, align(64))]
struct Node<T> {
    value: Option<T>,
    next: AtomicPtr<Node<T>>,
}

// The baseline lock-free FIFO queue. Nodes live in a pool carved out of
// the caller-provided memory region and are never reclaimed.
#[repr(C)]
pub struct MsQueue<T: Send + Clone + 'static> {
    head: CachePadded<AtomicPtr<Node<T>>>,
    tail: CachePadded<AtomicPtr<Node<T>>>,

    node_pool: *mut Node<T>,
    node_pool_size: usize,
    next_node: AtomicUsize,
}

unsafe impl<T: Send + Clone + 'static> Send for MsQueue<T> {}
unsafe impl<T: Send + Clone + 'static> Sync for MsQueue<T> {}

impl<T: Send + Clone + 'static> MsQueue<T> {
    /// Bytes needed for a queue holding at most `capacity` enqueued nodes.
    pub fn shared_size(capacity: usize) -> usize {
        let mut total = 0usize;

        let self_align = mem::align_of::<Self>();
        total = (total + self_align - 1) & !(self_align - 1);
        total += mem::size_of::<Self>();

        let node_align = mem::align_of::<Node<T>>();
        total = (total + node_align - 1) & !(node_align - 1);
        total += (capacity + 1) * mem::size_of::<Node<T>>();

        (total + 4095) & !4095
    }

    /// Constructs the queue inside `mem`, which must be at least
    /// `shared_size(capacity)` bytes and page aligned.
    pub unsafe fn init_in_shared(mem_ptr: *mut u8, capacity: usize) -> &'static mut Self {
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
        let pool_ptr = align_and_advance(
            &mut offset,
            (capacity + 1) * mem::size_of::<Node<T>>(),
            mem::align_of::<Node<T>>(),
        ) as *mut Node<T>;

        // Slot 0 of the pool is the initial dummy node.
        let dummy = pool_ptr;
        ptr::write(
            dummy,
            Node {
                value: None,
                next: AtomicPtr::new(ptr::null_mut()),
            },
        );

        ptr::addr_of_mut!((*q_ptr).head).write(CachePadded::new(AtomicPtr::new(dummy)));
        ptr::addr_of_mut!((*q_ptr).tail).write(CachePadded::new(AtomicPtr::new(dummy)));
        ptr::addr_of_mut!((*q_ptr).node_pool).write(pool_ptr);
        ptr::addr_of_mut!((*q_ptr).node_pool_size).write(capacity + 1);
        ptr::addr_of_mut!((*q_ptr).next_node).write(AtomicUsize::new(1));

        &mut *q_ptr
    }

    unsafe fn allocate_node(&self, value: T) -> *mut Node<T> {
        let idx = self.next_node.fetch_add(1, Ordering::AcqRel);
        if idx >= self.node_pool_size {
            panic!("MsQueue: node pool exhausted");
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
            } else {
                // Tail is lagging, help promote it.
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

    pub fn is_empty(&self) -> bool {
        let head = self.head.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Acquire);
        head == tail && unsafe { (*head).next.load(Ordering::Acquire).is_null() }
    }

    pub fn is_full(&self) -> bool {
        self.next_node.load(Ordering::Acquire) >= self.node_pool_size
    }
}

impl<T: Send + Clone + 'static> MpmcQueue<T> for MsQueue<T> {
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
