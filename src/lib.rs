pub mod pmem;

pub mod buffered_queue;
pub mod detectable_queue;
pub mod durable_queue;
pub mod ms_queue;

pub use buffered_queue::BufferedQueue;
pub use detectable_queue::{DetectableQueue, LastOp, LogSlot};
pub use durable_queue::{DurableQueue, Removed};
pub use ms_queue::MsQueue;
pub use pmem::{Clflush, FenceOnly, Persist};

// Upper bound for the thread ids that index the per-thread arrays.
pub const MAX_THREADS: usize = 64;

pub const CACHE_LINE_SIZE: usize = 64;

// Common interface for all MPMC queues. Thread ids must be unique, in
// [0, num_threads), and stable for the lifetime of the queue.
pub trait MpmcQueue<T: Send>: Send + Sync + 'static {
    // Error on push, e.g., when a node pool is exhausted.
    type PushError;
    // Error on pop when the queue is empty.
    type PopError;

    fn push(&self, item: T, thread_id: usize) -> Result<(), Self::PushError>;
    fn pop(&self, thread_id: usize) -> Result<T, Self::PopError>;

    // Returns `true` if the queue is observed empty.
    fn is_empty(&self) -> bool;

    // Returns `true` if the queue cannot accept more items at the moment.
    fn is_full(&self) -> bool;
}
