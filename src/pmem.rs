//! Persistence primitive for NVM-resident data structures.
//!
//! Durability is built out of two hardware operations: a cache-line
//! writeback of a single address and a store fence. The queues only ever
//! use them through the two composites `barrier` (writeback + fence) and
//! `barrier_opt` (writeback only, for call sites where a later fence or a
//! CAS is known to order the store anyway).

use std::sync::atomic::{fence, Ordering};

/// A persistence mode. Implementors provide the two hardware operations;
/// the composites are derived. The mode is injected into each queue as a
/// type parameter so tests can substitute an instrumented model.
pub trait Persist: Send + Sync + 'static {
    /// Write back the cache line containing `addr`.
    fn flush(addr: *const u8);

    /// Order all prior stores before any subsequent store.
    fn fence();

    /// Writeback followed by a fence. After this returns, the pointed-to
    /// cache line survives a crash.
    #[inline]
    fn barrier<U>(addr: *const U) {
        Self::flush(addr.cast());
        Self::fence();
    }

    /// Writeback without a fence.
    #[inline]
    fn barrier_opt<U>(addr: *const U) {
        Self::flush(addr.cast());
    }
}

/// Cache-line writeback via `clflush`, fences via `sfence`. The default
/// mode on x86-64; elsewhere both operations degrade to a full memory
/// fence.
pub struct Clflush;

impl Persist for Clflush {
    #[inline]
    fn flush(addr: *const u8) {
        #[cfg(target_arch = "x86_64")]
        unsafe {
            core::arch::x86_64::_mm_clflush(addr)
        };
        #[cfg(not(target_arch = "x86_64"))]
        {
            let _ = addr;
            fence(Ordering::SeqCst);
        }
    }

    #[inline]
    fn fence() {
        #[cfg(target_arch = "x86_64")]
        unsafe {
            core::arch::x86_64::_mm_sfence()
        };
        #[cfg(not(target_arch = "x86_64"))]
        fence(Ordering::SeqCst);
    }
}

/// Store fences only, no writebacks. For machines without NVM where the
/// persistence calls still have to order stores.
pub struct FenceOnly;

impl Persist for FenceOnly {
    #[inline]
    fn flush(_addr: *const u8) {}

    #[inline]
    fn fence() {
        fence(Ordering::SeqCst);
    }
}
