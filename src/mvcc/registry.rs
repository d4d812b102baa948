//! # Clock and Thread Registry
//!
//! Global state of the MV layer: the commit clock and a fixed slot array of
//! per-thread control blocks. Threads register before touching the tree and
//! release their slot when the handle drops.
//!
//! ## Memory Layout
//!
//! ```text
//! Mvcc {
//!     clock:     AtomicU64,                  // 8 bytes
//!     threads:   [ThreadCtl; 64],            // 64 * 24 bytes
//!     slot_lock: Mutex<()>,                  // parking_lot, one word
//! }
//! ```
//!
//! The array is fixed so a control block's address stays valid for the
//! lifetime of the layer — shadow copies embed raw pointers to their
//! writer's control block, and concurrent readers chase those pointers
//! while deciding which version of a node to return.
//!
//! ## Clock Protocol
//!
//! - `clock`: monotonically increasing commit clock, advanced once per
//!   writing session at commit.
//! - `local_clock`: the snapshot a running read session observes;
//!   `CLOCK_IDLE` between sessions, `CLOCK_PENDING` for the instant between
//!   entering a session and sampling the clock (so committers treat the
//!   thread as older than any commit until its sample is published).
//! - `write_clock`: the commit clock of an in-flight commit; `NO_WRITER`
//!   otherwise. Readers compare it against their snapshot to decide whether
//!   to steal a shadow copy.

use eyre::{bail, Result};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use super::object;
use super::session::ThreadHandle;

/// Hard limit on concurrently registered threads.
pub const MAX_THREADS: usize = 64;

/// Snapshot clock published by a thread with no open session.
pub(crate) const CLOCK_IDLE: u64 = u64::MAX;

/// Snapshot clock published while a session is starting but has not sampled
/// the commit clock yet. Compares below every possible commit.
pub(crate) const CLOCK_PENDING: u64 = 0;

/// Write clock published by a thread with no commit in flight.
pub(crate) const NO_WRITER: u64 = u64::MAX;

/// Per-thread control block. Shadow copies point at these, so they live in
/// a fixed array for the lifetime of the layer.
pub(crate) struct ThreadCtl {
    pub(crate) local_clock: AtomicU64,
    pub(crate) write_clock: AtomicU64,
    pub(crate) in_use: AtomicBool,
}

/// The multi-version layer: commit clock, thread registry, and allocator
/// entry points. Shared across threads behind an `Arc`.
pub struct Mvcc {
    pub(crate) clock: AtomicU64,
    pub(crate) threads: [ThreadCtl; MAX_THREADS],
    slot_lock: Mutex<()>,
}

impl Mvcc {
    #[allow(clippy::declare_interior_mutable_const)]
    pub fn new() -> Self {
        const INIT: ThreadCtl = ThreadCtl {
            local_clock: AtomicU64::new(CLOCK_IDLE),
            write_clock: AtomicU64::new(NO_WRITER),
            in_use: AtomicBool::new(false),
        };
        Self {
            clock: AtomicU64::new(1),
            #[allow(clippy::borrow_interior_mutable_const)]
            threads: [INIT; MAX_THREADS],
            slot_lock: Mutex::new(()),
        }
    }

    /// Register the calling thread, claiming one control slot. The returned
    /// handle releases the slot on drop.
    pub fn register(self: &Arc<Self>) -> Result<ThreadHandle> {
        let _guard = self.slot_lock.lock();
        for (idx, ctl) in self.threads.iter().enumerate() {
            if !ctl.in_use.load(Ordering::Relaxed) {
                ctl.local_clock.store(CLOCK_IDLE, Ordering::SeqCst);
                ctl.write_clock.store(NO_WRITER, Ordering::SeqCst);
                ctl.in_use.store(true, Ordering::SeqCst);
                return Ok(ThreadHandle::new(Arc::clone(self), idx));
            }
        }
        bail!("too many registered threads (max {})", MAX_THREADS)
    }

    pub(crate) fn deregister(&self, slot: usize) {
        self.threads[slot].in_use.store(false, Ordering::SeqCst);
    }

    /// Allocate one MV-managed page outside any session (construction
    /// time). In-session allocation goes through [`ThreadHandle`] so an
    /// abort can reclaim it.
    pub fn alloc_page<T>(&self) -> Result<*mut T> {
        Ok(object::alloc_master(std::mem::size_of::<T>())? as *mut T)
    }

    /// Free a master page.
    ///
    /// # Safety
    /// No live session may be able to observe the page.
    pub unsafe fn free_page<T>(ptr: *mut T) {
        object::free_object(ptr as *mut u8);
    }
}

impl Default for Mvcc {
    fn default() -> Self {
        Self::new()
    }
}
