//! # Multi-Version Layer
//!
//! This module provides the concurrency substrate the tree runs on:
//! snapshot-consistent reads, non-blocking writer intent, and safe
//! reclamation of retired node versions. The tree holds no locks of its
//! own — every synchronization decision is delegated here.
//!
//! ## Design Philosophy
//!
//! ### Readers Never Wait
//!
//! A read session samples the commit clock once and then resolves every
//! node pointer against that snapshot. A node being rewritten concurrently
//! is served from either its stable master or a committed shadow copy;
//! there is no reader-side retry and no reader-visible lock.
//!
//! ### Writers Fail Fast
//!
//! Writer intent on a node is a single compare-exchange installing a
//! private shadow copy. Contention does not queue: the loser gets `false`,
//! aborts its session, and restarts its operation. Commit makes all of a
//! session's shadows visible at one clock tick, then writes them back over
//! the masters once no live session can still be reading the old bytes.
//!
//! ```text
//!            try_lock                  reader_unlock (commit)
//!   master ──────────► master + shadow ──────────► master (new bytes)
//!     ▲                   │ edits land               shadow retired to
//!     │ deref (old        │ in shadow                the epoch collector
//!     │  snapshots)       ▼
//!     └── deref ◄── shadow (newer snapshots steal it after commit)
//! ```
//!
//! ### Reclamation
//!
//! Detached shadows are retired through `crossbeam_epoch`; sessions pin the
//! epoch for their duration, so a stalled reader holding a stolen shadow
//! keeps its memory alive without blocking anyone.
//!
//! ## Key Structures
//!
//! - [`Mvcc`]: process-wide layer state (clock, registry, allocator)
//! - [`ThreadHandle`]: per-thread session context and the consumed API
//!   (`reader_lock`, `reader_unlock`, `abort`, `deref`, `try_lock`,
//!   `assign_ptr`, `alloc_page`)
//! - `ObjectHeader`: per-page MV header prepended to every allocation

mod object;
mod registry;
mod session;

pub use registry::{Mvcc, MAX_THREADS};
pub use session::ThreadHandle;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn max_threads_is_sixty_four() {
        assert_eq!(MAX_THREADS, 64);
    }

    #[test]
    fn a_registered_thread_can_run_many_sessions() {
        let mvcc = Arc::new(Mvcc::new());
        let mut handle = mvcc.register().unwrap();
        for _ in 0..100 {
            handle.reader_lock();
            handle.reader_unlock();
        }
    }

    #[test]
    fn sessions_on_distinct_handles_are_independent() {
        let mvcc = Arc::new(Mvcc::new());
        let mut a = mvcc.register().unwrap();
        let mut b = mvcc.register().unwrap();
        a.reader_lock();
        b.reader_lock();
        b.reader_unlock();
        a.reader_unlock();
    }
}
