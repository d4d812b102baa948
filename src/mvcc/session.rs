//! # Read Sessions and Writer Intent
//!
//! A [`ThreadHandle`] is the per-thread face of the MV layer. Every tree
//! operation runs inside a read session bracketed by `reader_lock` and
//! `reader_unlock` (or `abort`); within the session all node pointers are
//! resolved through `deref` and all mutations go through shadow copies
//! acquired with `try_lock`.
//!
//! ## Visibility Protocol
//!
//! A session samples the commit clock once at `reader_lock`; that sample is
//! its snapshot. `deref` resolves a node to:
//!
//! - its own shadow copy, if this session holds writer intent on it;
//! - another writer's shadow copy, if that writer's published commit clock
//!   is at or below the snapshot (the commit is part of this snapshot even
//!   though its write-back may still be in flight);
//! - the master otherwise.
//!
//! ## Commit
//!
//! `reader_unlock` on a session that acquired writer intent commits it:
//!
//! 1. leave the read section (so other committers stop waiting on us),
//! 2. publish the commit clock, then advance the global clock,
//! 3. wait until every concurrent session with an older snapshot ends —
//!    such sessions may be reading the masters we are about to overwrite,
//! 4. write each shadow back over its master, stamp the master's version,
//!    detach the shadow, and hand it to the epoch collector,
//! 5. clear the published commit clock.
//!
//! Readers that stole a shadow in step 3's window may still hold the
//! pointer after step 4 frees it logically; shadows are therefore retired
//! through `crossbeam_epoch` and destroyed only once every session pinned
//! at detach time has ended.
//!
//! ## Failure Signaling
//!
//! `try_lock` never blocks: a node already locked by another session, or
//! one whose committed version is newer than the snapshot, is a conflict
//! and returns false. The caller aborts the session and restarts its whole
//! operation.

use crossbeam_epoch::{self as epoch, Guard};
use eyre::Result;
use smallvec::SmallVec;
use std::mem;
use std::ptr;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use super::object::{self, header_of};
use super::registry::{Mvcc, ThreadCtl, CLOCK_IDLE, CLOCK_PENDING, NO_WRITER};

struct LockEntry {
    master: *mut u8,
    shadow: *mut u8,
}

/// Per-thread session context. One per registered thread; `Send` so worker
/// threads can own theirs, but not `Sync`.
pub struct ThreadHandle {
    mvcc: Arc<Mvcc>,
    slot: usize,
    snapshot: u64,
    guard: Option<Guard>,
    write_log: SmallVec<[LockEntry; 8]>,
    alloc_log: SmallVec<[*mut u8; 4]>,
}

// SAFETY: the raw pointers in the logs are session-private and the shared
// state they reference is owned by the Arc'd layer. The epoch guard pins
// the pinning thread's participant, so a handle must not move across
// threads while a session is open; between sessions the guard is None.
unsafe impl Send for ThreadHandle {}

impl ThreadHandle {
    pub(crate) fn new(mvcc: Arc<Mvcc>, slot: usize) -> Self {
        Self {
            mvcc,
            slot,
            snapshot: 0,
            guard: None,
            write_log: SmallVec::new(),
            alloc_log: SmallVec::new(),
        }
    }

    pub(crate) fn slot(&self) -> usize {
        self.slot
    }

    fn ctl(&self) -> &ThreadCtl {
        &self.mvcc.threads[self.slot]
    }

    /// Begin a read session. All derefs until `reader_unlock`/`abort`
    /// observe a consistent snapshot.
    pub fn reader_lock(&mut self) {
        debug_assert!(self.guard.is_none(), "read sessions do not nest");
        self.guard = Some(epoch::pin());
        let ctl = self.ctl();
        // Publish activity before sampling: a committer that saw this
        // thread idle is guaranteed that the sample below observes its
        // clock advance.
        ctl.local_clock.store(CLOCK_PENDING, Ordering::SeqCst);
        let now = self.mvcc.clock.load(Ordering::SeqCst);
        ctl.local_clock.store(now, Ordering::SeqCst);
        self.snapshot = now;
    }

    /// End the session, committing any writer intent acquired during it.
    pub fn reader_unlock(&mut self) {
        debug_assert!(self.guard.is_some(), "reader_unlock without a session");
        // Leave the read section first so concurrent committers stop
        // waiting on this thread.
        self.ctl().local_clock.store(CLOCK_IDLE, Ordering::SeqCst);
        if !self.write_log.is_empty() {
            self.commit();
        }
        self.alloc_log.clear();
        self.guard = None;
    }

    /// Discard all uncommitted writes and end the session.
    pub fn abort(&mut self) {
        debug_assert!(self.guard.is_some(), "abort without a session");
        self.ctl().local_clock.store(CLOCK_IDLE, Ordering::SeqCst);
        let guard = self.guard.as_ref().unwrap(); // INVARIANT: asserted above
        for entry in self.write_log.drain(..) {
            unsafe {
                header_of(entry.master)
                    .copy
                    .store(ptr::null_mut(), Ordering::Release);
                let shadow = entry.shadow;
                guard.defer_unchecked(move || object::free_object(shadow));
            }
        }
        for page in self.alloc_log.drain(..) {
            // Only the discarded shadows could have referenced it.
            unsafe { object::free_object(page) };
        }
        self.guard = None;
    }

    /// Resolve `ptr` to the node version visible at this session's
    /// snapshot.
    ///
    /// # Safety
    /// `ptr` must point at the data of a live MV object and a read session
    /// must be open.
    pub unsafe fn deref<T>(&self, ptr: *mut T) -> *mut T {
        debug_assert!(self.guard.is_some(), "deref outside a read session");
        let master = object::master_of(ptr as *mut u8);
        let shadow = header_of(master).copy.load(Ordering::Acquire);
        if shadow.is_null() {
            return master as *mut T;
        }
        let writer = header_of(shadow).writer;
        if ptr::eq(writer, self.ctl()) {
            return shadow as *mut T;
        }
        // Steal the shadow iff its writer committed at or before our
        // snapshot; in-flight sessions publish NO_WRITER.
        if (*writer).write_clock.load(Ordering::SeqCst) <= self.snapshot {
            return shadow as *mut T;
        }
        master as *mut T
    }

    /// Acquire writer intent on the node `*ptr` refers to. On success,
    /// `*ptr` is redirected to a private shadow copy for in-place edits;
    /// the intent commits at `reader_unlock`. Returns false on conflict:
    /// the node is locked by another session or has a committed version
    /// newer than this session's snapshot.
    ///
    /// # Safety
    /// `*ptr` must point at the data of a live MV object and a read session
    /// must be open.
    pub unsafe fn try_lock<T>(&mut self, ptr: &mut *mut T) -> bool {
        debug_assert!(self.guard.is_some(), "try_lock outside a read session");
        let master = object::master_of(*ptr as *mut u8);
        let header = header_of(master);

        let existing = header.copy.load(Ordering::Acquire);
        if !existing.is_null() {
            if ptr::eq(header_of(existing).writer, self.ctl()) {
                // Already locked by this session.
                *ptr = existing as *mut T;
                return true;
            }
            return false;
        }

        let shadow = object::alloc_shadow(master, self.ctl());
        if header
            .copy
            .compare_exchange(ptr::null_mut(), shadow, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            // Never installed; no other session saw it.
            object::free_object(shadow);
            return false;
        }

        // Holding the lock freezes the master, but it may already carry a
        // commit newer than what this session observed before locking.
        if header.version.load(Ordering::SeqCst) > self.snapshot {
            header.copy.store(ptr::null_mut(), Ordering::Release);
            let guard = self.guard.as_ref().unwrap(); // INVARIANT: asserted above
            guard.defer_unchecked(move || object::free_object(shadow));
            return false;
        }

        // Installed and validated: no write-back can race this read.
        ptr::copy_nonoverlapping(master, shadow, header.size);
        self.write_log.push(LockEntry { master, shadow });
        *ptr = shadow as *mut T;
        true
    }

    /// Publish a pointer into an MV-managed slot, normalized to the master
    /// object so published structure never references a session-private
    /// shadow.
    ///
    /// # Safety
    /// `value` must point at the data of a live MV object; `slot` must be
    /// writable by this session (inside a locked shadow or a node it
    /// allocated and has not published).
    pub unsafe fn assign_ptr<T>(&self, slot: &mut *mut T, value: *mut T) {
        *slot = object::master_of(value as *mut u8) as *mut T;
    }

    /// Allocate one MV-managed page. Pages allocated inside a session are
    /// reclaimed again if the session aborts.
    pub fn alloc_page<T>(&mut self) -> Result<*mut T> {
        let page = object::alloc_master(mem::size_of::<T>())?;
        if self.guard.is_some() {
            self.alloc_log.push(page);
        }
        Ok(page as *mut T)
    }

    fn commit(&mut self) {
        let write_clock = self.mvcc.clock.load(Ordering::SeqCst) + 1;
        self.mvcc.threads[self.slot]
            .write_clock
            .store(write_clock, Ordering::SeqCst);
        self.mvcc.clock.fetch_add(1, Ordering::SeqCst);
        self.wait_for_older_readers(write_clock);

        let guard = self.guard.as_ref().unwrap(); // INVARIANT: commit runs inside reader_unlock
        for entry in self.write_log.drain(..) {
            unsafe {
                let header = header_of(entry.master);
                ptr::copy_nonoverlapping(entry.shadow, entry.master, header.size);
                header.version.store(write_clock, Ordering::SeqCst);
                header.copy.store(ptr::null_mut(), Ordering::Release);
                let shadow = entry.shadow;
                guard.defer_unchecked(move || object::free_object(shadow));
            }
        }
        self.mvcc.threads[self.slot]
            .write_clock
            .store(NO_WRITER, Ordering::SeqCst);
    }

    /// Spin until every other registered thread is idle or running a
    /// session that already includes this commit. Sessions with older
    /// snapshots read the masters this commit is about to overwrite.
    fn wait_for_older_readers(&self, write_clock: u64) {
        for (idx, ctl) in self.mvcc.threads.iter().enumerate() {
            if idx == self.slot {
                continue;
            }
            while ctl.in_use.load(Ordering::SeqCst)
                && ctl.local_clock.load(Ordering::SeqCst) < write_clock
            {
                std::hint::spin_loop();
            }
        }
    }
}

impl Drop for ThreadHandle {
    fn drop(&mut self) {
        if self.guard.is_some() {
            self.abort();
        }
        self.mvcc.deregister(self.slot);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::sync::Barrier;
    use std::thread;

    #[repr(C)]
    struct Cell {
        value: u64,
    }

    fn cell_page(mvcc: &Arc<Mvcc>, value: u64) -> *mut Cell {
        let page = mvcc.alloc_page::<Cell>().unwrap();
        unsafe { page.write(Cell { value }) };
        page
    }

    #[test]
    fn reader_lock_publishes_the_sampled_clock() {
        let mvcc = Arc::new(Mvcc::new());
        let mut handle = mvcc.register().unwrap();
        handle.reader_lock();
        let published = mvcc.threads[handle.slot()].local_clock.load(Ordering::SeqCst);
        assert_eq!(published, mvcc.clock.load(Ordering::SeqCst));
        handle.reader_unlock();
        let idle = mvcc.threads[handle.slot()].local_clock.load(Ordering::SeqCst);
        assert_eq!(idle, CLOCK_IDLE);
    }

    #[test]
    fn deref_of_unlocked_node_returns_the_master() {
        let mvcc = Arc::new(Mvcc::new());
        let mut handle = mvcc.register().unwrap();
        let page = cell_page(&mvcc, 7);
        handle.reader_lock();
        let seen = unsafe { handle.deref(page) };
        assert_eq!(seen, page);
        handle.reader_unlock();
        unsafe { Mvcc::free_page(page) };
    }

    #[test]
    fn try_lock_redirects_to_a_shadow_and_deref_follows_it() {
        let mvcc = Arc::new(Mvcc::new());
        let mut handle = mvcc.register().unwrap();
        let page = cell_page(&mvcc, 7);

        handle.reader_lock();
        let mut p = page;
        assert!(unsafe { handle.try_lock(&mut p) });
        assert_ne!(p, page);
        unsafe {
            (*p).value = 8;
            // The session's own deref resolves to its shadow...
            assert_eq!((*handle.deref(page)).value, 8);
            // ...while the master still holds the committed value.
            assert_eq!((*page).value, 7);
        }
        handle.reader_unlock();

        unsafe { assert_eq!((*page).value, 8) };
        unsafe { Mvcc::free_page(page) };
    }

    #[test]
    fn try_lock_twice_in_one_session_returns_the_same_shadow() {
        let mvcc = Arc::new(Mvcc::new());
        let mut handle = mvcc.register().unwrap();
        let page = cell_page(&mvcc, 1);

        handle.reader_lock();
        let mut first = page;
        let mut second = page;
        unsafe {
            assert!(handle.try_lock(&mut first));
            assert!(handle.try_lock(&mut second));
        }
        assert_eq!(first, second);
        handle.reader_unlock();
        unsafe { Mvcc::free_page(page) };
    }

    #[test]
    fn try_lock_conflicts_with_a_concurrent_holder() {
        let mvcc = Arc::new(Mvcc::new());
        let mut a = mvcc.register().unwrap();
        let mut b = mvcc.register().unwrap();
        let page = cell_page(&mvcc, 1);

        a.reader_lock();
        b.reader_lock();
        let mut pa = page;
        assert!(unsafe { a.try_lock(&mut pa) });
        let mut pb = page;
        assert!(!unsafe { b.try_lock(&mut pb) });
        b.abort();
        a.reader_unlock();

        unsafe { Mvcc::free_page(page) };
    }

    #[test]
    fn abort_discards_shadow_edits() {
        let mvcc = Arc::new(Mvcc::new());
        let mut handle = mvcc.register().unwrap();
        let page = cell_page(&mvcc, 7);

        handle.reader_lock();
        let mut p = page;
        assert!(unsafe { handle.try_lock(&mut p) });
        unsafe { (*p).value = 99 };
        handle.abort();

        handle.reader_lock();
        unsafe { assert_eq!((*handle.deref(page)).value, 7) };
        handle.reader_unlock();
        unsafe { Mvcc::free_page(page) };
    }

    #[test]
    fn commit_stamps_the_master_version() {
        let mvcc = Arc::new(Mvcc::new());
        let mut handle = mvcc.register().unwrap();
        let page = cell_page(&mvcc, 1);

        handle.reader_lock();
        let mut p = page;
        assert!(unsafe { handle.try_lock(&mut p) });
        unsafe { (*p).value = 2 };
        handle.reader_unlock();

        unsafe {
            let version = header_of(page as *mut u8).version.load(Ordering::SeqCst);
            assert!(version > 0);
            assert!(version <= mvcc.clock.load(Ordering::SeqCst));
        }
        unsafe { Mvcc::free_page(page) };
    }

    #[test]
    fn aborted_session_allocations_are_reclaimed() {
        let mvcc = Arc::new(Mvcc::new());
        let mut handle = mvcc.register().unwrap();
        handle.reader_lock();
        let _page = handle.alloc_page::<Cell>().unwrap();
        handle.abort();
        // The page was freed by the abort; nothing to assert beyond not
        // crashing under the allocator.
    }

    #[test]
    fn snapshot_readers_do_not_observe_in_flight_commits() {
        let mvcc = Arc::new(Mvcc::new());
        let page = cell_page(&mvcc, 7);
        let page_addr = page as usize;

        let start = Arc::new(Barrier::new(2));
        let locked = Arc::new(AtomicBool::new(false));

        let writer_mvcc = Arc::clone(&mvcc);
        let writer_start = Arc::clone(&start);
        let writer_locked = Arc::clone(&locked);
        let writer = thread::spawn(move || {
            let mut handle = writer_mvcc.register().unwrap();
            let page = page_addr as *mut Cell;
            writer_start.wait();
            handle.reader_lock();
            let mut p = page;
            assert!(unsafe { handle.try_lock(&mut p) });
            unsafe { (*p).value = 8 };
            writer_locked.store(true, Ordering::SeqCst);
            // Commit; the write-back waits for the reader below to end its
            // session.
            handle.reader_unlock();
        });

        let mut reader = mvcc.register().unwrap();
        reader.reader_lock();
        start.wait();
        while !locked.load(Ordering::SeqCst) {
            std::hint::spin_loop();
        }
        // The writer holds an uncommitted shadow; our snapshot predates it.
        unsafe { assert_eq!((*reader.deref(page)).value, 7) };
        reader.reader_unlock();

        writer.join().unwrap();

        reader.reader_lock();
        unsafe { assert_eq!((*reader.deref(page)).value, 8) };
        reader.reader_unlock();
        unsafe { Mvcc::free_page(page) };
    }
}
