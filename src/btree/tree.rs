//! # Tree Protocol
//!
//! The concurrent B-tree: a master-root indirection plus the optimistic
//! top-down descent shared by insert and lookup.
//!
//! ## Master Root
//!
//! The tree permanently owns one interior node, the *master root*, whose
//! `children[0]` points at the current logical root (a leaf for a fresh
//! tree). Root replacement publishes a new interior into that one slot, so
//! the tree handle itself never changes and a reader that dereferenced the
//! old logical root mid-descent still completes inside its snapshot — the
//! old root remains a valid subtree of the new one.
//!
//! ## Insert Algorithm
//!
//! ```text
//! 1. Begin a read session; deref master root, then the logical root
//! 2. While at an interior node:
//!    - full? lock parent (if any) and node, split, install the separator
//!      into the parent (or promote a new root), commit, restart
//!    - descend into children[lower_bound(key)]
//! 3. At the leaf:
//!    - full? lock parent (if any) and leaf, split, install (or promote),
//!      commit, restart into the correct half
//!    - else lock the leaf, upsert in place, commit, done
//! ```
//!
//! Splitting eagerly on the way down keeps every parent non-full by the
//! time a child must hand it a separator, so one operation locks at most
//! two adjacent levels. Any failed try-lock aborts the session and
//! restarts the whole operation; restarts back off with a CPU pause and,
//! past a small threshold, a scheduler yield.
//!
//! ## Lookup
//!
//! The same descent without splits or locks. The MV layer guarantees the
//! snapshot stays consistent, so a lookup never restarts.
//!
//! ## Thread Safety
//!
//! `Tree` is `Send + Sync`; all mutation runs through MV-layer shadow
//! copies on nodes the session holds writer intent on. Operations take the
//! calling thread's registered [`ThreadHandle`].

use eyre::Result;
use std::ptr;
use std::sync::Arc;

use super::interior::InteriorNode;
use super::leaf::LeafNode;
use super::node::{Key, NodeKind, NodePtr, Payload};
use crate::mvcc::{Mvcc, ThreadHandle};

/// Restarts before backoff switches from a CPU pause to a scheduler yield.
const YIELD_THRESHOLD: u32 = 3;

enum Attempt {
    Done,
    Restart,
}

pub struct Tree {
    mvcc: Arc<Mvcc>,
    master_root: *mut InteriorNode,
}

// SAFETY: all shared node state is reached through the MV layer's
// snapshot/intent protocol; the master-root pointer itself is written only
// at construction.
unsafe impl Send for Tree {}
unsafe impl Sync for Tree {}

impl Tree {
    /// Allocate the master root and an initial empty leaf as the logical
    /// root.
    pub fn new(mvcc: Arc<Mvcc>) -> Result<Self> {
        let master_root = mvcc.alloc_page::<InteriorNode>()?;
        let first_leaf = mvcc.alloc_page::<LeafNode>()?;
        unsafe {
            master_root.write(InteriorNode::new());
            first_leaf.write(LeafNode::new());
            (*master_root).children[0] = first_leaf as NodePtr;
        }
        Ok(Self { mvcc, master_root })
    }

    /// Insert `key` with `payload`, overwriting on duplicate. Conflicts
    /// with concurrent writers are retried internally; only allocation
    /// failure surfaces.
    pub fn insert(&self, handle: &mut ThreadHandle, key: Key, payload: Payload) -> Result<()> {
        let mut restart_count = 0u32;
        loop {
            match self.insert_attempt(handle, key, payload)? {
                Attempt::Done => return Ok(()),
                Attempt::Restart => {
                    restart_count += 1;
                    backoff(restart_count);
                }
            }
        }
    }

    fn insert_attempt(
        &self,
        handle: &mut ThreadHandle,
        key: Key,
        payload: Payload,
    ) -> Result<Attempt> {
        handle.reader_lock();

        unsafe {
            let root = handle.deref(self.master_root);
            let mut node = handle.deref((*root).children[0]);
            let mut parent: *mut InteriorNode = ptr::null_mut();

            while (*node).kind == NodeKind::Interior {
                let mut inner = node as *mut InteriorNode;

                // Split eagerly if full
                if (*inner).is_full() {
                    if !parent.is_null() {
                        let mut locked_parent = parent;
                        if !handle.try_lock(&mut locked_parent) {
                            handle.abort();
                            return Ok(Attempt::Restart);
                        }
                        parent = locked_parent;
                    }
                    if !handle.try_lock(&mut inner) {
                        handle.abort();
                        return Ok(Attempt::Restart);
                    }
                    let new_inner = match handle.alloc_page::<InteriorNode>() {
                        Ok(page) => page,
                        Err(err) => {
                            handle.abort();
                            return Err(err);
                        }
                    };
                    new_inner.write(InteriorNode::new());
                    let sep = (*inner).split_into(&mut *new_inner);
                    if !parent.is_null() {
                        (*parent).insert(handle, sep, new_inner as NodePtr);
                    } else {
                        match self.make_root(handle, sep, inner as NodePtr, new_inner as NodePtr) {
                            Ok(true) => {}
                            Ok(false) => {
                                handle.abort();
                                return Ok(Attempt::Restart);
                            }
                            Err(err) => {
                                handle.abort();
                                return Err(err);
                            }
                        }
                    }
                    handle.reader_unlock();
                    return Ok(Attempt::Restart);
                }

                parent = inner;
                node = handle.deref((*inner).children[(*inner).lower_bound(key)]);
            }

            let mut leaf = node as *mut LeafNode;

            if (*leaf).is_full() {
                // Split the leaf and restart into the correct half.
                if !parent.is_null() {
                    let mut locked_parent = parent;
                    if !handle.try_lock(&mut locked_parent) {
                        handle.abort();
                        return Ok(Attempt::Restart);
                    }
                    parent = locked_parent;
                }
                if !handle.try_lock(&mut leaf) {
                    handle.abort();
                    return Ok(Attempt::Restart);
                }
                let new_leaf = match handle.alloc_page::<LeafNode>() {
                    Ok(page) => page,
                    Err(err) => {
                        handle.abort();
                        return Err(err);
                    }
                };
                new_leaf.write(LeafNode::new());
                let sep = (*leaf).split_into(&mut *new_leaf);
                if !parent.is_null() {
                    (*parent).insert(handle, sep, new_leaf as NodePtr);
                } else {
                    match self.make_root(handle, sep, leaf as NodePtr, new_leaf as NodePtr) {
                        Ok(true) => {}
                        Ok(false) => {
                            handle.abort();
                            return Ok(Attempt::Restart);
                        }
                        Err(err) => {
                            handle.abort();
                            return Err(err);
                        }
                    }
                }
                handle.reader_unlock();
                return Ok(Attempt::Restart);
            }

            if !handle.try_lock(&mut leaf) {
                handle.abort();
                return Ok(Attempt::Restart);
            }
            (*leaf).insert(key, payload);
        }

        handle.reader_unlock();
        Ok(Attempt::Done)
    }

    /// Promote the logical root: install a fresh interior with `left` and
    /// `right` under separator `sep` into the master root's only slot.
    /// Returns false when the master root cannot be locked.
    fn make_root(
        &self,
        handle: &mut ThreadHandle,
        sep: Key,
        left: NodePtr,
        right: NodePtr,
    ) -> Result<bool> {
        let mut root = self.master_root;
        if !unsafe { handle.try_lock(&mut root) } {
            return Ok(false);
        }
        let inner = handle.alloc_page::<InteriorNode>()?;
        unsafe {
            inner.write(InteriorNode::new());
            (*inner).header.count = 1;
            (*inner).keys[0] = sep;
            handle.assign_ptr(&mut (*inner).children[0], left);
            handle.assign_ptr(&mut (*inner).children[1], right);
            handle.assign_ptr(&mut (*root).children[0], inner as NodePtr);
        }
        Ok(true)
    }

    /// Current payload for `key`, if present.
    pub fn lookup(&self, handle: &mut ThreadHandle, key: Key) -> Option<Payload> {
        handle.reader_lock();
        let result = unsafe {
            let root = handle.deref(self.master_root);
            let mut node = handle.deref((*root).children[0]);

            while (*node).kind == NodeKind::Interior {
                let inner = node as *mut InteriorNode;
                node = handle.deref((*inner).children[(*inner).lower_bound(key)]);
            }

            let leaf = node as *mut LeafNode;
            let pos = (*leaf).lower_bound(key);
            if pos < (*leaf).count() && (*leaf).key_at(pos) == key {
                Some((*leaf).payload_at(pos))
            } else {
                None
            }
        };
        handle.reader_unlock();
        result
    }

    /// Copy up to `out.len()` payloads for keys >= `key` from the leaf that
    /// would hold `key`, lowest key first. Returns the number copied.
    /// Cross-leaf continuation is not attempted.
    pub fn scan(&self, handle: &mut ThreadHandle, key: Key, out: &mut [Payload]) -> u64 {
        handle.reader_lock();
        let copied = unsafe {
            let root = handle.deref(self.master_root);
            let mut node = handle.deref((*root).children[0]);

            while (*node).kind == NodeKind::Interior {
                let inner = node as *mut InteriorNode;
                node = handle.deref((*inner).children[(*inner).lower_bound(key)]);
            }

            let leaf = node as *mut LeafNode;
            let mut copied = 0usize;
            for index in (*leaf).lower_bound(key)..(*leaf).count() {
                if copied == out.len() {
                    break;
                }
                out[copied] = (*leaf).payload_at(index);
                copied += 1;
            }
            copied
        };
        handle.reader_unlock();
        copied as u64
    }

    /// The MV layer this tree allocates from.
    pub fn mvcc(&self) -> &Arc<Mvcc> {
        &self.mvcc
    }

    /// Number of levels from the logical root down to the leaves.
    pub fn height(&self, handle: &mut ThreadHandle) -> usize {
        handle.reader_lock();
        let mut depth = 1;
        unsafe {
            let root = handle.deref(self.master_root);
            let mut node = handle.deref((*root).children[0]);
            while (*node).kind == NodeKind::Interior {
                depth += 1;
                let inner = node as *mut InteriorNode;
                node = handle.deref((*inner).children[0]);
            }
        }
        handle.reader_unlock();
        depth
    }
}

impl Drop for Tree {
    fn drop(&mut self) {
        // Exclusive access: no session can be live once the tree is
        // dropped. Masters are freed directly; retired shadows belong to
        // the epoch collector.
        unsafe {
            free_subtree((*self.master_root).children[0]);
            Mvcc::free_page(self.master_root);
        }
    }
}

unsafe fn free_subtree(node: NodePtr) {
    if (*node).kind == NodeKind::Interior {
        let inner = node as *mut InteriorNode;
        for index in 0..=(*inner).count() {
            free_subtree((*inner).children[index]);
        }
    }
    Mvcc::free_page(node);
}

fn backoff(restart_count: u32) {
    if restart_count > YIELD_THRESHOLD {
        std::thread::yield_now();
    } else {
        std::hint::spin_loop();
    }
}
