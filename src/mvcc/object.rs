//! # MV Object Layout
//!
//! Every page handed out by the MV layer is one heap object laid out as an
//! [`ObjectHeader`] immediately followed by the page data. Tree code only
//! ever holds data pointers; the layer recovers the header by fixed offset.
//!
//! ## Masters and Shadows
//!
//! The object a pointer slot publishes is the *master*. Writers never edit
//! a master in place: `try_lock` installs a private *shadow* object holding
//! a copy of the page, edits land in the shadow, and commit writes the
//! shadow back over the master. Both object kinds share the header layout:
//!
//! ```text
//! +----------------------------- ObjectHeader ----------------------------+
//! | master  : data ptr of the owning master (self for masters)            |
//! | writer  : shadows: control block of the locking thread                |
//! | copy    : masters: installed shadow, null if unlocked (the lock word) |
//! | version : masters: commit clock of the last committed write           |
//! | size    : page data size in bytes                                     |
//! +------------------------------------------------------------------------+
//! | page data (size bytes)                                                 |
//! +------------------------------------------------------------------------+
//! ```
//!
//! The `copy` slot doubles as the per-node lock: installing a shadow with a
//! compare-exchange acquires writer intent, and a non-null slot means some
//! session holds it. Shadow content is copied from the master only after a
//! successful install, when no write-back can be racing the read.

use eyre::{ensure, Result};
use std::alloc::{alloc, alloc_zeroed, dealloc, handle_alloc_error, Layout};
use std::mem;
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicU64};

use super::registry::ThreadCtl;

pub(crate) const OBJ_ALIGN: usize = 8;

#[repr(C)]
pub(crate) struct ObjectHeader {
    /// Data pointer of the owning master; masters point at their own data.
    pub(crate) master: *mut u8,
    /// Shadows: control block of the thread holding writer intent.
    pub(crate) writer: *const ThreadCtl,
    /// Masters: the installed shadow copy, null when unlocked.
    pub(crate) copy: AtomicPtr<u8>,
    /// Masters: commit clock of the last committed write.
    pub(crate) version: AtomicU64,
    /// Page data size in bytes.
    pub(crate) size: usize,
}

pub(crate) const OBJ_HEADER_SIZE: usize = mem::size_of::<ObjectHeader>();

fn obj_layout(size: usize) -> Layout {
    // INVARIANT: OBJ_ALIGN is a power of two and page sizes are tiny
    Layout::from_size_align(OBJ_HEADER_SIZE + size, OBJ_ALIGN).unwrap()
}

/// Header of the object whose data starts at `data`.
///
/// # Safety
/// `data` must point at the data area of a live MV object.
pub(crate) unsafe fn header_of<'a>(data: *mut u8) -> &'a ObjectHeader {
    &*(data.sub(OBJ_HEADER_SIZE) as *const ObjectHeader)
}

/// Master data pointer behind `data`, which may itself be a master or a
/// shadow.
///
/// # Safety
/// `data` must point at the data area of a live MV object.
pub(crate) unsafe fn master_of(data: *mut u8) -> *mut u8 {
    header_of(data).master
}

/// Allocate a zeroed master object of `size` data bytes.
pub(crate) fn alloc_master(size: usize) -> Result<*mut u8> {
    let layout = obj_layout(size);
    unsafe {
        let raw = alloc_zeroed(layout);
        ensure!(!raw.is_null(), "page allocation failed ({} bytes)", layout.size());
        let data = raw.add(OBJ_HEADER_SIZE);
        (raw as *mut ObjectHeader).write(ObjectHeader {
            master: data,
            writer: ptr::null(),
            copy: AtomicPtr::new(ptr::null_mut()),
            version: AtomicU64::new(0),
            size,
        });
        Ok(data)
    }
}

/// Allocate a shadow object for `master`. The page data is left
/// uninitialized; the caller copies it from the master once the shadow is
/// installed.
///
/// # Safety
/// `master` must point at the data area of a live master object and
/// `writer` at a control block that outlives the shadow.
pub(crate) unsafe fn alloc_shadow(master: *mut u8, writer: *const ThreadCtl) -> *mut u8 {
    let size = header_of(master).size;
    let layout = obj_layout(size);
    let raw = alloc(layout);
    if raw.is_null() {
        handle_alloc_error(layout);
    }
    let data = raw.add(OBJ_HEADER_SIZE);
    (raw as *mut ObjectHeader).write(ObjectHeader {
        master,
        writer,
        copy: AtomicPtr::new(ptr::null_mut()),
        version: AtomicU64::new(0),
        size,
    });
    data
}

/// Free one MV object (master or shadow) given its data pointer.
///
/// # Safety
/// No live session may be able to observe the object.
pub(crate) unsafe fn free_object(data: *mut u8) {
    let size = header_of(data).size;
    dealloc(data.sub(OBJ_HEADER_SIZE), obj_layout(size));
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;

    #[test]
    fn master_header_points_at_own_data() {
        let data = alloc_master(64).unwrap();
        unsafe {
            let header = header_of(data);
            assert_eq!(header.master, data);
            assert!(header.writer.is_null());
            assert!(header.copy.load(Ordering::Relaxed).is_null());
            assert_eq!(header.version.load(Ordering::Relaxed), 0);
            assert_eq!(header.size, 64);
            free_object(data);
        }
    }

    #[test]
    fn master_data_is_zeroed_and_aligned() {
        let data = alloc_master(32).unwrap();
        unsafe {
            assert_eq!(data as usize % OBJ_ALIGN, 0);
            for i in 0..32 {
                assert_eq!(*data.add(i), 0);
            }
            free_object(data);
        }
    }

    #[test]
    fn shadow_resolves_to_its_master() {
        let master = alloc_master(16).unwrap();
        unsafe {
            let shadow = alloc_shadow(master, ptr::null());
            assert_eq!(master_of(shadow), master);
            assert_eq!(master_of(master), master);
            assert_eq!(header_of(shadow).size, 16);
            free_object(shadow);
            free_object(master);
        }
    }
}
