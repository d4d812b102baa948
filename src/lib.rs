//! # mvtree - Concurrent Multi-Version B-Tree Index
//!
//! mvtree is an in-memory ordered index mapping fixed-size keys to payloads,
//! built for concurrent point inserts and point lookups from many threads.
//! Readers never take locks; writers acquire per-node writer intent through a
//! multi-version (MV) layer that gives every operation a consistent snapshot
//! and fails conflicting writers fast instead of blocking them.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────┐
//! │        Public API (Tree)            │
//! ├─────────────────────────────────────┤
//! │  B-Tree Protocol (descent, splits)  │
//! ├──────────────────┬──────────────────┤
//! │  Interior Nodes  │   Leaf Nodes     │
//! ├──────────────────┴──────────────────┤
//! │  MV Layer (snapshots, try-lock,     │
//! │  shadow copies, reclamation)        │
//! └─────────────────────────────────────┘
//! ```
//!
//! ## Concurrency Model
//!
//! Every operation runs inside a *read session* opened on a registered
//! thread handle. Pointer dereferences go through the MV layer, which
//! resolves each node to the newest version visible at the session's
//! snapshot. Mutations are made on private shadow copies acquired with a
//! non-blocking try-lock and become visible atomically when the session
//! commits. A failed try-lock aborts the session and the tree restarts the
//! whole operation with a short backoff.
//!
//! The tree itself holds no locks and stores no parent pointers; parents
//! are rediscovered on every descent and full interior nodes are split
//! eagerly on the way down, so one operation ever locks at most two
//! adjacent levels.
//!
//! ## Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use mvtree::{Mvcc, Tree};
//!
//! let mvcc = Arc::new(Mvcc::new());
//! let tree = Tree::new(Arc::clone(&mvcc))?;
//! let mut handle = mvcc.register()?;
//!
//! tree.insert(&mut handle, 7, 700)?;
//! assert_eq!(tree.lookup(&mut handle, 7), Some(700));
//! ```
//!
//! ## Module Overview
//!
//! - [`btree`]: node layout, leaf/interior mechanics, and the tree protocol
//! - [`mvcc`]: the multi-version layer (sessions, shadow copies, commit)

pub mod btree;
pub mod mvcc;

pub use btree::{Key, Payload, Tree};
pub use mvcc::{Mvcc, ThreadHandle, MAX_THREADS};
