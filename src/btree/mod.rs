//! # B-Tree Index
//!
//! A concurrent B-tree over fixed-size keys and payloads. All entries live
//! in leaf nodes; interior nodes carry separator keys and child pointers.
//! Nodes are fixed 128-byte pages so a node fits in one or two cache lines
//! and a mutating session's write set stays one page per touched node.
//!
//! ## Node Kinds
//!
//! - **Leaf nodes**: sorted parallel arrays of keys and payloads. Insert of
//!   an existing key overwrites its payload.
//! - **Interior nodes**: `count` separators with `count + 1` children;
//!   descent follows `children[lower_bound(key)]`, so a key at or below a
//!   separator routes left of it.
//!
//! ## Splits
//!
//! Splits happen eagerly during descent: an insert that passes through a
//! full interior node splits it before descending further, so the parent
//! that must later absorb a separator is never full on arrival. A leaf
//! split keeps its largest left-half key as the separator; an interior
//! split promotes its median to the parent without keeping it in either
//! half. Root growth replaces the single child slot of a permanent master
//! root, never the tree handle itself.
//!
//! ## Concurrency
//!
//! Descent is optimistic and lock-free; structure changes acquire writer
//! intent on at most two adjacent levels through the MV layer and restart
//! the whole operation after any conflict. See [`crate::mvcc`] for the
//! snapshot and commit protocol.

pub mod interior;
pub mod leaf;
pub mod node;
mod tree;

pub use interior::{InteriorNode, INTERIOR_MAX_ENTRIES};
pub use leaf::{LeafNode, LEAF_MAX_ENTRIES};
pub use node::{Key, NodeKind, Payload, NODE_HEADER_SIZE, PAGE_SIZE};
pub use tree::Tree;
