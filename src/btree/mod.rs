//! # B+Tree Engine
//!
//! The core of burrowdb: an on-disk B+tree of fixed-size pages with
//! erase-side rebalancing and coupled/uncoupled cursors.
//!
//! ## Architecture Overview
//!
//! ```text
//!                 [Root  (internal)]
//!                 /        |        \
//!        [Leaf 2]     [Leaf 3]     [Leaf 4]
//!           <------------><----------->        (doubly linked chain)
//! ```
//!
//! - All records live in leaves; internal nodes hold separator keys and
//!   child pointers (`ptr_left` plus one pointer per slot).
//! - Slots have a constant stride, so in-node search is binary and bulk
//!   slot movement is a single memmove.
//! - Keys wider than the tree's fixed key width are **extended**: a prefix
//!   stays inline and the full bytes live in the blob store.
//!
//! ## Node Layout
//!
//! ```text
//! +-----------------------+
//! | Page Header (24B)     |  pager-level: address, CRC, type
//! +-----------------------+
//! | Node Header (28B)     |  is_leaf, count, ptr_left, left, right
//! +-----------------------+
//! | Slot 0                |  flags | size | ptr | key bytes
//! | Slot 1                |
//! | ...                   |
//! +-----------------------+
//! ```
//!
//! ## Erase
//!
//! Deletion is recursive with rebalancing on the unwind: a node that drops
//! below the minimum fill merges with an underfull sibling or borrows slots
//! from a healthy one, rotating separators through the anchoring ancestor.
//! A drained root is collapsed onto its only child. See `erase` for the
//! case analysis.
//!
//! ## Cursors
//!
//! Cursors couple directly to a leaf page for O(1) movement and are
//! uncoupled (key copied out, page reference dropped) by any structural
//! mutation of that page. See `cursor`.
//!
//! ## Concurrency
//!
//! One mutator per tree; cursors run cooperatively under it. No operation
//! yields between the first page mutation of a structural change and its
//! completion.

mod cursor;
mod dupe;
mod erase;
mod insert;
mod node;
mod slot;
mod traverse;
mod tree;

pub use cursor::{Cursor, CursorMove, CursorState};
pub use insert::InsertMode;
pub use node::{slot_stride, NodeHeader, NodeView, NodeViewMut};
pub use slot::{
    SlotView, SlotViewMut, KEY_DUPLICATES, KEY_EXTENDED, RECORD_EMPTY, RECORD_SMALL, RECORD_TINY,
};
pub use traverse::{NodeMeta, SlotMatch};
pub use tree::{Btree, ErasedRecord, TreeStats};
