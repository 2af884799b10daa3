//! # burrowdb - Embedded B+Tree Key/Value Storage Engine
//!
//! burrowdb stores ordered key/value pairs in an on-disk B+tree of
//! fixed-size pages, accessed through a memory-mapped pager. The design
//! prioritizes:
//!
//! - **Zero-copy page access**: node views are slices into mmap'd pages
//! - **In-place slot arithmetic**: constant-stride slots, memmove
//!   rebalancing, no per-key allocation on the hot paths
//! - **Cursor stability**: iterators survive structural mutation through
//!   the coupled/uncoupled protocol
//!
//! ## Quick Start
//!
//! ```ignore
//! use burrowdb::{Btree, InsertMode, PagerOptions, Txn};
//!
//! let mut tree = Btree::create("data.bdb", PagerOptions::default())?;
//! tree.insert(b"hello", 1, InsertMode::Strict)?;
//!
//! let record = tree.find(b"hello")?;
//!
//! let mut txn = Txn::begin();
//! tree.erase(&mut txn, b"hello")?;
//! txn.commit(tree.pager_mut())?;
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────┐
//! │   Btree (find / insert / erase)      │
//! │   Cursor (coupled / uncoupled)       │
//! ├──────────────────────────────────────┤
//! │   Node views, slot codec, traversal  │
//! ├───────────────┬──────────────────────┤
//! │  Txn (deferred│  Blob store          │
//! │  page free)   │  Extended-key cache  │
//! ├───────────────┴──────────────────────┤
//! │   Pager: checksums, dirty set,       │
//! │   freelist, file header              │
//! ├──────────────────────────────────────┤
//! │   Memory-mapped file I/O (memmap2)   │
//! └──────────────────────────────────────┘
//! ```
//!
//! ## Module Overview
//!
//! - [`btree`]: node layout, traversal, erase/rebalance, cursors
//! - [`storage`]: pager, mmap storage, freelist, blob store
//! - [`txn`]: single-writer transaction with deferred page release
//! - [`extkey`]: LRU cache for extended-key bytes
//! - [`config`]: on-disk geometry constants

#[macro_use]
mod macros;

pub mod btree;
pub mod config;
pub mod error;
pub mod extkey;
pub mod storage;
pub mod txn;

pub use btree::{Btree, Cursor, CursorMove, CursorState, ErasedRecord, InsertMode, TreeStats};
pub use error::{is_corruption, is_key_not_found, TreeError};
pub use storage::{PageAddr, Pager, PagerOptions};
pub use txn::Txn;
