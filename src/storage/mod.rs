//! # Storage Module
//!
//! The foundational storage layer for burrowdb: memory-mapped file access
//! with zero-copy page slices, a persisted freelist, checksummed page
//! headers, and the blob store for oversized key bytes.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────┐
//! │   B+tree core (node/erase/cursor)   │
//! ├─────────────────────────────────────┤
//! │   Pager: fetch / alloc / flush /    │
//! │   free_page, dirty set, checksums   │
//! ├──────────────┬──────────────────────┤
//! │  Freelist    │  Blob store          │
//! ├──────────────┴──────────────────────┤
//! │   MmapStorage (memmap2)             │
//! └─────────────────────────────────────┘
//! ```
//!
//! The pager is the only component that touches the device. Everything above
//! it operates on page payload slices and is oblivious to mapping, growth
//! and checksum concerns.
//!
//! ## Module Organization
//!
//! - `mmap`: low-level memory-mapped storage (`MmapStorage`)
//! - `page`: page types and the 24-byte page header
//! - `header`: the 128-byte file header on page 0
//! - `freelist`: trunk-page free list
//! - `pager`: the page cache contract consumed by the B+tree core
//! - `blob`: chained overflow pages for extended keys

mod freelist;
mod header;
mod mmap;
mod page;
mod pager;

pub mod blob;

pub use freelist::{Freelist, TrunkHeader, TRUNK_HEADER_SIZE, TRUNK_MAX_ENTRIES};
pub use header::{FileHeader, CURRENT_VERSION, FILE_FLAG_CRC, FILE_MAGIC};
pub use mmap::MmapStorage;
pub use page::{validate_page, PageAddr, PageHeader, PageType, NIL_PAGE};
pub use pager::{payload_checksum, Pager, PagerOptions};

pub use blob::BlobId;
