//! # burrowdb Configuration Constants
//!
//! This module centralizes the on-disk geometry constants. Values that derive
//! from each other are co-located and guarded by compile-time assertions so a
//! change to one cannot silently invalidate another.
//!
//! ## Dependency Graph
//!
//! ```text
//! PAGE_SIZE (16384 bytes)
//!       │
//!       ├─> PAGE_HEADER_SIZE (24 bytes, fixed)
//!       │
//!       ├─> PAGE_PAYLOAD_SIZE (derived: PAGE_SIZE - PAGE_HEADER_SIZE)
//!       │
//!       └─> FILE_HEADER_SIZE (128 bytes, page 0 only)
//!
//! NODE_HEADER_SIZE (28 bytes)
//!       │
//!       └─> default_max_keys(key_size)
//!             (PAGE_PAYLOAD_SIZE - NODE_HEADER_SIZE) / (SLOT_FIXED_SIZE + key_size)
//!
//! DEFAULT_KEY_SIZE (32 bytes)
//!       │
//!       └─> Extended keys keep DEFAULT_KEY_SIZE - BLOB_ID_SIZE prefix bytes
//!           inline; the blob id occupies the tail.
//! ```
//!
//! ## Critical Invariants
//!
//! 1. `PAGE_PAYLOAD_SIZE == PAGE_SIZE - PAGE_HEADER_SIZE`
//! 2. A tree's key size must exceed `BLOB_ID_SIZE`, otherwise an extended
//!    slot has no room for the inline prefix.
//! 3. `default_max_keys(DEFAULT_KEY_SIZE) >= 4` so every geometry admits at
//!    least one split/merge cycle.

// ============================================================================
// PAGE LAYOUT CONSTANTS
// These define the fundamental page structure used throughout the engine
// ============================================================================

/// Size of each database page in bytes (16KB).
/// This is the fundamental unit of I/O and caching.
pub const PAGE_SIZE: usize = 16384;

/// Size of the page header in bytes.
/// Layout: self-address (8), payload CRC (4), type tag (1), flags (1),
/// reserved (10).
pub const PAGE_HEADER_SIZE: usize = 24;

/// Size of the file header in bytes (page 0 only).
pub const FILE_HEADER_SIZE: usize = 128;

/// Usable payload in a regular page after the header.
pub const PAGE_PAYLOAD_SIZE: usize = PAGE_SIZE - PAGE_HEADER_SIZE;

const _: () = assert!(
    PAGE_PAYLOAD_SIZE == PAGE_SIZE - PAGE_HEADER_SIZE,
    "PAGE_PAYLOAD_SIZE derivation mismatch"
);

const _: () = assert!(
    FILE_HEADER_SIZE < PAGE_SIZE,
    "file header must fit in page 0"
);

// ============================================================================
// B+TREE NODE GEOMETRY
// ============================================================================

/// Size of the node header at the start of a B+tree page payload.
/// Layout: flags (1), is_leaf (1), count (2), ptr_left (8), left (8),
/// right (8).
pub const NODE_HEADER_SIZE: usize = 28;

/// Fixed portion of a slot preceding the key bytes.
/// Layout: flags (1), key size (2), ptr (8).
pub const SLOT_FIXED_SIZE: usize = 11;

/// Default fixed key width per slot. Keys longer than this are stored as
/// extended keys: the slot keeps a prefix and the tail 8 bytes hold the
/// blob id of the full key.
pub const DEFAULT_KEY_SIZE: usize = 32;

/// Width of a blob id as stored in the tail of an extended key's inline
/// region.
pub const BLOB_ID_SIZE: usize = 8;

/// Number of slots that fit in one node for the given fixed key width.
pub const fn default_max_keys(key_size: usize) -> usize {
    (PAGE_PAYLOAD_SIZE - NODE_HEADER_SIZE) / (SLOT_FIXED_SIZE + key_size)
}

/// Underflow threshold: a node with `count <= min_keys(max)` is "few" and a
/// candidate for merge or shift.
pub const fn min_keys(max_keys: usize) -> usize {
    max_keys / 2
}

const _: () = assert!(
    DEFAULT_KEY_SIZE > BLOB_ID_SIZE,
    "key size must leave room for an inline prefix next to the blob id"
);

const _: () = assert!(
    default_max_keys(DEFAULT_KEY_SIZE) >= 4,
    "default geometry must admit at least one split/merge cycle"
);

// ============================================================================
// BLOB STORE
// ============================================================================

/// Header at the start of each overflow page payload.
/// Layout: next page address (8), length of data in this page (4).
pub const BLOB_PAGE_HEADER_SIZE: usize = 12;

/// Blob bytes that fit in a single overflow page.
pub const BLOB_PAGE_CAPACITY: usize = PAGE_PAYLOAD_SIZE - BLOB_PAGE_HEADER_SIZE;

// ============================================================================
// EXTENDED-KEY CACHE
// ============================================================================

/// Default capacity (entries) of the extended-key LRU cache.
pub const DEFAULT_EXTKEY_CACHE_CAPACITY: usize = 256;
