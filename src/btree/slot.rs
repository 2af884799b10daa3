//! # Key Codec and Slot Arithmetic
//!
//! A slot is the fixed-stride unit within a node's slot array:
//!
//! ```text
//! Offset  Size      Field      Description
//! ------  --------  ---------  ----------------------------------------
//! 0       1         flags      Extended / duplicates / record encodings
//! 1       2         size       Full external key length in bytes
//! 3       8         ptr        Record id (leaf) or child address (internal)
//! 11      key_size  key_bytes  Inline key, or prefix + blob id tail
//! ```
//!
//! Keys no longer than the tree's fixed key width live inline. Longer keys
//! are **extended**: the slot keeps the first `key_size - 8` bytes as a
//! prefix and the tail 8 bytes hold the little-endian blob id of the full
//! key. Comparison touches the blob store only when the inline prefix ties.
//!
//! Record ids are opaque to the tree except for the size encodings: a tiny
//! record packs its bytes into the ptr field itself (length in the top
//! byte), small and empty records are length markers. The tree carries
//! these flags through erase, copy and shift untouched.
//!
//! Extended blobs are copied, never shared: duplicating a key (separator
//! promotion, anchor rotation) allocates a fresh blob for the copy, so
//! freeing one slot's blob can never invalidate another slot.

use std::cmp::Ordering;

use eyre::{ensure, Result};
use smallvec::SmallVec;

use crate::config::{BLOB_ID_SIZE, SLOT_FIXED_SIZE};
use crate::extkey::ExtkeyCache;
use crate::storage::{blob, BlobId, Pager};

/// The key overflows the fixed width; full bytes live in the blob store.
pub const KEY_EXTENDED: u8 = 0x01;
/// The slot's ptr names a blob holding the ordered duplicate record list.
pub const KEY_DUPLICATES: u8 = 0x02;
/// Record bytes are packed into the ptr field (length in the top byte).
pub const RECORD_TINY: u8 = 0x04;
/// The record is exactly the 8 ptr bytes.
pub const RECORD_SMALL: u8 = 0x08;
/// The record is empty; ptr is meaningless.
pub const RECORD_EMPTY: u8 = 0x10;

/// Flags that only make sense in a leaf; stripped when a key is copied into
/// an internal node, which manages child pointers rather than records.
pub const LEAF_ONLY_FLAGS: u8 = KEY_DUPLICATES | RECORD_TINY | RECORD_SMALL | RECORD_EMPTY;

/// Buffer type for one slot's bytes; sized so default-geometry slots stay
/// on the stack.
pub type SlotBuf = SmallVec<[u8; 96]>;

/// Buffer type for a materialized external key.
pub type KeyBuf = SmallVec<[u8; 64]>;

#[derive(Debug, Clone, Copy)]
pub struct SlotView<'a> {
    data: &'a [u8],
    key_size: usize,
}

impl<'a> SlotView<'a> {
    pub fn new(data: &'a [u8], key_size: usize) -> Self {
        debug_assert_eq!(data.len(), SLOT_FIXED_SIZE + key_size);
        Self { data, key_size }
    }

    pub fn flags(&self) -> u8 {
        self.data[0]
    }

    /// Full external key length, which exceeds `key_size` for extended keys.
    pub fn key_len(&self) -> usize {
        u16::from_le_bytes(self.data[1..3].try_into().unwrap()) as usize
    }

    pub fn ptr(&self) -> u64 {
        u64::from_le_bytes(self.data[3..11].try_into().unwrap())
    }

    pub fn is_extended(&self) -> bool {
        self.flags() & KEY_EXTENDED != 0
    }

    pub fn has_duplicates(&self) -> bool {
        self.flags() & KEY_DUPLICATES != 0
    }

    /// The full fixed-width key region.
    pub fn key_bytes(&self) -> &'a [u8] {
        &self.data[SLOT_FIXED_SIZE..SLOT_FIXED_SIZE + self.key_size]
    }

    /// The comparable inline portion: the whole key for inline slots, the
    /// prefix (without the blob id tail) for extended slots.
    pub fn inline_key(&self) -> &'a [u8] {
        let bytes = self.key_bytes();
        if self.is_extended() {
            &bytes[..self.key_size - BLOB_ID_SIZE]
        } else {
            &bytes[..self.key_len().min(self.key_size)]
        }
    }

    /// Blob id from the tail of an extended slot's key region.
    pub fn blob_id(&self) -> Result<BlobId> {
        ensure!(self.is_extended(), "slot has no blob id: not extended");
        let tail = &self.key_bytes()[self.key_size - BLOB_ID_SIZE..];
        let id = u64::from_le_bytes(tail.try_into().unwrap());
        ensure!(id != 0, "extended slot carries a nil blob id");
        Ok(id)
    }

    /// Record size per the tiny/small/empty encodings; a plain record id
    /// counts as its 8 bytes.
    pub fn record_size(&self) -> u64 {
        let flags = self.flags();
        if flags & RECORD_EMPTY != 0 {
            0
        } else if flags & RECORD_TINY != 0 {
            self.ptr() >> 56
        } else {
            8
        }
    }
}

#[derive(Debug)]
pub struct SlotViewMut<'a> {
    data: &'a mut [u8],
    key_size: usize,
}

impl<'a> SlotViewMut<'a> {
    pub fn new(data: &'a mut [u8], key_size: usize) -> Self {
        debug_assert_eq!(data.len(), SLOT_FIXED_SIZE + key_size);
        Self { data, key_size }
    }

    pub fn view(&self) -> SlotView<'_> {
        SlotView::new(self.data, self.key_size)
    }

    pub fn set_flags(&mut self, flags: u8) {
        self.data[0] = flags;
    }

    pub fn set_key_len(&mut self, len: usize) {
        self.data[1..3].copy_from_slice(&(len as u16).to_le_bytes());
    }

    pub fn set_ptr(&mut self, ptr: u64) {
        self.data[3..11].copy_from_slice(&ptr.to_le_bytes());
    }

    pub fn set_blob_id(&mut self, id: BlobId) {
        let tail = SLOT_FIXED_SIZE + self.key_size - BLOB_ID_SIZE;
        self.data[tail..tail + BLOB_ID_SIZE].copy_from_slice(&id.to_le_bytes());
    }

    /// Writes an inline key: flags keep their non-key bits, size is the key
    /// length, the key region is zero-padded.
    pub fn write_inline_key(&mut self, key: &[u8]) {
        debug_assert!(key.len() <= self.key_size);
        self.data[0] &= !KEY_EXTENDED;
        self.set_key_len(key.len());
        let region = &mut self.data[SLOT_FIXED_SIZE..];
        region[..key.len()].copy_from_slice(key);
        region[key.len()..].fill(0);
    }

    /// Writes an extended key: prefix inline, blob id in the tail.
    pub fn write_extended_key(&mut self, key: &[u8], id: BlobId) {
        debug_assert!(key.len() > self.key_size);
        self.data[0] |= KEY_EXTENDED;
        self.set_key_len(key.len());
        let prefix_len = self.key_size - BLOB_ID_SIZE;
        let region = &mut self.data[SLOT_FIXED_SIZE..];
        region[..prefix_len].copy_from_slice(&key[..prefix_len]);
        self.set_blob_id(id);
    }
}

/// A zeroed slot buffer for the given key width.
pub fn empty_slot(key_size: usize) -> SlotBuf {
    SlotBuf::from_elem(0, SLOT_FIXED_SIZE + key_size)
}

/// Fetches the full bytes of an extended key through the cache.
pub fn fetch_extended_key(
    pager: &mut Pager,
    extkeys: &mut ExtkeyCache,
    id: BlobId,
) -> Result<KeyBuf> {
    if let Some(bytes) = extkeys.lookup(id) {
        return Ok(KeyBuf::from_slice(bytes));
    }

    let bytes = blob::read(pager, id)?;
    let out = KeyBuf::from_slice(&bytes);
    extkeys.insert(id, bytes);
    Ok(out)
}

/// Materializes the full external key of a slot, fetching the blob when the
/// key is extended.
pub fn materialize_key(
    pager: &mut Pager,
    extkeys: &mut ExtkeyCache,
    slot_bytes: &[u8],
    key_size: usize,
) -> Result<KeyBuf> {
    let slot = SlotView::new(slot_bytes, key_size);
    if !slot.is_extended() {
        return Ok(KeyBuf::from_slice(slot.inline_key()));
    }
    let id = slot.blob_id()?;
    let full = fetch_extended_key(pager, extkeys, id)?;
    ensure!(
        full.len() == slot.key_len(),
        "extended key blob {} has {} bytes, slot claims {}",
        id,
        full.len(),
        slot.key_len()
    );
    Ok(full)
}

/// Total order of an external key against a slot's key. The inline prefix
/// decides whenever it can; the blob store is touched only on a prefix tie
/// against an extended slot. Ties over the common length fall back to
/// length order, which byte-slice comparison already encodes.
pub fn compare_external_to_slot(
    pager: &mut Pager,
    extkeys: &mut ExtkeyCache,
    key: &[u8],
    slot_bytes: &[u8],
    key_size: usize,
) -> Result<Ordering> {
    let slot = SlotView::new(slot_bytes, key_size);

    if !slot.is_extended() {
        return Ok(key.cmp(slot.inline_key()));
    }

    let prefix = slot.inline_key();
    let common = key.len().min(prefix.len());
    match key[..common].cmp(&prefix[..common]) {
        Ordering::Equal => {
            if key.len() <= prefix.len() {
                // The slot's full key strictly exceeds its prefix, so a key
                // that ties within the prefix and ends there sorts first.
                Ok(Ordering::Less)
            } else {
                let full = materialize_key(pager, extkeys, slot_bytes, key_size)?;
                Ok(key.cmp(&full))
            }
        }
        decided => Ok(decided),
    }
}

/// Copies a slot for reuse in another node, duplicating the extended-key
/// blob so the copy owns a fresh id. Reference counting is deliberately
/// avoided; see the module docs.
pub fn copy_slot(pager: &mut Pager, slot_bytes: &[u8], key_size: usize) -> Result<SlotBuf> {
    let mut out = SlotBuf::from_slice(slot_bytes);
    let slot = SlotView::new(slot_bytes, key_size);

    if slot.is_extended() {
        let src = slot.blob_id()?;
        let bytes = blob::read(pager, src)?;
        let fresh = blob::allocate(pager, &bytes)?;
        SlotViewMut::new(&mut out, key_size).set_blob_id(fresh);
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::PagerOptions;
    use tempfile::tempdir;

    const KEY_SIZE: usize = 16;

    fn test_pager() -> (tempfile::TempDir, Pager) {
        let dir = tempdir().unwrap();
        let pager = Pager::create(dir.path().join("t.db"), PagerOptions::default()).unwrap();
        (dir, pager)
    }

    #[test]
    fn inline_slot_roundtrip() {
        let mut buf = empty_slot(KEY_SIZE);
        {
            let mut slot = SlotViewMut::new(&mut buf, KEY_SIZE);
            slot.write_inline_key(b"carrot");
            slot.set_ptr(0xABCD);
        }

        let slot = SlotView::new(&buf, KEY_SIZE);
        assert!(!slot.is_extended());
        assert_eq!(slot.key_len(), 6);
        assert_eq!(slot.inline_key(), b"carrot");
        assert_eq!(slot.ptr(), 0xABCD);
    }

    #[test]
    fn extended_slot_layout() {
        let key = vec![b'x'; 40];
        let mut buf = empty_slot(KEY_SIZE);
        {
            let mut slot = SlotViewMut::new(&mut buf, KEY_SIZE);
            slot.write_extended_key(&key, 99);
            slot.set_ptr(7);
        }

        let slot = SlotView::new(&buf, KEY_SIZE);
        assert!(slot.is_extended());
        assert_eq!(slot.key_len(), 40);
        assert_eq!(slot.inline_key(), &key[..KEY_SIZE - BLOB_ID_SIZE]);
        assert_eq!(slot.blob_id().unwrap(), 99);
        assert_eq!(slot.ptr(), 7);
    }

    #[test]
    fn record_size_encodings() {
        let mut buf = empty_slot(KEY_SIZE);
        let mut slot = SlotViewMut::new(&mut buf, KEY_SIZE);

        slot.set_flags(RECORD_EMPTY);
        assert_eq!(slot.view().record_size(), 0);

        slot.set_flags(RECORD_TINY);
        slot.set_ptr(3u64 << 56 | 0x414243);
        assert_eq!(slot.view().record_size(), 3);

        slot.set_flags(RECORD_SMALL);
        assert_eq!(slot.view().record_size(), 8);

        slot.set_flags(0);
        assert_eq!(slot.view().record_size(), 8);
    }

    #[test]
    fn compare_against_inline_slot() {
        let (_dir, mut pager) = test_pager();
        let mut extkeys = ExtkeyCache::default();

        let mut buf = empty_slot(KEY_SIZE);
        SlotViewMut::new(&mut buf, KEY_SIZE).write_inline_key(b"mango");

        let cmp = |pager: &mut Pager, cache: &mut ExtkeyCache, key: &[u8]| {
            compare_external_to_slot(pager, cache, key, &buf, KEY_SIZE).unwrap()
        };

        assert_eq!(cmp(&mut pager, &mut extkeys, b"apple"), Ordering::Less);
        assert_eq!(cmp(&mut pager, &mut extkeys, b"mango"), Ordering::Equal);
        assert_eq!(cmp(&mut pager, &mut extkeys, b"mangos"), Ordering::Greater);
        assert_eq!(cmp(&mut pager, &mut extkeys, b"zebra"), Ordering::Greater);
    }

    #[test]
    fn compare_against_extended_slot_uses_blob_on_prefix_tie() {
        let (_dir, mut pager) = test_pager();
        let mut extkeys = ExtkeyCache::default();

        let mut stored = vec![b'p'; KEY_SIZE - BLOB_ID_SIZE];
        stored.extend_from_slice(b"-long-stored-key-bytes");
        let id = blob::allocate(&mut pager, &stored).unwrap();

        let mut buf = empty_slot(KEY_SIZE);
        SlotViewMut::new(&mut buf, KEY_SIZE).write_extended_key(&stored, id);

        // Decided by the prefix alone: no cache entry appears.
        let less = compare_external_to_slot(&mut pager, &mut extkeys, b"a", &buf, KEY_SIZE).unwrap();
        assert_eq!(less, Ordering::Less);
        assert!(extkeys.is_empty());

        // Prefix ties and the probe is longer: blob fetched and cached.
        let mut probe = stored.clone();
        probe.push(b'z');
        let greater =
            compare_external_to_slot(&mut pager, &mut extkeys, &probe, &buf, KEY_SIZE).unwrap();
        assert_eq!(greater, Ordering::Greater);
        assert!(extkeys.contains(id));

        let equal =
            compare_external_to_slot(&mut pager, &mut extkeys, &stored, &buf, KEY_SIZE).unwrap();
        assert_eq!(equal, Ordering::Equal);
    }

    #[test]
    fn short_probe_on_prefix_tie_sorts_before_extended_key() {
        let (_dir, mut pager) = test_pager();
        let mut extkeys = ExtkeyCache::default();

        let mut stored = vec![b'q'; KEY_SIZE - BLOB_ID_SIZE];
        stored.extend_from_slice(b"tail");
        let id = blob::allocate(&mut pager, &stored).unwrap();

        let mut buf = empty_slot(KEY_SIZE);
        SlotViewMut::new(&mut buf, KEY_SIZE).write_extended_key(&stored, id);

        let probe = vec![b'q'; 3];
        let ord =
            compare_external_to_slot(&mut pager, &mut extkeys, &probe, &buf, KEY_SIZE).unwrap();
        assert_eq!(ord, Ordering::Less);
    }

    #[test]
    fn copy_slot_duplicates_the_blob() {
        let (_dir, mut pager) = test_pager();
        let mut extkeys = ExtkeyCache::default();

        let key = vec![b'k'; 50];
        let id = blob::allocate(&mut pager, &key).unwrap();

        let mut buf = empty_slot(KEY_SIZE);
        SlotViewMut::new(&mut buf, KEY_SIZE).write_extended_key(&key, id);

        let copy = copy_slot(&mut pager, &buf, KEY_SIZE).unwrap();
        let copy_view = SlotView::new(&copy, KEY_SIZE);
        let copy_id = copy_view.blob_id().unwrap();

        assert_ne!(copy_id, id);
        let fetched = fetch_extended_key(&mut pager, &mut extkeys, copy_id).unwrap();
        assert_eq!(&fetched[..], &key[..]);

        // Freeing the original leaves the copy readable.
        blob::free(&mut pager, id).unwrap();
        assert_eq!(&blob::read(&mut pager, copy_id).unwrap()[..], &key[..]);
    }
}
