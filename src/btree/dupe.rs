//! # Duplicate Record Lists
//!
//! A slot flagged `KEY_DUPLICATES` stores, in place of a record id, the blob
//! id of a flat ordered sequence of record ids (8 bytes each, little
//! endian). Cursors iterate the sequence through `duplicate_index` before
//! crossing to the next slot.
//!
//! Blobs are immutable, so every list mutation frees the old blob and
//! allocates a fresh one; the caller re-points the slot at the returned id.

use eyre::{ensure, Result};

use crate::storage::{blob, BlobId, Pager};

pub fn read_list(pager: &mut Pager, id: BlobId) -> Result<Vec<u64>> {
    let bytes = blob::read(pager, id)?;
    ensure!(
        bytes.len() % 8 == 0 && !bytes.is_empty(),
        "duplicate list blob {} has invalid length {}",
        id,
        bytes.len()
    );

    Ok(bytes
        .chunks_exact(8)
        .map(|c| u64::from_le_bytes(c.try_into().unwrap()))
        .collect())
}

pub fn write_list(pager: &mut Pager, rids: &[u64]) -> Result<BlobId> {
    ensure!(!rids.is_empty(), "duplicate list cannot be empty");
    let mut bytes = Vec::with_capacity(rids.len() * 8);
    for rid in rids {
        bytes.extend_from_slice(&rid.to_le_bytes());
    }
    blob::allocate(pager, &bytes)
}

/// Appends a record id, returning the id of the rewritten list.
pub fn append(pager: &mut Pager, id: BlobId, rid: u64) -> Result<BlobId> {
    let mut rids = read_list(pager, id)?;
    rids.push(rid);
    blob::free(pager, id)?;
    write_list(pager, &rids)
}

/// Replaces the record at `index`, returning the id of the rewritten list.
pub fn replace_at(pager: &mut Pager, id: BlobId, index: usize, rid: u64) -> Result<BlobId> {
    let mut rids = read_list(pager, id)?;
    ensure!(
        index < rids.len(),
        "duplicate index {} out of range ({} records)",
        index,
        rids.len()
    );
    rids[index] = rid;
    blob::free(pager, id)?;
    write_list(pager, &rids)
}
