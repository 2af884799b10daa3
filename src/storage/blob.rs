//! # Blob Store
//!
//! Storage for byte strings that do not fit inline, chiefly the full bytes
//! of extended keys. A blob is a chain of overflow pages; its id is the
//! address of the first page.
//!
//! ## Overflow Page Layout
//!
//! ```text
//! Offset  Size  Description
//! ------  ----  ----------------------------------------
//! 0       24    Standard PageHeader (type = Blob)
//! 24      8     next: address of the next chain page (0 = end)
//! 32      4     len: blob bytes stored in this page
//! 36      ...   data
//! ```
//!
//! Blobs are immutable once written; replacing one means free + allocate.
//! They are deliberately copied rather than reference counted when a key is
//! duplicated, so no two slots ever share a blob id.

use eyre::{ensure, Result};
use zerocopy::little_endian::{U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use super::page::PageType;
use super::pager::Pager;
use super::{PageAddr, NIL_PAGE};
use crate::config::{BLOB_PAGE_CAPACITY, BLOB_PAGE_HEADER_SIZE};
use crate::error::TreeError;

/// Identifier of a blob: the address of its first overflow page.
pub type BlobId = u64;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
struct BlobPageHeader {
    next: U64,
    len: U32,
}

const _: () = assert!(std::mem::size_of::<BlobPageHeader>() == BLOB_PAGE_HEADER_SIZE);

impl BlobPageHeader {
    fn from_bytes(data: &[u8]) -> Result<&Self> {
        Self::ref_from_bytes(&data[..BLOB_PAGE_HEADER_SIZE])
            .map_err(|e| eyre::eyre!("failed to read BlobPageHeader: {:?}", e))
    }

    fn from_bytes_mut(data: &mut [u8]) -> Result<&mut Self> {
        Self::mut_from_bytes(&mut data[..BLOB_PAGE_HEADER_SIZE])
            .map_err(|e| eyre::eyre!("failed to read BlobPageHeader: {:?}", e))
    }
}

/// Writes `bytes` into a fresh chain of overflow pages and returns its id.
pub fn allocate(pager: &mut Pager, bytes: &[u8]) -> Result<BlobId> {
    ensure!(!bytes.is_empty(), "cannot allocate an empty blob");

    let mut chunks = bytes.chunks(BLOB_PAGE_CAPACITY);
    let first_chunk = chunks.next().expect("non-empty blob has a first chunk");

    let first = pager.alloc(PageType::Blob)?;
    write_chain_page(pager, first, first_chunk)?;

    let mut prev = first;
    for chunk in chunks {
        let addr = pager.alloc(PageType::Blob)?;
        write_chain_page(pager, addr, chunk)?;

        let payload = pager.payload_mut(prev)?;
        let header = BlobPageHeader::from_bytes_mut(payload)?;
        header.next = U64::new(addr);
        prev = addr;
    }

    Ok(first)
}

fn write_chain_page(pager: &mut Pager, addr: PageAddr, chunk: &[u8]) -> Result<()> {
    let payload = pager.payload_mut(addr)?;
    {
        let header = BlobPageHeader::from_bytes_mut(payload)?;
        header.next = U64::new(NIL_PAGE);
        header.len = U32::new(chunk.len() as u32);
    }
    payload[BLOB_PAGE_HEADER_SIZE..BLOB_PAGE_HEADER_SIZE + chunk.len()].copy_from_slice(chunk);
    Ok(())
}

/// Reads a blob back as owned bytes.
pub fn read(pager: &mut Pager, id: BlobId) -> Result<Vec<u8>> {
    ensure!(id != NIL_PAGE, "nil blob id");

    let mut out = Vec::new();
    let mut addr = id;

    while addr != NIL_PAGE {
        ensure_blob_page(pager, addr)?;

        let payload = pager.payload(addr)?;
        let header = BlobPageHeader::from_bytes(payload)?;
        let len = header.len.get() as usize;
        ensure!(
            len <= BLOB_PAGE_CAPACITY,
            "blob page {} claims {} bytes, capacity is {}",
            addr,
            len,
            BLOB_PAGE_CAPACITY
        );

        out.extend_from_slice(&payload[BLOB_PAGE_HEADER_SIZE..BLOB_PAGE_HEADER_SIZE + len]);
        addr = header.next.get();
    }

    Ok(out)
}

/// Releases every page of the chain back to the pager.
pub fn free(pager: &mut Pager, id: BlobId) -> Result<()> {
    ensure!(id != NIL_PAGE, "nil blob id");

    let mut addr = id;
    while addr != NIL_PAGE {
        ensure_blob_page(pager, addr)?;

        let next = {
            let payload = pager.payload(addr)?;
            BlobPageHeader::from_bytes(payload)?.next.get()
        };

        pager.free_page(addr)?;
        addr = next;
    }

    Ok(())
}

fn ensure_blob_page(pager: &mut Pager, addr: PageAddr) -> Result<()> {
    let page_type = pager.page_type(addr)?;
    if page_type != PageType::Blob {
        return Err(eyre::Report::new(TreeError::Corruption(format!(
            "page {} in blob chain has type {:?}",
            addr, page_type
        ))));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::pager::PagerOptions;
    use tempfile::tempdir;

    fn test_pager() -> (tempfile::TempDir, Pager) {
        let dir = tempdir().unwrap();
        let pager = Pager::create(dir.path().join("test.db"), PagerOptions::default()).unwrap();
        (dir, pager)
    }

    #[test]
    fn small_blob_roundtrip() {
        let (_dir, mut pager) = test_pager();

        let id = allocate(&mut pager, b"hello blob").unwrap();
        assert_eq!(read(&mut pager, id).unwrap(), b"hello blob");
    }

    #[test]
    fn multi_page_blob_roundtrip() {
        let (_dir, mut pager) = test_pager();

        let data: Vec<u8> = (0..3 * BLOB_PAGE_CAPACITY + 100)
            .map(|i| (i % 251) as u8)
            .collect();
        let id = allocate(&mut pager, &data).unwrap();

        assert_eq!(read(&mut pager, id).unwrap(), data);
    }

    #[test]
    fn free_releases_every_chain_page() {
        let (_dir, mut pager) = test_pager();

        let data = vec![7u8; 2 * BLOB_PAGE_CAPACITY + 1];
        let id = allocate(&mut pager, &data).unwrap();
        let pages_before = pager.page_count();

        free(&mut pager, id).unwrap();

        // All three chain pages come back before the file grows again.
        let a = pager.alloc(PageType::Blob).unwrap();
        let b = pager.alloc(PageType::Blob).unwrap();
        let c = pager.alloc(PageType::Blob).unwrap();
        assert!(a < pages_before && b < pages_before && c < pages_before);
        assert_eq!(pager.page_count(), pages_before);
    }

    #[test]
    fn read_rejects_non_blob_page() {
        let (_dir, mut pager) = test_pager();

        let addr = pager.alloc(PageType::BtreeIndex).unwrap();
        let err = read(&mut pager, addr).unwrap_err();
        assert!(crate::error::is_corruption(&err));
    }

    #[test]
    fn empty_blob_is_rejected() {
        let (_dir, mut pager) = test_pager();
        assert!(allocate(&mut pager, b"").is_err());
    }
}
