//! # Freelist Management
//!
//! Free page tracking for burrowdb. Pages released by the B+tree (after a
//! merge, a freed blob chain, a collapsed root) are recorded in a linked list
//! of trunk pages and handed back out by the pager before the file grows.
//!
//! ## Trunk Page Layout
//!
//! ```text
//! Offset  Size      Description
//! ------  --------  ----------------------------------------
//! 0       24        Standard PageHeader (type = Freelist)
//! 24      8         next_trunk: address of the next trunk (0 = none)
//! 32      4         count: number of entries in this trunk
//! 36      4         padding
//! 40      8*N       entries: addresses of free pages
//! ```
//!
//! ## Strategy
//!
//! Allocation pops from the head trunk; an exhausted trunk page is itself
//! returned as the allocation. Release pushes onto the head trunk; when the
//! trunk is full, the released page becomes the new head trunk, so the
//! freelist never needs to allocate in order to free.
//!
//! ## Thread Safety
//!
//! Not thread-safe on its own; the pager serializes access under the
//! single-writer contract.

use eyre::{ensure, Result};
use zerocopy::little_endian::{U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use super::page::{PageHeader, PageType};
use super::{MmapStorage, PageAddr, NIL_PAGE};
use crate::config::{PAGE_HEADER_SIZE, PAGE_SIZE};

pub const TRUNK_HEADER_SIZE: usize = 16;
pub const TRUNK_MAX_ENTRIES: usize =
    (PAGE_SIZE - PAGE_HEADER_SIZE - TRUNK_HEADER_SIZE) / 8;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct TrunkHeader {
    next_trunk: U64,
    count: U32,
    padding: U32,
}

const _: () = assert!(std::mem::size_of::<TrunkHeader>() == TRUNK_HEADER_SIZE);

impl TrunkHeader {
    pub fn from_bytes(data: &[u8]) -> Result<&Self> {
        ensure!(
            data.len() >= TRUNK_HEADER_SIZE,
            "buffer too small for TrunkHeader: {} < {}",
            data.len(),
            TRUNK_HEADER_SIZE
        );

        Self::ref_from_bytes(&data[..TRUNK_HEADER_SIZE])
            .map_err(|e| eyre::eyre!("failed to read TrunkHeader: {:?}", e))
    }

    pub fn from_bytes_mut(data: &mut [u8]) -> Result<&mut Self> {
        ensure!(
            data.len() >= TRUNK_HEADER_SIZE,
            "buffer too small for TrunkHeader: {} < {}",
            data.len(),
            TRUNK_HEADER_SIZE
        );

        Self::mut_from_bytes(&mut data[..TRUNK_HEADER_SIZE])
            .map_err(|e| eyre::eyre!("failed to read TrunkHeader: {:?}", e))
    }

    zerocopy_accessors! {
        next_trunk: u64,
        count: u32,
    }

    pub fn is_full(&self) -> bool {
        self.count.get() as usize >= TRUNK_MAX_ENTRIES
    }
}

const TRUNK_OFFSET: usize = PAGE_HEADER_SIZE;
const ENTRIES_OFFSET: usize = PAGE_HEADER_SIZE + TRUNK_HEADER_SIZE;

fn entry_offset(index: usize) -> usize {
    ENTRIES_OFFSET + index * 8
}

/// In-memory view of the freelist; the head address and count are persisted
/// in the file header by the pager.
#[derive(Debug, Default)]
pub struct Freelist {
    head: PageAddr,
    free_count: u64,
}

impl Freelist {
    pub fn new() -> Self {
        Self {
            head: NIL_PAGE,
            free_count: 0,
        }
    }

    pub fn with_head(head: PageAddr, free_count: u64) -> Self {
        Self { head, free_count }
    }

    pub fn head(&self) -> PageAddr {
        self.head
    }

    pub fn free_count(&self) -> u64 {
        self.free_count
    }

    /// Pops a free page address, or returns None when the list is exhausted
    /// and the caller must grow the file. An emptied trunk page is handed out
    /// as the allocation itself.
    pub fn allocate(&mut self, storage: &mut MmapStorage) -> Result<Option<PageAddr>> {
        if self.head == NIL_PAGE {
            return Ok(None);
        }

        let trunk_addr = self.head;
        let page_data = storage.page_mut(trunk_addr)?;

        let (count, next_trunk) = {
            let trunk = TrunkHeader::from_bytes(&page_data[TRUNK_OFFSET..])?;
            (trunk.count(), trunk.next_trunk())
        };

        if count == 0 {
            // The trunk itself is the last free page at this link.
            self.head = next_trunk;
            return Ok(Some(trunk_addr));
        }

        let index = (count - 1) as usize;
        let off = entry_offset(index);
        let addr = u64::from_le_bytes(page_data[off..off + 8].try_into().unwrap());

        let trunk = TrunkHeader::from_bytes_mut(&mut page_data[TRUNK_OFFSET..])?;
        trunk.set_count(count - 1);
        self.free_count -= 1;

        ensure!(
            addr != NIL_PAGE,
            "freelist trunk {} holds a nil entry at index {}",
            trunk_addr,
            index
        );

        Ok(Some(addr))
    }

    /// Records `addr` as free. When the head trunk is full (or absent), the
    /// released page itself becomes the new head trunk.
    pub fn release(&mut self, storage: &mut MmapStorage, addr: PageAddr) -> Result<()> {
        ensure!(addr != NIL_PAGE, "cannot release the nil page");

        let head = self.head;
        if head != NIL_PAGE {
            let page_data = storage.page_mut(head)?;
            let trunk = TrunkHeader::from_bytes(&page_data[TRUNK_OFFSET..])?;

            if !trunk.is_full() {
                let count = trunk.count();
                let off = entry_offset(count as usize);
                page_data[off..off + 8].copy_from_slice(&addr.to_le_bytes());

                let trunk = TrunkHeader::from_bytes_mut(&mut page_data[TRUNK_OFFSET..])?;
                trunk.set_count(count + 1);
                self.free_count += 1;
                return Ok(());
            }
        }

        // Start a new trunk in the released page.
        let page_data = storage.page_mut(addr)?;
        page_data.fill(0);

        let header = PageHeader::from_bytes_mut(page_data)?;
        header.set_address(addr);
        header.set_page_type(PageType::Freelist);

        let trunk = TrunkHeader::from_bytes_mut(&mut page_data[TRUNK_OFFSET..])?;
        trunk.set_next_trunk(head);
        trunk.set_count(0);

        self.head = addr;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn test_storage(pages: u64) -> (tempfile::TempDir, MmapStorage) {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.db");
        let storage = MmapStorage::create(&path, pages).unwrap();
        (dir, storage)
    }

    #[test]
    fn trunk_header_size_is_16_bytes() {
        assert_eq!(std::mem::size_of::<TrunkHeader>(), TRUNK_HEADER_SIZE);
    }

    #[test]
    fn trunk_max_entries_calculated_correctly() {
        let expected = (PAGE_SIZE - PAGE_HEADER_SIZE - TRUNK_HEADER_SIZE) / 8;
        assert_eq!(TRUNK_MAX_ENTRIES, expected);
    }

    #[test]
    fn empty_freelist_allocates_nothing() {
        let (_dir, mut storage) = test_storage(2);
        let mut freelist = Freelist::new();

        assert!(freelist.allocate(&mut storage).unwrap().is_none());
    }

    #[test]
    fn release_then_allocate_roundtrips() {
        let (_dir, mut storage) = test_storage(10);
        let mut freelist = Freelist::new();

        // 5 becomes the trunk, 6 and 7 are entries
        freelist.release(&mut storage, 5).unwrap();
        freelist.release(&mut storage, 6).unwrap();
        freelist.release(&mut storage, 7).unwrap();

        assert_eq!(freelist.allocate(&mut storage).unwrap(), Some(7));
        assert_eq!(freelist.allocate(&mut storage).unwrap(), Some(6));
        // exhausted trunk is handed out last
        assert_eq!(freelist.allocate(&mut storage).unwrap(), Some(5));
        assert_eq!(freelist.allocate(&mut storage).unwrap(), None);
    }

    #[test]
    fn full_trunk_chains_to_released_page() {
        let (_dir, mut storage) = test_storage(4);
        let mut freelist = Freelist::new();

        freelist.release(&mut storage, 1).unwrap();

        // Force the trunk full so the next release must chain.
        {
            let page_data = storage.page_mut(1).unwrap();
            let trunk = TrunkHeader::from_bytes_mut(&mut page_data[TRUNK_OFFSET..]).unwrap();
            trunk.set_count(TRUNK_MAX_ENTRIES as u32);
        }

        freelist.release(&mut storage, 2).unwrap();
        assert_eq!(freelist.head(), 2);

        let page_data = storage.page(2).unwrap();
        let trunk = TrunkHeader::from_bytes(&page_data[TRUNK_OFFSET..]).unwrap();
        assert_eq!(trunk.next_trunk(), 1);
        assert_eq!(trunk.count(), 0);
    }

    #[test]
    fn release_nil_page_is_rejected() {
        let (_dir, mut storage) = test_storage(2);
        let mut freelist = Freelist::new();

        assert!(freelist.release(&mut storage, NIL_PAGE).is_err());
    }
}
