//! # Pager
//!
//! The pager owns the mmap'd database file and is the only component that
//! hands out page bytes. It implements the narrow contract the B+tree core
//! consumes: `fetch` (with lazy checksum verification), `alloc`, `flush`,
//! and `free_page`, plus dirty tracking and the persisted freelist.
//!
//! ## Checksums
//!
//! When the file was created with checksums enabled, `flush_all` writes the
//! Murmur3-x86-32 of each dirty page's payload into the page header, seeded
//! with the page address. The first fetch of a page in a session verifies
//! the stored value; a mismatch surfaces as [`TreeError::Corruption`].
//!
//! ## Dirty Tracking
//!
//! `payload_mut` marks the page dirty. The dirty set lives in memory only;
//! durability is the caller's concern (`flush_all` / `sync`).
//!
//! ## Ownership
//!
//! Pages are owned by the pager; callers hold borrows for the duration of a
//! single operation. Growing the file requires `&mut self`, so the borrow
//! checker rules out dangling page references.

use std::path::Path;

use eyre::{ensure, Result, WrapErr};
use hashbrown::HashSet;
use tracing::{debug, trace};

use super::freelist::Freelist;
use super::header::{FileHeader, FILE_FLAG_CRC};
use super::page::{PageHeader, PageType};
use super::{MmapStorage, PageAddr, NIL_PAGE};
use crate::config::{
    default_max_keys, DEFAULT_KEY_SIZE, FILE_HEADER_SIZE, PAGE_HEADER_SIZE, PAGE_SIZE,
};
use crate::error::TreeError;

/// Options for creating a new database file.
#[derive(Debug, Clone)]
pub struct PagerOptions {
    /// Write and verify page payload checksums.
    pub enable_crc: bool,
    /// Fixed key width per slot; longer keys become extended keys.
    pub key_size: usize,
    /// Override the derived slot capacity per node. Intended for tests that
    /// need a small fanout; `None` derives the capacity from the geometry.
    pub max_keys: Option<usize>,
}

impl Default for PagerOptions {
    fn default() -> Self {
        Self {
            enable_crc: true,
            key_size: DEFAULT_KEY_SIZE,
            max_keys: None,
        }
    }
}

#[derive(Debug)]
pub struct Pager {
    storage: MmapStorage,
    freelist: Freelist,
    dirty: HashSet<PageAddr>,
    verified: HashSet<PageAddr>,
    crc_enabled: bool,
    key_size: usize,
    max_keys: usize,
}

impl Pager {
    pub fn create<P: AsRef<Path>>(path: P, options: PagerOptions) -> Result<Self> {
        ensure!(
            options.key_size >= 9 && options.key_size <= u16::MAX as usize,
            "key size {} out of range",
            options.key_size
        );

        let max_keys = options
            .max_keys
            .unwrap_or_else(|| default_max_keys(options.key_size));
        ensure!(
            max_keys >= 4 && max_keys <= default_max_keys(options.key_size),
            "max_keys {} out of range for key size {}",
            max_keys,
            options.key_size
        );

        let mut storage = MmapStorage::create(path, 1)?;

        let flags = if options.enable_crc { FILE_FLAG_CRC } else { 0 };
        let header = FileHeader::new(
            PAGE_SIZE as u32,
            options.key_size as u16,
            max_keys as u16,
            flags,
        );

        let page0 = storage.page_mut(0)?;
        page0[..FILE_HEADER_SIZE].copy_from_slice(zerocopy::IntoBytes::as_bytes(&header));

        Ok(Self {
            storage,
            freelist: Freelist::new(),
            dirty: HashSet::new(),
            verified: HashSet::new(),
            crc_enabled: options.enable_crc,
            key_size: options.key_size,
            max_keys,
        })
    }

    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let storage = MmapStorage::open(path)?;

        let page0 = storage.page(0)?;
        let header = FileHeader::from_bytes(page0)?;

        ensure!(
            header.page_size() as usize == PAGE_SIZE,
            "file page size {} does not match compiled page size {}",
            header.page_size(),
            PAGE_SIZE
        );

        let crc_enabled = header.crc_enabled();
        let key_size = header.key_size() as usize;
        let max_keys = header.max_keys() as usize;
        let freelist = Freelist::with_head(header.freelist_head(), header.freelist_count());

        Ok(Self {
            storage,
            freelist,
            dirty: HashSet::new(),
            verified: HashSet::new(),
            crc_enabled,
            key_size,
            max_keys,
        })
    }

    pub fn key_size(&self) -> usize {
        self.key_size
    }

    pub fn max_keys(&self) -> usize {
        self.max_keys
    }

    pub fn page_count(&self) -> u64 {
        self.storage.page_count()
    }

    pub fn root(&self) -> Result<PageAddr> {
        let page0 = self.storage.page(0)?;
        Ok(FileHeader::from_bytes(page0)?.root())
    }

    pub fn set_root(&mut self, addr: PageAddr) -> Result<()> {
        let page0 = self.storage.page_mut(0)?;
        FileHeader::from_bytes_mut(page0)?.set_root(addr);
        Ok(())
    }

    /// Fetches a page, verifying its checksum and self-address on the first
    /// access of this session.
    pub fn fetch(&mut self, addr: PageAddr) -> Result<&[u8]> {
        self.verify_on_first_fetch(addr)?;
        self.storage.page(addr)
    }

    /// Borrow of a page's payload (the bytes after the page header).
    pub fn payload(&mut self, addr: PageAddr) -> Result<&[u8]> {
        ensure!(addr != NIL_PAGE, "page 0 has no payload");
        self.verify_on_first_fetch(addr)?;
        let page = self.storage.page(addr)?;
        Ok(&page[PAGE_HEADER_SIZE..])
    }

    /// Mutable borrow of a page's payload; marks the page dirty.
    pub fn payload_mut(&mut self, addr: PageAddr) -> Result<&mut [u8]> {
        ensure!(addr != NIL_PAGE, "page 0 has no payload");
        self.verify_on_first_fetch(addr)?;
        self.dirty.insert(addr);
        let page = self.storage.page_mut(addr)?;
        Ok(&mut page[PAGE_HEADER_SIZE..])
    }

    pub fn page_type(&mut self, addr: PageAddr) -> Result<PageType> {
        let page = self.fetch(addr)?;
        Ok(PageHeader::from_bytes(page)?.page_type())
    }

    pub fn set_page_type(&mut self, addr: PageAddr, page_type: PageType) -> Result<()> {
        ensure!(addr != NIL_PAGE, "page 0 has a fixed type");
        self.dirty.insert(addr);
        let page = self.storage.page_mut(addr)?;
        PageHeader::from_bytes_mut(page)?.set_page_type(page_type);
        Ok(())
    }

    /// Allocates a page: reuses a freelisted page when one exists, otherwise
    /// grows the file. The page comes back zeroed with its header
    /// initialized and is marked dirty.
    pub fn alloc(&mut self, page_type: PageType) -> Result<PageAddr> {
        let trunk = self.freelist.head();
        let addr = match self.freelist.allocate(&mut self.storage)? {
            Some(addr) => {
                // Popping an entry rewrote the trunk's count; keep its
                // checksum in step. A handed-out trunk is reinitialized
                // below anyway.
                if addr != trunk {
                    self.dirty.insert(trunk);
                }
                addr
            }
            None => {
                let addr = self.storage.page_count();
                self.storage
                    .grow(addr + 1)
                    .wrap_err("failed to grow database file")?;
                addr
            }
        };

        let page = self.storage.page_mut(addr)?;
        page.fill(0);
        let header = PageHeader::from_bytes_mut(page)?;
        header.set_address(addr);
        header.set_page_type(page_type);

        self.dirty.insert(addr);
        self.verified.insert(addr);
        debug!(addr, ?page_type, "allocated page");
        Ok(addr)
    }

    /// Returns a page to the freelist. Callers inside an erase go through
    /// the transaction layer instead, which defers this call to commit.
    pub fn free_page(&mut self, addr: PageAddr) -> Result<()> {
        ensure!(addr != NIL_PAGE, "cannot free page 0");
        self.dirty.remove(&addr);
        self.verified.remove(&addr);

        let trunk = self.freelist.head();
        self.freelist.release(&mut self.storage, addr)?;
        // Either the old trunk gained an entry or the freed page became
        // the new trunk; the written page needs a fresh checksum.
        if self.freelist.head() == trunk {
            self.dirty.insert(trunk);
        } else {
            self.dirty.insert(addr);
        }
        debug!(addr, "freed page");
        Ok(())
    }

    pub fn is_dirty(&self, addr: PageAddr) -> bool {
        self.dirty.contains(&addr)
    }

    pub fn dirty_count(&self) -> usize {
        self.dirty.len()
    }

    /// Writes checksums for all dirty pages, persists the freelist state and
    /// syncs the file.
    pub fn flush_all(&mut self) -> Result<()> {
        let dirty: Vec<PageAddr> = self.dirty.drain().collect();

        if self.crc_enabled {
            for addr in &dirty {
                if *addr == NIL_PAGE {
                    continue;
                }
                let page = self.storage.page_mut(*addr)?;
                let crc = payload_checksum(&page[PAGE_HEADER_SIZE..], *addr);
                PageHeader::from_bytes_mut(page)?.set_crc(crc);
            }
        }

        let head = self.freelist.head();
        let count = self.freelist.free_count();
        let page0 = self.storage.page_mut(0)?;
        let header = FileHeader::from_bytes_mut(page0)?;
        header.set_freelist_head(head);
        header.set_freelist_count(count);

        self.storage.sync()?;
        trace!(pages = dirty.len(), "flushed dirty pages");
        Ok(())
    }

    fn verify_on_first_fetch(&mut self, addr: PageAddr) -> Result<()> {
        if addr == NIL_PAGE || self.verified.contains(&addr) {
            return Ok(());
        }

        let page = self.storage.page(addr)?;
        super::page::validate_page(page, addr).map_err(|e| {
            eyre::Report::new(TreeError::Corruption(format!("page {}: {}", addr, e)))
        })?;

        if self.crc_enabled {
            let header = PageHeader::from_bytes(page)?;
            let stored = header.crc();
            // A zero checksum means the page was never flushed with CRC.
            if stored != 0 {
                let computed = payload_checksum(&page[PAGE_HEADER_SIZE..], addr);
                if stored != computed {
                    return Err(eyre::Report::new(TreeError::Corruption(format!(
                        "page {} checksum mismatch: stored {:08x}, computed {:08x}",
                        addr, stored, computed
                    ))));
                }
            }
        }

        self.verified.insert(addr);
        Ok(())
    }
}

/// Murmur3-x86-32 of the payload, seeded with the page address.
pub fn payload_checksum(payload: &[u8], addr: PageAddr) -> u32 {
    let mut cursor = payload;
    // murmur3_32 only fails when the reader fails; a slice reader cannot.
    murmur3::murmur3_32(&mut cursor, addr as u32).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn create_pager(dir: &tempfile::TempDir) -> Pager {
        Pager::create(dir.path().join("test.db"), PagerOptions::default()).unwrap()
    }

    #[test]
    fn create_open_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.db");

        {
            let mut pager = Pager::create(&path, PagerOptions::default()).unwrap();
            let addr = pager.alloc(PageType::BtreeRoot).unwrap();
            pager.set_root(addr).unwrap();
            pager.flush_all().unwrap();
        }

        let pager = Pager::open(&path).unwrap();
        assert_eq!(pager.root().unwrap(), 1);
        assert_eq!(pager.key_size(), DEFAULT_KEY_SIZE);
    }

    #[test]
    fn alloc_reuses_freed_pages() {
        let dir = tempdir().unwrap();
        let mut pager = create_pager(&dir);

        let a = pager.alloc(PageType::BtreeIndex).unwrap();
        let b = pager.alloc(PageType::BtreeIndex).unwrap();
        assert_ne!(a, b);

        pager.free_page(b).unwrap();
        // b became a freelist trunk; allocating hands it back out.
        let c = pager.alloc(PageType::Blob).unwrap();
        assert_eq!(c, b);
        assert_eq!(pager.page_type(c).unwrap(), PageType::Blob);
    }

    #[test]
    fn payload_mut_marks_dirty() {
        let dir = tempdir().unwrap();
        let mut pager = create_pager(&dir);

        let addr = pager.alloc(PageType::BtreeIndex).unwrap();
        pager.flush_all().unwrap();
        assert!(!pager.is_dirty(addr));

        pager.payload_mut(addr).unwrap()[0] = 1;
        assert!(pager.is_dirty(addr));
    }

    #[test]
    fn checksum_mismatch_is_corruption() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.db");

        let addr;
        {
            let mut pager = Pager::create(&path, PagerOptions::default()).unwrap();
            addr = pager.alloc(PageType::BtreeIndex).unwrap();
            pager.payload_mut(addr).unwrap()[0] = 42;
            pager.flush_all().unwrap();
        }

        // Corrupt a payload byte behind the pager's back.
        {
            let mut storage = MmapStorage::open(&path).unwrap();
            storage.page_mut(addr).unwrap()[PAGE_HEADER_SIZE] = 0xFF;
            storage.sync().unwrap();
        }

        let mut pager = Pager::open(&path).unwrap();
        let err = pager.payload(addr).unwrap_err();
        assert!(crate::error::is_corruption(&err));
    }

    #[test]
    fn page0_has_no_payload() {
        let dir = tempdir().unwrap();
        let mut pager = create_pager(&dir);
        assert!(pager.payload(0).is_err());
        assert!(pager.payload_mut(0).is_err());
    }

    #[test]
    fn checksum_is_seeded_by_address() {
        let payload = [1u8, 2, 3, 4];
        assert_ne!(payload_checksum(&payload, 1), payload_checksum(&payload, 2));
    }
}
