//! # Memory-Mapped File Storage
//!
//! `MmapStorage` maps the database file directly into the process address
//! space and hands out page-sized slices. The OS handles paging, so cached
//! reads cost a bounds check and pointer arithmetic.
//!
//! ## Safety Model
//!
//! A memory-mapped region becomes invalid when the file is grown and
//! remapped. Instead of runtime guards, the borrow checker enforces safety:
//!
//! ```text
//! page(&self) -> &[u8]              // Immutable borrow of self
//! page_mut(&mut self) -> &mut [u8]  // Mutable borrow of self
//! grow(&mut self)                   // Exclusive borrow
//! ```
//!
//! Since `grow()` requires `&mut self`, no page reference can be live across
//! a remap. Zero runtime overhead, compile-time enforcement.
//!
//! ## File Format
//!
//! Database files are concatenated fixed-size pages:
//!
//! ```text
//! Offset 0:        Page 0 (file header page)
//! Offset 16384:    Page 1
//! Offset 32768:    Page 2
//! ...
//! ```
//!
//! The file size is always a multiple of `PAGE_SIZE`.

use std::fs::{File, OpenOptions};
use std::path::Path;

use eyre::{ensure, Result, WrapErr};
use memmap2::MmapMut;

use super::PageAddr;
use crate::config::PAGE_SIZE;

#[derive(Debug)]
pub struct MmapStorage {
    file: File,
    mmap: MmapMut,
    page_count: u64,
}

impl MmapStorage {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .wrap_err_with(|| format!("failed to open database file '{}'", path.display()))?;

        let metadata = file
            .metadata()
            .wrap_err_with(|| format!("failed to get metadata for '{}'", path.display()))?;

        let file_size = metadata.len();

        ensure!(
            file_size > 0,
            "cannot open empty database file '{}'",
            path.display()
        );

        ensure!(
            file_size % PAGE_SIZE as u64 == 0,
            "database file '{}' size {} is not a multiple of page size {}",
            path.display(),
            file_size,
            PAGE_SIZE
        );

        let page_count = file_size / PAGE_SIZE as u64;

        // SAFETY: MmapMut::map_mut is unsafe because memory-mapped files can
        // be modified externally. This is safe because:
        // 1. The file is opened with read+write access and the engine assumes
        //    exclusive ownership of its files (single-writer contract)
        // 2. The mmap lifetime is tied to MmapStorage, preventing
        //    use-after-unmap
        // 3. All access goes through page()/page_mut() which bounds-check
        let mmap = unsafe {
            MmapMut::map_mut(&file)
                .wrap_err_with(|| format!("failed to memory-map '{}'", path.display()))?
        };

        Ok(Self {
            file,
            mmap,
            page_count,
        })
    }

    pub fn create<P: AsRef<Path>>(path: P, initial_page_count: u64) -> Result<Self> {
        let path = path.as_ref();

        ensure!(
            initial_page_count > 0,
            "initial page count must be at least 1"
        );

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .wrap_err_with(|| format!("failed to create database file '{}'", path.display()))?;

        let file_size = initial_page_count * PAGE_SIZE as u64;

        file.set_len(file_size)
            .wrap_err_with(|| format!("failed to set file size to {} bytes", file_size))?;

        // SAFETY: same argument as in open(); additionally the file was just
        // created with truncate=true, so its content is fully zeroed.
        let mmap = unsafe {
            MmapMut::map_mut(&file)
                .wrap_err_with(|| format!("failed to memory-map '{}'", path.display()))?
        };

        Ok(Self {
            file,
            mmap,
            page_count: initial_page_count,
        })
    }

    pub fn page(&self, addr: PageAddr) -> Result<&[u8]> {
        ensure!(
            addr < self.page_count,
            "page {} out of bounds (page_count={})",
            addr,
            self.page_count
        );

        let offset = addr as usize * PAGE_SIZE;
        Ok(&self.mmap[offset..offset + PAGE_SIZE])
    }

    pub fn page_mut(&mut self, addr: PageAddr) -> Result<&mut [u8]> {
        ensure!(
            addr < self.page_count,
            "page {} out of bounds (page_count={})",
            addr,
            self.page_count
        );

        let offset = addr as usize * PAGE_SIZE;
        Ok(&mut self.mmap[offset..offset + PAGE_SIZE])
    }

    pub fn grow(&mut self, new_page_count: u64) -> Result<()> {
        if new_page_count <= self.page_count {
            return Ok(());
        }

        self.mmap
            .flush_async()
            .wrap_err("failed to flush mmap before grow")?;

        let new_size = new_page_count * PAGE_SIZE as u64;

        self.file
            .set_len(new_size)
            .wrap_err_with(|| format!("failed to extend file to {} bytes", new_size))?;

        // SAFETY: grow() holds &mut self, so the borrow checker guarantees no
        // page slice is live; the old map is dropped on assignment and the
        // file was extended before remapping.
        self.mmap =
            unsafe { MmapMut::map_mut(&self.file).wrap_err("failed to remap file after grow")? };

        self.page_count = new_page_count;

        Ok(())
    }

    pub fn sync(&self) -> Result<()> {
        self.mmap.flush().wrap_err("failed to sync mmap to disk")
    }

    pub fn page_count(&self) -> u64 {
        self.page_count
    }

    pub fn file_size(&self) -> u64 {
        self.page_count * PAGE_SIZE as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn create_and_reopen_preserves_data() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.db");

        {
            let mut storage = MmapStorage::create(&path, 3).unwrap();
            storage.page_mut(2).unwrap()[100] = 0xAB;
            storage.sync().unwrap();
        }

        let storage = MmapStorage::open(&path).unwrap();
        assert_eq!(storage.page_count(), 3);
        assert_eq!(storage.page(2).unwrap()[100], 0xAB);
    }

    #[test]
    fn page_out_of_bounds_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.db");
        let storage = MmapStorage::create(&path, 2).unwrap();

        let err = storage.page(2).unwrap_err();
        assert!(err.to_string().contains("out of bounds"));
    }

    #[test]
    fn grow_extends_the_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.db");
        let mut storage = MmapStorage::create(&path, 1).unwrap();

        storage.grow(5).unwrap();
        assert_eq!(storage.page_count(), 5);
        assert_eq!(storage.file_size(), 5 * PAGE_SIZE as u64);

        // shrinking is a no-op
        storage.grow(2).unwrap();
        assert_eq!(storage.page_count(), 5);
    }
}
