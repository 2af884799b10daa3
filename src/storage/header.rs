//! # File Header
//!
//! The first 128 bytes of page 0 hold the file header: magic, version, the
//! tree geometry (key size, max keys), the root address, and the persisted
//! freelist state. The rest of page 0 is unused; page 0 is the one page that
//! carries no page header (`is_without_header`).
//!
//! All multi-byte fields are little-endian via zerocopy wrappers, so the
//! header is read and written in place on the mmap'd page.

use eyre::{ensure, Result};
use zerocopy::little_endian::{U16, U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::config::FILE_HEADER_SIZE;

pub const FILE_MAGIC: &[u8; 16] = b"burrowdb v1\x00\x00\x00\x00\x00";
pub const CURRENT_VERSION: u32 = 1;

/// File flag: page payload checksums are written on flush and verified on
/// first fetch.
pub const FILE_FLAG_CRC: u32 = 1 << 0;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct FileHeader {
    magic: [u8; 16],
    version: U32,
    page_size: U32,
    key_size: U16,
    max_keys: U16,
    flags: U32,
    root: U64,
    freelist_head: U64,
    freelist_count: U64,
    reserved: [u8; 72],
}

const _: () = assert!(std::mem::size_of::<FileHeader>() == FILE_HEADER_SIZE);

impl FileHeader {
    pub fn new(page_size: u32, key_size: u16, max_keys: u16, flags: u32) -> Self {
        Self {
            magic: *FILE_MAGIC,
            version: U32::new(CURRENT_VERSION),
            page_size: U32::new(page_size),
            key_size: U16::new(key_size),
            max_keys: U16::new(max_keys),
            flags: U32::new(flags),
            root: U64::new(0),
            freelist_head: U64::new(0),
            freelist_count: U64::new(0),
            reserved: [0u8; 72],
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<&Self> {
        ensure!(
            bytes.len() >= FILE_HEADER_SIZE,
            "buffer too small for FileHeader: {} < {}",
            bytes.len(),
            FILE_HEADER_SIZE
        );

        let header = Self::ref_from_bytes(&bytes[..FILE_HEADER_SIZE])
            .map_err(|e| eyre::eyre!("failed to parse FileHeader: {:?}", e))?;

        ensure!(
            &header.magic == FILE_MAGIC,
            "invalid magic bytes in database file"
        );

        ensure!(
            header.version() == CURRENT_VERSION,
            "unsupported file version: {} (expected {})",
            header.version(),
            CURRENT_VERSION
        );

        Ok(header)
    }

    pub fn from_bytes_mut(bytes: &mut [u8]) -> Result<&mut Self> {
        ensure!(
            bytes.len() >= FILE_HEADER_SIZE,
            "buffer too small for FileHeader: {} < {}",
            bytes.len(),
            FILE_HEADER_SIZE
        );

        Self::mut_from_bytes(&mut bytes[..FILE_HEADER_SIZE])
            .map_err(|e| eyre::eyre!("failed to parse FileHeader: {:?}", e))
    }

    // The geometry fields are fixed at creation time; only the root and
    // the freelist state are rewritten over the file's life.
    zerocopy_getters! {
        version: u32,
        page_size: u32,
        key_size: u16,
        max_keys: u16,
        flags: u32,
    }

    zerocopy_accessors! {
        root: u64,
        freelist_head: u64,
        freelist_count: u64,
    }

    pub fn crc_enabled(&self) -> bool {
        self.flags.get() & FILE_FLAG_CRC != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{default_max_keys, DEFAULT_KEY_SIZE, PAGE_SIZE};

    #[test]
    fn file_header_is_128_bytes() {
        assert_eq!(std::mem::size_of::<FileHeader>(), FILE_HEADER_SIZE);
    }

    #[test]
    fn file_header_roundtrip() {
        let max = default_max_keys(DEFAULT_KEY_SIZE) as u16;
        let header = FileHeader::new(PAGE_SIZE as u32, DEFAULT_KEY_SIZE as u16, max, FILE_FLAG_CRC);

        let mut buf = [0u8; FILE_HEADER_SIZE];
        buf.copy_from_slice(zerocopy::IntoBytes::as_bytes(&header));

        let parsed = FileHeader::from_bytes(&buf).unwrap();
        assert_eq!(parsed.version(), CURRENT_VERSION);
        assert_eq!(parsed.page_size(), PAGE_SIZE as u32);
        assert_eq!(parsed.key_size(), DEFAULT_KEY_SIZE as u16);
        assert_eq!(parsed.max_keys(), max);
        assert!(parsed.crc_enabled());
        assert_eq!(parsed.root(), 0);
    }

    #[test]
    fn bad_magic_is_rejected() {
        let buf = [0u8; FILE_HEADER_SIZE];
        assert!(FileHeader::from_bytes(&buf).is_err());
    }

    #[test]
    fn mutation_in_place() {
        let header = FileHeader::new(PAGE_SIZE as u32, 32, 100, 0);
        let mut buf = [0u8; FILE_HEADER_SIZE];
        buf.copy_from_slice(zerocopy::IntoBytes::as_bytes(&header));

        {
            let header = FileHeader::from_bytes_mut(&mut buf).unwrap();
            header.set_root(17);
            header.set_freelist_head(4);
            header.set_freelist_count(9);
        }

        let parsed = FileHeader::from_bytes(&buf).unwrap();
        assert_eq!(parsed.root(), 17);
        assert_eq!(parsed.freelist_head(), 4);
        assert_eq!(parsed.freelist_count(), 9);
    }
}
