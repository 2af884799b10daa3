//! # Page Types and Header Layout
//!
//! This module defines the page structure for burrowdb's storage layer. Every
//! 16KB page begins with a 24-byte header followed by the payload.
//!
//! ## Page Header Layout (24 bytes)
//!
//! ```text
//! Offset  Size  Field      Description
//! ------  ----  ---------  ----------------------------------------
//! 0       8     address    Self-address of the page (page number)
//! 8       4     crc        Murmur3-x86-32 of the payload, seeded with
//!                          the page address; written on flush when
//!                          checksums are enabled
//! 12      1     page_type  Type tag (BtreeRoot, BtreeIndex, Blob, ...)
//! 13      1     flags      Page flags
//! 14      10    reserved   Reserved for future use
//! ```
//!
//! ## Page Types
//!
//! - **Header** (0x01): page 0, holds the file header; the only page that
//!   opts out of the page header (`is_without_header`)
//! - **BtreeRoot** (0x02): the root node of a B+tree
//! - **BtreeIndex** (0x03): any non-root B+tree node
//! - **Blob** (0x20): overflow page holding extended-key bytes
//! - **Freelist** (0x30): free page list trunk
//!
//! ## Zero-Copy Access
//!
//! `PageHeader` uses `zerocopy` for safe transmutation from raw bytes, so
//! headers are read directly from mmap'd pages without copying. All
//! multi-byte fields are little-endian.

use eyre::{ensure, Result};
use zerocopy::little_endian::{U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::config::{PAGE_HEADER_SIZE, PAGE_SIZE};

/// Address of a page, expressed as its page number within the file.
/// Address 0 names the file header page and doubles as "no page".
pub type PageAddr = u64;

/// The null page address.
pub const NIL_PAGE: PageAddr = 0;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageType {
    Unknown = 0x00,
    Header = 0x01,
    BtreeRoot = 0x02,
    BtreeIndex = 0x03,
    Blob = 0x20,
    Freelist = 0x30,
}

impl PageType {
    pub fn from_byte(b: u8) -> Self {
        match b {
            0x01 => PageType::Header,
            0x02 => PageType::BtreeRoot,
            0x03 => PageType::BtreeIndex,
            0x20 => PageType::Blob,
            0x30 => PageType::Freelist,
            _ => PageType::Unknown,
        }
    }

    pub fn is_btree(self) -> bool {
        matches!(self, PageType::BtreeRoot | PageType::BtreeIndex)
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct PageHeader {
    address: U64,
    crc: U32,
    page_type: u8,
    flags: u8,
    reserved: [u8; 10],
}

const _: () = assert!(std::mem::size_of::<PageHeader>() == PAGE_HEADER_SIZE);

impl PageHeader {
    pub fn new(address: PageAddr, page_type: PageType) -> Self {
        Self {
            address: U64::new(address),
            crc: U32::new(0),
            page_type: page_type as u8,
            flags: 0,
            reserved: [0u8; 10],
        }
    }

    pub fn from_bytes(data: &[u8]) -> Result<&Self> {
        ensure!(
            data.len() >= PAGE_HEADER_SIZE,
            "buffer too small for PageHeader: {} < {}",
            data.len(),
            PAGE_HEADER_SIZE
        );

        Self::ref_from_bytes(&data[..PAGE_HEADER_SIZE])
            .map_err(|e| eyre::eyre!("failed to read PageHeader: {:?}", e))
    }

    pub fn from_bytes_mut(data: &mut [u8]) -> Result<&mut Self> {
        ensure!(
            data.len() >= PAGE_HEADER_SIZE,
            "buffer too small for PageHeader: {} < {}",
            data.len(),
            PAGE_HEADER_SIZE
        );

        Self::mut_from_bytes(&mut data[..PAGE_HEADER_SIZE])
            .map_err(|e| eyre::eyre!("failed to read PageHeader: {:?}", e))
    }

    zerocopy_accessors! {
        address: u64,
        crc: u32,
    }

    pub fn page_type(&self) -> PageType {
        PageType::from_byte(self.page_type)
    }

    pub fn set_page_type(&mut self, page_type: PageType) {
        self.page_type = page_type as u8;
    }
}

/// Validates the header of a raw page against its expected address.
/// A fully zeroed page is accepted; freshly grown pages look like that.
pub fn validate_page(data: &[u8], expected_addr: PageAddr) -> Result<()> {
    ensure!(
        data.len() == PAGE_SIZE,
        "invalid page size: {} != {}",
        data.len(),
        PAGE_SIZE
    );

    let header = PageHeader::from_bytes(data)?;

    let is_zeroed = header.address() == 0 && header.page_type == 0 && header.flags == 0;
    if is_zeroed {
        return Ok(());
    }

    ensure!(
        header.page_type() != PageType::Unknown,
        "invalid page type: {:02x}",
        header.page_type
    );

    ensure!(
        header.address() == expected_addr,
        "page self-address {} does not match location {}",
        header.address(),
        expected_addr
    );

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_type_from_byte() {
        assert_eq!(PageType::from_byte(0x00), PageType::Unknown);
        assert_eq!(PageType::from_byte(0x01), PageType::Header);
        assert_eq!(PageType::from_byte(0x02), PageType::BtreeRoot);
        assert_eq!(PageType::from_byte(0x03), PageType::BtreeIndex);
        assert_eq!(PageType::from_byte(0x20), PageType::Blob);
        assert_eq!(PageType::from_byte(0x30), PageType::Freelist);
        assert_eq!(PageType::from_byte(0xFF), PageType::Unknown);
    }

    #[test]
    fn page_header_size_is_24_bytes() {
        assert_eq!(std::mem::size_of::<PageHeader>(), 24);
    }

    #[test]
    fn page_header_roundtrip() {
        let mut data = [0u8; PAGE_HEADER_SIZE];
        {
            let header = PageHeader::from_bytes_mut(&mut data).unwrap();
            header.set_address(7);
            header.set_page_type(PageType::BtreeRoot);
            header.set_crc(0xDEADBEEF);
        }

        let header = PageHeader::from_bytes(&data).unwrap();
        assert_eq!(header.address(), 7);
        assert_eq!(header.page_type(), PageType::BtreeRoot);
        assert_eq!(header.crc(), 0xDEADBEEF);
    }

    #[test]
    fn validate_page_zeroed_is_valid() {
        let data = vec![0u8; PAGE_SIZE];
        assert!(validate_page(&data, 3).is_ok());
    }

    #[test]
    fn validate_page_rejects_wrong_address() {
        let mut data = vec![0u8; PAGE_SIZE];
        {
            let header = PageHeader::from_bytes_mut(&mut data).unwrap();
            header.set_address(5);
            header.set_page_type(PageType::BtreeIndex);
        }

        assert!(validate_page(&data, 5).is_ok());
        let err = validate_page(&data, 6).unwrap_err();
        assert!(err.to_string().contains("self-address"));
    }

    #[test]
    fn validate_page_rejects_unknown_type() {
        let mut data = vec![0u8; PAGE_SIZE];
        data[0..8].copy_from_slice(&9u64.to_le_bytes());
        data[12] = 0x77;

        let err = validate_page(&data, 9).unwrap_err();
        assert!(err.to_string().contains("invalid page type"));
    }
}
