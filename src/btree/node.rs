//! # B+Tree Node View
//!
//! Typed zero-copy view over the payload of a B+tree page. A node is a
//! 28-byte header followed by a packed array of fixed-stride slots:
//!
//! ```text
//! Offset  Size  Field     Description
//! ------  ----  --------  ----------------------------------------
//! 0       1     flags     Node flags (unused, reserved)
//! 1       1     is_leaf   1 for leaves, 0 for internal nodes
//! 2       2     count     Number of populated slots
//! 4       8     ptr_left  Leftmost child (internal nodes only)
//! 12      8     left      Previous node at the same level (0 = none)
//! 20      8     right     Next node at the same level (0 = none)
//! 28      ...   slots     count * (SLOT_FIXED_SIZE + key_size) bytes
//! ```
//!
//! The slot stride is constant per tree, so slot access is pointer
//! arithmetic. Bulk slot movement (erase memmove, shift, merge) is a single
//! `copy_within` on the payload.
//!
//! `NodeView` borrows immutably, `NodeViewMut` mutably; neither allocates.
//! Dirty marking happens at the pager (`payload_mut` marks the page), so
//! obtaining a `NodeViewMut` through the pager is what dirties the page.

use eyre::{ensure, Result};
use zerocopy::little_endian::{U16, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::config::{NODE_HEADER_SIZE, SLOT_FIXED_SIZE};
use crate::storage::PageAddr;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct NodeHeader {
    flags: u8,
    is_leaf: u8,
    count: U16,
    ptr_left: U64,
    left: U64,
    right: U64,
}

const _: () = assert!(std::mem::size_of::<NodeHeader>() == NODE_HEADER_SIZE);

impl NodeHeader {
    zerocopy_accessors! {
        count: u16,
        ptr_left: u64,
        left: u64,
        right: u64,
    }

    pub fn is_leaf(&self) -> bool {
        self.is_leaf != 0
    }

    pub fn set_is_leaf(&mut self, is_leaf: bool) {
        self.is_leaf = is_leaf as u8;
    }
}

pub fn slot_stride(key_size: usize) -> usize {
    SLOT_FIXED_SIZE + key_size
}

fn slot_offset(index: usize, key_size: usize) -> usize {
    NODE_HEADER_SIZE + index * slot_stride(key_size)
}

#[derive(Debug)]
pub struct NodeView<'a> {
    payload: &'a [u8],
    key_size: usize,
}

impl<'a> NodeView<'a> {
    pub fn new(payload: &'a [u8], key_size: usize) -> Result<Self> {
        ensure!(
            payload.len() >= NODE_HEADER_SIZE,
            "payload too small for a node: {}",
            payload.len()
        );
        Ok(Self { payload, key_size })
    }

    fn header(&self) -> &NodeHeader {
        NodeHeader::ref_from_bytes(&self.payload[..NODE_HEADER_SIZE])
            .expect("payload length checked in new")
    }

    pub fn is_leaf(&self) -> bool {
        self.header().is_leaf()
    }

    pub fn count(&self) -> usize {
        self.header().count() as usize
    }

    pub fn ptr_left(&self) -> PageAddr {
        self.header().ptr_left()
    }

    pub fn left(&self) -> PageAddr {
        self.header().left()
    }

    pub fn right(&self) -> PageAddr {
        self.header().right()
    }

    /// Borrow of the slot at `index`. Indices up to the physical capacity
    /// are addressable; callers enforce `count` where it matters.
    pub fn slot(&self, index: usize) -> Result<&'a [u8]> {
        let stride = slot_stride(self.key_size);
        let offset = slot_offset(index, self.key_size);
        ensure!(
            offset + stride <= self.payload.len(),
            "slot index {} exceeds page capacity",
            index
        );
        Ok(&self.payload[offset..offset + stride])
    }
}

#[derive(Debug)]
pub struct NodeViewMut<'a> {
    payload: &'a mut [u8],
    key_size: usize,
}

impl<'a> NodeViewMut<'a> {
    pub fn new(payload: &'a mut [u8], key_size: usize) -> Result<Self> {
        ensure!(
            payload.len() >= NODE_HEADER_SIZE,
            "payload too small for a node: {}",
            payload.len()
        );
        Ok(Self { payload, key_size })
    }

    /// Zeroes the header region and stamps the leaf flag. Slot bytes are
    /// left as-is; `count` guards what is live.
    pub fn init(payload: &'a mut [u8], key_size: usize, is_leaf: bool) -> Result<Self> {
        let mut node = Self::new(payload, key_size)?;
        node.payload[..NODE_HEADER_SIZE].fill(0);
        node.header_mut().set_is_leaf(is_leaf);
        Ok(node)
    }

    fn header(&self) -> &NodeHeader {
        NodeHeader::ref_from_bytes(&self.payload[..NODE_HEADER_SIZE])
            .expect("payload length checked in new")
    }

    fn header_mut(&mut self) -> &mut NodeHeader {
        NodeHeader::mut_from_bytes(&mut self.payload[..NODE_HEADER_SIZE])
            .expect("payload length checked in new")
    }

    pub fn is_leaf(&self) -> bool {
        self.header().is_leaf()
    }

    pub fn count(&self) -> usize {
        self.header().count() as usize
    }

    pub fn set_count(&mut self, count: usize) {
        self.header_mut().set_count(count as u16);
    }

    pub fn ptr_left(&self) -> PageAddr {
        self.header().ptr_left()
    }

    pub fn set_ptr_left(&mut self, addr: PageAddr) {
        self.header_mut().set_ptr_left(addr);
    }

    pub fn left(&self) -> PageAddr {
        self.header().left()
    }

    pub fn set_left(&mut self, addr: PageAddr) {
        self.header_mut().set_left(addr);
    }

    pub fn right(&self) -> PageAddr {
        self.header().right()
    }

    pub fn set_right(&mut self, addr: PageAddr) {
        self.header_mut().set_right(addr);
    }

    pub fn slot(&self, index: usize) -> Result<&[u8]> {
        let stride = slot_stride(self.key_size);
        let offset = slot_offset(index, self.key_size);
        ensure!(
            offset + stride <= self.payload.len(),
            "slot index {} exceeds page capacity",
            index
        );
        Ok(&self.payload[offset..offset + stride])
    }

    pub fn slot_mut(&mut self, index: usize) -> Result<&mut [u8]> {
        let stride = slot_stride(self.key_size);
        let offset = slot_offset(index, self.key_size);
        ensure!(
            offset + stride <= self.payload.len(),
            "slot index {} exceeds page capacity",
            index
        );
        Ok(&mut self.payload[offset..offset + stride])
    }

    /// Borrow of the packed slot range `[start, end)`.
    pub fn slots(&self, start: usize, end: usize) -> Result<&[u8]> {
        ensure!(start <= end, "invalid slot range {}..{}", start, end);
        let lo = slot_offset(start, self.key_size);
        let hi = slot_offset(end, self.key_size);
        ensure!(
            hi <= self.payload.len(),
            "slot range {}..{} exceeds page capacity",
            start,
            end
        );
        Ok(&self.payload[lo..hi])
    }

    /// Writes packed slot bytes starting at slot `index`.
    pub fn write_slots(&mut self, index: usize, bytes: &[u8]) -> Result<()> {
        let stride = slot_stride(self.key_size);
        ensure!(
            bytes.len() % stride == 0,
            "slot bytes length {} is not a multiple of the stride {}",
            bytes.len(),
            stride
        );
        let lo = slot_offset(index, self.key_size);
        ensure!(
            lo + bytes.len() <= self.payload.len(),
            "slot write at {} exceeds page capacity",
            index
        );
        self.payload[lo..lo + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    /// Moves slots `[from, count)` `by` strides to the left, overwriting the
    /// slots in front of them. Used by entry removal and shift.
    pub fn shift_slots_left(&mut self, from: usize, count: usize, by: usize) -> Result<()> {
        ensure!(from >= by, "cannot shift slot {} left by {}", from, by);
        if from >= count || by == 0 {
            return Ok(());
        }
        let stride = slot_stride(self.key_size);
        let src_lo = slot_offset(from, self.key_size);
        let src_hi = slot_offset(count, self.key_size);
        ensure!(src_hi <= self.payload.len(), "slot range exceeds capacity");
        self.payload.copy_within(src_lo..src_hi, src_lo - by * stride);
        Ok(())
    }

    /// Moves slots `[0, count)` `by` strides to the right, opening a gap at
    /// the front. Used by prepends during shift and by insertion.
    pub fn shift_slots_right(&mut self, from: usize, count: usize, by: usize) -> Result<()> {
        if from >= count || by == 0 {
            return Ok(());
        }
        let stride = slot_stride(self.key_size);
        let src_lo = slot_offset(from, self.key_size);
        let src_hi = slot_offset(count, self.key_size);
        let dst_hi = src_hi + by * stride;
        ensure!(
            dst_hi <= self.payload.len(),
            "shifting {} slots right by {} exceeds page capacity",
            count - from,
            by
        );
        self.payload.copy_within(src_lo..src_hi, src_lo + by * stride);
        Ok(())
    }

    /// Removes the slot at `index`: closes the gap and decrements `count`.
    pub fn remove_slot(&mut self, index: usize) -> Result<()> {
        let count = self.count();
        ensure!(
            index < count,
            "slot index {} out of bounds (count={})",
            index,
            count
        );
        if index + 1 < count {
            self.shift_slots_left(index + 1, count, 1)?;
        }
        self.set_count(count - 1);
        Ok(())
    }

    /// Opens a gap at `index` and writes one slot; increments `count`.
    pub fn insert_slot(&mut self, index: usize, bytes: &[u8]) -> Result<()> {
        let count = self.count();
        ensure!(
            index <= count,
            "insert index {} out of bounds (count={})",
            index,
            count
        );
        self.shift_slots_right(index, count, 1)?;
        self.write_slots(index, bytes)?;
        self.set_count(count + 1);
        Ok(())
    }
}
