//! # Insert and Split
//!
//! Key insertion with node splitting. The descent records the path of
//! internal nodes; a full leaf splits around its median, links into the
//! sibling chain and promotes a separator, which walks back up the recorded
//! path splitting internal nodes as needed. When the old root splits, a new
//! internal root is grown above it.
//!
//! Separator promotion out of a leaf *copies* the boundary key (duplicating
//! its blob when extended); promotion out of an internal node *moves* the
//! median key, whose child pointer becomes the new right node's `ptr_left`.

use eyre::{ensure, Result};
use tracing::debug;

use super::node::{slot_stride, NodeViewMut};
use super::slot::{
    copy_slot, empty_slot, SlotBuf, SlotView, SlotViewMut, KEY_DUPLICATES, LEAF_ONLY_FLAGS,
};
use super::traverse::{child_for, find_slot, node_meta, slot_bytes};
use super::tree::Btree;
use crate::error::TreeError;
use crate::storage::{blob, PageAddr, PageType, NIL_PAGE};

/// Behavior when the key already exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertMode {
    /// Fail with `DuplicateKey`.
    Strict,
    /// Replace the record id in place (the whole duplicate list, if any).
    Overwrite,
    /// Append the record id to the key's duplicate list.
    Duplicate,
}

impl Btree {
    /// Inserts `key` with `record_id`. Existing-key behavior is selected by
    /// `mode`; a missing key is inserted regardless of mode.
    pub fn insert(&mut self, key: &[u8], record_id: u64, mode: InsertMode) -> Result<()> {
        ensure!(!key.is_empty(), "cannot insert an empty key");
        ensure!(
            key.len() <= u16::MAX as usize,
            "key length {} exceeds the {} byte maximum",
            key.len(),
            u16::MAX
        );

        let root = self.pager.root()?;
        let key_size = self.pager.key_size();

        let mut stack: Vec<(PageAddr, i64)> = Vec::new();
        let mut addr = root;
        loop {
            let meta = node_meta(&mut self.pager, addr, key_size)?;
            if meta.is_leaf {
                break;
            }
            let (child, m) = child_for(&mut self.pager, &mut self.extkeys, addr, key, key_size)?;
            stack.push((addr, m.slot));
            addr = child;
        }

        let m = find_slot(&mut self.pager, &mut self.extkeys, addr, key, key_size)?;
        if m.exact {
            return self.update_existing(addr, m.slot as usize, record_id, mode);
        }

        let slot = self.build_leaf_slot(key, record_id)?;
        let pos = (m.slot + 1) as usize;
        self.insert_at(addr, pos, slot, stack, true)?;
        debug!(key_len = key.len(), record_id, "inserted key");
        Ok(())
    }

    fn update_existing(
        &mut self,
        leaf: PageAddr,
        slot: usize,
        record_id: u64,
        mode: InsertMode,
    ) -> Result<()> {
        let key_size = self.pager.key_size();
        let bytes = slot_bytes(&mut self.pager, leaf, slot, key_size)?;
        let view = SlotView::new(&bytes, key_size);
        let had_duplicates = view.has_duplicates();
        let old_ptr = view.ptr();

        match mode {
            InsertMode::Strict => Err(eyre::Report::new(TreeError::DuplicateKey)),
            InsertMode::Overwrite => {
                if had_duplicates {
                    blob::free(&mut self.pager, old_ptr)?;
                }
                let payload = self.pager.payload_mut(leaf)?;
                let mut node = NodeViewMut::new(payload, key_size)?;
                let mut slot_mut = SlotViewMut::new(node.slot_mut(slot)?, key_size);
                let flags = slot_mut.view().flags() & !KEY_DUPLICATES;
                slot_mut.set_flags(flags);
                slot_mut.set_ptr(record_id);
                Ok(())
            }
            InsertMode::Duplicate => {
                let new_ptr = if had_duplicates {
                    super::dupe::append(&mut self.pager, old_ptr, record_id)?
                } else {
                    super::dupe::write_list(&mut self.pager, &[old_ptr, record_id])?
                };
                let payload = self.pager.payload_mut(leaf)?;
                let mut node = NodeViewMut::new(payload, key_size)?;
                let mut slot_mut = SlotViewMut::new(node.slot_mut(slot)?, key_size);
                let flags = slot_mut.view().flags() | KEY_DUPLICATES;
                slot_mut.set_flags(flags);
                slot_mut.set_ptr(new_ptr);
                Ok(())
            }
        }
    }

    /// Builds the slot bytes for a fresh leaf entry, allocating the
    /// extended-key blob when the key exceeds the fixed width.
    fn build_leaf_slot(&mut self, key: &[u8], record_id: u64) -> Result<SlotBuf> {
        let key_size = self.pager.key_size();
        let mut buf = empty_slot(key_size);
        let mut slot = SlotViewMut::new(&mut buf, key_size);

        if key.len() > key_size {
            let id = blob::allocate(&mut self.pager, key)?;
            slot.write_extended_key(key, id);
        } else {
            slot.write_inline_key(key);
        }
        slot.set_ptr(record_id);
        Ok(buf)
    }

    /// Inserts one slot at `pos` of `addr`, splitting when the node is full
    /// and propagating the separator up the recorded path.
    fn insert_at(
        &mut self,
        addr: PageAddr,
        pos: usize,
        slot: SlotBuf,
        stack: Vec<(PageAddr, i64)>,
        is_leaf: bool,
    ) -> Result<()> {
        let key_size = self.pager.key_size();
        let meta = node_meta(&mut self.pager, addr, key_size)?;

        if meta.count < self.pager.max_keys() {
            self.uncouple_all_on(addr, pos)?;
            let payload = self.pager.payload_mut(addr)?;
            let mut node = NodeViewMut::new(payload, key_size)?;
            node.insert_slot(pos, &slot)?;
            return Ok(());
        }

        self.split_and_insert(addr, pos, slot, stack, is_leaf)
    }

    fn split_and_insert(
        &mut self,
        addr: PageAddr,
        pos: usize,
        new_slot: SlotBuf,
        stack: Vec<(PageAddr, i64)>,
        is_leaf: bool,
    ) -> Result<()> {
        let key_size = self.pager.key_size();
        let stride = slot_stride(key_size);
        let meta = node_meta(&mut self.pager, addr, key_size)?;

        // Gather the node's slots with the new one spliced in.
        let mut all: Vec<u8> = {
            let payload = self.pager.payload(addr)?;
            let node = super::node::NodeView::new(payload, key_size)?;
            let mut bytes = Vec::with_capacity((meta.count + 1) * stride);
            for i in 0..meta.count {
                bytes.extend_from_slice(node.slot(i)?);
            }
            bytes
        };
        let splice_at = pos * stride;
        all.splice(splice_at..splice_at, new_slot.iter().copied());

        let total = meta.count + 1;
        let mid = total / 2;

        self.uncouple_all_on(addr, 0)?;
        let right_addr = self.pager.alloc(PageType::BtreeIndex)?;
        debug!(addr, right_addr, total, "splitting node");

        let old_right = meta.right;
        let separator: SlotBuf;

        if is_leaf {
            // Left keeps [0, mid), right takes [mid, total).
            {
                let payload = self.pager.payload_mut(addr)?;
                let mut node = NodeViewMut::new(payload, key_size)?;
                node.write_slots(0, &all[..mid * stride])?;
                node.set_count(mid);
                node.set_right(right_addr);
            }
            {
                let payload = self.pager.payload_mut(right_addr)?;
                let mut node = NodeViewMut::init(payload, key_size, true)?;
                node.write_slots(0, &all[mid * stride..])?;
                node.set_count(total - mid);
                node.set_left(addr);
                node.set_right(old_right);
            }

            // The separator is a copy of the right node's first key; the
            // copy owns a fresh blob when the key is extended.
            let boundary = &all[mid * stride..(mid + 1) * stride];
            let mut sep = copy_slot(&mut self.pager, boundary, key_size)?;
            let mut sep_mut = SlotViewMut::new(&mut sep, key_size);
            let flags = sep_mut.view().flags() & !LEAF_ONLY_FLAGS;
            sep_mut.set_flags(flags);
            sep_mut.set_ptr(right_addr);
            separator = sep;
        } else {
            // The median key moves up; its child pointer seeds the right
            // node's ptr_left.
            let median = SlotBuf::from_slice(&all[mid * stride..(mid + 1) * stride]);
            let median_view = SlotView::new(&median, key_size);

            {
                let payload = self.pager.payload_mut(addr)?;
                let mut node = NodeViewMut::new(payload, key_size)?;
                node.write_slots(0, &all[..mid * stride])?;
                node.set_count(mid);
                node.set_right(right_addr);
            }
            {
                let payload = self.pager.payload_mut(right_addr)?;
                let mut node = NodeViewMut::init(payload, key_size, false)?;
                node.set_ptr_left(median_view.ptr());
                node.write_slots(0, &all[(mid + 1) * stride..])?;
                node.set_count(total - mid - 1);
                node.set_left(addr);
                node.set_right(old_right);
            }

            let mut sep = median;
            SlotViewMut::new(&mut sep, key_size).set_ptr(right_addr);
            separator = sep;
        }

        if old_right != NIL_PAGE {
            let payload = self.pager.payload_mut(old_right)?;
            let mut node = NodeViewMut::new(payload, key_size)?;
            node.set_left(right_addr);
        }

        self.insert_separator_upward(addr, separator, stack)
    }

    fn insert_separator_upward(
        &mut self,
        left: PageAddr,
        separator: SlotBuf,
        mut stack: Vec<(PageAddr, i64)>,
    ) -> Result<()> {
        match stack.pop() {
            None => self.grow_root(left, separator),
            Some((parent, child_slot)) => {
                let pos = (child_slot + 1) as usize;
                self.insert_at(parent, pos, separator, stack, false)
            }
        }
    }

    /// Grows a new internal root above the split pair; the old root is
    /// demoted to a plain index page.
    fn grow_root(&mut self, left: PageAddr, separator: SlotBuf) -> Result<()> {
        let key_size = self.pager.key_size();
        let new_root = self.pager.alloc(PageType::BtreeRoot)?;

        {
            let payload = self.pager.payload_mut(new_root)?;
            let mut node = NodeViewMut::init(payload, key_size, false)?;
            node.set_ptr_left(left);
            node.insert_slot(0, &separator)?;
        }

        self.pager.set_page_type(left, PageType::BtreeIndex)?;
        self.pager.set_root(new_root)?;
        debug!(new_root, "grew new root");
        Ok(())
    }
}
