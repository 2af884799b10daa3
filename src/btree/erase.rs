//! # Erase and Rebalance
//!
//! Recursive key deletion. The descent carries, for the current page, the
//! addresses of its immediate left and right neighbors at the same level
//! and the nearest ancestors anchoring it from each side (`lanchor`,
//! `ranchor`); together with the parent these let the unwind decide merge
//! versus shift without walking the parent chain again.
//!
//! The scratchpad tracks `mergepage`: walking down, the shallowest page of
//! the deepest run of underfull pages ending at the leaf. A healthy page
//! resets it, so the unwind rebalances exactly the run that lost a slot at
//! every level.
//!
//! Rebalance decision per level, after the entry removal:
//!
//! 1. No siblings: the root. A drained internal root hands its only child
//!    up for `collapse_root`.
//! 2. Both siblings absent or underfull: merge. The side is picked so the
//!    pair's separator sits in the parent.
//! 3. One side underfull, the other healthy: merge into the underfull
//!    side when the anchoring works out, otherwise shift from the healthy
//!    one.
//! 4. Both healthy: shift from the larger sibling, preferring the anchor
//!    that is the parent (more local effect).
//!
//! Merges return the emptied page; the parent removes its separator slot on
//! unwind and the page is freed through the transaction layer. Shifts
//! rotate slots through the anchor and return nothing.
//!
//! Within one structural mutation the order is fixed: anchor read, sibling
//! read, cursor uncoupling, slot movement, dirty marking, page free.

use eyre::{ensure, Result};
use tracing::{debug, trace};

use super::node::{slot_stride, NodeView, NodeViewMut};
use super::slot::{copy_slot, materialize_key, SlotBuf, SlotView, SlotViewMut, LEAF_ONLY_FLAGS};
use super::traverse::{child_for, find_slot, node_meta, slot_bytes};
use super::tree::{Btree, ErasedRecord};
use crate::config::min_keys;
use crate::error::TreeError;
use crate::storage::{blob, PageAddr, PageType, NIL_PAGE};
use crate::txn::Txn;

/// Values threaded from the top of the erase to the bottom and back.
struct EraseScratchpad<'a> {
    /// The key being deleted.
    key: &'a [u8],
    /// Out: the record id the key held (first duplicate for duplicate
    /// slots).
    record_id: u64,
    /// Out: the slot flags the key carried.
    record_flags: u8,
    /// The deepest page seen on the way down that may need rebalancing, or
    /// nil once a healthy page resets the run.
    mergepage: PageAddr,
}

impl Btree {
    /// Deletes `key`, rebalancing on the way back up. Freed pages are
    /// queued on `txn`; nothing is dirtied when the key is absent.
    pub fn erase(&mut self, txn: &mut Txn, key: &[u8]) -> Result<ErasedRecord> {
        let root = self.pager.root()?;
        if root == NIL_PAGE {
            return Err(eyre::Report::new(TreeError::KeyNotFound));
        }

        let mut pad = EraseScratchpad {
            key,
            record_id: 0,
            record_flags: 0,
            mergepage: NIL_PAGE,
        };

        let newroot = self.erase_recursive(
            txn,
            root,
            NIL_PAGE,
            NIL_PAGE,
            NIL_PAGE,
            NIL_PAGE,
            NIL_PAGE,
            &mut pad,
        )?;

        if newroot != NIL_PAGE {
            self.collapse_root(txn, root, newroot)?;
        }

        debug!(key_len = key.len(), record_id = pad.record_id, "erased key");
        Ok(ErasedRecord {
            record_id: pad.record_id,
            flags: pad.record_flags,
        })
    }

    /// One level of the recursion. Returns the page that became empty at
    /// the level below (its separator here was already removed), or nil.
    #[allow(clippy::too_many_arguments)]
    fn erase_recursive(
        &mut self,
        txn: &mut Txn,
        page: PageAddr,
        left: PageAddr,
        right: PageAddr,
        lanchor: PageAddr,
        ranchor: PageAddr,
        parent: PageAddr,
        pad: &mut EraseScratchpad<'_>,
    ) -> Result<PageAddr> {
        let key_size = self.pager.key_size();
        let minkeys = min_keys(self.pager.max_keys());
        let meta = node_meta(&mut self.pager, page, key_size)?;

        // An empty node can only be the empty root.
        if meta.count == 0 {
            return Err(eyre::Report::new(TreeError::KeyNotFound));
        }

        // Mark the run of pages that would underflow after one removal; a
        // healthy page resets the run.
        let root = self.pager.root()?;
        let healthy = if page == root {
            meta.count > 1
        } else {
            meta.count > minkeys
        };
        if healthy {
            pad.mergepage = NIL_PAGE;
        } else if pad.mergepage == NIL_PAGE {
            pad.mergepage = page;
        }

        if !meta.is_leaf {
            let (child, m) = child_for(&mut self.pager, &mut self.extkeys, page, pad.key, key_size)?;

            // Neighbors and anchors for the child, derived from the slot
            // that routed us.
            let (next_left, next_lanchor) = if m.slot == -1 {
                let neighbor_child = if left == NIL_PAGE {
                    NIL_PAGE
                } else {
                    let lmeta = node_meta(&mut self.pager, left, key_size)?;
                    let bytes =
                        slot_bytes(&mut self.pager, left, lmeta.count - 1, key_size)?;
                    SlotView::new(&bytes, key_size).ptr()
                };
                (neighbor_child, lanchor)
            } else if m.slot == 0 {
                (meta.ptr_left, page)
            } else {
                let bytes = slot_bytes(&mut self.pager, page, (m.slot - 1) as usize, key_size)?;
                (SlotView::new(&bytes, key_size).ptr(), page)
            };

            let (next_right, next_ranchor) = if m.slot == meta.count as i64 - 1 {
                let neighbor_child = if right == NIL_PAGE {
                    NIL_PAGE
                } else {
                    node_meta(&mut self.pager, right, key_size)?.ptr_left
                };
                (neighbor_child, ranchor)
            } else {
                let bytes = slot_bytes(&mut self.pager, page, (m.slot + 1) as usize, key_size)?;
                (SlotView::new(&bytes, key_size).ptr(), page)
            };

            let emptied = self.erase_recursive(
                txn,
                child,
                next_left,
                next_right,
                next_lanchor,
                next_ranchor,
                page,
                pad,
            )?;

            if emptied != NIL_PAGE {
                // A merge below drained a child; its separator lives here,
                // at the routing slot (slot 0 when we went through
                // ptr_left).
                let slot = m.slot.max(0) as usize;
                self.remove_entry(page, slot)?;
            }

            return self.rebalance(txn, page, left, right, lanchor, ranchor, parent, pad);
        }

        // Leaf: the key must be here, exactly.
        let m = find_slot(&mut self.pager, &mut self.extkeys, page, pad.key, key_size)?;
        if !m.exact {
            return Err(eyre::Report::new(TreeError::KeyNotFound));
        }

        let slot = m.slot as usize;
        {
            let bytes = slot_bytes(&mut self.pager, page, slot, key_size)?;
            let view = SlotView::new(&bytes, key_size);
            pad.record_flags = view.flags();
            pad.record_id = if view.has_duplicates() {
                super::dupe::read_list(&mut self.pager, view.ptr())?[0]
            } else {
                view.ptr()
            };
        }

        self.remove_entry(page, slot)?;
        self.rebalance(txn, page, left, right, lanchor, ranchor, parent, pad)
    }

    /// Removes one slot: uncouples the page's cursors, releases the slot's
    /// extended-key blob and duplicate list, closes the gap.
    pub(crate) fn remove_entry(&mut self, page: PageAddr, slot: usize) -> Result<()> {
        let key_size = self.pager.key_size();
        trace!(page, slot, "removing entry");

        self.uncouple_all_on(page, 0)?;

        let bytes = slot_bytes(&mut self.pager, page, slot, key_size)?;
        let view = SlotView::new(&bytes, key_size);
        let dup_list = if view.has_duplicates() {
            Some(view.ptr())
        } else {
            None
        };
        self.free_slot_blob(&bytes)?;
        if let Some(list) = dup_list {
            blob::free(&mut self.pager, list)?;
        }

        let payload = self.pager.payload_mut(page)?;
        let mut node = NodeViewMut::new(payload, key_size)?;
        node.remove_slot(slot)?;
        Ok(())
    }

    /// Releases the extended-key blob referenced by a slot, if any, and
    /// evicts it from the extended-key cache.
    fn free_slot_blob(&mut self, slot_bytes: &[u8]) -> Result<()> {
        let view = SlotView::new(slot_bytes, self.pager.key_size());
        if view.is_extended() {
            let id = view.blob_id()?;
            blob::free(&mut self.pager, id)?;
            self.extkeys.remove(id);
        }
        Ok(())
    }

    /// Decides merge vs shift for `page` once the level below is settled.
    /// Returns the page that became empty and whose separator the caller
    /// must remove, or nil.
    #[allow(clippy::too_many_arguments)]
    fn rebalance(
        &mut self,
        txn: &mut Txn,
        page: PageAddr,
        left: PageAddr,
        right: PageAddr,
        lanchor: PageAddr,
        ranchor: PageAddr,
        parent: PageAddr,
        pad: &mut EraseScratchpad<'_>,
    ) -> Result<PageAddr> {
        if pad.mergepage == NIL_PAGE {
            return Ok(NIL_PAGE);
        }

        let key_size = self.pager.key_size();
        let minkeys = min_keys(self.pager.max_keys());
        let meta = node_meta(&mut self.pager, page, key_size)?;

        // The passed neighbor addresses gate the lookup; the live sibling
        // addresses come from the node's own links.
        let leftpage = if left != NIL_PAGE { meta.left } else { NIL_PAGE };
        let rightpage = if right != NIL_PAGE { meta.right } else { NIL_PAGE };

        let few_left = leftpage != NIL_PAGE
            && node_meta(&mut self.pager, leftpage, key_size)?.count <= minkeys;
        let few_right = rightpage != NIL_PAGE
            && node_meta(&mut self.pager, rightpage, key_size)?.count <= minkeys;

        // No siblings: this is the root.
        if leftpage == NIL_PAGE && rightpage == NIL_PAGE {
            return Ok(if meta.is_leaf { NIL_PAGE } else { meta.ptr_left });
        }

        // Both absent or both underfull: merge toward the parent's anchor.
        if (leftpage == NIL_PAGE || few_left) && (rightpage == NIL_PAGE || few_right) {
            return if lanchor != parent {
                self.merge_pages(txn, page, rightpage, ranchor, pad)
            } else {
                self.merge_pages(txn, leftpage, page, lanchor, pad)
            };
        }

        // Left underfull, right healthy.
        if leftpage != NIL_PAGE && few_left && rightpage != NIL_PAGE && !few_right {
            return if ranchor != parent && page == pad.mergepage {
                self.merge_pages(txn, leftpage, page, lanchor, pad)
            } else {
                self.shift_pages(page, rightpage, ranchor, pad)
            };
        }

        // Right underfull, left healthy.
        if leftpage != NIL_PAGE && !few_left && rightpage != NIL_PAGE && few_right {
            return if lanchor != parent && page == pad.mergepage {
                self.merge_pages(txn, page, rightpage, ranchor, pad)
            } else {
                self.shift_pages(leftpage, page, lanchor, pad)
            };
        }

        // A lone healthy sibling: borrow from it.
        if leftpage == NIL_PAGE {
            return self.shift_pages(page, rightpage, ranchor, pad);
        }
        if rightpage == NIL_PAGE {
            return self.shift_pages(leftpage, page, lanchor, pad);
        }

        // Both healthy: shift from the larger side; on a tie of anchors,
        // prefer the shift whose anchor is the parent.
        if lanchor == ranchor {
            let left_count = node_meta(&mut self.pager, leftpage, key_size)?.count;
            let right_count = node_meta(&mut self.pager, rightpage, key_size)?.count;
            return if left_count <= right_count {
                self.shift_pages(page, rightpage, ranchor, pad)
            } else {
                self.shift_pages(leftpage, page, lanchor, pad)
            };
        }

        if lanchor == parent {
            self.shift_pages(leftpage, page, lanchor, pad)
        } else {
            self.shift_pages(page, rightpage, ranchor, pad)
        }
    }

    /// Merges `sibpage` (always the right-hand page of the pair) into
    /// `page`, splices the sibling chain, frees `sibpage` through the
    /// transaction and returns it so the caller removes its separator.
    fn merge_pages(
        &mut self,
        txn: &mut Txn,
        page: PageAddr,
        sibpage: PageAddr,
        anchor: PageAddr,
        pad: &mut EraseScratchpad<'_>,
    ) -> Result<PageAddr> {
        ensure!(
            page != NIL_PAGE && sibpage != NIL_PAGE,
            "merge requires both pages"
        );
        let key_size = self.pager.key_size();
        let stride = slot_stride(key_size);
        let meta = node_meta(&mut self.pager, page, key_size)?;
        let smeta = node_meta(&mut self.pager, sibpage, key_size)?;
        trace!(page, sibpage, anchor, "merging pages");

        self.uncouple_all_on(page, 0)?;
        self.uncouple_all_on(sibpage, 0)?;
        if anchor != NIL_PAGE {
            self.uncouple_all_on(anchor, 0)?;
        }

        // Internal merge pulls the separator down between the two halves;
        // its child pointer is the sibling's ptr_left.
        if !meta.is_leaf {
            ensure!(anchor != NIL_PAGE, "internal merge requires an anchor");
            let anc_slot = self.anchor_slot_for(anchor, sibpage)?;
            self.append_separator(page, anchor, anc_slot, smeta.ptr_left)?;
        }

        let merged_count = {
            let count = node_meta(&mut self.pager, page, key_size)?.count;
            count + smeta.count
        };
        if merged_count > self.pager.max_keys() {
            return Err(eyre::Report::new(TreeError::InvariantBroken(format!(
                "merge of {} and {} would hold {} keys",
                page, sibpage, merged_count
            ))));
        }

        // Bulk-move the sibling's slots.
        let moved: Vec<u8> = {
            let payload = self.pager.payload(sibpage)?;
            let node = NodeView::new(payload, key_size)?;
            let mut bytes = Vec::with_capacity(smeta.count * stride);
            for i in 0..smeta.count {
                bytes.extend_from_slice(node.slot(i)?);
            }
            bytes
        };
        {
            let payload = self.pager.payload_mut(page)?;
            let mut node = NodeViewMut::new(payload, key_size)?;
            let count = node.count();
            node.write_slots(count, &moved)?;
            node.set_count(count + smeta.count);
        }
        {
            let payload = self.pager.payload_mut(sibpage)?;
            let mut node = NodeViewMut::new(payload, key_size)?;
            node.set_count(0);
        }

        // Splice the sibling out of the chain.
        if meta.right == sibpage {
            let beyond = smeta.right;
            {
                let payload = self.pager.payload_mut(page)?;
                NodeViewMut::new(payload, key_size)?.set_right(beyond);
            }
            if beyond != NIL_PAGE {
                let payload = self.pager.payload_mut(beyond)?;
                NodeViewMut::new(payload, key_size)?.set_left(page);
            }
        } else if meta.left == sibpage {
            let beyond = smeta.left;
            {
                let payload = self.pager.payload_mut(page)?;
                NodeViewMut::new(payload, key_size)?.set_left(beyond);
            }
            if beyond != NIL_PAGE {
                let payload = self.pager.payload_mut(beyond)?;
                NodeViewMut::new(payload, key_size)?.set_right(page);
            }
        }

        if pad.mergepage == page || pad.mergepage == sibpage {
            pad.mergepage = NIL_PAGE;
        }

        debug_assert!(!self.has_cursors_on(sibpage));
        txn.free_page(sibpage);
        Ok(sibpage)
    }

    /// Moves slots between `page` and its right neighbor `sibpage` until
    /// the counts even out, rotating the anchor separator. Returns nil.
    fn shift_pages(
        &mut self,
        page: PageAddr,
        sibpage: PageAddr,
        anchor: PageAddr,
        pad: &mut EraseScratchpad<'_>,
    ) -> Result<PageAddr> {
        let key_size = self.pager.key_size();
        let meta = node_meta(&mut self.pager, page, key_size)?;
        let smeta = node_meta(&mut self.pager, sibpage, key_size)?;

        if meta.count == smeta.count {
            return Ok(NIL_PAGE);
        }
        ensure!(anchor != NIL_PAGE, "shift requires an anchor");
        trace!(page, sibpage, anchor, "shifting slots");

        self.uncouple_all_on(page, 0)?;
        self.uncouple_all_on(sibpage, 0)?;
        self.uncouple_all_on(anchor, 0)?;

        let intern = !meta.is_leaf;
        if smeta.count >= meta.count {
            self.shift_from_right(page, sibpage, anchor, intern)?;
        } else {
            self.shift_from_left(page, sibpage, anchor, intern)?;
        }

        pad.mergepage = NIL_PAGE;
        Ok(NIL_PAGE)
    }

    /// Moves slots from the right neighbor `b` into `a`.
    fn shift_from_right(
        &mut self,
        a: PageAddr,
        b: PageAddr,
        anchor: PageAddr,
        intern: bool,
    ) -> Result<()> {
        let key_size = self.pager.key_size();
        let stride = slot_stride(key_size);

        let anc_slot = if intern {
            Some(self.anchor_slot_for(anchor, b)?)
        } else {
            None
        };

        if intern {
            // First rotation: anchor key comes down to a's end carrying
            // b's ptr_left; b's first key goes up into the anchor and its
            // pointer becomes the new ptr_left.
            let s = anc_slot.unwrap();
            let b0 = slot_bytes(&mut self.pager, b, 0, key_size)?;
            let b_ptr_left = node_meta(&mut self.pager, b, key_size)?.ptr_left;

            self.append_separator(a, anchor, s, b_ptr_left)?;
            {
                let payload = self.pager.payload_mut(b)?;
                NodeViewMut::new(payload, key_size)?.set_ptr_left(SlotView::new(&b0, key_size).ptr());
            }
            self.replace_key(anchor, s, &b0, true)?;
            self.free_slot_blob(&b0)?;
            {
                let payload = self.pager.payload_mut(b)?;
                NodeViewMut::new(payload, key_size)?.remove_slot(0)?;
            }
        }

        let a_count = node_meta(&mut self.pager, a, key_size)?.count;
        let b_count = node_meta(&mut self.pager, b, key_size)?.count;
        let mut c = b_count.saturating_sub(a_count) / 2;
        if c == 0 {
            return Ok(());
        }
        if intern {
            c -= 1;
        }

        if intern {
            // Second rotation opens with the updated anchor key.
            let s = anc_slot.unwrap();
            let b_ptr_left = node_meta(&mut self.pager, b, key_size)?.ptr_left;
            self.append_separator(a, anchor, s, b_ptr_left)?;
        }

        if c > 0 {
            let moved: Vec<u8> = {
                let payload = self.pager.payload(b)?;
                let node = NodeView::new(payload, key_size)?;
                let mut bytes = Vec::with_capacity(c * stride);
                for i in 0..c {
                    bytes.extend_from_slice(node.slot(i)?);
                }
                bytes
            };
            {
                let payload = self.pager.payload_mut(a)?;
                let mut node = NodeViewMut::new(payload, key_size)?;
                let count = node.count();
                node.write_slots(count, &moved)?;
                node.set_count(count + c);
            }
            {
                let payload = self.pager.payload_mut(b)?;
                let mut node = NodeViewMut::new(payload, key_size)?;
                let count = node.count();
                node.shift_slots_left(c, count, c)?;
                node.set_count(count - c);
            }
        }

        if intern {
            // Close the rotation: the new first key of b goes up.
            let s = anc_slot.unwrap();
            let b0 = slot_bytes(&mut self.pager, b, 0, key_size)?;
            {
                let payload = self.pager.payload_mut(b)?;
                NodeViewMut::new(payload, key_size)?.set_ptr_left(SlotView::new(&b0, key_size).ptr());
            }
            self.replace_key(anchor, s, &b0, true)?;
            self.free_slot_blob(&b0)?;
            {
                let payload = self.pager.payload_mut(b)?;
                NodeViewMut::new(payload, key_size)?.remove_slot(0)?;
            }
        } else {
            // Leaves rotate in one step; rewrite the anchor with the new
            // boundary key.
            let b0 = slot_bytes(&mut self.pager, b, 0, key_size)?;
            let boundary = materialize_key(&mut self.pager, &mut self.extkeys, &b0, key_size)?;
            let m = find_slot(&mut self.pager, &mut self.extkeys, anchor, &boundary, key_size)?;
            ensure!(m.slot >= 0, "shift lost the anchor separator");
            self.replace_key(anchor, m.slot as usize, &b0, true)?;
        }

        Ok(())
    }

    /// Moves slots from `a` into its right neighbor `b`.
    fn shift_from_left(
        &mut self,
        a: PageAddr,
        b: PageAddr,
        anchor: PageAddr,
        intern: bool,
    ) -> Result<()> {
        let key_size = self.pager.key_size();
        let stride = slot_stride(key_size);

        let anc_slot = if intern {
            Some(self.anchor_slot_for(anchor, b)?)
        } else {
            None
        };

        if intern {
            // First rotation: anchor key comes down to b's front carrying
            // b's old ptr_left; a's last key goes up and its pointer
            // becomes b's new ptr_left.
            let s = anc_slot.unwrap();
            let b_ptr_left = node_meta(&mut self.pager, b, key_size)?.ptr_left;
            self.prepend_separator(b, anchor, s, b_ptr_left)?;

            let a_count = node_meta(&mut self.pager, a, key_size)?.count;
            let a_last = slot_bytes(&mut self.pager, a, a_count - 1, key_size)?;
            {
                let payload = self.pager.payload_mut(b)?;
                NodeViewMut::new(payload, key_size)?
                    .set_ptr_left(SlotView::new(&a_last, key_size).ptr());
            }
            self.replace_key(anchor, s, &a_last, true)?;
            self.free_slot_blob(&a_last)?;
            {
                let payload = self.pager.payload_mut(a)?;
                let mut node = NodeViewMut::new(payload, key_size)?;
                node.set_count(a_count - 1);
            }
        }

        let a_count = node_meta(&mut self.pager, a, key_size)?.count;
        let b_count = node_meta(&mut self.pager, b, key_size)?.count;
        let mut c = a_count.saturating_sub(b_count) / 2;
        if c == 0 {
            return Ok(());
        }
        if intern {
            c -= 1;
        }

        if intern {
            // Second rotation opens with the updated anchor key.
            let s = anc_slot.unwrap();
            let b_ptr_left = node_meta(&mut self.pager, b, key_size)?.ptr_left;
            self.prepend_separator(b, anchor, s, b_ptr_left)?;
        }

        if c > 0 {
            let moved: Vec<u8> = {
                let payload = self.pager.payload(a)?;
                let node = NodeView::new(payload, key_size)?;
                let count = node.count();
                let mut bytes = Vec::with_capacity(c * stride);
                for i in count - c..count {
                    bytes.extend_from_slice(node.slot(i)?);
                }
                bytes
            };
            {
                let payload = self.pager.payload_mut(b)?;
                let mut node = NodeViewMut::new(payload, key_size)?;
                let count = node.count();
                node.shift_slots_right(0, count, c)?;
                node.write_slots(0, &moved)?;
                node.set_count(count + c);
            }
            {
                let payload = self.pager.payload_mut(a)?;
                let mut node = NodeViewMut::new(payload, key_size)?;
                let count = node.count();
                node.set_count(count - c);
            }
        }

        if intern {
            // Close the rotation: a's new last key goes up, its pointer
            // seeds b's ptr_left.
            let s = anc_slot.unwrap();
            let a_count = node_meta(&mut self.pager, a, key_size)?.count;
            let a_last = slot_bytes(&mut self.pager, a, a_count - 1, key_size)?;

            self.replace_key(anchor, s, &a_last, true)?;
            self.free_slot_blob(&a_last)?;
            {
                let payload = self.pager.payload_mut(b)?;
                NodeViewMut::new(payload, key_size)?
                    .set_ptr_left(SlotView::new(&a_last, key_size).ptr());
            }
            {
                let payload = self.pager.payload_mut(a)?;
                let mut node = NodeViewMut::new(payload, key_size)?;
                node.set_count(a_count - 1);
            }
        } else {
            // Leaf: the anchor separator for b is rewritten with b's new
            // first key, found one past the greatest slot below it.
            let b0 = slot_bytes(&mut self.pager, b, 0, key_size)?;
            let boundary = materialize_key(&mut self.pager, &mut self.extkeys, &b0, key_size)?;
            let m = find_slot(&mut self.pager, &mut self.extkeys, anchor, &boundary, key_size)?;
            let anc_meta = node_meta(&mut self.pager, anchor, key_size)?;
            let target = (m.slot + 1) as usize;
            ensure!(
                target < anc_meta.count,
                "shift lost the anchor separator"
            );
            self.replace_key(anchor, target, &b0, true)?;
        }

        Ok(())
    }

    /// Finds the anchor slot whose key separates `sibpage` from its left
    /// neighbor: the greatest anchor slot at or below the sibling's first
    /// key.
    fn anchor_slot_for(&mut self, anchor: PageAddr, sibpage: PageAddr) -> Result<usize> {
        let key_size = self.pager.key_size();
        let first = slot_bytes(&mut self.pager, sibpage, 0, key_size)?;
        let key = materialize_key(&mut self.pager, &mut self.extkeys, &first, key_size)?;
        let m = find_slot(&mut self.pager, &mut self.extkeys, anchor, &key, key_size)?;
        if m.slot < 0 {
            return Err(eyre::Report::new(TreeError::InvariantBroken(format!(
                "anchor {} holds no separator for page {}",
                anchor, sibpage
            ))));
        }
        Ok(m.slot as usize)
    }

    /// Appends a copy of the anchor's separator to the end of `node`, with
    /// `child` as its pointer.
    fn append_separator(
        &mut self,
        node_addr: PageAddr,
        anchor: PageAddr,
        anc_slot: usize,
        child: PageAddr,
    ) -> Result<()> {
        let sep = self.separator_copy(anchor, anc_slot, child)?;
        let key_size = self.pager.key_size();
        let payload = self.pager.payload_mut(node_addr)?;
        let mut node = NodeViewMut::new(payload, key_size)?;
        let count = node.count();
        node.write_slots(count, &sep)?;
        node.set_count(count + 1);
        Ok(())
    }

    /// Prepends a copy of the anchor's separator to the front of `node`,
    /// with `child` as its pointer.
    fn prepend_separator(
        &mut self,
        node_addr: PageAddr,
        anchor: PageAddr,
        anc_slot: usize,
        child: PageAddr,
    ) -> Result<()> {
        let sep = self.separator_copy(anchor, anc_slot, child)?;
        let key_size = self.pager.key_size();
        let payload = self.pager.payload_mut(node_addr)?;
        let mut node = NodeViewMut::new(payload, key_size)?;
        node.insert_slot(0, &sep)?;
        Ok(())
    }

    fn separator_copy(
        &mut self,
        anchor: PageAddr,
        anc_slot: usize,
        child: PageAddr,
    ) -> Result<SlotBuf> {
        let key_size = self.pager.key_size();
        let bytes = slot_bytes(&mut self.pager, anchor, anc_slot, key_size)?;
        let mut sep = copy_slot(&mut self.pager, &bytes, key_size)?;
        let mut sep_mut = SlotViewMut::new(&mut sep, key_size);
        let flags = sep_mut.view().flags() & !LEAF_ONLY_FLAGS;
        sep_mut.set_flags(flags);
        sep_mut.set_ptr(child);
        Ok(sep)
    }

    /// Overwrites the key of `(page, slot)` with the key of `src` while
    /// keeping the slot's pointer. The old extended blob is released; an
    /// extended source key is copied into a fresh blob. Internal targets
    /// drop the leaf-only flags.
    fn replace_key(
        &mut self,
        page: PageAddr,
        slot: usize,
        src: &[u8],
        internal: bool,
    ) -> Result<()> {
        let key_size = self.pager.key_size();
        self.uncouple_all_on(page, 0)?;

        let dst = slot_bytes(&mut self.pager, page, slot, key_size)?;
        let dst_ptr = SlotView::new(&dst, key_size).ptr();
        self.free_slot_blob(&dst)?;

        let mut rep = copy_slot(&mut self.pager, src, key_size)?;
        {
            let mut rep_mut = SlotViewMut::new(&mut rep, key_size);
            if internal {
                let flags = rep_mut.view().flags() & !LEAF_ONLY_FLAGS;
                rep_mut.set_flags(flags);
            }
            rep_mut.set_ptr(dst_ptr);
        }

        let payload = self.pager.payload_mut(page)?;
        let mut node = NodeViewMut::new(payload, key_size)?;
        node.write_slots(slot, &rep)?;
        Ok(())
    }

    /// Installs the surviving child as the new root and frees the drained
    /// old root through the transaction.
    fn collapse_root(
        &mut self,
        txn: &mut Txn,
        old_root: PageAddr,
        new_root: PageAddr,
    ) -> Result<()> {
        debug!(old_root, new_root, "collapsing root");
        self.pager.set_page_type(new_root, PageType::BtreeRoot)?;
        self.pager.set_root(new_root)?;

        debug_assert!(!self.has_cursors_on(old_root));
        txn.free_page(old_root);
        Ok(())
    }
}
