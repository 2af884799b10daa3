//! # B+Tree Cursor
//!
//! A random access iterator over the tree. Most moves are O(1) and touch no
//! page: the cursor is **coupled** directly to a leaf page and a slot. When
//! a structural mutation is about to touch that page, every affected cursor
//! is **uncoupled** first: it copies its current key into an owned buffer
//! and drops the page reference. The next move re-couples by looking the
//! key up again, which lands on the key's new home wherever rebalancing
//! moved it.
//!
//! ## States
//!
//! ```text
//! Nil ──couple_to──> Coupled{page, slot, dup_idx} ──uncouple──> Uncoupled{key, dup_idx}
//!  ^                      │                                          │
//!  └──── set_to_nil ──────┴──────────────────────────────────────────┘
//! ```
//!
//! The two non-nil states never coexist; transitions are total.
//!
//! ## Registry
//!
//! Every page address maps to the set of cursors coupled to it. The
//! registry holds weak handles: it is a membership relation used for
//! invalidation, not ownership. A dropped cursor's entry is pruned on the
//! next sweep of its page.

use std::sync::{Arc, Weak};

use eyre::Result;
use hashbrown::HashMap;
use parking_lot::Mutex;
use tracing::trace;

use super::node::NodeViewMut;
use super::slot::{materialize_key, KeyBuf, SlotView, SlotViewMut};
use super::traverse::{edge_leaf, find_leaf, node_meta, slot_bytes};
use super::tree::Btree;
use crate::error::TreeError;
use crate::storage::{PageAddr, NIL_PAGE};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CursorState {
    /// References no key; initial and closed state.
    Nil,
    /// Enlisted on `page`'s cursor list; reads go through the slot.
    Coupled {
        page: PageAddr,
        slot: usize,
        dup_idx: usize,
    },
    /// Owns a copy of the last key; no page reference is kept.
    Uncoupled { key: KeyBuf, dup_idx: usize },
}

#[derive(Debug)]
pub(crate) struct CursorInner {
    pub(crate) state: CursorState,
}

pub(crate) type CursorHandle = Arc<Mutex<CursorInner>>;

/// Direction of a cursor move.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorMove {
    First,
    Last,
    Next,
    Previous,
}

pub struct Cursor {
    inner: CursorHandle,
}

/// Per-page cursor membership, keyed by page address.
#[derive(Debug, Default)]
pub(crate) struct CursorRegistry {
    by_page: HashMap<PageAddr, Vec<Weak<Mutex<CursorInner>>>>,
}

impl CursorRegistry {
    fn attach(&mut self, page: PageAddr, handle: &CursorHandle) {
        self.by_page
            .entry(page)
            .or_default()
            .push(Arc::downgrade(handle));
    }

    fn detach(&mut self, page: PageAddr, handle: &CursorHandle) {
        if let Some(list) = self.by_page.get_mut(&page) {
            list.retain(|weak| {
                weak.upgrade()
                    .map(|arc| !Arc::ptr_eq(&arc, handle))
                    .unwrap_or(false)
            });
            if list.is_empty() {
                self.by_page.remove(&page);
            }
        }
    }

    /// Live cursors currently coupled to `page`; dead weak handles are
    /// pruned as a side effect.
    pub(crate) fn cursors_on(&mut self, page: PageAddr) -> Vec<CursorHandle> {
        match self.by_page.get_mut(&page) {
            Some(list) => {
                list.retain(|weak| weak.strong_count() > 0);
                let out: Vec<CursorHandle> =
                    list.iter().filter_map(|weak| weak.upgrade()).collect();
                if list.is_empty() {
                    self.by_page.remove(&page);
                }
                out
            }
            None => Vec::new(),
        }
    }

    pub(crate) fn count_on(&mut self, page: PageAddr) -> usize {
        self.cursors_on(page).len()
    }
}

impl Btree {
    /// A fresh cursor in the Nil state.
    pub fn cursor(&self) -> Cursor {
        Cursor {
            inner: Arc::new(Mutex::new(CursorInner {
                state: CursorState::Nil,
            })),
        }
    }

    /// Couples a cursor to `(page, slot, dup_idx)`, moving it off any page
    /// it was coupled to and releasing an uncoupled key copy.
    pub(crate) fn couple_cursor(
        &mut self,
        handle: &CursorHandle,
        page: PageAddr,
        slot: usize,
        dup_idx: usize,
    ) {
        let mut inner = handle.lock();
        if let CursorState::Coupled { page: old, .. } = inner.state {
            self.cursors.detach(old, handle);
        }
        inner.state = CursorState::Coupled {
            page,
            slot,
            dup_idx,
        };
        self.cursors.attach(page, handle);
    }

    /// Uncouples one cursor: copies its key out of the slot, then drops the
    /// page membership. No-op unless the cursor is coupled.
    pub(crate) fn uncouple_cursor(&mut self, handle: &CursorHandle) -> Result<()> {
        let (page, slot, dup_idx) = {
            let inner = handle.lock();
            match inner.state {
                CursorState::Coupled {
                    page,
                    slot,
                    dup_idx,
                } => (page, slot, dup_idx),
                _ => return Ok(()),
            }
        };

        let key_size = self.pager.key_size();
        let bytes = slot_bytes(&mut self.pager, page, slot, key_size)?;
        let key = materialize_key(&mut self.pager, &mut self.extkeys, &bytes, key_size)?;

        handle.lock().state = CursorState::Uncoupled { key, dup_idx };
        self.cursors.detach(page, handle);
        Ok(())
    }

    /// Uncouples every cursor on `page` whose slot is at or past `start`.
    /// Must run before any mutation of the page's slot array.
    pub(crate) fn uncouple_all_on(&mut self, page: PageAddr, start: usize) -> Result<()> {
        let handles = self.cursors.cursors_on(page);
        if handles.is_empty() {
            return Ok(());
        }
        trace!(page, start, cursors = handles.len(), "uncoupling cursors");

        for handle in handles {
            let affected = matches!(
                handle.lock().state,
                CursorState::Coupled { page: p, slot, .. } if p == page && slot >= start
            );
            if affected {
                self.uncouple_cursor(&handle)?;
            }
        }
        Ok(())
    }

    /// True when any cursor remains coupled to `page`. Pages queued for
    /// release must report false.
    pub(crate) fn has_cursors_on(&mut self, page: PageAddr) -> bool {
        self.cursors.count_on(page) > 0
    }
}

impl Cursor {
    pub fn state(&self) -> CursorState {
        self.inner.lock().state.clone()
    }

    pub fn is_nil(&self) -> bool {
        matches!(self.inner.lock().state, CursorState::Nil)
    }

    fn coupled(&self) -> Result<(PageAddr, usize, usize)> {
        match self.inner.lock().state {
            CursorState::Coupled {
                page,
                slot,
                dup_idx,
            } => Ok((page, slot, dup_idx)),
            _ => Err(eyre::Report::new(TreeError::InvariantBroken(
                "cursor is not coupled".into(),
            ))),
        }
    }

    /// Detaches from any page, releases any key copy, returns to Nil.
    pub fn set_to_nil(&self, tree: &mut Btree) {
        let mut inner = self.inner.lock();
        if let CursorState::Coupled { page, .. } = inner.state {
            tree.cursors.detach(page, &self.inner);
        }
        inner.state = CursorState::Nil;
    }

    /// Trades the page reference for an owned key copy. Idempotent when
    /// already uncoupled.
    pub fn uncouple(&self, tree: &mut Btree) -> Result<()> {
        tree.uncouple_cursor(&self.inner)
    }

    /// Positions the cursor on `key` and returns its record id. The cursor
    /// is coupled afterwards iff the key was found.
    pub fn find(&self, tree: &mut Btree, key: &[u8]) -> Result<u64> {
        let root = tree.pager.root()?;
        let key_size = tree.pager.key_size();

        let (leaf, m) = find_leaf(&mut tree.pager, &mut tree.extkeys, root, key, key_size)?;
        if !m.exact {
            self.set_to_nil(tree);
            return Err(eyre::Report::new(TreeError::KeyNotFound));
        }

        tree.couple_cursor(&self.inner, leaf, m.slot as usize, 0);
        tree.record_at(leaf, m.slot as usize, 0)
    }

    /// Moves to the first, last, next or previous record and returns its
    /// record id. Duplicates of one key are visited before the key
    /// boundary is crossed.
    pub fn move_to(&self, tree: &mut Btree, mv: CursorMove) -> Result<u64> {
        match mv {
            CursorMove::First => self.move_first(tree),
            CursorMove::Last => self.move_last(tree),
            CursorMove::Next => self.move_next(tree),
            CursorMove::Previous => self.move_previous(tree),
        }
    }

    fn move_first(&self, tree: &mut Btree) -> Result<u64> {
        let root = tree.pager.root()?;
        let key_size = tree.pager.key_size();

        let leaf = edge_leaf(&mut tree.pager, root, key_size, true)?;
        let meta = node_meta(&mut tree.pager, leaf, key_size)?;
        if meta.count == 0 {
            return Err(eyre::Report::new(TreeError::KeyNotFound));
        }

        tree.couple_cursor(&self.inner, leaf, 0, 0);
        tree.record_at(leaf, 0, 0)
    }

    fn move_last(&self, tree: &mut Btree) -> Result<u64> {
        let root = tree.pager.root()?;
        let key_size = tree.pager.key_size();

        let leaf = edge_leaf(&mut tree.pager, root, key_size, false)?;
        let meta = node_meta(&mut tree.pager, leaf, key_size)?;
        if meta.count == 0 {
            return Err(eyre::Report::new(TreeError::KeyNotFound));
        }

        let slot = meta.count - 1;
        let dup_idx = tree.record_count_at(leaf, slot)?.saturating_sub(1);
        tree.couple_cursor(&self.inner, leaf, slot, dup_idx);
        tree.record_at(leaf, slot, dup_idx)
    }

    fn move_next(&self, tree: &mut Btree) -> Result<u64> {
        let state = self.state();
        match state {
            CursorState::Nil => Err(eyre::Report::new(TreeError::InvariantBroken(
                "cannot move a nil cursor".into(),
            ))),
            CursorState::Coupled { .. } => self.advance(tree),
            CursorState::Uncoupled { key, dup_idx } => {
                let root = tree.pager.root()?;
                let key_size = tree.pager.key_size();
                let (leaf, m) =
                    find_leaf(&mut tree.pager, &mut tree.extkeys, root, &key, key_size)?;

                if m.exact {
                    // The key survived the mutation: re-couple on it and
                    // step past it as a normal advance.
                    tree.couple_cursor(&self.inner, leaf, m.slot as usize, dup_idx);
                    return self.advance(tree);
                }

                // The key is gone; the first slot at or past it is already
                // the next position.
                let meta = node_meta(&mut tree.pager, leaf, key_size)?;
                let next_slot = (m.slot + 1) as usize;
                if next_slot < meta.count {
                    tree.couple_cursor(&self.inner, leaf, next_slot, 0);
                    return tree.record_at(leaf, next_slot, 0);
                }
                if meta.right == NIL_PAGE {
                    return Err(eyre::Report::new(TreeError::KeyNotFound));
                }
                tree.couple_cursor(&self.inner, meta.right, 0, 0);
                tree.record_at(meta.right, 0, 0)
            }
        }
    }

    fn move_previous(&self, tree: &mut Btree) -> Result<u64> {
        let state = self.state();
        match state {
            CursorState::Nil => Err(eyre::Report::new(TreeError::InvariantBroken(
                "cannot move a nil cursor".into(),
            ))),
            CursorState::Coupled { .. } => self.retreat(tree),
            CursorState::Uncoupled { key, dup_idx } => {
                let root = tree.pager.root()?;
                let key_size = tree.pager.key_size();
                let (leaf, m) =
                    find_leaf(&mut tree.pager, &mut tree.extkeys, root, &key, key_size)?;

                if m.exact {
                    tree.couple_cursor(&self.inner, leaf, m.slot as usize, dup_idx);
                    return self.retreat(tree);
                }

                // The key is gone; the greatest slot below it is already
                // the previous position.
                if m.slot >= 0 {
                    let slot = m.slot as usize;
                    let dup = tree.record_count_at(leaf, slot)?.saturating_sub(1);
                    tree.couple_cursor(&self.inner, leaf, slot, dup);
                    return tree.record_at(leaf, slot, dup);
                }
                let meta = node_meta(&mut tree.pager, leaf, key_size)?;
                if meta.left == NIL_PAGE {
                    return Err(eyre::Report::new(TreeError::KeyNotFound));
                }
                let left_meta = node_meta(&mut tree.pager, meta.left, key_size)?;
                let slot = left_meta.count.saturating_sub(1);
                let dup = tree.record_count_at(meta.left, slot)?.saturating_sub(1);
                tree.couple_cursor(&self.inner, meta.left, slot, dup);
                tree.record_at(meta.left, slot, dup)
            }
        }
    }

    /// One step forward from a coupled position: next duplicate, next slot,
    /// or the right sibling's first slot. The cursor is left unchanged when
    /// the end of the tree is hit.
    fn advance(&self, tree: &mut Btree) -> Result<u64> {
        let (page, slot, dup_idx) = self.coupled()?;
        let key_size = tree.pager.key_size();

        let record_count = tree.record_count_at(page, slot)?;
        if dup_idx + 1 < record_count {
            tree.couple_cursor(&self.inner, page, slot, dup_idx + 1);
            return tree.record_at(page, slot, dup_idx + 1);
        }

        let meta = node_meta(&mut tree.pager, page, key_size)?;
        if slot + 1 < meta.count {
            tree.couple_cursor(&self.inner, page, slot + 1, 0);
            return tree.record_at(page, slot + 1, 0);
        }

        if meta.right == NIL_PAGE {
            return Err(eyre::Report::new(TreeError::KeyNotFound));
        }
        tree.couple_cursor(&self.inner, meta.right, 0, 0);
        tree.record_at(meta.right, 0, 0)
    }

    /// One step backward from a coupled position.
    fn retreat(&self, tree: &mut Btree) -> Result<u64> {
        let (page, slot, dup_idx) = self.coupled()?;
        let key_size = tree.pager.key_size();

        if dup_idx > 0 {
            tree.couple_cursor(&self.inner, page, slot, dup_idx - 1);
            return tree.record_at(page, slot, dup_idx - 1);
        }

        if slot > 0 {
            let dup = tree.record_count_at(page, slot - 1)?.saturating_sub(1);
            tree.couple_cursor(&self.inner, page, slot - 1, dup);
            return tree.record_at(page, slot - 1, dup);
        }

        let meta = node_meta(&mut tree.pager, page, key_size)?;
        if meta.left == NIL_PAGE {
            return Err(eyre::Report::new(TreeError::KeyNotFound));
        }
        let left_meta = node_meta(&mut tree.pager, meta.left, key_size)?;
        let last = left_meta.count.saturating_sub(1);
        let dup = tree.record_count_at(meta.left, last)?.saturating_sub(1);
        tree.couple_cursor(&self.inner, meta.left, last, dup);
        tree.record_at(meta.left, last, dup)
    }

    /// The record id under the cursor without moving it.
    pub fn record(&self, tree: &mut Btree) -> Result<u64> {
        let (page, slot, dup_idx) = self.coupled()?;
        tree.record_at(page, slot, dup_idx)
    }

    /// Replaces the record under the cursor in place. Requires a coupled
    /// cursor; slot indices are unaffected, so no uncoupling happens.
    pub fn overwrite(&self, tree: &mut Btree, record_id: u64) -> Result<()> {
        let (page, slot, dup_idx) = self.coupled()?;
        let key_size = tree.pager.key_size();

        let bytes = slot_bytes(&mut tree.pager, page, slot, key_size)?;
        let view = SlotView::new(&bytes, key_size);

        if view.has_duplicates() {
            let new_list = super::dupe::replace_at(&mut tree.pager, view.ptr(), dup_idx, record_id)?;
            let payload = tree.pager.payload_mut(page)?;
            let mut node = NodeViewMut::new(payload, key_size)?;
            SlotViewMut::new(node.slot_mut(slot)?, key_size).set_ptr(new_list);
        } else {
            let payload = tree.pager.payload_mut(page)?;
            let mut node = NodeViewMut::new(payload, key_size)?;
            let mut slot_mut = SlotViewMut::new(node.slot_mut(slot)?, key_size);
            let flags = slot_mut.view().flags()
                & !(super::slot::RECORD_TINY | super::slot::RECORD_SMALL | super::slot::RECORD_EMPTY);
            slot_mut.set_flags(flags);
            slot_mut.set_ptr(record_id);
        }
        Ok(())
    }

    /// Size of the current record per the tiny/small/empty encodings.
    pub fn record_size(&self, tree: &mut Btree) -> Result<u64> {
        let (page, slot, _) = self.coupled()?;
        let key_size = tree.pager.key_size();
        let bytes = slot_bytes(&mut tree.pager, page, slot, key_size)?;
        let view = SlotView::new(&bytes, key_size);
        if view.has_duplicates() {
            return Ok(8);
        }
        Ok(view.record_size())
    }

    /// Number of records under the current key.
    pub fn record_count(&self, tree: &mut Btree) -> Result<usize> {
        let (page, slot, _) = self.coupled()?;
        tree.record_count_at(page, slot)
    }

    /// True when the cursor is coupled exactly to `(page, slot)`.
    pub fn points_to(&self, page: PageAddr, slot: usize) -> bool {
        matches!(
            self.inner.lock().state,
            CursorState::Coupled { page: p, slot: s, .. } if p == page && s == slot
        )
    }

    /// True when the cursor references `key`, in either non-nil state. A
    /// coupled cursor compares the slot's key; an uncoupled one compares
    /// its owned copy.
    pub fn points_to_key(&self, tree: &mut Btree, key: &[u8]) -> Result<bool> {
        let state = self.state();
        match state {
            CursorState::Nil => Ok(false),
            CursorState::Uncoupled { key: copy, .. } => Ok(copy.as_slice() == key),
            CursorState::Coupled { page, slot, .. } => {
                let key_size = tree.pager.key_size();
                let bytes = slot_bytes(&mut tree.pager, page, slot, key_size)?;
                let current =
                    materialize_key(&mut tree.pager, &mut tree.extkeys, &bytes, key_size)?;
                Ok(current.as_slice() == key)
            }
        }
    }
}
