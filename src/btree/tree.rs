//! # B+Tree Handle
//!
//! `Btree` owns the pager, the extended-key cache and the cursor registry,
//! and exposes the public surface: create/open, point lookup, insert (see
//! `insert`), erase with rebalancing (see `erase`) and cursors (see
//! `cursor`). The root address and tree geometry are persisted in the file
//! header.
//!
//! `check_integrity` walks the whole tree after mutations and verifies the
//! structural invariants: fill bounds, ordering, separator bounds, uniform
//! leaf depth and the doubly linked leaf chain.

use std::path::Path;

use eyre::{ensure, Result};
use tracing::debug;

use super::node::NodeViewMut;
use super::slot::{materialize_key, KeyBuf, SlotView};
use super::traverse::{find_leaf, node_meta, slot_bytes};
use crate::config::min_keys;
use crate::error::TreeError;
use crate::extkey::ExtkeyCache;
use crate::storage::{PageAddr, PageType, Pager, PagerOptions, NIL_PAGE};

use super::cursor::CursorRegistry;

/// Outcome of an erase: the record id (first duplicate for duplicate slots)
/// and the slot flags the key carried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErasedRecord {
    pub record_id: u64,
    pub flags: u8,
}

/// Statistics gathered by `check_integrity`.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TreeStats {
    pub depth: usize,
    pub node_count: u64,
    pub leaf_count: u64,
    pub key_count: u64,
    pub extended_keys: u64,
}

pub struct Btree {
    pub(crate) pager: Pager,
    pub(crate) extkeys: ExtkeyCache,
    pub(crate) cursors: CursorRegistry,
}

impl Btree {
    /// Creates a new tree file with a single empty leaf as its root.
    pub fn create<P: AsRef<Path>>(path: P, options: PagerOptions) -> Result<Self> {
        let mut pager = Pager::create(path, options)?;

        let root = pager.alloc(PageType::BtreeRoot)?;
        let key_size = pager.key_size();
        {
            let payload = pager.payload_mut(root)?;
            NodeViewMut::init(payload, key_size, true)?;
        }
        pager.set_root(root)?;

        debug!(root, key_size, "created tree");
        Ok(Self {
            pager,
            extkeys: ExtkeyCache::default(),
            cursors: CursorRegistry::default(),
        })
    }

    /// Opens an existing tree file.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut pager = Pager::open(path)?;

        let root = pager.root()?;
        ensure!(root != NIL_PAGE, "tree file has no root page");
        let page_type = pager.page_type(root)?;
        ensure!(
            page_type == PageType::BtreeRoot,
            "root page {} has type {:?}",
            root,
            page_type
        );

        Ok(Self {
            pager,
            extkeys: ExtkeyCache::default(),
            cursors: CursorRegistry::default(),
        })
    }

    pub fn key_size(&self) -> usize {
        self.pager.key_size()
    }

    pub fn max_keys(&self) -> usize {
        self.pager.max_keys()
    }

    pub fn min_keys(&self) -> usize {
        min_keys(self.pager.max_keys())
    }

    pub fn root(&self) -> Result<PageAddr> {
        self.pager.root()
    }

    pub fn pager(&self) -> &Pager {
        &self.pager
    }

    pub fn pager_mut(&mut self) -> &mut Pager {
        &mut self.pager
    }

    /// Point lookup: the record id stored under `key`. For a key with
    /// duplicates this is the first record in the duplicate list.
    pub fn find(&mut self, key: &[u8]) -> Result<u64> {
        let root = self.pager.root()?;
        let key_size = self.pager.key_size();

        let (leaf, m) = find_leaf(&mut self.pager, &mut self.extkeys, root, key, key_size)?;
        if !m.exact {
            return Err(eyre::Report::new(TreeError::KeyNotFound));
        }

        self.record_at(leaf, m.slot as usize, 0)
    }

    /// The smallest key and its record id, or `KeyNotFound` on an empty
    /// tree.
    pub fn first(&mut self) -> Result<(Vec<u8>, u64)> {
        self.edge_entry(true)
    }

    /// The greatest key and its record id, or `KeyNotFound` on an empty
    /// tree.
    pub fn last(&mut self) -> Result<(Vec<u8>, u64)> {
        self.edge_entry(false)
    }

    fn edge_entry(&mut self, leftmost: bool) -> Result<(Vec<u8>, u64)> {
        let root = self.pager.root()?;
        let key_size = self.pager.key_size();

        let leaf = super::traverse::edge_leaf(&mut self.pager, root, key_size, leftmost)?;
        let meta = node_meta(&mut self.pager, leaf, key_size)?;
        if meta.count == 0 {
            return Err(eyre::Report::new(TreeError::KeyNotFound));
        }

        let slot = if leftmost { 0 } else { meta.count - 1 };
        let bytes = slot_bytes(&mut self.pager, leaf, slot, key_size)?;
        let key = materialize_key(&mut self.pager, &mut self.extkeys, &bytes, key_size)?;
        let record = self.record_at(leaf, slot, 0)?;
        Ok((key.to_vec(), record))
    }

    /// Writes checksums and syncs the file.
    pub fn flush(&mut self) -> Result<()> {
        self.pager.flush_all()
    }

    /// The record id at `(page, slot, dup_idx)`, resolving duplicate lists.
    pub(crate) fn record_at(
        &mut self,
        page: PageAddr,
        slot: usize,
        dup_idx: usize,
    ) -> Result<u64> {
        let key_size = self.pager.key_size();
        let bytes = slot_bytes(&mut self.pager, page, slot, key_size)?;
        let view = SlotView::new(&bytes, key_size);

        if view.has_duplicates() {
            let list = super::dupe::read_list(&mut self.pager, view.ptr())?;
            list.get(dup_idx).copied().ok_or_else(|| {
                eyre::Report::new(TreeError::InvariantBroken(format!(
                    "duplicate index {} out of range ({} records)",
                    dup_idx,
                    list.len()
                )))
            })
        } else {
            ensure!(
                dup_idx == 0,
                "duplicate index {} on a slot without duplicates",
                dup_idx
            );
            Ok(view.ptr())
        }
    }

    /// Number of records attached to the slot (1 unless duplicates exist).
    pub(crate) fn record_count_at(&mut self, page: PageAddr, slot: usize) -> Result<usize> {
        let key_size = self.pager.key_size();
        let bytes = slot_bytes(&mut self.pager, page, slot, key_size)?;
        let view = SlotView::new(&bytes, key_size);

        if view.has_duplicates() {
            Ok(super::dupe::read_list(&mut self.pager, view.ptr())?.len())
        } else {
            Ok(1)
        }
    }

    /// Full tree verification; see the testable properties in the module
    /// docs. Returns statistics on success.
    pub fn check_integrity(&mut self) -> Result<TreeStats> {
        let root = self.pager.root()?;
        ensure!(root != NIL_PAGE, "tree has no root");

        let mut stats = TreeStats::default();
        let mut prev_leaf_key: Option<KeyBuf> = None;
        let mut leaf_depth: Option<usize> = None;

        self.check_node(
            root,
            true,
            0,
            None,
            None,
            &mut stats,
            &mut prev_leaf_key,
            &mut leaf_depth,
        )?;

        self.check_leaf_chain(root, stats.key_count)?;

        stats.depth = leaf_depth.unwrap_or(0) + 1;
        Ok(stats)
    }

    #[allow(clippy::too_many_arguments)]
    fn check_node(
        &mut self,
        addr: PageAddr,
        is_root: bool,
        depth: usize,
        lower: Option<&[u8]>,
        upper: Option<&[u8]>,
        stats: &mut TreeStats,
        prev_leaf_key: &mut Option<KeyBuf>,
        leaf_depth: &mut Option<usize>,
    ) -> Result<()> {
        let key_size = self.pager.key_size();
        let max = self.pager.max_keys();
        let min = min_keys(max);

        let meta = node_meta(&mut self.pager, addr, key_size)?;
        stats.node_count += 1;

        if !is_root && (meta.count < min || meta.count > max) {
            return Err(eyre::Report::new(TreeError::InvariantBroken(format!(
                "node {} has {} keys, outside [{}, {}]",
                addr, meta.count, min, max
            ))));
        }
        if is_root && !meta.is_leaf && meta.count == 0 {
            return Err(eyre::Report::new(TreeError::InvariantBroken(format!(
                "internal root {} is empty and was not collapsed",
                addr
            ))));
        }

        let mut keys: Vec<KeyBuf> = Vec::with_capacity(meta.count);
        for i in 0..meta.count {
            let bytes = slot_bytes(&mut self.pager, addr, i, key_size)?;
            let view = SlotView::new(&bytes, key_size);
            if view.is_extended() {
                stats.extended_keys += 1;
            }
            keys.push(materialize_key(
                &mut self.pager,
                &mut self.extkeys,
                &bytes,
                key_size,
            )?);
        }

        for pair in keys.windows(2) {
            if pair[0] >= pair[1] {
                return Err(eyre::Report::new(TreeError::InvariantBroken(format!(
                    "node {} keys are not strictly increasing",
                    addr
                ))));
            }
        }

        // Every key must respect the separator bounds inherited from the
        // ancestors: strictly above the lower bound, at most the upper.
        for key in &keys {
            if let Some(lo) = lower {
                if key.as_slice() <= lo {
                    return Err(eyre::Report::new(TreeError::InvariantBroken(format!(
                        "node {} holds a key at or below its lower separator",
                        addr
                    ))));
                }
            }
            if let Some(hi) = upper {
                if key.as_slice() > hi {
                    return Err(eyre::Report::new(TreeError::InvariantBroken(format!(
                        "node {} holds a key above its upper separator",
                        addr
                    ))));
                }
            }
        }

        if meta.is_leaf {
            stats.leaf_count += 1;
            stats.key_count += keys.len() as u64;

            match leaf_depth {
                None => *leaf_depth = Some(depth),
                Some(d) if *d != depth => {
                    return Err(eyre::Report::new(TreeError::InvariantBroken(format!(
                        "leaf {} at depth {}, expected {}",
                        addr, depth, d
                    ))));
                }
                _ => {}
            }

            for key in keys {
                if let Some(prev) = prev_leaf_key.as_ref() {
                    if prev.as_slice() >= key.as_slice() {
                        return Err(eyre::Report::new(TreeError::InvariantBroken(format!(
                            "leaf {} breaks global key order",
                            addr
                        ))));
                    }
                }
                *prev_leaf_key = Some(key);
            }
            return Ok(());
        }

        // Internal node: children are ptr_left then each slot's ptr. The
        // separator at i bounds child i from above (exclusive) and child
        // i+1 from below (inclusive at the child's minimum).
        if meta.ptr_left == NIL_PAGE {
            return Err(eyre::Report::new(TreeError::Corruption(format!(
                "internal node {} has a nil ptr_left",
                addr
            ))));
        }

        let mut children = Vec::with_capacity(meta.count + 1);
        children.push(meta.ptr_left);
        for i in 0..meta.count {
            let bytes = slot_bytes(&mut self.pager, addr, i, key_size)?;
            let ptr = SlotView::new(&bytes, key_size).ptr();
            if ptr == NIL_PAGE {
                return Err(eyre::Report::new(TreeError::Corruption(format!(
                    "internal node {} slot {} points to the nil page",
                    addr, i
                ))));
            }
            children.push(ptr);
        }

        for (i, child) in children.iter().enumerate() {
            // child i is bounded below by separator i-1 and above by
            // separator i; keys equal to a separator live to its right.
            let child_lower = if i == 0 {
                lower.map(KeyBuf::from_slice)
            } else {
                // separator key routes equal keys right, so the child above
                // it is bounded below exclusively by "separator - epsilon";
                // keys equal to the separator are legal in child i.
                None
            };
            let child_upper = if i < keys.len() {
                Some(keys[i].clone())
            } else {
                upper.map(KeyBuf::from_slice)
            };

            // For i > 0 the inclusive lower bound is checked through the
            // global leaf-order walk plus the per-node bounds; pass the
            // separator as an inclusive floor by checking the child minimum
            // below instead of threading an extra bound kind.
            if i > 0 {
                let sep = &keys[i - 1];
                let child_min = self.subtree_min(*child)?;
                if let Some(min_key) = child_min {
                    if min_key.as_slice() < sep.as_slice() {
                        return Err(eyre::Report::new(TreeError::InvariantBroken(format!(
                            "child {} of node {} starts below its separator",
                            child, addr
                        ))));
                    }
                }
            }

            self.check_node(
                *child,
                false,
                depth + 1,
                child_lower.as_deref(),
                child_upper.as_deref(),
                stats,
                prev_leaf_key,
                leaf_depth,
            )?;
        }

        Ok(())
    }

    /// Smallest key in the subtree rooted at `addr`, or None when empty.
    fn subtree_min(&mut self, addr: PageAddr) -> Result<Option<KeyBuf>> {
        let key_size = self.pager.key_size();
        let mut current = addr;
        loop {
            let meta = node_meta(&mut self.pager, current, key_size)?;
            if meta.is_leaf {
                if meta.count == 0 {
                    return Ok(None);
                }
                let bytes = slot_bytes(&mut self.pager, current, 0, key_size)?;
                return Ok(Some(materialize_key(
                    &mut self.pager,
                    &mut self.extkeys,
                    &bytes,
                    key_size,
                )?));
            }
            current = meta.ptr_left;
        }
    }

    /// Walks the leaf chain left to right, checking the pairing of left and
    /// right links, per-boundary key order and that the chain sees every
    /// key the in-order walk saw.
    fn check_leaf_chain(&mut self, root: PageAddr, expected_keys: u64) -> Result<()> {
        let key_size = self.pager.key_size();
        let mut addr = super::traverse::edge_leaf(&mut self.pager, root, key_size, true)?;

        let first_meta = node_meta(&mut self.pager, addr, key_size)?;
        if first_meta.left != NIL_PAGE {
            return Err(eyre::Report::new(TreeError::InvariantBroken(format!(
                "leftmost leaf {} has a left link",
                addr
            ))));
        }

        let mut seen: u64 = 0;
        let mut prev: Option<(PageAddr, KeyBuf)> = None;

        loop {
            let meta = node_meta(&mut self.pager, addr, key_size)?;
            seen += meta.count as u64;

            if let Some((prev_addr, prev_max)) = prev.as_ref() {
                if meta.left != *prev_addr {
                    return Err(eyre::Report::new(TreeError::InvariantBroken(format!(
                        "leaf {} left link {} does not match predecessor {}",
                        addr, meta.left, prev_addr
                    ))));
                }
                if meta.count > 0 {
                    let bytes = slot_bytes(&mut self.pager, addr, 0, key_size)?;
                    let min_key =
                        materialize_key(&mut self.pager, &mut self.extkeys, &bytes, key_size)?;
                    if prev_max.as_slice() >= min_key.as_slice() {
                        return Err(eyre::Report::new(TreeError::InvariantBroken(format!(
                            "leaf chain order violated between {} and {}",
                            prev_addr, addr
                        ))));
                    }
                }
            }

            let next = meta.right;
            if meta.count > 0 {
                let bytes = slot_bytes(&mut self.pager, addr, meta.count - 1, key_size)?;
                let max_key =
                    materialize_key(&mut self.pager, &mut self.extkeys, &bytes, key_size)?;
                prev = Some((addr, max_key));
            } else {
                prev = Some((addr, KeyBuf::new()));
            }

            if next == NIL_PAGE {
                break;
            }
            addr = next;
        }

        ensure!(
            seen == expected_keys,
            "leaf chain sees {} keys, in-order walk saw {}",
            seen,
            expected_keys
        );
        Ok(())
    }
}
