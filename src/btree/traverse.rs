//! # Tree Traversal
//!
//! Locating the leaf and slot responsible for a search key. Shared by find,
//! erase and cursor coupling.
//!
//! Within a node the search is binary over the slot array. The probe copies
//! one slot's bytes into a stack buffer before comparing, because a
//! comparison against an extended key may itself need the pager (blob
//! fetch) and page borrows cannot be held across that call.

use eyre::{ensure, Result};
use smallvec::SmallVec;

use super::node::NodeView;
use super::slot::{compare_external_to_slot, SlotBuf, SlotView};
use crate::error::TreeError;
use crate::extkey::ExtkeyCache;
use crate::storage::{PageAddr, Pager, NIL_PAGE};

/// Result of a slot search within one node: `slot` is the greatest index
/// whose key is less than or equal to the search key, or -1 when every key
/// exceeds it; `exact` marks equality.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotMatch {
    pub slot: i64,
    pub exact: bool,
}

/// Header values of a node, copied out so no page borrow stays live.
#[derive(Debug, Clone, Copy)]
pub struct NodeMeta {
    pub is_leaf: bool,
    pub count: usize,
    pub ptr_left: PageAddr,
    pub left: PageAddr,
    pub right: PageAddr,
}

/// Reads a node's header, checking the page really is a B+tree node.
pub fn node_meta(pager: &mut Pager, addr: PageAddr, key_size: usize) -> Result<NodeMeta> {
    let page_type = pager.page_type(addr)?;
    if !page_type.is_btree() {
        return Err(eyre::Report::new(TreeError::Corruption(format!(
            "page {} has type {:?}, expected a B+tree node",
            addr, page_type
        ))));
    }

    let payload = pager.payload(addr)?;
    let node = NodeView::new(payload, key_size)?;
    Ok(NodeMeta {
        is_leaf: node.is_leaf(),
        count: node.count(),
        ptr_left: node.ptr_left(),
        left: node.left(),
        right: node.right(),
    })
}

/// Copies the bytes of one slot out of a node.
pub fn slot_bytes(
    pager: &mut Pager,
    addr: PageAddr,
    index: usize,
    key_size: usize,
) -> Result<SlotBuf> {
    let payload = pager.payload(addr)?;
    let node = NodeView::new(payload, key_size)?;
    Ok(SmallVec::from_slice(node.slot(index)?))
}

/// Binary search of `key` within the node at `addr`.
pub fn find_slot(
    pager: &mut Pager,
    extkeys: &mut ExtkeyCache,
    addr: PageAddr,
    key: &[u8],
    key_size: usize,
) -> Result<SlotMatch> {
    let count = node_meta(pager, addr, key_size)?.count as i64;

    let mut lo: i64 = 0;
    let mut hi: i64 = count - 1;
    let mut best: i64 = -1;

    while lo <= hi {
        let mid = lo + (hi - lo) / 2;
        let probe = slot_bytes(pager, addr, mid as usize, key_size)?;
        match compare_external_to_slot(pager, extkeys, key, &probe, key_size)? {
            std::cmp::Ordering::Less => hi = mid - 1,
            std::cmp::Ordering::Equal => {
                return Ok(SlotMatch {
                    slot: mid,
                    exact: true,
                })
            }
            std::cmp::Ordering::Greater => {
                best = mid;
                lo = mid + 1;
            }
        }
    }

    Ok(SlotMatch {
        slot: best,
        exact: false,
    })
}

/// The child an internal node routes `key` to, together with the slot match
/// that chose it.
pub fn child_for(
    pager: &mut Pager,
    extkeys: &mut ExtkeyCache,
    addr: PageAddr,
    key: &[u8],
    key_size: usize,
) -> Result<(PageAddr, SlotMatch)> {
    let meta = node_meta(pager, addr, key_size)?;
    ensure!(!meta.is_leaf, "child_for called on a leaf");

    let m = find_slot(pager, extkeys, addr, key, key_size)?;
    let child = if m.slot == -1 {
        meta.ptr_left
    } else {
        let bytes = slot_bytes(pager, addr, m.slot as usize, key_size)?;
        SlotView::new(&bytes, key_size).ptr()
    };

    if child == NIL_PAGE {
        return Err(eyre::Report::new(TreeError::Corruption(format!(
            "internal node {} routes slot {} to the nil page",
            addr, m.slot
        ))));
    }

    Ok((child, m))
}

/// Descends from `root` to the leaf responsible for `key`.
pub fn find_leaf(
    pager: &mut Pager,
    extkeys: &mut ExtkeyCache,
    root: PageAddr,
    key: &[u8],
    key_size: usize,
) -> Result<(PageAddr, SlotMatch)> {
    let mut addr = root;

    loop {
        let meta = node_meta(pager, addr, key_size)?;
        if meta.is_leaf {
            let m = find_slot(pager, extkeys, addr, key, key_size)?;
            return Ok((addr, m));
        }
        let (child, _) = child_for(pager, extkeys, addr, key, key_size)?;
        addr = child;
    }
}

/// Descends to the leftmost or rightmost leaf under `root`.
pub fn edge_leaf(
    pager: &mut Pager,
    root: PageAddr,
    key_size: usize,
    leftmost: bool,
) -> Result<PageAddr> {
    let mut addr = root;

    loop {
        let meta = node_meta(pager, addr, key_size)?;
        if meta.is_leaf {
            return Ok(addr);
        }
        addr = if leftmost || meta.count == 0 {
            meta.ptr_left
        } else {
            let bytes = slot_bytes(pager, addr, meta.count - 1, key_size)?;
            SlotView::new(&bytes, key_size).ptr()
        };
        ensure!(addr != NIL_PAGE, "internal node routes to the nil page");
    }
}
