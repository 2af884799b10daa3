//! # Transaction Layer
//!
//! A minimal single-writer transaction whose one job in this crate is
//! deferred page release: structural mutations never return pages to the
//! freelist directly, they enqueue them here so a page freed mid-erase
//! cannot be recycled before the operation completes. `commit` hands the
//! queue to the pager and flushes; `abort` drops the queue, leaving the
//! pages allocated but unreferenced.
//!
//! There is no undo log: partial mutations stay in memory marked dirty, and
//! durability is the concern of the layers above this crate.

use eyre::Result;
use tracing::debug;

use crate::storage::{PageAddr, Pager};

#[derive(Debug, Default)]
pub struct Txn {
    freed: Vec<PageAddr>,
}

impl Txn {
    pub fn begin() -> Self {
        Self { freed: Vec::new() }
    }

    /// Enqueues a page for release at commit. The caller guarantees no
    /// cursor remains coupled to the page.
    pub fn free_page(&mut self, addr: PageAddr) {
        self.freed.push(addr);
    }

    /// Pages queued for release, in enqueue order.
    pub fn freed(&self) -> &[PageAddr] {
        &self.freed
    }

    /// Releases every queued page to the pager's freelist and flushes.
    pub fn commit(self, pager: &mut Pager) -> Result<()> {
        let count = self.freed.len();
        for addr in self.freed {
            pager.free_page(addr)?;
        }
        pager.flush_all()?;
        debug!(freed = count, "transaction committed");
        Ok(())
    }

    /// Drops the queue without releasing anything.
    pub fn abort(self) {
        debug!(dropped = self.freed.len(), "transaction aborted");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{PageType, PagerOptions};
    use tempfile::tempdir;

    #[test]
    fn commit_releases_queued_pages() {
        let dir = tempdir().unwrap();
        let mut pager = Pager::create(dir.path().join("t.db"), PagerOptions::default()).unwrap();

        let a = pager.alloc(PageType::BtreeIndex).unwrap();
        let b = pager.alloc(PageType::BtreeIndex).unwrap();

        let mut txn = Txn::begin();
        txn.free_page(a);
        txn.free_page(b);
        assert_eq!(txn.freed(), &[a, b]);

        txn.commit(&mut pager).unwrap();

        // Both pages come back out of the freelist before the file grows.
        let count = pager.page_count();
        let x = pager.alloc(PageType::BtreeIndex).unwrap();
        let y = pager.alloc(PageType::BtreeIndex).unwrap();
        assert!(x < count && y < count);
    }

    #[test]
    fn abort_keeps_pages_allocated() {
        let dir = tempdir().unwrap();
        let mut pager = Pager::create(dir.path().join("t.db"), PagerOptions::default()).unwrap();

        let a = pager.alloc(PageType::BtreeIndex).unwrap();
        let count = pager.page_count();

        let mut txn = Txn::begin();
        txn.free_page(a);
        txn.abort();

        // The freelist never saw the page; allocation grows the file.
        let b = pager.alloc(PageType::BtreeIndex).unwrap();
        assert_eq!(b, count);
    }
}
