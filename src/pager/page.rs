// Cached page representation.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::common::PageId;

/// A page image plus its dirty flag.
pub struct Page {
    data: Vec<u8>,
    dirty: bool,
}

impl Page {
    pub(crate) fn new(data: Vec<u8>) -> Self {
        Self { data, dirty: false }
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Mutable access to the page bytes. The caller is responsible for
    /// calling `mark_dirty` once it actually modifies them.
    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub(crate) fn clear_dirty(&mut self) {
        self.dirty = false;
    }
}

/// A cache entry: page number, pin count, and the page image under its
/// own lock. Pins keep the entry out of eviction; the lock serializes
/// byte access.
pub struct PageHandle {
    page_no: PageId,
    pins: AtomicUsize,
    page: RwLock<Page>,
}

/// Shared reference to a cached page.
pub type PageRef = Arc<PageHandle>;

impl PageHandle {
    pub(crate) fn new(page_no: PageId, data: Vec<u8>) -> Self {
        Self {
            page_no,
            pins: AtomicUsize::new(0),
            page: RwLock::new(Page::new(data)),
        }
    }

    pub fn page_no(&self) -> PageId {
        self.page_no
    }

    pub fn read(&self) -> RwLockReadGuard<'_, Page> {
        self.page.read()
    }

    /// Non-blocking read used by eviction; a locked page is simply not
    /// a candidate.
    pub(crate) fn try_read(&self) -> Option<RwLockReadGuard<'_, Page>> {
        self.page.try_read()
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, Page> {
        self.page.write()
    }

    pub(crate) fn pin(&self) {
        self.pins.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn unpin(&self) {
        let old = self.pins.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(old > 0, "unpin of unpinned page {}", self.page_no);
    }

    pub fn pin_count(&self) -> usize {
        self.pins.load(Ordering::Acquire)
    }
}
