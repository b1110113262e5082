// Pager: page cache, allocation, and the single-writer commit bracket.
//
// The pager owns all traffic to the main data file. Reads consult the
// WAL's committed frames before falling back to the base file; writes
// accumulate as dirty cache pages and reach durable storage only through
// `WriteTransaction::commit`, which appends every dirty page as a WAL
// frame and seals them with a commit marker. The main file itself is
// only rewritten by `checkpoint`.
//
// Page 0 holds the file header and is managed by the pager alone:
//   {magic:4, page_size:4, page_count:4, root_page:4, reserved:16}

mod page;

pub use page::{Page, PageHandle, PageRef};

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::{Mutex, MutexGuard};

use crate::common::{PageId, DEFAULT_PAGE_SIZE};
use crate::error::{DbError, Result};
use crate::storage::{BlockFile, PageStore};
use crate::wal::{Wal, WAL_HEADER_SIZE};

/// Identifies an anchordb main file ("ankr").
pub const DB_MAGIC: u32 = 0x616e_6b72;

const HEADER_LEN: usize = 32;

/// Tuning knobs for a pager instance.
#[derive(Debug, Clone)]
pub struct PagerOptions {
    pub page_size: usize,
    /// Cached pages kept around before clean, unpinned pages are evicted.
    pub cache_capacity: usize,
}

impl Default for PagerOptions {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            cache_capacity: 1024,
        }
    }
}

/// Cache and transaction counters for one pager.
#[derive(Debug, Clone, Default)]
pub struct PagerStats {
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub evictions: u64,
    pub commits: u64,
    pub rollbacks: u64,
    pub checkpoints: u64,
}

#[derive(Default)]
struct PagerCounters {
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    evictions: AtomicU64,
    commits: AtomicU64,
    rollbacks: AtomicU64,
    checkpoints: AtomicU64,
}

/// Page cache and transaction bracket over one database file.
pub struct Pager {
    store: PageStore,
    wal: Option<Wal>,
    cache: Mutex<HashMap<PageId, PageRef>>,
    cache_capacity: usize,
    write_lock: Mutex<()>,
    page_count: AtomicU32,
    root_page: AtomicU32,
    page_size: usize,
    counters: PagerCounters,
}

impl std::fmt::Debug for Pager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pager")
            .field("page_size", &self.page_size)
            .field("page_count", &self.page_count)
            .field("root_page", &self.root_page)
            .finish_non_exhaustive()
    }
}

impl Pager {
    /// Opens a pager over `data`, optionally journaling through `wal`.
    ///
    /// A fresh data file gets a header page written immediately; an
    /// existing one must carry the right magic and page size.
    pub fn open(
        data: Arc<dyn BlockFile>,
        wal_file: Option<Arc<dyn BlockFile>>,
        opts: PagerOptions,
    ) -> Result<Self> {
        let store = PageStore::new(data, opts.page_size)?;
        let wal = match wal_file {
            Some(file) => Some(if file.len()? < WAL_HEADER_SIZE as u64 {
                Wal::create(file, opts.page_size, fresh_salt())?
            } else {
                let wal = Wal::open(file)?;
                if wal.page_size() != opts.page_size {
                    return Err(DbError::invalid_format(format!(
                        "wal page size {} does not match pager page size {}",
                        wal.page_size(),
                        opts.page_size
                    )));
                }
                wal
            }),
            None => None,
        };

        let pager = Self {
            store,
            wal,
            cache: Mutex::new(HashMap::new()),
            cache_capacity: opts.cache_capacity.max(1),
            write_lock: Mutex::new(()),
            page_count: AtomicU32::new(1),
            root_page: AtomicU32::new(0),
            page_size: opts.page_size,
            counters: PagerCounters::default(),
        };
        pager.load_header()?;
        Ok(pager)
    }

    /// Reads the header through the WAL-first path, or initializes a
    /// fresh database.
    fn load_header(&self) -> Result<()> {
        let mut header = vec![0u8; self.page_size];
        let mut found = false;
        if let Some(wal) = &self.wal {
            if let Some(idx) = wal.find_page(0) {
                header = wal.read_frame(idx)?.1;
                found = true;
            }
        }
        if !found && self.store.len_bytes()? > 0 {
            self.store.read_page(0, &mut header)?;
            found = true;
        }

        if found {
            let magic = u32::from_le_bytes(header[0..4].try_into().unwrap());
            if magic != DB_MAGIC {
                return Err(DbError::invalid_format(format!(
                    "bad database magic {magic:#010x}"
                )));
            }
            let page_size = u32::from_le_bytes(header[4..8].try_into().unwrap()) as usize;
            if page_size != self.page_size {
                return Err(DbError::invalid_format(format!(
                    "database page size {} does not match pager page size {}",
                    page_size, self.page_size
                )));
            }
            let pages = u32::from_le_bytes(header[8..12].try_into().unwrap());
            let root = u32::from_le_bytes(header[12..16].try_into().unwrap());
            self.page_count.store(pages.max(1), Ordering::Release);
            self.root_page.store(root, Ordering::Release);
        } else {
            // Fresh database: header page goes straight to the base file
            // so the file is recognizable from its first byte on.
            self.store.write_page(0, &self.build_header())?;
            self.store.sync()?;
        }
        Ok(())
    }

    fn build_header(&self) -> Vec<u8> {
        let mut header = vec![0u8; self.page_size];
        header[0..4].copy_from_slice(&DB_MAGIC.to_le_bytes());
        header[4..8].copy_from_slice(&(self.page_size as u32).to_le_bytes());
        header[8..12].copy_from_slice(&self.page_count.load(Ordering::Acquire).to_le_bytes());
        header[12..16].copy_from_slice(&self.root_page.load(Ordering::Acquire).to_le_bytes());
        debug_assert!(HEADER_LEN <= self.page_size);
        header
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Logical page count, including the header page.
    pub fn page_count(&self) -> u32 {
        self.page_count.load(Ordering::Acquire)
    }

    /// Root page recorded in the header (0 = none).
    pub fn root_page(&self) -> PageId {
        self.root_page.load(Ordering::Acquire)
    }

    /// Records the tree root in the header. Persisted by the next commit.
    pub fn set_root_page(&self, page_no: PageId) {
        self.root_page.store(page_no, Ordering::Release);
    }

    /// Returns a pinned reference to a page, loading it on a cache miss.
    /// Committed WAL frames shadow the base file.
    pub fn get(&self, page_no: PageId) -> Result<PageRef> {
        if page_no == 0 {
            return Err(DbError::invalid_format("page 0 is reserved for the header"));
        }
        let mut cache = self.cache.lock();
        if let Some(handle) = cache.get(&page_no) {
            handle.pin();
            self.counters.cache_hits.fetch_add(1, Ordering::Relaxed);
            return Ok(handle.clone());
        }
        self.counters.cache_misses.fetch_add(1, Ordering::Relaxed);

        let mut data = vec![0u8; self.page_size];
        let mut from_wal = false;
        if let Some(wal) = &self.wal {
            if let Some(idx) = wal.find_page(page_no) {
                data = wal.read_frame(idx)?.1;
                from_wal = true;
            }
        }
        if !from_wal {
            self.store.read_page(page_no, &mut data)?;
        }
        log::trace!("pager miss: page {page_no} (wal: {from_wal})");

        let handle: PageRef = Arc::new(PageHandle::new(page_no, data));
        handle.pin();
        cache.insert(page_no, handle.clone());
        self.evict_locked(&mut cache);
        Ok(handle)
    }

    /// Appends a zeroed page. Its page number is the previous page count.
    pub fn allocate(&self) -> Result<PageRef> {
        let page_no = self.page_count.fetch_add(1, Ordering::AcqRel);
        let handle: PageRef = Arc::new(PageHandle::new(page_no, vec![0u8; self.page_size]));
        handle.write().mark_dirty();
        handle.pin();
        let mut cache = self.cache.lock();
        cache.insert(page_no, handle.clone());
        self.evict_locked(&mut cache);
        Ok(handle)
    }

    /// Drops one pin. Unpinned clean pages become eviction candidates.
    pub fn release(&self, page: &PageRef) {
        page.unpin();
    }

    fn evict_locked(&self, cache: &mut HashMap<PageId, PageRef>) {
        if cache.len() <= self.cache_capacity {
            return;
        }
        let excess = cache.len() - self.cache_capacity;
        let victims: Vec<PageId> = cache
            .values()
            .filter(|h| {
                h.pin_count() == 0 && h.try_read().is_some_and(|page| !page.is_dirty())
            })
            .map(|h| h.page_no())
            .take(excess)
            .collect();
        for page_no in victims {
            cache.remove(&page_no);
            self.counters.evictions.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Opens the single write transaction. Blocks while another writer
    /// holds the bracket.
    pub fn begin_write(&self) -> WriteTransaction<'_> {
        let guard = self.write_lock.lock();
        WriteTransaction {
            pager: self,
            _guard: guard,
            start_pages: self.page_count(),
            start_root: self.root_page(),
            finished: false,
        }
    }

    /// Transfers committed WAL frames into the main file and resets the
    /// log. Returns frames transferred.
    pub fn checkpoint(&self) -> Result<usize> {
        let _guard = self.write_lock.lock();
        match &self.wal {
            Some(wal) => {
                let frames = wal.checkpoint(&self.store)?;
                self.counters.checkpoints.fetch_add(1, Ordering::Relaxed);
                Ok(frames)
            }
            None => Ok(0),
        }
    }

    pub fn stats(&self) -> PagerStats {
        PagerStats {
            cache_hits: self.counters.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.counters.cache_misses.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            commits: self.counters.commits.load(Ordering::Relaxed),
            rollbacks: self.counters.rollbacks.load(Ordering::Relaxed),
            checkpoints: self.counters.checkpoints.load(Ordering::Relaxed),
        }
    }

    /// Checkpoints (when journaling) and syncs the base file.
    pub fn close(&self) -> Result<()> {
        self.checkpoint()?;
        self.store.sync()
    }

    fn commit_inner(&self) -> Result<()> {
        let dirty: Vec<PageRef> = {
            let cache = self.cache.lock();
            let mut dirty: Vec<PageRef> = cache
                .values()
                .filter(|h| h.read().is_dirty())
                .cloned()
                .collect();
            dirty.sort_by_key(|h| h.page_no());
            dirty
        };

        let header = self.build_header();
        let db_size = self.page_count();
        match &self.wal {
            Some(wal) => {
                for handle in &dirty {
                    wal.write_frame(handle.page_no(), handle.read().data(), 0)?;
                }
                // The header frame is the commit marker: either it lands
                // with every preceding frame, or none of them count.
                wal.write_frame(0, &header, db_size)?;
                wal.sync()?;
            }
            None => {
                for handle in &dirty {
                    self.store.write_page(handle.page_no(), handle.read().data())?;
                }
                self.store.write_page(0, &header)?;
                self.store.ensure_pages(db_size)?;
                self.store.sync()?;
            }
        }
        for handle in &dirty {
            handle.write().clear_dirty();
        }
        self.counters.commits.fetch_add(1, Ordering::Relaxed);
        log::debug!("commit: {} dirty pages, db size {db_size}", dirty.len());
        Ok(())
    }

    fn rollback_inner(&self, start_pages: u32, start_root: PageId) {
        let mut cache = self.cache.lock();
        cache.retain(|_, handle| !handle.read().is_dirty());
        self.page_count.store(start_pages, Ordering::Release);
        self.root_page.store(start_root, Ordering::Release);
        self.counters.rollbacks.fetch_add(1, Ordering::Relaxed);
        log::debug!("rollback: cache reset to {start_pages} pages");
    }
}

/// Exclusive write bracket. Dropping without `commit` rolls back.
pub struct WriteTransaction<'a> {
    pager: &'a Pager,
    _guard: MutexGuard<'a, ()>,
    start_pages: u32,
    start_root: PageId,
    finished: bool,
}

impl WriteTransaction<'_> {
    /// Durably records every dirty page. All-or-nothing: the commit
    /// marker is written and synced after the page frames.
    pub fn commit(mut self) -> Result<()> {
        self.pager.commit_inner()?;
        self.finished = true;
        Ok(())
    }

    /// Discards in-memory modifications; subsequent reads reload the
    /// durable image from the WAL or the base file.
    pub fn rollback(mut self) {
        self.pager.rollback_inner(self.start_pages, self.start_root);
        self.finished = true;
    }
}

impl Drop for WriteTransaction<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.pager.rollback_inner(self.start_pages, self.start_root);
        }
    }
}

fn fresh_salt() -> (u32, u32) {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    (now.as_secs() as u32, now.subsec_nanos())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemBlocks;

    fn mem_pager(page_size: usize, with_wal: bool) -> (Arc<MemBlocks>, Arc<MemBlocks>, Arc<Pager>) {
        let data = Arc::new(MemBlocks::new());
        let wal = Arc::new(MemBlocks::new());
        let pager = Pager::open(
            data.clone(),
            with_wal.then(|| wal.clone() as Arc<dyn BlockFile>),
            PagerOptions {
                page_size,
                cache_capacity: 8,
            },
        )
        .unwrap();
        (data, wal, Arc::new(pager))
    }

    #[test]
    fn test_allocate_numbers_follow_page_count() {
        let (_, _, pager) = mem_pager(256, false);
        let tx = pager.begin_write();
        let a = pager.allocate().unwrap();
        let b = pager.allocate().unwrap();
        assert_eq!(a.page_no(), 1);
        assert_eq!(b.page_no(), 2);
        assert_eq!(pager.page_count(), 3);
        pager.release(&a);
        pager.release(&b);
        tx.rollback();
        assert_eq!(pager.page_count(), 1);
    }

    #[test]
    fn test_commit_then_reload() {
        let (_, _, pager) = mem_pager(256, true);
        let tx = pager.begin_write();
        let page = pager.allocate().unwrap();
        {
            let mut guard = page.write();
            guard.data_mut()[0] = 0x42;
            guard.mark_dirty();
        }
        pager.release(&page);
        tx.commit().unwrap();

        // Drop the cache copy and read back through the WAL.
        {
            let mut cache = pager.cache.lock();
            cache.clear();
        }
        let page = pager.get(1).unwrap();
        assert_eq!(page.read().data()[0], 0x42);
        pager.release(&page);
    }

    #[test]
    fn test_rollback_discards_changes() {
        let (_, _, pager) = mem_pager(256, true);
        {
            let tx = pager.begin_write();
            let page = pager.allocate().unwrap();
            page.write().mark_dirty();
            pager.release(&page);
            tx.commit().unwrap();
        }

        let tx = pager.begin_write();
        let page = pager.get(1).unwrap();
        {
            let mut guard = page.write();
            guard.data_mut()[0] = 0x99;
            guard.mark_dirty();
        }
        pager.release(&page);
        tx.rollback();

        let page = pager.get(1).unwrap();
        assert_eq!(page.read().data()[0], 0);
        pager.release(&page);
    }

    #[test]
    fn test_reopen_after_commit_without_checkpoint() {
        let data = Arc::new(MemBlocks::new());
        let wal = Arc::new(MemBlocks::new());
        let opts = PagerOptions {
            page_size: 256,
            cache_capacity: 8,
        };
        {
            let pager = Pager::open(
                data.clone(),
                Some(wal.clone() as Arc<dyn BlockFile>),
                opts.clone(),
            )
            .unwrap();
            let tx = pager.begin_write();
            let page = pager.allocate().unwrap();
            {
                let mut guard = page.write();
                guard.data_mut()[0] = 7;
                guard.mark_dirty();
            }
            pager.release(&page);
            pager.set_root_page(1);
            tx.commit().unwrap();
        }

        let pager = Pager::open(data, Some(wal as Arc<dyn BlockFile>), opts).unwrap();
        assert_eq!(pager.page_count(), 2);
        assert_eq!(pager.root_page(), 1);
        let page = pager.get(1).unwrap();
        assert_eq!(page.read().data()[0], 7);
        pager.release(&page);
    }

    #[test]
    fn test_open_rejects_wrong_page_size() {
        let data = Arc::new(MemBlocks::new());
        {
            Pager::open(data.clone(), None, PagerOptions {
                page_size: 256,
                cache_capacity: 8,
            })
            .unwrap();
        }
        let err = Pager::open(data, None, PagerOptions {
            page_size: 512,
            cache_capacity: 8,
        })
        .unwrap_err();
        assert!(err.is_corruption());
    }

    #[test]
    fn test_eviction_skips_pinned_and_dirty() {
        let (_, _, pager) = mem_pager(256, false);
        let tx = pager.begin_write();
        let mut held = Vec::new();
        for _ in 0..12 {
            held.push(pager.allocate().unwrap());
        }
        // All pages are pinned and dirty: nothing can be evicted.
        assert_eq!(pager.cache.lock().len(), 12);
        for page in &held {
            pager.release(page);
        }
        tx.commit().unwrap();

        // A post-commit miss triggers eviction of clean, unpinned pages.
        {
            let mut cache = pager.cache.lock();
            let len = cache.len();
            pager.evict_locked(&mut cache);
            assert!(cache.len() <= len.min(pager.cache_capacity));
        }
    }
}
