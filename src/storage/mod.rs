// Block storage abstraction.
//
// The engine never opens files itself: the embedder hands it a byte
// addressed `BlockFile` (a real file, or an in-memory buffer in tests)
// and the `PageStore` wrapper fixes a page size on top of it. The WAL
// consumes the `BlockFile` directly since its frames are not page
// aligned.

mod checksum;
mod file;
mod memory;

pub use checksum::frame_checksum;
pub use file::FileBlocks;
pub use memory::MemBlocks;

use std::sync::Arc;

use crate::common::{valid_page_size, PageId};
use crate::error::{DbError, Result};

/// Byte-addressed backing medium for one database file.
///
/// Reads past the end of the medium observe zero bytes; writes extend it.
/// Implementations must be safe to share between threads.
pub trait BlockFile: Send + Sync {
    /// Fills `buf` from `offset`, zero-filling any part past the end.
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()>;

    /// Writes `data` at `offset`, growing the medium if needed.
    fn write_at(&self, offset: u64, data: &[u8]) -> Result<()>;

    /// Current length in bytes.
    fn len(&self) -> Result<u64>;

    /// Grows or shrinks the medium to exactly `len` bytes.
    fn set_len(&self, len: u64) -> Result<()>;

    /// Forces buffered writes to durable storage.
    fn sync(&self) -> Result<()>;
}

/// Page-addressed view over a `BlockFile`.
///
/// Identifies pages by a 32-bit page number; page 0 is reserved for the
/// file header by the layers above.
pub struct PageStore {
    file: Arc<dyn BlockFile>,
    page_size: usize,
}

impl PageStore {
    /// Wraps `file` with a fixed page size.
    pub fn new(file: Arc<dyn BlockFile>, page_size: usize) -> Result<Self> {
        if !valid_page_size(page_size) {
            return Err(DbError::invalid_format(format!(
                "unsupported page size {page_size}"
            )));
        }
        Ok(Self { file, page_size })
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Reads page `page_no` into `buf`. Pages past the end read as zeros.
    pub fn read_page(&self, page_no: PageId, buf: &mut [u8]) -> Result<()> {
        debug_assert_eq!(buf.len(), self.page_size);
        self.file
            .read_at(page_no as u64 * self.page_size as u64, buf)
    }

    /// Writes one full page.
    pub fn write_page(&self, page_no: PageId, data: &[u8]) -> Result<()> {
        debug_assert_eq!(data.len(), self.page_size);
        self.file
            .write_at(page_no as u64 * self.page_size as u64, data)
    }

    /// Number of whole pages currently backed by the medium.
    pub fn page_count(&self) -> Result<u32> {
        Ok((self.file.len()? / self.page_size as u64) as u32)
    }

    /// Raw byte length of the medium. Used to tell a fresh file from a
    /// short one written with a different page size.
    pub fn len_bytes(&self) -> Result<u64> {
        self.file.len()
    }

    /// Shrinks the medium to `pages` pages.
    pub fn truncate(&self, pages: u32) -> Result<()> {
        self.file.set_len(pages as u64 * self.page_size as u64)
    }

    /// Extends the medium with zero pages until it holds at least
    /// `pages` pages.
    pub fn ensure_pages(&self, pages: u32) -> Result<()> {
        let want = pages as u64 * self.page_size as u64;
        if self.file.len()? < want {
            self.file.set_len(want)?;
        }
        Ok(())
    }

    pub fn sync(&self) -> Result<()> {
        self.file.sync()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_store_round_trip() {
        let store = PageStore::new(Arc::new(MemBlocks::new()), 256).unwrap();
        assert_eq!(store.page_count().unwrap(), 0);

        let page = vec![7u8; 256];
        store.write_page(3, &page).unwrap();
        assert_eq!(store.page_count().unwrap(), 4);

        let mut out = vec![0u8; 256];
        store.read_page(3, &mut out).unwrap();
        assert_eq!(out, page);

        // Unwritten pages read as zeros.
        store.read_page(9, &mut out).unwrap();
        assert!(out.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_rejects_bad_page_size() {
        assert!(PageStore::new(Arc::new(MemBlocks::new()), 1000).is_err());
    }

    #[test]
    fn test_truncate() {
        let store = PageStore::new(Arc::new(MemBlocks::new()), 256).unwrap();
        store.write_page(7, &[1u8; 256]).unwrap();
        store.truncate(2).unwrap();
        assert_eq!(store.page_count().unwrap(), 2);
    }
}
