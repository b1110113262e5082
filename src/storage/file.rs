// File-backed block storage.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use parking_lot::Mutex;

use crate::error::Result;

use super::BlockFile;

/// `BlockFile` over a real file.
///
/// A single mutex serializes the seek/read and seek/write pairs; the
/// layers above batch their I/O per page or per frame, so contention on
/// the offset lock is not a concern.
pub struct FileBlocks {
    file: Mutex<File>,
}

impl FileBlocks {
    /// Opens an existing file, or creates it when absent.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        Ok(Self {
            file: Mutex::new(file),
        })
    }

    /// Creates a fresh file, truncating any existing content.
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        Ok(Self {
            file: Mutex::new(file),
        })
    }
}

impl BlockFile for FileBlocks {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let mut file = self.file.lock();
        let len = file.metadata()?.len();
        buf.fill(0);
        if offset >= len {
            return Ok(());
        }
        let available = ((len - offset) as usize).min(buf.len());
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(&mut buf[..available])?;
        Ok(())
    }

    fn write_at(&self, offset: u64, data: &[u8]) -> Result<()> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(data)?;
        Ok(())
    }

    fn len(&self) -> Result<u64> {
        Ok(self.file.lock().metadata()?.len())
    }

    fn set_len(&self, len: u64) -> Result<()> {
        self.file.lock().set_len(len)?;
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        self.file.lock().sync_all()?;
        Ok(())
    }
}
