// In-memory block storage for tests and throwaway databases.

use parking_lot::RwLock;

use crate::error::Result;

use super::BlockFile;

/// `BlockFile` over a growable byte buffer. `sync` is a no-op.
#[derive(Default)]
pub struct MemBlocks {
    data: RwLock<Vec<u8>>,
}

impl MemBlocks {
    pub fn new() -> Self {
        Self::default()
    }
}

impl BlockFile for MemBlocks {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let data = self.data.read();
        buf.fill(0);
        let offset = offset as usize;
        if offset < data.len() {
            let available = (data.len() - offset).min(buf.len());
            buf[..available].copy_from_slice(&data[offset..offset + available]);
        }
        Ok(())
    }

    fn write_at(&self, offset: u64, src: &[u8]) -> Result<()> {
        let mut data = self.data.write();
        let end = offset as usize + src.len();
        if data.len() < end {
            data.resize(end, 0);
        }
        data[offset as usize..end].copy_from_slice(src);
        Ok(())
    }

    fn len(&self) -> Result<u64> {
        Ok(self.data.read().len() as u64)
    }

    fn set_len(&self, len: u64) -> Result<()> {
        self.data.write().resize(len as usize, 0);
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }
}
