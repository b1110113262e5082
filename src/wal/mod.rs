// Write-ahead log.
//
// The log makes page writes atomic across crashes: a transaction's dirty
// pages are appended as frames and the final frame carries a non-zero
// `db_size_after_commit`, the commit marker. Everything after the last
// marker is an uncommitted tail and is discarded on open. Checkpointing
// transfers committed frames into the main file and resets the log.
//
// File layout:
//   header  {magic:4, page_size:4, salt1:4, salt2:4}          16 bytes
//   frame   {header:32, page image:page_size}                 repeated
// Frame header:
//   {page_no:4, db_size_after_commit:4, salt1:4, salt2:4,
//    checksum1:8, checksum2:8}
// checksum1 covers the first 16 header bytes, checksum2 the page image.
// Both are validated on open so a torn tail never reaches the main file.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::common::PageId;
use crate::error::{DbError, Result};
use crate::storage::{frame_checksum, BlockFile, PageStore};

/// Identifies a WAL file.
pub const WAL_MAGIC: u32 = 0x377f_0682;

/// Size of the file header.
pub const WAL_HEADER_SIZE: usize = 16;

/// Size of each frame header.
pub const FRAME_HEADER_SIZE: usize = 32;

#[derive(Debug, Clone, Copy)]
struct FrameHeader {
    page_no: PageId,
    db_size: u32,
    salt1: u32,
    salt2: u32,
    checksum1: u64,
    checksum2: u64,
}

impl FrameHeader {
    fn encode(&self) -> [u8; FRAME_HEADER_SIZE] {
        let mut buf = [0u8; FRAME_HEADER_SIZE];
        buf[0..4].copy_from_slice(&self.page_no.to_le_bytes());
        buf[4..8].copy_from_slice(&self.db_size.to_le_bytes());
        buf[8..12].copy_from_slice(&self.salt1.to_le_bytes());
        buf[12..16].copy_from_slice(&self.salt2.to_le_bytes());
        buf[16..24].copy_from_slice(&self.checksum1.to_le_bytes());
        buf[24..32].copy_from_slice(&self.checksum2.to_le_bytes());
        buf
    }

    fn decode(buf: &[u8; FRAME_HEADER_SIZE]) -> Self {
        Self {
            page_no: u32::from_le_bytes(buf[0..4].try_into().unwrap()),
            db_size: u32::from_le_bytes(buf[4..8].try_into().unwrap()),
            salt1: u32::from_le_bytes(buf[8..12].try_into().unwrap()),
            salt2: u32::from_le_bytes(buf[12..16].try_into().unwrap()),
            checksum1: u64::from_le_bytes(buf[16..24].try_into().unwrap()),
            checksum2: u64::from_le_bytes(buf[24..32].try_into().unwrap()),
        }
    }
}

#[derive(Default)]
struct WalState {
    /// Frames logically present (committed prefix plus the current
    /// writer's pending tail).
    frame_count: usize,
    /// Frames in the committed prefix.
    committed: usize,
    /// Latest committed frame per page, for serving reads.
    index: HashMap<PageId, usize>,
    /// Frames appended since the last commit marker.
    pending: Vec<(PageId, usize)>,
    /// `db_size_after_commit` of the most recent marker.
    db_size: u32,
    salt1: u32,
    salt2: u32,
}

/// Cumulative counters for one log.
#[derive(Debug, Clone, Default)]
pub struct WalStats {
    pub frames_written: u64,
    pub commit_markers: u64,
    pub checkpoints: u64,
    pub syncs: u64,
}

#[derive(Default)]
struct WalCounters {
    frames_written: AtomicU64,
    commit_markers: AtomicU64,
    checkpoints: AtomicU64,
    syncs: AtomicU64,
}

/// Frame log with commit markers, recovery, and checkpointing.
pub struct Wal {
    file: Arc<dyn BlockFile>,
    page_size: usize,
    state: RwLock<WalState>,
    counters: WalCounters,
}

impl Wal {
    /// Initializes an empty log, discarding any existing content.
    pub fn create(file: Arc<dyn BlockFile>, page_size: usize, salt: (u32, u32)) -> Result<Self> {
        let wal = Self {
            file,
            page_size,
            state: RwLock::new(WalState {
                salt1: salt.0,
                salt2: salt.1,
                ..WalState::default()
            }),
            counters: WalCounters::default(),
        };
        wal.write_header(salt.0, salt.1)?;
        wal.file.set_len(WAL_HEADER_SIZE as u64)?;
        Ok(wal)
    }

    /// Opens an existing log and scans it for the committed prefix.
    ///
    /// Frames with mismatched salts or checksums end the scan: they are
    /// either torn writes or leftovers from before a checkpoint reset.
    /// The logical frame count is truncated to the committed prefix so a
    /// later append cannot resurrect a discarded tail.
    pub fn open(file: Arc<dyn BlockFile>) -> Result<Self> {
        let mut header = [0u8; WAL_HEADER_SIZE];
        if file.len()? < WAL_HEADER_SIZE as u64 {
            return Err(DbError::invalid_format("wal file too short"));
        }
        file.read_at(0, &mut header)?;
        let magic = u32::from_le_bytes(header[0..4].try_into().unwrap());
        if magic != WAL_MAGIC {
            return Err(DbError::invalid_format(format!(
                "bad wal magic {magic:#010x}"
            )));
        }
        let page_size = u32::from_le_bytes(header[4..8].try_into().unwrap()) as usize;
        if !crate::common::valid_page_size(page_size) {
            return Err(DbError::invalid_format(format!(
                "bad wal page size {page_size}"
            )));
        }
        let salt1 = u32::from_le_bytes(header[8..12].try_into().unwrap());
        let salt2 = u32::from_le_bytes(header[12..16].try_into().unwrap());

        let wal = Self {
            file,
            page_size,
            state: RwLock::new(WalState {
                salt1,
                salt2,
                ..WalState::default()
            }),
            counters: WalCounters::default(),
        };
        wal.scan()?;
        Ok(wal)
    }

    fn write_header(&self, salt1: u32, salt2: u32) -> Result<()> {
        let mut header = [0u8; WAL_HEADER_SIZE];
        header[0..4].copy_from_slice(&WAL_MAGIC.to_le_bytes());
        header[4..8].copy_from_slice(&(self.page_size as u32).to_le_bytes());
        header[8..12].copy_from_slice(&salt1.to_le_bytes());
        header[12..16].copy_from_slice(&salt2.to_le_bytes());
        self.file.write_at(0, &header)
    }

    fn frame_size(&self) -> usize {
        FRAME_HEADER_SIZE + self.page_size
    }

    fn frame_offset(&self, idx: usize) -> u64 {
        WAL_HEADER_SIZE as u64 + (idx as u64) * self.frame_size() as u64
    }

    /// Scans frames from the start, rebuilding the committed index.
    fn scan(&self) -> Result<()> {
        let mut state = self.state.write();
        let file_len = self.file.len()?;
        let physical = (file_len.saturating_sub(WAL_HEADER_SIZE as u64)
            / self.frame_size() as u64) as usize;

        let mut valid = Vec::new();
        let mut last_commit = None;
        let mut db_size = 0;
        let mut header = [0u8; FRAME_HEADER_SIZE];
        let mut body = vec![0u8; self.page_size];
        for idx in 0..physical {
            let offset = self.frame_offset(idx);
            self.file.read_at(offset, &mut header)?;
            self.file
                .read_at(offset + FRAME_HEADER_SIZE as u64, &mut body)?;
            let frame = FrameHeader::decode(&header);
            if frame.salt1 != state.salt1 || frame.salt2 != state.salt2 {
                break;
            }
            if frame.checksum1 != frame_checksum(&header[..16])
                || frame.checksum2 != frame_checksum(&body)
            {
                break;
            }
            valid.push(frame.page_no);
            if frame.db_size != 0 {
                last_commit = Some(idx);
                db_size = frame.db_size;
            }
        }

        let committed = last_commit.map_or(0, |idx| idx + 1);
        state.index.clear();
        for (idx, page_no) in valid.iter().take(committed).enumerate() {
            state.index.insert(*page_no, idx);
        }
        state.pending.clear();
        state.frame_count = committed;
        state.committed = committed;
        state.db_size = db_size;
        log::debug!(
            "wal scan: {} physical frames, {} committed",
            physical,
            committed
        );
        Ok(())
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Frames logically present in the log.
    pub fn frame_count(&self) -> usize {
        self.state.read().frame_count
    }

    /// Frames in the durable (committed) prefix.
    pub fn committed_frames(&self) -> usize {
        self.state.read().committed
    }

    /// Appends one frame. A non-zero `db_size` marks the frame as a
    /// commit marker recording the database size, in pages, after the
    /// transaction.
    pub fn write_frame(&self, page_no: PageId, data: &[u8], db_size: u32) -> Result<()> {
        if data.len() != self.page_size {
            return Err(DbError::invalid_format(format!(
                "frame body is {} bytes, page size is {}",
                data.len(),
                self.page_size
            )));
        }
        let mut state = self.state.write();
        let idx = state.frame_count;

        let mut frame = FrameHeader {
            page_no,
            db_size,
            salt1: state.salt1,
            salt2: state.salt2,
            checksum1: 0,
            checksum2: frame_checksum(data),
        };
        let mut header = frame.encode();
        frame.checksum1 = frame_checksum(&header[..16]);
        header[16..24].copy_from_slice(&frame.checksum1.to_le_bytes());

        let offset = self.frame_offset(idx);
        self.file.write_at(offset, &header)?;
        self.file.write_at(offset + FRAME_HEADER_SIZE as u64, data)?;

        state.frame_count = idx + 1;
        self.counters.frames_written.fetch_add(1, Ordering::Relaxed);
        if db_size != 0 {
            // The marker promotes the whole pending tail.
            let pending = std::mem::take(&mut state.pending);
            for (no, frame_idx) in pending {
                state.index.insert(no, frame_idx);
            }
            state.index.insert(page_no, idx);
            state.committed = idx + 1;
            state.db_size = db_size;
            self.counters.commit_markers.fetch_add(1, Ordering::Relaxed);
            log::debug!("wal commit marker at frame {idx}, db size {db_size}");
        } else {
            state.pending.push((page_no, idx));
        }
        Ok(())
    }

    /// Flushes appended frames to durable storage. A transaction is
    /// durable only once its commit marker has been synced.
    pub fn sync(&self) -> Result<()> {
        self.counters.syncs.fetch_add(1, Ordering::Relaxed);
        self.file.sync()
    }

    /// Index of the most recent committed frame holding `page_no`.
    pub fn find_page(&self, page_no: PageId) -> Option<usize> {
        self.state.read().index.get(&page_no).copied()
    }

    /// Reads the frame at `idx`, returning its page number and image.
    pub fn read_frame(&self, idx: usize) -> Result<(PageId, Vec<u8>)> {
        let offset = self.frame_offset(idx);
        let mut header = [0u8; FRAME_HEADER_SIZE];
        self.file.read_at(offset, &mut header)?;
        let frame = FrameHeader::decode(&header);
        let mut body = vec![0u8; self.page_size];
        self.file
            .read_at(offset + FRAME_HEADER_SIZE as u64, &mut body)?;
        Ok((frame.page_no, body))
    }

    /// Applies the committed prefix to `base` in frame order (a later
    /// frame for the same page wins) and syncs it. Idempotent: the log
    /// is left untouched, so re-running after a crash is safe. Returns
    /// the number of frames applied.
    pub fn recover(&self, base: &PageStore) -> Result<usize> {
        let (committed, db_size) = {
            let state = self.state.read();
            (state.committed, state.db_size)
        };
        for idx in 0..committed {
            let (page_no, body) = self.read_frame(idx)?;
            base.write_page(page_no, &body)?;
        }
        if db_size != 0 {
            base.ensure_pages(db_size)?;
        }
        if committed > 0 {
            base.sync()?;
        }
        log::debug!("wal recover: applied {committed} frames");
        Ok(committed)
    }

    /// Transfers the committed prefix into `base`, syncs it, then resets
    /// the log: the salt is bumped, the file truncated to its header,
    /// and the frame count returns to zero. Returns frames transferred.
    pub fn checkpoint(&self, base: &PageStore) -> Result<usize> {
        let transferred = self.recover(base)?;

        let mut state = self.state.write();
        state.salt1 = state.salt1.wrapping_add(1);
        state.salt2 = state.salt2.wrapping_mul(31).wrapping_add(7);
        let (salt1, salt2) = (state.salt1, state.salt2);
        state.frame_count = 0;
        state.committed = 0;
        state.db_size = 0;
        state.index.clear();
        state.pending.clear();
        drop(state);

        self.write_header(salt1, salt2)?;
        self.file.set_len(WAL_HEADER_SIZE as u64)?;
        self.file.sync()?;
        self.counters.checkpoints.fetch_add(1, Ordering::Relaxed);
        log::debug!("wal checkpoint: transferred {transferred} frames");
        Ok(transferred)
    }

    pub fn stats(&self) -> WalStats {
        WalStats {
            frames_written: self.counters.frames_written.load(Ordering::Relaxed),
            commit_markers: self.counters.commit_markers.load(Ordering::Relaxed),
            checkpoints: self.counters.checkpoints.load(Ordering::Relaxed),
            syncs: self.counters.syncs.load(Ordering::Relaxed),
        }
    }
}
