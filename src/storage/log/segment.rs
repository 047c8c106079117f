use std::{
    fs::{self, File, OpenOptions},
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use memmap2::{MmapMut, MmapOptions};
use parking_lot::RwLock;
use tracing::{debug, info};

use crate::error::{StoreError, StoreResult};

/// Segment file names are the zero padded decimal start offset.
pub fn segment_file_name(start_offset: u64) -> String {
    format!("{:020}", start_offset)
}

pub fn parse_segment_file_name(name: &str) -> Option<u64> {
    if name.is_empty() || !name.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    name.parse::<u64>().ok()
}

/// One fixed-capacity file mapped into memory.
///
/// Positions are relative to the segment start:
/// `flushed <= wrote <= capacity` and `committed <= wrote`.
/// Writers are serialized by the owning `SegmentList`; readers only see bytes
/// below `committed`.
pub struct MappedSegment {
    file_path: PathBuf,
    start_offset: u64,
    capacity: u64,
    // keeps the descriptor alive as long as the mapping
    _file: File,
    mmap: RwLock<MmapMut>,
    wrote: AtomicU64,
    flushed: AtomicU64,
    committed: AtomicU64,
}

impl MappedSegment {
    /// Create and map a new zero-filled segment file.
    pub fn create(dir: &Path, start_offset: u64, capacity: u64) -> StoreResult<Self> {
        let file_path = dir.join(segment_file_name(start_offset));
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&file_path)
            .map_err(|e| StoreError::io_at(&file_path, e))?;
        file.set_len(capacity)
            .map_err(|e| StoreError::io_at(&file_path, e))?;

        let segment = Self::map(file_path, file, start_offset, capacity)?;
        info!(
            "Created segment: start={}, capacity={}, path={:?}",
            start_offset, capacity, segment.file_path
        );
        Ok(segment)
    }

    /// Map an existing segment file. Positions start at zero until recovery restores them.
    pub fn open(file_path: PathBuf, start_offset: u64, capacity: u64) -> StoreResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&file_path)
            .map_err(|e| StoreError::io_at(&file_path, e))?;

        let file_size = file
            .metadata()
            .map_err(|e| StoreError::io_at(&file_path, e))?
            .len();
        if file_size != capacity {
            return Err(StoreError::InconsistentState(format!(
                "segment {:?} has {} bytes, expected {}",
                file_path, file_size, capacity
            )));
        }

        Self::map(file_path, file, start_offset, capacity)
    }

    fn map(file_path: PathBuf, file: File, start_offset: u64, capacity: u64) -> StoreResult<Self> {
        // SAFETY: the file is sized to `capacity` before mapping, stays open for the
        // lifetime of the mapping, and is only resized by this process.
        let mmap = unsafe {
            MmapOptions::new()
                .len(capacity as usize)
                .map_mut(&file)
                .map_err(|e| StoreError::io_at(&file_path, e))?
        };

        Ok(Self {
            file_path,
            start_offset,
            capacity,
            _file: file,
            mmap: RwLock::new(mmap),
            wrote: AtomicU64::new(0),
            flushed: AtomicU64::new(0),
            committed: AtomicU64::new(0),
        })
    }

    pub fn file_path(&self) -> &Path {
        &self.file_path
    }

    pub fn start_offset(&self) -> u64 {
        self.start_offset
    }

    pub fn end_offset(&self) -> u64 {
        self.start_offset + self.capacity
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn wrote(&self) -> u64 {
        self.wrote.load(Ordering::Acquire)
    }

    pub fn flushed(&self) -> u64 {
        self.flushed.load(Ordering::Acquire)
    }

    pub fn committed(&self) -> u64 {
        self.committed.load(Ordering::Acquire)
    }

    pub fn remaining(&self) -> u64 {
        self.capacity - self.wrote()
    }

    pub fn is_full(&self) -> bool {
        self.wrote() == self.capacity
    }

    pub fn is_fully_flushed(&self) -> bool {
        self.flushed() == self.wrote()
    }

    /// Append `data` at `wrote`; returns the relative position it landed at.
    pub fn write(&self, data: &[u8]) -> StoreResult<u64> {
        let pos = self.wrote();
        let len = data.len() as u64;
        if len > self.capacity - pos {
            return Err(StoreError::RecordTooLarge {
                size: len,
                max: self.capacity - pos,
            });
        }

        {
            let mut mmap = self.mmap.write();
            mmap[pos as usize..(pos + len) as usize].copy_from_slice(data);
        }
        self.wrote.store(pos + len, Ordering::Release);
        self.committed.store(pos + len, Ordering::Release);
        Ok(pos)
    }

    /// Write the filler marker at `wrote` and mark the segment full.
    pub fn seal(&self, marker: &[u8]) {
        let pos = self.wrote();
        let len = (marker.len() as u64).min(self.capacity - pos);
        if len > 0 {
            let mut mmap = self.mmap.write();
            mmap[pos as usize..(pos + len) as usize].copy_from_slice(&marker[..len as usize]);
        }
        self.wrote.store(self.capacity, Ordering::Release);
        self.committed.store(self.capacity, Ordering::Release);
    }

    /// Copy `size` committed bytes starting at relative position `pos`.
    pub fn read(&self, pos: u64, size: u64) -> StoreResult<Vec<u8>> {
        let mmap = self.mmap.read();
        let committed = self.committed();
        if pos.checked_add(size).is_none_or(|end| end > committed) {
            return Err(StoreError::OutOfRange {
                offset: self.start_offset + pos,
                size,
                limit: self.start_offset + committed,
            });
        }
        Ok(mmap[pos as usize..(pos + size) as usize].to_vec())
    }

    /// Run `f` over the whole mapped region, written or not. Used by recovery scans.
    pub fn with_bytes<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        let mmap = self.mmap.read();
        f(&mmap[..])
    }

    /// Persist `[flushed, wrote)`; returns the number of bytes flushed.
    pub fn flush(&self) -> StoreResult<u64> {
        let wrote = self.wrote();
        let flushed = self.flushed();
        if wrote <= flushed {
            return Ok(0);
        }

        self.mmap
            .read()
            .flush_range(flushed as usize, (wrote - flushed) as usize)
            .map_err(|e| StoreError::io_at(&self.file_path, e))?;
        self.flushed.store(wrote, Ordering::Release);
        debug!(
            "Flushed segment {}: [{}, {})",
            self.start_offset, flushed, wrote
        );
        Ok(wrote - flushed)
    }

    /// Cut the segment back to relative position `pos`.
    ///
    /// The discarded bytes are zeroed and synced so that a recovery scan stops at
    /// `pos` instead of finding the old records again.
    pub fn truncate_to(&self, pos: u64) -> StoreResult<()> {
        let wrote = self.wrote();
        if pos > wrote {
            return Err(StoreError::OutOfRange {
                offset: self.start_offset + pos,
                size: 0,
                limit: self.start_offset + wrote,
            });
        }
        self.discard_from(pos, wrote)
    }

    /// Zero and sync `[pos, end)`, then move every pointer back to at most `pos`.
    fn discard_from(&self, pos: u64, end: u64) -> StoreResult<()> {
        let mut mmap = self.mmap.write();
        self.committed
            .store(self.committed().min(pos), Ordering::Release);
        if end > pos {
            mmap[pos as usize..end as usize].fill(0);
            mmap.flush_range(pos as usize, (end - pos) as usize)
                .map_err(|e| StoreError::io_at(&self.file_path, e))?;
        }
        self.wrote.store(pos, Ordering::Release);
        self.committed.store(pos, Ordering::Release);
        self.flushed
            .store(self.flushed().min(pos), Ordering::Release);
        Ok(())
    }

    /// Set positions after a recovery scan; `[pos, capacity)` is wiped so torn bytes
    /// past the last good record are gone.
    pub fn restore_position(&self, pos: u64) -> StoreResult<()> {
        let pos = pos.min(self.capacity);
        self.flushed.store(0, Ordering::Release);
        let dirty_tail = self.with_bytes(|bytes| bytes[pos as usize..].iter().any(|b| *b != 0));
        if dirty_tail {
            self.discard_from(pos, self.capacity)?;
        } else {
            self.wrote.store(pos, Ordering::Release);
            self.committed.store(pos, Ordering::Release);
        }
        Ok(())
    }

    /// Unmap and delete the backing file.
    pub fn destroy(self: Arc<Self>) -> StoreResult<()> {
        let file_path = self.file_path.clone();
        match Arc::try_unwrap(self) {
            Ok(segment) => drop(segment),
            Err(_shared) => {
                // a reader still holds it; the mapping goes away with the last reference
                debug!("Segment {:?} still referenced while deleting", file_path);
            }
        }
        fs::remove_file(&file_path).map_err(|e| StoreError::io_at(&file_path, e))?;
        info!("Deleted segment: path={:?}", file_path);
        Ok(())
    }
}

impl std::fmt::Debug for MappedSegment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MappedSegment")
            .field("file_path", &self.file_path)
            .field("start_offset", &self.start_offset)
            .field("capacity", &self.capacity)
            .field("wrote", &self.wrote())
            .field("flushed", &self.flushed())
            .field("committed", &self.committed())
            .finish()
    }
}
