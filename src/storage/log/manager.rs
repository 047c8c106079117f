//! Segment list shared by the data and index logs.
//!
//! A `SegmentList` owns an ordered run of contiguous, equally sized mapped
//! segments and the record codec that gives their bytes a shape:
//! - Appends go to the tail segment, rolling to a new one when the record plus the
//!   codec's reserve no longer fits
//! - Reads resolve an absolute offset to its segment
//! - Flush, truncate and oldest-segment deletion keep the per-segment pointers in order
//! - A recovery scan walks records with the codec's `classify` to find the valid end

use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::error::{StoreError, StoreResult};

use super::{
    entry::{RecordCodec, RecordKind, RecordWidth},
    segment::{MappedSegment, parse_segment_file_name},
};

/// Default data segment size (64MB)
pub const DEFAULT_DATA_SEGMENT_SIZE: u64 = 64 * 1024 * 1024;

/// Default number of index units per index segment
pub const DEFAULT_INDEX_UNITS_PER_SEGMENT: u64 = 1024 * 1024;

pub struct SegmentList<C: RecordCodec> {
    dir: PathBuf,
    segment_size: u64,
    codec: C,
    segments: RwLock<Vec<Arc<MappedSegment>>>,
    /// Serializes append, truncate, delete and recovery.
    write_lock: Mutex<()>,
}

impl<C: RecordCodec> SegmentList<C> {
    /// Open the list stored in `dir`, mapping every segment file found there.
    ///
    /// Segment positions are zero until `recover_to` restores them.
    pub fn open(dir: impl Into<PathBuf>, segment_size: u64, codec: C) -> StoreResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| StoreError::io_at(&dir, e))?;

        if let RecordWidth::Fixed(width) = codec.width() {
            if width == 0 || segment_size % width as u64 != 0 {
                return Err(StoreError::Config(format!(
                    "segment size {} is not a multiple of record width {}",
                    segment_size, width
                )));
            }
        }
        let reserve = codec.boundary_policy().reserve() as u64;
        if segment_size <= reserve {
            return Err(StoreError::Config(format!(
                "segment size {} leaves no room past the {}B reserve",
                segment_size, reserve
            )));
        }

        let segments = Self::load_segments(&dir, segment_size)?;
        info!(
            "Opened segment list {:?}: {} segments of {}B",
            dir,
            segments.len(),
            segment_size
        );

        Ok(Self {
            dir,
            segment_size,
            codec,
            segments: RwLock::new(segments),
            write_lock: Mutex::new(()),
        })
    }

    fn load_segments(dir: &Path, segment_size: u64) -> StoreResult<Vec<Arc<MappedSegment>>> {
        let mut segment_files: Vec<(u64, PathBuf)> = Vec::new();

        for entry in fs::read_dir(dir).map_err(|e| StoreError::io_at(dir, e))? {
            let path = entry.map_err(|e| StoreError::io_at(dir, e))?.path();
            if !path.is_file() {
                continue;
            }
            match path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(parse_segment_file_name)
            {
                Some(start) => segment_files.push((start, path)),
                None => warn!("Ignoring unexpected file in segment dir: {:?}", path),
            }
        }

        segment_files.sort_by_key(|(start, _)| *start);

        let mut segments: Vec<Arc<MappedSegment>> = Vec::with_capacity(segment_files.len());
        for (start, path) in segment_files {
            if start % segment_size != 0 {
                return Err(StoreError::InconsistentState(format!(
                    "segment {:?} does not start on a {}B boundary",
                    path, segment_size
                )));
            }
            if let Some(prev) = segments.last() {
                if prev.end_offset() != start {
                    return Err(StoreError::InconsistentState(format!(
                        "gap between segment {} and {:?}",
                        prev.start_offset(),
                        path
                    )));
                }
            }
            segments.push(Arc::new(MappedSegment::open(path, start, segment_size)?));
        }

        Ok(segments)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn segment_size(&self) -> u64 {
        self.segment_size
    }

    pub fn codec(&self) -> &C {
        &self.codec
    }

    pub fn segment_count(&self) -> usize {
        self.segments.read().len()
    }

    /// Snapshot of the current segments, oldest first.
    pub fn segments(&self) -> Vec<Arc<MappedSegment>> {
        self.segments.read().clone()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.read().is_empty()
    }

    /// Start offset of the oldest segment, 0 for an empty list.
    pub fn min_offset(&self) -> u64 {
        self.segments
            .read()
            .first()
            .map_or(0, |s| s.start_offset())
    }

    pub fn max_wrote_position(&self) -> u64 {
        self.segments
            .read()
            .last()
            .map_or(0, |s| s.start_offset() + s.wrote())
    }

    pub fn committed_where(&self) -> u64 {
        self.segments
            .read()
            .last()
            .map_or(0, |s| s.start_offset() + s.committed())
    }

    /// Absolute offset below which every byte is durable.
    pub fn flushed_where(&self) -> u64 {
        let segments = self.segments.read();
        for segment in segments.iter() {
            if segment.flushed() < segment.wrote() {
                return segment.start_offset() + segment.flushed();
            }
        }
        segments
            .last()
            .map_or(0, |s| s.start_offset() + s.flushed())
    }

    fn find_segment(&self, offset: u64) -> Option<Arc<MappedSegment>> {
        let segments = self.segments.read();
        let first = segments.first()?;
        if offset < first.start_offset() {
            return None;
        }
        let idx = ((offset - first.start_offset()) / self.segment_size) as usize;
        segments.get(idx).cloned()
    }

    /// Append raw record bytes; returns the absolute offset of the record start.
    pub fn append(&self, data: &[u8]) -> StoreResult<u64> {
        let len = data.len() as u64;
        if let RecordWidth::Fixed(width) = self.codec.width() {
            if data.len() != width {
                return Err(StoreError::InconsistentState(format!(
                    "record of {} bytes in a list of {}B records",
                    data.len(),
                    width
                )));
            }
        }
        let policy = self.codec.boundary_policy();
        let max = self.segment_size - policy.reserve() as u64;
        if len == 0 || len > max {
            return Err(StoreError::RecordTooLarge { size: len, max });
        }

        let _guard = self.write_lock.lock();
        let tail = self.tail_for(len + policy.reserve() as u64)?;
        let pos = tail.write(data)?;
        Ok(tail.start_offset() + pos)
    }

    pub fn append_record(&self, record: &C::Record) -> StoreResult<u64> {
        let data = self.codec.encode(record)?;
        self.append(&data)
    }

    /// Tail segment with at least `need` bytes free, sealing and rolling if required.
    fn tail_for(&self, need: u64) -> StoreResult<Arc<MappedSegment>> {
        let tail = self.segments.read().last().cloned();
        let next_start = match tail {
            Some(tail) if tail.remaining() >= need => return Ok(tail),
            Some(tail) => {
                if !tail.is_full() {
                    let marker = self.codec.blank_marker(tail.remaining() as usize);
                    tail.seal(&marker);
                    debug!(
                        "Sealed segment {} with {}B filler",
                        tail.start_offset(),
                        marker.len()
                    );
                }
                tail.end_offset()
            }
            None => 0,
        };

        let segment = Arc::new(MappedSegment::create(
            &self.dir,
            next_start,
            self.segment_size,
        )?);
        self.segments.write().push(segment.clone());
        Ok(segment)
    }

    /// Read `size` bytes at absolute `offset`.
    pub fn read(&self, offset: u64, size: u64) -> StoreResult<Vec<u8>> {
        let segment = self
            .find_segment(offset)
            .ok_or_else(|| StoreError::OutOfRange {
                offset,
                size,
                limit: self.committed_where(),
            })?;
        segment.read(offset - segment.start_offset(), size)
    }

    pub fn read_record(&self, offset: u64, size: u64) -> StoreResult<C::Record> {
        let data = self.read(offset, size)?;
        self.codec.decode(offset, &data)
    }

    /// Persist every unflushed range, oldest segment first; returns bytes flushed.
    pub fn flush(&self) -> StoreResult<u64> {
        let mut flushed = 0;
        for segment in self.segments() {
            flushed += segment.flush()?;
        }
        if flushed > 0 {
            debug!("Flushed {}B in {:?}", flushed, self.dir);
        }
        Ok(flushed)
    }

    /// Drop everything at and after absolute `offset`.
    pub fn truncate_to(&self, offset: u64) -> StoreResult<()> {
        let _guard = self.write_lock.lock();
        self.truncate_locked(offset)
    }

    fn truncate_locked(&self, offset: u64) -> StoreResult<()> {
        let max_wrote = self.max_wrote_position();
        let min_offset = self.min_offset();
        if offset > max_wrote || offset < min_offset {
            return Err(StoreError::OutOfRange {
                offset,
                size: 0,
                limit: max_wrote,
            });
        }

        let mut segments = self.segments.write();
        let Some(keep) = segments
            .iter()
            .rposition(|s| s.start_offset() <= offset)
        else {
            // empty list truncated to 0
            return Ok(());
        };

        while segments.len() > keep + 1 {
            if let Some(segment) = segments.pop() {
                segment.destroy()?;
            }
        }

        let segment = &segments[keep];
        segment.truncate_to(offset - segment.start_offset())?;
        debug!("Truncated {:?} to {}", self.dir, offset);
        Ok(())
    }

    /// Delete up to `count` of the oldest segments, stopping at the first one that
    /// holds unflushed data. The tail segment is never deleted.
    pub fn delete_oldest_segments(&self, count: usize) -> StoreResult<usize> {
        let _guard = self.write_lock.lock();
        self.delete_front_while(count, |_| true)
    }

    /// Delete the oldest segments lying entirely below absolute `offset`.
    pub fn delete_segments_before(&self, offset: u64) -> StoreResult<usize> {
        let _guard = self.write_lock.lock();
        self.delete_front_while(usize::MAX, |s| s.end_offset() <= offset)
    }

    fn delete_front_while(
        &self,
        count: usize,
        pred: impl Fn(&MappedSegment) -> bool,
    ) -> StoreResult<usize> {
        let mut removed = 0;
        let mut segments = self.segments.write();
        while removed < count && segments.len() > 1 {
            let oldest = &segments[0];
            if !oldest.is_fully_flushed() || !pred(oldest.as_ref()) {
                break;
            }
            let segment = segments.remove(0);
            segment.destroy()?;
            removed += 1;
        }
        if removed > 0 {
            info!("Deleted {} oldest segments from {:?}", removed, self.dir);
        }
        Ok(removed)
    }

    /// Walk records from absolute `from` in order, calling `visit(offset, bytes)` for
    /// each. Returns the offset right after the last accepted record; the walk stops at
    /// the first position the codec does not recognise or when `visit` returns false.
    ///
    /// Positions are not consulted, so this also works on a freshly opened list.
    pub fn scan<F>(&self, from: u64, mut visit: F) -> StoreResult<u64>
    where
        F: FnMut(u64, &[u8]) -> StoreResult<bool>,
    {
        let mut offset = from;
        for segment in self.segments() {
            if segment.end_offset() <= offset {
                continue;
            }
            if segment.start_offset() > offset {
                break;
            }

            let start = segment.start_offset();
            let mut pos = (offset - start) as usize;
            let reached_end = segment.with_bytes(|bytes| -> StoreResult<bool> {
                while pos < bytes.len() {
                    match self.codec.classify(&bytes[pos..]) {
                        RecordKind::Record { len } => {
                            if !visit(start + pos as u64, &bytes[pos..pos + len])? {
                                return Ok(true);
                            }
                            pos += len;
                        }
                        RecordKind::Blank => {
                            pos = bytes.len();
                        }
                        RecordKind::End => return Ok(true),
                    }
                }
                Ok(false)
            })?;

            offset = start + pos as u64;
            if reached_end {
                break;
            }
        }
        Ok(offset)
    }

    /// Restore positions after a restart so that `end` is the new write position.
    /// Segments before `end` are treated as full, later ones are deleted.
    pub fn recover_to(&self, end: u64) -> StoreResult<()> {
        let _guard = self.write_lock.lock();
        let mut segments = self.segments.write();
        let keep = segments.iter().rposition(|s| s.start_offset() <= end);

        let keep_len = keep.map_or(0, |k| k + 1);
        while segments.len() > keep_len {
            if let Some(segment) = segments.pop() {
                warn!(
                    "Dropping segment {} past recovered end {}",
                    segment.start_offset(),
                    end
                );
                segment.destroy()?;
            }
        }

        if let Some(keep) = keep {
            for segment in &segments[..keep] {
                segment.restore_position(segment.capacity())?;
            }
            let last = &segments[keep];
            last.restore_position(end - last.start_offset())?;
        }
        Ok(())
    }

    /// Drop every segment and restart the list so that the next append lands at `offset`.
    pub fn reset_to(&self, offset: u64) -> StoreResult<()> {
        let _guard = self.write_lock.lock();
        let mut segments = self.segments.write();
        while let Some(segment) = segments.pop() {
            segment.destroy()?;
        }

        let start = offset - offset % self.segment_size;
        let segment = MappedSegment::create(&self.dir, start, self.segment_size)?;
        segment.restore_position(offset - start)?;
        segments.push(Arc::new(segment));
        warn!("Reset segment list {:?} to offset {}", self.dir, offset);
        Ok(())
    }

    pub fn stats(&self) -> SegmentListStats {
        let segments = self.segments.read();
        SegmentListStats {
            segment_count: segments.len(),
            segment_size: self.segment_size,
            min_offset: segments.first().map_or(0, |s| s.start_offset()),
            max_wrote_position: segments
                .last()
                .map_or(0, |s| s.start_offset() + s.wrote()),
            unflushed_bytes: segments.iter().map(|s| s.wrote() - s.flushed()).sum(),
        }
    }
}

/// Disk usage statistics of one segment list
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentListStats {
    pub segment_count: usize,
    pub segment_size: u64,
    pub min_offset: u64,
    pub max_wrote_position: u64,
    pub unflushed_bytes: u64,
}

impl SegmentListStats {
    pub fn disk_usage(&self) -> u64 {
        self.segment_count as u64 * self.segment_size
    }

    /// Format as human-readable string
    pub fn to_human_readable(&self) -> String {
        format!(
            "segments: {} x {}, disk: {}, range: [{}, {}), unflushed: {}",
            self.segment_count,
            Self::format_bytes(self.segment_size),
            Self::format_bytes(self.disk_usage()),
            self.min_offset,
            self.max_wrote_position,
            Self::format_bytes(self.unflushed_bytes),
        )
    }

    fn format_bytes(bytes: u64) -> String {
        const KB: u64 = 1024;
        const MB: u64 = KB * 1024;
        const GB: u64 = MB * 1024;

        if bytes >= GB {
            format!("{:.2}GB", bytes as f64 / GB as f64)
        } else if bytes >= MB {
            format!("{:.2}MB", bytes as f64 / MB as f64)
        } else if bytes >= KB {
            format!("{:.2}KB", bytes as f64 / KB as f64)
        } else {
            format!("{}B", bytes)
        }
    }
}
