use std::{
    path::PathBuf,
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::{
    error::{ErrorHandler, ErrorSeverity, StoreError, StoreResult},
    member_state::{MemberId, MemberState, SharedMemberState},
};

use super::{
    entry::{
        DataCodec, ENTRY_HEADER_SIZE, INDEX_UNIT_SIZE, IndexCodec, IndexUnit, LogEntry,
        MIN_BLANK_LEN, RecordCodec,
    },
    manager::{DEFAULT_DATA_SEGMENT_SIZE, DEFAULT_INDEX_UNITS_PER_SEGMENT, SegmentList},
};

const DATA_DIR: &str = "data";
const INDEX_DIR: &str = "index";

/// Configuration options for the managed file store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileStoreOptions {
    /// Store root; `data/` and `index/` are created below it
    pub base_dir: PathBuf,
    /// Capacity of each data segment file in bytes
    pub data_segment_size: u64,
    /// Capacity of each index segment file in bytes, a multiple of `index_unit_size`
    pub index_segment_size: u64,
    /// Width of one index unit (at least 32 bytes)
    pub index_unit_size: usize,
    /// Space always kept free at the end of a data segment for the blank filler
    pub min_blank_len: usize,
    /// Period of the background flush
    pub flush_interval: Duration,
    /// Id of the local member
    pub self_id: MemberId,
}

impl Default for FileStoreOptions {
    fn default() -> Self {
        Self {
            base_dir: PathBuf::from("./data/ledger"),
            data_segment_size: DEFAULT_DATA_SEGMENT_SIZE,
            index_segment_size: DEFAULT_INDEX_UNITS_PER_SEGMENT * INDEX_UNIT_SIZE as u64,
            index_unit_size: INDEX_UNIT_SIZE,
            min_blank_len: MIN_BLANK_LEN,
            flush_interval: Duration::from_millis(10),
            self_id: "n0".to_string(),
        }
    }
}

impl FileStoreOptions {
    /// Create options with a custom base directory.
    pub fn with_base_dir<P: Into<PathBuf>>(base_dir: P) -> Self {
        Self {
            base_dir: base_dir.into(),
            ..Default::default()
        }
    }

    pub fn with_data_segment_size(mut self, size: u64) -> Self {
        self.data_segment_size = size;
        self
    }

    pub fn with_index_segment_size(mut self, size: u64) -> Self {
        self.index_segment_size = size;
        self
    }

    pub fn with_flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self
    }

    pub fn with_self_id(mut self, self_id: impl Into<MemberId>) -> Self {
        self.self_id = self_id.into();
        self
    }

    pub fn data_dir(&self) -> PathBuf {
        self.base_dir.join(DATA_DIR)
    }

    pub fn index_dir(&self) -> PathBuf {
        self.base_dir.join(INDEX_DIR)
    }

    pub fn validate(&self) -> StoreResult<()> {
        if self.index_unit_size < INDEX_UNIT_SIZE {
            return Err(StoreError::Config(format!(
                "index unit size {} is below {}",
                self.index_unit_size, INDEX_UNIT_SIZE
            )));
        }
        if self.index_segment_size == 0
            || self.index_segment_size % self.index_unit_size as u64 != 0
        {
            return Err(StoreError::Config(format!(
                "index segment size {} is not a positive multiple of {}",
                self.index_segment_size, self.index_unit_size
            )));
        }
        if self.min_blank_len < MIN_BLANK_LEN {
            return Err(StoreError::Config(format!(
                "min blank length {} is below {}",
                self.min_blank_len, MIN_BLANK_LEN
            )));
        }
        if self.data_segment_size > u32::MAX as u64 {
            return Err(StoreError::Config(format!(
                "data segment size {} exceeds the 32-bit record size field",
                self.data_segment_size
            )));
        }
        if self.data_segment_size <= (self.min_blank_len + ENTRY_HEADER_SIZE) as u64 {
            return Err(StoreError::Config(format!(
                "data segment size {} cannot hold a single entry",
                self.data_segment_size
            )));
        }
        if self.flush_interval.is_zero() {
            return Err(StoreError::Config("flush interval must be positive".into()));
        }
        Ok(())
    }
}

/// Index range held by the store; empty when `first_index == next_index`.
#[derive(Debug, Clone, Copy, Default)]
struct LedgerBounds {
    first_index: u64,
    next_index: u64,
    last_term: u64,
}

/// Data and index segment lists kept in lockstep.
///
/// The index unit of entry `i` sits at byte offset `i * index_unit_size` of the index
/// list and points at the entry's record in the data list.
pub struct ManagedFileStore {
    options: FileStoreOptions,
    member_state: SharedMemberState,
    data_list: SegmentList<DataCodec>,
    index_list: SegmentList<IndexCodec>,
    ledger: RwLock<LedgerBounds>,
    /// Held by append, truncate, flush, retention and recovery.
    write_lock: Mutex<()>,
    fenced: AtomicBool,
}

impl ManagedFileStore {
    /// Open (or create) the store under `options.base_dir` and recover its state.
    pub fn open(options: FileStoreOptions, member_state: SharedMemberState) -> StoreResult<Self> {
        options.validate()?;

        let data_list = SegmentList::open(
            options.data_dir(),
            options.data_segment_size,
            DataCodec::new(options.min_blank_len),
        )?;
        let index_list = SegmentList::open(
            options.index_dir(),
            options.index_segment_size,
            IndexCodec::new(options.index_unit_size),
        )?;

        let store = Self {
            options,
            member_state,
            data_list,
            index_list,
            ledger: RwLock::new(LedgerBounds::default()),
            write_lock: Mutex::new(()),
            fenced: AtomicBool::new(false),
        };
        store.recover()?;
        Ok(store)
    }

    pub fn options(&self) -> &FileStoreOptions {
        &self.options
    }

    pub fn member_state(&self) -> &SharedMemberState {
        &self.member_state
    }

    pub fn data_list(&self) -> &SegmentList<DataCodec> {
        &self.data_list
    }

    pub fn index_list(&self) -> &SegmentList<IndexCodec> {
        &self.index_list
    }

    pub fn first_index(&self) -> u64 {
        self.ledger.read().first_index
    }

    /// Index of the last stored entry, `None` when the store is empty.
    pub fn last_index(&self) -> Option<u64> {
        let ledger = self.ledger.read();
        (ledger.next_index > ledger.first_index).then(|| ledger.next_index - 1)
    }

    pub fn last_term(&self) -> u64 {
        self.ledger.read().last_term
    }

    pub fn is_fenced(&self) -> bool {
        self.fenced.load(Ordering::Acquire)
    }

    fn unit_size(&self) -> u64 {
        self.options.index_unit_size as u64
    }

    fn unit_offset(&self, index: u64) -> StoreResult<u64> {
        index.checked_mul(self.unit_size()).ok_or_else(|| {
            StoreError::InconsistentState(format!("index {} has no addressable index unit", index))
        })
    }

    fn check_writable(&self) -> StoreResult<()> {
        if self.is_fenced() {
            return Err(StoreError::Fenced);
        }
        Ok(())
    }

    /// Put the store in read-only mode when a write path hits a fatal error.
    fn fence_on_fatal<T>(&self, operation: &str, result: StoreResult<T>) -> StoreResult<T> {
        if let Err(e) = &result {
            if e.severity() == ErrorSeverity::Fatal && !self.fenced.swap(true, Ordering::AcqRel) {
                error!(
                    "[FATAL] {} on {:?} failed: {} - entering readonly mode",
                    operation,
                    self.options.base_dir,
                    e.context()
                );
            }
        }
        result
    }

    /// Append a new entry stamped with the next index and the leader's term.
    pub fn append_as_leader(&self, entry: LogEntry) -> StoreResult<LogEntry> {
        let _guard = self.write_lock.lock();
        self.check_writable()?;

        let term = self.member_state.read().require_leader("append_as_leader")?;
        let mut entry = entry;
        entry.index = self.ledger.read().next_index;
        entry.term = term;

        let result = self.append_entry(entry);
        self.fence_on_fatal("append_as_leader", result)
    }

    /// Append an entry replicated from `leader_id`; its index must extend the log by one.
    pub fn append_as_follower(
        &self,
        entry: LogEntry,
        term: u64,
        leader_id: &str,
    ) -> StoreResult<LogEntry> {
        let _guard = self.write_lock.lock();
        self.check_writable()?;

        self.member_state
            .read()
            .require_follower_of("append_as_follower", term, leader_id)?;

        let ledger = *self.ledger.read();
        if entry.index != ledger.next_index {
            return Err(StoreError::InconsistentState(format!(
                "follower append at index {} but next index is {}",
                entry.index, ledger.next_index
            )));
        }
        if entry.term > term {
            return Err(StoreError::InconsistentState(format!(
                "entry {} has term {} beyond leader term {}",
                entry.index, entry.term, term
            )));
        }
        if ledger.next_index > ledger.first_index && entry.term < ledger.last_term {
            return Err(StoreError::InconsistentState(format!(
                "entry {} has term {} below last term {}",
                entry.index, entry.term, ledger.last_term
            )));
        }

        let result = self.append_entry(entry);
        self.fence_on_fatal("append_as_follower", result)
    }

    /// Write data record then index unit; on index failure the data record is rolled back.
    fn append_entry(&self, mut entry: LogEntry) -> StoreResult<LogEntry> {
        let data = self.data_list.codec().encode(&entry)?;
        let data_before = self.data_list.max_wrote_position();

        entry.pos = self.data_list.append(&data)?;
        entry.size = data.len() as u32;

        if let Err(e) = self.append_index_unit(&entry) {
            warn!(
                "Index write for entry {} failed, rolling back data to {}: {}",
                entry.index, data_before, e
            );
            self.data_list.truncate_to(data_before)?;
            return Err(e);
        }

        let mut ledger = self.ledger.write();
        ledger.next_index = entry.index + 1;
        ledger.last_term = entry.term;
        Ok(entry)
    }

    fn append_index_unit(&self, entry: &LogEntry) -> StoreResult<()> {
        let expected = self.unit_offset(entry.index)?;
        let actual = self.index_list.append_record(&IndexUnit::for_entry(entry))?;
        if actual != expected {
            self.index_list.truncate_to(actual)?;
            return Err(StoreError::Sequence { expected, actual });
        }
        Ok(())
    }

    /// Read the entry at `index`.
    pub fn get(&self, index: u64) -> StoreResult<LogEntry> {
        let ledger = *self.ledger.read();
        if index < ledger.first_index || index >= ledger.next_index {
            return Err(StoreError::NotFound(index));
        }
        self.read_entry(index).map_err(|e| match e {
            // removed by a concurrent truncate or retention
            StoreError::OutOfRange { .. } => StoreError::NotFound(index),
            other => other,
        })
    }

    /// Entries in `[low, high)`, clamped to the stored range.
    pub fn get_range(&self, low: u64, high: u64) -> StoreResult<Vec<LogEntry>> {
        let ledger = *self.ledger.read();
        let low = low.max(ledger.first_index);
        let high = high.min(ledger.next_index);
        (low..high).map(|index| self.get(index)).collect()
    }

    fn read_unit(&self, index: u64) -> StoreResult<IndexUnit> {
        let offset = self.unit_offset(index)?;
        let unit = self.index_list.read_record(offset, self.unit_size())?;
        if !unit.is_valid() || unit.entry_index != index {
            return Err(StoreError::corrupt(
                offset,
                format!(
                    "index unit for {} holds index {} (flags {:#x})",
                    index, unit.entry_index, unit.flags
                ),
            ));
        }
        Ok(unit)
    }

    fn read_entry(&self, index: u64) -> StoreResult<LogEntry> {
        let unit = self.read_unit(index)?;
        let entry = self
            .data_list
            .read_record(unit.data_offset, unit.entry_size as u64)?;
        if entry.index != index || entry.term != unit.entry_term {
            return Err(StoreError::corrupt(
                unit.data_offset,
                format!(
                    "record holds {}@{} but index unit expects {}@{}",
                    entry.index, entry.term, index, unit.entry_term
                ),
            ));
        }
        Ok(entry)
    }

    /// Flush data first, then index, so a durable index unit never points at
    /// non-durable data. Returns the highest index whose unit is durable.
    pub fn flush(&self) -> StoreResult<Option<u64>> {
        let _guard = self.write_lock.lock();
        let result = self.flush_locked();
        self.fence_on_fatal("flush", result)
    }

    fn flush_locked(&self) -> StoreResult<Option<u64>> {
        let data_bytes = self.data_list.flush()?;
        let index_bytes = self.index_list.flush()?;
        let durable = self.durable_index();
        if data_bytes + index_bytes > 0 {
            debug!(
                "Flushed data={}B index={}B, durable index {:?}",
                data_bytes, index_bytes, durable
            );
        }
        Ok(durable)
    }

    /// Highest index whose index unit (and so its data) is durable.
    pub fn durable_index(&self) -> Option<u64> {
        let ledger = *self.ledger.read();
        let durable_units = self.index_list.flushed_where() / self.unit_size();
        let end = durable_units.min(ledger.next_index);
        (end > ledger.first_index).then(|| end - 1)
    }

    /// Cut the log back so that `entry` becomes its tail, as requested by `leader_id`.
    ///
    /// When the local copy of `entry.index` matches, its data record is kept and only
    /// the index unit is rewritten; otherwise the local record is replaced. Either way
    /// the index list's flushed position ends one unit behind its write position.
    pub fn truncate(&self, entry: LogEntry, term: u64, leader_id: &str) -> StoreResult<u64> {
        let _guard = self.write_lock.lock();
        self.check_writable()?;

        // held until the role transition so the term cannot move under the cut
        let mut member_state = self.member_state.write();
        member_state.require_follower("truncate", term)?;

        let ledger = *self.ledger.read();
        if ledger.next_index == ledger.first_index || entry.index >= ledger.next_index {
            return Err(StoreError::InconsistentState(format!(
                "truncate to {} beyond the log end, next index is {}",
                entry.index, ledger.next_index
            )));
        }
        if entry.index < ledger.first_index {
            return Err(StoreError::NotFound(entry.index));
        }
        if entry.term > term {
            return Err(StoreError::InconsistentState(format!(
                "truncate entry {} has term {} beyond leader term {}",
                entry.index, entry.term, term
            )));
        }

        let result = self.truncate_locked(&mut member_state, &ledger, entry, term, leader_id);
        self.fence_on_fatal("truncate", result)
    }

    fn truncate_locked(
        &self,
        member_state: &mut MemberState,
        ledger: &LedgerBounds,
        entry: LogEntry,
        term: u64,
        leader_id: &str,
    ) -> StoreResult<u64> {
        let index = entry.index;
        if index > ledger.first_index {
            let prev = self.read_unit(index - 1)?;
            if entry.term < prev.entry_term {
                return Err(StoreError::InconsistentState(format!(
                    "truncate entry {} has term {} below term {} of entry {}",
                    index,
                    entry.term,
                    prev.entry_term,
                    index - 1
                )));
            }
        }

        let unit = self.read_unit(index)?;
        let local = self.read_entry(index)?;
        let unit_offset = self.unit_offset(index)?;

        let mut new_tail = entry;
        if local.same_payload(&new_tail) {
            self.data_list
                .truncate_to(unit.data_offset + unit.entry_size as u64)?;
            new_tail.pos = local.pos;
            new_tail.size = local.size;
        } else {
            warn!(
                "Local entry {}@{} conflicts with {}@{} from {}, replacing it",
                index, local.term, index, new_tail.term, leader_id
            );
            self.data_list.truncate_to(unit.data_offset)?;
            let data = self.data_list.codec().encode(&new_tail)?;
            new_tail.pos = self.data_list.append(&data)?;
            new_tail.size = data.len() as u32;
        }

        // the boundary unit is rewritten even when unchanged, so it is flushed again
        self.index_list.truncate_to(unit_offset)?;
        self.append_index_unit(&new_tail)?;

        member_state.change_to_follower(term, leader_id)?;
        {
            let mut ledger = self.ledger.write();
            ledger.next_index = index + 1;
            ledger.last_term = new_tail.term;
        }

        info!(
            "Truncated log to index {} (term {}) for leader {} at term {}",
            index, new_tail.term, leader_id, term
        );
        Ok(index)
    }

    /// Retention interface: delete up to `count` of the oldest fully flushed data
    /// segments and the index segments that only describe entries before the new
    /// first index. Returns the number of data segments deleted.
    pub fn delete_oldest_segments(&self, count: usize) -> StoreResult<usize> {
        let _guard = self.write_lock.lock();
        let result = self.delete_oldest_locked(count);
        self.fence_on_fatal("delete_oldest_segments", result)
    }

    fn delete_oldest_locked(&self, count: usize) -> StoreResult<usize> {
        let removed = self.data_list.delete_oldest_segments(count)?;
        if removed == 0 {
            return Ok(0);
        }

        let next_index = self.ledger.read().next_index;
        let first_index = self.peek_first_index()?.unwrap_or(next_index);
        let removed_units = self
            .index_list
            .delete_segments_before(self.unit_offset(first_index)?)?;

        self.ledger.write().first_index = first_index;
        info!(
            "Retention removed {} data and {} index segments, first index now {}",
            removed, removed_units, first_index
        );
        Ok(removed)
    }

    /// Index of the first record in the data list, read straight from the mapped bytes.
    /// `None` when the list holds no record; a record that fails to decode is an error.
    fn peek_first_index(&self) -> StoreResult<Option<u64>> {
        let codec = *self.data_list.codec();
        let mut first = None;
        self.data_list
            .scan(self.data_list.min_offset(), |offset, bytes| {
                first = Some(codec.decode(offset, bytes)?.index);
                Ok(false)
            })?;
        Ok(first)
    }

    /// Rebuild positions and ledger bounds from the segment files.
    ///
    /// The data list is authoritative: index units are checked against the data
    /// records and rebuilt from them where missing or stale. A successful recovery
    /// lifts the write fence.
    pub fn recover(&self) -> StoreResult<()> {
        let _guard = self.write_lock.lock();

        let unit_size = self.unit_size();
        let first_index = match self.peek_first_index() {
            Ok(first) => first,
            // a torn first write in a store that has never rolled or retained
            Err(e @ StoreError::CorruptRecord { .. })
                if self.data_list.min_offset() == 0 && self.data_list.segment_count() <= 1 =>
            {
                warn!("First data record is torn, treating the store as empty: {}", e);
                None
            }
            Err(e) => return Err(e),
        };
        let Some(first_index) = first_index else {
            let start = self.index_list.min_offset();
            self.index_list.recover_to(start)?;
            self.data_list.recover_to(self.data_list.min_offset())?;
            let next_index = start / unit_size;
            *self.ledger.write() = LedgerBounds {
                first_index: next_index,
                next_index,
                last_term: 0,
            };
            self.flush_locked()?;
            self.fenced.store(false, Ordering::Release);
            info!("Recovered empty store at {:?}", self.options.base_dir);
            return Ok(());
        };

        // units below the first data record are not needed
        let first_unit = self.unit_offset(first_index)?;
        let index_usable =
            !self.index_list.is_empty() && self.index_list.min_offset() <= first_unit;
        let mut index_end = first_unit;
        if index_usable {
            let index_codec = *self.index_list.codec();
            index_end = self.index_list.scan(first_unit, |offset, bytes| {
                let unit = index_codec.decode(offset, bytes)?;
                Ok(offset % unit_size == 0 && unit.entry_index == offset / unit_size)
            })?;
            self.index_list.recover_to(index_end)?;
        }
        if !index_usable || self.index_list.max_wrote_position() != index_end {
            warn!(
                "Index list cannot resolve first index {}, rebuilding it from data",
                first_index
            );
            self.index_list.reset_to(first_unit)?;
            index_end = first_unit;
        }

        let data_codec = *self.data_list.codec();
        let mut next_index = first_index;
        let mut last_term = 0;
        let mut mismatch_at: Option<u64> = None;
        let mut rebuilt: Vec<IndexUnit> = Vec::new();

        let data_end = self
            .data_list
            .scan(self.data_list.min_offset(), |offset, bytes| {
                let entry = match data_codec.decode(offset, bytes) {
                    Ok(entry) => entry,
                    Err(e) => {
                        warn!("Stopping data recovery at {}: {}", offset, e);
                        return Ok(false);
                    }
                };
                if entry.index != next_index {
                    warn!(
                        "Stopping data recovery at {}: found index {}, expected {}",
                        offset, entry.index, next_index
                    );
                    return Ok(false);
                }
                if entry.term < last_term {
                    warn!(
                        "Stopping data recovery at {}: term {} after term {}",
                        offset, entry.term, last_term
                    );
                    return Ok(false);
                }

                let unit = IndexUnit::for_entry(&entry);
                let unit_offset = self.unit_offset(entry.index)?;
                if mismatch_at.is_none() && unit_offset + unit_size <= index_end {
                    let stored = self.index_list.read_record(unit_offset, unit_size)?;
                    if stored != unit {
                        warn!(
                            "Index unit {} disagrees with data record at {}",
                            entry.index, offset
                        );
                        mismatch_at = Some(unit_offset);
                        rebuilt.push(unit);
                    }
                } else {
                    mismatch_at.get_or_insert(unit_offset);
                    rebuilt.push(unit);
                }

                next_index = entry.index + 1;
                last_term = entry.term;
                Ok(true)
            })?;
        self.data_list.recover_to(data_end)?;

        let valid_index_end = match mismatch_at {
            Some(offset) => offset,
            None => self.unit_offset(next_index)?,
        };
        if valid_index_end < self.index_list.max_wrote_position() {
            self.index_list.truncate_to(valid_index_end)?;
        }
        if !rebuilt.is_empty() {
            info!(
                "Rebuilding {} index units from index {}",
                rebuilt.len(),
                rebuilt[0].entry_index
            );
        }
        for unit in &rebuilt {
            let expected = self.unit_offset(unit.entry_index)?;
            let actual = self.index_list.append_record(unit)?;
            if actual != expected {
                return Err(StoreError::Sequence { expected, actual });
            }
        }

        *self.ledger.write() = LedgerBounds {
            first_index,
            next_index,
            last_term,
        };
        self.flush_locked()?;
        self.fenced.store(false, Ordering::Release);

        info!(
            "Recovered store at {:?}: entries [{}, {}), last term {}, data end {}, index end {}",
            self.options.base_dir,
            first_index,
            next_index,
            last_term,
            data_end,
            self.index_list.max_wrote_position()
        );
        Ok(())
    }

    /// Final flush before the store is dropped.
    pub fn shutdown(&self) -> StoreResult<()> {
        let durable = self.flush()?;
        info!(
            "Store at {:?} shut down, durable index {:?}",
            self.options.base_dir, durable
        );
        Ok(())
    }
}
