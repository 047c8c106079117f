//! Segmented, memory-mapped log storage.
//!
//! A `ManagedFileStore` keeps two `SegmentList`s in lockstep: the data list holds
//! variable-size entry records, the index list holds one fixed-size unit per entry
//! at offset `index * unit_size`.
//!
//! # Module Structure
//!
//! - `entry`: Entry and index unit records and their codecs
//! - `segment`: A single mapped segment file
//! - `manager`: Ordered list of segments with roll, truncate, retention and recovery scan
//! - `store`: The managed file store gated by member role
//! - `flusher`: Periodic background flush

mod entry;
mod flusher;
mod manager;
mod segment;
mod store;

#[cfg(test)]
mod tests;

pub use entry::{
    BLANK_MAGIC_NUM, BoundaryPolicy, DataCodec, ENTRY_HEADER_SIZE, ENTRY_MAGIC_NUM,
    INDEX_UNIT_SIZE, INDEX_UNIT_VALID, IndexCodec, IndexUnit, LogEntry, MIN_BLANK_LEN,
    RecordCodec, RecordKind, RecordWidth,
};

pub use flusher::FlushService;

pub use manager::{
    DEFAULT_DATA_SEGMENT_SIZE, DEFAULT_INDEX_UNITS_PER_SEGMENT, SegmentList, SegmentListStats,
};

pub use segment::{MappedSegment, parse_segment_file_name, segment_file_name};

pub use store::{FileStoreOptions, ManagedFileStore};
