#![allow(dead_code)]

use std::path::Path;

use mmap_ledger::storage::log::INDEX_UNIT_SIZE;
use mmap_ledger::{FileStoreOptions, LogEntry, ManagedFileStore, MemberState, SharedMemberState};

/// 512B data segments hold three 100B-body entries each; index segments hold four units.
pub const SMALL_DATA_SEGMENT: u64 = 512;
pub const SMALL_INDEX_SEGMENT: u64 = 4 * INDEX_UNIT_SIZE as u64;
pub const BODY_LEN: usize = 100;

pub fn small_options(base_dir: &Path) -> FileStoreOptions {
    FileStoreOptions::with_base_dir(base_dir)
        .with_data_segment_size(SMALL_DATA_SEGMENT)
        .with_index_segment_size(SMALL_INDEX_SEGMENT)
}

pub fn body(i: u64) -> Vec<u8> {
    vec![i as u8; BODY_LEN]
}

pub fn open_as_leader(options: FileStoreOptions, term: u64) -> (ManagedFileStore, SharedMemberState) {
    let member_state = MemberState::new(options.self_id.clone()).into_shared();
    member_state.write().change_to_leader(term).unwrap();
    let store = ManagedFileStore::open(options, member_state.clone()).unwrap();
    (store, member_state)
}

pub fn append_n(store: &ManagedFileStore, n: u64) -> Vec<LogEntry> {
    let start = store.last_index().map_or(store.first_index(), |last| last + 1);
    (start..start + n)
        .map(|i| store.append_as_leader(LogEntry::new(body(i))).unwrap())
        .collect()
}
