//! Replicated-log file store.
//!
//! Entries are appended to memory-mapped segment files by the leader, replicated
//! to followers with the same index and term, and cut back with `truncate` when a
//! follower diverges from its leader. See [`ManagedFileStore`].

pub mod error;
pub mod member_state;
pub mod storage;

pub use error::{ErrorHandler, ErrorSeverity, StoreError, StoreResult};
pub use member_state::{MemberId, MemberState, Role, SharedMemberState};
pub use storage::{FileStoreOptions, FlushService, LogEntry, ManagedFileStore};
