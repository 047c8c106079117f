pub mod log;

pub use log::{FileStoreOptions, FlushService, LogEntry, ManagedFileStore};
