//! Durable storage: atomic file replacement and the record metadata store.

pub mod fsops;
pub mod metadata;

pub use fsops::{RetryPolicy, commit_staged, stage_bytes, write_atomically};
pub use metadata::{METADATA_FILE_NAME, MetadataSnapshot, MetadataStore, StoredRecord};

/// Current UTC time as seconds since the Unix epoch.
pub fn get_utc_timestamp() -> u64 {
    chrono::Utc::now().timestamp() as u64
}
