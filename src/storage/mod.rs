//! Storage module for block store persistence

pub mod persistence;

pub use persistence::{ReplayReport, Storage, StorageError, UtxoSnapshot, BLOCKS_FILE, SNAPSHOT_FILE};
