//! kvmesh Storage - local storage engine
//!
//! This crate defines the contract every local storage engine fulfils
//! ([`StorageEngine`]) and ships the default in-memory engine
//! ([`KvStore`]):
//! - Put/Get/Delete keyed by the 64-bit key hash
//! - Cursor based scans and full range iteration
//! - Export/Import of opaque, versioned snapshots
//! - Table based growth with a fragmentation signal and incremental compaction

pub mod engine;
pub mod entry;
pub mod error;
pub mod kvstore;

pub use engine::{EngineDescriptor, Stats, StorageEngine};
pub use entry::Entry;
pub use error::StorageError;
pub use kvstore::{KvStore, KvStoreConfig};
