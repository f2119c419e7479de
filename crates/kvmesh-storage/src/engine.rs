//! Storage engine contract
//!
//! Fragments only talk to their engine through this trait. Engines are not
//! internally synchronized: the owning fragment serializes access with its
//! own lock.

use crate::entry::Entry;
use crate::error::StorageError;
use std::fmt;

/// Name and snapshot format version of an engine
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EngineDescriptor {
    pub name: &'static str,
    pub version: u32,
}

impl EngineDescriptor {
    /// Check whether a snapshot tagged `(name, version)` can be imported
    #[must_use]
    pub fn accepts(&self, name: &str, version: u32) -> bool {
        self.name == name && self.version == version
    }
}

impl fmt::Display for EngineDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} v{}", self.name, self.version)
    }
}

/// Engine statistics
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Stats {
    /// Number of live keys
    pub length: usize,
    /// Number of tables backing the engine
    pub num_tables: usize,
    /// Entry slots allocated across tables
    pub allocated: usize,
    /// Approximate bytes held by live entries
    pub inuse: usize,
    /// Deletions and overwrites since the last compaction
    pub garbage: usize,
}

/// Contract of a local single-node storage engine
pub trait StorageEngine: Send {
    /// Engine name and snapshot format
    fn descriptor(&self) -> EngineDescriptor;

    /// New empty engine with the same configuration
    fn fresh(&self) -> Box<dyn StorageEngine>;

    /// Insert or replace an entry.
    ///
    /// Returns [`StorageError::Fragmented`] after a successful write when the
    /// engine wants compaction.
    fn put(&mut self, hkey: u64, entry: Entry) -> Result<(), StorageError>;

    /// Fetch an entry
    fn get(&self, hkey: u64) -> Result<Entry, StorageError>;

    /// Delete an entry; deleting a missing key is not an error
    fn delete(&mut self, hkey: u64) -> Result<(), StorageError>;

    /// Visit every entry until `f` returns false
    fn range(&self, f: &mut dyn FnMut(u64, &Entry) -> bool);

    /// Visit up to `count` entries starting at `cursor`.
    ///
    /// Returns the cursor for the next call, 0 when the scan is complete.
    fn scan(
        &self,
        cursor: u64,
        count: usize,
        f: &mut dyn FnMut(&Entry) -> bool,
    ) -> Result<u64, StorageError>;

    /// Serialize the whole engine into an opaque snapshot
    fn export(&self) -> Result<Vec<u8>, StorageError>;

    /// Build a new, independent engine from a snapshot
    fn import(&self, data: &[u8]) -> Result<Box<dyn StorageEngine>, StorageError>;

    /// Current statistics
    fn stats(&self) -> Stats;

    /// Run one compaction step; returns true once the engine is compact
    fn compaction(&mut self) -> Result<bool, StorageError>;
}
