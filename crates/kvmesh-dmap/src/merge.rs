//! Version selection for merges
//!
//! When a transferred fragment meets local data, every key present on both
//! sides is resolved by a [`VersionComparator`]. The comparator must define a
//! total order so the outcome does not depend on which side sent the data.

use kvmesh_storage::Entry;
use std::cmp::Ordering;

/// Picks the winning version of a key
pub trait VersionComparator: Send + Sync {
    /// Order two versions of the same key; `Greater` means `a` wins
    fn compare(&self, a: &Entry, b: &Entry) -> Ordering;

    /// Check whether `incoming` must replace `current`.
    ///
    /// Equal versions keep the current entry, so merging identical data
    /// writes nothing.
    fn replaces(&self, current: &Entry, incoming: &Entry) -> bool {
        self.compare(incoming, current) == Ordering::Greater
    }
}

/// Last write wins
///
/// Orders by `timestamp`, then by value bytes, then by `ttl`. Entries equal
/// on all three are identical for every observable purpose.
#[derive(Clone, Copy, Debug, Default)]
pub struct LastWriteWins;

impl VersionComparator for LastWriteWins {
    fn compare(&self, a: &Entry, b: &Entry) -> Ordering {
        a.timestamp
            .cmp(&b.timestamp)
            .then_with(|| a.value.cmp(&b.value))
            .then_with(|| a.ttl.cmp(&b.ttl))
    }
}
