//! Core type definitions for kvmesh
//!
//! Identifiers for cluster members and partitions, plus the key hashing
//! used to map keys onto partitions.

use derive_more::{Display, From, Into};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

/// Partition identifier in `[0, partition_count)`
pub type PartitionId = u64;

/// Hash a key into the 64-bit key space (`hkey`)
#[must_use]
pub fn hash_key(key: &str) -> u64 {
    xxhash_rust::xxh64::xxh64(key.as_bytes(), 0)
}

/// Map a key hash onto its partition
#[must_use]
pub const fn partition_of(hkey: u64, partition_count: u64) -> PartitionId {
    hkey % partition_count
}

/// Stable numeric identifier of a member
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, From, Into,
    Display,
)]
#[display("{_0:016x}")]
pub struct MemberId(u64);

impl MemberId {
    /// Derive the identifier from a member name (`host:port`)
    #[must_use]
    pub fn from_name(name: &str) -> Self {
        Self(xxhash_rust::xxh64::xxh64(name.as_bytes(), 0))
    }

    /// Get the raw value
    #[must_use]
    pub const fn as_u64(&self) -> u64 {
        self.0
    }
}

/// Identity of a cluster node
///
/// Two members are equal when their ids are equal; the name is the
/// `host:port` form used on the wire and in routing snapshots.
#[derive(Clone, Serialize, Deserialize)]
pub struct Member {
    id: MemberId,
    name: String,
}

impl Member {
    /// Create a member from its `host:port` name
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            id: MemberId::from_name(&name),
            name,
        }
    }

    /// Stable identifier
    #[must_use]
    pub const fn id(&self) -> MemberId {
        self.id
    }

    /// `host:port` name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Compare two members by their stable identifier
    #[must_use]
    pub fn compare_by_id(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl PartialEq for Member {
    fn eq(&self, other: &Self) -> bool {
        self.compare_by_id(other)
    }
}

impl Eq for Member {}

impl Hash for Member {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl PartialOrd for Member {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Member {
    fn cmp(&self, other: &Self) -> Ordering {
        self.id.cmp(&other.id)
    }
}

impl fmt::Debug for Member {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Member({}, {})", self.name, self.id)
    }
}

impl fmt::Display for Member {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Kind of partition: the authoritative copy or a replica
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PartitionKind {
    /// Authoritative copy
    Primary,
    /// Replicated copy held on `replica_count - 1` additional members
    Backup,
}

impl PartitionKind {
    /// Both kinds, primary first
    pub const ALL: [Self; 2] = [Self::Primary, Self::Backup];
}

impl fmt::Display for PartitionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Primary => f.write_str("PRIMARY"),
            Self::Backup => f.write_str("BACKUP"),
        }
    }
}

/// One row of the externally visible routing table
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    /// Primary owners in `host:port` form
    pub primary_owners: Vec<String>,
    /// Replica owners in `host:port` form
    pub replica_owners: Vec<String>,
}

/// Externally visible routing table, indexed by partition id
pub type RoutingTableView = Vec<Route>;
