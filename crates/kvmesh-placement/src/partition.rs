//! Partition tables
//!
//! One table per [`PartitionKind`]. Each partition carries its own owner list
//! behind its own lock, so lookups on different partitions never contend.
//! Owner lists are replaced wholesale; readers get an `Arc` to the list that
//! was current when they asked.

use kvmesh_common::{Member, PartitionId, PartitionKind};
use parking_lot::RwLock;
use std::sync::Arc;

/// A single partition and its current owners
#[derive(Debug)]
pub struct Partition {
    id: PartitionId,
    kind: PartitionKind,
    owners: RwLock<Arc<[Member]>>,
}

impl Partition {
    fn new(id: PartitionId, kind: PartitionKind) -> Self {
        Self {
            id,
            kind,
            owners: RwLock::new(Arc::from(Vec::new())),
        }
    }

    /// Partition id
    #[must_use]
    pub const fn id(&self) -> PartitionId {
        self.id
    }

    /// Partition kind
    #[must_use]
    pub const fn kind(&self) -> PartitionKind {
        self.kind
    }

    /// Current owner list
    #[must_use]
    pub fn owners(&self) -> Arc<[Member]> {
        Arc::clone(&self.owners.read())
    }

    /// Responsible owner.
    ///
    /// For primaries the most recent (last) owner, for backups the first
    /// replica in the list.
    #[must_use]
    pub fn owner(&self) -> Option<Member> {
        let owners = self.owners.read();
        match self.kind {
            PartitionKind::Primary => owners.last().cloned(),
            PartitionKind::Backup => owners.first().cloned(),
        }
    }

    /// Check whether `member` is one of this partition's owners
    #[must_use]
    pub fn is_owner(&self, member: &Member) -> bool {
        self.owners.read().iter().any(|m| m.compare_by_id(member))
    }

    fn set_owners(&self, owners: Vec<Member>) {
        *self.owners.write() = Arc::from(owners);
    }
}

/// All partitions of one kind
#[derive(Debug)]
pub struct PartitionTable {
    kind: PartitionKind,
    partitions: Vec<Arc<Partition>>,
}

impl PartitionTable {
    /// Create `count` partitions without owners (at least one)
    #[must_use]
    pub fn new(count: u64, kind: PartitionKind) -> Self {
        Self {
            kind,
            partitions: (0..count.max(1)).map(|id| Arc::new(Partition::new(id, kind))).collect(),
        }
    }

    /// Kind of every partition in this table
    #[must_use]
    pub const fn kind(&self) -> PartitionKind {
        self.kind
    }

    /// Number of partitions
    #[must_use]
    pub fn count(&self) -> u64 {
        self.partitions.len() as u64
    }

    /// Look up a partition; ids wrap modulo the partition count
    #[must_use]
    pub fn partition_by_id(&self, id: PartitionId) -> Arc<Partition> {
        let idx = usize::try_from(id % self.count()).unwrap_or(0);
        Arc::clone(&self.partitions[idx])
    }

    /// Replace the owner list of a partition.
    ///
    /// Called by the routing table while installing a new snapshot.
    pub fn set_ownership(&self, id: PartitionId, owners: Vec<Member>) {
        self.partition_by_id(id).set_owners(owners);
    }

    /// Iterate over all partitions in id order
    pub fn iter(&self) -> impl Iterator<Item = &Arc<Partition>> {
        self.partitions.iter()
    }
}
