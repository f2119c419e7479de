//! Rendezvous (HRW) placement
//!
//! For each partition every member gets a score `xxh64(partition_id,
//! member_id)`; members are ranked by descending score (ties broken by id)
//! and the top of the ranking becomes the primary owner, the next
//! `replica_count - 1` members the backup owners.

use kvmesh_common::{Member, PartitionId};

/// Desired owners of one partition
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Assignment {
    /// Primary owners, exactly one when any member is live
    pub primary: Vec<Member>,
    /// Backup owners, never containing the primary
    pub backups: Vec<Member>,
}

/// Deterministic partition placement
///
/// Implementations must return the same answer for the same partition and
/// member set regardless of the order members are given in.
pub trait Placement: Send + Sync {
    /// Rank `members` for a partition; the first entry is the primary owner
    fn rank(&self, part_id: PartitionId, members: &[Member]) -> Vec<Member>;

    /// Compute the desired owners of every partition
    fn assign(
        &self,
        partition_count: u64,
        members: &[Member],
        replica_count: usize,
    ) -> Vec<Assignment> {
        let backup_count = replica_count.saturating_sub(1);
        (0..partition_count)
            .map(|part_id| {
                let mut ranked = self.rank(part_id, members).into_iter();
                let primary: Vec<Member> = ranked.next().into_iter().collect();
                let backups = ranked.take(backup_count).collect();
                Assignment { primary, backups }
            })
            .collect()
    }
}

/// Highest random weight placement
#[derive(Clone, Copy, Debug, Default)]
pub struct HrwPlacement;

impl HrwPlacement {
    /// Create the placement function
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    fn score(part_id: PartitionId, member: &Member) -> u64 {
        xxhash_rust::xxh64::xxh64(&part_id.to_le_bytes(), member.id().as_u64())
    }
}

impl Placement for HrwPlacement {
    fn rank(&self, part_id: PartitionId, members: &[Member]) -> Vec<Member> {
        let mut scored: Vec<(u64, &Member)> = members
            .iter()
            .map(|m| (Self::score(part_id, m), m))
            .collect();

        // Sort by score descending, then by id for a total order
        scored.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(b.1)));
        scored.dedup_by(|a, b| a.1 == b.1);
        scored.into_iter().map(|(_, m)| m.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::seq::SliceRandom;
    use std::collections::HashMap;

    fn members(n: usize) -> Vec<Member> {
        (0..n).map(|i| Member::new(format!("10.0.0.{i}:3320"))).collect()
    }

    #[test]
    fn test_single_member_owns_everything() {
        let placement = HrwPlacement::new();
        let solo = members(1);
        let plan = placement.assign(7, &solo, 1);

        assert_eq!(plan.len(), 7);
        for a in &plan {
            assert_eq!(a.primary, solo);
            assert!(a.backups.is_empty());
        }
    }

    #[test]
    fn test_no_members_yields_empty_assignments() {
        let plan = HrwPlacement::new().assign(3, &[], 2);
        assert_eq!(plan, vec![Assignment::default(); 3]);
    }

    #[test]
    fn test_backups_exclude_primary() {
        let placement = HrwPlacement::new();
        let nodes = members(5);
        for a in placement.assign(271, &nodes, 3) {
            assert_eq!(a.primary.len(), 1);
            assert_eq!(a.backups.len(), 2);
            assert!(!a.backups.contains(&a.primary[0]));
            assert_ne!(a.backups[0], a.backups[1]);
        }
    }

    #[test]
    fn test_backups_bounded_by_members() {
        let plan = HrwPlacement::new().assign(16, &members(2), 4);
        for a in plan {
            assert_eq!(a.backups.len(), 1);
        }
    }

    #[test]
    fn test_independent_of_member_order() {
        let placement = HrwPlacement::new();
        let nodes = members(6);
        let expected = placement.assign(64, &nodes, 2);

        let mut rng = rand::thread_rng();
        for _ in 0..10 {
            let mut shuffled = nodes.clone();
            shuffled.shuffle(&mut rng);
            assert_eq!(placement.assign(64, &shuffled, 2), expected);
        }
    }

    #[test]
    fn test_distribution_and_minimal_remap() {
        let placement = HrwPlacement::new();
        let nodes = members(4);
        let before = placement.assign(271, &nodes, 1);

        let mut per_member: HashMap<Member, usize> = HashMap::new();
        for a in &before {
            *per_member.entry(a.primary[0].clone()).or_default() += 1;
        }
        assert_eq!(per_member.len(), 4);
        assert!(per_member.values().all(|&n| n > 30));

        // Removing one member only moves the partitions it owned
        let gone = nodes[0].clone();
        let after = placement.assign(271, &nodes[1..], 1);
        for (old, new) in before.iter().zip(&after) {
            if old.primary[0] != gone {
                assert_eq!(old.primary, new.primary);
            }
        }
    }
}
