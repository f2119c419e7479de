//! Balancer
//!
//! Reconciles the fragments this member holds with the latest routing
//! table. Runs on a timer and whenever a new routing table is installed.
//! Each cycle:
//! - moves fragments this member should not hold to their owners, then
//!   evicts them;
//! - copies primary fragments it owns to every backup owner that has not
//!   received the current generation yet;
//! - merges backup fragments into the primary copy once this member owns
//!   the primary partition.
//!
//! Every step is idempotent: resending data a target already holds is a
//! no-op thanks to the merge rules, and a fragment is only evicted when it
//! did not change since the export every target acknowledged.

use crate::fragment::{Fragment, FragmentKey};
use crate::service::DMapService;
use kvmesh_cluster::{RoutingSnapshot, RoutingTable};
use kvmesh_common::{Error, Member, MemberId, PartitionKind, Result};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Balancer counters
#[derive(Debug, Default)]
pub struct BalancerStats {
    cycles: AtomicU64,
    skipped: AtomicU64,
    moved: AtomicU64,
    replicated: AtomicU64,
    promoted: AtomicU64,
    evicted: AtomicU64,
    failed: AtomicU64,
}

impl BalancerStats {
    /// Cycles started
    pub fn cycles(&self) -> u64 {
        self.cycles.load(Ordering::Relaxed)
    }

    /// Cycles skipped because the node was not operable
    pub fn skipped(&self) -> u64 {
        self.skipped.load(Ordering::Relaxed)
    }

    /// Fragment moves acknowledged by their target
    pub fn moved(&self) -> u64 {
        self.moved.load(Ordering::Relaxed)
    }

    /// Primary fragments copied to a backup owner
    pub fn replicated(&self) -> u64 {
        self.replicated.load(Ordering::Relaxed)
    }

    /// Backup fragments merged into the local primary copy
    pub fn promoted(&self) -> u64 {
        self.promoted.load(Ordering::Relaxed)
    }

    /// Fragments dropped locally
    pub fn evicted(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }

    /// Transfers that failed
    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }
}

/// What a cycle does with one fragment
#[derive(Debug, PartialEq, Eq)]
enum Plan {
    /// In place, nothing to do
    Keep,
    /// Send to every target, then evict
    Move(Vec<Member>),
    /// Primary copy in place; keep these backup owners in sync
    Replicate(Vec<Member>),
    /// Backup held by the primary owner; merge it, then evict it unless
    /// this member is also a backup owner
    Promote { evict: bool },
    /// Backup with no backup owner left; hand it to the primary owner
    HandOff(Member),
}

/// Backup copies already delivered, per fragment and target
type Delivered = HashMap<(FragmentKey, MemberId), (Weak<Fragment>, u64)>;

/// Background ownership reconciliation
pub struct Balancer {
    dmap: Arc<DMapService>,
    interval: Duration,
    stats: Arc<BalancerStats>,
    delivered: Mutex<Delivered>,
    stop: CancellationToken,
}

impl Balancer {
    /// Create a balancer running every `interval`
    #[must_use]
    pub fn new(dmap: Arc<DMapService>, interval: Duration) -> Self {
        Self {
            dmap,
            interval,
            stats: Arc::new(BalancerStats::default()),
            delivered: Mutex::new(HashMap::new()),
            stop: CancellationToken::new(),
        }
    }

    /// Counters
    #[must_use]
    pub fn stats(&self) -> Arc<BalancerStats> {
        Arc::clone(&self.stats)
    }

    fn routing(&self) -> &RoutingTable {
        self.dmap.routing()
    }

    fn plan(snapshot: &RoutingSnapshot, this: &Member, key: &FragmentKey) -> Plan {
        let primary = snapshot.owners(key.part_id, PartitionKind::Primary).last();
        let backups = snapshot.owners(key.part_id, PartitionKind::Backup);
        let is_primary = primary.is_some_and(|owner| owner.compare_by_id(this));
        let is_backup = backups.iter().any(|owner| owner.compare_by_id(this));

        match key.kind {
            PartitionKind::Primary if is_primary => Plan::Replicate(
                backups
                    .iter()
                    .filter(|owner| !owner.compare_by_id(this))
                    .cloned()
                    .collect(),
            ),
            PartitionKind::Primary => {
                primary.map_or(Plan::Keep, |owner| Plan::Move(vec![owner.clone()]))
            }
            PartitionKind::Backup if is_primary => Plan::Promote { evict: !is_backup },
            PartitionKind::Backup if is_backup => Plan::Keep,
            PartitionKind::Backup if backups.is_empty() => {
                primary.map_or(Plan::Keep, |owner| Plan::HandOff(owner.clone()))
            }
            PartitionKind::Backup => Plan::Move(backups.to_vec()),
        }
    }

    /// Run one balancing cycle
    pub async fn run_once(&self) -> Result<()> {
        self.stats.cycles.fetch_add(1, Ordering::Relaxed);
        if let Err(e) = self.dmap.check_operable() {
            self.stats.skipped.fetch_add(1, Ordering::Relaxed);
            return Err(e);
        }

        let snapshot = self.routing().snapshot();
        let this = self.routing().this().clone();
        let mut in_sync = HashSet::new();
        for fragment in self.dmap.fragments().all() {
            let (length, generation) = {
                let state = fragment.lock();
                (state.length(), state.generation())
            };
            let plan = Self::plan(&snapshot, &this, fragment.key());
            if length == 0 {
                // Emptied by deletes; drop it unless this member owns it
                if !matches!(
                    plan,
                    Plan::Keep | Plan::Replicate(_) | Plan::Promote { evict: false }
                ) {
                    self.evict(&fragment, generation);
                }
                continue;
            }
            match plan {
                Plan::Keep => {}
                Plan::Move(targets) => self.move_fragment(&fragment, &targets).await,
                Plan::Replicate(targets) => {
                    for target in targets {
                        in_sync.insert((fragment.key().clone(), target.id()));
                        self.replicate(&fragment, &target, generation).await;
                    }
                }
                Plan::Promote { evict } => self.promote(&fragment, evict).await,
                Plan::HandOff(owner) => self.hand_off(&fragment, &owner).await,
            }
        }
        self.delivered
            .lock()
            .retain(|target, _| in_sync.contains(target));
        Ok(())
    }

    fn evict(&self, fragment: &Arc<Fragment>, generation: u64) -> bool {
        let evicted = self.dmap.fragments().evict_if_unchanged(fragment, generation);
        if evicted {
            self.stats.evicted.fetch_add(1, Ordering::Relaxed);
            info!("Evicted {}", fragment.key());
        } else {
            debug!("{} changed since generation {}, kept", fragment.key(), generation);
        }
        evicted
    }

    fn failed(&self, fragment: &Fragment, target: &Member, e: &Error) {
        self.stats.failed.fetch_add(1, Ordering::Relaxed);
        warn!("Failed to send {} to {}: {}", fragment.key(), target, e);
    }

    async fn move_fragment(&self, fragment: &Arc<Fragment>, targets: &[Member]) {
        let mut first_generation = None;
        let mut complete = true;
        for target in targets {
            match self.dmap.move_fragment(fragment, target).await {
                Ok(generation) => {
                    self.stats.moved.fetch_add(1, Ordering::Relaxed);
                    first_generation.get_or_insert(generation);
                }
                Err(e) => {
                    complete = false;
                    self.failed(fragment, target, &e);
                }
            }
        }

        if let Some(generation) = first_generation {
            if complete {
                self.evict(fragment, generation);
            }
        }
    }

    /// Copy a primary fragment to a backup owner unless the current
    /// generation already reached it
    async fn replicate(&self, fragment: &Arc<Fragment>, target: &Member, generation: u64) {
        let slot = (fragment.key().clone(), target.id());
        let up_to_date = self.delivered.lock().get(&slot).is_some_and(|(sent, at)| {
            *at == generation && sent.ptr_eq(&Arc::downgrade(fragment))
        });
        if up_to_date {
            return;
        }

        match self.dmap.send_as(fragment, target, PartitionKind::Backup).await {
            Ok(sent) => {
                self.stats.replicated.fetch_add(1, Ordering::Relaxed);
                self.delivered
                    .lock()
                    .insert(slot, (Arc::downgrade(fragment), sent));
            }
            Err(e) => self.failed(fragment, target, &e),
        }
    }

    async fn promote(&self, fragment: &Arc<Fragment>, evict: bool) {
        match self.dmap.promote_backup(fragment).await {
            Ok(generation) => {
                self.stats.promoted.fetch_add(1, Ordering::Relaxed);
                if evict {
                    self.evict(fragment, generation);
                }
            }
            Err(e) => {
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                warn!("Failed to promote {}: {}", fragment.key(), e);
            }
        }
    }

    async fn hand_off(&self, fragment: &Arc<Fragment>, owner: &Member) {
        match self.dmap.send_as(fragment, owner, PartitionKind::Primary).await {
            Ok(generation) => {
                self.stats.moved.fetch_add(1, Ordering::Relaxed);
                self.evict(fragment, generation);
            }
            Err(e) => self.failed(fragment, owner, &e),
        }
    }

    /// Balance on every tick and routing change until shutdown
    pub async fn run(self: Arc<Self>) {
        let mut changes = self.routing().subscribe();
        let mut ticker = tokio::time::interval(self.interval.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = self.stop.cancelled() => break,
                _ = ticker.tick() => {}
                changed = changes.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
            if let Err(e) = self.run_once().await {
                debug!("Balancer skipped a cycle: {}", e);
            }
        }
        debug!("Balancer stopped");
    }

    /// Stop the balancing loop
    pub fn shutdown(&self) -> Result<()> {
        if self.stop.is_cancelled() {
            return Err(Error::ServerGone);
        }
        self.stop.cancel();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::member;
    use kvmesh_cluster::LocalTransport;
    use kvmesh_common::Config;
    use kvmesh_placement::Assignment;
    use kvmesh_storage::Entry;

    const X: &str = "127.0.0.1:7001";
    const Y: &str = "127.0.0.1:7002";

    fn config() -> Config {
        let mut config = Config::default();
        config.cluster.partition_count = 1;
        config
    }

    /// Install the same routing table on every member: partition 0 primary
    /// on `primary`, backups on `backups`
    fn assign(members: &[&Arc<DMapService>], primary: &str, backups: &[&str], version: u64) {
        let all: Vec<Member> = members.iter().map(|m| m.routing().this().clone()).collect();
        let assignment = Assignment {
            primary: vec![Member::new(primary)],
            backups: backups.iter().map(|b| Member::new(*b)).collect(),
        };
        let snapshot =
            RoutingSnapshot::from_assignments(version, all[0].clone(), all, vec![assignment]);
        for m in members {
            m.routing().install(snapshot.clone());
        }
    }

    #[tokio::test]
    async fn test_not_operable_skips_cycle() {
        let transport = Arc::new(LocalTransport::new());
        let x = member(X, &config(), &transport);
        let balancer = Balancer::new(Arc::clone(&x), Duration::from_millis(10));

        assert!(matches!(balancer.run_once().await, Err(Error::NotBootstrapped)));
        assert_eq!(balancer.stats().skipped(), 1);
    }

    #[tokio::test]
    async fn test_primary_moves_to_new_owner() {
        let transport = Arc::new(LocalTransport::new());
        let x = member(X, &config(), &transport);
        let y = member(Y, &config(), &transport);

        assign(&[&x, &y], X, &[], 1);
        for i in 0..25 {
            x.put("m", PartitionKind::Primary, Entry::new(format!("k{i}"), vec![1]))
                .await
                .unwrap();
        }

        assign(&[&x, &y], Y, &[], 2);
        let balancer = Balancer::new(Arc::clone(&x), Duration::from_millis(10));
        balancer.run_once().await.unwrap();

        assert_eq!(balancer.stats().moved(), 1);
        assert_eq!(balancer.stats().evicted(), 1);
        assert!(x.fragments().is_empty());
        assert_eq!(y.length_of_partition(0, PartitionKind::Primary), 25);
        assert!(y.routing().partition(0, PartitionKind::Primary).is_owner(y.routing().this()));

        // Nothing left to move
        balancer.run_once().await.unwrap();
        assert_eq!(balancer.stats().moved(), 1);
    }

    #[tokio::test]
    async fn test_failed_move_keeps_fragment() {
        let transport = Arc::new(LocalTransport::new());
        let x = member(X, &config(), &transport);
        let y = member(Y, &config(), &transport);
        assign(&[&x, &y], Y, &[], 1);
        x.put("m", PartitionKind::Primary, Entry::new("k", Vec::new()))
            .await
            .unwrap();

        transport.unregister(Y);
        let balancer = Balancer::new(Arc::clone(&x), Duration::from_millis(10));
        balancer.run_once().await.unwrap();
        assert_eq!(balancer.stats().failed(), 1);
        assert_eq!(x.length_of_partition(0, PartitionKind::Primary), 1);

        // Retried on the next cycle once the target is back
        transport.register(Y, Arc::new(crate::test_util::ServiceHandler(Arc::clone(&y))));
        balancer.run_once().await.unwrap();
        assert_eq!(y.length_of_partition(0, PartitionKind::Primary), 1);
        assert!(x.fragments().is_empty());
    }

    #[tokio::test]
    async fn test_backup_moves_to_every_backup_owner() {
        const Z: &str = "127.0.0.1:7003";
        const W: &str = "127.0.0.1:7004";
        let transport = Arc::new(LocalTransport::new());
        let x = member(X, &config(), &transport);
        let y = member(Y, &config(), &transport);
        let z = member(Z, &config(), &transport);
        let w = member(W, &config(), &transport);
        let all = [&x, &y, &z, &w];

        assign(&all, Y, &[X], 1);
        x.put("m", PartitionKind::Backup, Entry::new("k", b"v".to_vec()))
            .await
            .unwrap();

        assign(&all, Y, &[Z, W], 2);
        let balancer = Balancer::new(Arc::clone(&x), Duration::from_millis(10));
        balancer.run_once().await.unwrap();

        assert_eq!(balancer.stats().moved(), 2);
        assert_eq!(z.length_of_partition(0, PartitionKind::Backup), 1);
        assert_eq!(w.length_of_partition(0, PartitionKind::Backup), 1);
        assert_eq!(x.length_of_partition(0, PartitionKind::Backup), 0);
        assert!(x.fragments().is_empty());
    }

    #[tokio::test]
    async fn test_primary_copied_to_new_backup_owner() {
        let transport = Arc::new(LocalTransport::new());
        let x = member(X, &config(), &transport);
        let y = member(Y, &config(), &transport);
        assign(&[&x, &y], X, &[], 1);
        for i in 0..10 {
            x.put("m", PartitionKind::Primary, Entry::new(format!("k{i}"), vec![1]))
                .await
                .unwrap();
        }

        assign(&[&x, &y], X, &[Y], 2);
        let balancer = Balancer::new(Arc::clone(&x), Duration::from_millis(10));
        balancer.run_once().await.unwrap();
        assert_eq!(balancer.stats().replicated(), 1);
        assert_eq!(y.length_of_partition(0, PartitionKind::Backup), 10);
        assert_eq!(x.length_of_partition(0, PartitionKind::Primary), 10);

        // Unchanged since the last copy
        balancer.run_once().await.unwrap();
        assert_eq!(balancer.stats().replicated(), 1);

        x.put("m", PartitionKind::Primary, Entry::new("k10", vec![1]))
            .await
            .unwrap();
        balancer.run_once().await.unwrap();
        assert_eq!(balancer.stats().replicated(), 2);
        assert_eq!(y.length_of_partition(0, PartitionKind::Backup), 11);
        assert_eq!(balancer.stats().evicted(), 0);
    }

    #[tokio::test]
    async fn test_backup_promoted_when_primary_owner() {
        let transport = Arc::new(LocalTransport::new());
        let x = member(X, &config(), &transport);
        let y = member(Y, &config(), &transport);
        assign(&[&x, &y], Y, &[X], 1);
        for i in 0..10 {
            x.put(
                "m",
                PartitionKind::Backup,
                Entry::with_version(format!("k{i}"), b"old".to_vec(), 10, 0),
            )
            .await
            .unwrap();
        }

        // Y is gone and X took over
        transport.unregister(Y);
        assign(&[&x], X, &[], 2);
        x.put(
            "m",
            PartitionKind::Primary,
            Entry::with_version("k0", b"new".to_vec(), 20, 0),
        )
        .await
        .unwrap();

        let balancer = Balancer::new(Arc::clone(&x), Duration::from_millis(10));
        balancer.run_once().await.unwrap();

        assert_eq!(balancer.stats().promoted(), 1);
        assert_eq!(balancer.stats().evicted(), 1);
        assert_eq!(x.length_of_partition(0, PartitionKind::Primary), 10);
        assert_eq!(x.length_of_partition(0, PartitionKind::Backup), 0);
        assert_eq!(x.get("m", PartitionKind::Primary, "k0").await.unwrap().value, b"new");
        assert_eq!(x.get("m", PartitionKind::Primary, "k9").await.unwrap().value, b"old");
        assert_eq!(y.length_of_partition(0, PartitionKind::Primary), 0);
    }

    #[tokio::test]
    async fn test_orphaned_backup_handed_to_primary_owner() {
        let transport = Arc::new(LocalTransport::new());
        let x = member(X, &config(), &transport);
        let y = member(Y, &config(), &transport);
        assign(&[&x, &y], Y, &[X], 1);
        x.put("m", PartitionKind::Backup, Entry::new("k", b"v".to_vec()))
            .await
            .unwrap();

        assign(&[&x, &y], Y, &[], 2);
        let balancer = Balancer::new(Arc::clone(&x), Duration::from_millis(10));
        balancer.run_once().await.unwrap();

        assert_eq!(y.length_of_partition(0, PartitionKind::Primary), 1);
        assert!(x.fragments().is_empty());
    }

    #[tokio::test]
    async fn test_empty_fragment_evicted_on_non_owner() {
        let transport = Arc::new(LocalTransport::new());
        let x = member(X, &config(), &transport);
        let y = member(Y, &config(), &transport);
        assign(&[&x, &y], X, &[], 1);
        x.put("m", PartitionKind::Primary, Entry::new("k", Vec::new()))
            .await
            .unwrap();
        x.delete("m", PartitionKind::Primary, "k").await.unwrap();

        // Owned: kept even though empty
        let balancer = Balancer::new(Arc::clone(&x), Duration::from_millis(10));
        balancer.run_once().await.unwrap();
        assert_eq!(x.fragments().len(), 1);

        assign(&[&x, &y], Y, &[], 2);
        balancer.run_once().await.unwrap();
        assert_eq!(balancer.stats().evicted(), 1);
        assert_eq!(balancer.stats().moved(), 0);
        assert!(x.fragments().is_empty());
        assert!(y.fragments().is_empty());
    }

    #[test]
    fn test_plan() {
        let x = Member::new(X);
        let y = Member::new(Y);
        let snapshot = RoutingSnapshot::from_assignments(
            1,
            x.clone(),
            vec![x.clone(), y.clone()],
            vec![Assignment {
                primary: vec![x.clone()],
                backups: vec![y.clone()],
            }],
        );
        let primary = FragmentKey::new(0, PartitionKind::Primary, "m");
        let backup = FragmentKey::new(0, PartitionKind::Backup, "m");

        assert_eq!(Balancer::plan(&snapshot, &x, &primary), Plan::Replicate(vec![y.clone()]));
        assert_eq!(Balancer::plan(&snapshot, &y, &primary), Plan::Move(vec![x.clone()]));
        assert_eq!(Balancer::plan(&snapshot, &y, &backup), Plan::Keep);
        assert_eq!(Balancer::plan(&snapshot, &x, &backup), Plan::Promote { evict: true });
    }

    #[tokio::test]
    async fn test_run_loop_reacts_to_routing_change() {
        let transport = Arc::new(LocalTransport::new());
        let x = member(X, &config(), &transport);
        let y = member(Y, &config(), &transport);
        assign(&[&x, &y], X, &[], 1);
        x.put("m", PartitionKind::Primary, Entry::new("k", Vec::new()))
            .await
            .unwrap();

        let balancer = Arc::new(Balancer::new(Arc::clone(&x), Duration::from_secs(3600)));
        let handle = tokio::spawn(Arc::clone(&balancer).run());

        assign(&[&x, &y], Y, &[], 2);
        for _ in 0..200 {
            if y.length_of_partition(0, PartitionKind::Primary) == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(y.length_of_partition(0, PartitionKind::Primary), 1);

        balancer.shutdown().unwrap();
        handle.await.unwrap();
        assert!(matches!(balancer.shutdown(), Err(Error::ServerGone)));
    }
}
