//! Routing table
//!
//! The routing table is the node's view of who owns which partition. The
//! coordinator (the live member with the smallest id) computes placement on
//! every membership change, bumps the version and broadcasts the result on
//! every tick. Everyone else adopts a broadcast view only when its version is
//! strictly greater than the one they hold.
//!
//! Membership uses the static peer list: every tick each member is probed,
//! either with the routing broadcast (coordinator) or a ping. A peer that
//! answers joins; a member that fails `member_failure_threshold` probes in a
//! row is removed.

use crate::transport::Transport;
use kvmesh_common::config::ClusterConfig;
use kvmesh_common::{
    Error, Member, MemberId, PartitionId, PartitionKind, Result, Route, RoutingTableView,
    partition_of,
};
use kvmesh_placement::{Assignment, Partition, PartitionTable, Placement};
use kvmesh_proto::{
    Operation, RouteEntry, RoutingTableResponse, RoutingUpdate, RoutingUpdateAck, SystemMessage,
    decode_message,
};
use parking_lot::{Mutex, RwLock};
use prost::Message;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Immutable, versioned ownership view of every partition
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RoutingSnapshot {
    version: u64,
    coordinator: Option<Member>,
    members: Vec<Member>,
    primary: Vec<Vec<Member>>,
    backup: Vec<Vec<Member>>,
}

impl RoutingSnapshot {
    /// Version 0 view with no owners
    #[must_use]
    pub fn empty(partition_count: u64) -> Self {
        let count = usize::try_from(partition_count).unwrap_or(0);
        Self {
            version: 0,
            coordinator: None,
            members: Vec::new(),
            primary: vec![Vec::new(); count],
            backup: vec![Vec::new(); count],
        }
    }

    /// Build a view from computed placement
    #[must_use]
    pub fn from_assignments(
        version: u64,
        coordinator: Member,
        members: Vec<Member>,
        assignments: Vec<Assignment>,
    ) -> Self {
        let (primary, backup): (Vec<_>, Vec<_>) = assignments
            .into_iter()
            .map(|a| (a.primary, a.backups))
            .unzip();
        Self {
            version,
            coordinator: Some(coordinator),
            members,
            primary,
            backup,
        }
    }

    /// Rebuild a view from a broadcast, checking it covers every partition
    pub fn from_update(update: &RoutingUpdate, partition_count: u64) -> Result<Self> {
        if update.routes.len() as u64 != partition_count {
            return Err(Error::invalid_argument(format!(
                "routing update has {} partitions, expected {partition_count}",
                update.routes.len()
            )));
        }
        let to_members = |names: &[String]| names.iter().map(Member::new).collect::<Vec<_>>();
        Ok(Self {
            version: update.version,
            coordinator: (!update.coordinator.is_empty()).then(|| Member::new(&update.coordinator)),
            members: to_members(&update.members),
            primary: update.routes.iter().map(|r| to_members(&r.primary_owners)).collect(),
            backup: update.routes.iter().map(|r| to_members(&r.replica_owners)).collect(),
        })
    }

    /// Encode as a broadcast
    #[must_use]
    pub fn to_update(&self) -> RoutingUpdate {
        RoutingUpdate {
            version: self.version,
            coordinator: self
                .coordinator
                .as_ref()
                .map(|m| m.name().to_string())
                .unwrap_or_default(),
            members: self.members.iter().map(|m| m.name().to_string()).collect(),
            routes: self.routes().iter().map(RouteEntry::from).collect(),
        }
    }

    /// Snapshot version
    #[must_use]
    pub const fn version(&self) -> u64 {
        self.version
    }

    /// Member that computed this view
    #[must_use]
    pub const fn coordinator(&self) -> Option<&Member> {
        self.coordinator.as_ref()
    }

    /// Members the view was computed for
    #[must_use]
    pub fn members(&self) -> &[Member] {
        &self.members
    }

    /// Number of partitions covered
    #[must_use]
    pub fn partition_count(&self) -> usize {
        self.primary.len()
    }

    /// Desired owners of a partition
    #[must_use]
    pub fn owners(&self, part_id: PartitionId, kind: PartitionKind) -> &[Member] {
        let table = match kind {
            PartitionKind::Primary => &self.primary,
            PartitionKind::Backup => &self.backup,
        };
        usize::try_from(part_id)
            .ok()
            .and_then(|idx| table.get(idx))
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// External view: `host:port` owner names per partition
    #[must_use]
    pub fn routes(&self) -> RoutingTableView {
        let names = |owners: &[Member]| -> Vec<String> {
            owners.iter().map(|m| m.name().to_string()).collect()
        };
        self.primary
            .iter()
            .zip(&self.backup)
            .map(|(primary, backup)| Route {
                primary_owners: names(primary),
                replica_owners: names(backup),
            })
            .collect()
    }
}

/// Partition ownership and membership of one node
pub struct RoutingTable {
    this: Member,
    config: ClusterConfig,
    placement: Arc<dyn Placement>,
    transport: Arc<dyn Transport>,
    primary: PartitionTable,
    backup: PartitionTable,
    snapshot: RwLock<Arc<RoutingSnapshot>>,
    members: RwLock<BTreeMap<MemberId, Member>>,
    failures: Mutex<HashMap<MemberId, u32>>,
    /// Serializes placement and adoption so versions only move forward
    update_lock: Mutex<()>,
    /// Highest version a peer reported while rejecting our broadcast
    version_floor: AtomicU64,
    bootstrapped: AtomicBool,
    changes: watch::Sender<u64>,
    stop: CancellationToken,
}

impl RoutingTable {
    /// Create a routing table for `this` with no owners installed yet
    #[must_use]
    pub fn new(
        this: Member,
        config: ClusterConfig,
        placement: Arc<dyn Placement>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let count = config.partition_count;
        let mut members = BTreeMap::new();
        members.insert(this.id(), this.clone());
        let (changes, _) = watch::channel(0);
        Self {
            this,
            placement,
            transport,
            primary: PartitionTable::new(count, PartitionKind::Primary),
            backup: PartitionTable::new(count, PartitionKind::Backup),
            snapshot: RwLock::new(Arc::new(RoutingSnapshot::empty(count))),
            members: RwLock::new(members),
            failures: Mutex::new(HashMap::new()),
            update_lock: Mutex::new(()),
            version_floor: AtomicU64::new(0),
            bootstrapped: AtomicBool::new(false),
            changes,
            stop: CancellationToken::new(),
            config,
        }
    }

    /// The local member
    #[must_use]
    pub const fn this(&self) -> &Member {
        &self.this
    }

    /// Number of partitions
    #[must_use]
    pub const fn partition_count(&self) -> u64 {
        self.config.partition_count
    }

    /// Partition that holds a key hash
    #[must_use]
    pub const fn partition_id(&self, hkey: u64) -> PartitionId {
        partition_of(hkey, self.config.partition_count)
    }

    /// Partition table of one kind
    #[must_use]
    pub const fn partitions(&self, kind: PartitionKind) -> &PartitionTable {
        match kind {
            PartitionKind::Primary => &self.primary,
            PartitionKind::Backup => &self.backup,
        }
    }

    /// Look up a partition
    #[must_use]
    pub fn partition(&self, part_id: PartitionId, kind: PartitionKind) -> Arc<Partition> {
        self.partitions(kind).partition_by_id(part_id)
    }

    /// Fail with [`Error::ClusterQuorum`] while too few members are live
    pub fn check_member_count_quorum(&self) -> Result<()> {
        if self.members.read().len() < self.config.member_count_quorum {
            return Err(Error::ClusterQuorum);
        }
        Ok(())
    }

    /// Fail with [`Error::NotBootstrapped`] until a routing table is installed
    pub fn check_bootstrap(&self) -> Result<()> {
        if !self.is_bootstrapped() {
            return Err(Error::NotBootstrapped);
        }
        Ok(())
    }

    /// Check whether a routing table has been installed
    #[must_use]
    pub fn is_bootstrapped(&self) -> bool {
        self.bootstrapped.load(Ordering::Acquire)
    }

    /// Current view
    #[must_use]
    pub fn snapshot(&self) -> Arc<RoutingSnapshot> {
        Arc::clone(&self.snapshot.read())
    }

    /// Current version
    #[must_use]
    pub fn version(&self) -> u64 {
        self.snapshot.read().version()
    }

    /// External view of the current snapshot
    #[must_use]
    pub fn routes(&self) -> RoutingTableView {
        self.snapshot().routes()
    }

    /// Encoded `cluster.routingtable` response
    #[must_use]
    pub fn routing_table_response(&self) -> RoutingTableResponse {
        let snapshot = self.snapshot();
        RoutingTableResponse {
            version: snapshot.version(),
            routes: snapshot.routes().iter().map(RouteEntry::from).collect(),
        }
    }

    /// Live members, ordered by id
    #[must_use]
    pub fn members(&self) -> Vec<Member> {
        self.members.read().values().cloned().collect()
    }

    /// Check whether `member` is currently live
    #[must_use]
    pub fn is_member(&self, member: &Member) -> bool {
        self.members.read().contains_key(&member.id())
    }

    /// Live member with the smallest id
    #[must_use]
    pub fn coordinator(&self) -> Member {
        self.members
            .read()
            .values()
            .next()
            .cloned()
            .unwrap_or_else(|| self.this.clone())
    }

    /// Check whether this node is the coordinator
    #[must_use]
    pub fn is_coordinator(&self) -> bool {
        self.coordinator().compare_by_id(&self.this)
    }

    /// Receive the version of every newly installed snapshot
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.changes.subscribe()
    }

    /// Install a snapshot, replacing every partition's owner list
    pub fn install(&self, snapshot: RoutingSnapshot) {
        let _guard = self.update_lock.lock();
        self.install_locked(snapshot);
    }

    fn install_locked(&self, snapshot: RoutingSnapshot) {
        let version = snapshot.version();
        for part in 0..self.partition_count() {
            self.primary
                .set_ownership(part, snapshot.owners(part, PartitionKind::Primary).to_vec());
            self.backup
                .set_ownership(part, snapshot.owners(part, PartitionKind::Backup).to_vec());
        }
        *self.snapshot.write() = Arc::new(snapshot);
        self.bootstrapped.store(true, Ordering::Release);
        self.changes.send_replace(version);
        info!("Installed routing table version {}", version);
    }

    /// Recompute placement and install it if this node is the coordinator
    ///
    /// Returns true when a new version was installed.
    pub fn update_placement(&self) -> bool {
        let _guard = self.update_lock.lock();
        self.update_placement_locked()
    }

    fn update_placement_locked(&self) -> bool {
        if !self.is_coordinator() {
            return false;
        }
        let members = self.members();
        let assignments = self.placement.assign(
            self.partition_count(),
            &members,
            self.config.replica_count,
        );
        let version = self
            .version()
            .max(self.version_floor.load(Ordering::Acquire))
            + 1;
        self.install_locked(RoutingSnapshot::from_assignments(
            version,
            self.this.clone(),
            members,
            assignments,
        ));
        true
    }

    /// Add a live member; returns true if it was not known
    pub fn add_member(&self, member: Member) -> bool {
        if member.compare_by_id(&self.this) {
            return false;
        }
        self.failures.lock().remove(&member.id());
        let added = self
            .members
            .write()
            .insert(member.id(), member.clone())
            .is_none();
        if added {
            info!("Member joined: {}", member);
            self.update_placement();
        }
        added
    }

    /// Remove a member; returns true if it was known
    pub fn remove_member(&self, member: &Member) -> bool {
        if member.compare_by_id(&self.this) {
            return false;
        }
        self.failures.lock().remove(&member.id());
        let removed = self.members.write().remove(&member.id()).is_some();
        if removed {
            warn!("Member left: {}", member);
            self.update_placement();
        }
        removed
    }

    /// Process a routing broadcast from the coordinator
    ///
    /// The view is adopted only if its version is strictly greater than the
    /// local one; the acknowledgement tells the sender which happened.
    pub fn adopt(&self, update: &RoutingUpdate) -> Result<RoutingUpdateAck> {
        let _guard = self.update_lock.lock();
        let current = self.version();
        if update.version <= current {
            // A re-sent copy of the installed view is acknowledged as is
            let same = update.version == current
                && RoutingSnapshot::from_update(update, self.partition_count())
                    .is_ok_and(|view| view == *self.snapshot());
            if !same {
                debug!(
                    "Ignoring routing table version {} from {}, holding {}",
                    update.version, update.coordinator, current
                );
            }
            return Ok(self.ack(current, same));
        }

        let snapshot = RoutingSnapshot::from_update(update, self.partition_count())?;
        {
            let mut members = self.members.write();
            members.clear();
            for member in snapshot.members() {
                members.insert(member.id(), member.clone());
            }
            members.insert(self.this.id(), self.this.clone());
        }
        self.install_locked(snapshot);

        // The sender did not know about a member with a smaller id than its own
        if self.is_coordinator() && update.coordinator != self.this.name() {
            self.update_placement_locked();
        }
        Ok(self.ack(self.version(), true))
    }

    fn ack(&self, version: u64, accepted: bool) -> RoutingUpdateAck {
        RoutingUpdateAck {
            member: self.this.name().to_string(),
            version,
            accepted,
        }
    }

    /// Serve an `internal.updaterouting` payload
    pub fn handle_update(&self, payload: &[u8]) -> Result<Vec<u8>> {
        let update: RoutingUpdate = decode_message(payload)?;
        Ok(self.adopt(&update)?.encode_to_vec())
    }

    /// Serve a `ping` payload carrying the sender's name
    pub fn handle_ping(&self, payload: &[u8]) -> Result<Vec<u8>> {
        if !payload.is_empty() {
            let name = std::str::from_utf8(payload)
                .map_err(|e| Error::invalid_argument(format!("invalid member name: {e}")))?;
            self.add_member(Member::new(name));
        }
        Ok(self.this.name().as_bytes().to_vec())
    }

    /// Establish the first routing table
    ///
    /// Probes the configured peers once; if this node is then the
    /// coordinator it computes placement itself. A node without peers ends
    /// up standalone, owning every primary partition.
    pub async fn bootstrap(&self) {
        self.heartbeat().await;
        if self.is_coordinator() && !self.is_bootstrapped() {
            self.update_placement();
        }
    }

    /// One probe round over every peer and member
    pub async fn heartbeat(&self) {
        let mut targets: BTreeMap<MemberId, Member> = self.members.read().clone();
        for peer in &self.config.peers {
            let member = Member::new(peer);
            targets.entry(member.id()).or_insert(member);
        }
        targets.remove(&self.this.id());
        if targets.is_empty() {
            return;
        }

        let probes = targets.values().map(|target| async move {
            let result = if self.is_coordinator() && self.is_member(target) {
                self.push_routing(target).await
            } else {
                self.ping(target).await
            };
            (target, result)
        });
        for (target, result) in futures::future::join_all(probes).await {
            match result {
                Ok(()) => self.record_success(target),
                Err(e) => self.record_failure(target, &e),
            }
        }
    }

    async fn ping(&self, target: &Member) -> Result<()> {
        let message = SystemMessage::new(Operation::Ping, self.this.name().as_bytes().to_vec());
        self.transport.request(target, message).await.map(|_| ())
    }

    async fn push_routing(&self, target: &Member) -> Result<()> {
        let snapshot = self.snapshot();
        let message = SystemMessage::new(
            Operation::UpdateRouting,
            snapshot.to_update().encode_to_vec(),
        );
        let response = self.transport.request(target, message).await?;
        let ack: RoutingUpdateAck = decode_message(&response)?;
        if !ack.accepted && ack.version >= snapshot.version() {
            // The peer holds a view we cannot override; outbid it
            debug!(
                "{} rejected routing table version {}, holding {}",
                ack.member,
                snapshot.version(),
                ack.version
            );
            self.version_floor.fetch_max(ack.version, Ordering::AcqRel);
            self.update_placement();
        }
        Ok(())
    }

    fn record_success(&self, target: &Member) {
        self.failures.lock().remove(&target.id());
        if !self.is_member(target) {
            self.add_member(target.clone());
        }
    }

    fn record_failure(&self, target: &Member, err: &Error) {
        let failures = {
            let mut failures = self.failures.lock();
            let count = failures.entry(target.id()).or_insert(0);
            *count += 1;
            *count
        };
        debug!("Probe to {} failed ({} in a row): {}", target, failures, err);
        if failures >= self.config.member_failure_threshold && self.is_member(target) {
            warn!("Removing {} after {} failed probes", target, failures);
            self.remove_member(target);
        }
    }

    /// Probe peers and broadcast the routing table until shutdown
    pub async fn run(self: Arc<Self>) {
        let period = self
            .config
            .routing_push_interval()
            .max(Duration::from_millis(1));
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = self.stop.cancelled() => break,
                _ = ticker.tick() => self.heartbeat().await,
            }
        }
        debug!("Routing broadcaster stopped");
    }

    /// Stop the broadcast loop
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
    use crate::transport::{LocalTransport, MessageHandler};
    use async_trait::async_trait;
    use kvmesh_placement::HrwPlacement;

    struct RoutingHandler(Arc<RoutingTable>);

    #[async_trait]
    impl MessageHandler for RoutingHandler {
        async fn handle(&self, message: SystemMessage) -> Result<Vec<u8>> {
            match message.operation()? {
                Operation::Ping => self.0.handle_ping(&message.value),
                Operation::UpdateRouting => self.0.handle_update(&message.value),
                op => Err(Error::NotImplemented(op.to_string())),
            }
        }
    }

    fn config(partition_count: u64, peers: &[&str]) -> ClusterConfig {
        ClusterConfig {
            partition_count,
            replica_count: 2,
            peers: peers.iter().map(ToString::to_string).collect(),
            member_failure_threshold: 2,
            ..ClusterConfig::default()
        }
    }

    fn table(name: &str, config: ClusterConfig, transport: &Arc<LocalTransport>) -> Arc<RoutingTable> {
        let rt = Arc::new(RoutingTable::new(
            Member::new(name),
            config,
            Arc::new(HrwPlacement::new()),
            Arc::clone(transport) as Arc<dyn Transport>,
        ));
        transport.register(name, Arc::new(RoutingHandler(Arc::clone(&rt))));
        rt
    }

    #[tokio::test]
    async fn test_standalone_bootstrap() {
        let transport = Arc::new(LocalTransport::new());
        let rt = table("127.0.0.1:3320", config(7, &[]), &transport);

        assert!(matches!(rt.check_bootstrap(), Err(Error::NotBootstrapped)));
        assert_eq!(rt.routes().len(), 7);

        rt.bootstrap().await;
        rt.check_bootstrap().unwrap();
        rt.check_member_count_quorum().unwrap();

        let routes = rt.routes();
        assert_eq!(routes.len(), 7);
        for route in &routes {
            assert_eq!(route.primary_owners, vec!["127.0.0.1:3320".to_string()]);
            assert!(route.replica_owners.is_empty());
        }
        assert!(rt.partition(3, PartitionKind::Primary).is_owner(rt.this()));
        assert!(!rt.partition(3, PartitionKind::Backup).is_owner(rt.this()));
    }

    #[test]
    fn test_quorum_check() {
        let transport = Arc::new(LocalTransport::new());
        let config = ClusterConfig {
            member_count_quorum: 2,
            ..config(7, &[])
        };
        let rt = table("127.0.0.1:3320", config, &transport);
        assert!(matches!(rt.check_member_count_quorum(), Err(Error::ClusterQuorum)));

        rt.add_member(Member::new("127.0.0.1:3321"));
        rt.check_member_count_quorum().unwrap();
    }

    #[test]
    fn test_adopt_requires_greater_version() {
        let transport = Arc::new(LocalTransport::new());
        let a = Member::new("10.0.0.1:3320");
        let b = Member::new("10.0.0.2:3320");
        let (coordinator, other) = if a < b { (a, b) } else { (b, a) };
        let rt = table(other.name(), config(5, &[]), &transport);

        let members = vec![coordinator.clone(), other.clone()];
        let plan = HrwPlacement::new().assign(5, &members, 2);
        let snapshot = RoutingSnapshot::from_assignments(3, coordinator.clone(), members, plan);

        let ack = rt.adopt(&snapshot.to_update()).unwrap();
        assert!(ack.accepted);
        assert_eq!(ack.version, 3);
        assert_eq!(rt.snapshot().as_ref(), &snapshot);
        assert!(rt.is_bootstrapped());
        assert!(rt.is_member(&coordinator));

        // Same view again is acknowledged without a change
        let ack = rt.adopt(&snapshot.to_update()).unwrap();
        assert!(ack.accepted);
        assert_eq!(ack.version, 3);

        // A different view under the same version is refused
        let mut conflicting = snapshot.to_update();
        conflicting.routes[0].primary_owners = vec!["10.0.0.7:3320".into()];
        let ack = rt.adopt(&conflicting).unwrap();
        assert!(!ack.accepted);
        assert_eq!(rt.snapshot().as_ref(), &snapshot);

        // Older version is ignored
        let stale = RoutingSnapshot::from_assignments(
            2,
            coordinator,
            Vec::new(),
            vec![Assignment::default(); 5],
        );
        assert!(!rt.adopt(&stale.to_update()).unwrap().accepted);
        assert_eq!(rt.version(), 3);
    }

    #[test]
    fn test_adopt_rejects_wrong_partition_count() {
        let transport = Arc::new(LocalTransport::new());
        let rt = table("10.0.0.9:3320", config(5, &[]), &transport);
        let update = RoutingUpdate {
            version: 9,
            coordinator: "10.0.0.1:3320".into(),
            members: vec!["10.0.0.1:3320".into()],
            routes: vec![RouteEntry::default(); 4],
        };
        assert!(matches!(rt.adopt(&update), Err(Error::InvalidArgument(_))));
        assert_eq!(rt.version(), 0);
        assert!(!rt.is_bootstrapped());
    }

    #[tokio::test]
    async fn test_two_members_converge() {
        let transport = Arc::new(LocalTransport::new());
        let a = table("127.0.0.1:5001", config(16, &["127.0.0.1:5002"]), &transport);
        let b = table("127.0.0.1:5002", config(16, &["127.0.0.1:5001"]), &transport);
        let mut changes = b.subscribe();

        a.bootstrap().await;
        b.bootstrap().await;
        for _ in 0..2 {
            a.heartbeat().await;
            b.heartbeat().await;
        }

        assert!(a.is_bootstrapped());
        assert!(b.is_bootstrapped());
        assert_eq!(a.coordinator(), b.coordinator());
        assert_eq!(a.version(), b.version());
        assert_eq!(a.routes(), b.routes());
        assert!(changes.has_changed().unwrap());
        assert_eq!(*changes.borrow_and_update(), b.version());

        // Both members own primaries; backups never duplicate the primary
        let routes = a.routes();
        for name in ["127.0.0.1:5001", "127.0.0.1:5002"] {
            assert!(routes.iter().any(|r| r.primary_owners == vec![name.to_string()]));
        }
        for route in &routes {
            assert_eq!(route.replica_owners.len(), 1);
            assert_ne!(route.primary_owners, route.replica_owners);
        }
    }

    #[tokio::test]
    async fn test_failed_member_is_removed() {
        let transport = Arc::new(LocalTransport::new());
        let a = table("127.0.0.1:5001", config(8, &["127.0.0.1:5002"]), &transport);
        let b = table("127.0.0.1:5002", config(8, &["127.0.0.1:5001"]), &transport);
        a.bootstrap().await;
        b.bootstrap().await;
        a.heartbeat().await;
        b.heartbeat().await;
        assert_eq!(a.members().len(), 2);

        transport.unregister(b.this().name());
        let version = a.version();
        a.heartbeat().await;
        a.heartbeat().await;

        assert_eq!(a.members(), vec![a.this().clone()]);
        assert!(a.version() > version);
        for route in a.routes() {
            assert_eq!(route.primary_owners, vec!["127.0.0.1:5001".to_string()]);
            assert!(route.replica_owners.is_empty());
        }
    }

    #[test]
    fn test_shutdown_twice() {
        let transport = Arc::new(LocalTransport::new());
        let rt = table("127.0.0.1:3320", config(7, &[]), &transport);
        rt.shutdown().unwrap();
        assert!(matches!(rt.shutdown(), Err(Error::ServerGone)));
    }
}
