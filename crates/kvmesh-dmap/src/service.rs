//! DMap service
//!
//! Local data path of a node: every key operation lands on the fragment of
//! its `(partition, kind)`. Routing a request to the right member is the
//! caller's job; the service only answers for the data this member holds.

use crate::fragment::{Fragment, FragmentKey, FragmentRegistry, FragmentState};
use crate::merge::{LastWriteWins, VersionComparator};
use dashmap::DashMap;
use kvmesh_cluster::{LockManager, RoutingTable, TaskGroup, Transport};
use kvmesh_common::config::DMapConfig;
use kvmesh_common::{Config, Error, PartitionId, PartitionKind, Result, hash_key};
use kvmesh_storage::entry::{now_millis, now_nanos};
use kvmesh_storage::{Entry, KvStore, KvStoreConfig, StorageEngine};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Local dmap operations of one member
pub struct DMapService {
    pub(crate) routing: Arc<RoutingTable>,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) comparator: Arc<dyn VersionComparator>,
    pub(crate) fragments: FragmentRegistry,
    prototype: Mutex<Box<dyn StorageEngine>>,
    dmap_settings: HashMap<String, DMapConfig>,
    dmaps: DashMap<String, DMapConfig>,
    locks: LockManager,
    tasks: TaskGroup,
    compaction_interval: Duration,
}

impl DMapService {
    /// Create the service.
    ///
    /// Every fragment gets a [`StorageEngine::fresh`] copy of `prototype`,
    /// and incoming snapshots are decoded by it.
    #[must_use]
    pub fn new(
        routing: Arc<RoutingTable>,
        transport: Arc<dyn Transport>,
        config: &Config,
        prototype: Box<dyn StorageEngine>,
        comparator: Arc<dyn VersionComparator>,
    ) -> Self {
        Self {
            routing,
            transport,
            comparator,
            fragments: FragmentRegistry::new(),
            prototype: Mutex::new(prototype),
            dmap_settings: config.dmaps.clone(),
            dmaps: DashMap::new(),
            locks: LockManager::new(),
            tasks: TaskGroup::new(),
            compaction_interval: Duration::from_millis(config.storage.compaction_interval_ms),
        }
    }

    /// Create the service with the in-memory engine and last-write-wins merges
    #[must_use]
    pub fn with_defaults(
        routing: Arc<RoutingTable>,
        transport: Arc<dyn Transport>,
        config: &Config,
    ) -> Self {
        let engine = KvStore::new(KvStoreConfig::from(&config.storage));
        Self::new(routing, transport, config, Box::new(engine), Arc::new(LastWriteWins))
    }

    /// Routing table this service answers for
    #[must_use]
    pub const fn routing(&self) -> &Arc<RoutingTable> {
        &self.routing
    }

    /// Fragments held by this member
    #[must_use]
    pub const fn fragments(&self) -> &FragmentRegistry {
        &self.fragments
    }

    /// Reject operations until the cluster has quorum and a routing table
    pub fn check_operable(&self) -> Result<()> {
        self.routing.check_member_count_quorum()?;
        self.routing.check_bootstrap()
    }

    /// Settings of a dmap, creating its local state on first use
    pub async fn open_dmap(&self, name: &str) -> Result<DMapConfig> {
        if name.is_empty() {
            return Err(Error::invalid_argument("dmap name must not be empty"));
        }
        if let Some(config) = self.dmaps.get(name) {
            return Ok(config.clone());
        }

        let _guard = self.locks.lock(name).await;
        if let Some(config) = self.dmaps.get(name) {
            return Ok(config.clone());
        }
        let config = self.dmap_settings.get(name).cloned().unwrap_or_default();
        debug!("Created dmap {} (track_access: {})", name, config.track_access);
        self.dmaps.insert(name.to_string(), config.clone());
        Ok(config)
    }

    /// Names of the dmaps opened on this member
    #[must_use]
    pub fn dmap_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.dmaps.iter().map(|d| d.key().clone()).collect();
        names.sort();
        names
    }

    /// Empty engine for a new fragment
    fn new_engine(&self) -> Box<dyn StorageEngine> {
        self.prototype.lock().fresh()
    }

    /// Decode a snapshot taken by an engine of kind `(name, version)`
    pub(crate) fn decode_snapshot(
        &self,
        name: &str,
        version: u32,
        payload: &[u8],
    ) -> Result<Box<dyn StorageEngine>> {
        let prototype = self.prototype.lock();
        let descriptor = prototype.descriptor();
        if !descriptor.accepts(name, version) {
            return Err(Error::IncompatibleSnapshot(format!(
                "{name} v{version} cannot be imported into {descriptor}"
            )));
        }
        Ok(prototype.import(payload)?)
    }

    /// Run `f` on the locked, registered fragment for `key`, creating it if
    /// needed
    pub(crate) fn with_fragment<R>(
        &self,
        key: &FragmentKey,
        track_access: bool,
        f: impl FnOnce(&mut FragmentState) -> R,
    ) -> (R, Arc<Fragment>) {
        loop {
            let fragment = self.fragments.get_or_create(key, || {
                Fragment::new(key.clone(), self.new_engine(), track_access)
            });
            let mut state = fragment.lock();
            if state.is_evicted() {
                continue;
            }
            let out = f(&mut state);
            drop(state);
            return (out, fragment);
        }
    }

    fn key_location(&self, name: &str, kind: PartitionKind, key: &str) -> (u64, FragmentKey) {
        let hkey = hash_key(key);
        let part_id = self.routing.partition_id(hkey);
        (hkey, FragmentKey::new(part_id, kind, name))
    }

    /// Store an entry
    pub async fn put(&self, name: &str, kind: PartitionKind, entry: Entry) -> Result<()> {
        let config = self.open_dmap(name).await?;
        let (hkey, key) = self.key_location(name, kind, &entry.key);
        let (result, fragment) =
            self.with_fragment(&key, config.track_access, |state| state.put(hkey, entry));
        if result? {
            self.schedule_compaction(fragment);
        }
        Ok(())
    }

    /// Fetch a live entry
    pub async fn get(&self, name: &str, kind: PartitionKind, key: &str) -> Result<Entry> {
        let config = self.open_dmap(name).await?;
        let (hkey, fkey) = self.key_location(name, kind, key);
        let fragment = self.fragments.get(&fkey).ok_or(Error::KeyNotFound)?;

        let mut state = fragment.lock();
        let entry = state.get(hkey)?;
        if entry.is_expired(now_millis()) {
            return Err(Error::KeyNotFound);
        }
        if config.track_access {
            state.touch(hkey, now_nanos());
        }
        Ok(entry)
    }

    /// Delete a key; deleting a missing key succeeds
    pub async fn delete(&self, name: &str, kind: PartitionKind, key: &str) -> Result<()> {
        self.open_dmap(name).await?;
        let (hkey, fkey) = self.key_location(name, kind, key);
        loop {
            let Some(fragment) = self.fragments.get(&fkey) else {
                return Ok(());
            };
            let mut state = fragment.lock();
            if state.is_evicted() {
                continue;
            }
            state.delete(hkey)?;
            return Ok(());
        }
    }

    /// Page through the live keys of one fragment.
    ///
    /// Returns the next cursor (0 when complete) and the keys found.
    pub async fn scan(
        &self,
        name: &str,
        part_id: PartitionId,
        kind: PartitionKind,
        cursor: u64,
        count: usize,
    ) -> Result<(u64, Vec<String>)> {
        self.open_dmap(name).await?;
        if part_id >= self.routing.partition_count() {
            return Err(Error::invalid_argument(format!(
                "partition {part_id} out of range"
            )));
        }
        let Some(fragment) = self.fragments.get(&FragmentKey::new(part_id, kind, name)) else {
            return Ok((0, Vec::new()));
        };

        let now = now_millis();
        let mut keys = Vec::new();
        let state = fragment.lock();
        let next = state.engine().scan(cursor, count, &mut |entry| {
            if !entry.is_expired(now) {
                keys.push(entry.key.clone());
            }
            true
        })?;
        Ok((next, keys))
    }

    /// Drop every local fragment of a dmap; returns how many were dropped
    pub fn destroy(&self, name: &str) -> usize {
        let dropped = self
            .fragments
            .of_dmap(name)
            .iter()
            .filter(|f| self.fragments.remove(f.key()).is_some())
            .count();
        self.dmaps.remove(name);
        debug!("Destroyed dmap {} ({} fragments)", name, dropped);
        dropped
    }

    /// Number of keys this member holds in a partition
    #[must_use]
    pub fn length_of_partition(&self, part_id: PartitionId, kind: PartitionKind) -> u64 {
        self.fragments
            .in_partition(part_id, kind)
            .iter()
            .map(|f| f.length() as u64)
            .sum()
    }

    /// Compact a fragment in the background until it reports completion
    pub fn schedule_compaction(&self, fragment: Arc<Fragment>) {
        if !fragment.begin_compaction() {
            return;
        }
        let interval = self.compaction_interval;
        let task_fragment = Arc::clone(&fragment);
        let spawned = self.tasks.spawn("compaction", move |token| async move {
            let fragment = task_fragment;
            debug!("Compaction started on {}", fragment.key());
            loop {
                // The flag is cleared under the fragment lock so a write that
                // fragments the engine afterwards schedules a new pass
                let finished = {
                    let mut state = fragment.lock();
                    let step = state.compact();
                    if !matches!(step, Ok(false)) {
                        fragment.end_compaction();
                    }
                    step
                };
                match finished {
                    Ok(true) => break,
                    Ok(false) => {}
                    Err(e) => {
                        warn!("Compaction failed on {}: {}", fragment.key(), e);
                        return;
                    }
                }
                tokio::select! {
                    () = token.cancelled() => {
                        fragment.end_compaction();
                        return;
                    }
                    () = tokio::time::sleep(interval) => {}
                }
            }
            debug!("Compaction finished on {}", fragment.key());
        });
        if !spawned {
            fragment.end_compaction();
        }
    }

    /// Background tasks still running
    #[must_use]
    pub fn running_tasks(&self) -> usize {
        self.tasks.len()
    }

    /// Stop background work and wait for it
    pub async fn shutdown(&self) -> Result<()> {
        if self.tasks.is_cancelled() {
            return Err(Error::ServerGone);
        }
        self.tasks.shutdown().await;
        Ok(())
    }
}
