//! Fragments
//!
//! A fragment is the data of one dmap in one `(partition, kind)` on this
//! member: an exclusive storage engine plus, when the dmap tracks access,
//! the last access time of each key. All access goes through the fragment
//! lock.
//!
//! Every mutation bumps the fragment's generation. The balancer records the
//! generation it exported and only evicts the fragment if nothing changed in
//! between. An evicted fragment is detached from the registry; callers that
//! still hold it must look the key up again.

use dashmap::DashMap;
use kvmesh_common::{PartitionId, PartitionKind};
use kvmesh_storage::{Entry, StorageEngine, StorageError};
use parking_lot::{Mutex, MutexGuard};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Identity of a fragment on this member
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FragmentKey {
    pub part_id: PartitionId,
    pub kind: PartitionKind,
    pub name: String,
}

impl FragmentKey {
    #[must_use]
    pub fn new(part_id: PartitionId, kind: PartitionKind, name: impl Into<String>) -> Self {
        Self {
            part_id,
            kind,
            name: name.into(),
        }
    }
}

impl fmt::Display for FragmentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.name, self.kind, self.part_id)
    }
}

/// Lock-protected contents of a fragment
pub struct FragmentState {
    engine: Box<dyn StorageEngine>,
    access_log: Option<HashMap<u64, i64>>,
    generation: u64,
    evicted: bool,
}

impl FragmentState {
    /// Local engine
    #[must_use]
    pub fn engine(&self) -> &dyn StorageEngine {
        self.engine.as_ref()
    }

    /// Mutation counter
    #[must_use]
    pub const fn generation(&self) -> u64 {
        self.generation
    }

    /// Number of keys
    #[must_use]
    pub fn length(&self) -> usize {
        self.engine.stats().length
    }

    /// Write an entry.
    ///
    /// Returns `Ok(true)` when the write was applied and the engine asks
    /// for compaction.
    pub fn put(&mut self, hkey: u64, entry: Entry) -> Result<bool, StorageError> {
        let result = self.engine.put(hkey, entry);
        self.generation += 1;
        match result {
            Ok(()) => Ok(false),
            Err(StorageError::Fragmented) => Ok(true),
            Err(e) => Err(e),
        }
    }

    /// Read an entry
    pub fn get(&self, hkey: u64) -> Result<Entry, StorageError> {
        self.engine.get(hkey)
    }

    /// Delete an entry and its access record
    pub fn delete(&mut self, hkey: u64) -> Result<(), StorageError> {
        self.engine.delete(hkey)?;
        if let Some(log) = self.access_log.as_mut() {
            log.remove(&hkey);
        }
        self.generation += 1;
        Ok(())
    }

    /// Record an access to `hkey` when access is tracked
    pub fn touch(&mut self, hkey: u64, at: i64) {
        if let Some(log) = self.access_log.as_mut() {
            log.insert(hkey, at);
        }
    }

    /// Access log, if tracked
    #[must_use]
    pub const fn access_log(&self) -> Option<&HashMap<u64, i64>> {
        self.access_log.as_ref()
    }

    /// Merge an incoming access log; existing records win
    pub fn merge_access_log(&mut self, incoming: &HashMap<u64, i64>) {
        if let Some(log) = self.access_log.as_mut() {
            for (hkey, at) in incoming {
                log.entry(*hkey).or_insert(*at);
            }
        }
    }

    /// Replace the engine wholesale
    pub fn replace_engine(&mut self, engine: Box<dyn StorageEngine>) {
        self.engine = engine;
        self.generation += 1;
    }

    /// Run one compaction step on the engine
    pub fn compact(&mut self) -> Result<bool, StorageError> {
        self.engine.compaction()
    }

    /// Check whether the fragment was detached from the registry
    #[must_use]
    pub const fn is_evicted(&self) -> bool {
        self.evicted
    }

    fn mark_evicted(&mut self) {
        self.evicted = true;
    }
}

/// One dmap's data in one `(partition, kind)`
pub struct Fragment {
    key: FragmentKey,
    state: Mutex<FragmentState>,
    compacting: AtomicBool,
}

impl Fragment {
    /// Create a fragment around an empty engine
    #[must_use]
    pub fn new(key: FragmentKey, engine: Box<dyn StorageEngine>, track_access: bool) -> Self {
        Self {
            key,
            state: Mutex::new(FragmentState {
                engine,
                access_log: track_access.then(HashMap::new),
                generation: 0,
                evicted: false,
            }),
            compacting: AtomicBool::new(false),
        }
    }

    /// Fragment identity
    #[must_use]
    pub const fn key(&self) -> &FragmentKey {
        &self.key
    }

    /// Lock the fragment
    pub fn lock(&self) -> MutexGuard<'_, FragmentState> {
        self.state.lock()
    }

    /// Number of keys
    #[must_use]
    pub fn length(&self) -> usize {
        self.lock().length()
    }

    /// Check whether the fragment holds no keys
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.length() == 0
    }

    /// Mark a compaction as running; false if one already is
    pub fn begin_compaction(&self) -> bool {
        self.compacting
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Mark the running compaction as finished
    pub fn end_compaction(&self) {
        self.compacting.store(false, Ordering::Release);
    }
}

/// All fragments on this member
#[derive(Default)]
pub struct FragmentRegistry {
    fragments: DashMap<FragmentKey, Arc<Fragment>>,
}

impl FragmentRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a fragment
    #[must_use]
    pub fn get(&self, key: &FragmentKey) -> Option<Arc<Fragment>> {
        self.fragments.get(key).map(|f| Arc::clone(f.value()))
    }

    /// Look up a fragment, creating it with `create` if absent
    pub fn get_or_create<F>(&self, key: &FragmentKey, create: F) -> Arc<Fragment>
    where
        F: FnOnce() -> Fragment,
    {
        if let Some(fragment) = self.get(key) {
            return fragment;
        }
        Arc::clone(
            self.fragments
                .entry(key.clone())
                .or_insert_with(|| Arc::new(create()))
                .value(),
        )
    }

    /// Remove a fragment, marking it evicted
    pub fn remove(&self, key: &FragmentKey) -> Option<Arc<Fragment>> {
        let fragment = self.get(key)?;
        let mut state = fragment.lock();
        self.evict_locked(&fragment, &mut state).then(|| Arc::clone(&fragment))
    }

    /// Remove `fragment` if it is still registered and unchanged since
    /// `generation`; returns true if it was evicted
    pub fn evict_if_unchanged(&self, fragment: &Arc<Fragment>, generation: u64) -> bool {
        let mut state = fragment.lock();
        if state.generation() != generation {
            return false;
        }
        self.evict_locked(fragment, &mut state)
    }

    fn evict_locked(&self, fragment: &Arc<Fragment>, state: &mut FragmentState) -> bool {
        if state.is_evicted() {
            return false;
        }
        let removed = self
            .fragments
            .remove_if(fragment.key(), |_, f| Arc::ptr_eq(f, fragment))
            .is_some();
        if removed {
            state.mark_evicted();
        }
        removed
    }

    /// Every fragment, ordered by key
    #[must_use]
    pub fn all(&self) -> Vec<Arc<Fragment>> {
        let mut fragments: Vec<Arc<Fragment>> =
            self.fragments.iter().map(|f| Arc::clone(f.value())).collect();
        fragments.sort_by(|a, b| a.key().cmp(b.key()));
        fragments
    }

    /// Fragments of one `(partition, kind)`
    #[must_use]
    pub fn in_partition(&self, part_id: PartitionId, kind: PartitionKind) -> Vec<Arc<Fragment>> {
        self.fragments
            .iter()
            .filter(|f| f.key().part_id == part_id && f.key().kind == kind)
            .map(|f| Arc::clone(f.value()))
            .collect()
    }

    /// Fragments of one dmap
    #[must_use]
    pub fn of_dmap(&self, name: &str) -> Vec<Arc<Fragment>> {
        self.fragments
            .iter()
            .filter(|f| f.key().name == name)
            .map(|f| Arc::clone(f.value()))
            .collect()
    }

    /// Number of fragments
    #[must_use]
    pub fn len(&self) -> usize {
        self.fragments.len()
    }

    /// Check whether there are no fragments
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fragments.is_empty()
    }
}
