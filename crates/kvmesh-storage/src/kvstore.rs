//! In-memory, table based storage engine
//!
//! Entries live in a list of ordered tables. Writes go to the newest table;
//! once it reaches its capacity a larger table is allocated and the engine
//! reports [`StorageError::Fragmented`] until compaction has folded the
//! older tables into the newest one. Every key lives in exactly one table.

use crate::engine::{EngineDescriptor, Stats, StorageEngine};
use crate::entry::Entry;
use crate::error::StorageError;
use kvmesh_common::config::StorageConfig;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

const ENGINE_NAME: &str = "kvstore";
const SNAPSHOT_VERSION: u32 = 1;

/// Engine tuning
#[derive(Clone, Copy, Debug)]
pub struct KvStoreConfig {
    /// Entries the first table holds before a new table is allocated
    pub table_capacity: usize,
    /// Entries moved per compaction step
    pub compaction_batch: usize,
}

impl Default for KvStoreConfig {
    fn default() -> Self {
        Self {
            table_capacity: 65_536,
            compaction_batch: 1024,
        }
    }
}

impl From<&StorageConfig> for KvStoreConfig {
    fn from(config: &StorageConfig) -> Self {
        Self {
            table_capacity: config.table_capacity,
            compaction_batch: config.compaction_batch,
        }
    }
}

struct Table {
    entries: BTreeMap<u64, Entry>,
    capacity: usize,
    inuse: usize,
}

impl Table {
    fn new(capacity: usize) -> Self {
        Self {
            entries: BTreeMap::new(),
            capacity: capacity.max(1),
            inuse: 0,
        }
    }

    fn insert(&mut self, hkey: u64, entry: Entry) {
        self.inuse += entry.size();
        if let Some(old) = self.entries.insert(hkey, entry) {
            self.inuse = self.inuse.saturating_sub(old.size());
        }
    }

    fn remove(&mut self, hkey: u64) -> Option<Entry> {
        let old = self.entries.remove(&hkey)?;
        self.inuse = self.inuse.saturating_sub(old.size());
        Some(old)
    }

    fn pop_first(&mut self) -> Option<(u64, Entry)> {
        let (hkey, entry) = self.entries.pop_first()?;
        self.inuse = self.inuse.saturating_sub(entry.size());
        Some((hkey, entry))
    }

    fn is_full(&self) -> bool {
        self.entries.len() >= self.capacity
    }
}

#[derive(Serialize, Deserialize)]
struct Snapshot {
    engine: String,
    version: u32,
    entries: Vec<(u64, Entry)>,
}

/// Default in-memory storage engine
pub struct KvStore {
    tables: Vec<Table>,
    garbage: usize,
    config: KvStoreConfig,
}

impl KvStore {
    /// Create an empty engine
    #[must_use]
    pub fn new(config: KvStoreConfig) -> Self {
        Self {
            tables: vec![Table::new(config.table_capacity)],
            garbage: 0,
            config,
        }
    }

    fn find_table(&self, hkey: u64) -> Option<usize> {
        (0..self.tables.len())
            .rev()
            .find(|&i| self.tables[i].entries.contains_key(&hkey))
    }

    fn newest(&mut self) -> &mut Table {
        let last = self.tables.len() - 1;
        &mut self.tables[last]
    }

    fn is_fragmented(&self) -> bool {
        self.tables.len() > 1
    }
}

impl Default for KvStore {
    fn default() -> Self {
        Self::new(KvStoreConfig::default())
    }
}

impl StorageEngine for KvStore {
    fn descriptor(&self) -> EngineDescriptor {
        EngineDescriptor {
            name: ENGINE_NAME,
            version: SNAPSHOT_VERSION,
        }
    }

    fn fresh(&self) -> Box<dyn StorageEngine> {
        Box::new(Self::new(self.config))
    }

    fn put(&mut self, hkey: u64, entry: Entry) -> Result<(), StorageError> {
        let last = self.tables.len() - 1;
        match self.find_table(hkey) {
            Some(idx) if idx == last => {
                self.tables[last].insert(hkey, entry);
                self.garbage += 1;
            }
            found => {
                if let Some(idx) = found {
                    self.tables[idx].remove(hkey);
                    self.garbage += 1;
                }
                if self.tables[last].is_full() {
                    let capacity = self.tables[last].capacity.saturating_mul(2);
                    debug!("Allocating new table with capacity {}", capacity);
                    self.tables.push(Table::new(capacity));
                }
                self.newest().insert(hkey, entry);
            }
        }

        if self.is_fragmented() {
            return Err(StorageError::Fragmented);
        }
        Ok(())
    }

    fn get(&self, hkey: u64) -> Result<Entry, StorageError> {
        self.find_table(hkey)
            .and_then(|idx| self.tables[idx].entries.get(&hkey).cloned())
            .ok_or(StorageError::KeyNotFound)
    }

    fn delete(&mut self, hkey: u64) -> Result<(), StorageError> {
        if let Some(idx) = self.find_table(hkey) {
            self.tables[idx].remove(hkey);
            self.garbage += 1;
        }
        Ok(())
    }

    fn range(&self, f: &mut dyn FnMut(u64, &Entry) -> bool) {
        for table in &self.tables {
            for (hkey, entry) in &table.entries {
                if !f(*hkey, entry) {
                    return;
                }
            }
        }
    }

    fn scan(
        &self,
        cursor: u64,
        count: usize,
        f: &mut dyn FnMut(&Entry) -> bool,
    ) -> Result<u64, StorageError> {
        let count = count.max(1);
        let mut batch: Vec<(u64, &Entry)> = self
            .tables
            .iter()
            .flat_map(|t| t.entries.range(cursor..).take(count))
            .map(|(k, e)| (*k, e))
            .collect();
        batch.sort_unstable_by_key(|(k, _)| *k);
        batch.truncate(count);

        for (hkey, entry) in &batch {
            if !f(entry) {
                return Ok(hkey.checked_add(1).unwrap_or(0));
            }
        }

        if batch.len() < count {
            return Ok(0);
        }
        Ok(batch
            .last()
            .and_then(|(hkey, _)| hkey.checked_add(1))
            .unwrap_or(0))
    }

    fn export(&self) -> Result<Vec<u8>, StorageError> {
        let mut entries = Vec::with_capacity(self.stats().length);
        self.range(&mut |hkey, entry| {
            entries.push((hkey, entry.clone()));
            true
        });
        let snapshot = Snapshot {
            engine: ENGINE_NAME.to_string(),
            version: SNAPSHOT_VERSION,
            entries,
        };
        bincode::serialize(&snapshot).map_err(|e| StorageError::Encode(e.to_string()))
    }

    fn import(&self, data: &[u8]) -> Result<Box<dyn StorageEngine>, StorageError> {
        let snapshot: Snapshot =
            bincode::deserialize(data).map_err(|e| StorageError::Decode(e.to_string()))?;
        if !self.descriptor().accepts(&snapshot.engine, snapshot.version) {
            return Err(StorageError::UnsupportedSnapshot {
                engine: snapshot.engine,
                version: snapshot.version,
            });
        }

        let capacity = self.config.table_capacity.max(snapshot.entries.len());
        let mut table = Table::new(capacity);
        for (hkey, entry) in snapshot.entries {
            table.insert(hkey, entry);
        }
        Ok(Box::new(Self {
            tables: vec![table],
            garbage: 0,
            config: self.config,
        }))
    }

    fn stats(&self) -> Stats {
        Stats {
            length: self.tables.iter().map(|t| t.entries.len()).sum(),
            num_tables: self.tables.len(),
            allocated: self.tables.iter().map(|t| t.capacity).sum(),
            inuse: self.tables.iter().map(|t| t.inuse).sum(),
            garbage: self.garbage,
        }
    }

    fn compaction(&mut self) -> Result<bool, StorageError> {
        if !self.is_fragmented() {
            self.garbage = 0;
            return Ok(true);
        }

        for _ in 0..self.config.compaction_batch.max(1) {
            let Some((hkey, entry)) = self.tables[0].pop_first() else {
                break;
            };
            self.newest().insert(hkey, entry);
        }

        let newest = self.newest();
        newest.capacity = newest.capacity.max(newest.entries.len());

        if self.tables[0].entries.is_empty() {
            self.tables.remove(0);
        }

        if self.is_fragmented() {
            return Ok(false);
        }
        self.garbage = 0;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn small_store() -> KvStore {
        KvStore::new(KvStoreConfig {
            table_capacity: 4,
            compaction_batch: 3,
        })
    }

    fn entry(i: u64) -> Entry {
        Entry::with_version(format!("key-{i}"), format!("value-{i}").into_bytes(), 1000 + i as i64, 0)
    }

    #[test]
    fn test_put_get_delete() {
        let mut store = KvStore::default();
        store.put(1, entry(1)).unwrap();
        assert_eq!(store.get(1).unwrap(), entry(1));

        store.delete(1).unwrap();
        assert!(matches!(store.get(1), Err(StorageError::KeyNotFound)));
        // Deleting again is fine
        store.delete(1).unwrap();
        assert_eq!(store.stats().length, 0);
    }

    #[test]
    fn test_fragmentation_signal() {
        let mut store = small_store();
        for i in 0..4 {
            store.put(i, entry(i)).unwrap();
        }
        // Fifth key overflows the first table: write applied, signal raised
        let err = store.put(4, entry(4)).unwrap_err();
        assert!(err.is_fragmented());
        assert_eq!(store.get(4).unwrap(), entry(4));
        assert_eq!(store.stats().num_tables, 2);
    }

    #[test]
    fn test_overwrite_moves_key_to_newest_table() {
        let mut store = small_store();
        for i in 0..6 {
            let _ = store.put(i, entry(i));
        }
        let updated = Entry::with_version("key-0", b"new".to_vec(), 9999, 0);
        let _ = store.put(0, updated.clone());
        assert_eq!(store.get(0).unwrap(), updated);
        assert_eq!(store.stats().length, 6);
    }

    #[test]
    fn test_compaction_folds_tables() {
        let mut store = small_store();
        for i in 0..20 {
            let _ = store.put(i, entry(i));
        }
        assert!(store.stats().num_tables > 1);

        let mut steps = 0;
        while !store.compaction().unwrap() {
            steps += 1;
            assert!(steps < 100, "compaction did not converge");
        }
        let stats = store.stats();
        assert_eq!(stats.num_tables, 1);
        assert_eq!(stats.length, 20);
        assert_eq!(stats.garbage, 0);
        for i in 0..20 {
            assert_eq!(store.get(i).unwrap(), entry(i));
        }
        // Compact store accepts writes without signalling
        store.put(100, entry(100)).unwrap();
    }

    #[test]
    fn test_scan_visits_every_key_once() {
        let mut store = small_store();
        let keys: Vec<u64> = (0..50).map(|i| i * 7919 + 3).collect();
        for &k in &keys {
            let _ = store.put(k, entry(k));
        }

        let mut seen = HashSet::new();
        let mut cursor = 0;
        loop {
            cursor = store
                .scan(cursor, 8, &mut |e| {
                    assert!(seen.insert(e.key.clone()), "duplicate key {}", e.key);
                    true
                })
                .unwrap();
            if cursor == 0 {
                break;
            }
        }
        assert_eq!(seen.len(), keys.len());
    }

    #[test]
    fn test_export_import_roundtrip() {
        let mut store = small_store();
        for i in 0..10 {
            let _ = store.put(i, entry(i));
        }
        let snapshot = store.export().unwrap();
        let imported = store.import(&snapshot).unwrap();

        assert_eq!(imported.stats().length, 10);
        assert_eq!(imported.stats().num_tables, 1);
        for i in 0..10 {
            assert_eq!(imported.get(i).unwrap(), entry(i));
        }
        // The source is untouched
        assert_eq!(store.stats().length, 10);
    }

    #[test]
    fn test_import_rejects_other_snapshot_version() {
        let store = KvStore::default();
        let foreign = Snapshot {
            engine: ENGINE_NAME.to_string(),
            version: SNAPSHOT_VERSION + 1,
            entries: vec![(1, entry(1))],
        };
        let data = bincode::serialize(&foreign).unwrap();
        assert!(matches!(
            store.import(&data),
            Err(StorageError::UnsupportedSnapshot { .. })
        ));
        assert!(matches!(
            store.import(b"not a snapshot"),
            Err(StorageError::Decode(_))
        ));
    }
}
