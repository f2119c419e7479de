//! Fragment transfer
//!
//! A fragment travels as a [`DmapBox`]: the engine snapshot, its descriptor,
//! the access log and the fragment's identity, wrapped in the versioned
//! envelope. The receiver checks that it owns the target partition before
//! touching anything, then either adopts the snapshot (empty local fragment)
//! or merges it key by key with the configured comparator.

use crate::fragment::{Fragment, FragmentKey, FragmentState};
use crate::service::DMapService;
use kvmesh_common::{Error, Member, PartitionKind, Result};
use kvmesh_proto::messages::partition_kind;
use kvmesh_proto::{DmapBox, Kind, Operation, SystemMessage, decode_box, encode_box};
use kvmesh_storage::{StorageEngine, StorageError};
use std::collections::HashMap;
use tracing::{error, info, warn};

impl DMapService {
    /// Export a fragment into an encoded transfer unit.
    ///
    /// Returns the unit and the fragment generation it captured.
    pub fn export_fragment(&self, fragment: &Fragment) -> Result<(Vec<u8>, u64)> {
        self.export_as(fragment, fragment.key().kind)
    }

    /// Export a fragment, labelling the unit with `kind`
    fn export_as(&self, fragment: &Fragment, kind: PartitionKind) -> Result<(Vec<u8>, u64)> {
        let key = fragment.key();
        let (dmap_box, generation) = {
            let state = fragment.lock();
            let descriptor = state.engine().descriptor();
            let payload = state.engine().export()?;
            let dmap_box = DmapBox {
                part_id: key.part_id,
                kind: Kind::from(kind) as i32,
                name: key.name.clone(),
                engine: descriptor.name.to_string(),
                engine_version: descriptor.version,
                payload,
                access_log: state.access_log().cloned().unwrap_or_default(),
            };
            (dmap_box, state.generation())
        };
        Ok((encode_box(&dmap_box), generation))
    }

    /// Send a fragment to `target`.
    ///
    /// Returns the generation that was sent once the target acknowledged it.
    pub async fn move_fragment(&self, fragment: &Fragment, target: &Member) -> Result<u64> {
        self.send_as(fragment, target, fragment.key().kind).await
    }

    /// Send a copy of a fragment to `target` as its `kind` copy
    pub async fn send_as(
        &self,
        fragment: &Fragment,
        target: &Member,
        kind: PartitionKind,
    ) -> Result<u64> {
        let (data, generation) = self.export_as(fragment, kind)?;
        let size = data.len();
        self.transport
            .request(target, SystemMessage::new(Operation::MoveFragment, data))
            .await?;
        info!(
            "Sent {} to {} as {} ({} bytes)",
            fragment.key(),
            target,
            kind,
            size
        );
        Ok(generation)
    }

    /// Merge a local backup fragment into the primary copy of its partition.
    ///
    /// This member must own the primary partition. Returns the backup
    /// generation that was merged; the backup itself is left in place.
    pub async fn promote_backup(&self, fragment: &Fragment) -> Result<u64> {
        let (data, generation) = self.export_as(fragment, PartitionKind::Primary)?;
        self.import_fragment(&data).await?;
        info!("Promoted {} into the primary copy", fragment.key());
        Ok(generation)
    }

    /// Receive a transfer unit and fold it into the local fragment
    pub async fn import_fragment(&self, data: &[u8]) -> Result<()> {
        let dmap_box = decode_box(data)?;
        let kind = partition_kind(dmap_box.kind)?;
        if dmap_box.part_id >= self.routing.partition_count() {
            return Err(Error::invalid_argument(format!(
                "partID: {} out of range",
                dmap_box.part_id
            )));
        }

        let partition = self.routing.partition(dmap_box.part_id, kind);
        let this = self.routing.this();
        if !partition.is_owner(this) {
            warn!(
                "Received dmap {} on partID: {} (kind: {}) that does not belong to {}",
                dmap_box.name, dmap_box.part_id, kind, this
            );
            return Err(Error::invalid_argument(format!(
                "partID: {} (kind: {kind}) doesn't belong to {this}",
                dmap_box.part_id
            )));
        }

        // Nothing is created locally until the snapshot decodes
        let incoming = self.decode_snapshot(
            &dmap_box.engine,
            dmap_box.engine_version,
            &dmap_box.payload,
        )?;
        let config = self.open_dmap(&dmap_box.name).await?;
        let key = FragmentKey::new(dmap_box.part_id, kind, dmap_box.name.as_str());
        let (result, fragment) = self.with_fragment(&key, config.track_access, |state| {
            self.merge_into(state, incoming, &dmap_box.access_log)
        });
        match result {
            Ok(fragmented) => {
                info!("Received dmap {}", key);
                if fragmented {
                    self.schedule_compaction(fragment);
                }
                Ok(())
            }
            Err(e) => {
                error!("Failed to merge dmap {}: {}", key, e);
                Err(e)
            }
        }
    }

    /// Merge a decoded snapshot into a locked fragment.
    ///
    /// Returns true when the engine asked for compaction along the way.
    fn merge_into(
        &self,
        state: &mut FragmentState,
        incoming: Box<dyn StorageEngine>,
        access_log: &HashMap<u64, i64>,
    ) -> Result<bool> {
        state.merge_access_log(access_log);

        if state.length() == 0 {
            state.replace_engine(incoming);
            return Ok(false);
        }

        let mut fragmented = false;
        let mut failure: Option<StorageError> = None;
        incoming.range(&mut |hkey, entry| {
            let replace = match state.get(hkey) {
                Ok(current) => self.comparator.replaces(&current, entry),
                Err(StorageError::KeyNotFound) => true,
                Err(e) => {
                    failure = Some(e);
                    return false;
                }
            };
            if !replace {
                return true;
            }
            match state.put(hkey, entry.clone()) {
                Ok(signal) => {
                    fragmented |= signal;
                    true
                }
                Err(e) => {
                    failure = Some(e);
                    false
                }
            }
        });

        match failure {
            Some(e) => Err(e.into()),
            None => Ok(fragmented),
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::fragment::FragmentKey;
    use crate::service::DMapService;
    use crate::test_util::standalone;
    use kvmesh_common::{Error, PartitionKind, hash_key};
    use kvmesh_proto::{DmapBox, Kind, decode_box, encode_box};
    use kvmesh_storage::{Entry, KvStore, StorageEngine};
    use rand::seq::SliceRandom;
    use std::collections::HashMap;
    use std::sync::Arc;

    const NAME: &str = "127.0.0.1:3320";

    /// Transfer unit for partition `part_id` holding `entries`
    fn unit(dm: &DMapService, part_id: u64, kind: Kind, entries: &[Entry]) -> Vec<u8> {
        let mut engine = KvStore::default();
        for entry in entries {
            let _ = engine.put(hash_key(&entry.key), entry.clone());
        }
        let descriptor = engine.descriptor();
        let dmap_box = DmapBox {
            part_id,
            kind: kind as i32,
            name: "m".into(),
            engine: descriptor.name.into(),
            engine_version: descriptor.version,
            payload: engine.export().unwrap(),
            access_log: HashMap::new(),
        };
        assert!(part_id < dm.routing().partition_count());
        encode_box(&dmap_box)
    }

    /// Keys of a single-partition cluster all land in partition 0
    async fn single_partition() -> Arc<DMapService> {
        standalone(NAME, 1, |_| {}).await
    }

    fn contents(dm: &DMapService) -> HashMap<String, Entry> {
        let fragment = dm
            .fragments()
            .get(&FragmentKey::new(0, PartitionKind::Primary, "m"))
            .unwrap();
        let state = fragment.lock();
        let mut out = HashMap::new();
        state.engine().range(&mut |_, e| {
            out.insert(e.key.clone(), e.clone());
            true
        });
        out
    }

    #[tokio::test]
    async fn test_roundtrip_into_empty_fragment() {
        let dm = single_partition().await;
        let entries: Vec<Entry> = (0..100)
            .map(|i| Entry::with_version(format!("k{i}"), vec![i as u8], 1000 + i, 0))
            .collect();
        dm.import_fragment(&unit(&dm, 0, Kind::Primary, &entries))
            .await
            .unwrap();

        let stored = contents(&dm);
        assert_eq!(stored.len(), 100);
        for entry in &entries {
            assert_eq!(&stored[&entry.key], entry);
        }
    }

    #[tokio::test]
    async fn test_rejects_partition_not_owned() {
        let dm = single_partition().await;
        let data = unit(&dm, 0, Kind::Backup, &[Entry::new("k", Vec::new())]);

        let err = dm.import_fragment(&data).await.unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
        assert!(dm.fragments().is_empty());
    }

    #[tokio::test]
    async fn test_rejects_unknown_engine_and_corruption() {
        let dm = single_partition().await;
        let mut dmap_box = decode_box(&unit(&dm, 0, Kind::Primary, &[Entry::new("k", Vec::new())])).unwrap();
        dmap_box.engine_version += 1;
        let err = dm.import_fragment(&encode_box(&dmap_box)).await.unwrap_err();
        assert!(matches!(err, Error::IncompatibleSnapshot(_)));

        let mut data = unit(&dm, 0, Kind::Primary, &[Entry::new("k", Vec::new())]);
        let last = data.len() - 1;
        data[last] ^= 0xff;
        assert!(matches!(
            dm.import_fragment(&data).await,
            Err(Error::Deserialization(_))
        ));
        assert!(dm.fragments().is_empty());
    }

    #[tokio::test]
    async fn test_undecodable_snapshot_leaves_no_fragment() {
        let dm = single_partition().await;
        let mut dmap_box = decode_box(&unit(&dm, 0, Kind::Primary, &[Entry::new("k", Vec::new())])).unwrap();
        dmap_box.payload = vec![0xff; 16];

        assert!(matches!(
            dm.import_fragment(&encode_box(&dmap_box)).await,
            Err(Error::Deserialization(_))
        ));
        assert!(dm.fragments().is_empty());
        assert!(dm.dmap_names().is_empty());
    }

    #[tokio::test]
    async fn test_fragmented_merge_compacts_in_background() {
        let dm = standalone(NAME, 1, |config| {
            config.storage.table_capacity = 2;
            config.storage.compaction_batch = 4;
            config.storage.compaction_interval_ms = 1;
        })
        .await;
        dm.put("m", PartitionKind::Primary, Entry::new("local", Vec::new()))
            .await
            .unwrap();

        let incoming: Vec<Entry> = (0..50)
            .map(|i| Entry::with_version(format!("k{i}"), vec![i as u8], 1, 0))
            .collect();
        dm.import_fragment(&unit(&dm, 0, Kind::Primary, &incoming))
            .await
            .unwrap();

        let fragment = dm
            .fragments()
            .get(&FragmentKey::new(0, PartitionKind::Primary, "m"))
            .unwrap();
        for _ in 0..200 {
            if dm.running_tasks() == 0 && fragment.lock().engine().stats().num_tables == 1 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        assert_eq!(dm.running_tasks(), 0);
        assert_eq!(fragment.lock().engine().stats().num_tables, 1);

        let stored = contents(&dm);
        assert_eq!(stored.len(), 51);
        for entry in &incoming {
            assert_eq!(&stored[&entry.key], entry);
        }
    }

    #[tokio::test]
    async fn test_promote_backup_merges_into_primary() {
        let dm = single_partition().await;
        for i in 0..10 {
            dm.put(
                "m",
                PartitionKind::Backup,
                Entry::with_version(format!("k{i}"), b"backup".to_vec(), 5, 0),
            )
            .await
            .unwrap();
        }
        dm.put("m", PartitionKind::Primary, Entry::with_version("k3", b"primary".to_vec(), 9, 0))
            .await
            .unwrap();

        let backup = dm
            .fragments()
            .get(&FragmentKey::new(0, PartitionKind::Backup, "m"))
            .unwrap();
        let generation = dm.promote_backup(&backup).await.unwrap();
        assert_eq!(generation, backup.lock().generation());

        let stored = contents(&dm);
        assert_eq!(stored.len(), 10);
        assert_eq!(stored["k3"].value, b"primary");
        assert_eq!(stored["k4"].value, b"backup");
        assert_eq!(backup.length(), 10);
    }

    #[tokio::test]
    async fn test_self_import_is_noop() {
        let dm = single_partition().await;
        for i in 0..20 {
            dm.put("m", PartitionKind::Primary, Entry::new(format!("k{i}"), vec![1]))
                .await
                .unwrap();
        }
        let before = contents(&dm);
        let fragment = dm
            .fragments()
            .get(&FragmentKey::new(0, PartitionKind::Primary, "m"))
            .unwrap();
        let (data, generation) = dm.export_fragment(&fragment).unwrap();

        dm.import_fragment(&data).await.unwrap();
        assert_eq!(contents(&dm), before);
        assert_eq!(fragment.lock().generation(), generation);
    }

    #[tokio::test]
    async fn test_merge_keeps_newer_versions() {
        let dm = single_partition().await;
        dm.put("m", PartitionKind::Primary, Entry::with_version("shared", b"local".to_vec(), 50, 0))
            .await
            .unwrap();
        dm.put("m", PartitionKind::Primary, Entry::with_version("mine", b"x".to_vec(), 1, 0))
            .await
            .unwrap();

        let incoming = [
            Entry::with_version("shared", b"remote".to_vec(), 10, 0),
            Entry::with_version("theirs", b"y".to_vec(), 1, 0),
        ];
        dm.import_fragment(&unit(&dm, 0, Kind::Primary, &incoming))
            .await
            .unwrap();

        let stored = contents(&dm);
        assert_eq!(stored.len(), 3);
        assert_eq!(stored["shared"].value, b"local");
        assert_eq!(stored["theirs"].value, b"y");
    }

    #[tokio::test]
    async fn test_merge_is_commutative() {
        let mut rng = rand::thread_rng();
        let sets: Vec<Vec<Entry>> = (0..4)
            .map(|s| {
                (0..30)
                    .map(|k| {
                        let ts = (k * 7 + s * 13) % 5;
                        Entry::with_version(format!("k{k}"), vec![s as u8], ts, 0)
                    })
                    .collect()
            })
            .collect();

        let mut reference = None;
        for _ in 0..5 {
            let mut order: Vec<usize> = (0..sets.len()).collect();
            order.shuffle(&mut rng);

            let dm = single_partition().await;
            for idx in order {
                dm.import_fragment(&unit(&dm, 0, Kind::Primary, &sets[idx]))
                    .await
                    .unwrap();
            }
            let result = contents(&dm);
            match &reference {
                None => reference = Some(result),
                Some(expected) => assert_eq!(&result, expected),
            }
        }
    }
}
