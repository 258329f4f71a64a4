/*!
Artifact store: per-device, append-only snapshot sequences.

Layout under the storage adapter, per device:

- `<device>/objects/<sha256>.cfg[.gz]`: configuration blob, shared by every
  snapshot with the same content
- `<device>/index.json`: ordered snapshot entries for the device

A new snapshot is published by writing its blob first and then atomically
replacing the index, so readers never see an entry whose blob is missing.
All writes for one device (put, delete, sweep) hold that device's lock.
*/

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

use crate::compression::{compressor_for, CompressionAdapter};
use crate::config::{StorageBackend, StorageSettings};
use crate::device::DeviceId;
use crate::metadata::{CaptureInfo, SnapshotId, SnapshotMetadata, METADATA_FORMAT_VERSION};
use crate::retention::{RetentionPolicy, SweepCandidate, SweepReport};
use crate::storage::{LocalFileStorage, MemoryStorage, StorageAdapter};
use crate::{Result, VaultError};

const INDEX_FILE: &str = "index.json";

/// Persistence boundary for configuration snapshots
pub trait ArtifactStore: Send + Sync {
    /// Store a capture as the next snapshot of `device_id`
    fn put(&self, device_id: &DeviceId, content: &[u8], info: CaptureInfo)
        -> Result<SnapshotMetadata>;

    /// Raw configuration bytes, integrity-checked
    fn get(&self, id: &SnapshotId) -> Result<Vec<u8>>;

    fn metadata(&self, id: &SnapshotId) -> Result<SnapshotMetadata>;

    /// Snapshots of a device, oldest first
    fn list(&self, device_id: &DeviceId) -> Result<Vec<SnapshotMetadata>>;

    fn delete(&self, id: &SnapshotId) -> Result<()>;

    /// Apply a retention policy to one device
    fn sweep(
        &self,
        device_id: &DeviceId,
        policy: &RetentionPolicy,
        now: DateTime<Utc>,
    ) -> Result<SweepReport>;

    /// Devices that have at least an index in the store
    fn devices(&self) -> Result<Vec<DeviceId>>;

    /// Protect a snapshot from deletion and sweeps; pins nest
    fn pin(&self, id: &SnapshotId) -> Result<()>;

    fn unpin(&self, id: &SnapshotId);

    fn is_pinned(&self, id: &SnapshotId) -> bool;

    /// Ordered snapshot ids of a device
    fn snapshot_ids(&self, device_id: &DeviceId) -> Result<Vec<SnapshotId>> {
        Ok(self
            .list(device_id)?
            .into_iter()
            .map(|m| m.snapshot_id)
            .collect())
    }

    /// Most recently committed snapshot of a device
    fn latest(&self, device_id: &DeviceId) -> Result<Option<SnapshotMetadata>> {
        Ok(self.list(device_id)?.pop())
    }

    /// The snapshot committed immediately before `id`
    fn predecessor(&self, id: &SnapshotId) -> Result<Option<SnapshotMetadata>> {
        Ok(self
            .list(id.device_id())?
            .into_iter()
            .take_while(|m| m.sequence < id.sequence())
            .last())
    }

    /// Re-hash stored content against the recorded digest
    fn verify(&self, id: &SnapshotId) -> Result<SnapshotMetadata> {
        let metadata = self.metadata(id)?;
        self.get(id)?;
        Ok(metadata)
    }
}

/// Keeps a snapshot pinned until dropped
pub struct PinGuard {
    store: Arc<dyn ArtifactStore>,
    id: SnapshotId,
}

impl PinGuard {
    pub fn new(store: Arc<dyn ArtifactStore>, id: SnapshotId) -> Result<Self> {
        store.pin(&id)?;
        Ok(Self { store, id })
    }

    pub fn id(&self) -> &SnapshotId {
        &self.id
    }
}

impl Drop for PinGuard {
    fn drop(&mut self) {
        self.store.unpin(&self.id);
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
struct IndexEntry {
    #[serde(flatten)]
    metadata: SnapshotMetadata,
    blob: String,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
struct DeviceIndex {
    format_version: u8,
    device_id: DeviceId,
    next_sequence: u64,
    entries: Vec<IndexEntry>,
}

impl DeviceIndex {
    fn empty(device_id: DeviceId) -> Self {
        Self {
            format_version: METADATA_FORMAT_VERSION,
            device_id,
            next_sequence: 1,
            entries: Vec::new(),
        }
    }

    fn position(&self, id: &SnapshotId) -> Option<usize> {
        self.entries
            .iter()
            .position(|e| e.metadata.sequence == id.sequence())
    }

    fn blob_referenced(&self, blob: &str) -> bool {
        self.entries.iter().any(|e| e.blob == blob)
    }
}

struct PinnedEntry<'a> {
    entry: &'a IndexEntry,
    pinned: bool,
}

impl SweepCandidate for PinnedEntry<'_> {
    fn captured_at(&self) -> DateTime<Utc> {
        self.entry.metadata.captured_at
    }

    fn is_pinned(&self) -> bool {
        self.pinned
    }
}

/// Artifact store over any storage and compression adapter
pub struct SnapshotStore<S, C>
where
    S: StorageAdapter,
    C: CompressionAdapter,
{
    storage: S,
    compressor: C,
    device_locks: Mutex<HashMap<DeviceId, Arc<Mutex<()>>>>,
    pins: Mutex<HashMap<SnapshotId, usize>>,
}

impl<S, C> SnapshotStore<S, C>
where
    S: StorageAdapter,
    C: CompressionAdapter,
{
    pub fn new(storage: S, compressor: C) -> Self {
        Self {
            storage,
            compressor,
            device_locks: Mutex::new(HashMap::new()),
            pins: Mutex::new(HashMap::new()),
        }
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    fn device_lock(&self, device_id: &DeviceId) -> Arc<Mutex<()>> {
        let mut locks = self.device_locks.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(locks.entry(device_id.clone()).or_default())
    }

    fn index_key(device_id: &DeviceId) -> String {
        format!("{device_id}/{INDEX_FILE}")
    }

    fn blob_key(&self, device_id: &DeviceId, hash: &str) -> String {
        format!(
            "{device_id}/objects/{hash}.cfg{}",
            self.compressor.extension()
        )
    }

    fn load_index(&self, device_id: &DeviceId) -> Result<Option<DeviceIndex>> {
        let key = Self::index_key(device_id);
        if !self.storage.exists(&key) {
            return Ok(None);
        }
        let index: DeviceIndex = serde_json::from_slice(&self.storage.load(&key)?)?;
        if index.format_version > METADATA_FORMAT_VERSION {
            return Err(VaultError::invalid_format(format!(
                "Index for {device_id} has format version {} (current: {METADATA_FORMAT_VERSION})",
                index.format_version
            )));
        }
        Ok(Some(index))
    }

    fn require_index(&self, device_id: &DeviceId) -> Result<DeviceIndex> {
        self.load_index(device_id)?
            .ok_or_else(|| VaultError::SnapshotNotFound(format!("no snapshots for {device_id}")))
    }

    fn save_index(&self, index: &DeviceIndex) -> Result<()> {
        let data = serde_json::to_vec_pretty(index)?;
        self.storage.save(&data, &Self::index_key(&index.device_id))
    }

    fn find_entry(&self, id: &SnapshotId) -> Result<IndexEntry> {
        let index = self.require_index(id.device_id())?;
        index
            .position(id)
            .map(|pos| index.entries[pos].clone())
            .ok_or_else(|| VaultError::SnapshotNotFound(id.to_string()))
    }

    fn decode_blob(&self, entry: &IndexEntry) -> Result<Vec<u8>> {
        let stored = self.storage.load(&entry.blob)?;
        let content = if entry.metadata.compression_algorithm == "none" {
            stored
        } else if entry.metadata.compression_algorithm == self.compressor.algorithm_name() {
            self.compressor.decompress(&stored)?
        } else {
            compressor_for(true).decompress(&stored)?
        };
        entry.metadata.verify_integrity(&content)?;
        Ok(content)
    }

    /// Remove blobs no longer referenced by the index; returns bytes freed
    fn collect_blobs(&self, index: &DeviceIndex, removed: &[IndexEntry]) -> u64 {
        let mut freed = 0;
        for entry in removed {
            if index.blob_referenced(&entry.blob) || !self.storage.exists(&entry.blob) {
                continue;
            }
            match self.storage.delete(&entry.blob) {
                Ok(()) => freed += entry.metadata.stored_size.unwrap_or(0) as u64,
                Err(e) => warn!(blob = %entry.blob, error = %e, "Failed to delete orphaned blob"),
            }
        }
        freed
    }
}

impl<S, C> ArtifactStore for SnapshotStore<S, C>
where
    S: StorageAdapter,
    C: CompressionAdapter,
{
    fn put(
        &self,
        device_id: &DeviceId,
        content: &[u8],
        info: CaptureInfo,
    ) -> Result<SnapshotMetadata> {
        let lock = self.device_lock(device_id);
        let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());

        let mut index = self
            .load_index(device_id)?
            .unwrap_or_else(|| DeviceIndex::empty(device_id.clone()));

        let sequence = index.next_sequence;
        let mut captured_at = Utc::now();
        if let Some(last) = index.entries.last() {
            let floor = last.metadata.captured_at + chrono::Duration::milliseconds(1);
            if captured_at < floor {
                captured_at = floor;
            }
        }

        let mut metadata = SnapshotMetadata::new(device_id.clone(), sequence, info.transport)
            .with_capture_info(info)
            .with_content_hash(content)
            .with_captured_at(captured_at)
            .with_compression_algorithm(self.compressor.algorithm_name());

        let blob = self.blob_key(device_id, &metadata.content_hash);
        let compressed = self.compressor.compress(content)?;
        metadata = metadata.with_stored_size(compressed.len());
        metadata.validate()?;

        let new_blob = !self.storage.exists(&blob);
        if new_blob {
            self.storage.save(&compressed, &blob)?;
        } else {
            debug!(device_id = %device_id, blob = %blob, "Reusing stored blob");
        }

        index.entries.push(IndexEntry {
            metadata: metadata.clone(),
            blob: blob.clone(),
        });
        index.next_sequence = sequence + 1;

        if let Err(e) = self.save_index(&index) {
            if new_blob {
                let _ = self.storage.delete(&blob);
            }
            return Err(e);
        }

        info!(
            device_id = %device_id,
            snapshot_id = %metadata.snapshot_id,
            size = metadata.size,
            hash = metadata.short_hash(),
            "Snapshot stored"
        );
        Ok(metadata)
    }

    fn get(&self, id: &SnapshotId) -> Result<Vec<u8>> {
        let entry = self.find_entry(id)?;
        self.decode_blob(&entry)
    }

    fn metadata(&self, id: &SnapshotId) -> Result<SnapshotMetadata> {
        Ok(self.find_entry(id)?.metadata)
    }

    fn list(&self, device_id: &DeviceId) -> Result<Vec<SnapshotMetadata>> {
        Ok(self
            .load_index(device_id)?
            .map(|index| index.entries.into_iter().map(|e| e.metadata).collect())
            .unwrap_or_default())
    }

    fn delete(&self, id: &SnapshotId) -> Result<()> {
        let lock = self.device_lock(id.device_id());
        let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());
        if self.is_pinned(id) {
            return Err(VaultError::SnapshotPinned(id.to_string()));
        }

        let mut index = self.require_index(id.device_id())?;
        let pos = index
            .position(id)
            .ok_or_else(|| VaultError::SnapshotNotFound(id.to_string()))?;
        let removed = index.entries.remove(pos);
        self.save_index(&index)?;
        self.collect_blobs(&index, std::slice::from_ref(&removed));

        info!(snapshot_id = %id, "Snapshot deleted");
        Ok(())
    }

    fn sweep(
        &self,
        device_id: &DeviceId,
        policy: &RetentionPolicy,
        now: DateTime<Utc>,
    ) -> Result<SweepReport> {
        let lock = self.device_lock(device_id);
        let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());

        let mut report = SweepReport {
            device_id: Some(device_id.clone()),
            ..SweepReport::default()
        };
        let Some(mut index) = self.load_index(device_id)? else {
            return Ok(report);
        };

        let doomed = {
            let pins = self.pins.lock().unwrap_or_else(|e| e.into_inner());
            let candidates: Vec<PinnedEntry<'_>> = index
                .entries
                .iter()
                .map(|entry| PinnedEntry {
                    entry,
                    pinned: pins.contains_key(&entry.metadata.snapshot_id),
                })
                .collect();
            report.pinned = candidates.iter().filter(|c| c.pinned).count();
            policy.plan(&candidates, now)
        };

        if doomed.is_empty() {
            report.kept = index.entries.len();
            return Ok(report);
        }

        let mut removed = Vec::with_capacity(doomed.len());
        for pos in doomed.into_iter().rev() {
            removed.push(index.entries.remove(pos));
        }
        removed.reverse();
        self.save_index(&index)?;

        report.bytes_freed = self.collect_blobs(&index, &removed);
        report.removed = removed.into_iter().map(|e| e.metadata.snapshot_id).collect();
        report.kept = index.entries.len();

        info!(
            device_id = %device_id,
            removed = report.removed.len(),
            kept = report.kept,
            bytes_freed = report.bytes_freed,
            "Retention sweep completed"
        );
        Ok(report)
    }

    fn devices(&self) -> Result<Vec<DeviceId>> {
        let suffix = format!("/{INDEX_FILE}");
        let mut devices: Vec<DeviceId> = self
            .storage
            .list("")?
            .iter()
            .filter_map(|key| key.strip_suffix(&suffix))
            .filter(|device| !device.contains('/'))
            .filter_map(|device| DeviceId::new(device).ok())
            .collect();
        devices.sort();
        Ok(devices)
    }

    /// Serialized with sweeps and deletes through the device lock
    fn pin(&self, id: &SnapshotId) -> Result<()> {
        let lock = self.device_lock(id.device_id());
        let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());
        self.find_entry(id)?;
        let mut pins = self.pins.lock().unwrap_or_else(|e| e.into_inner());
        *pins.entry(id.clone()).or_insert(0) += 1;
        debug!(snapshot_id = %id, "Snapshot pinned");
        Ok(())
    }

    fn unpin(&self, id: &SnapshotId) {
        let mut pins = self.pins.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(count) = pins.get_mut(id) {
            *count -= 1;
            if *count == 0 {
                pins.remove(id);
            }
        }
    }

    fn is_pinned(&self, id: &SnapshotId) -> bool {
        self.pins
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(id)
    }
}

/// Build the artifact store described by the storage settings
pub fn create_store_from_config(settings: &StorageSettings) -> Result<Arc<dyn ArtifactStore>> {
    settings.validate()?;
    let compressor = compressor_for(settings.compress);
    let store: Arc<dyn ArtifactStore> = match settings.backend {
        StorageBackend::Local => Arc::new(SnapshotStore::new(
            LocalFileStorage::with_base_dir(&settings.base_path),
            compressor,
        )),
        StorageBackend::Memory => Arc::new(SnapshotStore::new(MemoryStorage::new(), compressor)),
    };
    Ok(store)
}
