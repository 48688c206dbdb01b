use crate::{CleanupProgress, StoreResult};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotInfo {
    pub snap_pos: u64,
    pub hash: String,
    pub uncompressed_size: u64,
    pub in_use: bool,
}

/// Heap snapshots per vat, keyed by the transcript position they were taken
/// at.
pub trait SnapStore {
    fn save_snapshot(&mut self, vat_id: &str, snap_pos: u64, bytes: &[u8])
    -> StoreResult<SnapshotInfo>;

    /// The snapshot currently in use, if any.
    fn get_snapshot_info(&self, vat_id: &str) -> StoreResult<Option<SnapshotInfo>>;

    fn load_snapshot(&self, vat_id: &str) -> StoreResult<Option<Vec<u8>>>;

    fn stop_using_last_snapshot(&mut self, vat_id: &str) -> StoreResult<()>;

    /// Deletes up to `budget` snapshots (all of them when `None`).
    fn delete_vat_snapshots(
        &mut self,
        vat_id: &str,
        budget: Option<u64>,
    ) -> StoreResult<CleanupProgress>;
}

#[derive(Debug, Clone)]
struct StoredSnapshot {
    info: SnapshotInfo,
    bytes: Vec<u8>,
}

#[derive(Debug, Clone, Default)]
pub struct MemSnapStore {
    vats: BTreeMap<String, BTreeMap<u64, StoredSnapshot>>,
}

impl MemSnapStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot_count(&self, vat_id: &str) -> usize {
        self.vats.get(vat_id).map(BTreeMap::len).unwrap_or(0)
    }
}

impl SnapStore for MemSnapStore {
    fn save_snapshot(
        &mut self,
        vat_id: &str,
        snap_pos: u64,
        bytes: &[u8],
    ) -> StoreResult<SnapshotInfo> {
        let snapshots = self.vats.entry(vat_id.to_owned()).or_default();
        for prior in snapshots.values_mut() {
            prior.info.in_use = false;
        }
        let info = SnapshotInfo {
            snap_pos,
            hash: hex::encode(Sha256::digest(bytes)),
            uncompressed_size: bytes.len() as u64,
            in_use: true,
        };
        snapshots.insert(
            snap_pos,
            StoredSnapshot {
                info: info.clone(),
                bytes: bytes.to_vec(),
            },
        );
        Ok(info)
    }

    fn get_snapshot_info(&self, vat_id: &str) -> StoreResult<Option<SnapshotInfo>> {
        Ok(self.vats.get(vat_id).and_then(|snaps| {
            snaps
                .values()
                .find(|snap| snap.info.in_use)
                .map(|snap| snap.info.clone())
        }))
    }

    fn load_snapshot(&self, vat_id: &str) -> StoreResult<Option<Vec<u8>>> {
        Ok(self.vats.get(vat_id).and_then(|snaps| {
            snaps
                .values()
                .find(|snap| snap.info.in_use)
                .map(|snap| snap.bytes.clone())
        }))
    }

    fn stop_using_last_snapshot(&mut self, vat_id: &str) -> StoreResult<()> {
        if let Some(snaps) = self.vats.get_mut(vat_id) {
            for snap in snaps.values_mut() {
                snap.info.in_use = false;
            }
        }
        Ok(())
    }

    fn delete_vat_snapshots(
        &mut self,
        vat_id: &str,
        budget: Option<u64>,
    ) -> StoreResult<CleanupProgress> {
        let Some(snaps) = self.vats.get_mut(vat_id) else {
            return Ok(CleanupProgress {
                done: true,
                cleanups: 0,
            });
        };
        let limit = budget.unwrap_or(u64::MAX);
        let mut cleanups = 0;
        while cleanups < limit {
            if snaps.pop_first().is_none() {
                break;
            }
            cleanups += 1;
        }
        let done = snaps.is_empty();
        if done {
            self.vats.remove(vat_id);
        }
        Ok(CleanupProgress { done, cleanups })
    }
}
