use crate::{
    BundleStore, KvStore, MemBundleStore, MemSnapStore, MemTranscriptStore, SnapStore,
    StoreError, StoreResult, TranscriptStore,
};
use sha2::{Digest, Sha256};
use std::fmt;

const ACTIVITY_HASH_KEY: &str = "activityhash";
const LOCAL_PREFIX: &str = "local.";
const HOST_PREFIX: &str = "host.";

/// Hashes produced at the end of a crank.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrankHashes {
    /// Hex SHA-256 over this crank's consensus mutations, in mutation order.
    pub crankhash: String,
    /// Running hash chained across every crank.
    pub activityhash: String,
}

#[derive(Clone)]
struct Savepoint {
    name: String,
    undo_len: usize,
    hasher: Sha256,
}

#[derive(Clone, Default)]
struct CrankState {
    /// Previous value of every key touched during the crank.
    undo: Vec<(String, Option<String>)>,
    savepoints: Vec<Savepoint>,
}

/// The kernel's view of the ordered store.
///
/// Every mutation of a non-`local.` key is folded into the crank hasher. Keys
/// under `host.` belong to the host application and are refused here; they are
/// written through [`KernelStorage::host`] instead.
pub struct KernelStorage<S: KvStore> {
    kv: S,
    hasher: Sha256,
    crank: Option<CrankState>,
    transcripts: Box<dyn TranscriptStore>,
    snapshots: Box<dyn SnapStore>,
    bundles: Box<dyn BundleStore>,
}

impl<S: KvStore> fmt::Debug for KernelStorage<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KernelStorage")
            .field("in_crank", &self.crank.is_some())
            .finish_non_exhaustive()
    }
}

fn is_consensus_key(key: &str) -> bool {
    !key.starts_with(LOCAL_PREFIX)
}

impl<S: KvStore> KernelStorage<S> {
    /// Wraps `kv` with in-memory side stores.
    pub fn new(kv: S) -> Self {
        Self::with_side_stores(
            kv,
            Box::new(MemTranscriptStore::new()),
            Box::new(MemSnapStore::new()),
            Box::new(MemBundleStore::new()),
        )
    }

    pub fn with_side_stores(
        kv: S,
        transcripts: Box<dyn TranscriptStore>,
        snapshots: Box<dyn SnapStore>,
        bundles: Box<dyn BundleStore>,
    ) -> Self {
        Self {
            kv,
            hasher: Sha256::new(),
            crank: None,
            transcripts,
            snapshots,
            bundles,
        }
    }

    pub fn kv(&self) -> &S {
        &self.kv
    }

    pub fn into_inner(self) -> S {
        self.kv
    }

    pub fn host(&mut self) -> HostStorage<'_, S> {
        HostStorage { kv: &mut self.kv }
    }

    pub fn transcripts(&self) -> &dyn TranscriptStore {
        self.transcripts.as_ref()
    }

    pub fn transcripts_mut(&mut self) -> &mut dyn TranscriptStore {
        self.transcripts.as_mut()
    }

    pub fn snapshots(&self) -> &dyn SnapStore {
        self.snapshots.as_ref()
    }

    pub fn snapshots_mut(&mut self) -> &mut dyn SnapStore {
        self.snapshots.as_mut()
    }

    pub fn bundles(&self) -> &dyn BundleStore {
        self.bundles.as_ref()
    }

    pub fn bundles_mut(&mut self) -> &mut dyn BundleStore {
        self.bundles.as_mut()
    }

    pub fn in_crank(&self) -> bool {
        self.crank.is_some()
    }

    pub fn start_crank(&mut self) -> StoreResult<()> {
        if self.crank.is_some() {
            return Err(StoreError::CrankInProgress);
        }
        self.crank = Some(CrankState::default());
        Ok(())
    }

    pub fn establish_crank_savepoint(&mut self, name: &str) -> StoreResult<()> {
        let hasher = self.hasher.clone();
        let crank = self.crank.as_mut().ok_or(StoreError::NoCrank)?;
        crank.savepoints.push(Savepoint {
            name: name.to_owned(),
            undo_len: crank.undo.len(),
            hasher,
        });
        Ok(())
    }

    /// Undoes every mutation made since savepoint `name` was established,
    /// including its contribution to the crank hash. The savepoint stays valid.
    pub fn rollback_crank(&mut self, name: &str) -> StoreResult<()> {
        let crank = self.crank.as_mut().ok_or(StoreError::NoCrank)?;
        let idx = crank
            .savepoints
            .iter()
            .rposition(|sp| sp.name == name)
            .ok_or_else(|| StoreError::UnknownSavepoint(name.to_owned()))?;
        crank.savepoints.truncate(idx + 1);
        let savepoint = &crank.savepoints[idx];
        let undone = crank.undo.split_off(savepoint.undo_len);
        for (key, previous) in undone.into_iter().rev() {
            match previous {
                Some(value) => self.kv.set(&key, &value)?,
                None => self.kv.delete(&key)?,
            }
        }
        self.hasher = savepoint.hasher.clone();
        Ok(())
    }

    /// Finishes the crank hash, resets the hasher, and chains the result into
    /// the stored activity hash.
    pub fn emit_crank_hashes(&mut self) -> StoreResult<CrankHashes> {
        let crankhash = hex::encode(std::mem::take(&mut self.hasher).finalize());
        let previous = self.kv.get(ACTIVITY_HASH_KEY)?.unwrap_or_default();
        let mut chained = Sha256::new();
        chained.update(b"activityhash\n");
        chained.update(previous.as_bytes());
        chained.update(b"\n");
        chained.update(crankhash.as_bytes());
        chained.update(b"\n");
        let activityhash = hex::encode(chained.finalize());
        self.record_undo(ACTIVITY_HASH_KEY)?;
        self.kv.set(ACTIVITY_HASH_KEY, &activityhash)?;
        Ok(CrankHashes {
            crankhash,
            activityhash,
        })
    }

    pub fn end_crank(&mut self) -> StoreResult<()> {
        if self.crank.take().is_none() {
            return Err(StoreError::NoCrank);
        }
        self.kv.commit()
    }

    fn record_undo(&mut self, key: &str) -> StoreResult<()> {
        if let Some(crank) = self.crank.as_mut() {
            let previous = self.kv.get(key)?;
            crank.undo.push((key.to_owned(), previous));
        }
        Ok(())
    }

    fn check_kernel_key(key: &str) -> StoreResult<()> {
        if key.starts_with(HOST_PREFIX) {
            return Err(StoreError::ReservedKey(key.to_owned()));
        }
        Ok(())
    }
}

impl<S: KvStore> KvStore for KernelStorage<S> {
    fn get(&self, key: &str) -> StoreResult<Option<String>> {
        self.kv.get(key)
    }

    fn has(&self, key: &str) -> StoreResult<bool> {
        self.kv.has(key)
    }

    fn set(&mut self, key: &str, value: &str) -> StoreResult<()> {
        Self::check_kernel_key(key)?;
        self.record_undo(key)?;
        if is_consensus_key(key) {
            self.hasher.update(b"add\n");
            self.hasher.update(key.as_bytes());
            self.hasher.update(b"\n");
            self.hasher.update(value.as_bytes());
            self.hasher.update(b"\n");
        }
        self.kv.set(key, value)
    }

    fn delete(&mut self, key: &str) -> StoreResult<()> {
        Self::check_kernel_key(key)?;
        self.record_undo(key)?;
        if is_consensus_key(key) {
            self.hasher.update(b"delete\n");
            self.hasher.update(key.as_bytes());
            self.hasher.update(b"\n");
        }
        self.kv.delete(key)
    }

    fn get_next_key(&self, previous: &str) -> StoreResult<Option<String>> {
        self.kv.get_next_key(previous)
    }

    fn commit(&mut self) -> StoreResult<()> {
        self.kv.commit()
    }
}

/// Restricted view for the host application: only `host.*` keys, unhashed.
pub struct HostStorage<'a, S: KvStore> {
    kv: &'a mut S,
}

impl<S: KvStore> HostStorage<'_, S> {
    fn check(key: &str) -> StoreResult<()> {
        if !key.starts_with(HOST_PREFIX) {
            return Err(StoreError::NotHostKey(key.to_owned()));
        }
        Ok(())
    }
}

impl<S: KvStore> KvStore for HostStorage<'_, S> {
    fn get(&self, key: &str) -> StoreResult<Option<String>> {
        Self::check(key)?;
        self.kv.get(key)
    }

    fn set(&mut self, key: &str, value: &str) -> StoreResult<()> {
        Self::check(key)?;
        self.kv.set(key, value)
    }

    fn delete(&mut self, key: &str) -> StoreResult<()> {
        Self::check(key)?;
        self.kv.delete(key)
    }

    fn get_next_key(&self, previous: &str) -> StoreResult<Option<String>> {
        Ok(self
            .kv
            .get_next_key(previous)?
            .filter(|key| key.starts_with(HOST_PREFIX)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemKvStore;

    fn storage() -> KernelStorage<MemKvStore> {
        KernelStorage::new(MemKvStore::new())
    }

    fn expected_crankhash(ops: &[(&str, Option<&str>)]) -> String {
        let mut h = Sha256::new();
        for (key, value) in ops {
            match value {
                Some(v) => h.update(format!("add\n{key}\n{v}\n")),
                None => h.update(format!("delete\n{key}\n")),
            }
        }
        hex::encode(h.finalize())
    }

    #[test]
    fn crank_hash_covers_consensus_mutations_only() {
        let mut s = storage();
        s.start_crank().unwrap();
        s.set("a", "1").unwrap();
        s.set("local.x", "ignored").unwrap();
        s.delete("b").unwrap();
        let hashes = s.emit_crank_hashes().unwrap();
        s.end_crank().unwrap();
        assert_eq!(
            hashes.crankhash,
            expected_crankhash(&[("a", Some("1")), ("b", None)])
        );

        let mut chained = Sha256::new();
        chained.update(format!("activityhash\n\n{}\n", hashes.crankhash));
        assert_eq!(hashes.activityhash, hex::encode(chained.finalize()));
        assert_eq!(
            s.get("activityhash").unwrap().as_deref(),
            Some(hashes.activityhash.as_str())
        );
    }

    #[test]
    fn hasher_resets_between_cranks_and_activity_hash_chains() {
        let mut s = storage();
        s.start_crank().unwrap();
        s.set("a", "1").unwrap();
        let first = s.emit_crank_hashes().unwrap();
        s.end_crank().unwrap();

        s.start_crank().unwrap();
        let second = s.emit_crank_hashes().unwrap();
        s.end_crank().unwrap();
        assert_eq!(second.crankhash, expected_crankhash(&[]));
        assert_ne!(second.activityhash, first.activityhash);
    }

    #[test]
    fn setting_twice_differs_from_setting_once() {
        let mut once = storage();
        once.set("k", "v").unwrap();
        let mut twice = storage();
        twice.set("k", "v").unwrap();
        twice.set("k", "v").unwrap();
        assert_eq!(once.kv(), twice.kv());
        assert_ne!(
            once.emit_crank_hashes().unwrap(),
            twice.emit_crank_hashes().unwrap()
        );
    }

    #[test]
    fn rollback_restores_values_and_hash() {
        let mut s = storage();
        s.set("keep", "0").unwrap();
        s.start_crank().unwrap();
        s.set("a", "1").unwrap();
        s.establish_crank_savepoint("deliver").unwrap();
        s.set("a", "2").unwrap();
        s.set("b", "new").unwrap();
        s.delete("keep").unwrap();
        s.rollback_crank("deliver").unwrap();

        assert_eq!(s.get("a").unwrap().as_deref(), Some("1"));
        assert_eq!(s.get("b").unwrap(), None);
        assert_eq!(s.get("keep").unwrap().as_deref(), Some("0"));
        let hashes = s.emit_crank_hashes().unwrap();
        assert_eq!(
            hashes.crankhash,
            expected_crankhash(&[("keep", Some("0")), ("a", Some("1"))])
        );
        s.end_crank().unwrap();
    }

    #[test]
    fn crank_protocol_errors() {
        let mut s = storage();
        assert!(matches!(s.end_crank(), Err(StoreError::NoCrank)));
        assert!(matches!(
            s.establish_crank_savepoint("x"),
            Err(StoreError::NoCrank)
        ));
        s.start_crank().unwrap();
        assert!(matches!(s.start_crank(), Err(StoreError::CrankInProgress)));
        assert!(matches!(
            s.rollback_crank("missing"),
            Err(StoreError::UnknownSavepoint(_))
        ));
    }

    #[test]
    fn host_keys_are_partitioned() {
        let mut s = storage();
        assert!(matches!(
            s.set("host.height", "1"),
            Err(StoreError::ReservedKey(_))
        ));
        s.host().set("host.height", "1").unwrap();
        assert!(matches!(
            s.host().set("kernel.x", "1"),
            Err(StoreError::NotHostKey(_))
        ));
        assert_eq!(s.host().get("host.height").unwrap().as_deref(), Some("1"));
        // host writes do not enter the crank hash
        assert_eq!(
            s.emit_crank_hashes().unwrap().crankhash,
            expected_crankhash(&[])
        );
    }
}
