//! The kernel table manager: kernel-wide object, promise and device tables,
//! queues, GC bookkeeping, meters, and the crank boundary.

mod cleanup;
mod dump;
mod gc_actions;
mod meters;
mod objects;
mod promises;
mod queues;
mod vats;

pub use dump::{CListRow, KernelDump, ObjectRow, VatTable};
pub use meters::{Meter, MeterRemaining};
pub use promises::{KernelPromise, PromisePolicy, PromiseState};
pub use cleanup::{CleanupOutcome, CleanupWork};

use crate::{
    allocator::{KernelObjectAllocator, ObjectRefCount, RefCountOptions, VatState},
    error::{KernelError, KernelResult},
    ids::{DeviceId, KernelSlot, VatId},
    kv::{get_json, get_parsed, get_required, get_required_json, get_required_parsed, set_json},
    options::{KernelOptions, ManagerType, ReapDirt, ReapDirtThreshold, VatOptions},
    stats::{KERNEL_STATS_METRICS, KernelStats, StatMap},
};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use swingset_store::{
    Bundle, CrankHashes, KernelStorage, KvStore, SnapStore, TranscriptStore,
};

pub const CURRENT_SCHEMA_VERSION: u64 = 3;

pub const FIRST_VAT_ID: u64 = 1;
pub const FIRST_DEVICE_ID: u64 = 7;
pub const FIRST_OBJECT_ID: u64 = 20;
pub const FIRST_DEVNODE_ID: u64 = 30;
pub const FIRST_PROMISE_ID: u64 = 40;
pub const FIRST_CRANK_NUMBER: u64 = 0;
pub const FIRST_METER_ID: u64 = 1;

const DEFAULT_REAP_DIRT_THRESHOLD_KEY: &str = "kernel.defaultReapDirtThreshold";
const TERMINATED_VATS_KEY: &str = "vats.terminated";

static BUNDLE_ID_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new("^b1-[0-9a-f]{128}$").expect("bundle ID regex"));

/// The schema the caller expects to find when opening a kernel DB.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpectedVersion {
    /// A brand-new DB that [`KernelKeeper::create_starting_kernel_state`]
    /// will populate.
    Uninitialized,
    Version(u64),
}

/// Reads the schema version the way every consumer of the DB does: a
/// missing `version` key means 0.
pub fn stored_version<S: KvStore + ?Sized>(kv: &S) -> KernelResult<u64> {
    Ok(get_parsed(kv, "version")?.unwrap_or(0))
}

/// Krefs whose refcounts dropped during this crank. Drained by
/// [`KernelKeeper::process_refcounts`]; never persisted.
#[derive(Debug, Default)]
struct MaybeFree {
    queue: VecDeque<KernelSlot>,
    members: BTreeSet<KernelSlot>,
}

impl MaybeFree {
    fn push(&mut self, kref: KernelSlot) {
        if self.members.insert(kref) {
            self.queue.push_back(kref);
        }
    }

    fn pop(&mut self) -> Option<KernelSlot> {
        let kref = self.queue.pop_front()?;
        self.members.remove(&kref);
        Some(kref)
    }

    fn clear(&mut self) {
        self.queue.clear();
        self.members.clear();
    }
}

pub struct KernelKeeper<S: KvStore> {
    storage: KernelStorage<S>,
    stats: KernelStats,
    maybe_free: MaybeFree,
    terminated_vats: Vec<VatId>,
    vat_states: BTreeMap<VatId, VatState>,
}

impl<S: KvStore> std::fmt::Debug for KernelKeeper<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KernelKeeper")
            .field("storage", &self.storage)
            .field("terminated_vats", &self.terminated_vats)
            .field("cached_vats", &self.vat_states.len())
            .finish_non_exhaustive()
    }
}

impl<S: KvStore> KernelKeeper<S> {
    /// Opens a kernel DB. A DB at any version other than `expected` is
    /// refused; run [`crate::upgrade_swingset`] first.
    pub fn open(storage: KernelStorage<S>, expected: ExpectedVersion) -> KernelResult<Self> {
        let mut terminated_vats = Vec::new();
        match expected {
            ExpectedVersion::Uninitialized => {
                if storage.has("initialized")? || storage.has("version")? {
                    return Err(KernelError::AlreadyInitialized);
                }
            }
            ExpectedVersion::Version(expected) => {
                let found = stored_version(&storage)?;
                if found != expected {
                    return Err(KernelError::SchemaMismatch { expected, found });
                }
                terminated_vats = get_required_json(&storage, TERMINATED_VATS_KEY)?;
            }
        }
        let mut keeper = Self {
            storage,
            stats: KernelStats::new(KERNEL_STATS_METRICS),
            maybe_free: MaybeFree::default(),
            terminated_vats,
            vat_states: BTreeMap::new(),
        };
        if keeper.storage.has("kernelStats")? {
            keeper.load_stats()?;
        }
        Ok(keeper)
    }

    pub fn storage(&self) -> &KernelStorage<S> {
        &self.storage
    }

    pub fn storage_mut(&mut self) -> &mut KernelStorage<S> {
        &mut self.storage
    }

    pub fn into_storage(self) -> KernelStorage<S> {
        self.storage
    }

    pub(crate) fn get_required(&self, key: &str) -> KernelResult<String> {
        get_required(&self.storage, key)
    }

    pub fn set_initialized(&mut self) -> KernelResult<()> {
        if self.storage.has("initialized")? || self.storage.has("version")? {
            return Err(KernelError::AlreadyInitialized);
        }
        self.storage
            .set("version", &CURRENT_SCHEMA_VERSION.to_string())?;
        Ok(())
    }

    pub fn create_starting_kernel_state(&mut self, options: &KernelOptions) -> KernelResult<()> {
        options.default_reap_dirt_threshold.validate_kernel_default()?;
        let kv = &mut self.storage;
        kv.set("vat.names", "[]")?;
        kv.set("vat.dynamicIDs", "[]")?;
        kv.set("vat.nextID", &FIRST_VAT_ID.to_string())?;
        kv.set("vat.nextUpgradeID", "1")?;
        kv.set(TERMINATED_VATS_KEY, "[]")?;
        kv.set("device.names", "[]")?;
        kv.set("device.nextID", &FIRST_DEVICE_ID.to_string())?;
        kv.set("ko.nextID", &FIRST_OBJECT_ID.to_string())?;
        kv.set("kd.nextID", &FIRST_DEVNODE_ID.to_string())?;
        kv.set("kp.nextID", &FIRST_PROMISE_ID.to_string())?;
        kv.set("meter.nextID", &FIRST_METER_ID.to_string())?;
        kv.set("gcActions", "[]")?;
        kv.set("reapQueue", "[]")?;
        self.init_queue(queues::RUN_QUEUE)?;
        self.init_queue(queues::ACCEPTANCE_QUEUE)?;
        let kv = &mut self.storage;
        kv.set("crankNumber", &FIRST_CRANK_NUMBER.to_string())?;
        kv.set(
            "kernel.defaultManagerType",
            options.default_manager_type.as_str(),
        )?;
        set_json(
            kv,
            DEFAULT_REAP_DIRT_THRESHOLD_KEY,
            &options.default_reap_dirt_threshold,
        )?;
        kv.set("kernel.snapshotInitial", &options.snapshot_initial.to_string())?;
        kv.set(
            "kernel.snapshotInterval",
            &options.snapshot_interval.to_string(),
        )?;
        if options.relax_durability_rules {
            kv.set("kernel.relaxDurabilityRules", "true")?;
        }
        self.terminated_vats.clear();
        self.stats.initialize();
        Ok(())
    }

    pub fn get_default_manager_type(&self) -> KernelResult<ManagerType> {
        get_required_parsed(&self.storage, "kernel.defaultManagerType")
    }

    pub fn get_relax_durability_rules(&self) -> KernelResult<bool> {
        Ok(self
            .storage
            .get("kernel.relaxDurabilityRules")?
            .is_some_and(|v| !v.is_empty()))
    }

    pub fn get_default_reap_dirt_threshold(&self) -> KernelResult<ReapDirtThreshold> {
        get_required_json(&self.storage, DEFAULT_REAP_DIRT_THRESHOLD_KEY)
    }

    pub fn set_default_reap_dirt_threshold(
        &mut self,
        threshold: &ReapDirtThreshold,
    ) -> KernelResult<()> {
        threshold.validate_kernel_default()?;
        set_json(&mut self.storage, DEFAULT_REAP_DIRT_THRESHOLD_KEY, threshold)
    }

    pub fn get_snapshot_initial(&self) -> KernelResult<u64> {
        get_required_parsed(&self.storage, "kernel.snapshotInitial")
    }

    pub fn get_snapshot_interval(&self) -> KernelResult<u64> {
        get_required_parsed(&self.storage, "kernel.snapshotInterval")
    }

    pub fn set_snapshot_interval(&mut self, interval: u64) -> KernelResult<()> {
        self.storage
            .set("kernel.snapshotInterval", &interval.to_string())?;
        Ok(())
    }

    pub fn add_named_bundle_id(&mut self, name: &str, bundle_id: &str) -> KernelResult<()> {
        if !BUNDLE_ID_RE.is_match(bundle_id) {
            return Err(KernelError::InvalidBundleId(bundle_id.to_owned()));
        }
        self.storage
            .set(&format!("namedBundleID.{name}"), bundle_id)?;
        Ok(())
    }

    pub fn get_named_bundle_id(&self, name: &str) -> KernelResult<String> {
        self.get_required(&format!("namedBundleID.{name}"))
    }

    /// Stores a bundle under an ID the caller has already validated.
    pub fn add_bundle(&mut self, bundle_id: &str, bundle: Bundle) -> KernelResult<()> {
        self.storage.bundles_mut().add_bundle(bundle_id, bundle)?;
        Ok(())
    }

    pub fn has_bundle(&self, bundle_id: &str) -> KernelResult<bool> {
        Ok(self.storage.bundles().has_bundle(bundle_id)?)
    }

    pub fn get_bundle(&self, bundle_id: &str) -> KernelResult<Option<Bundle>> {
        let Some(bundle) = self.storage.bundles().get_bundle(bundle_id)? else {
            return Ok(None);
        };
        if bundle.module_format != Bundle::ENDO_ZIP_BASE64 {
            return Err(KernelError::UnsupportedBundleFormat {
                id: bundle_id.to_owned(),
                format: bundle.module_format,
            });
        }
        Ok(Some(bundle))
    }

    pub fn get_crank_number(&self) -> KernelResult<u64> {
        get_required_parsed(&self.storage, "crankNumber")
    }

    pub fn increment_crank_number(&mut self) -> KernelResult<()> {
        let crank = self.get_crank_number()?;
        self.storage.set("crankNumber", &(crank + 1).to_string())?;
        Ok(())
    }

    pub fn inc_stat_by(&mut self, stat: &str, delta: i64) -> KernelResult<()> {
        Ok(self.stats.inc(stat, delta)?)
    }

    pub fn dec_stat_by(&mut self, stat: &str, delta: i64) -> KernelResult<()> {
        Ok(self.stats.dec(stat, delta)?)
    }

    pub fn save_stats(&mut self) -> KernelResult<()> {
        let (consensus, local) = self.stats.serialize()?;
        self.storage.set("kernelStats", &consensus)?;
        self.storage.set("local.kernelStats", &local)?;
        Ok(())
    }

    pub fn load_stats(&mut self) -> KernelResult<()> {
        let consensus = self.get_required("kernelStats")?;
        let local = self.storage.get("local.kernelStats")?;
        self.stats.load(&consensus, local.as_deref())?;
        Ok(())
    }

    pub fn get_stats(&self, consensus_only: bool) -> KernelResult<StatMap> {
        Ok(self.stats.get_stats(consensus_only)?)
    }

    pub fn start_crank(&mut self) -> KernelResult<()> {
        Ok(self.storage.start_crank()?)
    }

    pub fn establish_crank_savepoint(&mut self, name: &str) -> KernelResult<()> {
        Ok(self.storage.establish_crank_savepoint(name)?)
    }

    /// Rolls storage back to `name`, then rebuilds every in-memory view of it:
    /// stats, the terminated-vat list, cached vat state, and pending
    /// refcount work.
    pub fn rollback_crank(&mut self, name: &str) -> KernelResult<()> {
        self.storage.rollback_crank(name)?;
        self.load_stats()?;
        self.terminated_vats = get_json(&self.storage, TERMINATED_VATS_KEY)?.unwrap_or_default();
        self.vat_states.clear();
        self.maybe_free.clear();
        Ok(())
    }

    pub fn emit_crank_hashes(&mut self) -> KernelResult<CrankHashes> {
        self.save_stats()?;
        Ok(self.storage.emit_crank_hashes()?)
    }

    pub fn end_crank(&mut self) -> KernelResult<()> {
        Ok(self.storage.end_crank()?)
    }

    pub fn evict_vat_keeper(&mut self, vat: VatId) {
        self.vat_states.remove(&vat);
    }

    fn load_vat_state(&self, vat: VatId) -> KernelResult<VatState> {
        if !self.storage.has(&format!("{vat}.o.nextID"))? {
            return Err(KernelError::VatNotInitialized(vat.to_string()));
        }
        let options: VatOptions = get_required_json(&self.storage, &format!("{vat}.options"))?;
        let reap_dirt: ReapDirt = get_required_json(&self.storage, &format!("{vat}.reapDirt"))?;
        Ok(VatState { options, reap_dirt })
    }
}

impl<S: KvStore> KernelObjectAllocator for KernelKeeper<S> {
    fn kv(&self) -> &dyn KvStore {
        &self.storage
    }

    fn kv_mut(&mut self) -> &mut dyn KvStore {
        &mut self.storage
    }

    fn transcripts_mut(&mut self) -> &mut dyn TranscriptStore {
        self.storage.transcripts_mut()
    }

    fn transcripts(&self) -> &dyn TranscriptStore {
        self.storage.transcripts()
    }

    fn snapshots_mut(&mut self) -> &mut dyn SnapStore {
        self.storage.snapshots_mut()
    }

    fn add_kernel_object(&mut self, owner: VatId) -> KernelResult<KernelSlot> {
        KernelKeeper::add_kernel_object(self, owner, None)
    }

    fn add_kernel_device_node(&mut self, owner: DeviceId) -> KernelResult<KernelSlot> {
        KernelKeeper::add_kernel_device_node(self, owner)
    }

    fn add_kernel_promise_for_vat(&mut self, decider: VatId) -> KernelResult<KernelSlot> {
        KernelKeeper::add_kernel_promise_for_vat(self, decider)
    }

    fn kernel_object_exists(&self, kref: KernelSlot) -> KernelResult<bool> {
        KernelKeeper::kernel_object_exists(self, kref)
    }

    fn get_object_refcount(&self, kref: KernelSlot) -> KernelResult<ObjectRefCount> {
        KernelKeeper::get_object_refcount(self, kref)
    }

    fn set_object_refcount(
        &mut self,
        kref: KernelSlot,
        counts: ObjectRefCount,
    ) -> KernelResult<()> {
        KernelKeeper::set_object_refcount(self, kref, counts)
    }

    fn increment_ref_count(
        &mut self,
        kref: KernelSlot,
        tag: &str,
        options: RefCountOptions,
    ) -> KernelResult<()> {
        KernelKeeper::increment_ref_count(self, kref, tag, options)
    }

    fn decrement_ref_count(
        &mut self,
        kref: KernelSlot,
        tag: &str,
        options: RefCountOptions,
    ) -> KernelResult<bool> {
        KernelKeeper::decrement_ref_count(self, kref, tag, options)
    }

    fn add_maybe_free_kref(&mut self, kref: KernelSlot) {
        self.maybe_free.push(kref);
    }

    fn inc_stat(&mut self, stat: &str) -> KernelResult<()> {
        self.inc_stat_by(stat, 1)
    }

    fn dec_stat(&mut self, stat: &str) -> KernelResult<()> {
        self.dec_stat_by(stat, 1)
    }

    fn schedule_reap(&mut self, vat: VatId) -> KernelResult<()> {
        KernelKeeper::schedule_reap(self, vat)
    }

    fn default_reap_dirt_threshold(&self) -> KernelResult<ReapDirtThreshold> {
        self.get_default_reap_dirt_threshold()
    }

    fn vat_state(&mut self, vat: VatId) -> KernelResult<&mut VatState> {
        if !self.vat_states.contains_key(&vat) {
            let state = self.load_vat_state(vat)?;
            self.vat_states.insert(vat, state);
        }
        self.vat_states
            .get_mut(&vat)
            .ok_or_else(|| KernelError::VatNotInitialized(vat.to_string()))
    }

    fn evict_vat_state(&mut self, vat: VatId) {
        self.vat_states.remove(&vat);
    }
}

#[cfg(test)]
pub(crate) fn test_keeper() -> KernelKeeper<swingset_store::MemKvStore> {
    let storage = KernelStorage::new(swingset_store::MemKvStore::new());
    let mut keeper =
        KernelKeeper::open(storage, ExpectedVersion::Uninitialized).expect("open fresh kernel DB");
    keeper
        .create_starting_kernel_state(&KernelOptions::default())
        .expect("starting state");
    keeper.set_initialized().expect("set version");
    keeper
}
