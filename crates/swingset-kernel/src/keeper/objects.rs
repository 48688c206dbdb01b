//! Kernel objects, device nodes, reference counts, and the GC engine that
//! turns dropped references into GC actions.

use super::KernelKeeper;
use crate::{
    allocator::{KernelObjectAllocator, ObjectRefCount, RefCountOptions},
    error::{KernelError, KernelResult},
    event::{GcAction, GcActionKind, RunQueueEvent},
    ids::{DeviceId, KernelSlot, SlotKind, VatId},
    kv::{bump_counter, get_parsed, get_required_json, get_required_parsed, set_json},
    vat_keeper::ReachableAndVatSlot,
};
use std::collections::BTreeSet;
use swingset_store::KvStore;

pub(super) fn comma_split(s: &str) -> impl Iterator<Item = &str> {
    s.split(',').filter(|part| !part.is_empty())
}

impl<S: KvStore> KernelKeeper<S> {
    pub fn get_object_refcount(&self, kref: KernelSlot) -> KernelResult<ObjectRefCount> {
        let key = format!("{kref}.refCount");
        let Some(raw) = self.storage.get(&key)? else {
            return Ok(ObjectRefCount::default());
        };
        let (reachable, recognizable) = raw
            .split_once(',')
            .and_then(|(a, b)| Some((a.parse::<u64>().ok()?, b.parse::<u64>().ok()?)))
            .ok_or_else(|| KernelError::malformed(&key, &raw))?;
        if reachable > recognizable {
            return Err(KernelError::RefCountInvariant {
                kref: kref.to_string(),
                reachable,
                recognizable,
            });
        }
        Ok(ObjectRefCount::new(reachable, recognizable))
    }

    pub fn set_object_refcount(
        &mut self,
        kref: KernelSlot,
        counts: ObjectRefCount,
    ) -> KernelResult<()> {
        if counts.reachable > counts.recognizable {
            return Err(KernelError::RefCountInvariant {
                kref: kref.to_string(),
                reachable: counts.reachable,
                recognizable: counts.recognizable,
            });
        }
        self.storage.set(
            &format!("{kref}.refCount"),
            &format!("{},{}", counts.reachable, counts.recognizable),
        )?;
        Ok(())
    }

    /// Allocates a kernel object owned by `owner`. An explicit `id` is only
    /// meant for tests.
    pub fn add_kernel_object(&mut self, owner: VatId, id: Option<u64>) -> KernelResult<KernelSlot> {
        let id = match id {
            Some(id) => id,
            None => bump_counter(&mut self.storage, "ko.nextID")?,
        };
        let kref = KernelSlot::object(id);
        log::debug!("Adding kernel object {kref} for {owner}");
        self.storage
            .set(&format!("{kref}.owner"), &owner.to_string())?;
        self.set_object_refcount(kref, ObjectRefCount::default())?;
        self.inc_stat("kernelObjects")?;
        Ok(kref)
    }

    pub fn kernel_object_exists(&self, kref: KernelSlot) -> KernelResult<bool> {
        Ok(self.storage.has(&format!("{kref}.refCount"))?)
    }

    fn raw_owner(&self, kref: KernelSlot) -> KernelResult<Option<VatId>> {
        get_parsed(&self.storage, &format!("{kref}.owner"))
    }

    /// The owning vat, or `None` when the object is orphaned or its owner
    /// has been terminated.
    pub fn owner_of_kernel_object(&self, kref: KernelSlot) -> KernelResult<Option<VatId>> {
        if !kref.is_object() {
            return Err(KernelError::InvalidSlot(kref.to_string()));
        }
        Ok(self
            .raw_owner(kref)?
            .filter(|owner| !self.terminated_vats.contains(owner)))
    }

    /// Vats holding a c-list import of `kref`, dynamic vats scanned before
    /// static ones, sorted by vat ID string.
    pub fn get_importers(&self, kref: KernelSlot) -> KernelResult<Vec<VatId>> {
        let mut candidates = self.get_dynamic_vats()?;
        candidates.extend(self.get_static_vats()?.into_iter().map(|(_, vat)| vat));
        let mut importers = Vec::new();
        for vat in candidates {
            let entry = self.get_reachable_and_vat_slot(vat, kref)?;
            if entry.is_some_and(|e| !e.vat_slot.allocated_by_vat) {
                importers.push(vat);
            }
        }
        importers.sort_by_cached_key(|v| v.to_string());
        Ok(importers)
    }

    /// Sends `retireImport` to every importer of each object, then deletes it.
    pub fn retire_kernel_objects(&mut self, krefs: &[KernelSlot]) -> KernelResult<()> {
        let mut actions = Vec::new();
        for &kref in krefs {
            for vat in self.get_importers(kref)? {
                actions.push(GcAction::new(vat, GcActionKind::RetireImport, kref));
            }
            self.delete_kernel_object(kref)?;
        }
        self.add_gc_actions(actions)
    }

    /// Detaches an export from `old_vat`, which must own it. The object
    /// itself stays until its remaining references are dropped.
    pub fn orphan_kernel_object(&mut self, kref: KernelSlot, old_vat: VatId) -> KernelResult<()> {
        let owner_key = format!("{kref}.owner");
        if self.raw_owner(kref)? != Some(old_vat) {
            return Err(KernelError::NotOwner {
                kref: kref.to_string(),
                vat: old_vat.to_string(),
            });
        }
        self.storage.delete(&owner_key)?;
        let entry = self.get_reachable_and_vat_slot(old_vat, kref)?;
        self.storage.delete(&format!("{old_vat}.c.{kref}"))?;
        if let Some(ReachableAndVatSlot { vat_slot, .. }) = entry {
            self.storage.delete(&format!("{old_vat}.c.{vat_slot}"))?;
        }
        self.add_maybe_free_kref(kref);
        Ok(())
    }

    pub fn delete_kernel_object(&mut self, kref: KernelSlot) -> KernelResult<()> {
        self.storage.delete(&format!("{kref}.owner"))?;
        self.storage.delete(&format!("{kref}.refCount"))?;
        self.dec_stat("kernelObjects")
    }

    pub fn add_kernel_device_node(&mut self, device: DeviceId) -> KernelResult<KernelSlot> {
        let id = bump_counter(&mut self.storage, "kd.nextID")?;
        let kref = KernelSlot::device(id);
        log::debug!("Adding kernel device {kref} for {device}");
        self.storage
            .set(&format!("{kref}.owner"), &device.to_string())?;
        self.inc_stat("kernelDevices")?;
        Ok(kref)
    }

    pub fn owner_of_kernel_device(&self, kref: KernelSlot) -> KernelResult<DeviceId> {
        if kref.kind != SlotKind::Device {
            return Err(KernelError::InvalidSlot(kref.to_string()));
        }
        get_required_parsed(&self.storage, &format!("{kref}.owner"))
    }

    /// Promises carry a flat count; objects carry reachable and recognizable
    /// counts; device nodes are not counted.
    pub fn increment_ref_count(
        &mut self,
        kref: KernelSlot,
        tag: &str,
        options: RefCountOptions,
    ) -> KernelResult<()> {
        match kref.kind {
            SlotKind::Promise => {
                let key = format!("{kref}.refCount");
                let count: u64 = get_required_parsed(&self.storage, &key)?;
                self.storage.set(&key, &(count + 1).to_string())?;
            }
            SlotKind::Object if !options.is_export => {
                let mut counts = self.get_object_refcount(kref)?;
                if !options.only_recognizable {
                    counts.reachable += 1;
                }
                counts.recognizable += 1;
                log::trace!("++ {kref} {tag} {},{}", counts.reachable, counts.recognizable);
                self.set_object_refcount(kref, counts)?;
            }
            _ => {}
        }
        Ok(())
    }

    /// Returns true when a promise's count reaches zero. Objects whose
    /// reachable or recognizable count reaches zero are queued for
    /// [`KernelKeeper::process_refcounts`]; objects that no longer exist are
    /// ignored.
    pub fn decrement_ref_count(
        &mut self,
        kref: KernelSlot,
        tag: &str,
        options: RefCountOptions,
    ) -> KernelResult<bool> {
        match kref.kind {
            SlotKind::Promise => {
                let key = format!("{kref}.refCount");
                let count: u64 = get_required_parsed(&self.storage, &key)?;
                let count = count.checked_sub(1).ok_or_else(|| KernelError::RefCountUnderflow {
                    kref: kref.to_string(),
                    tag: tag.to_owned(),
                })?;
                self.storage.set(&key, &count.to_string())?;
                if count == 0 {
                    self.maybe_free.push(kref);
                    return Ok(true);
                }
            }
            SlotKind::Object if !options.is_export => {
                if !self.kernel_object_exists(kref)? {
                    log::warn!("decrement of {kref} ({tag}) after it was deleted");
                    return Ok(false);
                }
                let mut counts = self.get_object_refcount(kref)?;
                let underflow = || KernelError::RefCountUnderflow {
                    kref: kref.to_string(),
                    tag: tag.to_owned(),
                };
                if !options.only_recognizable {
                    counts.reachable = counts.reachable.checked_sub(1).ok_or_else(underflow)?;
                }
                counts.recognizable = counts.recognizable.checked_sub(1).ok_or_else(underflow)?;
                log::trace!("-- {kref} {tag} {},{}", counts.reachable, counts.recognizable);
                if counts.reachable == 0 || counts.recognizable == 0 {
                    self.maybe_free.push(kref);
                }
                self.set_object_refcount(kref, counts)?;
            }
            _ => {}
        }
        Ok(false)
    }

    /// Pins `kref` with a single permanent reference.
    pub fn pin_object(&mut self, kref: KernelSlot) -> KernelResult<()> {
        let raw = self.storage.get("pinnedObjects")?.unwrap_or_default();
        let mut pinned: BTreeSet<String> = comma_split(&raw).map(str::to_owned).collect();
        if pinned.insert(kref.to_string()) {
            self.increment_ref_count(kref, "pin", RefCountOptions::default())?;
            let joined = pinned.into_iter().collect::<Vec<_>>().join(",");
            self.storage.set("pinnedObjects", &joined)?;
        }
        Ok(())
    }

    /// Drains the maybe-free work list to a fixpoint. Krefs re-added while
    /// draining are examined again.
    pub fn process_refcounts(&mut self) -> KernelResult<()> {
        let mut actions = BTreeSet::new();
        while let Some(kref) = self.maybe_free.pop() {
            match kref.kind {
                SlotKind::Promise => self.collect_promise(kref)?,
                SlotKind::Object => self.collect_object(kref, &mut actions)?,
                SlotKind::Device => {}
            }
        }
        self.add_gc_actions(actions)
    }

    fn collect_promise(&mut self, kpid: KernelSlot) -> KernelResult<()> {
        if !self.has_kernel_promise(kpid)? {
            return Ok(());
        }
        let promise = self.get_kernel_promise(kpid)?;
        if promise.ref_count() != 0 {
            return Ok(());
        }
        // An unresolved promise has no resolution slots to release.
        if let Some(data) = promise.data() {
            for (idx, slot) in data.slots.clone().into_iter().enumerate() {
                self.decrement_ref_count(slot, &format!("gc|{kpid}|s{idx}"), RefCountOptions::default())?;
            }
        }
        self.delete_kernel_promise(kpid)
    }

    fn collect_object(
        &mut self,
        kref: KernelSlot,
        actions: &mut BTreeSet<GcAction>,
    ) -> KernelResult<()> {
        if !self.kernel_object_exists(kref)? {
            return Ok(());
        }
        let counts = self.get_object_refcount(kref)?;
        if counts.reachable != 0 {
            return Ok(());
        }
        // The raw owner, not owner_of_kernel_object: a terminated owner is
        // handled separately below.
        let mut owner = self.raw_owner(kref)?;
        if let Some(vat) = owner {
            if self.terminated_vats.contains(&vat) {
                // Fast-forward the abandonment that slow deletion would
                // have done, then treat the object as orphaned.
                let entry = self.get_reachable_and_vat_slot(vat, kref)?;
                self.storage.delete(&format!("{kref}.owner"))?;
                self.storage.delete(&format!("{vat}.c.{kref}"))?;
                if let Some(ReachableAndVatSlot { vat_slot, .. }) = entry {
                    self.storage.delete(&format!("{vat}.c.{vat_slot}"))?;
                }
                owner = None;
            } else {
                let entry = self.get_reachable_and_vat_slot(vat, kref)?;
                if entry.is_some_and(|e| e.is_reachable) {
                    actions.insert(GcAction::new(vat, GcActionKind::DropExport, kref));
                }
                if counts.recognizable == 0 {
                    actions.insert(GcAction::new(vat, GcActionKind::RetireExport, kref));
                }
            }
        }
        if owner.is_none() {
            if counts.recognizable > 0 {
                self.retire_kernel_objects(&[kref])?;
            } else {
                self.delete_kernel_object(kref)?;
            }
        }
        Ok(())
    }

    pub fn get_gc_actions(&self) -> KernelResult<BTreeSet<GcAction>> {
        get_required_json(&self.storage, "gcActions")
    }

    /// Persists the set sorted by its string form.
    pub fn set_gc_actions(&mut self, actions: &BTreeSet<GcAction>) -> KernelResult<()> {
        set_json(&mut self.storage, "gcActions", actions)
    }

    pub fn add_gc_actions<I>(&mut self, new_actions: I) -> KernelResult<()>
    where
        I: IntoIterator<Item = GcAction>,
    {
        let mut actions = self.get_gc_actions()?;
        for action in new_actions {
            if !action.kref.is_object() {
                return Err(KernelError::InvalidGcAction(action.to_string()));
            }
            actions.insert(action);
        }
        self.set_gc_actions(&actions)
    }

    pub fn schedule_reap(&mut self, vat: VatId) -> KernelResult<()> {
        let mut queue: Vec<VatId> = get_required_json(&self.storage, "reapQueue")?;
        if !queue.contains(&vat) {
            queue.push(vat);
            set_json(&mut self.storage, "reapQueue", &queue)?;
        }
        Ok(())
    }

    pub fn next_reap_action(&mut self) -> KernelResult<Option<RunQueueEvent>> {
        let mut queue: Vec<VatId> = get_required_json(&self.storage, "reapQueue")?;
        if queue.is_empty() {
            return Ok(None);
        }
        let vat_id = queue.remove(0);
        set_json(&mut self.storage, "reapQueue", &queue)?;
        Ok(Some(RunQueueEvent::BringOutYourDead { vat_id }))
    }

    /// The c-list entry `vat` holds for `kref`, read without loading the
    /// vat's cached state.
    pub(crate) fn get_reachable_and_vat_slot(
        &self,
        vat: VatId,
        kref: KernelSlot,
    ) -> KernelResult<Option<ReachableAndVatSlot>> {
        get_parsed(&self.storage, &format!("{vat}.c.{kref}"))
    }
}
