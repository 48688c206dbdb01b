//! The per-vat table manager: one vat's c-list, reachability flags, reap
//! dirt and options.
//!
//! A [`VatKeeper`] is a short-lived view borrowed from whatever implements
//! [`KernelObjectAllocator`]; the state it caches between deliveries lives
//! in the kernel's per-vat arena, not in the keeper itself.

use crate::{
    allocator::{KernelObjectAllocator, RefCountOptions},
    error::{KernelError, KernelResult},
    ids::{KernelSlot, SlotKind, VatId, VatSlot},
    keeper::CListRow,
    kv::{get_parsed, get_required_json, get_required_parsed, set_json},
    options::{ReapDirt, ReapDirtThreshold, ThresholdValue, VatOptions, VatSource},
};
use std::{fmt, str::FromStr};
use swingset_store::{CleanupProgress, helpers::enumerate_keys_with_prefix};

pub const FIRST_VAT_OBJECT_ID: u64 = 50;
pub const FIRST_VAT_PROMISE_ID: u64 = 60;
pub const FIRST_VAT_DEVICE_ID: u64 = 70;

/// The value stored at `v<N>.c.<kref>`: `"R o+4"` when the vat can reach the
/// object, `"_ o+4"` when it can merely recognize it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReachableAndVatSlot {
    pub is_reachable: bool,
    pub vat_slot: VatSlot,
}

impl fmt::Display for ReachableAndVatSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let flag = if self.is_reachable { 'R' } else { '_' };
        write!(f, "{flag} {}", self.vat_slot)
    }
}

impl FromStr for ReachableAndVatSlot {
    type Err = KernelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let is_reachable = match s.get(..2) {
            Some("R ") => true,
            Some("_ ") => false,
            _ => return Err(KernelError::InvalidSlot(s.to_owned())),
        };
        Ok(Self {
            is_reachable,
            vat_slot: s[2..].parse()?,
        })
    }
}

/// How [`VatKeeper::map_vat_slot_to_kernel_slot`] treats a vref.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapOptions {
    /// Mark the entry reachable (exports) or insist it already is (imports).
    pub set_reachable: bool,
    /// Fail instead of allocating when the vref is not in the c-list.
    pub required: bool,
    /// Fail when the vref is already in the c-list.
    pub require_new: bool,
}

impl Default for MapOptions {
    fn default() -> Self {
        Self {
            set_reachable: true,
            required: false,
            require_new: false,
        }
    }
}

impl MapOptions {
    pub const RECOGNIZE_ONLY: Self = Self {
        set_reachable: false,
        required: false,
        require_new: false,
    };
}

/// Allocation counters and transcript size for one vat.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VatStats {
    pub object_count: u64,
    pub promise_count: u64,
    pub device_count: u64,
    pub transcript_count: u64,
}

pub struct VatKeeper<'a, K: KernelObjectAllocator + ?Sized> {
    kernel: &'a mut K,
    vat_id: VatId,
}

impl<'a, K: KernelObjectAllocator + ?Sized> VatKeeper<'a, K> {
    /// The vat must already have been initialized.
    pub fn new(kernel: &'a mut K, vat_id: VatId) -> KernelResult<Self> {
        if !kernel.kv().has(&format!("{vat_id}.o.nextID"))? {
            return Err(KernelError::VatNotInitialized(vat_id.to_string()));
        }
        Ok(Self { kernel, vat_id })
    }

    pub fn vat_id(&self) -> VatId {
        self.vat_id
    }

    fn key(&self, suffix: impl fmt::Display) -> String {
        format!("{}.{suffix}", self.vat_id)
    }

    fn clist_key(&self, slot: impl fmt::Display) -> String {
        format!("{}.c.{slot}", self.vat_id)
    }

    pub fn get_source(&self) -> KernelResult<VatSource> {
        get_required_json(self.kernel.kv(), &self.key("source"))
    }

    pub fn get_options(&mut self) -> KernelResult<VatOptions> {
        Ok(self.kernel.vat_state(self.vat_id)?.options.clone())
    }

    pub fn set_source_and_options(
        &mut self,
        source: &VatSource,
        options: &VatOptions,
    ) -> KernelResult<()> {
        let (source_key, options_key) = (self.key("source"), self.key("options"));
        set_json(self.kernel.kv_mut(), &source_key, source)?;
        set_json(self.kernel.kv_mut(), &options_key, options)?;
        self.kernel.vat_state(self.vat_id)?.options = options.clone();
        Ok(())
    }

    /// The vat's own overrides, without the kernel default.
    pub fn get_reap_dirt_threshold(&mut self) -> KernelResult<ReapDirtThreshold> {
        Ok(self
            .kernel
            .vat_state(self.vat_id)?
            .options
            .reap_dirt_threshold
            .clone())
    }

    pub fn set_reap_dirt_threshold(&mut self, threshold: ReapDirtThreshold) -> KernelResult<()> {
        let mut options = self.get_options()?;
        options.reap_dirt_threshold = threshold;
        let key = self.key("options");
        set_json(self.kernel.kv_mut(), &key, &options)?;
        self.kernel.vat_state(self.vat_id)?.options = options;
        Ok(())
    }

    /// The kernel default overlaid with this vat's overrides.
    pub fn effective_reap_dirt_threshold(&mut self) -> KernelResult<ReapDirtThreshold> {
        let default = self.kernel.default_reap_dirt_threshold()?;
        Ok(default.overlay(&self.get_reap_dirt_threshold()?))
    }

    pub fn get_reap_dirt(&mut self) -> KernelResult<ReapDirt> {
        Ok(self.kernel.vat_state(self.vat_id)?.reap_dirt)
    }

    /// Accumulates dirt on every dimension with an active threshold and
    /// schedules a reap once any of them is reached. Dimensions set to
    /// `never` are not accumulated, and a vat whose threshold says
    /// `never: true` accumulates nothing.
    pub fn add_dirt(&mut self, more: &ReapDirt) -> KernelResult<()> {
        let thresholds = self.effective_reap_dirt_threshold()?;
        if thresholds.never {
            return Ok(());
        }
        let additions = [more.deliveries, more.gc_krefs, more.computrons];
        let vat_id = self.vat_id;
        let mut reap_dirt = self.kernel.vat_state(vat_id)?.reap_dirt;
        let mut reap = false;
        for (((_, threshold), (_, dirt)), delta) in thresholds
            .dimensions()
            .into_iter()
            .zip(reap_dirt.dimensions_mut())
            .zip(additions)
        {
            let (Some(ThresholdValue::Count(limit)), Some(delta)) = (threshold, delta) else {
                continue;
            };
            if limit == 0 {
                continue;
            }
            let total = dirt
                .unwrap_or(0)
                .checked_add(delta)
                .ok_or_else(|| KernelError::Overflow(format!("{vat_id}.reapDirt")))?;
            *dirt = Some(total);
            if total >= limit {
                reap = true;
            }
        }
        self.kernel.vat_state(vat_id)?.reap_dirt = reap_dirt;
        let key = self.key("reapDirt");
        set_json(self.kernel.kv_mut(), &key, &reap_dirt)?;
        if reap {
            self.kernel.schedule_reap(self.vat_id)?;
        }
        Ok(())
    }

    /// Resets all dirt after a completed sweep.
    pub fn clear_reap_dirt(&mut self) -> KernelResult<()> {
        self.kernel.vat_state(self.vat_id)?.reap_dirt = ReapDirt::default();
        let key = self.key("reapDirt");
        set_json(self.kernel.kv_mut(), &key, &ReapDirt::default())
    }

    fn allocate_id(&mut self, counter: &str) -> KernelResult<u64> {
        let key = self.key(counter);
        let id: u64 = get_required_parsed(self.kernel.kv(), &key)?;
        self.kernel.kv_mut().set(&key, &(id + 1).to_string())?;
        Ok(id)
    }

    fn add_clist_entry(&mut self, kref: KernelSlot, vat_slot: VatSlot) -> KernelResult<()> {
        self.kernel.inc_stat("clistEntries")?;
        let kernel_key = self.clist_key(kref);
        let vat_key = self.clist_key(vat_slot);
        let entry = ReachableAndVatSlot {
            is_reachable: false,
            vat_slot,
        };
        let kv = self.kernel.kv_mut();
        kv.set(&vat_key, &kref.to_string())?;
        kv.set(&kernel_key, &entry.to_string())?;
        log::debug!("Add mapping {kernel_key}<=>{vat_key}");
        Ok(())
    }

    /// Translates a vref the vat sent into a kref, allocating a kernel
    /// object or promise for a new export.
    pub fn map_vat_slot_to_kernel_slot(
        &mut self,
        vat_slot: VatSlot,
        options: MapOptions,
    ) -> KernelResult<KernelSlot> {
        let vat_key = self.clist_key(vat_slot);
        let exists = self.kernel.kv().has(&vat_key)?;
        if exists && options.require_new {
            return Err(KernelError::CListEntryExists {
                owner: self.vat_id.to_string(),
                slot: vat_slot.to_string(),
            });
        }
        if !exists {
            if options.required || !vat_slot.allocated_by_vat {
                return Err(KernelError::UnknownCListEntry {
                    owner: self.vat_id.to_string(),
                    slot: vat_slot.to_string(),
                });
            }
            let kref = match vat_slot.kind {
                SlotKind::Object => self.kernel.add_kernel_object(self.vat_id)?,
                SlotKind::Promise => self.kernel.add_kernel_promise_for_vat(self.vat_id)?,
                SlotKind::Device => {
                    return Err(KernelError::IllegalMapping {
                        owner: self.vat_id.to_string(),
                        slot: vat_slot.to_string(),
                        reason: "vats cannot export device nodes",
                    });
                }
            };
            // Exports never count against their own object.
            self.kernel.increment_ref_count(
                kref,
                &format!("{}|vk|clist", self.vat_id),
                RefCountOptions::EXPORT_RECOGNIZABLE,
            )?;
            self.add_clist_entry(kref, vat_slot)?;
        }
        let kref: KernelSlot = get_required_parsed(self.kernel.kv(), &vat_key)?;

        if options.set_reachable {
            if vat_slot.allocated_by_vat {
                self.set_reachable_flag(kref)?;
            } else if !self.get_reachable_flag(kref)? {
                return Err(KernelError::UnreachableImport {
                    vat: self.vat_id.to_string(),
                    slot: vat_slot.to_string(),
                });
            }
        }
        Ok(kref)
    }

    /// Translates a kref being delivered to the vat into a vref, allocating
    /// an import on first sight.
    pub fn map_kernel_slot_to_vat_slot(
        &mut self,
        kref: KernelSlot,
        set_reachable: bool,
    ) -> KernelResult<VatSlot> {
        let kernel_key = self.clist_key(kref);
        if !self.kernel.kv().has(&kernel_key)? {
            let counter = match kref.kind {
                SlotKind::Object => "o.nextID",
                SlotKind::Promise => "p.nextID",
                SlotKind::Device => "d.nextID",
            };
            let id = self.allocate_id(counter)?;
            self.kernel.increment_ref_count(
                kref,
                &format!("{}|kv|clist", self.vat_id),
                RefCountOptions::RECOGNIZABLE,
            )?;
            self.add_clist_entry(kref, VatSlot::new(kref.kind, false, id))?;
        }
        let entry: ReachableAndVatSlot = get_required_parsed(self.kernel.kv(), &kernel_key)?;

        if set_reachable {
            if entry.vat_slot.allocated_by_vat {
                if !entry.is_reachable {
                    return Err(KernelError::IllegalMapping {
                        owner: self.vat_id.to_string(),
                        slot: kref.to_string(),
                        reason: "export sent to its owner while unreachable",
                    });
                }
            } else {
                self.set_reachable_flag(kref)?;
            }
        }
        Ok(entry.vat_slot)
    }

    pub fn get_reachable_and_vat_slot(
        &self,
        kref: KernelSlot,
    ) -> KernelResult<Option<ReachableAndVatSlot>> {
        get_parsed(self.kernel.kv(), &self.clist_key(kref))
    }

    fn required_entry(&self, kref: KernelSlot) -> KernelResult<ReachableAndVatSlot> {
        self.get_reachable_and_vat_slot(kref)?
            .ok_or_else(|| KernelError::UnknownCListEntry {
                owner: self.vat_id.to_string(),
                slot: kref.to_string(),
            })
    }

    pub fn has_clist_entry(&self, vat_slot: VatSlot) -> KernelResult<bool> {
        Ok(self.kernel.kv().has(&self.clist_key(vat_slot))?)
    }

    pub fn imports_kernel_slot(&self, kref: KernelSlot) -> KernelResult<bool> {
        Ok(self
            .get_reachable_and_vat_slot(kref)?
            .is_some_and(|entry| !entry.vat_slot.allocated_by_vat))
    }

    pub fn get_reachable_flag(&self, kref: KernelSlot) -> KernelResult<bool> {
        Ok(self.required_entry(kref)?.is_reachable)
    }

    /// Only object imports carry the reachable credit on the kernel object.
    pub fn set_reachable_flag(&mut self, kref: KernelSlot) -> KernelResult<()> {
        let entry = self.required_entry(kref)?;
        let updated = ReachableAndVatSlot {
            is_reachable: true,
            ..entry
        };
        let key = self.clist_key(kref);
        self.kernel.kv_mut().set(&key, &updated.to_string())?;
        if !entry.is_reachable && kref.is_object() && !entry.vat_slot.allocated_by_vat {
            let mut counts = self.kernel.get_object_refcount(kref)?;
            counts.reachable += 1;
            self.kernel.set_object_refcount(kref, counts)?;
        }
        Ok(())
    }

    pub fn clear_reachable_flag(&mut self, kref: KernelSlot) -> KernelResult<()> {
        let entry = self.required_entry(kref)?;
        let updated = ReachableAndVatSlot {
            is_reachable: false,
            ..entry
        };
        let key = self.clist_key(kref);
        self.kernel.kv_mut().set(&key, &updated.to_string())?;
        if entry.is_reachable
            && kref.is_object()
            && !entry.vat_slot.allocated_by_vat
            && self.kernel.kernel_object_exists(kref)?
        {
            let mut counts = self.kernel.get_object_refcount(kref)?;
            counts.reachable =
                counts
                    .reachable
                    .checked_sub(1)
                    .ok_or_else(|| KernelError::RefCountUnderflow {
                        kref: kref.to_string(),
                        tag: format!("{}|clear|reachable", self.vat_id),
                    })?;
            self.kernel.set_object_refcount(kref, counts)?;
            if counts.reachable == 0 {
                self.kernel.add_maybe_free_kref(kref);
            }
        }
        Ok(())
    }

    /// Removes both directions of a c-list entry, first dropping
    /// reachability and then the recognizable credit.
    pub fn delete_clist_entry(&mut self, kref: KernelSlot, vat_slot: VatSlot) -> KernelResult<()> {
        let kernel_key = self.clist_key(kref);
        let vat_key = self.clist_key(vat_slot);
        self.required_entry(kref)?;
        log::debug!("Delete mapping {kernel_key}<=>{vat_key}");
        self.clear_reachable_flag(kref)?;
        let options = RefCountOptions {
            is_export: vat_slot.allocated_by_vat,
            only_recognizable: true,
        };
        self.kernel
            .decrement_ref_count(kref, &format!("{}|del|clist", self.vat_id), options)?;
        self.kernel.dec_stat("clistEntries")?;
        let kv = self.kernel.kv_mut();
        kv.delete(&kernel_key)?;
        kv.delete(&vat_key)?;
        Ok(())
    }

    pub fn delete_clist_entries_for_kernel_slots(&mut self, krefs: &[KernelSlot]) -> KernelResult<()> {
        for &kref in krefs {
            let entry = self.required_entry(kref)?;
            self.delete_clist_entry(kref, entry.vat_slot)?;
        }
        Ok(())
    }

    pub fn add_to_transcript(&mut self, item: &str) -> KernelResult<()> {
        let vat = self.vat_id.to_string();
        self.kernel.transcripts_mut().add_item(&vat, item)?;
        Ok(())
    }

    pub fn next_delivery_num(&self) -> KernelResult<u64> {
        let bounds = self
            .kernel
            .transcripts()
            .get_current_span_bounds(&self.vat_id.to_string())?;
        Ok(bounds.end_pos)
    }

    /// Items of the current transcript span from `start_pos` on.
    pub fn get_transcript(&self, start_pos: Option<u64>) -> KernelResult<Vec<String>> {
        Ok(self
            .kernel
            .transcripts()
            .read_span(&self.vat_id.to_string(), start_pos)?)
    }

    pub fn delete_snapshots(&mut self, budget: Option<u64>) -> KernelResult<CleanupProgress> {
        let vat = self.vat_id.to_string();
        Ok(self.kernel.snapshots_mut().delete_vat_snapshots(&vat, budget)?)
    }

    pub fn delete_transcripts(&mut self, budget: Option<u64>) -> KernelResult<CleanupProgress> {
        let vat = self.vat_id.to_string();
        Ok(self
            .kernel
            .transcripts_mut()
            .delete_vat_transcripts(&vat, budget)?)
    }

    pub fn vat_stats(&self) -> KernelResult<VatStats> {
        let count = |counter: &str, first: u64| -> KernelResult<u64> {
            let next: u64 = get_required_parsed(self.kernel.kv(), &self.key(counter))?;
            Ok(next.saturating_sub(first))
        };
        let bounds = self
            .kernel
            .transcripts()
            .get_current_span_bounds(&self.vat_id.to_string())?;
        Ok(VatStats {
            object_count: count("o.nextID", FIRST_VAT_OBJECT_ID)?,
            promise_count: count("p.nextID", FIRST_VAT_PROMISE_ID)?,
            device_count: count("d.nextID", FIRST_VAT_DEVICE_ID)?,
            transcript_count: bounds.end_pos - bounds.start_pos,
        })
    }

    /// One row per c-list entry, in vref key order.
    pub fn dump_state(&self) -> KernelResult<Vec<CListRow>> {
        let prefix = self.key("c.");
        let mut rows = Vec::new();
        for key in enumerate_keys_with_prefix(self.kernel.kv(), &prefix)? {
            let slot = &key[prefix.len()..];
            if slot.starts_with('k') {
                continue;
            }
            let kernel_slot: KernelSlot = get_required_parsed(self.kernel.kv(), &key)?;
            let entry = self.required_entry(kernel_slot)?;
            rows.push(CListRow {
                kernel_slot,
                owner: self.vat_id.to_string(),
                local_slot: slot.to_owned(),
                reachable: Some(entry.is_reachable),
            });
        }
        Ok(rows)
    }
}
