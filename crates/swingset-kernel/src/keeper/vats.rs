//! Vat and device registries, terminated-vat bookkeeping, and the
//! constructors for vat and device table managers.

use super::{FIRST_DEVICE_ID, FIRST_VAT_ID, KernelKeeper, TERMINATED_VATS_KEY};
use crate::{
    allocator::KernelObjectAllocator,
    device_keeper::{DeviceKeeper, FIRST_DEVICE_OBJECT_ID},
    error::{KernelError, KernelResult},
    event::RunQueueEvent,
    ids::{DeviceId, KernelSlot, VatId, VatSlot},
    kv::{get_parsed, get_required_json, get_required_parsed, set_json},
    options::{CleanupBudget, CleanupPolicy, ReapDirt, VatOptions, VatSource},
    vat_keeper::{FIRST_VAT_DEVICE_ID, FIRST_VAT_OBJECT_ID, FIRST_VAT_PROMISE_ID, VatKeeper},
};
use swingset_store::{
    KvStore,
    helpers::{enumerate_keys_with_prefix, enumerate_prefixed_keys, prefix_end},
};

const VAT_NAMES_KEY: &str = "vat.names";
const DYNAMIC_IDS_KEY: &str = "vat.dynamicIDs";
const VAT_NAME_PREFIX: &str = "vat.name.";
const DEVICE_NAMES_KEY: &str = "device.names";
const DEVICE_NAME_PREFIX: &str = "device.name.";

impl<S: KvStore> KernelKeeper<S> {
    pub fn has_vat_with_name(&self, name: &str) -> KernelResult<bool> {
        Ok(self.storage.has(&format!("{VAT_NAME_PREFIX}{name}"))?)
    }

    pub fn get_vat_id_for_name(&self, name: &str) -> KernelResult<VatId> {
        get_parsed(&self.storage, &format!("{VAT_NAME_PREFIX}{name}"))?
            .ok_or_else(|| KernelError::UnknownVat(name.to_owned()))
    }

    pub fn allocate_unused_vat_id(&mut self) -> KernelResult<VatId> {
        let next: u64 = get_required_parsed(&self.storage, "vat.nextID")?;
        self.inc_stat("vats")?;
        self.storage.set("vat.nextID", &(next + 1).to_string())?;
        Ok(VatId(next))
    }

    pub fn allocate_vat_id_for_name_if_needed(&mut self, name: &str) -> KernelResult<VatId> {
        let key = format!("{VAT_NAME_PREFIX}{name}");
        if let Some(vat) = get_parsed(&self.storage, &key)? {
            return Ok(vat);
        }
        let vat = self.allocate_unused_vat_id()?;
        self.storage.set(&key, &vat.to_string())?;
        let mut names: Vec<String> = get_required_json(&self.storage, VAT_NAMES_KEY)?;
        names.push(name.to_owned());
        set_json(&mut self.storage, VAT_NAMES_KEY, &names)?;
        Ok(vat)
    }

    pub fn add_dynamic_vat_id(&mut self, vat: VatId) -> KernelResult<()> {
        let mut ids = self.get_dynamic_vats()?;
        ids.push(vat);
        set_json(&mut self.storage, DYNAMIC_IDS_KEY, &ids)
    }

    pub fn get_dynamic_vats(&self) -> KernelResult<Vec<VatId>> {
        get_required_json(&self.storage, DYNAMIC_IDS_KEY)
    }

    /// `(name, vat)` pairs in name order.
    pub fn get_static_vats(&self) -> KernelResult<Vec<(String, VatId)>> {
        self.named_ids(VAT_NAME_PREFIX)
    }

    pub fn get_devices(&self) -> KernelResult<Vec<(String, DeviceId)>> {
        self.named_ids(DEVICE_NAME_PREFIX)
    }

    fn named_ids<T: std::str::FromStr<Err = KernelError>>(
        &self,
        prefix: &str,
    ) -> KernelResult<Vec<(String, T)>> {
        enumerate_keys_with_prefix(&self.storage, prefix)?
            .into_iter()
            .map(|key| {
                let id = get_required_parsed(&self.storage, &key)?;
                Ok((key[prefix.len()..].to_owned(), id))
            })
            .collect()
    }

    pub fn allocate_upgrade_id(&mut self) -> KernelResult<String> {
        let next: u64 = get_required_parsed(&self.storage, "vat.nextUpgradeID")?;
        self.storage
            .set("vat.nextUpgradeID", &(next + 1).to_string())?;
        Ok(format!("up{next}"))
    }

    /// Removes a vat from whichever registry holds it. The `vats` stat is
    /// only decremented for static vats.
    pub fn delete_vat_id(&mut self, vat: VatId) -> KernelResult<()> {
        let old = self.get_dynamic_vats()?;
        let remaining: Vec<VatId> = old.iter().copied().filter(|v| *v != vat).collect();
        if remaining.len() != old.len() {
            return set_json(&mut self.storage, DYNAMIC_IDS_KEY, &remaining);
        }
        log::debug!("removing static vat {vat}");
        for (name, id) in self.get_static_vats()? {
            if id == vat {
                self.storage.delete(&format!("{VAT_NAME_PREFIX}{name}"))?;
                let mut names: Vec<String> = get_required_json(&self.storage, VAT_NAMES_KEY)?;
                names.retain(|n| *n != name);
                set_json(&mut self.storage, VAT_NAMES_KEY, &names)?;
                break;
            }
        }
        self.dec_stat("vats")
    }

    pub fn mark_vat_as_terminated(&mut self, vat: VatId) -> KernelResult<()> {
        if !self.terminated_vats.contains(&vat) {
            self.terminated_vats.push(vat);
            set_json(&mut self.storage, TERMINATED_VATS_KEY, &self.terminated_vats)?;
        }
        Ok(())
    }

    pub fn get_first_terminated_vat(&self) -> Option<VatId> {
        self.terminated_vats.first().copied()
    }

    pub fn is_vat_terminated(&self, vat: VatId) -> bool {
        self.terminated_vats.contains(&vat)
    }

    pub fn forget_terminated_vat(&mut self, vat: VatId) -> KernelResult<()> {
        self.terminated_vats.retain(|v| *v != vat);
        set_json(&mut self.storage, TERMINATED_VATS_KEY, &self.terminated_vats)
    }

    pub fn next_cleanup_terminated_vat_action(
        &self,
        policy: CleanupPolicy,
    ) -> Option<RunQueueEvent> {
        let budget = match policy {
            CleanupPolicy::Disabled => return None,
            CleanupPolicy::Unlimited => CleanupBudget::unlimited(),
            CleanupPolicy::Budget(budget) => budget,
        };
        let vat_id = self.get_first_terminated_vat()?;
        Some(RunQueueEvent::CleanupTerminatedVat { vat_id, budget })
    }

    /// Writes the allocation counters, empty reap dirt, source and options
    /// of a new vat, and opens its transcript.
    pub fn initialize_vat_state(
        &mut self,
        vat: VatId,
        source: &VatSource,
        options: &VatOptions,
    ) -> KernelResult<()> {
        let kv = &mut self.storage;
        kv.set(&format!("{vat}.o.nextID"), &FIRST_VAT_OBJECT_ID.to_string())?;
        kv.set(&format!("{vat}.p.nextID"), &FIRST_VAT_PROMISE_ID.to_string())?;
        kv.set(&format!("{vat}.d.nextID"), &FIRST_VAT_DEVICE_ID.to_string())?;
        set_json(kv, &format!("{vat}.reapDirt"), &ReapDirt::default())?;
        set_json(kv, &format!("{vat}.source"), source)?;
        set_json(kv, &format!("{vat}.options"), options)?;
        self.storage
            .transcripts_mut()
            .init_transcript(&vat.to_string())?;
        self.vat_states.remove(&vat);
        Ok(())
    }

    pub fn provide_vat_keeper(&mut self, vat: VatId) -> KernelResult<VatKeeper<'_, Self>> {
        VatKeeper::new(self, vat)
    }

    pub fn vat_is_alive(&self, vat: VatId) -> KernelResult<bool> {
        Ok(self.storage.has(&format!("{vat}.o.nextID"))? && !self.terminated_vats.contains(&vat))
    }

    /// Every vat with state, terminated or not, in ID order.
    pub fn get_all_vat_ids(&self) -> KernelResult<Vec<VatId>> {
        let next: u64 = get_required_parsed(&self.storage, "vat.nextID")?;
        let mut vats = Vec::new();
        for id in FIRST_VAT_ID..next {
            let vat = VatId(id);
            if self.storage.has(&format!("{vat}.o.nextID"))? {
                vats.push(vat);
            }
        }
        Ok(vats)
    }

    pub fn get_all_device_ids(&self) -> KernelResult<Vec<DeviceId>> {
        let next: u64 = get_required_parsed(&self.storage, "device.nextID")?;
        let mut devices = Vec::new();
        for id in FIRST_DEVICE_ID..next {
            let device = DeviceId(id);
            if self.storage.has(&format!("{device}.o.nextID"))? {
                devices.push(device);
            }
        }
        Ok(devices)
    }

    pub fn get_device_id_for_name(&self, name: &str) -> KernelResult<Option<DeviceId>> {
        get_parsed(&self.storage, &format!("{DEVICE_NAME_PREFIX}{name}"))
    }

    pub fn allocate_device_id_for_name_if_needed(&mut self, name: &str) -> KernelResult<DeviceId> {
        let key = format!("{DEVICE_NAME_PREFIX}{name}");
        if let Some(device) = get_parsed(&self.storage, &key)? {
            return Ok(device);
        }
        let next: u64 = get_required_parsed(&self.storage, "device.nextID")?;
        self.storage.set("device.nextID", &(next + 1).to_string())?;
        let device = DeviceId(next);
        self.storage.set(&key, &device.to_string())?;
        let mut names: Vec<String> = get_required_json(&self.storage, DEVICE_NAMES_KEY)?;
        names.push(name.to_owned());
        set_json(&mut self.storage, DEVICE_NAMES_KEY, &names)?;
        Ok(device)
    }

    pub fn allocate_device_keeper_if_needed(
        &mut self,
        device: DeviceId,
    ) -> KernelResult<DeviceKeeper<'_, Self>> {
        let counter = format!("{device}.o.nextID");
        if !self.storage.has(&counter)? {
            self.storage
                .set(&counter, &FIRST_DEVICE_OBJECT_ID.to_string())?;
        }
        DeviceKeeper::new(self, device)
    }

    /// Retires the vat's current snapshot and transcript so that exports
    /// omit it. The data stays until cleanup deletes it.
    pub fn remove_vat_from_swing_store_exports(&mut self, vat: VatId) -> KernelResult<()> {
        let vat = vat.to_string();
        self.storage.snapshots_mut().stop_using_last_snapshot(&vat)?;
        self.storage.transcripts_mut().stop_using_transcript(&vat)?;
        Ok(())
    }

    /// Exports that do not survive an upgrade: `o+NN` and `o+vNN/..`, but
    /// neither durable `o+dNN/..` objects nor the root object `o+0`.
    pub fn enumerate_non_durable_object_exports(
        &self,
        vat: VatId,
    ) -> KernelResult<Vec<(KernelSlot, VatSlot)>> {
        let prefix = format!("{vat}.c.");
        let ephemeral_start = format!("{prefix}o+");
        let durable_start = format!("{prefix}o+d");
        let virtual_start = format!("{prefix}o+v");
        let mut keys = enumerate_prefixed_keys(&self.storage, &ephemeral_start, &durable_start)?;
        keys.extend(enumerate_prefixed_keys(
            &self.storage,
            &virtual_start,
            &prefix_end(&virtual_start),
        )?);
        let mut exports = Vec::new();
        for key in keys {
            let vref: VatSlot = key[prefix.len()..].parse()?;
            if vref.to_string() == "o+0" {
                continue;
            }
            let kref: KernelSlot = get_required_parsed(&self.storage, &key)?;
            exports.push((kref, vref));
        }
        Ok(exports)
    }
}
