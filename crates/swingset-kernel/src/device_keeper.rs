//! The per-device table manager. Devices export only device nodes and
//! import only objects; neither side is garbage collected.

use crate::{
    allocator::{KernelObjectAllocator, RefCountOptions},
    error::{KernelError, KernelResult},
    ids::{DeviceId, KernelSlot, SlotKind, VatSlot},
    keeper::CListRow,
    kv::{get_json, get_required_parsed, set_json},
};
use serde_json::Value;
use swingset_store::helpers::enumerate_keys_with_prefix;

pub const FIRST_DEVICE_OBJECT_ID: u64 = 10;

pub struct DeviceKeeper<'a, K: KernelObjectAllocator + ?Sized> {
    kernel: &'a mut K,
    device_id: DeviceId,
}

impl<'a, K: KernelObjectAllocator + ?Sized> DeviceKeeper<'a, K> {
    pub fn new(kernel: &'a mut K, device_id: DeviceId) -> KernelResult<Self> {
        if !kernel.kv().has(&format!("{device_id}.o.nextID"))? {
            return Err(KernelError::DeviceNotInitialized(device_id.to_string()));
        }
        Ok(Self { kernel, device_id })
    }

    pub fn device_id(&self) -> DeviceId {
        self.device_id
    }

    fn clist_key(&self, slot: impl std::fmt::Display) -> String {
        format!("{}.c.{slot}", self.device_id)
    }

    fn illegal(&self, slot: impl std::fmt::Display, reason: &'static str) -> KernelError {
        KernelError::IllegalMapping {
            owner: self.device_id.to_string(),
            slot: slot.to_string(),
            reason,
        }
    }

    pub fn map_device_slot_to_kernel_slot(&mut self, dev_slot: VatSlot) -> KernelResult<KernelSlot> {
        let dev_key = self.clist_key(dev_slot);
        if !self.kernel.kv().has(&dev_key)? {
            if !dev_slot.allocated_by_vat {
                return Err(KernelError::UnknownCListEntry {
                    owner: self.device_id.to_string(),
                    slot: dev_slot.to_string(),
                });
            }
            let kref = match dev_slot.kind {
                SlotKind::Device => self.kernel.add_kernel_device_node(self.device_id)?,
                SlotKind::Object => return Err(self.illegal(dev_slot, "devices cannot export objects")),
                SlotKind::Promise => {
                    return Err(self.illegal(dev_slot, "devices cannot export promises"));
                }
            };
            let kernel_key = self.clist_key(kref);
            let kv = self.kernel.kv_mut();
            kv.set(&kernel_key, &dev_slot.to_string())?;
            kv.set(&dev_key, &kref.to_string())?;
            log::debug!("Add mapping {kernel_key}<=>{dev_key}");
        }
        get_required_parsed(self.kernel.kv(), &dev_key)
    }

    pub fn map_kernel_slot_to_device_slot(&mut self, kref: KernelSlot) -> KernelResult<VatSlot> {
        let kernel_key = self.clist_key(kref);
        if !self.kernel.kv().has(&kernel_key)? {
            match kref.kind {
                SlotKind::Object => {}
                SlotKind::Device => {
                    return Err(self.illegal(kref, "devices cannot import other device nodes"));
                }
                SlotKind::Promise => return Err(self.illegal(kref, "devices cannot import promises")),
            }
            let counter_key = format!("{}.o.nextID", self.device_id);
            let id: u64 = get_required_parsed(self.kernel.kv(), &counter_key)?;
            self.kernel
                .kv_mut()
                .set(&counter_key, &(id + 1).to_string())?;
            self.kernel.increment_ref_count(
                kref,
                &format!("{}|dk|clist", self.device_id),
                RefCountOptions::default(),
            )?;
            let dev_slot = VatSlot::new(kref.kind, false, id);
            let dev_key = self.clist_key(dev_slot);
            let kv = self.kernel.kv_mut();
            kv.set(&dev_key, &kref.to_string())?;
            kv.set(&kernel_key, &dev_slot.to_string())?;
            log::debug!("Add mapping {kernel_key}<=>{dev_key}");
        }
        get_required_parsed(self.kernel.kv(), &kernel_key)
    }

    /// Opaque state a device persists between invocations.
    pub fn get_device_state(&self) -> KernelResult<Option<Value>> {
        get_json(self.kernel.kv(), &format!("{}.deviceState", self.device_id))
    }

    pub fn set_device_state(&mut self, state: &Value) -> KernelResult<()> {
        let key = format!("{}.deviceState", self.device_id);
        set_json(self.kernel.kv_mut(), &key, state)
    }

    pub fn dump_state(&self) -> KernelResult<Vec<CListRow>> {
        let prefix = format!("{}.c.", self.device_id);
        let mut rows = Vec::new();
        for key in enumerate_keys_with_prefix(self.kernel.kv(), &prefix)? {
            let slot = &key[prefix.len()..];
            if slot.starts_with('k') {
                continue;
            }
            rows.push(CListRow {
                kernel_slot: get_required_parsed(self.kernel.kv(), &key)?,
                owner: self.device_id.to_string(),
                local_slot: slot.to_owned(),
                reachable: None,
            });
        }
        Ok(rows)
    }
}
