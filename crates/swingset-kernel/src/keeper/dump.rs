//! A debugging snapshot of the whole kernel state.

use super::{FIRST_OBJECT_ID, FIRST_PROMISE_ID, KernelKeeper, KernelPromise, queues};
use crate::{
    error::KernelResult,
    event::{GcAction, RunQueueEvent},
    ids::{KernelSlot, VatId},
    kv::{get_parsed, get_required_json, get_required_parsed},
};
use swingset_store::KvStore;

/// One c-list mapping as seen from its owner. `reachable` is `None` for
/// device c-lists, which carry no flag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CListRow {
    pub kernel_slot: KernelSlot,
    pub owner: String,
    pub local_slot: String,
    pub reachable: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VatTable {
    pub vat_id: VatId,
    pub transcript: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectRow {
    pub kref: KernelSlot,
    /// `None` once the object has been orphaned.
    pub owner: Option<VatId>,
    pub reachable: u64,
    pub recognizable: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelDump {
    pub vat_tables: Vec<VatTable>,
    pub kernel_table: Vec<CListRow>,
    pub promises: Vec<(KernelSlot, KernelPromise)>,
    pub objects: Vec<ObjectRow>,
    pub gc_actions: Vec<GcAction>,
    pub reap_queue: Vec<VatId>,
    pub run_queue: Vec<RunQueueEvent>,
    pub acceptance_queue: Vec<RunQueueEvent>,
}

impl<S: KvStore> KernelKeeper<S> {
    pub fn dump(&mut self) -> KernelResult<KernelDump> {
        let mut vat_tables = Vec::new();
        let mut kernel_table = Vec::new();
        for vat_id in self.get_all_vat_ids()? {
            let keeper = self.provide_vat_keeper(vat_id)?;
            vat_tables.push(VatTable {
                vat_id,
                transcript: keeper.get_transcript(None)?,
            });
            kernel_table.extend(keeper.dump_state()?);
        }
        for device in self.get_all_device_ids()? {
            kernel_table.extend(self.allocate_device_keeper_if_needed(device)?.dump_state()?);
        }
        kernel_table.sort_by(|a, b| {
            (a.kernel_slot, &a.owner, &a.local_slot).cmp(&(b.kernel_slot, &b.owner, &b.local_slot))
        });

        let mut promises = Vec::new();
        let next_promise: u64 = get_required_parsed(&self.storage, "kp.nextID")?;
        for id in FIRST_PROMISE_ID..next_promise {
            let kpid = KernelSlot::promise(id);
            if self.has_kernel_promise(kpid)? {
                promises.push((kpid, self.get_kernel_promise(kpid)?));
            }
        }

        let mut objects = Vec::new();
        let next_object: u64 = get_required_parsed(&self.storage, "ko.nextID")?;
        for id in FIRST_OBJECT_ID..next_object {
            let kref = KernelSlot::object(id);
            if self.kernel_object_exists(kref)? {
                let counts = self.get_object_refcount(kref)?;
                objects.push(ObjectRow {
                    kref,
                    owner: get_parsed(&self.storage, &format!("{kref}.owner"))?,
                    reachable: counts.reachable,
                    recognizable: counts.recognizable,
                });
            }
        }

        Ok(KernelDump {
            vat_tables,
            kernel_table,
            promises,
            objects,
            gc_actions: self.get_gc_actions()?.into_iter().collect(),
            reap_queue: get_required_json(&self.storage, "reapQueue")?,
            run_queue: self.dump_queue(queues::RUN_QUEUE)?,
            acceptance_queue: self.dump_queue(queues::ACCEPTANCE_QUEUE)?,
        })
    }
}
