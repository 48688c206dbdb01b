//! Turns the pending GC action set into run-queue deliveries.

use super::KernelKeeper;
use crate::{
    error::KernelResult,
    event::{GcAction, GcActionKind, RunQueueEvent, sort_krefs},
};
use swingset_store::KvStore;

const PRIORITY: [GcActionKind; 3] = [
    GcActionKind::DropExport,
    GcActionKind::RetireExport,
    GcActionKind::RetireImport,
];

impl<S: KvStore> KernelKeeper<S> {
    /// Whether `action` still describes something the vat needs to hear.
    fn gc_action_is_live(&self, action: &GcAction) -> KernelResult<bool> {
        let (vat_id, kind, kref) = (action.vat_id, action.kind, action.kref);
        if self.is_vat_terminated(vat_id) {
            return Ok(false);
        }
        let entry = self.get_reachable_and_vat_slot(vat_id, kref)?;
        Ok(match kind {
            GcActionKind::DropExport => {
                self.kernel_object_exists(kref)?
                    && self.get_object_refcount(kref)?.reachable == 0
                    && entry.is_some_and(|e| e.is_reachable)
            }
            GcActionKind::RetireExport => {
                self.kernel_object_exists(kref)?
                    && self.get_object_refcount(kref)?.recognizable == 0
                    && entry.is_some()
            }
            GcActionKind::RetireImport => entry.is_some(),
        })
    }

    /// Returns at most one `dropExports`, `retireExports` or
    /// `retireImports` event. Vats are served in vat-ID string order; within
    /// a vat drops go before export retirements, which go before import
    /// retirements. Actions overtaken by later state changes are discarded
    /// along the way. The remaining set is persisted.
    pub fn next_gc_action_event(&mut self) -> KernelResult<Option<RunQueueEvent>> {
        let mut actions = self.get_gc_actions()?;
        let mut updated = false;

        let mut vats: Vec<_> = actions.iter().map(|a| a.vat_id).collect();
        vats.sort_by_cached_key(|v| v.to_string());
        vats.dedup();

        for vat_id in vats {
            for kind in PRIORITY {
                let candidates: Vec<GcAction> = actions
                    .iter()
                    .filter(|a| a.vat_id == vat_id && a.kind == kind)
                    .cloned()
                    .collect();
                let mut krefs = Vec::new();
                for action in candidates {
                    if self.gc_action_is_live(&action)? {
                        krefs.push(action.kref);
                    }
                    actions.remove(&action);
                    updated = true;
                }
                if krefs.is_empty() {
                    continue;
                }
                sort_krefs(&mut krefs);
                self.set_gc_actions(&actions)?;
                let event = match kind {
                    GcActionKind::DropExport => RunQueueEvent::DropExports { vat_id, krefs },
                    GcActionKind::RetireExport => RunQueueEvent::RetireExports { vat_id, krefs },
                    GcActionKind::RetireImport => RunQueueEvent::RetireImports { vat_id, krefs },
                };
                return Ok(Some(event));
            }
        }
        if updated {
            self.set_gc_actions(&actions)?;
        }
        Ok(None)
    }
}
