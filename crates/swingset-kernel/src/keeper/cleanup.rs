//! Slow deletion of a terminated vat's state.

use super::KernelKeeper;
use crate::{
    error::KernelResult,
    ids::{KernelSlot, VatId, VatSlot},
    kv::get_required_parsed,
    options::CleanupBudget,
};
use swingset_store::{KvStore, helpers::PrefixCursor};

/// Items removed by one call, per phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CleanupWork {
    pub exports: u64,
    pub imports: u64,
    pub kv: u64,
    pub snapshots: u64,
    pub transcripts: u64,
}

impl CleanupWork {
    pub fn total(&self) -> u64 {
        self.exports + self.imports + self.kv + self.snapshots + self.transcripts
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CleanupOutcome {
    /// When true the vat ID can be deleted; otherwise call again.
    pub done: bool,
    pub work: CleanupWork,
}

/// Counts one unit against `remaining` and reports whether the phase's
/// budget is spent. Every phase does at least one unit of work.
fn spend(remaining: &mut Option<u64>, units: u64) -> bool {
    match remaining {
        Some(n) => {
            *n = n.saturating_sub(units);
            *n == 0
        }
        None => false,
    }
}

impl<S: KvStore> KernelKeeper<S> {
    /// Deletes a terminated vat's state in five phases: exported objects are
    /// orphaned, imports are dropped and retired, every `v<N>.` key is
    /// deleted, then snapshots and transcript spans. Each phase stops as
    /// soon as its share of `budget` is used up and the call returns
    /// `done: false`; the next call resumes where this one stopped.
    ///
    /// Keys are visited in ascii order, so `o+` exports come before `o-`
    /// imports and the resulting side effects are deterministic.
    pub fn cleanup_after_terminated_vat(
        &mut self,
        vat: VatId,
        budget: &CleanupBudget,
    ) -> KernelResult<CleanupOutcome> {
        let mut work = CleanupWork::default();
        let not_done = |work| Ok(CleanupOutcome { done: false, work });
        let clist_prefix = format!("{vat}.c.");

        let mut remaining = budget.exports_limit();
        let mut cursor = PrefixCursor::prefixed(format!("{clist_prefix}o+"));
        while let Some(key) = cursor.next(&self.storage)? {
            let kref: KernelSlot = get_required_parsed(&self.storage, &key)?;
            // Also deletes both c-list keys and queues the kref for GC.
            self.orphan_kernel_object(kref, vat)?;
            work.exports += 1;
            if spend(&mut remaining, 1) {
                return not_done(work);
            }
        }

        let mut remaining = budget.imports_limit();
        let mut cursor = PrefixCursor::prefixed(format!("{clist_prefix}o-"));
        while let Some(key) = cursor.next(&self.storage)? {
            let kref: KernelSlot = get_required_parsed(&self.storage, &key)?;
            let vref: VatSlot = key[clist_prefix.len()..].parse()?;
            self.provide_vat_keeper(vat)?.delete_clist_entry(kref, vref)?;
            work.imports += 1;
            if spend(&mut remaining, 1) {
                return not_done(work);
            }
        }

        // Promises this vat decided were already rejected by the caller,
        // via enumerate_promises_by_decider.
        let mut remaining = budget.kv_limit();
        let mut cursor = PrefixCursor::prefixed(format!("{vat}."));
        while let Some(key) = cursor.next(&self.storage)? {
            self.storage.delete(&key)?;
            work.kv += 1;
            if spend(&mut remaining, 1) {
                return not_done(work);
            }
        }
        self.evict_vat_keeper(vat);

        let vat_name = vat.to_string();
        let mut remaining = budget.snapshots_limit();
        let progress = self
            .storage
            .snapshots_mut()
            .delete_vat_snapshots(&vat_name, remaining)?;
        work.snapshots += progress.cleanups;
        if spend(&mut remaining, progress.cleanups) {
            return not_done(work);
        }

        let progress = self
            .storage
            .transcripts_mut()
            .delete_vat_transcripts(&vat_name, budget.transcripts_limit())?;
        work.transcripts += progress.cleanups;
        log::debug!("cleanup of {vat}: {work:?} done={}", progress.done);
        Ok(CleanupOutcome {
            done: progress.done,
            work,
        })
    }
}
