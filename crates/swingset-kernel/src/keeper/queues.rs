//! Persistent FIFO queues. A queue named `q` keeps its bounds at `q` as
//! `[head,tail]` and its items at `q.<index>`.

use super::KernelKeeper;
use crate::{
    error::KernelResult,
    event::RunQueueEvent,
    kv::{get_json, get_required, get_required_json, set_json},
};
use swingset_store::KvStore;

pub(crate) const RUN_QUEUE: &str = "runQueue";
pub(crate) const ACCEPTANCE_QUEUE: &str = "acceptanceQueue";
const UPGRADE_EVENTS_KEY: &str = "upgradeEvents";

fn length_stat(queue: &str) -> String {
    format!("{queue}Length")
}

impl<S: KvStore> KernelKeeper<S> {
    pub(crate) fn init_queue(&mut self, queue: &str) -> KernelResult<()> {
        set_json(&mut self.storage, queue, &[1u64, 1])
    }

    fn queue_bounds(&self, queue: &str) -> KernelResult<(u64, u64)> {
        let [head, tail]: [u64; 2] = get_required_json(&self.storage, queue)?;
        Ok((head, tail))
    }

    pub(super) fn enqueue(&mut self, queue: &str, item: &RunQueueEvent) -> KernelResult<()> {
        let (head, tail) = self.queue_bounds(queue)?;
        set_json(&mut self.storage, &format!("{queue}.{tail}"), item)?;
        set_json(&mut self.storage, queue, &[head, tail + 1])?;
        self.inc_stat_by(&length_stat(queue), 1)
    }

    pub(super) fn dequeue(&mut self, queue: &str) -> KernelResult<Option<RunQueueEvent>> {
        let (head, tail) = self.queue_bounds(queue)?;
        if head >= tail {
            return Ok(None);
        }
        let item_key = format!("{queue}.{head}");
        let raw = get_required(&self.storage, &item_key)?;
        self.storage.delete(&item_key)?;
        set_json(&mut self.storage, queue, &[head + 1, tail])?;
        self.dec_stat_by(&length_stat(queue), 1)?;
        Ok(Some(serde_json::from_str(&raw)?))
    }

    fn queue_length(&self, queue: &str) -> KernelResult<u64> {
        let (head, tail) = self.queue_bounds(queue)?;
        Ok(tail.saturating_sub(head))
    }

    pub(crate) fn dump_queue(&self, queue: &str) -> KernelResult<Vec<RunQueueEvent>> {
        let (head, tail) = self.queue_bounds(queue)?;
        (head..tail)
            .map(|i| get_required_json(&self.storage, &format!("{queue}.{i}")))
            .collect()
    }

    pub fn add_to_run_queue(&mut self, event: &RunQueueEvent) -> KernelResult<()> {
        self.enqueue(RUN_QUEUE, event)
    }

    pub fn get_run_queue_length(&self) -> KernelResult<u64> {
        self.queue_length(RUN_QUEUE)
    }

    pub fn get_next_run_queue_msg(&mut self) -> KernelResult<Option<RunQueueEvent>> {
        self.dequeue(RUN_QUEUE)
    }

    pub fn add_to_acceptance_queue(&mut self, event: &RunQueueEvent) -> KernelResult<()> {
        self.enqueue(ACCEPTANCE_QUEUE, event)
    }

    pub fn get_acceptance_queue_length(&self) -> KernelResult<u64> {
        self.queue_length(ACCEPTANCE_QUEUE)
    }

    pub fn get_next_acceptance_queue_msg(&mut self) -> KernelResult<Option<RunQueueEvent>> {
        self.dequeue(ACCEPTANCE_QUEUE)
    }

    /// Moves events left behind by a schema upgrade onto the acceptance
    /// queue. Returns how many were moved.
    pub fn inject_queued_upgrade_events(&mut self) -> KernelResult<usize> {
        let Some(events): Option<Vec<RunQueueEvent>> = get_json(&self.storage, UPGRADE_EVENTS_KEY)?
        else {
            return Ok(0);
        };
        for event in &events {
            log::info!("injecting upgrade event {}", serde_json::to_string(event)?);
            self.add_to_acceptance_queue(event)?;
        }
        self.storage.delete(UPGRADE_EVENTS_KEY)?;
        Ok(events.len())
    }
}
