//! Kernel promise table: the one-way unresolved → fulfilled/rejected state
//! machine, per-promise message queues, deciders and subscribers.

use super::{KernelKeeper, objects::comma_split, queues::ACCEPTANCE_QUEUE};
use crate::{
    allocator::{KernelObjectAllocator, RefCountOptions},
    error::{KernelError, KernelResult},
    event::{CapData, Message, RunQueueEvent},
    ids::{KernelSlot, VatId},
    kv::{bump_counter, get_required, get_required_parsed, parse_value},
};
use std::{fmt, str::FromStr};
use swingset_store::{
    KvStore,
    helpers::{delete_prefixed_keys, enumerate_keys_with_prefix, get_prefixed_values},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromiseState {
    Unresolved,
    Fulfilled,
    Rejected,
}

impl PromiseState {
    pub fn as_str(self) -> &'static str {
        match self {
            PromiseState::Unresolved => "unresolved",
            PromiseState::Fulfilled => "fulfilled",
            PromiseState::Rejected => "rejected",
        }
    }

    fn stat(self) -> &'static str {
        match self {
            PromiseState::Unresolved => "kpUnresolved",
            PromiseState::Fulfilled => "kpFulfilled",
            PromiseState::Rejected => "kpRejected",
        }
    }
}

impl fmt::Display for PromiseState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the kernel should do if the promise is rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PromisePolicy {
    #[default]
    Ignore,
    LogAlways,
    LogFailure,
    Panic,
}

impl PromisePolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            PromisePolicy::Ignore => "ignore",
            PromisePolicy::LogAlways => "logAlways",
            PromisePolicy::LogFailure => "logFailure",
            PromisePolicy::Panic => "panic",
        }
    }
}

impl FromStr for PromisePolicy {
    type Err = KernelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ignore" => Ok(PromisePolicy::Ignore),
            "logAlways" => Ok(PromisePolicy::LogAlways),
            "logFailure" => Ok(PromisePolicy::LogFailure),
            "panic" => Ok(PromisePolicy::Panic),
            other => Err(KernelError::malformed("policy", other)),
        }
    }
}

/// A decoded promise record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KernelPromise {
    Unresolved {
        ref_count: u64,
        decider: Option<VatId>,
        policy: PromisePolicy,
        subscribers: Vec<VatId>,
        queue: Vec<Message>,
    },
    Settled {
        rejected: bool,
        ref_count: u64,
        data: CapData,
    },
}

impl KernelPromise {
    pub fn state(&self) -> PromiseState {
        match self {
            KernelPromise::Unresolved { .. } => PromiseState::Unresolved,
            KernelPromise::Settled { rejected: true, .. } => PromiseState::Rejected,
            KernelPromise::Settled { rejected: false, .. } => PromiseState::Fulfilled,
        }
    }

    pub fn ref_count(&self) -> u64 {
        match self {
            KernelPromise::Unresolved { ref_count, .. } | KernelPromise::Settled { ref_count, .. } => {
                *ref_count
            }
        }
    }

    pub fn decider(&self) -> Option<VatId> {
        match self {
            KernelPromise::Unresolved { decider, .. } => *decider,
            KernelPromise::Settled { .. } => None,
        }
    }

    /// Resolution data; `None` while unresolved.
    pub fn data(&self) -> Option<&CapData> {
        match self {
            KernelPromise::Settled { data, .. } => Some(data),
            KernelPromise::Unresolved { .. } => None,
        }
    }
}

fn insist_promise(kpid: KernelSlot) -> KernelResult<()> {
    if kpid.is_promise() {
        Ok(())
    } else {
        Err(KernelError::InvalidSlot(kpid.to_string()))
    }
}

fn split_parsed<T: FromStr>(key: &str, raw: &str) -> KernelResult<Vec<T>> {
    comma_split(raw).map(|part| parse_value(key, part)).collect()
}

impl<S: KvStore> KernelKeeper<S> {
    pub fn add_kernel_promise(&mut self, policy: PromisePolicy) -> KernelResult<KernelSlot> {
        let kpid = KernelSlot::promise(bump_counter(&mut self.storage, "kp.nextID")?);
        let kv = &mut self.storage;
        kv.set(&format!("{kpid}.state"), PromiseState::Unresolved.as_str())?;
        kv.set(&format!("{kpid}.subscribers"), "")?;
        kv.set(&format!("{kpid}.queue.nextID"), "0")?;
        kv.set(&format!("{kpid}.refCount"), "0")?;
        kv.set(&format!("{kpid}.decider"), "")?;
        if policy != PromisePolicy::Ignore {
            kv.set(&format!("{kpid}.policy"), policy.as_str())?;
        }
        self.inc_stat("kernelPromises")?;
        self.inc_stat("kpUnresolved")?;
        Ok(kpid)
    }

    pub fn add_kernel_promise_for_vat(&mut self, decider: VatId) -> KernelResult<KernelSlot> {
        let kpid = self.add_kernel_promise(PromisePolicy::Ignore)?;
        log::debug!("Adding kernel promise {kpid} for {decider}");
        self.storage
            .set(&format!("{kpid}.decider"), &decider.to_string())?;
        Ok(kpid)
    }

    pub fn get_kernel_promise(&self, kpid: KernelSlot) -> KernelResult<KernelPromise> {
        insist_promise(kpid)?;
        let kv = &self.storage;
        let state = get_required(kv, &format!("{kpid}.state"))?;
        let ref_count: u64 = get_required_parsed(kv, &format!("{kpid}.refCount"))?;
        match state.as_str() {
            "unresolved" => {
                let decider = match kv.get(&format!("{kpid}.decider"))? {
                    Some(d) if !d.is_empty() => Some(parse_value(&format!("{kpid}.decider"), &d)?),
                    _ => None,
                };
                let policy = match kv.get(&format!("{kpid}.policy"))? {
                    Some(p) if !p.is_empty() => p.parse()?,
                    _ => PromisePolicy::Ignore,
                };
                let subscribers_key = format!("{kpid}.subscribers");
                let subscribers = split_parsed(&subscribers_key, &get_required(kv, &subscribers_key)?)?;
                let queue = get_prefixed_values(kv, &format!("{kpid}.queue."), 0)?
                    .iter()
                    .map(|raw| serde_json::from_str(raw))
                    .collect::<Result<_, _>>()?;
                Ok(KernelPromise::Unresolved {
                    ref_count,
                    decider,
                    policy,
                    subscribers,
                    queue,
                })
            }
            "fulfilled" | "rejected" => {
                let body = get_required(kv, &format!("{kpid}.data.body"))?;
                let slots_key = format!("{kpid}.data.slots");
                let slots = split_parsed(&slots_key, &get_required(kv, &slots_key)?)?;
                Ok(KernelPromise::Settled {
                    rejected: state == "rejected",
                    ref_count,
                    data: CapData { body, slots },
                })
            }
            _ => Err(KernelError::UnknownPromiseState {
                kpid: kpid.to_string(),
                state,
            }),
        }
    }

    /// The promise, provided it is unresolved and decided by
    /// `expected_decider` (or by the kernel when `None`).
    pub fn get_resolveable_promise(
        &self,
        kpid: KernelSlot,
        expected_decider: Option<VatId>,
    ) -> KernelResult<KernelPromise> {
        let promise = self.get_kernel_promise(kpid)?;
        if promise.state() != PromiseState::Unresolved {
            return Err(KernelError::PromiseNotUnresolved(kpid.to_string()));
        }
        let found = promise.decider();
        if found != expected_decider {
            let render = |v: Option<VatId>| v.map_or_else(|| "the kernel".to_owned(), |v| v.to_string());
            return Err(KernelError::DeciderMismatch {
                kpid: kpid.to_string(),
                expected: render(expected_decider),
                found: render(found),
            });
        }
        Ok(promise)
    }

    pub fn has_kernel_promise(&self, kpid: KernelSlot) -> KernelResult<bool> {
        insist_promise(kpid)?;
        Ok(self.storage.has(&format!("{kpid}.state"))?)
    }

    fn delete_kernel_promise_state(&mut self, kpid: KernelSlot) -> KernelResult<()> {
        let kv = &mut self.storage;
        for field in ["state", "decider", "subscribers", "policy"] {
            kv.delete(&format!("{kpid}.{field}"))?;
        }
        delete_prefixed_keys(kv, &format!("{kpid}.queue."), 0)?;
        for field in ["queue.nextID", "data.body", "data.slots"] {
            kv.delete(&format!("{kpid}.{field}"))?;
        }
        Ok(())
    }

    pub fn delete_kernel_promise(&mut self, kpid: KernelSlot) -> KernelResult<()> {
        let state = self.get_required(&format!("{kpid}.state"))?;
        let state = match state.as_str() {
            "unresolved" => PromiseState::Unresolved,
            "fulfilled" => PromiseState::Fulfilled,
            "rejected" => PromiseState::Rejected,
            _ => {
                return Err(KernelError::UnknownPromiseState {
                    kpid: kpid.to_string(),
                    state,
                });
            }
        };
        self.dec_stat(state.stat())?;
        self.dec_stat("kernelPromises")?;
        self.delete_kernel_promise_state(kpid)?;
        self.storage.delete(&format!("{kpid}.refCount"))?;
        Ok(())
    }

    /// Moves every message queued on the promise to the acceptance queue as
    /// a `send` to the promise itself. Refcounts held by the messages move
    /// with them.
    pub fn requeue_kernel_promise(&mut self, kpid: KernelSlot) -> KernelResult<()> {
        let KernelPromise::Unresolved { queue, .. } = self.get_kernel_promise(kpid)? else {
            return Err(KernelError::PromiseNotUnresolved(kpid.to_string()));
        };
        let count = queue.len() as i64;
        for msg in queue {
            self.enqueue(ACCEPTANCE_QUEUE, &RunQueueEvent::Send { target: kpid, msg })?;
        }
        self.dec_stat_by("promiseQueuesLength", count)?;
        delete_prefixed_keys(&mut self.storage, &format!("{kpid}.queue."), 0)?;
        self.storage.set(&format!("{kpid}.queue.nextID"), "0")?;
        Ok(())
    }

    pub fn resolve_kernel_promise(
        &mut self,
        kpid: KernelSlot,
        rejected: bool,
        data: &CapData,
    ) -> KernelResult<()> {
        insist_promise(kpid)?;
        if self.get_kernel_promise(kpid)?.state() != PromiseState::Unresolved {
            return Err(KernelError::PromiseNotUnresolved(kpid.to_string()));
        }
        for (idx, slot) in data.slots.iter().enumerate() {
            self.increment_ref_count(*slot, &format!("resolve|{kpid}|s{idx}"), RefCountOptions::default())?;
        }
        self.requeue_kernel_promise(kpid)?;
        self.delete_kernel_promise_state(kpid)?;
        self.dec_stat("kpUnresolved")?;

        let state = if rejected {
            PromiseState::Rejected
        } else {
            PromiseState::Fulfilled
        };
        self.inc_stat(state.stat())?;
        let kv = &mut self.storage;
        kv.set(&format!("{kpid}.state"), state.as_str())?;
        kv.set(&format!("{kpid}.data.body"), &data.body)?;
        let slots: Vec<String> = data.slots.iter().map(ToString::to_string).collect();
        kv.set(&format!("{kpid}.data.slots"), &slots.join(","))?;
        Ok(())
    }

    /// Queues `msg` on an unresolved promise. The queued message keeps its
    /// existing refcounts.
    pub fn add_message_to_promise_queue(&mut self, kpid: KernelSlot, msg: &Message) -> KernelResult<()> {
        let promise = self.get_kernel_promise(kpid)?;
        if promise.state() != PromiseState::Unresolved {
            return Err(KernelError::PromiseNotUnresolved(kpid.to_string()));
        }
        let next_id = bump_counter(&mut self.storage, &format!("{kpid}.queue.nextID"))?;
        let raw = serde_json::to_string(msg)?;
        self.storage.set(&format!("{kpid}.queue.{next_id}"), &raw)?;
        self.inc_stat("promiseQueuesLength")
    }

    pub fn set_decider(&mut self, kpid: KernelSlot, decider: VatId) -> KernelResult<()> {
        self.get_resolveable_promise(kpid, None)?;
        self.storage
            .set(&format!("{kpid}.decider"), &decider.to_string())?;
        Ok(())
    }

    pub fn clear_decider(&mut self, kpid: KernelSlot) -> KernelResult<()> {
        let promise = self.get_kernel_promise(kpid)?;
        if promise.state() != PromiseState::Unresolved {
            return Err(KernelError::PromiseNotUnresolved(kpid.to_string()));
        }
        if promise.decider().is_none() {
            return Err(KernelError::DeciderMismatch {
                kpid: kpid.to_string(),
                expected: "a vat".to_owned(),
                found: "the kernel".to_owned(),
            });
        }
        self.storage.set(&format!("{kpid}.decider"), "")?;
        Ok(())
    }

    /// Unresolved promises in `vat`'s c-list that `vat` decides, in c-list
    /// key order.
    pub fn enumerate_promises_by_decider(&self, vat: VatId) -> KernelResult<Vec<KernelSlot>> {
        let mut decided = Vec::new();
        for key in enumerate_keys_with_prefix(&self.storage, &format!("{vat}.c.p"))? {
            let kpid: KernelSlot = get_required_parsed(&self.storage, &key)?;
            let promise = self.get_kernel_promise(kpid)?;
            if promise.state() == PromiseState::Unresolved && promise.decider() == Some(vat) {
                decided.push(kpid);
            }
        }
        Ok(decided)
    }

    pub fn add_subscriber_to_promise(&mut self, kpid: KernelSlot, vat: VatId) -> KernelResult<()> {
        let KernelPromise::Unresolved { mut subscribers, .. } = self.get_kernel_promise(kpid)? else {
            return Err(KernelError::PromiseNotUnresolved(kpid.to_string()));
        };
        if !subscribers.contains(&vat) {
            subscribers.push(vat);
        }
        let mut rendered: Vec<String> = subscribers.iter().map(ToString::to_string).collect();
        rendered.sort();
        self.storage
            .set(&format!("{kpid}.subscribers"), &rendered.join(","))?;
        Ok(())
    }
}
