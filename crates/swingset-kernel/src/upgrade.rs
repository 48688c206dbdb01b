//! Forward migration of a persisted kernel DB to the current schema.
//!
//! Schema history:
//!
//! * v0: no `version` key; `initialized` marks a populated DB. Reaping is
//!   driven by `kernel.defaultReapInterval` and per-vat
//!   `v<N>.reapInterval` / `v<N>.reapCountdown`.
//! * v1: `version` replaces `initialized`; reap intervals become the
//!   `kernel.defaultReapDirtThreshold` record, per-vat `v<N>.reapDirt`, and
//!   an `options.reapDirtThreshold` override.
//! * v2: adds `vats.terminated`.
//! * v3: stashes `notify` events for settled promises that live vats still
//!   hold in their c-lists without a pending notification (bug #9039). The
//!   host injects them with
//!   [`KernelKeeper::inject_queued_upgrade_events`](crate::KernelKeeper::inject_queued_upgrade_events).

use crate::{
    error::{KernelError, KernelResult},
    event::RunQueueEvent,
    ids::{KernelSlot, VatId},
    keeper::{CURRENT_SCHEMA_VERSION, stored_version},
    kv::{get_json, get_required, get_required_json, get_required_parsed, set_json},
    options::DEFAULT_GC_KREFS_PER_BOYD,
};
use serde_json::{Map, Value, json};
use std::collections::{BTreeMap, BTreeSet};
use swingset_store::{KvStore, helpers::enumerate_keys_with_prefix};

const NEVER: &str = "never";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpgradeOutcome {
    /// True when anything was written. The caller must commit.
    pub modified: bool,
}

fn migration_error(msg: impl Into<String>) -> KernelError {
    KernelError::Migration(msg.into())
}

fn static_vats<S: KvStore + ?Sized>(kv: &S) -> KernelResult<Vec<VatId>> {
    enumerate_keys_with_prefix(kv, "vat.name.")?
        .iter()
        .map(|key| get_required_parsed(kv, key))
        .collect()
}

fn dynamic_vats<S: KvStore + ?Sized>(kv: &S) -> KernelResult<Vec<VatId>> {
    get_required_json(kv, "vat.dynamicIDs")
}

fn parse_interval(key: &str, raw: &str) -> KernelResult<u64> {
    raw.parse()
        .map_err(|_| migration_error(format!("{key}: '{raw}' is not a reap interval")))
}

/// Upgrades `kv` one schema version at a time until it reaches the current
/// version. Safe to call on every start: an up-to-date DB is left untouched
/// and reported as unmodified.
pub fn upgrade_swingset<S: KvStore + ?Sized>(kv: &mut S) -> KernelResult<UpgradeOutcome> {
    let mut version = stored_version(kv)?;
    if version > CURRENT_SCHEMA_VERSION {
        return Err(KernelError::UnknownSchemaVersion(version));
    }
    if version == 0 && !kv.has("initialized")? {
        return Err(KernelError::Uninitialized);
    }
    let mut modified = false;

    if version < 1 {
        log::info!("upgrading kernel DB from v0 to v1");
        upgrade_v0_to_v1(kv)?;
        version = 1;
        modified = true;
    }

    if version < 2 {
        log::info!("upgrading kernel DB from v1 to v2");
        if kv.has("vats.terminated")? {
            return Err(migration_error("v1 DB already has vats.terminated"));
        }
        kv.set("vats.terminated", "[]")?;
        version = 2;
        modified = true;
    }

    if version < 3 {
        log::info!("starting remediation of bug #9039");
        let injected = remediate_unnotified_promises(kv)?;
        log::info!("#9039 remediation complete, {injected} notifies to inject");
        version = 3;
        modified = true;
    }

    if modified {
        kv.set("version", &version.to_string())?;
    }
    Ok(UpgradeOutcome { modified })
}

fn upgrade_v0_to_v1<S: KvStore + ?Sized>(kv: &mut S) -> KernelResult<()> {
    if kv.has("kernel.defaultReapDirtThreshold")? {
        return Err(migration_error(
            "v0 DB already has kernel.defaultReapDirtThreshold",
        ));
    }
    kv.delete("initialized")?;

    let old_default = get_required(kv, "kernel.defaultReapInterval")?;
    kv.delete("kernel.defaultReapInterval")?;
    let default_deliveries = if old_default == NEVER {
        None
    } else {
        Some(parse_interval("kernel.defaultReapInterval", &old_default)?)
    };
    let default_threshold = match default_deliveries {
        Some(deliveries) => json!({
            "deliveries": deliveries,
            "gcKrefs": DEFAULT_GC_KREFS_PER_BOYD,
            "computrons": NEVER,
        }),
        None => json!({ "deliveries": NEVER, "gcKrefs": NEVER, "computrons": NEVER }),
    };
    set_json(kv, "kernel.defaultReapDirtThreshold", &default_threshold)?;

    let mut vats = static_vats(kv)?;
    vats.extend(dynamic_vats(kv)?);
    for vat in vats {
        let interval_key = format!("{vat}.reapInterval");
        let countdown_key = format!("{vat}.reapCountdown");
        let options_key = format!("{vat}.options");
        let dirt_key = format!("{vat}.reapDirt");
        let interval = get_required(kv, &interval_key)?;
        let countdown = get_required(kv, &countdown_key)?;
        if kv.has(&dirt_key)? {
            return Err(migration_error(format!("v0 DB already has {dirt_key}")));
        }
        if (interval == NEVER) != (countdown == NEVER) {
            return Err(migration_error(format!(
                "{vat} reapInterval '{interval}' disagrees with reapCountdown '{countdown}'"
            )));
        }

        let mut dirt = Map::new();
        let mut threshold = Map::new();
        if interval == NEVER {
            threshold.insert("never".to_owned(), Value::Bool(true));
        } else {
            let interval = parse_interval(&interval_key, &interval)?;
            let countdown = parse_interval(&countdown_key, &countdown)?;
            dirt.insert(
                "deliveries".to_owned(),
                json!(interval.saturating_sub(countdown)),
            );
            if default_deliveries != Some(interval) {
                threshold.insert("deliveries".to_owned(), json!(interval));
            }
        }
        kv.delete(&interval_key)?;
        kv.delete(&countdown_key)?;
        set_json(kv, &dirt_key, &dirt)?;

        let mut options: Map<String, Value> = get_required_json(kv, &options_key)?;
        options.remove("reapInterval");
        options.insert("reapDirtThreshold".to_owned(), Value::Object(threshold));
        set_json(kv, &options_key, &options)?;
    }
    Ok(())
}

/// `(kpid, vat)` pairs already covered by a queued `notify`.
fn pending_notifies<S: KvStore + ?Sized>(
    kv: &S,
) -> KernelResult<BTreeSet<(String, String)>> {
    let mut pending = BTreeSet::new();
    for queue in ["runQueue", "acceptanceQueue"] {
        let [head, tail]: [u64; 2] = get_required_json(kv, queue)?;
        for i in head..tail {
            let item: Value = get_required_json(kv, &format!("{queue}.{i}"))?;
            if item["type"] != "notify" {
                continue;
            }
            match (item["vatID"].as_str(), item["kpid"].as_str()) {
                (Some(vat), Some(kpid)) => {
                    pending.insert((kpid.to_owned(), vat.to_owned()));
                }
                _ => return Err(migration_error(format!("malformed notify at {queue}.{i}"))),
            }
        }
    }
    Ok(pending)
}

/// Appends a `notify` to `upgradeEvents` for every settled promise a live
/// vat still imports with no notification on its way. Returns how many were
/// added.
fn remediate_unnotified_promises<S: KvStore + ?Sized>(kv: &mut S) -> KernelResult<usize> {
    let terminated: Vec<VatId> = get_required_json(kv, "vats.terminated")?;
    let mut live = static_vats(kv)?;
    live.extend(dynamic_vats(kv)?);
    live.retain(|vat| !terminated.contains(vat));

    let pending = pending_notifies(kv)?;
    log::info!("  - {} pending notifies", pending.len());

    let mut settled_cache: BTreeMap<String, bool> = BTreeMap::new();
    let mut events = Vec::new();
    for vat in live {
        let prefix = format!("{vat}.c.");
        for key in enumerate_keys_with_prefix(kv, &format!("{prefix}kp"))? {
            let kpid = &key[prefix.len()..];
            let settled = match settled_cache.get(kpid) {
                Some(&settled) => settled,
                None => {
                    let state = get_required(kv, &format!("{kpid}.state"))?;
                    let settled = state != "unresolved";
                    settled_cache.insert(kpid.to_owned(), settled);
                    settled
                }
            };
            if settled && !pending.contains(&(kpid.to_owned(), vat.to_string())) {
                let kpid: KernelSlot = kpid.parse()?;
                events.push(RunQueueEvent::Notify { vat_id: vat, kpid });
            }
        }
    }
    log::info!("  - found {} latent buggy kpids", events.len());

    let mut stashed: Vec<Value> = get_json(kv, "upgradeEvents")?.unwrap_or_default();
    for event in &events {
        stashed.push(serde_json::to_value(event)?);
    }
    set_json(kv, "upgradeEvents", &stashed)?;
    Ok(events.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use swingset_store::MemKvStore;

    fn v2_store() -> MemKvStore {
        MemKvStore::from_entries([
            ("version", "2"),
            ("vat.name.bootstrap", "v1"),
            ("vat.dynamicIDs", r#"["v2","v3"]"#),
            ("vats.terminated", r#"["v3"]"#),
            ("runQueue", "[1,2]"),
            ("runQueue.1", r#"{"type":"notify","vatID":"v1","kpid":"kp41"}"#),
            ("acceptanceQueue", "[1,1]"),
            ("v1.c.kp40", "R p-60"),
            ("v1.c.kp41", "R p-61"),
            ("v1.c.kp42", "R p+5"),
            ("v2.c.kp40", "R p-60"),
            ("v3.c.kp40", "R p-60"),
            ("kp40.state", "rejected"),
            ("kp41.state", "fulfilled"),
            ("kp42.state", "unresolved"),
        ])
    }

    #[test]
    fn remediation_targets_settled_promises_without_notifies() {
        let mut kv = v2_store();
        let outcome = upgrade_swingset(&mut kv).unwrap();
        assert!(outcome.modified);
        assert_eq!(kv.get("version").unwrap().as_deref(), Some("3"));
        let events: Vec<RunQueueEvent> =
            serde_json::from_str(&kv.get("upgradeEvents").unwrap().unwrap()).unwrap();
        assert_eq!(
            events,
            vec![
                RunQueueEvent::Notify {
                    vat_id: VatId(1),
                    kpid: KernelSlot::promise(40)
                },
                RunQueueEvent::Notify {
                    vat_id: VatId(2),
                    kpid: KernelSlot::promise(40)
                },
            ]
        );
    }

    #[test]
    fn current_db_is_left_alone() {
        let mut kv = v2_store();
        upgrade_swingset(&mut kv).unwrap();
        let before = kv.entries().clone();
        assert!(!upgrade_swingset(&mut kv).unwrap().modified);
        assert_eq!(kv.entries(), &before);
    }

    #[test]
    fn rejects_uninitialized_and_future_dbs() {
        let mut empty = MemKvStore::new();
        assert!(matches!(
            upgrade_swingset(&mut empty),
            Err(KernelError::Uninitialized)
        ));
        let mut future = MemKvStore::from_entries([("version", "4")]);
        assert!(matches!(
            upgrade_swingset(&mut future),
            Err(KernelError::UnknownSchemaVersion(4))
        ));
    }

    #[test]
    fn never_reaping_defaults_convert_to_all_never() {
        let mut kv = MemKvStore::from_entries([
            ("initialized", "true"),
            ("kernel.defaultReapInterval", "never"),
            ("vat.dynamicIDs", "[]"),
            ("runQueue", "[1,1]"),
            ("acceptanceQueue", "[1,1]"),
        ]);
        upgrade_swingset(&mut kv).unwrap();
        let threshold: Value =
            serde_json::from_str(&kv.get("kernel.defaultReapDirtThreshold").unwrap().unwrap())
                .unwrap();
        assert_eq!(
            threshold,
            json!({"deliveries": "never", "gcKrefs": "never", "computrons": "never"})
        );
        assert!(!kv.has("initialized").unwrap());
        assert_eq!(kv.get("vats.terminated").unwrap().as_deref(), Some("[]"));
        assert_eq!(kv.get("upgradeEvents").unwrap().as_deref(), Some("[]"));
    }

    #[test]
    fn v0_db_with_dirt_threshold_is_refused() {
        let mut kv = MemKvStore::from_entries([
            ("initialized", "true"),
            ("kernel.defaultReapInterval", "1000"),
            ("kernel.defaultReapDirtThreshold", r#"{"deliveries":5}"#),
            ("vat.dynamicIDs", "[]"),
            ("runQueue", "[1,1]"),
            ("acceptanceQueue", "[1,1]"),
        ]);
        assert!(matches!(
            upgrade_swingset(&mut kv),
            Err(KernelError::Migration(_))
        ));
        assert!(kv.has("initialized").unwrap());
        assert!(kv.has("kernel.defaultReapInterval").unwrap());
    }
}
