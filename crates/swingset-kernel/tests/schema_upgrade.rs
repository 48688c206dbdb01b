use anyhow::{Context, Result, ensure};
use serde_json::{Value, json};
use swingset_kernel::{
    CURRENT_SCHEMA_VERSION, ExpectedVersion, KernelError, KernelKeeper, ReapDirt, VatId,
    stored_version, upgrade_swingset,
};
use swingset_store::{KernelStorage, KvStore, MemKvStore};

fn v0_store() -> MemKvStore {
    MemKvStore::from_entries([
        ("initialized", "true"),
        ("kernel.defaultReapInterval", "300"),
        ("vat.names", r#"["bootstrap","comms"]"#),
        ("vat.name.bootstrap", "v1"),
        ("vat.name.comms", "v2"),
        ("vat.dynamicIDs", r#"["v3"]"#),
        ("vat.nextID", "4"),
        ("runQueue", "[1,1]"),
        ("acceptanceQueue", "[1,1]"),
        ("v1.o.nextID", "50"),
        ("v1.options", r#"{"name":"bootstrap","reapInterval":300}"#),
        ("v1.reapInterval", "300"),
        ("v1.reapCountdown", "70"),
        ("v2.o.nextID", "50"),
        ("v2.options", r#"{"name":"comms","reapInterval":"never"}"#),
        ("v2.reapInterval", "never"),
        ("v2.reapCountdown", "never"),
        ("v3.o.nextID", "50"),
        ("v3.options", r#"{"reapInterval":100}"#),
        ("v3.reapInterval", "100"),
        ("v3.reapCountdown", "100"),
    ])
}

fn json_at(kv: &MemKvStore, key: &str) -> Result<Value> {
    let raw = kv.get(key)?.with_context(|| format!("missing {key}"))?;
    Ok(serde_json::from_str(&raw)?)
}

#[test]
fn v0_reap_intervals_become_dirt_thresholds() -> Result<()> {
    let mut kv = v0_store();
    let outcome = upgrade_swingset(&mut kv)?;
    ensure!(outcome.modified, "a v0 DB must be rewritten");
    assert_eq!(stored_version(&kv)?, CURRENT_SCHEMA_VERSION);
    assert!(!kv.has("initialized")?);
    assert!(!kv.has("kernel.defaultReapInterval")?);
    assert_eq!(
        json_at(&kv, "kernel.defaultReapDirtThreshold")?,
        json!({"deliveries": 300, "gcKrefs": 20, "computrons": "never"})
    );

    assert_eq!(json_at(&kv, "v1.reapDirt")?, json!({"deliveries": 230}));
    assert_eq!(
        json_at(&kv, "v1.options")?,
        json!({"name": "bootstrap", "reapDirtThreshold": {}})
    );
    assert_eq!(json_at(&kv, "v2.reapDirt")?, json!({}));
    assert_eq!(
        json_at(&kv, "v2.options")?,
        json!({"name": "comms", "reapDirtThreshold": {"never": true}})
    );
    assert_eq!(json_at(&kv, "v3.reapDirt")?, json!({"deliveries": 0}));
    assert_eq!(
        json_at(&kv, "v3.options")?,
        json!({"reapDirtThreshold": {"deliveries": 100}})
    );
    for vat in ["v1", "v2", "v3"] {
        assert!(!kv.has(&format!("{vat}.reapInterval"))?);
        assert!(!kv.has(&format!("{vat}.reapCountdown"))?);
    }
    assert_eq!(kv.get("vats.terminated")?.as_deref(), Some("[]"));
    assert_eq!(kv.get("upgradeEvents")?.as_deref(), Some("[]"));
    Ok(())
}

#[test]
fn upgrade_is_idempotent() -> Result<()> {
    let mut kv = v0_store();
    assert!(upgrade_swingset(&mut kv)?.modified);
    let upgraded = kv.entries().clone();
    assert!(!upgrade_swingset(&mut kv)?.modified);
    assert_eq!(kv.entries(), &upgraded);
    Ok(())
}

#[test]
fn upgraded_db_opens_at_current_version() -> Result<()> {
    let mut kv = v0_store();
    let stale = KernelKeeper::open(
        KernelStorage::new(v0_store()),
        ExpectedVersion::Version(CURRENT_SCHEMA_VERSION),
    );
    assert!(matches!(
        stale,
        Err(KernelError::SchemaMismatch { expected: 3, found: 0 })
    ));

    upgrade_swingset(&mut kv)?;
    let mut keeper = KernelKeeper::open(
        KernelStorage::new(kv),
        ExpectedVersion::Version(CURRENT_SCHEMA_VERSION),
    )
    .context("open upgraded DB")?;
    assert_eq!(
        keeper.provide_vat_keeper(VatId(1))?.get_reap_dirt()?,
        ReapDirt::deliveries(230)
    );
    assert!(keeper.provide_vat_keeper(VatId(2))?.get_reap_dirt_threshold()?.never);
    assert_eq!(keeper.inject_queued_upgrade_events()?, 0);
    assert!(!keeper.storage().has("upgradeEvents")?);
    Ok(())
}

#[test]
fn interval_and_countdown_must_agree() {
    let mut kv = v0_store();
    kv.set("v3.reapCountdown", "never").expect("seed");
    assert!(matches!(
        upgrade_swingset(&mut kv),
        Err(KernelError::Migration(_))
    ));
}
