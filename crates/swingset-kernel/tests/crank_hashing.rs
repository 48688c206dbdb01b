mod common;

use anyhow::{Result, ensure};
use common::{Keeper, add_vat, export, fresh_keeper, kp};
use swingset_kernel::{RunQueueEvent, VatId};
use swingset_store::{CrankHashes, KvStore};

fn crank_adding_an_object(keeper: &mut Keeper) -> Result<CrankHashes> {
    keeper.start_crank()?;
    keeper.add_kernel_object(VatId(1), None)?;
    keeper.increment_crank_number()?;
    let hashes = keeper.emit_crank_hashes()?;
    keeper.end_crank()?;
    Ok(hashes)
}

#[test]
fn identical_histories_hash_identically() -> Result<()> {
    let mut a = fresh_keeper()?;
    let mut b = fresh_keeper()?;
    let first_a = crank_adding_an_object(&mut a)?;
    let first_b = crank_adding_an_object(&mut b)?;
    assert_eq!(first_a, first_b);
    assert_eq!(first_a.crankhash.len(), 64);

    let second = crank_adding_an_object(&mut a)?;
    ensure!(second.activityhash != first_a.activityhash, "activity hash must chain");
    assert_eq!(
        a.storage().get("activityhash")?.as_deref(),
        Some(second.activityhash.as_str())
    );
    Ok(())
}

#[test]
fn local_keys_do_not_affect_the_crank_hash() -> Result<()> {
    let mut a = fresh_keeper()?;
    let mut b = fresh_keeper()?;
    b.storage_mut().set("local.snapshot.v1", "whatever")?;
    assert_eq!(crank_adding_an_object(&mut a)?, crank_adding_an_object(&mut b)?);
    Ok(())
}

#[test]
fn host_keys_are_refused() -> Result<()> {
    let mut keeper = fresh_keeper()?;
    assert!(keeper.storage_mut().set("host.mailbox", "{}").is_err());
    keeper.storage_mut().host().set("host.mailbox", "{}")?;
    assert_eq!(keeper.storage().get("host.mailbox")?.as_deref(), Some("{}"));
    Ok(())
}

#[test]
fn rollback_restores_state_stats_and_hash() -> Result<()> {
    let mut rolled = fresh_keeper()?;
    let mut untouched = fresh_keeper()?;
    let vat = add_vat(&mut rolled, "bootstrap")?;
    add_vat(&mut untouched, "bootstrap")?;
    rolled.save_stats()?;
    untouched.save_stats()?;

    rolled.start_crank()?;
    rolled.establish_crank_savepoint("deliver")?;
    export(&mut rolled, vat, "o+1")?;
    rolled.add_to_run_queue(&RunQueueEvent::Notify {
        vat_id: vat,
        kpid: kp(40),
    })?;
    rolled.mark_vat_as_terminated(vat)?;
    assert_eq!(rolled.get_stats(false)?["kernelObjects"], 1);
    rolled.rollback_crank("deliver")?;

    assert!(!rolled.kernel_object_exists(common::ko(20))?);
    assert!(!rolled.storage().has("v1.c.o+1")?);
    assert_eq!(rolled.get_run_queue_length()?, 0);
    assert!(!rolled.is_vat_terminated(vat));
    assert!(rolled.vat_is_alive(vat)?);
    let stats = rolled.get_stats(false)?;
    assert_eq!(stats["kernelObjects"], 0);
    assert_eq!(stats["runQueueLength"], 0);

    untouched.start_crank()?;
    let expected = untouched.emit_crank_hashes()?;
    assert_eq!(rolled.emit_crank_hashes()?, expected);
    rolled.end_crank()?;
    untouched.end_crank()?;
    Ok(())
}

#[test]
fn queues_are_fifo_and_counted() -> Result<()> {
    let mut keeper = fresh_keeper()?;
    let events: Vec<RunQueueEvent> = (40..43)
        .map(|id| RunQueueEvent::Notify {
            vat_id: VatId(1),
            kpid: kp(id),
        })
        .collect();
    for event in &events {
        keeper.add_to_run_queue(event)?;
    }
    assert_eq!(keeper.get_run_queue_length()?, 3);
    assert_eq!(keeper.get_stats(true)?["runQueueLength"], 3);
    assert_eq!(keeper.storage().get("runQueue")?.as_deref(), Some("[1,4]"));

    for event in events {
        assert_eq!(keeper.get_next_run_queue_msg()?, Some(event));
    }
    assert_eq!(keeper.get_next_run_queue_msg()?, None);
    assert_eq!(keeper.get_run_queue_length()?, 0);
    assert_eq!(keeper.get_stats(true)?["runQueueLength"], 0);
    assert_eq!(keeper.get_acceptance_queue_length()?, 0);
    Ok(())
}
