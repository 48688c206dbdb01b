mod common;

use anyhow::{Result, ensure};
use common::{add_vat, export, fresh_keeper, import, ko};
use swingset_kernel::{
    CleanupBudget, CleanupPolicy, GcAction, GcActionKind, ObjectRefCount, ObjectRow,
    RunQueueEvent, VatId,
};
use swingset_store::{KvStore, helpers::enumerate_keys_with_prefix};

#[test]
fn terminated_vat_releases_exports_and_imports() -> Result<()> {
    let mut keeper = fresh_keeper()?;
    let doomed = add_vat(&mut keeper, "doomed")?;
    let survivor = add_vat(&mut keeper, "survivor")?;

    let exported = export(&mut keeper, doomed, "o+4")?;
    import(&mut keeper, survivor, exported)?;
    let imported = export(&mut keeper, survivor, "o+5")?;
    assert_eq!(import(&mut keeper, doomed, imported)?.to_string(), "o-50");
    keeper
        .provide_vat_keeper(doomed)?
        .add_to_transcript("delivery 1")?;

    keeper.mark_vat_as_terminated(doomed)?;
    assert!(!keeper.vat_is_alive(doomed)?);
    assert_eq!(keeper.owner_of_kernel_object(exported)?, None);
    let action = keeper.next_cleanup_terminated_vat_action(CleanupPolicy::Unlimited);
    assert_eq!(
        action,
        Some(RunQueueEvent::CleanupTerminatedVat {
            vat_id: doomed,
            budget: CleanupBudget::unlimited(),
        })
    );

    let outcome = keeper.cleanup_after_terminated_vat(doomed, &CleanupBudget::unlimited())?;
    ensure!(outcome.done, "unlimited cleanup must finish in one call");
    assert_eq!(outcome.work.exports, 1);
    assert_eq!(outcome.work.imports, 1);
    assert_eq!(outcome.work.transcripts, 1);

    assert!(enumerate_keys_with_prefix(keeper.storage(), "v1.")?.is_empty());
    assert!(!keeper.storage().has("ko20.owner")?);
    assert_eq!(keeper.get_object_refcount(exported)?, ObjectRefCount::new(1, 1));
    assert_eq!(keeper.get_object_refcount(imported)?, ObjectRefCount::new(0, 0));

    keeper.process_refcounts()?;
    assert_eq!(
        keeper.get_gc_actions()?.into_iter().collect::<Vec<_>>(),
        vec![
            GcAction::new(survivor, GcActionKind::DropExport, imported),
            GcAction::new(survivor, GcActionKind::RetireExport, imported),
        ]
    );
    assert_eq!(
        keeper.next_gc_action_event()?,
        Some(RunQueueEvent::DropExports {
            vat_id: survivor,
            krefs: vec![imported],
        })
    );

    keeper.delete_vat_id(doomed)?;
    keeper.forget_terminated_vat(doomed)?;
    assert_eq!(
        keeper.next_cleanup_terminated_vat_action(CleanupPolicy::Unlimited),
        None
    );
    assert_eq!(keeper.get_all_vat_ids()?, vec![survivor]);

    let dump = keeper.dump()?;
    assert_eq!(dump.vat_tables.len(), 1);
    assert!(dump.objects.contains(&ObjectRow {
        kref: exported,
        owner: None,
        reachable: 1,
        recognizable: 1,
    }));
    assert!(dump.kernel_table.iter().all(|row| row.owner == survivor.to_string()));
    Ok(())
}

#[test]
fn budgeted_cleanup_resumes_until_done() -> Result<()> {
    let mut keeper = fresh_keeper()?;
    let doomed = add_vat(&mut keeper, "doomed")?;
    for vref in ["o+1", "o+2", "o+3"] {
        export(&mut keeper, doomed, vref)?;
    }
    keeper.mark_vat_as_terminated(doomed)?;

    let budget = CleanupBudget::uniform(1);
    let first = keeper.cleanup_after_terminated_vat(doomed, &budget)?;
    ensure!(!first.done, "a budget of one cannot finish");
    assert_eq!(first.work.exports, 1);
    assert_eq!(first.work.total(), 1);

    let mut exports = first.work.exports;
    let mut calls = 1;
    loop {
        let outcome = keeper.cleanup_after_terminated_vat(doomed, &budget)?;
        calls += 1;
        exports += outcome.work.exports;
        ensure!(outcome.work.total() <= 1, "budget exceeded: {:?}", outcome.work);
        if outcome.done {
            break;
        }
        ensure!(calls < 50, "cleanup never finished");
    }
    assert_eq!(exports, 3);
    assert!(enumerate_keys_with_prefix(keeper.storage(), "v1.")?.is_empty());

    keeper.process_refcounts()?;
    for id in 20..23 {
        assert!(!keeper.kernel_object_exists(ko(id))?);
    }
    assert_eq!(keeper.get_stats(false)?["kernelObjects"], 0);
    assert!(keeper.get_gc_actions()?.is_empty());
    Ok(())
}

#[test]
fn refcount_sweep_fast_forwards_terminated_owners() -> Result<()> {
    let mut keeper = fresh_keeper()?;
    let doomed = add_vat(&mut keeper, "doomed")?;
    let holder = add_vat(&mut keeper, "holder")?;
    let kref = export(&mut keeper, doomed, "o+7")?;
    import(&mut keeper, holder, kref)?;
    keeper.mark_vat_as_terminated(doomed)?;

    keeper.provide_vat_keeper(holder)?.clear_reachable_flag(kref)?;
    keeper.process_refcounts()?;

    // Still recognizable by the holder, so the object is retired rather
    // than dropped by its dead owner.
    assert!(!keeper.kernel_object_exists(kref)?);
    assert!(!keeper.storage().has("v1.c.o+7")?);
    assert!(!keeper.storage().has("v1.c.ko20")?);
    assert_eq!(
        keeper.get_gc_actions()?.into_iter().collect::<Vec<_>>(),
        vec![GcAction::new(holder, GcActionKind::RetireImport, kref)]
    );
    assert_eq!(
        keeper.next_gc_action_event()?,
        Some(RunQueueEvent::RetireImports {
            vat_id: holder,
            krefs: vec![kref],
        })
    );
    assert_eq!(keeper.get_importers(kref)?, vec![holder]);
    assert_eq!(keeper.owner_of_kernel_object(kref)?, None);
    assert!(keeper.is_vat_terminated(VatId(1)));
    Ok(())
}
