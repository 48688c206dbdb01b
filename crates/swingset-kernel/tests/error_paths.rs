mod common;

use anyhow::Result;
use common::{add_vat, export, fresh_keeper, import};
use swingset_kernel::{
    CapData, KernelError, KernelPromise, MapOptions, ObjectRefCount, RefCountOptions, VatId,
    VatSlot,
};
use swingset_store::KvStore;

#[test]
fn refcount_underflow_is_an_error() -> Result<()> {
    let mut keeper = fresh_keeper()?;
    let kref = keeper.add_kernel_object(VatId(1), None)?;
    assert!(matches!(
        keeper.decrement_ref_count(kref, "drop", RefCountOptions::default()),
        Err(KernelError::RefCountUnderflow { .. })
    ));
    assert!(matches!(
        keeper.decrement_ref_count(kref, "drop", RefCountOptions::RECOGNIZABLE),
        Err(KernelError::RefCountUnderflow { .. })
    ));
    assert_eq!(keeper.get_object_refcount(kref)?, ObjectRefCount::new(0, 0));

    let kpid = keeper.add_kernel_promise_for_vat(VatId(1))?;
    assert!(matches!(
        keeper.decrement_ref_count(kpid, "drop", RefCountOptions::default()),
        Err(KernelError::RefCountUnderflow { .. })
    ));
    assert_eq!(keeper.storage().get("kp40.refCount")?.as_deref(), Some("0"));
    Ok(())
}

#[test]
fn reachable_count_cannot_exceed_recognizable() -> Result<()> {
    let mut keeper = fresh_keeper()?;
    let kref = keeper.add_kernel_object(VatId(1), None)?;
    assert!(matches!(
        keeper.set_object_refcount(kref, ObjectRefCount::new(2, 1)),
        Err(KernelError::RefCountInvariant {
            reachable: 2,
            recognizable: 1,
            ..
        })
    ));
    keeper.storage_mut().set("ko20.refCount", "3,1")?;
    assert!(matches!(
        keeper.get_object_refcount(kref),
        Err(KernelError::RefCountInvariant { .. })
    ));
    Ok(())
}

#[test]
fn map_options_enforce_presence() -> Result<()> {
    let mut keeper = fresh_keeper()?;
    let vat = add_vat(&mut keeper, "bootstrap")?;
    let known = export(&mut keeper, vat, "o+4")?;

    let required = MapOptions {
        required: true,
        ..MapOptions::default()
    };
    let fresh: VatSlot = "o+7".parse()?;
    let mut vk = keeper.provide_vat_keeper(vat)?;
    assert!(matches!(
        vk.map_vat_slot_to_kernel_slot(fresh, required),
        Err(KernelError::UnknownCListEntry { .. })
    ));
    assert_eq!(vk.map_vat_slot_to_kernel_slot("o+4".parse()?, required)?, known);

    let require_new = MapOptions {
        require_new: true,
        ..MapOptions::default()
    };
    assert!(matches!(
        vk.map_vat_slot_to_kernel_slot("o+4".parse()?, require_new),
        Err(KernelError::CListEntryExists { .. })
    ));
    assert!(matches!(
        vk.map_vat_slot_to_kernel_slot("d+1".parse()?, MapOptions::default()),
        Err(KernelError::IllegalMapping { .. })
    ));
    assert!(!keeper.storage().has("v1.c.o+7")?);
    assert_eq!(keeper.get_stats(false)?["kernelObjects"], 1);
    Ok(())
}

#[test]
fn imports_must_be_known_and_reachable() -> Result<()> {
    let mut keeper = fresh_keeper()?;
    let owner = add_vat(&mut keeper, "owner")?;
    let importer = add_vat(&mut keeper, "importer")?;
    let kref = export(&mut keeper, owner, "o+4")?;
    let vref = import(&mut keeper, importer, kref)?;

    let mut vk = keeper.provide_vat_keeper(importer)?;
    assert!(matches!(
        vk.map_vat_slot_to_kernel_slot("o-77".parse()?, MapOptions::default()),
        Err(KernelError::UnknownCListEntry { .. })
    ));

    vk.clear_reachable_flag(kref)?;
    assert!(matches!(
        vk.map_vat_slot_to_kernel_slot(vref, MapOptions::default()),
        Err(KernelError::UnreachableImport { .. })
    ));
    // Recognition alone is still allowed.
    assert_eq!(vk.map_vat_slot_to_kernel_slot(vref, MapOptions::RECOGNIZE_ONLY)?, kref);
    assert_eq!(keeper.get_object_refcount(kref)?, ObjectRefCount::new(0, 1));
    Ok(())
}

#[test]
fn second_resolution_leaves_refcounts_untouched() -> Result<()> {
    let mut keeper = fresh_keeper()?;
    let owner = add_vat(&mut keeper, "owner")?;
    let target = export(&mut keeper, owner, "o+1")?;
    let kpid = keeper.add_kernel_promise_for_vat(owner)?;
    let data = CapData::new("first", vec![target]);
    keeper.resolve_kernel_promise(kpid, false, &data)?;
    let before = keeper.get_object_refcount(target)?;
    assert_eq!(before, ObjectRefCount::new(1, 1));

    let again = CapData::new("second", vec![target, target]);
    assert!(matches!(
        keeper.resolve_kernel_promise(kpid, true, &again),
        Err(KernelError::PromiseNotUnresolved(_))
    ));
    assert_eq!(keeper.get_object_refcount(target)?, before);
    assert_eq!(
        keeper.get_kernel_promise(kpid)?,
        KernelPromise::Settled {
            rejected: false,
            ref_count: 0,
            data,
        }
    );
    let stats = keeper.get_stats(false)?;
    assert_eq!(stats["kpFulfilled"], 1);
    assert_eq!(stats["kpRejected"], 0);
    Ok(())
}
