#![allow(dead_code)]

use anyhow::{Context, Result};
use swingset_kernel::{
    ExpectedVersion, KernelKeeper, KernelOptions, KernelSlot, MapOptions, VatId, VatOptions,
    VatSlot, VatSource,
};
use swingset_store::{KernelStorage, MemKvStore};

pub type Keeper = KernelKeeper<MemKvStore>;

/// A freshly initialized kernel DB with its stats already saved, so that
/// rollbacks have something to reload.
pub fn fresh_keeper() -> Result<Keeper> {
    let storage = KernelStorage::new(MemKvStore::new());
    let mut keeper = KernelKeeper::open(storage, ExpectedVersion::Uninitialized)
        .context("open empty kernel DB")?;
    keeper.create_starting_kernel_state(&KernelOptions::default())?;
    keeper.set_initialized()?;
    keeper.save_stats()?;
    Ok(keeper)
}

pub fn add_vat(keeper: &mut Keeper, name: &str) -> Result<VatId> {
    let vat = keeper.allocate_vat_id_for_name_if_needed(name)?;
    let options = VatOptions {
        name: Some(name.to_owned()),
        ..VatOptions::default()
    };
    keeper.initialize_vat_state(vat, &VatSource::default(), &options)?;
    Ok(vat)
}

pub fn export(keeper: &mut Keeper, vat: VatId, vref: &str) -> Result<KernelSlot> {
    let vat_slot: VatSlot = vref.parse()?;
    let kref = keeper
        .provide_vat_keeper(vat)?
        .map_vat_slot_to_kernel_slot(vat_slot, MapOptions::default())
        .with_context(|| format!("export {vref} from {vat}"))?;
    Ok(kref)
}

pub fn import(keeper: &mut Keeper, vat: VatId, kref: KernelSlot) -> Result<VatSlot> {
    let vat_slot = keeper
        .provide_vat_keeper(vat)?
        .map_kernel_slot_to_vat_slot(kref, true)
        .with_context(|| format!("import {kref} into {vat}"))?;
    Ok(vat_slot)
}

pub fn ko(id: u64) -> KernelSlot {
    KernelSlot::object(id)
}

pub fn kp(id: u64) -> KernelSlot {
    KernelSlot::promise(id)
}
