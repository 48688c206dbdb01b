use crate::{
    error::KernelResult,
    ids::{DeviceId, KernelSlot, VatId},
    options::{ReapDirt, ReapDirtThreshold, VatOptions},
};
use swingset_store::{KvStore, SnapStore, TranscriptStore};

/// Reachable and recognizable counts of a kernel object, stored as
/// `"<reachable>,<recognizable>"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ObjectRefCount {
    pub reachable: u64,
    pub recognizable: u64,
}

impl ObjectRefCount {
    pub fn new(reachable: u64, recognizable: u64) -> Self {
        Self {
            reachable,
            recognizable,
        }
    }
}

/// How a refcount change should be applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RefCountOptions {
    /// The reference is the owning vat's own export; objects are not counted.
    pub is_export: bool,
    /// Only the recognizable count changes.
    pub only_recognizable: bool,
}

impl RefCountOptions {
    pub const EXPORT_RECOGNIZABLE: Self = Self {
        is_export: true,
        only_recognizable: true,
    };
    pub const RECOGNIZABLE: Self = Self {
        is_export: false,
        only_recognizable: true,
    };
}

/// Per-vat state cached by the kernel between deliveries. Evicted when the
/// vat is deleted or a crank is rolled back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VatState {
    pub options: VatOptions,
    pub reap_dirt: ReapDirt,
}

/// What a vat or device table manager needs from the kernel table manager.
pub trait KernelObjectAllocator {
    fn kv(&self) -> &dyn KvStore;
    fn kv_mut(&mut self) -> &mut dyn KvStore;
    fn transcripts_mut(&mut self) -> &mut dyn TranscriptStore;
    fn transcripts(&self) -> &dyn TranscriptStore;
    fn snapshots_mut(&mut self) -> &mut dyn SnapStore;

    fn add_kernel_object(&mut self, owner: VatId) -> KernelResult<KernelSlot>;
    fn add_kernel_device_node(&mut self, owner: DeviceId) -> KernelResult<KernelSlot>;
    fn add_kernel_promise_for_vat(&mut self, decider: VatId) -> KernelResult<KernelSlot>;

    fn kernel_object_exists(&self, kref: KernelSlot) -> KernelResult<bool>;
    fn get_object_refcount(&self, kref: KernelSlot) -> KernelResult<ObjectRefCount>;
    fn set_object_refcount(&mut self, kref: KernelSlot, counts: ObjectRefCount)
    -> KernelResult<()>;
    fn increment_ref_count(
        &mut self,
        kref: KernelSlot,
        tag: &str,
        options: RefCountOptions,
    ) -> KernelResult<()>;
    /// Returns true when a promise's count reached zero.
    fn decrement_ref_count(
        &mut self,
        kref: KernelSlot,
        tag: &str,
        options: RefCountOptions,
    ) -> KernelResult<bool>;
    fn add_maybe_free_kref(&mut self, kref: KernelSlot);

    fn inc_stat(&mut self, stat: &str) -> KernelResult<()>;
    fn dec_stat(&mut self, stat: &str) -> KernelResult<()>;

    fn schedule_reap(&mut self, vat: VatId) -> KernelResult<()>;
    fn default_reap_dirt_threshold(&self) -> KernelResult<ReapDirtThreshold>;

    /// Cached state for an initialized vat, loaded on first use.
    fn vat_state(&mut self, vat: VatId) -> KernelResult<&mut VatState>;
    fn evict_vat_state(&mut self, vat: VatId);
}
