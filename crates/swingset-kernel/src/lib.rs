//! Persistent kernel state: the kernel, vat and device tables, reference
//! counting and GC, promises, queues, meters, stats, and schema migration.

pub mod allocator;
pub mod device_keeper;
pub mod error;
pub mod event;
pub mod ids;
pub mod keeper;
mod kv;
pub mod options;
pub mod stats;
pub mod upgrade;
pub mod vat_keeper;

pub use allocator::{KernelObjectAllocator, ObjectRefCount, RefCountOptions};
pub use device_keeper::DeviceKeeper;
pub use error::{KernelError, KernelResult};
pub use event::{CapData, GcAction, GcActionKind, Message, RunQueueEvent};
pub use ids::{DeviceId, KernelSlot, MeterId, SlotKind, VatId, VatSlot, VirtualKind};
pub use keeper::{
    CURRENT_SCHEMA_VERSION, CListRow, CleanupOutcome, CleanupWork, ExpectedVersion, KernelDump,
    KernelKeeper, KernelPromise, Meter, MeterRemaining, ObjectRow, PromisePolicy, PromiseState,
    VatTable, stored_version,
};
pub use options::{
    CleanupBudget, CleanupPolicy, KernelOptions, ManagerType, ReapDirt, ReapDirtThreshold,
    ThresholdValue, VatOptions, VatSource,
};
pub use stats::{KernelStats, StatMap, StatsError};
pub use upgrade::{UpgradeOutcome, upgrade_swingset};
pub use vat_keeper::{MapOptions, ReachableAndVatSlot, VatKeeper, VatStats};
