use crate::stats::StatsError;
use thiserror::Error;

pub type KernelResult<T> = Result<T, KernelError>;

#[derive(Debug, Error)]
pub enum KernelError {
    #[error("store error: {0}")]
    Store(#[from] swingset_store::StoreError),
    #[error("stats error: {0}")]
    Stats(#[from] StatsError),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("missing required key '{0}'")]
    MissingKey(String),
    #[error("malformed value '{value}' at '{key}'")]
    MalformedValue { key: String, value: String },
    #[error("invalid ID '{0}'")]
    InvalidId(String),
    #[error("invalid slot '{0}'")]
    InvalidSlot(String),
    #[error("kernel DB already initialized")]
    AlreadyInitialized,
    #[error("kernel DB is uninitialized")]
    Uninitialized,
    #[error("kernel DB is version {found}, but this software expects {expected}")]
    SchemaMismatch { expected: u64, found: u64 },
    #[error("kernel DB version {0} is newer than this software understands")]
    UnknownSchemaVersion(u64),
    #[error("migration failed: {0}")]
    Migration(String),
    #[error("refcount underflow on {kref} ({tag})")]
    RefCountUnderflow { kref: String, tag: String },
    #[error("refcount invariant violated on {kref}: reachable {reachable} > recognizable {recognizable}")]
    RefCountInvariant {
        kref: String,
        reachable: u64,
        recognizable: u64,
    },
    #[error("promise {0} is not unresolved")]
    PromiseNotUnresolved(String),
    #[error("unknown promise state '{state}' for {kpid}")]
    UnknownPromiseState { kpid: String, state: String },
    #[error("{kpid} decider is {found}, expected {expected}")]
    DeciderMismatch {
        kpid: String,
        expected: String,
        found: String,
    },
    #[error("invalid GC action '{0}'")]
    InvalidGcAction(String),
    #[error("{owner} has no c-list entry for {slot}")]
    UnknownCListEntry { owner: String, slot: String },
    #[error("{owner} already has a c-list entry for {slot}")]
    CListEntryExists { owner: String, slot: String },
    #[error("{owner} cannot map {slot}: {reason}")]
    IllegalMapping {
        owner: String,
        slot: String,
        reason: &'static str,
    },
    #[error("{vat} tried to use unreachable import {slot}")]
    UnreachableImport { vat: String, slot: String },
    #[error("{kref} is not owned by {vat}")]
    NotOwner { kref: String, vat: String },
    #[error("vat {0} was not initialized")]
    VatNotInitialized(String),
    #[error("unknown vat '{0}'")]
    UnknownVat(String),
    #[error("device {0} was not initialized")]
    DeviceNotInitialized(String),
    #[error("unknown meter '{0}'")]
    UnknownMeter(String),
    #[error("invalid bundle ID '{0}'")]
    InvalidBundleId(String),
    #[error("bundle {id} has unsupported format '{format}'")]
    UnsupportedBundleFormat { id: String, format: String },
    #[error("{0} overflowed")]
    Overflow(String),
    #[error("invalid reap-dirt threshold: {0}")]
    InvalidThreshold(String),
}

impl KernelError {
    pub(crate) fn malformed(key: &str, value: &str) -> Self {
        KernelError::MalformedValue {
            key: key.to_owned(),
            value: value.to_owned(),
        }
    }
}
