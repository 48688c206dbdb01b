//! Ordered key-value storage for the kernel plus the crank-hashing wrapper and
//! the transcript, snapshot, and bundle side stores.

mod bundle;
mod fs_store;
pub mod helpers;
mod kernel_storage;
mod mem_store;
mod snapshot;
mod transcript;

pub use bundle::{Bundle, BundleStore, MemBundleStore};
pub use fs_store::FsKvStore;
pub use kernel_storage::{CrankHashes, HostStorage, KernelStorage};
pub use mem_store::MemKvStore;
pub use snapshot::{MemSnapStore, SnapStore, SnapshotInfo};
pub use transcript::{MemTranscriptStore, SpanBounds, TranscriptStore};

use std::{io, path::PathBuf};

pub type StoreResult<T> = Result<T, StoreError>;

/// Sorted, string-keyed store. Keys and values are opaque strings; hierarchy
/// is simulated by `.`-joined prefixes and enumerated through
/// [`KvStore::get_next_key`].
pub trait KvStore {
    fn get(&self, key: &str) -> StoreResult<Option<String>>;

    fn has(&self, key: &str) -> StoreResult<bool> {
        Ok(self.get(key)?.is_some())
    }

    fn set(&mut self, key: &str, value: &str) -> StoreResult<()>;

    fn delete(&mut self, key: &str) -> StoreResult<()>;

    /// Returns the smallest key strictly greater than `previous`.
    fn get_next_key(&self, previous: &str) -> StoreResult<Option<String>>;

    /// Makes every mutation so far durable. In-memory stores treat this as a
    /// no-op.
    fn commit(&mut self) -> StoreResult<()> {
        Ok(())
    }
}

impl<T: KvStore + ?Sized> KvStore for Box<T> {
    fn get(&self, key: &str) -> StoreResult<Option<String>> {
        (**self).get(key)
    }

    fn has(&self, key: &str) -> StoreResult<bool> {
        (**self).has(key)
    }

    fn set(&mut self, key: &str, value: &str) -> StoreResult<()> {
        (**self).set(key, value)
    }

    fn delete(&mut self, key: &str) -> StoreResult<()> {
        (**self).delete(key)
    }

    fn get_next_key(&self, previous: &str) -> StoreResult<Option<String>> {
        (**self).get_next_key(previous)
    }

    fn commit(&mut self) -> StoreResult<()> {
        (**self).commit()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("kernel storage refuses to write reserved key '{0}'")]
    ReservedKey(String),
    #[error("host storage may only write 'host.' keys, got '{0}'")]
    NotHostKey(String),
    #[error("crank already in progress")]
    CrankInProgress,
    #[error("no crank in progress")]
    NoCrank,
    #[error("no such savepoint '{0}'")]
    UnknownSavepoint(String),
    #[error("no transcript for vat '{0}'")]
    UnknownTranscript(String),
    #[error("transcript for vat '{0}' is no longer in use")]
    TranscriptRetired(String),
    #[error("bundle '{0}' already installed")]
    DuplicateBundle(String),
}

pub(crate) fn io_error(path: impl Into<PathBuf>, err: io::Error) -> StoreError {
    StoreError::Io {
        path: path.into(),
        source: err,
    }
}

/// Result of one budget-limited cleanup step over a side store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CleanupProgress {
    pub done: bool,
    pub cleanups: u64,
}
