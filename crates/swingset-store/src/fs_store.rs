use crate::{KvStore, StoreResult, io_error};
use std::{
    collections::BTreeMap,
    fmt, fs,
    io::{ErrorKind, Write},
    ops::Bound,
    path::{Path, PathBuf},
};

/// File-backed store: the whole key space lives in memory and is written to
/// `<root>/kvstore.json` on [`KvStore::commit`]. Uncommitted writes are lost
/// when the process exits, which matches crank-level durability.
pub struct FsKvStore {
    path: PathBuf,
    entries: BTreeMap<String, String>,
    dirty: bool,
}

impl fmt::Debug for FsKvStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FsKvStore")
            .field("path", &self.path)
            .field("entries", &self.entries.len())
            .field("dirty", &self.dirty)
            .finish()
    }
}

impl FsKvStore {
    pub const FILE_NAME: &'static str = "kvstore.json";

    pub fn open(root: impl AsRef<Path>) -> StoreResult<Self> {
        let root = root.as_ref();
        fs::create_dir_all(root).map_err(|e| io_error(root, e))?;
        let path = root.join(Self::FILE_NAME);
        let entries = match fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(err) if err.kind() == ErrorKind::NotFound => BTreeMap::new(),
            Err(err) => return Err(io_error(path, err)),
        };
        Ok(Self {
            path,
            entries,
            dirty: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_atomic(&self) -> StoreResult<()> {
        let bytes = serde_json::to_vec(&self.entries)?;
        let tmp = self.path.with_extension("json.tmp");
        {
            let mut file = fs::File::create(&tmp).map_err(|e| io_error(&tmp, e))?;
            file.write_all(&bytes).map_err(|e| io_error(&tmp, e))?;
            file.sync_all().map_err(|e| io_error(&tmp, e))?;
        }
        fs::rename(&tmp, &self.path).map_err(|e| io_error(&self.path, e))
    }
}

impl KvStore for FsKvStore {
    fn get(&self, key: &str) -> StoreResult<Option<String>> {
        Ok(self.entries.get(key).cloned())
    }

    fn set(&mut self, key: &str, value: &str) -> StoreResult<()> {
        self.entries.insert(key.to_owned(), value.to_owned());
        self.dirty = true;
        Ok(())
    }

    fn delete(&mut self, key: &str) -> StoreResult<()> {
        if self.entries.remove(key).is_some() {
            self.dirty = true;
        }
        Ok(())
    }

    fn get_next_key(&self, previous: &str) -> StoreResult<Option<String>> {
        Ok(self
            .entries
            .range::<str, _>((Bound::Excluded(previous), Bound::Unbounded))
            .next()
            .map(|(k, _)| k.clone()))
    }

    fn commit(&mut self) -> StoreResult<()> {
        if !self.dirty {
            return Ok(());
        }
        self.write_atomic()?;
        self.dirty = false;
        log::debug!("committed {} entries to {}", self.entries.len(), self.path.display());
        Ok(())
    }
}
