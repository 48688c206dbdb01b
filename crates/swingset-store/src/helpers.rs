//! Prefix-scan primitives over a [`KvStore`].
//!
//! Two shapes of range are supported: lexicographic ranges (`start..end`
//! restricted to keys that begin with `start`) and dense numeric suffixes
//! (`prefix0`, `prefix1`, ...) that stop at the first gap.

use crate::{KvStore, StoreResult};

/// Returns the smallest string greater than every string that starts with
/// `prefix`. Used as the exclusive upper bound of a prefix scan.
pub fn prefix_end(prefix: &str) -> String {
    let mut end = prefix.to_owned();
    end.push('\u{10FFFF}');
    end
}

/// Cursor over keys `k` with `k > start`, `k.starts_with(start)` and `k < end`.
///
/// The cursor holds no borrow of the store, so callers may delete or write
/// keys between calls to [`PrefixCursor::next`]; the scan resumes from the
/// last key returned.
#[derive(Debug, Clone)]
pub struct PrefixCursor {
    start: String,
    end: String,
    last: String,
    finished: bool,
}

impl PrefixCursor {
    pub fn new(start: impl Into<String>, end: impl Into<String>) -> Self {
        let start = start.into();
        Self {
            last: start.clone(),
            start,
            end: end.into(),
            finished: false,
        }
    }

    /// Cursor over every key that starts with `prefix`.
    pub fn prefixed(prefix: impl Into<String>) -> Self {
        let start = prefix.into();
        let end = prefix_end(&start);
        Self::new(start, end)
    }

    pub fn next<S: KvStore + ?Sized>(&mut self, kv: &S) -> StoreResult<Option<String>> {
        if self.finished {
            return Ok(None);
        }
        match kv.get_next_key(&self.last)? {
            Some(key) if key.starts_with(&self.start) && key < self.end => {
                self.last.clone_from(&key);
                Ok(Some(key))
            }
            _ => {
                self.finished = true;
                Ok(None)
            }
        }
    }
}

/// Collects the keys a [`PrefixCursor`] would yield.
pub fn enumerate_prefixed_keys<S: KvStore + ?Sized>(
    kv: &S,
    start: &str,
    end: &str,
) -> StoreResult<Vec<String>> {
    let mut cursor = PrefixCursor::new(start, end);
    let mut keys = Vec::new();
    while let Some(key) = cursor.next(kv)? {
        keys.push(key);
    }
    Ok(keys)
}

/// Every key that starts with `prefix`, in order.
pub fn enumerate_keys_with_prefix<S: KvStore + ?Sized>(
    kv: &S,
    prefix: &str,
) -> StoreResult<Vec<String>> {
    enumerate_prefixed_keys(kv, prefix, &prefix_end(prefix))
}

/// Values at `prefix<start>`, `prefix<start+1>`, ... up to the first missing
/// index.
pub fn get_prefixed_values<S: KvStore + ?Sized>(
    kv: &S,
    prefix: &str,
    start: u64,
) -> StoreResult<Vec<String>> {
    let mut values = Vec::new();
    let mut i = start;
    while let Some(value) = kv.get(&format!("{prefix}{i}"))? {
        values.push(value);
        i += 1;
    }
    Ok(values)
}

/// Deletes `prefix<start>`, `prefix<start+1>`, ... up to the first missing
/// index. Returns how many keys were removed.
pub fn delete_prefixed_keys<S: KvStore + ?Sized>(
    kv: &mut S,
    prefix: &str,
    start: u64,
) -> StoreResult<u64> {
    let mut i = start;
    loop {
        let key = format!("{prefix}{i}");
        if !kv.has(&key)? {
            return Ok(i - start);
        }
        kv.delete(&key)?;
        i += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemKvStore;

    fn sample() -> MemKvStore {
        MemKvStore::from_entries([
            ("a", "0"),
            ("v1.c.ko20", "R o+1"),
            ("v1.c.ko21", "_ o-50"),
            ("v1.c.o+1", "ko20"),
            ("v1.c.o-50", "ko21"),
            ("v1.o.nextID", "51"),
            ("v10.c.ko22", "R o+1"),
            ("z", "0"),
        ])
    }

    #[test]
    fn enumerates_keys_within_prefix_and_bound() {
        let kv = sample();
        let keys = enumerate_keys_with_prefix(&kv, "v1.c.").unwrap();
        assert_eq!(
            keys,
            vec!["v1.c.ko20", "v1.c.ko21", "v1.c.o+1", "v1.c.o-50"]
        );

        let kos = enumerate_prefixed_keys(&kv, "v1.c.ko", "v1.c.ko21").unwrap();
        assert_eq!(kos, vec!["v1.c.ko20"]);

        // v1. must not bleed into v10.
        let v1 = enumerate_keys_with_prefix(&kv, "v1.").unwrap();
        assert!(v1.iter().all(|k| k.starts_with("v1.")));
        assert_eq!(v1.len(), 5);
    }

    #[test]
    fn start_key_itself_is_excluded() {
        let kv = MemKvStore::from_entries([("p", "x"), ("p1", "y")]);
        assert_eq!(enumerate_keys_with_prefix(&kv, "p").unwrap(), vec!["p1"]);
    }

    #[test]
    fn cursor_tolerates_deletion_during_scan() {
        let mut kv = sample();
        let mut cursor = PrefixCursor::prefixed("v1.");
        let mut seen = Vec::new();
        while let Some(key) = cursor.next(&kv).unwrap() {
            kv.delete(&key).unwrap();
            seen.push(key);
        }
        assert_eq!(seen.len(), 5);
        assert!(enumerate_keys_with_prefix(&kv, "v1.").unwrap().is_empty());
        assert!(kv.has("v10.c.ko22").unwrap());
    }

    #[test]
    fn numeric_suffix_helpers_stop_at_gap() {
        let mut kv = MemKvStore::from_entries([
            ("q.0", "zero"),
            ("q.1", "one"),
            ("q.2", "two"),
            ("q.4", "four"),
        ]);
        assert_eq!(
            get_prefixed_values(&kv, "q.", 0).unwrap(),
            vec!["zero", "one", "two"]
        );
        assert_eq!(get_prefixed_values(&kv, "q.", 1).unwrap(), vec!["one", "two"]);
        assert!(get_prefixed_values(&kv, "q.", 3).unwrap().is_empty());

        assert_eq!(delete_prefixed_keys(&mut kv, "q.", 0).unwrap(), 3);
        assert!(!kv.has("q.0").unwrap());
        assert!(kv.has("q.4").unwrap());
    }
}
