//! Typed reads and writes on top of the string-valued store.

use crate::error::{KernelError, KernelResult};
use serde::{Serialize, de::DeserializeOwned};
use std::str::FromStr;
use swingset_store::KvStore;

pub(crate) fn get_required<S: KvStore + ?Sized>(kv: &S, key: &str) -> KernelResult<String> {
    kv.get(key)?
        .ok_or_else(|| KernelError::MissingKey(key.to_owned()))
}

pub(crate) fn parse_value<T: FromStr>(key: &str, raw: &str) -> KernelResult<T> {
    raw.parse().map_err(|_| KernelError::malformed(key, raw))
}

pub(crate) fn get_parsed<S, T>(kv: &S, key: &str) -> KernelResult<Option<T>>
where
    S: KvStore + ?Sized,
    T: FromStr,
{
    kv.get(key)?.map(|raw| parse_value(key, &raw)).transpose()
}

pub(crate) fn get_required_parsed<S, T>(kv: &S, key: &str) -> KernelResult<T>
where
    S: KvStore + ?Sized,
    T: FromStr,
{
    let raw = get_required(kv, key)?;
    parse_value(key, &raw)
}

pub(crate) fn get_json<S, T>(kv: &S, key: &str) -> KernelResult<Option<T>>
where
    S: KvStore + ?Sized,
    T: DeserializeOwned,
{
    match kv.get(key)? {
        Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
        None => Ok(None),
    }
}

pub(crate) fn get_required_json<S, T>(kv: &S, key: &str) -> KernelResult<T>
where
    S: KvStore + ?Sized,
    T: DeserializeOwned,
{
    let raw = get_required(kv, key)?;
    Ok(serde_json::from_str(&raw)?)
}

pub(crate) fn set_json<S, T>(kv: &mut S, key: &str, value: &T) -> KernelResult<()>
where
    S: KvStore + ?Sized,
    T: Serialize + ?Sized,
{
    let raw = serde_json::to_string(value)?;
    kv.set(key, &raw)?;
    Ok(())
}

/// Reads the counter at `key`, stores its successor, and returns the value
/// that was read.
pub(crate) fn bump_counter<S: KvStore + ?Sized>(kv: &mut S, key: &str) -> KernelResult<u64> {
    let id: u64 = get_required_parsed(kv, key)?;
    kv.set(key, &(id + 1).to_string())?;
    Ok(id)
}
