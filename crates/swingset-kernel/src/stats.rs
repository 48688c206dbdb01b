//! Kernel counters and gauges.
//!
//! Metrics are split into consensus stats, which are written to the hashed
//! `kernelStats` key, and local stats, written to `local.kernelStats`. Each
//! gauge `K` carries three derived counters: `KUp`, `KDown` and the
//! high-water mark `KMax`.

use indexmap::IndexMap;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricType {
    Counter,
    Gauge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricDef {
    pub key: &'static str,
    pub name: &'static str,
    pub metric_type: MetricType,
    pub consensus: bool,
}

const fn counter(key: &'static str, name: &'static str) -> MetricDef {
    MetricDef {
        key,
        name,
        metric_type: MetricType::Counter,
        consensus: false,
    }
}

const fn gauge(key: &'static str, name: &'static str, consensus: bool) -> MetricDef {
    MetricDef {
        key,
        name,
        metric_type: MetricType::Gauge,
        consensus,
    }
}

pub const KERNEL_STATS_METRICS: &[MetricDef] = &[
    counter("syscalls", "swingset_all_syscall_total"),
    counter("syscallSend", "swingset_syscall_total"),
    counter("syscallCallNow", "swingset_syscall_total"),
    counter("syscallSubscribe", "swingset_syscall_total"),
    counter("syscallResolve", "swingset_syscall_total"),
    counter("syscallExit", "swingset_syscall_total"),
    counter("syscallVatstoreGet", "swingset_syscall_total"),
    counter("syscallVatstoreSet", "swingset_syscall_total"),
    counter("syscallVatstoreGetNextKey", "swingset_syscall_total"),
    counter("syscallVatstoreDelete", "swingset_syscall_total"),
    counter("syscallDropImports", "swingset_syscall_total"),
    counter("syscallRetireImports", "swingset_syscall_total"),
    counter("syscallRetireExports", "swingset_syscall_total"),
    counter("syscallAbandonExports", "swingset_syscall_total"),
    counter("dispatches", "swingset_dispatch_total"),
    counter("dispatchDeliver", "swingset_dispatch_deliver_total"),
    counter("dispatchNotify", "swingset_dispatch_notify_total"),
    gauge("kernelObjects", "swingset_kernel_objects", false),
    gauge("kernelDevices", "swingset_kernel_devices", false),
    gauge("kernelPromises", "swingset_kernel_promises", false),
    gauge("kpUnresolved", "swingset_unresolved_kernel_promises", false),
    gauge("kpFulfilled", "swingset_fulfilled_kernel_promises", false),
    gauge("kpRejected", "swingset_rejected_kernel_promises", false),
    gauge("runQueueLength", "swingset_run_queue_length", true),
    gauge("acceptanceQueueLength", "swingset_acceptance_queue_length", true),
    gauge("promiseQueuesLength", "swingset_promise_queues_length", true),
    gauge("clistEntries", "swingset_clist_entries", false),
    gauge("vats", "swingset_vats", false),
];

#[derive(Debug, Error)]
pub enum StatsError {
    #[error("kernel stats used before initialization")]
    NotInitialized,
    #[error("unknown stat '{0}'")]
    UnknownStat(String),
    #[error("stat '{0}' is not a gauge and cannot be decremented")]
    NotAGauge(String),
    #[error("stat '{stat}' adjusted by negative delta {delta}")]
    NegativeDelta { stat: String, delta: i64 },
    #[error("malformed stats JSON: {0}")]
    Json(#[from] serde_json::Error),
}

pub type StatMap = IndexMap<String, i64>;

#[derive(Debug, Clone)]
struct Tables {
    consensus: StatMap,
    local: StatMap,
}

#[derive(Debug, Clone)]
pub struct KernelStats {
    consensus_keys: Vec<String>,
    local_keys: Vec<String>,
    gauges: Vec<&'static str>,
    tables: Option<Tables>,
}

fn expand_keys(def: &MetricDef, keys: &mut Vec<String>) {
    keys.push(def.key.to_owned());
    if def.metric_type == MetricType::Gauge {
        for suffix in ["Up", "Down", "Max"] {
            keys.push(format!("{}{}", def.key, suffix));
        }
    }
}

fn insist_nat(stat: &str, delta: i64) -> Result<(), StatsError> {
    if delta < 0 {
        return Err(StatsError::NegativeDelta {
            stat: stat.to_owned(),
            delta,
        });
    }
    Ok(())
}

fn zeroed(keys: &[String]) -> StatMap {
    keys.iter().map(|k| (k.clone(), 0)).collect()
}

impl KernelStats {
    pub fn new(metrics: &[MetricDef]) -> Self {
        let mut consensus_keys = Vec::new();
        let mut local_keys = Vec::new();
        let mut gauges = Vec::new();
        for def in metrics {
            let keys = if def.consensus {
                &mut consensus_keys
            } else {
                &mut local_keys
            };
            expand_keys(def, keys);
            if def.metric_type == MetricType::Gauge {
                gauges.push(def.key);
            }
        }
        Self {
            consensus_keys,
            local_keys,
            gauges,
            tables: None,
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.tables.is_some()
    }

    pub fn initialize(&mut self) {
        self.tables = Some(Tables {
            consensus: zeroed(&self.consensus_keys),
            local: zeroed(&self.local_keys),
        });
    }

    /// Restores stats from their serialized form. Consensus entries for
    /// metrics that are no longer consensus move to the local table (local
    /// values lose), unknown consensus entries are dropped, and unknown local
    /// entries are kept.
    pub fn load(&mut self, consensus_json: &str, local_json: Option<&str>) -> Result<(), StatsError> {
        let stored_consensus: StatMap = serde_json::from_str(consensus_json)?;
        let mut stored_local: StatMap = match local_json {
            Some(json) => serde_json::from_str(json)?,
            None => StatMap::new(),
        };
        for (key, value) in &stored_consensus {
            if !self.consensus_keys.contains(key) && self.local_keys.contains(key) {
                stored_local.insert(key.clone(), *value);
            }
        }

        let consensus = self
            .consensus_keys
            .iter()
            .map(|k| (k.clone(), stored_consensus.get(k).copied().unwrap_or(0)))
            .collect();
        let mut local: StatMap = self
            .local_keys
            .iter()
            .map(|k| (k.clone(), stored_local.get(k).copied().unwrap_or(0)))
            .collect();
        for (key, value) in stored_local {
            local.entry(key).or_insert(value);
        }
        self.tables = Some(Tables { consensus, local });
        Ok(())
    }

    fn table_for(&mut self, stat: &str) -> Result<&mut StatMap, StatsError> {
        let is_local = self.local_keys.iter().any(|k| k == stat);
        let is_consensus = self.consensus_keys.iter().any(|k| k == stat);
        let tables = self.tables.as_mut().ok_or(StatsError::NotInitialized)?;
        if is_local {
            Ok(&mut tables.local)
        } else if is_consensus {
            Ok(&mut tables.consensus)
        } else {
            Err(StatsError::UnknownStat(stat.to_owned()))
        }
    }

    pub fn inc(&mut self, stat: &str, delta: i64) -> Result<(), StatsError> {
        insist_nat(stat, delta)?;
        let table = self.table_for(stat)?;
        let value = table.entry(stat.to_owned()).or_insert(0);
        *value += delta;
        let value = *value;
        if let Some(max) = table.get_mut(&format!("{stat}Max")) {
            if value > *max {
                *max = value;
            }
        }
        if let Some(up) = table.get_mut(&format!("{stat}Up")) {
            *up += delta;
        }
        Ok(())
    }

    pub fn dec(&mut self, stat: &str, delta: i64) -> Result<(), StatsError> {
        insist_nat(stat, delta)?;
        if !self.gauges.iter().any(|g| *g == stat) {
            // Unknown names report as unknown, not as non-gauges.
            self.table_for(stat)?;
            return Err(StatsError::NotAGauge(stat.to_owned()));
        }
        let table = self.table_for(stat)?;
        *table.entry(stat.to_owned()).or_insert(0) -= delta;
        *table.entry(format!("{stat}Down")).or_insert(0) += delta;
        Ok(())
    }

    pub fn get(&self, stat: &str) -> Option<i64> {
        let tables = self.tables.as_ref()?;
        tables
            .consensus
            .get(stat)
            .or_else(|| tables.local.get(stat))
            .copied()
    }

    /// All stats, local first so that a consensus entry wins any name clash.
    pub fn get_stats(&self, consensus_only: bool) -> Result<StatMap, StatsError> {
        let tables = self.tables.as_ref().ok_or(StatsError::NotInitialized)?;
        let mut merged = StatMap::new();
        if !consensus_only {
            merged.extend(tables.local.iter().map(|(k, v)| (k.clone(), *v)));
        }
        merged.extend(tables.consensus.iter().map(|(k, v)| (k.clone(), *v)));
        Ok(merged)
    }

    /// Returns `(consensus_json, local_json)`.
    pub fn serialize(&self) -> Result<(String, String), StatsError> {
        let tables = self.tables.as_ref().ok_or(StatsError::NotInitialized)?;
        Ok((
            serde_json::to_string(&tables.consensus)?,
            serde_json::to_string(&tables.local)?,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const METRICS: &[MetricDef] = &[
        counter("deliveries", "d"),
        gauge("queueLength", "q", true),
        gauge("objects", "o", false),
    ];

    #[test]
    fn gauges_track_up_down_and_max() {
        let mut stats = KernelStats::new(METRICS);
        assert!(matches!(
            stats.inc("objects", 1),
            Err(StatsError::NotInitialized)
        ));
        stats.initialize();
        stats.inc("objects", 1).unwrap();
        stats.inc("objects", 2).unwrap();
        stats.dec("objects", 1).unwrap();
        assert_eq!(stats.get("objects"), Some(2));
        assert_eq!(stats.get("objectsUp"), Some(3));
        assert_eq!(stats.get("objectsDown"), Some(1));
        assert_eq!(stats.get("objectsMax"), Some(3));

        stats.inc("deliveries", 1).unwrap();
        assert!(matches!(
            stats.dec("deliveries", 1),
            Err(StatsError::NotAGauge(_))
        ));
        assert!(matches!(
            stats.inc("bogus", 1),
            Err(StatsError::UnknownStat(_))
        ));
        assert!(matches!(
            stats.dec("bogus", 1),
            Err(StatsError::UnknownStat(_))
        ));
    }

    #[test]
    fn negative_deltas_are_refused() {
        let mut stats = KernelStats::new(METRICS);
        stats.initialize();
        stats.inc("objects", 2).unwrap();
        assert!(matches!(
            stats.inc("objects", -1),
            Err(StatsError::NegativeDelta { delta: -1, .. })
        ));
        assert!(matches!(
            stats.dec("objects", -1),
            Err(StatsError::NegativeDelta { .. })
        ));
        assert_eq!(stats.get("objects"), Some(2));
        assert_eq!(stats.get("objectsUp"), Some(2));
        assert_eq!(stats.get("objectsDown"), Some(0));
    }

    #[test]
    fn serialized_order_follows_declaration() {
        let mut stats = KernelStats::new(METRICS);
        stats.initialize();
        stats.inc("queueLength", 1).unwrap();
        let (consensus, local) = stats.serialize().unwrap();
        assert_eq!(
            consensus,
            r#"{"queueLength":1,"queueLengthUp":1,"queueLengthDown":0,"queueLengthMax":1}"#
        );
        assert!(local.starts_with(r#"{"deliveries":0,"objects":0"#));

        let consensus_only = stats.get_stats(true).unwrap();
        assert_eq!(consensus_only.len(), 4);
        assert_eq!(stats.get_stats(false).unwrap().len(), 9);
    }

    #[test]
    fn load_migrates_demoted_and_fills_missing() {
        let mut stats = KernelStats::new(METRICS);
        // `objects` used to be consensus; `retired` is no longer a metric at all.
        stats
            .load(
                r#"{"queueLength":4,"objects":7,"retired":9}"#,
                Some(r#"{"objects":1,"nodeOnly":5}"#),
            )
            .unwrap();
        let all = stats.get_stats(false).unwrap();
        assert_eq!(all["queueLength"], 4);
        assert_eq!(all["queueLengthMax"], 0);
        assert_eq!(all["objects"], 7);
        assert_eq!(all["nodeOnly"], 5);
        assert!(!all.contains_key("retired"));

        let (consensus, _) = stats.serialize().unwrap();
        assert!(!consensus.contains("objects"));
    }
}
