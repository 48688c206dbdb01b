//! Kernel configuration and the typed forms of per-vat option records.

use crate::error::{KernelError, KernelResult};
use serde::{Deserialize, Deserializer, Serialize, Serializer, de};
use serde_json::{Map, Value};
use std::fmt;

pub const DEFAULT_DELIVERIES_PER_BOYD: u64 = 1;
pub const DEFAULT_GC_KREFS_PER_BOYD: u64 = 20;
pub const DEFAULT_SNAPSHOT_INITIAL: u64 = 3;
pub const DEFAULT_SNAPSHOT_INTERVAL: u64 = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ManagerType {
    #[default]
    #[serde(rename = "local")]
    Local,
    #[serde(rename = "node-subprocess")]
    NodeSubprocess,
    #[serde(rename = "xsnap")]
    Xsnap,
    #[serde(rename = "xs-worker")]
    XsWorker,
}

impl ManagerType {
    pub fn as_str(self) -> &'static str {
        match self {
            ManagerType::Local => "local",
            ManagerType::NodeSubprocess => "node-subprocess",
            ManagerType::Xsnap => "xsnap",
            ManagerType::XsWorker => "xs-worker",
        }
    }
}

impl std::str::FromStr for ManagerType {
    type Err = KernelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "local" => Ok(ManagerType::Local),
            "node-subprocess" => Ok(ManagerType::NodeSubprocess),
            "xsnap" => Ok(ManagerType::Xsnap),
            "xs-worker" => Ok(ManagerType::XsWorker),
            other => Err(KernelError::malformed("kernel.defaultManagerType", other)),
        }
    }
}

/// One dimension of a reap-dirt threshold: a positive count, or `"never"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThresholdValue {
    Count(u64),
    Never,
}

impl Serialize for ThresholdValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            ThresholdValue::Count(n) => serializer.serialize_u64(*n),
            ThresholdValue::Never => serializer.serialize_str("never"),
        }
    }
}

impl<'de> Deserialize<'de> for ThresholdValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct ThresholdVisitor;

        impl de::Visitor<'_> for ThresholdVisitor {
            type Value = ThresholdValue;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a non-negative integer or \"never\"")
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<Self::Value, E> {
                Ok(ThresholdValue::Count(v))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<Self::Value, E> {
                u64::try_from(v)
                    .map(ThresholdValue::Count)
                    .map_err(|_| E::invalid_value(de::Unexpected::Signed(v), &self))
            }

            fn visit_f64<E: de::Error>(self, v: f64) -> Result<Self::Value, E> {
                if v >= 0.0 && v.fract() == 0.0 && v <= u64::MAX as f64 {
                    Ok(ThresholdValue::Count(v as u64))
                } else {
                    Err(E::invalid_value(de::Unexpected::Float(v), &self))
                }
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
                if v == "never" {
                    Ok(ThresholdValue::Never)
                } else {
                    Err(E::invalid_value(de::Unexpected::Str(v), &self))
                }
            }
        }

        deserializer.deserialize_any(ThresholdVisitor)
    }
}

/// Per-dimension limits at which a vat is scheduled for a
/// bring-out-your-dead sweep. A missing dimension inherits from the kernel
/// default; `never: true` disables sweeps for the vat entirely.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReapDirtThreshold {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deliveries: Option<ThresholdValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gc_krefs: Option<ThresholdValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub computrons: Option<ThresholdValue>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub never: bool,
}

impl ReapDirtThreshold {
    /// The kernel-wide default installed by a fresh kernel.
    pub fn kernel_default() -> Self {
        Self {
            deliveries: Some(ThresholdValue::Count(DEFAULT_DELIVERIES_PER_BOYD)),
            gc_krefs: Some(ThresholdValue::Count(DEFAULT_GC_KREFS_PER_BOYD)),
            computrons: Some(ThresholdValue::Never),
            never: false,
        }
    }

    pub fn all_never() -> Self {
        Self {
            deliveries: Some(ThresholdValue::Never),
            gc_krefs: Some(ThresholdValue::Never),
            computrons: Some(ThresholdValue::Never),
            never: false,
        }
    }

    /// Dimensions set in `overrides` replace ours.
    pub fn overlay(&self, overrides: &ReapDirtThreshold) -> ReapDirtThreshold {
        ReapDirtThreshold {
            deliveries: overrides.deliveries.or(self.deliveries),
            gc_krefs: overrides.gc_krefs.or(self.gc_krefs),
            computrons: overrides.computrons.or(self.computrons),
            never: self.never || overrides.never,
        }
    }

    /// Kernel-wide thresholds must name every dimension, and counts must be
    /// positive.
    pub fn validate_kernel_default(&self) -> KernelResult<()> {
        for (name, value) in self.dimensions() {
            match value {
                None => {
                    return Err(KernelError::InvalidThreshold(format!("{name} is missing")));
                }
                Some(ThresholdValue::Count(0)) => {
                    return Err(KernelError::InvalidThreshold(format!(
                        "{name} must be positive or 'never'"
                    )));
                }
                Some(_) => {}
            }
        }
        Ok(())
    }

    pub(crate) fn dimensions(&self) -> [(&'static str, Option<ThresholdValue>); 3] {
        [
            ("deliveries", self.deliveries),
            ("gcKrefs", self.gc_krefs),
            ("computrons", self.computrons),
        ]
    }
}

/// Garbage-pressure counters accumulated since a vat's last sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReapDirt {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deliveries: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gc_krefs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub computrons: Option<u64>,
}

impl ReapDirt {
    pub fn deliveries(n: u64) -> Self {
        Self {
            deliveries: Some(n),
            ..Self::default()
        }
    }

    pub(crate) fn dimensions_mut(&mut self) -> [(&'static str, &mut Option<u64>); 3] {
        [
            ("deliveries", &mut self.deliveries),
            ("gcKrefs", &mut self.gc_krefs),
            ("computrons", &mut self.computrons),
        ]
    }
}

/// Where a vat's code comes from.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct VatSource {
    #[serde(rename = "bundleID", default, skip_serializing_if = "Option::is_none")]
    pub bundle_id: Option<String>,
    #[serde(rename = "bundleName", default, skip_serializing_if = "Option::is_none")]
    pub bundle_name: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl VatSource {
    pub fn bundle_id(id: impl Into<String>) -> Self {
        Self {
            bundle_id: Some(id.into()),
            ..Self::default()
        }
    }
}

/// Options recorded at vat creation. Fields the kernel does not interpret
/// are carried through `extra` untouched.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VatOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manager_type: Option<ManagerType>,
    #[serde(default)]
    pub reap_dirt_threshold: ReapDirtThreshold,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Settings written into a fresh kernel by
/// [`KernelKeeper::create_starting_kernel_state`](crate::KernelKeeper::create_starting_kernel_state).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct KernelOptions {
    pub default_manager_type: ManagerType,
    pub default_reap_dirt_threshold: ReapDirtThreshold,
    pub relax_durability_rules: bool,
    pub snapshot_initial: u64,
    pub snapshot_interval: u64,
}

impl Default for KernelOptions {
    fn default() -> Self {
        Self {
            default_manager_type: ManagerType::Local,
            default_reap_dirt_threshold: ReapDirtThreshold::kernel_default(),
            relax_durability_rules: false,
            snapshot_initial: DEFAULT_SNAPSHOT_INITIAL,
            snapshot_interval: DEFAULT_SNAPSHOT_INTERVAL,
        }
    }
}

impl KernelOptions {
    pub fn from_json(json: &str) -> KernelResult<Self> {
        let options: KernelOptions = serde_json::from_str(json)?;
        options
            .default_reap_dirt_threshold
            .validate_kernel_default()?;
        Ok(options)
    }
}

/// Per-phase work limits for cleaning up a terminated vat. `None` means
/// unlimited; a phase without its own limit uses `default`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CleanupBudget {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exports: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub imports: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kv: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshots: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transcripts: Option<u64>,
}

impl CleanupBudget {
    pub fn unlimited() -> Self {
        Self::default()
    }

    pub fn uniform(limit: u64) -> Self {
        Self {
            default: Some(limit),
            ..Self::default()
        }
    }

    pub(crate) fn exports_limit(&self) -> Option<u64> {
        self.exports.or(self.default)
    }

    pub(crate) fn imports_limit(&self) -> Option<u64> {
        self.imports.or(self.default)
    }

    pub(crate) fn kv_limit(&self) -> Option<u64> {
        self.kv.or(self.default)
    }

    pub(crate) fn snapshots_limit(&self) -> Option<u64> {
        self.snapshots.or(self.default)
    }

    pub(crate) fn transcripts_limit(&self) -> Option<u64> {
        self.transcripts.or(self.default)
    }
}

/// Whether the host currently allows terminated-vat cleanup, and how much.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanupPolicy {
    Disabled,
    Unlimited,
    Budget(CleanupBudget),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn threshold_json_shape() {
        let json = serde_json::to_string(&ReapDirtThreshold::kernel_default()).unwrap();
        assert_eq!(json, r#"{"deliveries":1,"gcKrefs":20,"computrons":"never"}"#);
        let parsed: ReapDirtThreshold = serde_json::from_str(r#"{"never":true}"#).unwrap();
        assert!(parsed.never);
        assert_eq!(parsed.deliveries, None);
        assert!(serde_json::from_str::<ReapDirtThreshold>(r#"{"deliveries":"soon"}"#).is_err());
    }

    #[test]
    fn overlay_prefers_overrides() {
        let base = ReapDirtThreshold::kernel_default();
        let merged = base.overlay(&ReapDirtThreshold {
            deliveries: Some(ThresholdValue::Count(100)),
            ..Default::default()
        });
        assert_eq!(merged.deliveries, Some(ThresholdValue::Count(100)));
        assert_eq!(merged.gc_krefs, Some(ThresholdValue::Count(20)));
        assert_eq!(merged.computrons, Some(ThresholdValue::Never));
    }

    #[test]
    fn kernel_options_from_json() {
        let options = KernelOptions::from_json(
            r#"{"defaultManagerType":"xs-worker","snapshotInterval":50,"relaxDurabilityRules":true}"#,
        )
        .unwrap();
        assert_eq!(options.default_manager_type, ManagerType::XsWorker);
        assert_eq!(options.snapshot_interval, 50);
        assert_eq!(options.snapshot_initial, DEFAULT_SNAPSHOT_INITIAL);
        assert!(options.relax_durability_rules);
        assert_eq!(
            options.default_reap_dirt_threshold,
            ReapDirtThreshold::kernel_default()
        );

        let bad = KernelOptions::from_json(r#"{"defaultReapDirtThreshold":{"deliveries":0}}"#);
        assert!(matches!(bad, Err(KernelError::InvalidThreshold(_))));
    }

    #[test]
    fn vat_options_keep_unknown_fields() {
        let raw = r#"{"name":"bootstrap","enableSetup":true,"reapDirtThreshold":{"deliveries":5}}"#;
        let options: VatOptions = serde_json::from_str(raw).unwrap();
        assert_eq!(options.name.as_deref(), Some("bootstrap"));
        assert_eq!(options.extra.get("enableSetup"), Some(&Value::Bool(true)));
        let back = serde_json::to_value(&options).unwrap();
        assert_eq!(back["enableSetup"], Value::Bool(true));
        assert_eq!(back["reapDirtThreshold"]["deliveries"], 5);
    }
}
