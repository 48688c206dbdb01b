use crate::{
    error::KernelError,
    ids::{KernelSlot, VatId},
    options::CleanupBudget,
};
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

/// Serialized capability data: an opaque body plus the krefs it mentions.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CapData {
    pub body: String,
    pub slots: Vec<KernelSlot>,
}

impl CapData {
    pub fn new(body: impl Into<String>, slots: Vec<KernelSlot>) -> Self {
        Self {
            body: body.into(),
            slots,
        }
    }
}

/// A message on its way to an object or promise.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub methargs: CapData,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<KernelSlot>,
}

/// Items carried by the run queue and the acceptance queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum RunQueueEvent {
    #[serde(rename = "send")]
    Send { target: KernelSlot, msg: Message },
    #[serde(rename = "notify")]
    Notify {
        #[serde(rename = "vatID")]
        vat_id: VatId,
        kpid: KernelSlot,
    },
    #[serde(rename = "dropExports")]
    DropExports {
        #[serde(rename = "vatID")]
        vat_id: VatId,
        krefs: Vec<KernelSlot>,
    },
    #[serde(rename = "retireExports")]
    RetireExports {
        #[serde(rename = "vatID")]
        vat_id: VatId,
        krefs: Vec<KernelSlot>,
    },
    #[serde(rename = "retireImports")]
    RetireImports {
        #[serde(rename = "vatID")]
        vat_id: VatId,
        krefs: Vec<KernelSlot>,
    },
    #[serde(rename = "bringOutYourDead")]
    BringOutYourDead {
        #[serde(rename = "vatID")]
        vat_id: VatId,
    },
    #[serde(rename = "cleanup-terminated-vat")]
    CleanupTerminatedVat {
        #[serde(rename = "vatID")]
        vat_id: VatId,
        budget: CleanupBudget,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum GcActionKind {
    DropExport,
    RetireExport,
    RetireImport,
}

impl GcActionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            GcActionKind::DropExport => "dropExport",
            GcActionKind::RetireExport => "retireExport",
            GcActionKind::RetireImport => "retireImport",
        }
    }
}

impl FromStr for GcActionKind {
    type Err = KernelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "dropExport" => Ok(GcActionKind::DropExport),
            "retireExport" => Ok(GcActionKind::RetireExport),
            "retireImport" => Ok(GcActionKind::RetireImport),
            _ => Err(KernelError::InvalidGcAction(s.to_owned())),
        }
    }
}

/// A pending GC notice for one vat, stored as `"<vatID> <kind> <koid>"`.
///
/// Ordering follows the stored string so that the persisted set sorts the
/// same way it is compared.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct GcAction {
    pub vat_id: VatId,
    pub kind: GcActionKind,
    pub kref: KernelSlot,
}

impl GcAction {
    pub fn new(vat_id: VatId, kind: GcActionKind, kref: KernelSlot) -> Self {
        Self { vat_id, kind, kref }
    }
}

impl fmt::Display for GcAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.vat_id, self.kind.as_str(), self.kref)
    }
}

impl FromStr for GcAction {
    type Err = KernelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || KernelError::InvalidGcAction(s.to_owned());
        let mut parts = s.split(' ');
        let (Some(vat), Some(kind), Some(kref), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(invalid());
        };
        let vat_id: VatId = vat.parse().map_err(|_| invalid())?;
        let kind: GcActionKind = kind.parse()?;
        let kref: KernelSlot = kref.parse().map_err(|_| invalid())?;
        if !kref.is_object() {
            return Err(invalid());
        }
        Ok(Self { vat_id, kind, kref })
    }
}

impl PartialOrd for GcAction {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for GcAction {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.to_string().cmp(&other.to_string())
    }
}

impl TryFrom<String> for GcAction {
    type Error = KernelError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<GcAction> for String {
    fn from(value: GcAction) -> Self {
        value.to_string()
    }
}

/// Sorts krefs by their rendered form, the order persisted data uses.
pub(crate) fn sort_krefs(krefs: &mut [KernelSlot]) {
    krefs.sort_by_cached_key(|k| k.to_string());
}
