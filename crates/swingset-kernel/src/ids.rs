//! Identifiers and slot references.
//!
//! Every ID has a canonical string form that is used verbatim as part of
//! storage keys, so `Display` and `FromStr` must round-trip exactly.

use crate::error::KernelError;
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

fn parse_decimal(digits: &str) -> Option<u64> {
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    // Leading zeros would give two spellings of one ID.
    if digits.len() > 1 && digits.starts_with('0') {
        return None;
    }
    digits.parse().ok()
}

macro_rules! prefixed_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub struct $name(pub u64);

        impl $name {
            pub const PREFIX: &'static str = $prefix;
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}{}", $prefix, self.0)
            }
        }

        impl FromStr for $name {
            type Err = KernelError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                s.strip_prefix($prefix)
                    .and_then(parse_decimal)
                    .map($name)
                    .ok_or_else(|| KernelError::InvalidId(s.to_owned()))
            }
        }

        impl TryFrom<String> for $name {
            type Error = KernelError;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                value.parse()
            }
        }

        impl From<$name> for String {
            fn from(value: $name) -> Self {
                value.to_string()
            }
        }
    };
}

prefixed_id!(
    /// A vat, rendered `v<N>`.
    VatId,
    "v"
);
prefixed_id!(
    /// A device, rendered `d<N>`.
    DeviceId,
    "d"
);
prefixed_id!(MeterId, "m");

/// The three kinds of thing a slot can name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SlotKind {
    Object,
    Promise,
    Device,
}

impl SlotKind {
    pub fn letter(self) -> char {
        match self {
            SlotKind::Object => 'o',
            SlotKind::Promise => 'p',
            SlotKind::Device => 'd',
        }
    }

    fn from_letter(c: char) -> Option<Self> {
        match c {
            'o' => Some(SlotKind::Object),
            'p' => Some(SlotKind::Promise),
            'd' => Some(SlotKind::Device),
            _ => None,
        }
    }
}

/// A kernel-global reference: `ko<N>`, `kp<N>`, or `kd<N>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct KernelSlot {
    pub kind: SlotKind,
    pub id: u64,
}

impl KernelSlot {
    pub fn object(id: u64) -> Self {
        Self {
            kind: SlotKind::Object,
            id,
        }
    }

    pub fn promise(id: u64) -> Self {
        Self {
            kind: SlotKind::Promise,
            id,
        }
    }

    pub fn device(id: u64) -> Self {
        Self {
            kind: SlotKind::Device,
            id,
        }
    }

    pub fn is_object(&self) -> bool {
        self.kind == SlotKind::Object
    }

    pub fn is_promise(&self) -> bool {
        self.kind == SlotKind::Promise
    }
}

impl fmt::Display for KernelSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "k{}{}", self.kind.letter(), self.id)
    }
}

impl FromStr for KernelSlot {
    type Err = KernelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || KernelError::InvalidSlot(s.to_owned());
        let rest = s.strip_prefix('k').ok_or_else(invalid)?;
        let mut chars = rest.chars();
        let kind = chars
            .next()
            .and_then(SlotKind::from_letter)
            .ok_or_else(invalid)?;
        let id = parse_decimal(chars.as_str()).ok_or_else(invalid)?;
        Ok(Self { kind, id })
    }
}

impl TryFrom<String> for KernelSlot {
    type Error = KernelError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<KernelSlot> for String {
    fn from(value: KernelSlot) -> Self {
        value.to_string()
    }
}

/// Marker on vat-allocated object refs that live in the vat's virtual
/// object manager rather than its heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum VirtualKind {
    /// `o+v<N>/...`: virtual, lost on upgrade.
    Virtual,
    /// `o+d<N>/...`: durable, survives upgrade.
    Durable,
}

/// A vat- or device-local reference such as `o+4`, `o-50`, `p+12`, `d-70`,
/// or `o+d10/3:1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct VatSlot {
    pub kind: SlotKind,
    pub allocated_by_vat: bool,
    pub id: u64,
    pub virtual_kind: Option<VirtualKind>,
    pub subid: Option<u64>,
    pub facet: Option<u64>,
}

impl VatSlot {
    pub fn new(kind: SlotKind, allocated_by_vat: bool, id: u64) -> Self {
        Self {
            kind,
            allocated_by_vat,
            id,
            virtual_kind: None,
            subid: None,
            facet: None,
        }
    }

    pub fn is_durable(&self) -> bool {
        self.virtual_kind == Some(VirtualKind::Durable)
    }
}

impl fmt::Display for VatSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.allocated_by_vat { '+' } else { '-' };
        write!(f, "{}{}", self.kind.letter(), sign)?;
        match self.virtual_kind {
            Some(VirtualKind::Virtual) => f.write_str("v")?,
            Some(VirtualKind::Durable) => f.write_str("d")?,
            None => {}
        }
        write!(f, "{}", self.id)?;
        if let Some(subid) = self.subid {
            write!(f, "/{subid}")?;
        }
        if let Some(facet) = self.facet {
            write!(f, ":{facet}")?;
        }
        Ok(())
    }
}

impl FromStr for VatSlot {
    type Err = KernelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || KernelError::InvalidSlot(s.to_owned());
        let mut chars = s.chars();
        let kind = chars
            .next()
            .and_then(SlotKind::from_letter)
            .ok_or_else(invalid)?;
        let allocated_by_vat = match chars.next() {
            Some('+') => true,
            Some('-') => false,
            _ => return Err(invalid()),
        };
        let mut rest = chars.as_str();
        let mut virtual_kind = None;
        if kind == SlotKind::Object && allocated_by_vat {
            if let Some(r) = rest.strip_prefix('v') {
                virtual_kind = Some(VirtualKind::Virtual);
                rest = r;
            } else if let Some(r) = rest.strip_prefix('d') {
                virtual_kind = Some(VirtualKind::Durable);
                rest = r;
            }
        }
        let (rest, facet) = match rest.split_once(':') {
            Some((head, facet)) => (head, Some(parse_decimal(facet).ok_or_else(invalid)?)),
            None => (rest, None),
        };
        let (id, subid) = match rest.split_once('/') {
            Some((id, subid)) => (id, Some(parse_decimal(subid).ok_or_else(invalid)?)),
            None => (rest, None),
        };
        let id = parse_decimal(id).ok_or_else(invalid)?;
        if (subid.is_some() || facet.is_some()) && virtual_kind.is_none() {
            return Err(invalid());
        }
        Ok(Self {
            kind,
            allocated_by_vat,
            id,
            virtual_kind,
            subid,
            facet,
        })
    }
}

impl TryFrom<String> for VatSlot {
    type Error = KernelError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<VatSlot> for String {
    fn from(value: VatSlot) -> Self {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_round_trip() {
        assert_eq!("v12".parse::<VatId>().unwrap(), VatId(12));
        assert_eq!(DeviceId(7).to_string(), "d7");
        assert_eq!("m3".parse::<MeterId>().unwrap().to_string(), "m3");
        for bad in ["v", "vx", "d1", "v01", "v-1", "V1"] {
            assert!(bad.parse::<VatId>().is_err(), "{bad} should not parse");
        }
    }

    #[test]
    fn kernel_slots_parse() {
        let ko: KernelSlot = "ko20".parse().unwrap();
        assert_eq!(ko, KernelSlot::object(20));
        assert_eq!("kp40".parse::<KernelSlot>().unwrap(), KernelSlot::promise(40));
        assert_eq!(KernelSlot::device(30).to_string(), "kd30");
        for bad in ["k20", "kx1", "ko", "o+1", "ko2a"] {
            assert!(bad.parse::<KernelSlot>().is_err(), "{bad} should not parse");
        }
        let json = serde_json::to_string(&ko).unwrap();
        assert_eq!(json, "\"ko20\"");
    }

    #[test]
    fn vat_slots_parse() {
        let export: VatSlot = "o+4".parse().unwrap();
        assert!(export.allocated_by_vat);
        assert_eq!(export.kind, SlotKind::Object);
        assert_eq!(export.id, 4);

        let import: VatSlot = "p-60".parse().unwrap();
        assert!(!import.allocated_by_vat);
        assert_eq!(import.kind, SlotKind::Promise);

        for s in ["o+v12/3", "o+d10/3:1", "d-70", "o+0"] {
            assert_eq!(s.parse::<VatSlot>().unwrap().to_string(), s);
        }
        assert!("o+d10/3".parse::<VatSlot>().unwrap().is_durable());
        for bad in ["x+1", "o*1", "o+", "o-v1", "o+1/2", "p+d1"] {
            assert!(bad.parse::<VatSlot>().is_err(), "{bad} should not parse");
        }
    }
}
