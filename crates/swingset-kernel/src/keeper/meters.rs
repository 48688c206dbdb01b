use super::KernelKeeper;
use crate::{
    error::{KernelError, KernelResult},
    ids::MeterId,
    kv::{bump_counter, parse_value},
};
use std::fmt;
use swingset_store::KvStore;

const UNLIMITED: &str = "unlimited";

/// Computrons left on a meter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MeterRemaining {
    Unlimited,
    Amount(u128),
}

impl fmt::Display for MeterRemaining {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MeterRemaining::Unlimited => f.write_str(UNLIMITED),
            MeterRemaining::Amount(n) => write!(f, "{n}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Meter {
    pub remaining: MeterRemaining,
    pub threshold: u128,
}

impl<S: KvStore> KernelKeeper<S> {
    fn meter_field(&self, meter: MeterId, field: &str) -> KernelResult<(String, String)> {
        let key = format!("{meter}.{field}");
        let raw = self
            .storage
            .get(&key)?
            .ok_or_else(|| KernelError::UnknownMeter(meter.to_string()))?;
        Ok((key, raw))
    }

    fn meter_remaining(&self, meter: MeterId) -> KernelResult<MeterRemaining> {
        let (key, raw) = self.meter_field(meter, "remaining")?;
        if raw == UNLIMITED {
            Ok(MeterRemaining::Unlimited)
        } else {
            Ok(MeterRemaining::Amount(parse_value(&key, &raw)?))
        }
    }

    fn meter_threshold(&self, meter: MeterId) -> KernelResult<u128> {
        let (key, raw) = self.meter_field(meter, "threshold")?;
        parse_value(&key, &raw)
    }

    pub fn allocate_meter(
        &mut self,
        remaining: MeterRemaining,
        threshold: u128,
    ) -> KernelResult<MeterId> {
        let meter = MeterId(bump_counter(&mut self.storage, "meter.nextID")?);
        self.storage
            .set(&format!("{meter}.remaining"), &remaining.to_string())?;
        self.storage
            .set(&format!("{meter}.threshold"), &threshold.to_string())?;
        Ok(meter)
    }

    /// Refills a meter. Unlimited meters are left alone.
    pub fn add_meter_remaining(&mut self, meter: MeterId, delta: u128) -> KernelResult<()> {
        if let MeterRemaining::Amount(n) = self.meter_remaining(meter)? {
            let key = format!("{meter}.remaining");
            let total = n
                .checked_add(delta)
                .ok_or_else(|| KernelError::Overflow(key.clone()))?;
            self.storage.set(&key, &total.to_string())?;
        }
        Ok(())
    }

    pub fn set_meter_threshold(&mut self, meter: MeterId, threshold: u128) -> KernelResult<()> {
        self.meter_field(meter, "threshold")?;
        self.storage
            .set(&format!("{meter}.threshold"), &threshold.to_string())?;
        Ok(())
    }

    pub fn get_meter(&self, meter: MeterId) -> KernelResult<Meter> {
        Ok(Meter {
            remaining: self.meter_remaining(meter)?,
            threshold: self.meter_threshold(meter)?,
        })
    }

    /// Whether the meter can cover `spent`. Read-only.
    pub fn check_meter(&self, meter: MeterId, spent: u128) -> KernelResult<bool> {
        Ok(match self.meter_remaining(meter)? {
            MeterRemaining::Unlimited => true,
            MeterRemaining::Amount(n) => n >= spent,
        })
    }

    /// Deducts `spent`, clamping at zero. Returns true only on the deduction
    /// that takes the meter from at-or-above its threshold to below it.
    pub fn deduct_meter(&mut self, meter: MeterId, spent: u128) -> KernelResult<bool> {
        let MeterRemaining::Amount(old) = self.meter_remaining(meter)? else {
            return Ok(false);
        };
        let threshold = self.meter_threshold(meter)?;
        let remaining = old.saturating_sub(spent);
        self.storage
            .set(&format!("{meter}.remaining"), &remaining.to_string())?;
        Ok(remaining < threshold && old >= threshold)
    }

    pub fn delete_meter(&mut self, meter: MeterId) -> KernelResult<()> {
        self.storage.delete(&format!("{meter}.remaining"))?;
        self.storage.delete(&format!("{meter}.threshold"))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keeper::test_keeper;

    #[test]
    fn deduction_notifies_once_per_crossing() {
        let mut keeper = test_keeper();
        let meter = keeper
            .allocate_meter(MeterRemaining::Amount(100), 50)
            .expect("allocate");
        assert_eq!(meter, MeterId(1));

        assert!(keeper.check_meter(meter, 100).unwrap());
        assert!(!keeper.check_meter(meter, 101).unwrap());

        assert!(!keeper.deduct_meter(meter, 40).unwrap());
        assert!(keeper.deduct_meter(meter, 20).unwrap());
        assert!(!keeper.deduct_meter(meter, 20).unwrap());
        assert_eq!(
            keeper.get_meter(meter).unwrap(),
            Meter {
                remaining: MeterRemaining::Amount(20),
                threshold: 50
            }
        );

        // Overspend clamps to zero rather than failing.
        assert!(!keeper.deduct_meter(meter, 1_000).unwrap());
        assert_eq!(
            keeper.get_meter(meter).unwrap().remaining,
            MeterRemaining::Amount(0)
        );

        keeper.add_meter_remaining(meter, 70).unwrap();
        assert!(keeper.deduct_meter(meter, 30).unwrap());
    }

    #[test]
    fn unlimited_meters_never_run_out() {
        let mut keeper = test_keeper();
        let meter = keeper
            .allocate_meter(MeterRemaining::Unlimited, 10)
            .unwrap();
        keeper.add_meter_remaining(meter, 5).unwrap();
        assert!(keeper.check_meter(meter, u128::MAX).unwrap());
        assert!(!keeper.deduct_meter(meter, u128::MAX).unwrap());
        assert_eq!(
            keeper.storage().get("m1.remaining").unwrap().as_deref(),
            Some("unlimited")
        );

        keeper.delete_meter(meter).unwrap();
        assert!(matches!(
            keeper.get_meter(meter),
            Err(KernelError::UnknownMeter(_))
        ));
    }

    #[test]
    fn large_values_survive_storage() {
        let mut keeper = test_keeper();
        let big = u128::from(u64::MAX) * 4;
        let meter = keeper
            .allocate_meter(MeterRemaining::Amount(big), big / 2)
            .unwrap();
        keeper.set_meter_threshold(meter, 7).unwrap();
        let read = keeper.get_meter(meter).unwrap();
        assert_eq!(read.remaining, MeterRemaining::Amount(big));
        assert_eq!(read.threshold, 7);
    }

    #[test]
    fn refill_overflow_is_refused() {
        let mut keeper = test_keeper();
        let meter = keeper
            .allocate_meter(MeterRemaining::Amount(u128::MAX - 1), 0)
            .unwrap();
        assert!(matches!(
            keeper.add_meter_remaining(meter, 2),
            Err(KernelError::Overflow(_))
        ));
        assert_eq!(
            keeper.get_meter(meter).unwrap().remaining,
            MeterRemaining::Amount(u128::MAX - 1)
        );
        keeper.add_meter_remaining(meter, 1).unwrap();
    }
}
