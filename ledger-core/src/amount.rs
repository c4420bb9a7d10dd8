//! Amount precision
//!
//! Money is held as `Decimal`; the distribution side works in integer minor
//! units. `Precision` converts between the two without rounding.

use crate::error::{Error, Result};
use rust_decimal::Decimal;

/// Fixed number of fractional digits for every amount in the ledger
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Precision {
    scale: u32,
}

impl Precision {
    /// Create precision with `scale` fractional digits
    pub fn new(scale: u32) -> Self {
        Self { scale }
    }

    /// Fractional digits
    pub fn scale(&self) -> u32 {
        self.scale
    }

    /// Validate a caller-supplied amount: positive, no finer than `scale`.
    /// Returns the amount rescaled to exactly `scale` digits.
    pub fn check(&self, amount: Decimal) -> Result<Decimal> {
        if amount <= Decimal::ZERO {
            return Err(Error::InvalidAmount(format!("{} is not positive", amount)));
        }
        let normalized = amount.normalize();
        if normalized.scale() > self.scale {
            return Err(Error::InvalidAmount(format!(
                "{} has more than {} fractional digits",
                amount, self.scale
            )));
        }
        let mut rescaled = normalized;
        rescaled.rescale(self.scale);
        if rescaled.scale() != self.scale {
            return Err(Error::InvalidAmount(format!(
                "{} is out of range at {} fractional digits",
                amount, self.scale
            )));
        }
        Ok(rescaled)
    }

    /// Exact integer count of minor units
    pub fn to_units(&self, amount: Decimal) -> Result<u64> {
        let amount = self.check(amount)?;
        u64::try_from(amount.mantissa())
            .map_err(|_| Error::InvalidAmount(format!("{} exceeds the unit range", amount)))
    }

    /// Decimal amount of `units` minor units
    pub fn from_units(&self, units: u64) -> Decimal {
        Decimal::from_i128_with_scale(units as i128, self.scale)
    }
}

impl Default for Precision {
    fn default() -> Self {
        Self::new(2)
    }
}
