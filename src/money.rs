//! Money Conversion Module
//!
//! All monetary values are fixed-precision decimals with two fractional
//! digits (rupees.paise). The payment gateway speaks integer minor units
//! (paise); every conversion between the two goes through this module.
//!
//! ```rust
//! use rust_decimal::Decimal;
//! use treesindia::money::{to_minor_units, from_minor_units};
//!
//! let amount = Decimal::new(50050, 2); // 500.50
//! assert_eq!(to_minor_units(amount).unwrap(), 50050);
//! assert_eq!(from_minor_units(50050), amount);
//! ```

use rust_decimal::prelude::*;
use thiserror::Error;

/// Fractional digits carried by every amount
pub const MONEY_DECIMALS: u32 = 2;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MoneyError {
    #[error("Precision overflow: provided {provided} decimals, max allowed {max}")]
    PrecisionOverflow { provided: u32, max: u32 },

    #[error("Amount must be positive")]
    InvalidAmount,

    #[error("Amount too large, would overflow")]
    Overflow,
}

/// Validate a client-supplied amount: strictly positive, at most two decimals.
///
/// Returns the amount rescaled to exactly two decimals.
pub fn normalize_positive(amount: Decimal) -> Result<Decimal, MoneyError> {
    if amount <= Decimal::ZERO {
        return Err(MoneyError::InvalidAmount);
    }
    normalize(amount)
}

/// Rescale a (possibly signed) amount to two decimals, rejecting extra precision.
pub fn normalize(amount: Decimal) -> Result<Decimal, MoneyError> {
    let normalized = amount.normalize();
    if normalized.scale() > MONEY_DECIMALS {
        return Err(MoneyError::PrecisionOverflow {
            provided: normalized.scale(),
            max: MONEY_DECIMALS,
        });
    }
    let mut rescaled = normalized;
    rescaled.rescale(MONEY_DECIMALS);
    Ok(rescaled)
}

/// Convert rupees to paise for the gateway.
pub fn to_minor_units(amount: Decimal) -> Result<i64, MoneyError> {
    let normalized = normalize(amount)?;
    (normalized * Decimal::from(100))
        .to_i64()
        .ok_or(MoneyError::Overflow)
}

/// Convert gateway paise back to rupees.
pub fn from_minor_units(minor: i64) -> Decimal {
    Decimal::new(minor, MONEY_DECIMALS)
}

/// Apply a fractional policy (e.g. 0.5 for a half refund), rounding half-up
/// to the paisa.
pub fn apply_fraction(amount: Decimal, fraction: Decimal) -> Decimal {
    let fraction = fraction.clamp(Decimal::ZERO, Decimal::ONE);
    (amount * fraction).round_dp_with_strategy(MONEY_DECIMALS, RoundingStrategy::MidpointAwayFromZero)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_normalize_positive() {
        assert_eq!(normalize_positive(dec!(500)).unwrap().to_string(), "500.00");
        assert_eq!(normalize_positive(dec!(0.5)).unwrap().to_string(), "0.50");
        assert_eq!(normalize_positive(dec!(0)), Err(MoneyError::InvalidAmount));
        assert_eq!(normalize_positive(dec!(-1)), Err(MoneyError::InvalidAmount));
        assert_eq!(
            normalize_positive(dec!(1.005)),
            Err(MoneyError::PrecisionOverflow { provided: 3, max: 2 })
        );
    }

    #[test]
    fn test_trailing_zeros_are_not_precision() {
        assert_eq!(normalize(dec!(12.500)).unwrap(), dec!(12.50));
    }

    #[test]
    fn test_minor_units() {
        assert_eq!(to_minor_units(dec!(500)).unwrap(), 50000);
        assert_eq!(to_minor_units(dec!(0.01)).unwrap(), 1);
        assert_eq!(from_minor_units(250000), dec!(2500.00));
        assert!(to_minor_units(dec!(0.001)).is_err());
    }

    #[test]
    fn test_apply_fraction() {
        assert_eq!(apply_fraction(dec!(500), dec!(0.5)), dec!(250.00));
        assert_eq!(apply_fraction(dec!(99.99), dec!(0.5)), dec!(50.00));
        assert_eq!(apply_fraction(dec!(100), dec!(1.5)), dec!(100));
        assert_eq!(apply_fraction(dec!(100), dec!(-1)), dec!(0));
    }
}
