//! Money Conversion Module
//!
//! Amounts are carried as `rust_decimal::Decimal` in dollars inside the engine
//! and as `uint256` minor units (cents) on the contract. All conversions MUST
//! go through this module.
//!
//! ## Rules
//! 1. At most [`MONEY_DECIMALS`] fractional digits; more is an error, never rounded.
//! 2. Negative amounts are rejected.
//! 3. Zero is allowed (a withholding can be zero, a gross amount cannot; the
//!    caller checks the latter).

use rust_decimal::prelude::*;
use thiserror::Error;

/// Fractional digits of the settlement currency (USD cents)
pub const MONEY_DECIMALS: u32 = 2;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MoneyError {
    #[error("Precision overflow: provided {provided} decimals, max allowed {max}")]
    PrecisionOverflow { provided: u32, max: u32 },

    #[error("Amount must not be negative")]
    Negative,

    #[error("Amount too large, would overflow")]
    Overflow,

    #[error("Invalid format: {0}")]
    InvalidFormat(String),
}

/// Parse a client-supplied decimal string ("1250.00") into an amount
pub fn parse_amount(s: &str) -> Result<Decimal, MoneyError> {
    let s = s.trim();
    let value = Decimal::from_str(s).map_err(|_| MoneyError::InvalidFormat(s.to_string()))?;
    check_amount(value)?;
    Ok(value)
}

/// Validate sign and precision of an amount
pub fn check_amount(value: Decimal) -> Result<(), MoneyError> {
    if value.is_sign_negative() && !value.is_zero() {
        return Err(MoneyError::Negative);
    }
    let scale = value.normalize().scale();
    if scale > MONEY_DECIMALS {
        return Err(MoneyError::PrecisionOverflow {
            provided: scale,
            max: MONEY_DECIMALS,
        });
    }
    Ok(())
}

/// Convert dollars to contract minor units (cents)
pub fn to_minor_units(value: Decimal) -> Result<u128, MoneyError> {
    check_amount(value)?;
    let scaled = value
        .checked_mul(Decimal::from(10u64.pow(MONEY_DECIMALS)))
        .ok_or(MoneyError::Overflow)?;
    scaled.trunc().to_u128().ok_or(MoneyError::Overflow)
}

/// Convert contract minor units back to dollars
pub fn from_minor_units(units: u128) -> Result<Decimal, MoneyError> {
    let mut value = Decimal::from_u128(units).ok_or(MoneyError::Overflow)?;
    value
        .set_scale(MONEY_DECIMALS)
        .map_err(|_| MoneyError::Overflow)?;
    Ok(value)
}
