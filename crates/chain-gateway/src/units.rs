//! Base-unit conversion helpers
//!
//! RPC endpoints speak hex quantities in base units (wei, lamports, token
//! atoms); the rest of the gateway speaks whole-unit decimals.

use dhansetu_common::{Error, Result};
use rust_decimal::Decimal;

/// Parse a `0x`-prefixed hex quantity into a u128.
pub fn parse_hex_quantity(raw: &str) -> Result<u128> {
    let digits = raw
        .strip_prefix("0x")
        .ok_or_else(|| Error::ExternalService(format!("Expected hex quantity, got {raw}")))?;

    u128::from_str_radix(digits, 16)
        .map_err(|e| Error::ExternalService(format!("Invalid hex quantity {raw}: {e}")))
}

/// Convert a base-unit amount into whole units given the decimal scale.
pub fn base_units_to_decimal(base: u128, decimals: u32) -> Result<Decimal> {
    let mut amount = Decimal::try_from(base as f64)
        .map_err(|e| Error::ExternalService(format!("Amount out of range: {e}")))?;

    // Exact path for values that fit Decimal's 96-bit mantissa
    if let Ok(exact) = Decimal::try_from(base) {
        amount = exact;
    }

    amount
        .checked_div(pow10(decimals)?)
        .ok_or_else(|| Error::ExternalService("Decimal scale overflow".into()))
}

/// Convert a whole-unit decimal amount into an integer base-unit string.
///
/// Rejects amounts with more fractional digits than the scale supports.
pub fn decimal_to_base_units(amount: Decimal, decimals: u32) -> Result<String> {
    let scaled = amount
        .checked_mul(pow10(decimals)?)
        .ok_or_else(|| Error::Validation(format!("Amount {amount} overflows {decimals} decimals")))?;

    let normalized = scaled.normalize();
    if normalized.fract() != Decimal::ZERO {
        return Err(Error::Validation(format!(
            "Amount {amount} has more than {decimals} decimal places"
        )));
    }

    Ok(normalized.trunc().to_string())
}

fn pow10(decimals: u32) -> Result<Decimal> {
    let mut value = Decimal::ONE;
    let ten = Decimal::from(10u32);
    for _ in 0..decimals {
        value = value
            .checked_mul(ten)
            .ok_or_else(|| Error::Validation(format!("Unsupported decimal scale {decimals}")))?;
    }
    Ok(value)
}
