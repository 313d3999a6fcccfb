//! Fixed-point monetary helpers.
//!
//! All balances are `rust_decimal::Decimal` normalized to 8 fractional
//! digits. Binary floating point never represents a monetary amount —
//! accumulated rounding would eventually break the ledger invariant
//! `used + reserved <= limit + overdraft`.

use rust_decimal::Decimal;
use std::str::FromStr;

/// Fractional digits carried by every monetary column.
pub const USD_SCALE: u32 = 8;

/// Normalize an amount to the ledger's fixed scale (banker's rounding).
pub fn round_usd(amount: Decimal) -> Decimal {
    amount.round_dp(USD_SCALE)
}

/// Parse a canonical decimal string as stored in monetary columns.
pub fn parse_usd(raw: &str) -> Result<Decimal, rust_decimal::Error> {
    Decimal::from_str(raw.trim()).map(round_usd)
}

/// Canonical string form for persisting an amount.
pub fn fmt_usd(amount: Decimal) -> String {
    round_usd(amount).normalize().to_string()
}
