//! Monetary unit conversion and billing-period arithmetic.
//!
//! Amounts are carried internally as integer mills (1/1000 USD). USD values
//! crossing the collaborator boundary are `Decimal`, never floats.

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};

pub const MILLS_PER_USD: i64 = 1000;
pub const MILLS_PER_CENT: i64 = 10;

/// Convert USD to mills, rounding half away from zero.
pub fn usd_to_mills(usd: Decimal) -> i64 {
    let mills = (usd * Decimal::from(MILLS_PER_USD))
        .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero);
    mills.to_i64().unwrap_or(if mills.is_sign_negative() {
        i64::MIN
    } else {
        i64::MAX
    })
}

pub fn mills_to_usd(mills: i64) -> Decimal {
    Decimal::new(mills, 3)
}

pub fn cents_to_mills(cents: i64) -> i64 {
    cents.saturating_mul(MILLS_PER_CENT)
}

/// Convert mills to cents, rounding half away from zero.
pub fn mills_to_cents(mills: i64) -> i64 {
    Decimal::new(mills, 1)
        .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
        .to_i64()
        .unwrap_or(mills / MILLS_PER_CENT)
}

/// `$12.34` style rendering, two decimal places.
pub fn format_usd(amount: Decimal) -> String {
    let mut rounded = amount.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero);
    rounded.rescale(2);
    if rounded.is_sign_negative() {
        format!("-${}", rounded.abs())
    } else {
        format!("${}", rounded)
    }
}

/// Midnight UTC on the first day of the month after `now`.
pub fn next_month_reset(now: DateTime<Utc>) -> DateTime<Utc> {
    let (year, month) = if now.month() == 12 {
        (now.year() + 1, 1)
    } else {
        (now.year(), now.month() + 1)
    };

    NaiveDate::from_ymd_opt(year, month, 1)
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc())
        .unwrap_or(now)
}

/// Human form of a reset date, e.g. `November 1, 2026`.
pub fn format_reset_date(at: DateTime<Utc>) -> String {
    at.format("%B %-d, %Y").to_string()
}
