//! Billing interval arithmetic
//!
//! Month-based intervals use calendar months with day clamping, so a
//! billing anchor of Jan 31 lands on Feb 28 (or 29) rather than drifting
//! into March.

use crate::models::BillingInterval;
use chrono::{DateTime, Duration, Months, Utc};

/// Advance `from` by `count` intervals.
pub fn advance(
    from: DateTime<Utc>,
    interval: BillingInterval,
    count: u32,
) -> DateTime<Utc> {
    match interval {
        BillingInterval::Daily => from + Duration::days(i64::from(count)),
        BillingInterval::Weekly => from + Duration::weeks(i64::from(count)),
        BillingInterval::Monthly => add_months(from, count),
        BillingInterval::Quarterly => add_months(from, 3 * count),
        BillingInterval::Yearly => add_months(from, 12 * count),
    }
}

fn add_months(from: DateTime<Utc>, months: u32) -> DateTime<Utc> {
    // Out-of-range dates (year ~262000) are unreachable for real billing
    // anchors; fall back to the input rather than panic.
    from.checked_add_months(Months::new(months)).unwrap_or(from)
}
