//! Recurrence calculator: next firing instant for a recurrence.
//!
//! Minute/hour/day/week steps are fixed durations. Month and year steps use
//! calendar addition (`chrono::Months`), which clamps to the last valid day:
//! Jan 31 + 1 month = Feb 28/29.

use chrono::{DateTime, Months, TimeDelta, Utc};

use chime_core::Result;
use chime_core::recurrence::{Recurrence, TimeUnit};

/// Next firing instant after `from`, or `None` if it is not representable.
pub fn next_occurrence(recurrence: &Recurrence, from: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let (n, unit) = recurrence.step();
    let n64 = i64::from(n);
    match unit {
        TimeUnit::Minute => from.checked_add_signed(TimeDelta::try_minutes(n64)?),
        TimeUnit::Hour => from.checked_add_signed(TimeDelta::try_hours(n64)?),
        TimeUnit::Day => from.checked_add_signed(TimeDelta::try_days(n64)?),
        TimeUnit::Week => from.checked_add_signed(TimeDelta::try_weeks(n64)?),
        TimeUnit::Month => from.checked_add_months(Months::new(n)),
        TimeUnit::Year => from.checked_add_months(Months::new(n.checked_mul(12)?)),
    }
}

/// Parse `spec` and compute the next instant. `Ok(None)` for one-shot specs
/// and unrepresentable instants; unparseable specs are an error.
pub fn next_from_spec(spec: &str, from: DateTime<Utc>) -> Result<Option<DateTime<Utc>>> {
    Ok(Recurrence::parse(spec)?.and_then(|recurrence| next_occurrence(&recurrence, from)))
}
