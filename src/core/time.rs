//! Shared timestamp/id helpers.
//!
//! Timestamps are persisted as fixed-width RFC 3339 strings with microsecond
//! precision and a `Z` suffix, so lexical order in SQLite equals time order.

use crate::core::error::CatalogError;
use chrono::{DateTime, Datelike, SecondsFormat, SubsecRound, Utc};
use ulid::Ulid;

pub fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

/// Drop sub-microsecond precision so in-memory values match stored ones.
pub fn normalize(ts: DateTime<Utc>) -> DateTime<Utc> {
    ts.trunc_subsecs(6)
}

pub fn to_db(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn from_db(raw: &str) -> Result<DateTime<Utc>, CatalogError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| CatalogError::ValidationError(format!("Invalid timestamp '{}': {}", raw, e)))
}

/// `YYYY-MM` partition label for the event log.
pub fn month_of(ts: &DateTime<Utc>) -> String {
    format!("{:04}-{:02}", ts.year(), ts.month())
}

/// The partition label `months` calendar months before `ts`.
pub fn month_minus(ts: &DateTime<Utc>, months: u32) -> String {
    let total = ts.year() as i64 * 12 + (ts.month0() as i64) - months as i64;
    let year = total.div_euclid(12);
    let month = total.rem_euclid(12) + 1;
    format!("{:04}-{:02}", year, month)
}

pub fn new_id(prefix: &str) -> String {
    format!("{}_{}", prefix, Ulid::new())
}
