//! Request time-window resolution.
//!
//! Inbound queries carry either absolute epoch-millisecond bounds
//! (`start_absolute` / `end_absolute`) or relative ones
//! (`start_relative: {value, unit}`, meaning "N units ago"). Relative bounds
//! are resolved to absolute instants once, at evaluation time, so every later
//! consumer (staleness checks, chunk boundaries, response trimming) sees the
//! same window.

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::error::{CacheError, Result};

/// An absolute time window in epoch milliseconds.
///
/// `end_ms = None` means "up to now": the request had no upper bound and the
/// upstream call omits `end_absolute`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeRange {
    pub start_ms: i64,
    pub end_ms: Option<i64>,
}

impl TimeRange {
    pub fn new(start_ms: i64, end_ms: Option<i64>) -> Self {
        Self { start_ms, end_ms }
    }

    /// Whether a datapoint timestamp falls inside this window.
    pub fn contains(&self, ts_ms: i64) -> bool {
        ts_ms >= self.start_ms && self.end_ms.map_or(true, |end| ts_ms <= end)
    }

    /// Resolve the window described by a query body, relative bounds against
    /// `now`. Fails when no start bound is present.
    pub fn resolve(body: &Value, now: DateTime<Utc>) -> Result<Self> {
        let start_ms = if let Some(abs) = body.get("start_absolute") {
            epoch_ms(abs)?
        } else if let Some(rel) = body.get("start_relative") {
            rewind(now, relative_ms(rel)?)?
        } else {
            return Err(CacheError::BadRequest(
                "query has neither start_absolute nor start_relative".into(),
            ));
        };

        let end_ms = if let Some(abs) = body.get("end_absolute") {
            Some(epoch_ms(abs)?)
        } else if let Some(rel) = body.get("end_relative") {
            Some(rewind(now, relative_ms(rel)?)?)
        } else {
            None
        };

        Ok(Self { start_ms, end_ms })
    }
}

/// Step back `offset_ms` from `now`. Values come straight off the wire, so
/// arithmetic that would wrap rejects the request instead.
fn rewind(now: DateTime<Utc>, offset_ms: i64) -> Result<i64> {
    now.timestamp_millis().checked_sub(offset_ms).ok_or_else(|| {
        CacheError::BadRequest(format!("relative range out of bounds: {offset_ms}ms ago"))
    })
}

/// Parse an absolute bound. The upstream dialect allows both numbers and
/// numeric strings.
fn epoch_ms(value: &Value) -> Result<i64> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .ok_or_else(|| CacheError::BadRequest(format!("bad epoch value: {n}"))),
        Value::String(s) => s
            .parse::<i64>()
            .map_err(|_| CacheError::BadRequest(format!("bad epoch value: {s}"))),
        other => Err(CacheError::BadRequest(format!(
            "bad epoch value: {other}"
        ))),
    }
}

/// Convert a `{value, unit}` relative offset to milliseconds.
fn relative_ms(rel: &Value) -> Result<i64> {
    let value = rel
        .get("value")
        .map(epoch_ms)
        .transpose()?
        .ok_or_else(|| CacheError::BadRequest("relative range missing value".into()))?;
    let unit = rel
        .get("unit")
        .and_then(|u| u.as_str())
        .ok_or_else(|| CacheError::BadRequest("relative range missing unit".into()))?;

    let unit_ms: i64 = match unit {
        "milliseconds" => 1,
        "seconds" => 1_000,
        "minutes" => 60_000,
        "hours" => 3_600_000,
        "days" => 86_400_000,
        "weeks" => 7 * 86_400_000,
        "months" => 30 * 86_400_000,
        "years" => 365 * 86_400_000,
        other => {
            return Err(CacheError::BadRequest(format!(
                "unknown relative unit: {other}"
            )))
        }
    };
    value.checked_mul(unit_ms).ok_or_else(|| {
        CacheError::BadRequest(format!("relative range overflows: {value} {unit}"))
    })
}
