//! Normalization of raw feed rows into fixed-shape [`TrafficRecord`]s.
//!
//! The feed is loosely typed: numbers usually arrive as strings, any field
//! may be missing. Every field is defaulted on its own so one absent column
//! never drops the whole row.

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::error::PipelineError;

/// One feed row as delivered by the data source.
pub type RawRecord = Map<String, Value>;

/// Placeholder for any absent string field.
pub const UNKNOWN: &str = "Unknown";

/// Zone the feed reports its offset-less `data_as_of` values in.
pub const DEFAULT_SOURCE_TZ: Tz = chrono_tz::America::New_York;

/// One sensor reading for one road link at one point in time.
///
/// `(link_id, timestamp)` is the natural key in storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrafficRecord {
    pub timestamp: DateTime<Utc>,
    pub link_id: String,
    pub link_name: String,
    pub borough: String,
    /// Miles per hour, never negative.
    pub speed: f64,
    /// Seconds, never negative.
    pub travel_time: f64,
    pub status: String,
    /// Source observation time exactly as received.
    pub data_as_of: String,
    pub link_points: String,
    pub encoded_poly_line: String,
    pub owner: String,
}

/// Normalizes a batch, skipping rows with non-numeric measurements.
///
/// `ingested_at` is shared by every row whose `data_as_of` is missing or
/// unparsable, so two such rows for the same link land on the same key.
/// Offset-less timestamps are read as wall-clock time in `source_tz`.
pub fn normalize(
    raw: &[RawRecord],
    ingested_at: DateTime<Utc>,
    source_tz: Tz,
) -> Vec<TrafficRecord> {
    let mut records = Vec::with_capacity(raw.len());

    for (index, row) in raw.iter().enumerate() {
        match normalize_record(row, ingested_at, source_tz) {
            Ok(record) => records.push(record),
            Err(e) => {
                warn!(
                    index,
                    link_id = %string_field(row, "id"),
                    error = %e,
                    "Skipping malformed record"
                );
            }
        }
    }

    debug!(
        received = raw.len(),
        normalized = records.len(),
        "Batch normalized"
    );
    records
}

/// Normalizes a single feed row.
///
/// # Errors
///
/// Returns [`PipelineError::MalformedRecord`] if `speed` or `travel_time`
/// holds a value that cannot be read as a number.
pub fn normalize_record(
    row: &RawRecord,
    ingested_at: DateTime<Utc>,
    source_tz: Tz,
) -> Result<TrafficRecord, PipelineError> {
    let data_as_of = string_field(row, "data_as_of");
    let timestamp = parse_timestamp_in(&data_as_of, source_tz).unwrap_or(ingested_at);

    Ok(TrafficRecord {
        timestamp,
        link_id: string_field(row, "id"),
        link_name: string_field(row, "link_name"),
        borough: string_field(row, "borough"),
        speed: numeric_field(row, "speed")?,
        travel_time: numeric_field(row, "travel_time")?,
        status: string_field(row, "status"),
        data_as_of,
        link_points: string_field(row, "link_points"),
        encoded_poly_line: string_field(row, "encoded_poly_line"),
        owner: string_field(row, "owner"),
    })
}

/// Parses a timestamp, reading offset-less values as UTC.
pub fn parse_timestamp(text: &str) -> Option<DateTime<Utc>> {
    parse_timestamp_in(text, Tz::UTC)
}

/// Parses the feed's observation time.
///
/// Accepts RFC 3339 (a trailing `Z` is UTC) and offset-less ISO-8601 date
/// times, which are read as local time in `zone`. A local time that falls
/// in a DST fold resolves to the earlier instant; one inside a DST gap does
/// not exist and yields `None`, as does anything unparsable.
pub fn parse_timestamp_in(text: &str, zone: Tz) -> Option<DateTime<Utc>> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }

    if let Ok(ts) = DateTime::parse_from_rfc3339(text) {
        return Some(ts.with_timezone(&Utc));
    }

    let naive = NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S%.f")
        .or_else(|_| NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f"))
        .ok()
        .or_else(|| {
            NaiveDate::parse_from_str(text, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })?;

    zone.from_local_datetime(&naive)
        .earliest()
        .map(|ts| ts.with_timezone(&Utc))
}

fn string_field(row: &RawRecord, key: &str) -> String {
    match row.get(key) {
        None | Some(Value::Null) => UNKNOWN.to_string(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

fn numeric_field(row: &RawRecord, key: &'static str) -> Result<f64, PipelineError> {
    let value = match row.get(key) {
        None | Some(Value::Null) => return Ok(0.0),
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => s.trim().parse::<f64>().ok(),
        Some(_) => None,
    };

    match value {
        Some(v) if v.is_finite() && v > 0.0 => Ok(v),
        Some(_) => Ok(0.0),
        None => Err(PipelineError::MalformedRecord {
            field: key,
            value: row.get(key).map(Value::to_string).unwrap_or_default(),
        }),
    }
}
