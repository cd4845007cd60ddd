//! Core data types for clickhouse-sync.
//!
//! This module provides the dynamically tagged value representation used
//! throughout the engine. Rows scanned from either cluster are maps from
//! column name to [`Value`]; column order is supplied separately by the
//! table schema when rows are written back out.

use std::collections::HashMap;

use chrono::{DateTime, SecondsFormat, Utc};
use rust_decimal::Decimal;

/// A single scanned column value.
///
/// The closed set of variants covers everything the engine needs to carry
/// between two ClickHouse clusters without interpreting the data: the
/// engine never transforms values beyond type coercion at insert time.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Int(i64),
    UInt(u64),
    Float(f64),
    Bool(bool),
    String(String),
    Bytes(Vec<u8>),
    Timestamp(DateTime<Utc>),
    Decimal(Decimal),
    Null,
}

/// A scanned row: column name to value.
pub type Row = HashMap<String, Value>;

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Render this value as one field of a deduplication key.
    ///
    /// The rendering is a total function and stable across runs: the same
    /// logical value produces the same string whether it was scanned from
    /// the source or the target. Changing any arm here invalidates every
    /// dedup comparison against previously synced data.
    pub fn render_key_part(&self) -> String {
        match self {
            Value::Null => "<NULL>".to_string(),
            Value::Timestamp(ts) => ts.to_rfc3339_opts(SecondsFormat::Nanos, true),
            Value::String(s) => s.clone(),
            Value::Bytes(b) => String::from_utf8_lossy(b).into_owned(),
            Value::Int(i) => i.to_string(),
            Value::UInt(u) => u.to_string(),
            Value::Float(f) => format!("{f:.6}"),
            Value::Bool(b) => b.to_string(),
            Value::Decimal(d) => d.to_string(),
        }
    }

    /// Encode this value for the JSONEachRow wire format.
    ///
    /// Timestamps are emitted as RFC 3339 with nanosecond precision, which
    /// ClickHouse parses under `date_time_input_format=best_effort`.
    /// Decimals are quoted to avoid float round-tripping.
    pub fn to_wire_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Int(i) => serde_json::Value::from(*i),
            Value::UInt(u) => serde_json::Value::from(*u),
            Value::Float(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::String(s) => serde_json::Value::String(s.clone()),
            Value::Bytes(b) => serde_json::Value::String(String::from_utf8_lossy(b).into_owned()),
            Value::Timestamp(ts) => {
                serde_json::Value::String(ts.to_rfc3339_opts(SecondsFormat::Nanos, true))
            }
            Value::Decimal(d) => serde_json::Value::String(d.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn key_part_renders_every_variant() {
        assert_eq!(Value::Null.render_key_part(), "<NULL>");
        assert_eq!(Value::Int(-42).render_key_part(), "-42");
        assert_eq!(Value::UInt(42).render_key_part(), "42");
        assert_eq!(Value::Float(1.5).render_key_part(), "1.500000");
        assert_eq!(Value::Bool(true).render_key_part(), "true");
        assert_eq!(Value::String("a|b".into()).render_key_part(), "a|b");
        assert_eq!(Value::Bytes(b"xy".to_vec()).render_key_part(), "xy");

        let ts = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();
        assert_eq!(
            Value::Timestamp(ts).render_key_part(),
            "2024-01-02T03:04:05.000000000Z"
        );

        let d: Decimal = "12.3400".parse().unwrap();
        assert_eq!(Value::Decimal(d).render_key_part(), "12.3400");
    }

    #[test]
    fn wire_json_quotes_decimals_and_timestamps() {
        let d: Decimal = "99.99".parse().unwrap();
        assert_eq!(Value::Decimal(d).to_wire_json(), serde_json::json!("99.99"));

        let ts = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
        assert_eq!(
            Value::Timestamp(ts).to_wire_json(),
            serde_json::json!("2024-06-01T00:00:00.000000000Z")
        );

        assert_eq!(Value::UInt(7).to_wire_json(), serde_json::json!(7));
        assert_eq!(Value::Null.to_wire_json(), serde_json::Value::Null);
    }
}
