//! Value coercion at insert time.
//!
//! Scanned values are adapted to what the target column expects, driven by
//! the target schema's [`ColumnKind`] tag. Coercion never fails: values it
//! cannot fix fall through unchanged and the server rejects them, which is
//! preferable to silently corrupting data.

use chrono::{DateTime, Utc};

use crate::schema::ColumnKind;
use crate::types::{Row, Value};

/// Lowest timestamp ClickHouse `DateTime64` can represent.
fn min_datetime() -> DateTime<Utc> {
    DateTime::parse_from_rfc3339("1900-01-01T00:00:00Z")
        .expect("constant timestamp")
        .with_timezone(&Utc)
}

/// Highest timestamp ClickHouse `DateTime64` can represent.
fn max_datetime() -> DateTime<Utc> {
    DateTime::parse_from_rfc3339("2262-04-11T23:47:16Z")
        .expect("constant timestamp")
        .with_timezone(&Utc)
}

/// Coerce one value toward the target column's kind.
pub fn coerce_value(kind: ColumnKind, value: Value) -> Value {
    match (kind, value) {
        // Drivers hand decimals back as strings; parse them into the exact
        // representation the insert path expects.
        (ColumnKind::Decimal, Value::String(s)) => match s.parse() {
            Ok(d) => Value::Decimal(d),
            Err(_) => Value::String(s),
        },
        (ColumnKind::Decimal, Value::Bytes(b)) => {
            let s = String::from_utf8_lossy(&b).into_owned();
            match s.parse() {
                Ok(d) => Value::Decimal(d),
                Err(_) => Value::Bytes(b),
            }
        }
        // Out-of-range timestamps are driver/sentinel noise; substitute the
        // epoch rather than letting the insert fail.
        (ColumnKind::Timestamp, Value::Timestamp(ts)) => {
            if ts < min_datetime() || ts > max_datetime() {
                Value::Timestamp(DateTime::UNIX_EPOCH)
            } else {
                Value::Timestamp(ts)
            }
        }
        (_, value) => value,
    }
}

/// Coerce a whole row in place against `(column, kind)` pairs.
pub fn coerce_row(kinds: &[(String, ColumnKind)], row: &mut Row) {
    for (name, kind) in kinds {
        if let Some(value) = row.remove(name) {
            row.insert(name.clone(), coerce_value(*kind, value));
        }
    }
}
