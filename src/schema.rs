//! Table schema representation and ClickHouse type tagging.
//!
//! The engine never introspects values at runtime to decide how to treat
//! them; conversion and coercion are driven by the [`ColumnKind`] tag
//! derived from the column's declared ClickHouse type.

/// Broad type category of a column, derived from its ClickHouse type name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    Int,
    UInt,
    Float,
    Bool,
    String,
    Bytes,
    Timestamp,
    Decimal,
    /// Types the engine passes through verbatim (arrays, maps, enums, ...).
    Other,
}

/// A single column of a table.
#[derive(Debug, Clone)]
pub struct ColumnInfo {
    pub name: String,
    /// The full ClickHouse type string, e.g. `Nullable(DateTime64(9))`.
    pub type_name: String,
    pub kind: ColumnKind,
    pub nullable: bool,
}

/// Ordered column list of one table, as reported by `system.columns`.
#[derive(Debug, Clone)]
pub struct TableSchema {
    pub table: String,
    pub columns: Vec<ColumnInfo>,
}

impl TableSchema {
    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.columns.iter().any(|c| c.name == name)
    }

    pub fn column(&self, name: &str) -> Option<&ColumnInfo> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// The `(name, kind)` pairs for a requested subset of columns, in the
    /// requested order. Unknown columns get [`ColumnKind::Other`].
    pub fn kinds_for(&self, names: &[String]) -> Vec<(String, ColumnKind)> {
        names
            .iter()
            .map(|name| {
                let kind = self
                    .column(name)
                    .map(|c| c.kind)
                    .unwrap_or(ColumnKind::Other);
                (name.clone(), kind)
            })
            .collect()
    }
}

impl ColumnInfo {
    pub fn new(name: impl Into<String>, type_name: impl Into<String>) -> Self {
        let name = name.into();
        let type_name = type_name.into();
        let (kind, nullable) = parse_column_type(&type_name);
        Self {
            name,
            type_name,
            kind,
            nullable,
        }
    }
}

/// Map a ClickHouse type string onto a [`ColumnKind`] plus nullability.
///
/// `Nullable(...)` and `LowCardinality(...)` wrappers are unwrapped before
/// classification.
pub fn parse_column_type(type_name: &str) -> (ColumnKind, bool) {
    let mut inner = type_name.trim();
    let mut nullable = false;

    loop {
        if let Some(rest) = strip_wrapper(inner, "Nullable") {
            nullable = true;
            inner = rest;
        } else if let Some(rest) = strip_wrapper(inner, "LowCardinality") {
            inner = rest;
        } else {
            break;
        }
    }

    let kind = if inner.starts_with("DateTime") || inner == "Date" || inner == "Date32" {
        ColumnKind::Timestamp
    } else if inner.starts_with("Decimal") {
        ColumnKind::Decimal
    } else if inner == "Bool" {
        ColumnKind::Bool
    } else if inner.starts_with("UInt") {
        ColumnKind::UInt
    } else if inner.starts_with("Int") {
        ColumnKind::Int
    } else if inner.starts_with("Float") {
        ColumnKind::Float
    } else if inner.starts_with("FixedString") {
        ColumnKind::Bytes
    } else if inner == "String" || inner.starts_with("Enum") || inner == "UUID" {
        ColumnKind::String
    } else {
        ColumnKind::Other
    };

    (kind, nullable)
}

fn strip_wrapper<'a>(type_name: &'a str, wrapper: &str) -> Option<&'a str> {
    type_name
        .strip_prefix(wrapper)?
        .strip_prefix('(')?
        .strip_suffix(')')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_plain_types() {
        assert_eq!(parse_column_type("UInt64"), (ColumnKind::UInt, false));
        assert_eq!(parse_column_type("Int32"), (ColumnKind::Int, false));
        assert_eq!(parse_column_type("Float64"), (ColumnKind::Float, false));
        assert_eq!(parse_column_type("String"), (ColumnKind::String, false));
        assert_eq!(parse_column_type("Bool"), (ColumnKind::Bool, false));
        assert_eq!(parse_column_type("Date"), (ColumnKind::Timestamp, false));
        assert_eq!(
            parse_column_type("DateTime64(9, 'UTC')"),
            (ColumnKind::Timestamp, false)
        );
        assert_eq!(
            parse_column_type("Decimal(38, 10)"),
            (ColumnKind::Decimal, false)
        );
        assert_eq!(
            parse_column_type("FixedString(16)"),
            (ColumnKind::Bytes, false)
        );
    }

    #[test]
    fn unwraps_nullable_and_low_cardinality() {
        assert_eq!(
            parse_column_type("Nullable(DateTime64(3))"),
            (ColumnKind::Timestamp, true)
        );
        assert_eq!(
            parse_column_type("LowCardinality(String)"),
            (ColumnKind::String, false)
        );
        assert_eq!(
            parse_column_type("Nullable(LowCardinality(String))"),
            (ColumnKind::String, true)
        );
    }

    #[test]
    fn unknown_types_pass_through() {
        assert_eq!(
            parse_column_type("Array(String)"),
            (ColumnKind::Other, false)
        );
        assert_eq!(
            parse_column_type("Map(String, UInt64)"),
            (ColumnKind::Other, false)
        );
    }

    #[test]
    fn schema_lookups() {
        let schema = TableSchema {
            table: "events".into(),
            columns: vec![
                ColumnInfo::new("id", "UInt64"),
                ColumnInfo::new("created_at", "DateTime64(9)"),
            ],
        };
        assert!(schema.has_column("id"));
        assert!(!schema.has_column("missing"));
        assert_eq!(schema.column_names(), vec!["id", "created_at"]);

        let kinds = schema.kinds_for(&["created_at".into(), "missing".into()]);
        assert_eq!(kinds[0].1, ColumnKind::Timestamp);
        assert_eq!(kinds[1].1, ColumnKind::Other);
    }
}
