//! ClickHouse store implementation over the HTTP interface.
//!
//! The engine is table-agnostic, so rows cannot be bound to static Rust
//! structs; the store therefore speaks the HTTP interface directly and
//! exchanges rows in the `JSONEachRow` format. Reads stream the response
//! body line by line, inserts ship one `INSERT ... FORMAT JSONEachRow`
//! request per batch (the server treats one insert as an atomic block),
//! and scalar probes use `maxOrNull`/`minOrNull` so empty tables yield
//! NULL instead of the type's default.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use futures::StreamExt;
use tokio::sync::Mutex;

use crate::config::{ConnectionConfig, SyncSettings};
use crate::error::{Result, SyncError};
use crate::schema::{ColumnInfo, ColumnKind, TableSchema};
use crate::store::{RowStream, SchemaCatalog, Store, TimeFilter};
use crate::types::{Row, Value};

/// Timeout for cheap scalar probes (max/min/count/ping).
const PROBE_TIMEOUT: Duration = Duration::from_secs(30);

/// One side of the replication pair.
pub struct ClickHouseStore {
    http: reqwest::Client,
    url: String,
    database: String,
    username: String,
    password: String,
    query_timeout: Duration,
    compression: bool,
    schemas: Mutex<HashMap<String, Arc<TableSchema>>>,
}

impl ClickHouseStore {
    /// Build a store from connection settings. No request is issued here;
    /// call [`ClickHouseStore::ping`] to verify the connection.
    pub fn connect(conn: &ConnectionConfig, sync: &SyncSettings) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(sync.dial_timeout))
            .build()
            .map_err(|e| SyncError::Database(format!("failed to build http client: {e}")))?;

        Ok(Self {
            http,
            url: conn.url.clone(),
            database: conn.database.clone(),
            username: conn.username.clone(),
            password: conn.password.clone(),
            query_timeout: Duration::from_secs(sync.query_timeout),
            compression: sync.enable_compression,
            schemas: Mutex::new(HashMap::new()),
        })
    }

    pub async fn ping(&self) -> Result<()> {
        let v = self.fetch_scalar("SELECT 1 AS v FORMAT JSONEachRow".into()).await?;
        match v.as_i64() {
            Some(1) => Ok(()),
            _ => Err(SyncError::Database(format!(
                "unexpected ping response: {v}"
            ))),
        }
    }

    pub async fn server_version(&self) -> Result<String> {
        let v = self
            .fetch_scalar("SELECT version() AS v FORMAT JSONEachRow".into())
            .await?;
        v.as_str()
            .map(str::to_string)
            .ok_or_else(|| SyncError::Database(format!("unexpected version response: {v}")))
    }

    fn qualified(&self, table: &str) -> String {
        format!("{}.{}", quote_ident(&self.database), quote_ident(table))
    }

    fn request(&self, settings: &[(&str, String)]) -> reqwest::RequestBuilder {
        let mut params: Vec<(&str, String)> = vec![("database", self.database.clone())];
        if self.compression {
            params.push(("enable_http_compression", "1".to_string()));
        }
        params.extend(settings.iter().map(|(k, v)| (*k, v.clone())));

        self.http
            .post(&self.url)
            .query(&params)
            .header("X-ClickHouse-User", &self.username)
            .header("X-ClickHouse-Key", &self.password)
    }

    async fn execute(
        &self,
        sql: String,
        timeout: Duration,
        settings: &[(&str, String)],
    ) -> Result<reqwest::Response> {
        let resp = self
            .request(settings)
            .timeout(timeout)
            .body(sql)
            .send()
            .await
            .map_err(|e| SyncError::Database(format!("request to {} failed: {e}", self.url)))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(SyncError::Database(format!(
                "HTTP {}: {}",
                status.as_u16(),
                truncate(body.trim(), 500)
            )));
        }
        Ok(resp)
    }

    /// Run a one-row query aliased as `v` and return that field.
    async fn fetch_scalar(&self, sql: String) -> Result<serde_json::Value> {
        let resp = self
            .execute(sql, PROBE_TIMEOUT, &select_settings(PROBE_TIMEOUT))
            .await?;
        let text = resp
            .text()
            .await
            .map_err(|e| SyncError::Database(format!("failed to read response: {e}")))?;

        match text.lines().find(|l| !l.trim().is_empty()) {
            Some(line) => {
                let value: serde_json::Value = serde_json::from_str(line)
                    .map_err(|e| SyncError::Database(format!("malformed response row: {e}")))?;
                Ok(value.get("v").cloned().unwrap_or(serde_json::Value::Null))
            }
            None => Ok(serde_json::Value::Null),
        }
    }

    async fn query_time_bound(
        &self,
        table: &str,
        column: &str,
        aggregate: &str,
    ) -> Result<Option<DateTime<Utc>>> {
        let sql = format!(
            "SELECT {aggregate}({col}) AS v FROM {table} FORMAT JSONEachRow",
            col = quote_ident(column),
            table = self.qualified(table),
        );
        match self.fetch_scalar(sql).await? {
            serde_json::Value::Null => Ok(None),
            serde_json::Value::String(s) => Ok(parse_timestamp(&s)),
            other => Err(SyncError::Database(format!(
                "unexpected {aggregate}({column}) response: {other}"
            ))),
        }
    }

    async fn cached_schema(&self, table: &str) -> Result<Arc<TableSchema>> {
        {
            let schemas = self.schemas.lock().await;
            if let Some(schema) = schemas.get(table) {
                return Ok(schema.clone());
            }
        }

        let schema = Arc::new(self.fetch_schema(table).await?);
        self.schemas
            .lock()
            .await
            .insert(table.to_string(), schema.clone());
        Ok(schema)
    }

    async fn fetch_schema(&self, table: &str) -> Result<TableSchema> {
        let sql = format!(
            "SELECT name, type FROM system.columns \
             WHERE database = currentDatabase() AND table = '{}' \
             ORDER BY position FORMAT JSONEachRow",
            escape_string(table),
        );
        let resp = self
            .execute(sql, PROBE_TIMEOUT, &select_settings(PROBE_TIMEOUT))
            .await?;
        let text = resp
            .text()
            .await
            .map_err(|e| SyncError::Database(format!("failed to read response: {e}")))?;

        let mut columns = Vec::new();
        for line in text.lines().filter(|l| !l.trim().is_empty()) {
            let value: serde_json::Value = serde_json::from_str(line)
                .map_err(|e| SyncError::Database(format!("malformed column row: {e}")))?;
            let name = value.get("name").and_then(|v| v.as_str()).unwrap_or("");
            let type_name = value.get("type").and_then(|v| v.as_str()).unwrap_or("");
            if name.is_empty() {
                continue;
            }
            columns.push(ColumnInfo::new(name, type_name));
        }

        if columns.is_empty() {
            return Err(SyncError::Database(format!(
                "table {table} not found or has no columns"
            )));
        }

        Ok(TableSchema {
            table: table.to_string(),
            columns,
        })
    }
}

#[async_trait]
impl Store for ClickHouseStore {
    async fn probe_exists(&self, table: &str) -> Result<bool> {
        let sql = format!(
            "SELECT count() AS v FROM system.tables \
             WHERE database = currentDatabase() AND name = '{}' FORMAT JSONEachRow",
            escape_string(table),
        );
        Ok(scalar_u64(self.fetch_scalar(sql).await?)? > 0)
    }

    async fn query_max(&self, table: &str, column: &str) -> Result<Option<DateTime<Utc>>> {
        self.query_time_bound(table, column, "maxOrNull").await
    }

    async fn query_min(&self, table: &str, column: &str) -> Result<Option<DateTime<Utc>>> {
        self.query_time_bound(table, column, "minOrNull").await
    }

    async fn count_range(
        &self,
        table: &str,
        column: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<u64> {
        let sql = format!(
            "SELECT count() AS v FROM {table} WHERE {cond} FORMAT JSONEachRow",
            table = self.qualified(table),
            cond = time_condition(column, start, end),
        );
        scalar_u64(self.fetch_scalar(sql).await?)
    }

    async fn stream_select(
        &self,
        table: &str,
        columns: &[String],
        filter: Option<&TimeFilter>,
    ) -> Result<RowStream> {
        let schema = self.cached_schema(table).await?;
        let kinds = schema.kinds_for(columns);

        let sql = build_select_sql(&self.qualified(table), columns, filter);
        let resp = self
            .execute(sql, self.query_timeout, &select_settings(self.query_timeout))
            .await?;

        let state = RowStreamState {
            body: Box::pin(resp.bytes_stream()),
            buf: BytesMut::new(),
            kinds,
        };
        let stream = futures::stream::try_unfold(state, |mut st| async move {
            loop {
                if let Some(pos) = st.buf.iter().position(|&b| b == b'\n') {
                    let line = st.buf.split_to(pos + 1);
                    let line = &line[..line.len() - 1];
                    if line.iter().all(u8::is_ascii_whitespace) {
                        continue;
                    }
                    let row = parse_row_line(line, &st.kinds)?;
                    return Ok(Some((row, st)));
                }
                match st.body.next().await {
                    Some(Ok(chunk)) => st.buf.extend_from_slice(&chunk),
                    Some(Err(e)) => {
                        return Err(SyncError::Database(format!("stream read failed: {e}")))
                    }
                    None => {
                        if st.buf.iter().all(u8::is_ascii_whitespace) {
                            return Ok(None);
                        }
                        let line = st.buf.split_to(st.buf.len());
                        let row = parse_row_line(&line, &st.kinds)?;
                        return Ok(Some((row, st)));
                    }
                }
            }
        });

        Ok(Box::pin(stream))
    }

    async fn bulk_insert(&self, table: &str, columns: &[String], rows: &[Row]) -> Result<u64> {
        if rows.is_empty() {
            return Ok(0);
        }

        let column_list = columns
            .iter()
            .map(|c| quote_ident(c))
            .collect::<Vec<_>>()
            .join(", ");
        let insert_sql = format!(
            "INSERT INTO {} ({}) FORMAT JSONEachRow",
            self.qualified(table),
            column_list
        );

        let mut body = String::new();
        for row in rows {
            let mut object = serde_json::Map::with_capacity(columns.len());
            for column in columns {
                let value = row.get(column).unwrap_or(&Value::Null);
                object.insert(column.clone(), value.to_wire_json());
            }
            body.push_str(&serde_json::Value::Object(object).to_string());
            body.push('\n');
        }

        let settings = [
            ("query", insert_sql),
            ("date_time_input_format", "best_effort".to_string()),
        ];
        let resp = self
            .request(&settings)
            .timeout(self.query_timeout)
            .body(body)
            .send()
            .await
            .map_err(|e| SyncError::Database(format!("insert request failed: {e}")))?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(SyncError::Database(format!(
                "insert failed, HTTP {}: {}",
                status.as_u16(),
                truncate(text.trim(), 500)
            )));
        }

        Ok(rows.len() as u64)
    }
}

#[async_trait]
impl SchemaCatalog for ClickHouseStore {
    async fn table_schema(&self, table: &str) -> Result<TableSchema> {
        Ok(self.cached_schema(table).await?.as_ref().clone())
    }
}

struct RowStreamState {
    body: std::pin::Pin<
        Box<dyn futures::Stream<Item = std::result::Result<Bytes, reqwest::Error>> + Send>,
    >,
    buf: BytesMut,
    kinds: Vec<(String, ColumnKind)>,
}

/// Settings shared by SELECT queries: ISO timestamps and quoted decimals
/// keep the JSON round-trip lossless; `max_execution_time` bounds the
/// server-side work.
fn select_settings(timeout: Duration) -> Vec<(&'static str, String)> {
    vec![
        ("max_execution_time", timeout.as_secs().to_string()),
        ("date_time_output_format", "iso".to_string()),
        ("output_format_json_quote_decimals", "1".to_string()),
    ]
}

fn build_select_sql(qualified: &str, columns: &[String], filter: Option<&TimeFilter>) -> String {
    let column_list = columns
        .iter()
        .map(|c| quote_ident(c))
        .collect::<Vec<_>>()
        .join(", ");
    match filter {
        Some(f) => format!(
            "SELECT {column_list} FROM {qualified} WHERE {cond} ORDER BY {col} FORMAT JSONEachRow",
            cond = time_condition(&f.column, f.start, f.end),
            col = quote_ident(&f.column),
        ),
        None => format!("SELECT {column_list} FROM {qualified} FORMAT JSONEachRow"),
    }
}

fn time_condition(column: &str, start: DateTime<Utc>, end: DateTime<Utc>) -> String {
    format!(
        "{col} >= {start} AND {col} < {end}",
        col = quote_ident(column),
        start = sql_timestamp(start),
        end = sql_timestamp(end),
    )
}

fn sql_timestamp(ts: DateTime<Utc>) -> String {
    format!(
        "toDateTime64('{}', 9, 'UTC')",
        ts.naive_utc().format("%Y-%m-%d %H:%M:%S%.9f")
    )
}

fn quote_ident(name: &str) -> String {
    format!("`{}`", name.replace('`', "\\`"))
}

fn escape_string(s: &str) -> String {
    s.replace('\\', "\\\\").replace('\'', "\\'")
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

fn scalar_u64(value: serde_json::Value) -> Result<u64> {
    // 64-bit integers arrive quoted in JSON formats by default.
    match &value {
        serde_json::Value::Number(n) => n.as_u64(),
        serde_json::Value::String(s) => s.parse().ok(),
        _ => None,
    }
    .ok_or_else(|| SyncError::Database(format!("unexpected numeric response: {value}")))
}

fn parse_row_line(line: &[u8], kinds: &[(String, ColumnKind)]) -> Result<Row> {
    let value: serde_json::Value = serde_json::from_slice(line)
        .map_err(|e| SyncError::Database(format!("malformed response row: {e}")))?;
    let serde_json::Value::Object(mut object) = value else {
        return Err(SyncError::Database(
            "expected a JSON object per response row".to_string(),
        ));
    };

    let mut row = Row::with_capacity(kinds.len());
    for (name, kind) in kinds {
        let json = object.remove(name).unwrap_or(serde_json::Value::Null);
        row.insert(name.clone(), decode_value(*kind, json));
    }
    Ok(row)
}

/// Decode one JSONEachRow field into a [`Value`], driven by the column's
/// schema tag. Values that do not match their tag are kept verbatim rather
/// than dropped.
fn decode_value(kind: ColumnKind, json: serde_json::Value) -> Value {
    use serde_json::Value as Json;

    if json.is_null() {
        return Value::Null;
    }

    match kind {
        ColumnKind::Timestamp => match json {
            Json::String(s) => parse_timestamp(&s)
                .map(Value::Timestamp)
                .unwrap_or(Value::String(s)),
            other => Value::String(other.to_string()),
        },
        ColumnKind::Decimal => match json {
            Json::String(s) => s.parse().map(Value::Decimal).unwrap_or(Value::String(s)),
            Json::Number(n) => n
                .to_string()
                .parse()
                .map(Value::Decimal)
                .unwrap_or_else(|_| Value::String(n.to_string())),
            other => Value::String(other.to_string()),
        },
        ColumnKind::Int => match json {
            Json::Number(n) => n.as_i64().map(Value::Int).unwrap_or(Value::Null),
            Json::String(s) => s.parse().map(Value::Int).unwrap_or(Value::String(s)),
            other => Value::String(other.to_string()),
        },
        ColumnKind::UInt => match json {
            Json::Number(n) => n.as_u64().map(Value::UInt).unwrap_or(Value::Null),
            Json::String(s) => s.parse().map(Value::UInt).unwrap_or(Value::String(s)),
            other => Value::String(other.to_string()),
        },
        ColumnKind::Float => match json {
            Json::Number(n) => n.as_f64().map(Value::Float).unwrap_or(Value::Null),
            Json::String(s) => s.parse().map(Value::Float).unwrap_or(Value::String(s)),
            other => Value::String(other.to_string()),
        },
        ColumnKind::Bool => match json {
            Json::Bool(b) => Value::Bool(b),
            Json::Number(n) => Value::Bool(n.as_i64().unwrap_or(0) != 0),
            other => Value::String(other.to_string()),
        },
        ColumnKind::Bytes => match json {
            Json::String(s) => Value::Bytes(s.into_bytes()),
            other => Value::Bytes(other.to_string().into_bytes()),
        },
        ColumnKind::String | ColumnKind::Other => match json {
            Json::String(s) => Value::String(s),
            other => Value::String(other.to_string()),
        },
    }
}

/// Parse the timestamp renderings ClickHouse produces: RFC 3339 (the
/// `iso` output format), the `simple` format, and bare dates.
fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(s) {
        return Some(ts.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return Some(naive.and_utc());
    }
    if let Ok(date) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        return Some(NaiveDateTime::new(date, chrono::NaiveTime::MIN).and_utc());
    }
    None
}

#[cfg(test)]
mod tests {
    use rust_decimal::Decimal;

    use super::*;

    fn ts(s: &str) -> DateTime<Utc> {
        s.parse().unwrap()
    }

    #[test]
    fn timestamps_parse_in_all_server_renderings() {
        assert_eq!(
            parse_timestamp("2024-01-02T03:04:05.123456789Z"),
            Some(ts("2024-01-02T03:04:05.123456789Z"))
        );
        assert_eq!(
            parse_timestamp("2024-01-02 03:04:05.500"),
            Some(ts("2024-01-02T03:04:05.500Z"))
        );
        assert_eq!(parse_timestamp("2024-01-02"), Some(ts("2024-01-02T00:00:00Z")));
        assert_eq!(parse_timestamp("garbage"), None);
    }

    #[test]
    fn sql_timestamp_is_nanosecond_utc() {
        assert_eq!(
            sql_timestamp(ts("2024-01-02T03:04:05.000000001Z")),
            "toDateTime64('2024-01-02 03:04:05.000000001', 9, 'UTC')"
        );
    }

    #[test]
    fn select_sql_orders_by_the_filter_column() {
        let filter = TimeFilter {
            column: "created_at".into(),
            start: ts("2024-01-01T00:00:00Z"),
            end: ts("2024-01-02T00:00:00Z"),
        };
        let sql = build_select_sql(
            "`app`.`events`",
            &["id".to_string(), "created_at".to_string()],
            Some(&filter),
        );
        assert!(sql.starts_with("SELECT `id`, `created_at` FROM `app`.`events` WHERE"));
        assert!(sql.contains("`created_at` >= toDateTime64('2024-01-01 00:00:00.000000000', 9, 'UTC')"));
        assert!(sql.contains("`created_at` < toDateTime64('2024-01-02 00:00:00.000000000', 9, 'UTC')"));
        assert!(sql.contains("ORDER BY `created_at`"));
        assert!(sql.ends_with("FORMAT JSONEachRow"));

        let sql = build_select_sql("`app`.`events`", &["id".to_string()], None);
        assert_eq!(sql, "SELECT `id` FROM `app`.`events` FORMAT JSONEachRow");
    }

    #[test]
    fn decode_follows_schema_tags() {
        assert_eq!(
            decode_value(ColumnKind::UInt, serde_json::json!("18446744073709551615")),
            Value::UInt(u64::MAX)
        );
        assert_eq!(
            decode_value(ColumnKind::Int, serde_json::json!(-5)),
            Value::Int(-5)
        );
        assert_eq!(
            decode_value(ColumnKind::Decimal, serde_json::json!("12.3400")),
            Value::Decimal("12.3400".parse::<Decimal>().unwrap())
        );
        assert_eq!(
            decode_value(
                ColumnKind::Timestamp,
                serde_json::json!("2024-01-02T03:04:05Z")
            ),
            Value::Timestamp(ts("2024-01-02T03:04:05Z"))
        );
        assert_eq!(
            decode_value(ColumnKind::Bool, serde_json::json!(1)),
            Value::Bool(true)
        );
        assert_eq!(
            decode_value(ColumnKind::String, serde_json::Value::Null),
            Value::Null
        );
    }

    #[test]
    fn row_line_decodes_requested_columns_only() {
        let kinds = vec![
            ("id".to_string(), ColumnKind::UInt),
            ("name".to_string(), ColumnKind::String),
        ];
        let row =
            parse_row_line(br#"{"id": 7, "name": "a", "extra": true}"#, &kinds).unwrap();
        assert_eq!(row.len(), 2);
        assert_eq!(row["id"], Value::UInt(7));
        assert_eq!(row["name"], Value::String("a".into()));

        assert!(parse_row_line(b"[1, 2]", &kinds).is_err());
    }

    #[test]
    fn identifiers_and_strings_are_escaped() {
        assert_eq!(quote_ident("from"), "`from`");
        assert_eq!(quote_ident("we`ird"), "`we\\`ird`");
        assert_eq!(escape_string("o'clock"), "o\\'clock");
        assert_eq!(escape_string("a\\b"), "a\\\\b");
    }
}
