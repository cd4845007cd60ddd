//! Configuration loading and validation.
//!
//! The whole sync policy lives in one YAML document: connection settings
//! for both clusters, global sync knobs, the declarative table list and
//! the historical time range. The parsed [`Config`] is validated once at
//! startup and never mutated afterwards.

use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::error::{Result, SyncError};

/// Top-level configuration document.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub source: ConnectionConfig,
    pub target: ConnectionConfig,
    #[serde(default)]
    pub sync: SyncSettings,
    #[serde(default)]
    pub tables: Vec<TableSpec>,
    #[serde(default)]
    pub time_range: TimeRangeConfig,
    #[serde(default)]
    pub monitoring: MonitoringConfig,
}

/// Connection settings for one ClickHouse cluster (HTTP interface).
#[derive(Debug, Clone, Deserialize)]
pub struct ConnectionConfig {
    /// HTTP(S) endpoint, e.g. `http://ch-replica:8123`.
    pub url: String,
    pub database: String,
    #[serde(default = "default_username")]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

/// Global sync policy. Per-table settings override `mode` and `batch_size`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    pub mode: SyncMode,
    pub batch_size: usize,
    pub max_concurrency: usize,
    pub daily_segmentation: bool,
    pub enable_compression: bool,
    /// Connection establishment timeout, seconds.
    pub dial_timeout: u64,
    /// Server-side cap for streaming queries, seconds.
    pub query_timeout: u64,
    pub state_file: PathBuf,
    /// Honor existing checkpoints on startup. When false the state file is
    /// replaced with a fresh run before the first cycle.
    pub resume: bool,
    pub skip_validation: bool,
    /// Minimum acceptable target/source row-count ratio for the validator.
    pub validation_ratio: f64,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            mode: SyncMode::Incremental,
            batch_size: 2000,
            max_concurrency: 3,
            daily_segmentation: false,
            enable_compression: false,
            dial_timeout: 10,
            query_timeout: 300,
            state_file: PathBuf::from("/tmp/clickhouse_sync_state.json"),
            resume: true,
            skip_validation: false,
            validation_ratio: 0.95,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncMode {
    /// Stream the whole table end to end; no time windows, no dedup, no
    /// checkpoints. Intended for the initial bootstrap of reference tables.
    Full,
    /// Time-windowed catch-up plus realtime tailing.
    Incremental,
}

/// One table to replicate.
#[derive(Debug, Clone, Deserialize)]
pub struct TableSpec {
    pub name: String,
    /// Monotonic time column driving windows, ordering and checkpoints.
    pub time_field: String,
    /// Columns forming the deduplication key, in order.
    pub dedupe_keys: Vec<String>,
    #[serde(default)]
    pub mode: Option<SyncMode>,
    #[serde(default)]
    pub batch_size: Option<usize>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl TableSpec {
    /// Table-level mode wins over the global one.
    pub fn effective_mode(&self, global: SyncMode) -> SyncMode {
        self.mode.unwrap_or(global)
    }

    /// Table-level batch size wins over the global one.
    pub fn effective_batch_size(&self, global: usize) -> usize {
        match self.batch_size {
            Some(n) if n > 0 => n,
            _ => global,
        }
    }
}

/// Historical window bounds for catch-up.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TimeRangeConfig {
    /// Explicit window start (RFC 3339). Ignored when `auto_detect` is on.
    pub start: Option<DateTime<Utc>>,
    /// Explicit window end (RFC 3339). Absent means "up to source max".
    pub end: Option<DateTime<Utc>>,
    /// Derive the window start from the target's max time.
    pub auto_detect: bool,
    /// Lower bound, in days before now, when the target is empty.
    pub fallback_days: i64,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MonitoringConfig {
    pub verbose_logging: bool,
    pub dry_run: bool,
}

fn default_username() -> String {
    "default".to_string()
}

fn default_true() -> bool {
    true
}

impl Config {
    /// Load and validate a configuration file.
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let mut config: Config =
            serde_yaml::from_str(&data).with_context(|| "failed to parse config")?;

        if config.time_range.fallback_days == 0 {
            config.time_range.fallback_days = 30;
        }

        Ok(config)
    }

    /// Restrict the table list to the given names (comma-separated CLI
    /// selection). Unknown names are silently dropped.
    pub fn filter_tables(&mut self, selected: &[String]) {
        if selected.is_empty() {
            return;
        }
        let wanted: Vec<&str> = selected.iter().map(|s| s.trim()).collect();
        self.tables.retain(|t| wanted.contains(&t.name.as_str()));
    }

    pub fn enabled_tables(&self) -> Vec<&TableSpec> {
        self.tables.iter().filter(|t| t.enabled).collect()
    }

    /// Check the invariants a run depends on. Fatal at startup.
    pub fn validate(&self) -> Result<()> {
        if self.source.url.is_empty() {
            return Err(SyncError::Config("source url is required".into()));
        }
        if self.source.database.is_empty() {
            return Err(SyncError::Config("source database is required".into()));
        }
        if self.target.url.is_empty() {
            return Err(SyncError::Config("target url is required".into()));
        }
        if self.target.database.is_empty() {
            return Err(SyncError::Config("target database is required".into()));
        }
        if self.sync.batch_size == 0 {
            return Err(SyncError::Config("sync.batch_size must be positive".into()));
        }
        if self.sync.max_concurrency == 0 {
            return Err(SyncError::Config(
                "sync.max_concurrency must be positive".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.sync.validation_ratio) {
            return Err(SyncError::Config(
                "sync.validation_ratio must be within 0..=1".into(),
            ));
        }
        if self.tables.is_empty() {
            return Err(SyncError::Config("no tables configured".into()));
        }

        let mut enabled = 0usize;
        for (i, table) in self.tables.iter().enumerate() {
            if !table.enabled {
                continue;
            }
            enabled += 1;
            if table.name.is_empty() {
                return Err(SyncError::Config(format!("table[{i}]: name is required")));
            }
            if table.time_field.is_empty() {
                return Err(SyncError::Config(format!(
                    "table[{i}] ({}): time_field is required",
                    table.name
                )));
            }
            if table.dedupe_keys.is_empty() {
                return Err(SyncError::Config(format!(
                    "table[{i}] ({}): dedupe_keys is required",
                    table.name
                )));
            }
        }
        if enabled == 0 {
            return Err(SyncError::Config("no enabled tables found".into()));
        }

        if let (Some(start), Some(end)) = (self.time_range.start, self.time_range.end) {
            if start >= end {
                return Err(SyncError::Config(
                    "time_range.start must be before time_range.end".into(),
                ));
            }
        }

        Ok(())
    }
}

/// Parse a duration string like "1h", "30m", "300s" or plain "300" into
/// seconds.
pub fn parse_duration_to_secs(s: &str) -> anyhow::Result<u64> {
    let s = s.trim();
    if s.is_empty() {
        anyhow::bail!("empty duration string");
    }

    if let Some(num) = s.strip_suffix('h') {
        let hours: u64 = num
            .parse()
            .with_context(|| format!("invalid hours value: {num}"))?;
        return Ok(hours * 3600);
    }
    if let Some(num) = s.strip_suffix('m') {
        let minutes: u64 = num
            .parse()
            .with_context(|| format!("invalid minutes value: {num}"))?;
        return Ok(minutes * 60);
    }
    if let Some(num) = s.strip_suffix('s') {
        return num
            .parse()
            .with_context(|| format!("invalid seconds value: {num}"));
    }

    s.parse()
        .with_context(|| format!("invalid duration value: {s}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
source:
  url: http://src:8123
  database: app
target:
  url: http://dst:8123
  database: app
tables:
  - name: events
    time_field: created_at
    dedupe_keys: [id, created_at]
"#;

    #[test]
    fn minimal_config_gets_defaults() {
        let config: Config = serde_yaml::from_str(MINIMAL).unwrap();
        assert_eq!(config.sync.batch_size, 2000);
        assert_eq!(config.sync.max_concurrency, 3);
        assert_eq!(config.sync.query_timeout, 300);
        assert!(config.sync.resume);
        assert_eq!(
            config.sync.state_file,
            PathBuf::from("/tmp/clickhouse_sync_state.json")
        );
        assert_eq!(config.sync.mode, SyncMode::Incremental);
        assert!(config.tables[0].enabled);
        config.validate().unwrap();
    }

    #[test]
    fn table_overrides_win() {
        let spec = TableSpec {
            name: "t".into(),
            time_field: "ts".into(),
            dedupe_keys: vec!["id".into()],
            mode: Some(SyncMode::Full),
            batch_size: Some(500),
            enabled: true,
        };
        assert_eq!(spec.effective_mode(SyncMode::Incremental), SyncMode::Full);
        assert_eq!(spec.effective_batch_size(2000), 500);

        let spec = TableSpec {
            mode: None,
            batch_size: None,
            ..spec
        };
        assert_eq!(
            spec.effective_mode(SyncMode::Incremental),
            SyncMode::Incremental
        );
        assert_eq!(spec.effective_batch_size(2000), 2000);
    }

    #[test]
    fn validation_rejects_broken_tables() {
        let mut config: Config = serde_yaml::from_str(MINIMAL).unwrap();
        config.tables[0].dedupe_keys.clear();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("dedupe_keys"));

        let mut config: Config = serde_yaml::from_str(MINIMAL).unwrap();
        config.tables[0].enabled = false;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("no enabled tables"));
    }

    #[test]
    fn validation_rejects_inverted_time_range() {
        let mut config: Config = serde_yaml::from_str(MINIMAL).unwrap();
        config.time_range.start = Some("2024-02-01T00:00:00Z".parse().unwrap());
        config.time_range.end = Some("2024-01-01T00:00:00Z".parse().unwrap());
        assert!(config.validate().is_err());
    }

    #[test]
    fn filter_tables_by_name() {
        let mut config: Config = serde_yaml::from_str(MINIMAL).unwrap();
        config.tables.push(TableSpec {
            name: "orders".into(),
            time_field: "ts".into(),
            dedupe_keys: vec!["id".into()],
            mode: None,
            batch_size: None,
            enabled: true,
        });

        config.filter_tables(&[" orders ".to_string()]);
        assert_eq!(config.tables.len(), 1);
        assert_eq!(config.tables[0].name, "orders");
    }

    #[test]
    fn duration_suffixes() {
        assert_eq!(parse_duration_to_secs("300").unwrap(), 300);
        assert_eq!(parse_duration_to_secs("300s").unwrap(), 300);
        assert_eq!(parse_duration_to_secs("5m").unwrap(), 300);
        assert_eq!(parse_duration_to_secs("1h").unwrap(), 3600);
        assert!(parse_duration_to_secs("").is_err());
        assert!(parse_duration_to_secs("abc").is_err());
    }

    #[test]
    fn rfc3339_time_range_parses() {
        let yaml = r#"
source: { url: "http://s:8123", database: a }
target: { url: "http://t:8123", database: a }
time_range:
  start: "2024-01-01T00:00:00Z"
  end: "2024-02-01T00:00:00+08:00"
  auto_detect: false
tables:
  - { name: t, time_field: ts, dedupe_keys: [id] }
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert!(config.time_range.start.unwrap() < config.time_range.end.unwrap());
    }
}
