//! Row-count integrity check.
//!
//! Compares source and target row counts over a window and flags tables
//! whose target count falls below `validation_ratio` of the source. This
//! is an audit tool layered next to the engine; the sync path itself never
//! depends on it.

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::config::TableSpec;
use crate::error::Result;
use crate::store::Store;

#[derive(Debug, Clone)]
pub struct ValidationOutcome {
    pub table: String,
    pub source_rows: u64,
    pub target_rows: u64,
    pub passed: bool,
}

pub struct Validator<'a> {
    source: &'a dyn Store,
    target: &'a dyn Store,
    ratio: f64,
}

impl<'a> Validator<'a> {
    pub fn new(source: &'a dyn Store, target: &'a dyn Store, ratio: f64) -> Self {
        Self {
            source,
            target,
            ratio,
        }
    }

    /// Compare counts for one table within `[start, end)` of its time
    /// column.
    pub async fn validate_table(
        &self,
        spec: &TableSpec,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<ValidationOutcome> {
        let source_rows = self
            .source
            .count_range(&spec.name, &spec.time_field, start, end)
            .await?;
        let target_rows = self
            .target
            .count_range(&spec.name, &spec.time_field, start, end)
            .await?;

        let threshold = source_rows as f64 * self.ratio;
        let passed = source_rows == 0 || target_rows as f64 >= threshold;

        if passed {
            info!(
                table = %spec.name,
                source_rows,
                target_rows,
                "validation passed"
            );
        } else {
            warn!(
                table = %spec.name,
                source_rows,
                target_rows,
                expected_at_least = threshold as u64,
                "validation failed"
            );
        }

        Ok(ValidationOutcome {
            table: spec.name.clone(),
            source_rows,
            target_rows,
            passed,
        })
    }

    /// Validate every enabled table over the same window.
    pub async fn validate_all(
        &self,
        tables: &[TableSpec],
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<ValidationOutcome>> {
        let mut outcomes = Vec::new();
        for spec in tables.iter().filter(|t| t.enabled) {
            outcomes.push(self.validate_table(spec, start, end).await?);
        }
        Ok(outcomes)
    }
}
