//! Operator-facing plan and summary output.
//!
//! These go to stdout rather than the log stream: they are the interactive
//! surface an operator reads before confirming a run and after stopping
//! one.

use std::time::Duration;

use crate::checkpoint::CheckpointStore;
use crate::config::Config;

pub fn format_duration(d: Duration) -> String {
    let secs = d.as_secs_f64();
    if secs < 60.0 {
        format!("{secs:.1}s")
    } else if secs < 3600.0 {
        format!("{:.1}m", secs / 60.0)
    } else {
        format!("{:.1}h", secs / 3600.0)
    }
}

/// Thousands-separated rendering of a count.
pub fn format_count(n: u64) -> String {
    let digits = n.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(c);
    }
    out
}

/// Print the resolved sync plan before a run (and for `--dry-run`).
pub fn print_sync_plan(config: &Config) {
    println!("========================================");
    println!("sync plan");
    println!("========================================");
    println!("source:             {} @ {}", config.source.database, config.source.url);
    println!("target:             {} @ {}", config.target.database, config.target.url);
    println!("mode:               {:?}", config.sync.mode);
    println!("max concurrency:    {}", config.sync.max_concurrency);
    println!("batch size:         {}", config.sync.batch_size);
    println!("daily segmentation: {}", config.sync.daily_segmentation);
    println!("state file:         {}", config.sync.state_file.display());
    println!();
    println!("tables:");
    for (i, table) in config.enabled_tables().iter().enumerate() {
        println!("  {}. {}", i + 1, table.name);
        println!("     mode:       {:?}", table.effective_mode(config.sync.mode));
        println!("     time field: {}", table.time_field);
        println!("     dedup keys: {:?}", table.dedupe_keys);
        println!(
            "     batch size: {}",
            table.effective_batch_size(config.sync.batch_size)
        );
    }
    println!("========================================");
}

/// Print the per-table record totals at shutdown.
pub async fn print_final_report(config: &Config, checkpoint: &CheckpointStore) {
    println!();
    println!("========================================");
    println!("sync summary (run {})", checkpoint.run_id().await);
    println!("========================================");
    for table in config.enabled_tables() {
        match checkpoint.table_state(&table.name).await {
            Some(state) => println!(
                "  {}: {} records ({:?})",
                table.name,
                format_count(state.records_synced),
                state.status
            ),
            None => println!("  {}: no data synced", table.name),
        }
    }
    println!(
        "total: {} records",
        format_count(checkpoint.total_records_synced().await)
    );
    println!("========================================");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn durations_scale_units() {
        assert_eq!(format_duration(Duration::from_millis(2500)), "2.5s");
        assert_eq!(format_duration(Duration::from_secs(90)), "1.5m");
        assert_eq!(format_duration(Duration::from_secs(5400)), "1.5h");
    }

    #[test]
    fn counts_get_thousands_separators() {
        assert_eq!(format_count(0), "0");
        assert_eq!(format_count(999), "999");
        assert_eq!(format_count(1000), "1,000");
        assert_eq!(format_count(1234567), "1,234,567");
    }
}
