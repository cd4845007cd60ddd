use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::info;

use clickhouse_sync::config::parse_duration_to_secs;
use clickhouse_sync::{
    report, CheckpointStore, ClickHouseStore, Config, Coordinator, SchemaCatalog, Store,
    Supervisor,
};

#[derive(Parser)]
#[command(name = "clickhouse-sync")]
#[command(about = "Continuous table-level replication between ClickHouse clusters")]
struct Cli {
    /// Path to the YAML configuration file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Print the sync plan without touching any data
    #[arg(long)]
    dry_run: bool,

    /// Honor existing checkpoints from a previous run
    #[arg(long)]
    resume: bool,

    /// Comma-separated subset of configured tables to sync
    #[arg(long)]
    tables: Option<String>,

    /// Replace the checkpoint state with a fresh run and exit
    #[arg(long)]
    clear_state: bool,

    /// Skip the interactive confirmation prompt
    #[arg(long, short = 'y')]
    yes: bool,

    /// Pause between sync cycles, e.g. "10", "30s", "5m"
    #[arg(long, default_value = "10s", value_parser = parse_duration_arg)]
    loop_interval: Duration,

    /// Lag above which a table is caught up before entering realtime mode
    #[arg(long, default_value = "300s", value_parser = parse_duration_arg)]
    realtime_threshold: Duration,
}

fn parse_duration_arg(s: &str) -> anyhow::Result<Duration> {
    Ok(Duration::from_secs(parse_duration_to_secs(s)?))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = Config::load(&cli.config)?;
    if cli.dry_run {
        config.monitoring.dry_run = true;
    }
    if cli.resume {
        config.sync.resume = true;
    }
    if let Some(tables) = &cli.tables {
        let selected: Vec<String> = tables.split(',').map(str::to_string).collect();
        config.filter_tables(&selected);
    }
    config.validate()?;

    let default_level = if config.monitoring.verbose_logging {
        "debug"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_level.into()),
        )
        .init();

    if config.monitoring.dry_run {
        report::print_sync_plan(&config);
        info!("dry run complete, nothing was synced");
        return Ok(());
    }

    info!("connecting to source cluster");
    let source = Arc::new(ClickHouseStore::connect(&config.source, &config.sync)?);
    info!("connecting to target cluster");
    let target = Arc::new(ClickHouseStore::connect(&config.target, &config.sync)?);

    source.ping().await.context("source connection failed")?;
    target.ping().await.context("target connection failed")?;
    if let Ok(version) = source.server_version().await {
        info!(version = %version, "source cluster connected");
    }
    if let Ok(version) = target.server_version().await {
        info!(version = %version, "target cluster connected");
    }

    let checkpoint = Arc::new(CheckpointStore::new(&config.sync.state_file));
    if cli.clear_state {
        checkpoint.clear().await?;
        info!("checkpoint state cleared");
        return Ok(());
    }
    if config.sync.resume {
        checkpoint.load().await?;
    } else {
        checkpoint.clear().await?;
    }

    report::print_sync_plan(&config);
    if !cli.yes && !ask_confirmation("start syncing now?")? {
        info!("sync aborted by operator");
        return Ok(());
    }

    let config = Arc::new(config);
    let source_store: Arc<dyn Store> = source.clone();
    let target_store: Arc<dyn Store> = target.clone();
    let source_catalog: Arc<dyn SchemaCatalog> = source;
    let target_catalog: Arc<dyn SchemaCatalog> = target;
    let coordinator = Coordinator::new(
        config.clone(),
        source_store,
        target_store,
        source_catalog,
        target_catalog,
        checkpoint.clone(),
    );

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            info!("shutdown signal received, finishing the in-flight batch");
            cancel.cancel();
        });
    }

    let realtime_threshold = chrono::Duration::from_std(cli.realtime_threshold)
        .context("realtime threshold out of range")?;
    info!(
        loop_interval_secs = cli.loop_interval.as_secs(),
        realtime_threshold_secs = cli.realtime_threshold.as_secs(),
        "smart sync loop enabled, press Ctrl+C to stop"
    );

    let supervisor = Supervisor::new(coordinator, cli.loop_interval, realtime_threshold);
    let cycles = supervisor.run(cancel).await;

    report::print_final_report(&config, &checkpoint).await;
    info!(cycles, "sync stopped cleanly");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut terminate =
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(signal) => signal,
                Err(_) => {
                    let _ = ctrl_c.await;
                    return;
                }
            };
        tokio::select! {
            _ = ctrl_c => {}
            _ = terminate.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}

fn ask_confirmation(prompt: &str) -> anyhow::Result<bool> {
    use std::io::Write;

    print!("{prompt} (yes/no): ");
    std::io::stdout().flush()?;
    let mut line = String::new();
    std::io::stdin().read_line(&mut line)?;
    Ok(line.trim().eq_ignore_ascii_case("yes"))
}
