//! Tidemark main entry point
//!
//! This is the command-line interface for the Tidemark ingestion engine.

use anyhow::Context;
use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tidemark::checkpoint::CheckpointStore;
use tidemark::config::{load_config_with_hash, Config, LogRotation, LoggingConfig};
use tidemark::dataset::IncrementalMerger;
use tidemark::fetch::ProxyRotator;
use tidemark::metrics::{read_snapshot, MetricsRegistry, MetricsReporter};
use tidemark::pipeline::{Pipeline, UnitSource};
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer, Registry};

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Tidemark: a resilient ingestion engine
///
/// Tidemark pulls paginated, rate-limited pages into a deduplicated local
/// dataset. Interrupted runs resume from the last contiguous checkpoint.
#[derive(Parser, Debug)]
#[command(name = "tidemark")]
#[command(version)]
#[command(about = "A resilient, resumable ingestion engine", long_about = None)]
struct Cli {
    /// Path to TOML configuration file
    #[arg(value_name = "CONFIG")]
    config: PathBuf,

    /// Increase logging verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress non-error output
    #[arg(short, long, conflicts_with = "verbose")]
    quiet: bool,

    /// Discard the checkpoint and start from the first unit
    #[arg(long)]
    fresh: bool,

    /// Validate config and show what would be fetched without fetching
    #[arg(long, conflicts_with = "stats")]
    dry_run: bool,

    /// Show checkpoint, dataset and metrics status and exit
    #[arg(long, conflicts_with = "dry_run")]
    stats: bool,

    /// Merge these CSV files into the dataset and exit
    #[arg(
        long,
        value_name = "CSV",
        num_args = 1..,
        conflicts_with_all = ["dry_run", "stats", "fresh"]
    )]
    merge: Vec<PathBuf>,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // The log directory comes from the config, so it is read first
    let (config, config_hash) = load_config_with_hash(&cli.config)
        .with_context(|| format!("Failed to load configuration {}", cli.config.display()))?;

    // Dropping the guard flushes the file writer, so it lives until exit
    let _log_guard = setup_logging(cli.verbose, cli.quiet, cli.log_format, &config.logging)?;
    tracing::info!(
        "Configuration loaded from {} (hash: {})",
        cli.config.display(),
        config_hash
    );

    // Handle different modes
    if cli.dry_run {
        handle_dry_run(&config)
    } else if cli.stats {
        handle_stats(&config)
    } else if !cli.merge.is_empty() {
        handle_merge(&config, &cli.merge)
    } else {
        handle_run(config, config_hash, cli.fresh).await
    }
}

/// Sets up the logging/tracing subscriber based on verbosity level
///
/// Console output is always on. With a `[logging] directory` the same events
/// also go to a rolling file, without ANSI colors.
fn setup_logging(
    verbose: u8,
    quiet: bool,
    format: LogFormat,
    logging: &LoggingConfig,
) -> anyhow::Result<Option<WorkerGuard>> {
    let filter = if quiet {
        EnvFilter::new("error")
    } else {
        match verbose {
            0 => EnvFilter::new("tidemark=info,warn"),
            1 => EnvFilter::new("tidemark=debug,info"),
            2 => EnvFilter::new("tidemark=trace,debug"),
            _ => EnvFilter::new("trace"),
        }
    };

    let console = fmt::layer()
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false);
    let mut layers: Vec<BoxedLayer> = vec![match format {
        LogFormat::Text => console.boxed(),
        LogFormat::Json => console.json().boxed(),
    }];

    let guard = match file_writer(logging)? {
        Some((writer, guard)) => {
            let file = fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(false);
            layers.push(match format {
                LogFormat::Text => file.boxed(),
                LogFormat::Json => file.json().boxed(),
            });
            Some(guard)
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(layers)
        .with(filter)
        .try_init()
        .context("Failed to install the log subscriber")?;

    Ok(guard)
}

/// Non-blocking writer over a rolling log file, if a directory is configured
fn file_writer(logging: &LoggingConfig) -> anyhow::Result<Option<(NonBlocking, WorkerGuard)>> {
    let Some(directory) = &logging.directory else {
        return Ok(None);
    };

    std::fs::create_dir_all(directory)
        .with_context(|| format!("Failed to create log directory {}", directory.display()))?;

    let rotation = match logging.rotation {
        LogRotation::Hourly => Rotation::HOURLY,
        LogRotation::Daily => Rotation::DAILY,
        LogRotation::Never => Rotation::NEVER,
    };
    let appender = RollingFileAppender::builder()
        .rotation(rotation)
        .filename_prefix(logging.file_prefix.as_str())
        .build(directory)
        .with_context(|| format!("Failed to open a log file in {}", directory.display()))?;

    Ok(Some(tracing_appender::non_blocking(appender)))
}

/// Handles the --dry-run mode: validates config and shows the plan
fn handle_dry_run(config: &Config) -> anyhow::Result<()> {
    println!("=== Tidemark Dry Run ===\n");

    println!("Fetching:");
    println!(
        "  Rate: {} req/s (burst {})",
        config.fetch.requests_per_second, config.fetch.burst_size
    );
    println!("  Timeout: {}s", config.fetch.timeout_seconds);
    println!(
        "  Retries: {} attempts, backoff {}s..{}s (jitter {})",
        config.retry.max_retries,
        config.retry.base_delay_seconds,
        config.retry.max_delay_seconds,
        config.retry.jitter
    );
    println!("  Workers: {}", config.workers.worker_count);

    let rotator = ProxyRotator::from_config(&config.identity);
    println!("\nIdentities ({}):", rotator.len());
    for identity in rotator.identities() {
        println!("  - {}", identity);
    }

    println!("\nDataset:");
    println!(
        "  Path: {} ({:?})",
        config.dataset.path.display(),
        config.dataset.resolved_format()
    );
    println!("  Key field: {}", config.dataset.key_field);
    if let Some(field) = &config.dataset.tie_break_field {
        println!("  Tie-break field: {}", field);
    }
    println!("  Checkpoint: {}", config.checkpoint.path.display());

    let units = UnitSource::from_config(&config.units)?.load()?;
    let resume = CheckpointStore::read(&config.checkpoint.path)?
        .map(|c| c.cursor)
        .unwrap_or(tidemark::Cursor::Start);
    let remaining = units.iter().filter(|u| !resume.covers(u.seq)).count();

    println!("\nUnits: {} total, {} remaining", units.len(), remaining);
    for unit in units.iter().filter(|u| !resume.covers(u.seq)).take(5) {
        println!("  [{}] {}", unit.seq, unit.target);
    }
    if remaining > 5 {
        println!("  ... and {} more", remaining - 5);
    }

    if config.extract.is_none() {
        println!("\n! No [extract] section: a real run needs one");
    }

    println!("\n✓ Configuration is valid");
    Ok(())
}

/// Handles the --stats mode: shows checkpoint, dataset and metrics status
fn handle_stats(config: &Config) -> anyhow::Result<()> {
    println!("=== Tidemark Status ===\n");

    match CheckpointStore::read(&config.checkpoint.path)? {
        Some(checkpoint) => println!(
            "Checkpoint: cursor {} (next unit {}), written {}",
            checkpoint.cursor,
            checkpoint.cursor.next_unit(),
            checkpoint.updated_at
        ),
        None => println!("Checkpoint: none"),
    }

    let merger = IncrementalMerger::from_config(&config.dataset);
    let dataset = merger.load()?;
    println!(
        "Dataset: {} rows, {} columns ({})",
        dataset.len(),
        dataset.columns.len(),
        config.dataset.path.display()
    );

    match read_snapshot(&config.metrics.snapshot_path)? {
        Some(snapshot) => {
            println!("\nLast metrics snapshot ({}):", snapshot.timestamp);
            for (name, value) in &snapshot.counters {
                println!("  {:<24} {}", name, value);
            }
            for (name, stats) in &snapshot.timers {
                println!(
                    "  {:<24} n={} mean={:.0}ms min={:.0}ms max={:.0}ms",
                    format!("{} (timer)", name),
                    stats.count,
                    stats.mean_ms,
                    stats.min_ms,
                    stats.max_ms
                );
            }
            for (kind, count) in &snapshot.errors {
                println!("  {:<24} {}", format!("errors.{}", kind), count);
            }
        }
        None => println!("\nNo metrics snapshot yet"),
    }

    Ok(())
}

/// Handles --merge: folds offline CSV files into the dataset
fn handle_merge(config: &Config, inputs: &[PathBuf]) -> anyhow::Result<()> {
    let merger = IncrementalMerger::from_config(&config.dataset);
    let outcome = merger
        .merge_files(inputs)
        .with_context(|| format!("Failed to merge into {}", merger.path().display()))?;

    println!(
        "Merged {} files into {}: {} inserted, {} updated, {} unchanged, {} rows",
        inputs.len(),
        merger.path().display(),
        outcome.inserted,
        outcome.updated,
        outcome.unchanged,
        outcome.total
    );
    if outcome.rejected > 0 {
        println!("  {} rows had no '{}' value", outcome.rejected, merger.key_field());
    }
    Ok(())
}

/// Handles the main ingestion run
async fn handle_run(config: Config, config_hash: String, fresh: bool) -> anyhow::Result<()> {
    if fresh {
        tracing::info!("Starting fresh run (discarding checkpoint)");
        CheckpointStore::from_config(&config.checkpoint).reset()?;
    }

    // Build work units and the pipeline
    let units = UnitSource::from_config(&config.units)?.load()?;

    let metrics = Arc::new(MetricsRegistry::new(config.metrics.timer_window));
    let mut pipeline = Pipeline::from_config(&config, Some(config_hash), metrics.clone())?;

    // Start the metrics reporter
    let reporter = MetricsReporter::spawn(
        metrics,
        config.metrics.snapshot_path.clone(),
        Duration::from_secs(config.metrics.report_interval_seconds),
    );

    // Ctrl-C stops dispatch; in-flight units finish
    let token = pipeline.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupt received, finishing in-flight units");
            token.cancel();
        }
    });

    // Run, then flush the final metrics snapshot
    let result = pipeline.run(units).await;
    reporter.shutdown().await;

    // Print results
    let report = result.context("Run aborted")?;
    println!(
        "Completed: {}, failed: {}, skipped: {}, checkpoint: {}{}",
        report.completed,
        report.failed,
        report.skipped,
        report.cursor,
        if report.interrupted { " (interrupted)" } else { "" }
    );

    if report.failed > 0 {
        tracing::warn!(
            "{} units failed; they will be retried on the next run",
            report.failed
        );
    }

    Ok(())
}
