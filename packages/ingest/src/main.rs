#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! CLI entry point for the grid dataset ingestion tool.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::ExitCode;

use chrono::{DateTime, TimeDelta, Utc};
use clap::{Parser, Subcommand};
use grid_ingest_cli_utils::IndicatifProgress;
use grid_ingest_database::failure_log::FailureLog;
use grid_ingest_database::progress_store::ProgressStore;
use grid_ingest_database::warehouse::DuckDbWarehouse;
use grid_ingest_dataset::parsing::parse_timestamp;
use grid_ingest_dataset_models::{ProgressStatus, WindowOrder, format_utc};
use grid_ingest_ingest::config::{IngestConfig, split_list};
use grid_ingest_ingest::{
    ArchiveUse, PipelineOptions, RunRequest, build_pipeline, load_registry, open_state, purge_range,
};
use grid_ingest_ingest_models::RunSummary;
use tokio_util::sync::CancellationToken;

/// Exit status when cancellation left windows unprocessed.
const EXIT_CANCELLED: u8 = 130;

#[derive(Parser)]
#[command(name = "grid_ingest", about = "Resumable windowed dataset ingestion")]
struct Cli {
    /// Config file (defaults to `grid_ingest.toml` if present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Ingest every window of the selected datasets in [start, end)
    Run {
        /// Range start (`YYYY-MM-DD` or RFC 3339)
        #[arg(long, value_parser = parse_bound)]
        start: DateTime<Utc>,
        /// Range end, exclusive (`YYYY-MM-DD` or RFC 3339)
        #[arg(long, value_parser = parse_bound)]
        end: DateTime<Utc>,
        /// Comma-separated dataset names (overrides `GRID_INGEST_DATASETS`)
        #[arg(long)]
        datasets: Option<String>,
        /// `oldest-first` or `newest-first`
        #[arg(long, value_parser = parse_order)]
        order: Option<WindowOrder>,
        /// Concurrent workers. Windows of one dataset run one at a time, so
        /// workers beyond the number of selected datasets stay idle
        #[arg(long)]
        workers: Option<usize>,
        /// Include datasets flagged as likely offline
        #[arg(long)]
        include_offline: bool,
        /// Archive raw payloads under `<data_dir>/raw`
        #[arg(long, conflicts_with_all = ["from_archive", "archive_only"])]
        archive: bool,
        /// Replay archived payloads, fetching windows that are not archived
        #[arg(long, conflicts_with = "archive_only")]
        from_archive: bool,
        /// Replay archived payloads only; windows that are not archived fail
        #[arg(long)]
        archive_only: bool,
        /// Extra query parameter `KEY=VALUE`, repeatable. Replaces the
        /// dataset's own value for `KEY`
        #[arg(long = "param", value_parser = parse_param)]
        params: Vec<(String, String)>,
        /// Comma-separated BM unit ids, sent as repeated `bmUnit` parameters
        #[arg(long)]
        bm_units: Option<String>,
    },
    /// List registered datasets
    Datasets,
    /// Show progress counts per dataset
    Status {
        /// Restrict to one dataset
        #[arg(long)]
        dataset: Option<String>,
    },
    /// List failed windows recorded for review
    Failures {
        /// Restrict to one dataset
        #[arg(long)]
        dataset: Option<String>,
    },
    /// Forget progress for windows starting in [start, end) so the next run
    /// re-ingests them. Warehouse rows are left untouched.
    Reset {
        /// Dataset name
        #[arg(long)]
        dataset: String,
        /// Range start (`YYYY-MM-DD` or RFC 3339)
        #[arg(long, value_parser = parse_bound)]
        start: DateTime<Utc>,
        /// Range end, exclusive (`YYYY-MM-DD` or RFC 3339)
        #[arg(long, value_parser = parse_bound)]
        end: DateTime<Utc>,
    },
    /// Delete warehouse rows for every day [start, end) touches and forget
    /// progress for windows starting in those days
    Purge {
        /// Dataset name
        #[arg(long)]
        dataset: String,
        /// Range start (`YYYY-MM-DD` or RFC 3339)
        #[arg(long, value_parser = parse_bound)]
        start: DateTime<Utc>,
        /// Range end, exclusive (`YYYY-MM-DD` or RFC 3339)
        #[arg(long, value_parser = parse_bound)]
        end: DateTime<Utc>,
    },
}

fn parse_bound(s: &str) -> Result<DateTime<Utc>, String> {
    parse_timestamp(s).ok_or_else(|| format!("expected YYYY-MM-DD or an RFC 3339 timestamp, got {s:?}"))
}

fn parse_order(s: &str) -> Result<WindowOrder, String> {
    s.parse()
        .map_err(|_| format!("expected oldest-first or newest-first, got {s:?}"))
}

fn parse_param(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => Ok((key.trim().to_string(), value.trim().to_string())),
        _ => Err(format!("expected KEY=VALUE, got {s:?}")),
    }
}

fn format_window(window: TimeDelta) -> String {
    let minutes = window.num_minutes();
    if minutes % (60 * 24 * 7) == 0 && minutes >= 60 * 24 * 7 {
        format!("{}w", minutes / (60 * 24 * 7))
    } else if minutes % (60 * 24) == 0 && minutes >= 60 * 24 {
        format!("{}d", minutes / (60 * 24))
    } else if minutes % 60 == 0 {
        format!("{}h", minutes / 60)
    } else {
        format!("{minutes}m")
    }
}

fn exit_code(summary: &RunSummary) -> ExitCode {
    if !summary.failures.is_empty() {
        ExitCode::FAILURE
    } else if summary.cancelled {
        ExitCode::from(EXIT_CANCELLED)
    } else {
        ExitCode::SUCCESS
    }
}

#[allow(clippy::too_many_lines)]
#[tokio::main]
async fn main() -> Result<ExitCode, Box<dyn std::error::Error>> {
    let multi = grid_ingest_cli_utils::init_logger();
    let cli = Cli::parse();
    let mut config = IngestConfig::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Run {
            start,
            end,
            datasets,
            order,
            workers,
            include_offline,
            archive,
            from_archive,
            archive_only,
            mut params,
            bm_units,
        } => {
            if let Some(workers) = workers {
                config.pipeline.workers = workers;
                config.validate()?;
            }
            let registry = load_registry(&config)?;
            let names = datasets.map_or_else(|| config.pipeline.datasets.clone(), |d| split_list(&d));
            let selected = registry.select(&names, include_offline)?;
            if selected.is_empty() {
                return Err("No datasets selected".into());
            }
            log::info!(
                "Ingesting {} dataset(s): {}",
                selected.len(),
                selected
                    .iter()
                    .map(|s| s.name.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            );

            let archive = if archive_only {
                ArchiveUse::ReplayOnly
            } else if from_archive {
                ArchiveUse::Replay
            } else if archive {
                ArchiveUse::Record
            } else {
                ArchiveUse::Off
            };
            if let Some(units) = bm_units {
                params.extend(split_list(&units).into_iter().map(|unit| ("bmUnit".to_string(), unit)));
            }
            let pipeline = build_pipeline(&config, PipelineOptions { archive, params })?;
            let request = RunRequest {
                datasets: selected,
                start,
                end,
                order: order.unwrap_or(config.pipeline.order),
            };

            let cancel = CancellationToken::new();
            {
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    if tokio::signal::ctrl_c().await.is_ok() {
                        log::warn!("Interrupt received; finishing in-flight windows");
                        cancel.cancel();
                    }
                });
            }

            let bar = IndicatifProgress::windows_bar(&multi, "Planning windows");
            let summary = pipeline.run(&request, cancel, bar).await?;
            println!();
            print!("{summary}");
            return Ok(exit_code(&summary));
        }
        Commands::Datasets => {
            let registry = load_registry(&config)?;
            println!("{:<10} {:>6} {:<18} {:>6}  DESCRIPTION", "NAME", "WINDOW", "TABLE", "FIELDS");
            println!("{}", "-".repeat(72));
            for spec in registry.all() {
                println!(
                    "{:<10} {:>6} {:<18} {:>6}  {}{}",
                    spec.name,
                    format_window(spec.max_window),
                    spec.table,
                    spec.fields.len(),
                    spec.description,
                    if spec.likely_offline { " (likely offline)" } else { "" }
                );
            }
        }
        Commands::Status { dataset } => {
            let (progress, _) = open_state(&config)?;
            let records = progress.records(dataset.as_deref().map(str::to_uppercase).as_deref())?;

            let mut by_dataset: BTreeMap<&str, [u64; 3]> = BTreeMap::new();
            let mut latest: BTreeMap<&str, DateTime<Utc>> = BTreeMap::new();
            for record in &records {
                let counts = by_dataset.entry(record.dataset.as_str()).or_default();
                match record.status {
                    ProgressStatus::Pending => counts[0] += 1,
                    ProgressStatus::Completed => {
                        counts[1] += 1;
                        let end = latest.entry(record.dataset.as_str()).or_insert(record.window_end);
                        *end = (*end).max(record.window_end);
                    }
                    ProgressStatus::Failed => counts[2] += 1,
                }
            }

            println!(
                "{:<10} {:>8} {:>10} {:>8}  COMPLETED THROUGH",
                "DATASET", "PENDING", "COMPLETED", "FAILED"
            );
            println!("{}", "-".repeat(64));
            for (name, [pending, completed, failed]) in &by_dataset {
                println!(
                    "{name:<10} {pending:>8} {completed:>10} {failed:>8}  {}",
                    latest.get(name).map_or_else(|| "-".to_string(), format_utc)
                );
            }
        }
        Commands::Failures { dataset } => {
            let (_, failures) = open_state(&config)?;
            let records = failures.records(dataset.as_deref().map(str::to_uppercase).as_deref())?;
            if records.is_empty() {
                println!("No failures recorded.");
            }
            for record in &records {
                println!(
                    "{} {} [{}, {}) {}: {}",
                    format_utc(&record.failed_at),
                    record.dataset,
                    format_utc(&record.window_start),
                    format_utc(&record.window_end),
                    record.stage,
                    record.reason
                );
            }
        }
        Commands::Reset { dataset, start, end } => {
            let registry = load_registry(&config)?;
            let name = registry
                .get(&dataset)
                .map(|spec| spec.name.clone())
                .ok_or_else(|| format!("Unknown dataset: {dataset}"))?;
            let (progress, _) = open_state(&config)?;
            let removed = progress.clear(&name, start, end)?;
            log::info!(
                "Cleared {removed} progress record(s) for {name} in [{}, {})",
                format_utc(&start),
                format_utc(&end)
            );
        }
        Commands::Purge { dataset, start, end } => {
            let registry = load_registry(&config)?;
            let spec = registry
                .get(&dataset)
                .ok_or_else(|| format!("Unknown dataset: {dataset}"))?;
            let (progress, _) = open_state(&config)?;
            let warehouse = DuckDbWarehouse::new(config.data_paths());
            let purged = purge_range(&warehouse, progress.as_ref(), spec, start, end)?;
            println!(
                "Purged {} row(s) and {} progress record(s) for {} in [{}, {})",
                purged.rows, purged.windows, spec.name, purged.from, purged.to
            );
        }
    }

    Ok(ExitCode::SUCCESS)
}
