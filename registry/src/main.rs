//! Command line entry point for registry garbage collection.

use std::process::ExitCode;

use camino::Utf8PathBuf;
use clap::Parser;
use serde::Deserialize;

use registry::{GarbageCollector, GcError, GcMode, GcOptions, GcReport, GcState, RegistryStore};

#[derive(Debug, Parser)]
#[command(
    name = "registry-gc",
    about = "Garbage collect unreferenced blobs from a container registry",
    version
)]
struct Args {
    /// Path to the registry configuration file
    #[arg(short, long, default_value = "registry.toml")]
    config: Utf8PathBuf,

    /// Concurrency for the walk and sweep phases
    #[arg(long, default_value_t = 4)]
    workers: usize,

    /// Wall-clock budget for the run, e.g. 30s, 10m, 2h
    #[arg(long, value_parser = parse_duration)]
    timeout: Option<std::time::Duration>,

    /// Lease time-to-live for the lock record
    #[arg(long, value_parser = parse_duration, default_value = "60s")]
    lease_ttl: std::time::Duration,

    /// Directory for the mark checkpoint
    #[arg(long, default_value = ".")]
    checkpoint_dir: Utf8PathBuf,

    /// Mark only, persisting a checkpoint instead of sweeping
    #[arg(long, conflicts_with = "sweep")]
    mark_only: bool,

    /// Sweep only, loading the mark set from a checkpoint
    #[arg(long)]
    sweep: bool,

    /// Treat untagged manifest revisions as unreferenced
    #[arg(long)]
    delete_untagged: bool,

    /// Log deletions instead of performing them
    #[arg(long)]
    dry_run: bool,

    /// Suppress periodic progress reports
    #[arg(short, long)]
    quiet: bool,
}

impl Args {
    fn mode(&self) -> GcMode {
        if self.mark_only {
            GcMode::MarkOnly
        } else if self.sweep {
            GcMode::SweepOnly
        } else {
            GcMode::MarkAndSweep
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct Config {
    storage: storage::StorageConfig,
    bucket: String,
}

fn load_config(path: &Utf8PathBuf) -> Result<Config, GcError> {
    let raw = std::fs::read_to_string(path)?;
    toml_edit::de::from_str(&raw)
        .map_err(|err| GcError::Config(format!("failed to parse {path}: {err}")))
}

fn parse_duration(value: &str) -> Result<std::time::Duration, String> {
    let (digits, scale) = if let Some(rest) = value.strip_suffix('h') {
        (rest, 3600)
    } else if let Some(rest) = value.strip_suffix('m') {
        (rest, 60)
    } else if let Some(rest) = value.strip_suffix('s') {
        (rest, 1)
    } else {
        (value, 1)
    };

    let seconds: u64 = digits
        .trim()
        .parse()
        .map_err(|_| format!("invalid duration: {value:?}"))?;
    Ok(std::time::Duration::from_secs(seconds * scale))
}

fn init_tracing(quiet: bool) {
    let default_filter = if quiet { "warn" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn collect(args: &Args) -> Result<GcReport, GcError> {
    let config = load_config(&args.config)?;
    let store = RegistryStore::new(config.storage.build(), config.bucket);

    let options = GcOptions {
        mode: args.mode(),
        delete_untagged: args.delete_untagged,
        dry_run: args.dry_run,
        workers: args.workers,
        timeout: args.timeout,
        lease_ttl: args.lease_ttl,
        checkpoint_dir: args.checkpoint_dir.clone(),
        quiet: args.quiet,
    };

    GarbageCollector::new(store, options).run().await
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_tracing(args.quiet);

    match collect(&args).await {
        Ok(report) => {
            match serde_json::to_string_pretty(&report) {
                Ok(json) => println!("{json}"),
                Err(err) => tracing::error!("failed to encode report: {err}"),
            }
            if report.state == GcState::Cancelled {
                // Distinct from failure so schedulers can retry with a
                // larger budget.
                ExitCode::from(3)
            } else {
                ExitCode::SUCCESS
            }
        }
        Err(err) => {
            tracing::error!("garbage collection failed: {err}");
            ExitCode::from(err.exit_code() as u8)
        }
    }
}
