use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufRead, BufReader, BufWriter};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, EnvFilter};

use campaign_dimensions::config::Config;
use campaign_dimensions::contact::HttpContactSource;
use campaign_dimensions::export::health::HealthMetrics;
use campaign_dimensions::pipeline::{dimension_from_config, Pipeline};

/// Derives per-message campaign dimensions from visit interaction timelines.
#[derive(Parser)]
#[command(name = "campaign-dimensions", about)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// NDJSON file of visit contexts. Reads stdin when omitted.
    #[arg(short, long)]
    input: Option<PathBuf>,

    /// Logging verbosity level (trace, debug, info, warn, error).
    /// Overrides `log_level` from the config file.
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Print version information and exit.
    Version,
}

/// Build-time version info, injected via the environment.
mod version {
    /// Release version string (set at build time).
    pub const RELEASE: &str = env!("CARGO_PKG_VERSION");

    /// Git commit hash (set at build time via env, or "unknown").
    pub fn git_commit() -> &'static str {
        option_env!("GIT_COMMIT").unwrap_or("unknown")
    }

    /// Full version string with platform info.
    pub fn full() -> String {
        format!(
            "{} (commit: {}, {}/{})",
            RELEASE,
            git_commit(),
            std::env::consts::OS,
            std::env::consts::ARCH,
        )
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Some(Command::Version) = &cli.command {
        println!("campaign-dimensions {}", version::full());
        return Ok(());
    }

    let config_path = cli
        .config
        .context("--config is required (use --help for usage)")?;

    let cfg = Config::load(&config_path)
        .with_context(|| format!("loading config from {}", config_path.display()))?;

    // Records go to stdout, so logs go to stderr.
    let level = cli.log_level.as_deref().unwrap_or(&cfg.log_level);
    let filter =
        EnvFilter::try_new(level).with_context(|| format!("invalid log level: {level}"))?;

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    tracing::info!(
        version = version::RELEASE,
        commit = version::git_commit(),
        dimension = %cfg.dimension.id,
        "starting campaign-dimensions",
    );

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    rt.block_on(run(cfg, cli.input))
}

async fn run(cfg: Config, input: Option<PathBuf>) -> Result<()> {
    let cancel = CancellationToken::new();
    tokio::spawn(wait_for_shutdown(cancel.clone()));

    let metrics =
        Arc::new(HealthMetrics::new(&cfg.health.addr).context("creating health metrics")?);
    if cfg.health.enabled {
        metrics
            .start()
            .await
            .context("starting health metrics server")?;
    }

    let source = HttpContactSource::new(&cfg.contacts).context("creating contact client")?;
    let dimension = dimension_from_config(&cfg, source, Some(Arc::clone(&metrics)));
    let pipeline =
        Pipeline::new(dimension, cfg.pipeline.workers).with_metrics(Arc::clone(&metrics));

    let reader: Box<dyn AsyncBufRead + Unpin + Send> = match input {
        Some(path) => {
            let file = tokio::fs::File::open(&path)
                .await
                .with_context(|| format!("opening input {}", path.display()))?;
            Box::new(BufReader::new(file))
        }
        None => Box::new(BufReader::new(tokio::io::stdin())),
    };

    let summary = pipeline
        .run(reader, BufWriter::new(tokio::io::stdout()), cancel)
        .await?;

    tracing::info!(
        lines = summary.lines_read,
        parse_errors = summary.parse_errors,
        visits = summary.visits_processed,
        records = summary.records_emitted,
        cancelled = summary.cancelled,
        "campaign-dimensions finished"
    );

    metrics.stop();

    Ok(())
}

/// Cancels `cancel` on SIGINT or SIGTERM.
async fn wait_for_shutdown(cancel: CancellationToken) {
    let ctrl_c = tokio::signal::ctrl_c();

    match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
        Ok(mut sigterm) => {
            tokio::select! {
                _ = ctrl_c => {
                    tracing::info!("received SIGINT, shutting down");
                }
                _ = sigterm.recv() => {
                    tracing::info!("received SIGTERM, shutting down");
                }
            }
        }
        Err(e) => {
            tracing::warn!(error = %e, "registering SIGTERM handler failed");
            let _ = ctrl_c.await;
            tracing::info!("received SIGINT, shutting down");
        }
    }

    cancel.cancel();
}
