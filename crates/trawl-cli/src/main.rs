mod export;

use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use trawl_client::{HttpClient, LinkedInExtractor, ShopeeExtractor};
use trawl_core::{
    EngineConfig, ExtractionResult, ExtractorRegistry, RateLimiter, RunController, RunOptions,
    RunState, Source, Target,
};

use crate::export::ExportFormat;

#[derive(Parser)]
#[command(
    name = "trawl",
    version,
    about = "Concurrent profile and content extraction across social, commerce and job sources"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Extract profiles and recent items for a batch of targets
    Run {
        /// Source to query (instagram, tiktok, shopee, linkedin, ...)
        #[arg(short, long, env = "TRAWL_SOURCE", value_parser = parse_source)]
        source: Source,

        /// Usernames, shop ids or keywords; repeat or separate with commas
        #[arg(short, long = "target", value_delimiter = ',')]
        targets: Vec<String>,

        /// File with one target per line
        #[arg(long)]
        targets_file: Option<PathBuf>,

        /// Maximum items collected per target
        #[arg(short = 'n', long, default_value_t = 10)]
        max_items: usize,

        /// Drop items published before this date (YYYY-MM-DD)
        #[arg(long)]
        since: Option<NaiveDate>,

        /// Worker pool size, overrides TRAWL_WORKERS
        #[arg(short, long)]
        workers: Option<usize>,

        /// Output format
        #[arg(short, long, value_enum, default_value_t = ExportFormat::Json)]
        format: ExportFormat,

        /// Write to this file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// LinkedIn search location
        #[arg(long, env = "TRAWL_LINKEDIN_LOCATION")]
        location: Option<String>,

        /// Shopee regional storefront, e.g. https://shopee.sg
        #[arg(long, env = "TRAWL_SHOPEE_BASE_URL")]
        shopee_base_url: Option<String>,
    },

    /// List known sources and whether an extractor is available
    Sources,
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("trawl=info".parse()?))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            source,
            targets,
            targets_file,
            max_items,
            since,
            workers,
            format,
            output,
            location,
            shopee_base_url,
        } => {
            let targets = collect_targets(source, targets, targets_file)?;
            let mut options = RunOptions::default().with_max_items(max_items);
            if let Some(dt) = since.and_then(|date| date.and_hms_opt(0, 0, 0)) {
                options = options.with_since(dt.and_utc());
            }
            let overrides = SourceOverrides {
                location,
                shopee_base_url,
            };
            cmd_run(targets, options, workers, overrides, format, output).await
        }
        Commands::Sources => cmd_sources(),
    }
}

fn parse_source(s: &str) -> Result<Source, String> {
    s.parse().map_err(|e: trawl_core::AppError| e.to_string())
}

/// Merges `--target` values with the lines of `--targets-file`.
fn collect_targets(
    source: Source,
    inline: Vec<String>,
    file: Option<PathBuf>,
) -> Result<Vec<Target>> {
    let mut raw = inline;
    if let Some(path) = file {
        let contents = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read targets file: {}", path.display()))?;
        raw.extend(split_targets(&contents));
    }

    let targets = raw
        .iter()
        .map(|id| id.trim())
        .filter(|id| !id.is_empty())
        .map(|id| Target::new(source, id))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| anyhow::anyhow!(e))?;

    if targets.is_empty() {
        anyhow::bail!("No targets given; use --target or --targets-file");
    }
    Ok(targets)
}

fn split_targets(contents: &str) -> impl Iterator<Item = String> + '_ {
    contents
        .split(['\n', ','])
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
}

/// Per-source settings given on the command line.
#[derive(Debug, Default)]
struct SourceOverrides {
    location: Option<String>,
    shopee_base_url: Option<String>,
}

/// HTTP client whose request timeout matches the engine's call timeout.
fn http_client(config: &EngineConfig) -> Result<HttpClient> {
    HttpClient::with_timeout(config.call_timeout).map_err(|e| anyhow::anyhow!(e))
}

/// Extractors for every source, sharing `limiter` with the controller.
fn build_registry(
    config: &EngineConfig,
    limiter: &RateLimiter,
    overrides: SourceOverrides,
) -> Result<ExtractorRegistry> {
    let http = http_client(config)?;
    let mut registry = trawl_client::registry_with(http.clone(), limiter.clone());

    // Leave half the call for the search itself.
    let mut linkedin = LinkedInExtractor::new(http.clone(), limiter.clone())
        .with_detail_budget(config.call_timeout / 2);
    if let Some(location) = overrides.location {
        linkedin = linkedin.with_location(location);
    }
    registry.register(Source::LinkedIn, linkedin);

    if let Some(base_url) = overrides.shopee_base_url {
        registry.register(Source::Shopee, ShopeeExtractor::new(http).with_base_url(base_url));
    }
    Ok(registry)
}

async fn cmd_run(
    targets: Vec<Target>,
    options: RunOptions,
    workers: Option<usize>,
    overrides: SourceOverrides,
    format: ExportFormat,
    output: Option<PathBuf>,
) -> Result<()> {
    let mut config = EngineConfig::from_env().context("Invalid engine configuration")?;
    if let Some(workers) = workers {
        config = config.with_workers(workers);
    }

    let limiter = config.rate_limiter();
    let registry = build_registry(&config, &limiter, overrides)?;
    let controller = RunController::with_rate_limiter(config, registry, limiter)
        .map_err(|e| anyhow::anyhow!(e))?;
    let handle = controller
        .start_run(targets, options)
        .map_err(|e| anyhow::anyhow!(e))?;
    tracing::info!(run_id = %handle, "Run started");

    let mut updates = controller
        .subscribe(handle)
        .map_err(|e| anyhow::anyhow!(e))?;
    let mut reported = 0;
    let mut interrupted = false;
    loop {
        let state = updates.borrow_and_update().clone();
        reported = report_progress(&state, reported);
        if state.status.is_terminal() {
            break;
        }

        tokio::select! {
            changed = updates.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c(), if !interrupted => {
                tracing::warn!("Interrupted, cancelling run and keeping partial results");
                controller.cancel(handle).map_err(|e| anyhow::anyhow!(e))?;
                interrupted = true;
            }
        }
    }

    let state = controller
        .release(handle)
        .map_err(|e| anyhow::anyhow!(e))?;
    tracing::info!(
        status = ?state.status,
        succeeded = state.successes().count(),
        failed = state.failures().count(),
        "Run finished"
    );

    export::export(&state.results, format, output.as_deref())?;
    if let Some(path) = output {
        println!("Wrote {} results to {}", state.results.len(), path.display());
    }
    Ok(())
}

/// Logs results appended since the last update; returns the new count.
fn report_progress(state: &RunState, already_reported: usize) -> usize {
    for result in state.results.iter().skip(already_reported) {
        let progress = format!("{}/{}", state.progress.completed, state.progress.total);
        match result {
            ExtractionResult::Success { target, items, .. } => {
                tracing::info!(%progress, %target, items = items.len(), "Extracted");
            }
            ExtractionResult::Failure {
                target,
                kind,
                message,
                attempts,
                ..
            } => {
                tracing::warn!(%progress, %target, %kind, %attempts, "Failed: {message}");
            }
        }
    }
    state.results.len()
}

fn cmd_sources() -> Result<()> {
    let registry = trawl_client::default_registry().map_err(|e| anyhow::anyhow!(e))?;
    let limiter = EngineConfig::from_env()
        .context("Invalid engine configuration")?
        .rate_limiter();
    println!("{:<14} {:<10} RATE LIMIT", "SOURCE", "EXTRACTOR");
    println!("{}", "-".repeat(42));
    for source in Source::ALL {
        let Some(limit) = limiter.limit_for(source) else {
            continue;
        };
        println!(
            "{:<14} {:<10} {} per {}ms",
            source.as_str(),
            if registry.contains(source) { "yes" } else { "no" },
            limit.capacity,
            limit.refill_interval.as_millis()
        );
    }
    Ok(())
}
