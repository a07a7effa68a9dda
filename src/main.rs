//! Submerge main entry point
//!
//! This is the command-line interface for the Submerge subscription aggregator.

use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use submerge::cache::TieredCache;
use submerge::config::{load_config_with_hash, load_sources, validate, Config, SourceRef};
use submerge::{Coordinator, PipelineOutcome};
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

/// Submerge: a proxy subscription aggregator
///
/// Submerge fetches subscription lists, normalizes every endpoint
/// descriptor, drops duplicates, probes reachability, and prints the
/// surviving endpoints best first.
#[derive(Parser, Debug)]
#[command(name = "submerge")]
#[command(version)]
#[command(about = "A proxy subscription aggregator", long_about = None)]
struct Cli {
    /// Path to TOML configuration file (defaults are used when omitted)
    #[arg(short, long, value_name = "CONFIG")]
    config: Option<PathBuf>,

    /// Newline-delimited source list (built-in sources when omitted)
    #[arg(short, long, value_name = "FILE")]
    sources: Option<PathBuf>,

    /// Increase logging verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress non-error output
    #[arg(short, long, conflicts_with = "verbose")]
    quiet: bool,

    /// Skip TCP reachability probing
    #[arg(long)]
    no_probe: bool,

    /// Print at most this many endpoints
    #[arg(short, long)]
    limit: Option<usize>,

    /// Print one JSON record per endpoint instead of canonical URIs
    #[arg(long)]
    json: bool,

    /// Validate config and list sources without fetching anything
    #[arg(long)]
    dry_run: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();

    setup_logging(cli.verbose, cli.quiet);

    let mut config = match &cli.config {
        Some(path) => {
            tracing::info!("Loading configuration from: {}", path.display());
            let (config, hash) = load_config_with_hash(path)
                .with_context(|| format!("failed to load {}", path.display()))?;
            tracing::info!("Configuration loaded successfully (hash: {})", hash);
            config
        }
        None => Config::default(),
    };

    if cli.no_probe {
        config.probe.enabled = false;
    }
    if let Some(limit) = cli.limit {
        config.output.max_results = limit;
    }
    validate(&config)?;

    let sources = load_sources(cli.sources.as_deref()).context("failed to load sources")?;

    if cli.dry_run {
        handle_dry_run(&config, &sources);
        return Ok(ExitCode::SUCCESS);
    }

    let outcome = handle_run(config, &sources).await?;
    print_outcome(&outcome, cli.json)?;

    if outcome.is_empty() {
        tracing::error!("No endpoint survived the run");
        return Ok(ExitCode::FAILURE);
    }
    Ok(ExitCode::SUCCESS)
}

/// Sets up the logging/tracing subscriber based on verbosity level
fn setup_logging(verbose: u8, quiet: bool) {
    let filter = if quiet {
        EnvFilter::new("error")
    } else {
        match verbose {
            0 => EnvFilter::new("submerge=info,warn"),
            1 => EnvFilter::new("submerge=debug,info"),
            2 => EnvFilter::new("submerge=trace,debug"),
            _ => EnvFilter::new("trace"),
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_writer(std::io::stderr)
        .init();
}

/// Handles the --dry-run mode: shows the effective configuration and sources
fn handle_dry_run(config: &Config, sources: &[SourceRef]) {
    println!("=== Submerge Dry Run ===\n");

    println!("Fetch:");
    println!("  Concurrency: {}", config.fetch.concurrency);
    println!("  Timeout: {}s", config.fetch.timeout_secs);
    println!("  Attempts per source: {}", config.fetch.retry_attempts);
    println!("  Max lines per source: {}", config.fetch.max_lines_per_source);

    println!("\nProbe:");
    println!("  Enabled: {}", config.probe.enabled);
    println!("  Timeout: {}ms", config.probe.timeout_ms);
    if let Some(path) = &config.probe.geoip_database {
        println!("  GeoIP database: {}", path.display());
    }

    println!("\nCache:");
    println!("  Memory entries: {}", config.cache.l1_capacity);
    println!(
        "  Networked tier: {}",
        config.cache.redis_url.as_deref().unwrap_or("disabled")
    );
    println!(
        "  Durable tier: {}",
        config
            .cache
            .durable_path
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "disabled".to_string())
    );

    println!("\nSources ({}):", sources.len());
    for source in sources {
        println!("  - [{}] {}", source.tier, source.url);
    }

    println!("\n✓ Configuration is valid");
}

/// Handles the main pipeline run, stopping early on Ctrl-C
async fn handle_run(config: Config, sources: &[SourceRef]) -> anyhow::Result<PipelineOutcome> {
    let cache = Arc::new(TieredCache::from_config(&config.cache).await);
    let coordinator = Coordinator::new(config)?.with_cache(Arc::clone(&cache));

    let (cancel_tx, cancel_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, finishing with partial results");
            let _ = cancel_tx.send(true);
        }
    });

    let outcome = coordinator.run_until(sources, cancel_rx).await;
    coordinator.close();

    let stats = cache.stats();
    tracing::info!(
        "Cache: {} memory hits, {} networked hits, {} durable hits, {} misses",
        stats.l1_hits,
        stats.l2_hits,
        stats.l3_hits,
        stats.misses
    );
    for failure in &outcome.failures {
        tracing::warn!("Source failed: {} ({})", failure.url, failure.error);
    }

    Ok(outcome)
}

fn print_outcome(outcome: &PipelineOutcome, json: bool) -> anyhow::Result<()> {
    for scored in &outcome.endpoints {
        if json {
            println!("{}", serde_json::to_string(scored)?);
        } else {
            let latency = scored
                .reachability
                .latency_ms
                .map(|ms| format!("{:.0}ms", ms))
                .unwrap_or_else(|| "-".to_string());
            println!("{:6.1}  {:>7}  {}", scored.score, latency, scored.endpoint.canonical);
        }
    }
    Ok(())
}
