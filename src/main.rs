//! Varsearch CLI - search statistical variables across embedding indexes

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use colored::Colorize;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use varsearch_core::{EngineConfig, Registry, SearchEngine, SearchOutcome, SearchRequest};

#[derive(Parser)]
#[command(name = "varsearch")]
#[command(about = "Statistical variable search over embedding indexes")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Clone, Copy, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Search variables for one or more queries
    Search {
        /// Queries to search
        #[arg(required = true)]
        queries: Vec<String>,

        /// Engine configuration (JSON)
        #[arg(short, long, default_value = "./varsearch.json")]
        config: PathBuf,

        /// Index to search (repeatable, defaults to the configured set)
        #[arg(short, long = "index")]
        indexes: Vec<String>,

        /// Drop topic ids from the candidates
        #[arg(long)]
        skip_topics: bool,

        /// Rerank candidates with the configured scorer
        #[arg(long)]
        rerank: bool,

        /// Matches fetched per index and query
        #[arg(short = 'k', long)]
        top_k: Option<usize>,

        /// Overall search deadline in milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,

        /// Output format
        #[arg(short, long, value_enum, default_value = "text")]
        format: OutputFormat,
    },

    /// Show which indexes are ready
    Status {
        /// Engine configuration (JSON)
        #[arg(short, long, default_value = "./varsearch.json")]
        config: PathBuf,
    },

    /// Build an ANN table from a CSV embeddings artifact
    BuildAnn {
        /// CSV artifact (path or http(s) URL)
        #[arg(short, long)]
        input: String,

        /// Where to write the table
        #[arg(short, long)]
        output: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(level))
        .with(tracing_subscriber::fmt::layer())
        .init();

    match cli.command {
        Commands::Search {
            queries,
            config,
            indexes,
            skip_topics,
            rerank,
            top_k,
            timeout_ms,
            format,
        } => {
            let mut request = SearchRequest::new(queries)
                .with_indexes(indexes)
                .skip_topics(skip_topics)
                .rerank(rerank);
            if let Some(k) = top_k {
                request = request.top_k(k);
            }
            if let Some(ms) = timeout_ms {
                request = request.deadline(Duration::from_millis(ms));
            }
            run_search(&config, &request, format)?;
        }

        Commands::Status { config } => {
            let registry = load_registry(&config)?;
            let snapshot = registry.snapshot();

            println!("\n=== Indexes ===");
            for status in snapshot.status() {
                if status.ready {
                    println!(
                        "  {} {} ({} store, model {})",
                        "ready".green(),
                        status.name.bold(),
                        status.store.unwrap_or("?"),
                        status.model.as_deref().unwrap_or("?")
                    );
                    if status.failed_calls > 0 {
                        println!("    failed backend calls: {}", status.failed_calls);
                    }
                } else {
                    println!(
                        "  {} {}: {}",
                        "unavailable".red(),
                        status.name.bold(),
                        status.reason.as_deref().unwrap_or("")
                    );
                }
            }
            let reranker = match snapshot.reranker() {
                Some(scorer) => scorer.name().to_string(),
                None => "none".to_string(),
            };
            println!("Reranker: {}", reranker);
        }

        Commands::BuildAnn { input, output } => {
            build_ann(&input, &output)?;
        }
    }

    Ok(())
}

fn load_registry(config_path: &Path) -> Result<Registry> {
    let config = EngineConfig::from_file(config_path)
        .with_context(|| format!("Failed to load config {:?}", config_path))?;
    Registry::build(&config).context("Failed to build index registry")
}

fn run_search(config_path: &Path, request: &SearchRequest, format: OutputFormat) -> Result<()> {
    // Backends hold blocking HTTP clients, which must be created and dropped
    // outside the async runtime
    let registry = Arc::new(load_registry(config_path)?);
    let engine = SearchEngine::new(Arc::clone(&registry));

    let outcome = block_on_detached(engine.search(request))??;

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&outcome)?),
        OutputFormat::Text => print_outcome(&outcome),
    }
    Ok(())
}

/// Run `future` on a fresh runtime. Blocking tasks still running when it
/// completes (indexes that already timed out) are abandoned, not awaited.
fn block_on_detached<F: Future>(future: F) -> Result<F::Output> {
    let runtime = tokio::runtime::Runtime::new().context("Failed to start runtime")?;
    let output = runtime.block_on(future);
    runtime.shutdown_background();
    Ok(output)
}

fn print_outcome(outcome: &SearchOutcome) {
    for (query, candidates) in outcome.candidates.iter() {
        println!("\n=== Candidates for: \"{}\" ===\n", query);
        if candidates.is_empty() {
            println!("  (no matches)");
        }
        for (i, (variable, score)) in candidates
            .variables
            .iter()
            .zip(&candidates.scores)
            .enumerate()
        {
            println!("{}. {} (score: {:.3})", i + 1, variable.bold(), score);
            if let Some(best) = candidates.evidence.get(variable).and_then(|e| e.first()) {
                match best.rerank_score {
                    Some(rerank) => println!("   {} (rerank: {:.3})", best.sentence, rerank),
                    None => println!("   {}", best.sentence),
                }
            }
        }
    }

    for failure in &outcome.failures {
        println!(
            "\n{} index {} skipped: {}",
            "warning:".yellow(),
            failure.index,
            failure.reason
        );
    }
}

#[cfg(feature = "ann")]
fn build_ann(input: &str, output: &Path) -> Result<()> {
    use indicatif::{ProgressBar, ProgressStyle};
    use varsearch_core::{AnnTable, MemoryStore};

    tracing::info!("Loading embeddings from {}...", input);
    let store = MemoryStore::load(input).with_context(|| format!("Failed to load {}", input))?;

    let pb = ProgressBar::new(store.len() as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({percent}%) ~{eta} remaining")?
            .progress_chars("█▓░"),
    );
    pb.enable_steady_tick(Duration::from_millis(100));

    let table = AnnTable::from_rows(store.rows().inspect(|_| pb.inc(1)))?;
    pb.finish_with_message("done");

    tracing::info!("Saving table to {:?}...", output);
    table
        .save(output)
        .with_context(|| format!("Failed to write {:?}", output))?;

    println!("Rows:      {}", table.len());
    println!("Dimension: {}", table.dim());
    Ok(())
}

#[cfg(not(feature = "ann"))]
fn build_ann(_input: &str, _output: &Path) -> Result<()> {
    anyhow::bail!("varsearch was built without the `ann` feature")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn test_block_on_detached_does_not_wait_for_abandoned_tasks() {
        let started = Instant::now();
        let answer = block_on_detached(async {
            // Never awaited, like an index task past its deadline
            tokio::task::spawn_blocking(|| std::thread::sleep(Duration::from_secs(3)));
            42
        })
        .unwrap();

        assert_eq!(answer, 42);
        assert!(started.elapsed() < Duration::from_secs(2));
    }
}
