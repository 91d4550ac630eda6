use anyhow::{Context, Result};
use clap::Parser;
use log::{info, warn};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use refrefine::{BatchPipeline, DomainRules, JsonReferenceStore, RefineConfig};

/// Finds PRIMARY and SECONDARY URLs for a collection of bibliography references
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// JSON array of bibliographic records
    #[arg(short, long)]
    references: PathBuf,
    /// Decision file (defaults to <references>.decisions.json)
    #[arg(short, long)]
    decisions: Option<PathBuf>,
    /// Progress file used to resume an interrupted batch
    #[arg(short, long)]
    progress: Option<PathBuf>,
    /// Domain rules JSON overriding the built-in heuristics
    #[arg(long)]
    rules: Option<PathBuf>,
    /// Number of references processed concurrently
    #[arg(short, long)]
    concurrency: Option<usize>,
    /// Summary output file (prints to stdout if not specified)
    #[arg(short, long)]
    output: Option<PathBuf>,
    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Configure logging
    if args.verbose {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("debug")).init();
    } else {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    }

    if !args.references.exists() {
        anyhow::bail!("References file {:?} does not exist.", args.references);
    }

    let mut config = RefineConfig::from_env().context("Failed to read configuration")?;
    if let Some(rules) = &args.rules {
        config.rules =
            DomainRules::load(rules).with_context(|| format!("Failed to load domain rules from {:?}", rules))?;
    }
    if let Some(concurrency) = args.concurrency {
        config.batch_concurrency = concurrency.max(1);
    }
    if config.search_api_key.is_empty() || config.search_cx.is_empty() {
        warn!("GOOGLE_CSE_API_KEY or GOOGLE_CSE_CX is not set; search requests will be rejected");
    }

    let decisions = args
        .decisions
        .clone()
        .unwrap_or_else(|| sibling(&args.references, ".decisions.json"));
    let progress = args
        .progress
        .clone()
        .unwrap_or_else(|| sibling(&args.references, ".progress.json"));

    let store = JsonReferenceStore::open(&args.references, &decisions)
        .with_context(|| format!("Failed to load references from {:?}", args.references))?;
    let references = store.references();
    info!("Refining {} references", references.len());

    let pipeline = BatchPipeline::from_config(&config, Arc::new(store)).context("Failed to build pipeline")?;

    let cancel = pipeline.cancel_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, stopping after in-flight references");
            cancel.cancel();
        }
    });

    let summary = pipeline
        .process_batch(&references, &progress)
        .await
        .context("Batch processing failed")?;

    let report = summary.report();
    if let Some(output_file) = &args.output {
        fs::write(output_file, &report).with_context(|| format!("Failed to write summary to {:?}", output_file))?;
        info!("Summary written to {:?}", output_file);
    } else {
        println!("{}", report);
    }

    Ok(())
}
