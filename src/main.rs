//! # Chile Legal News
//!
//! Ingests news from Chilean judicial, regulatory and administrative
//! bodies into a REST-fronted article table, with an LLM-written executive
//! summary and keywords for each article.
//!
//! ## Usage
//!
//! ```sh
//! chile_legal_news --max-articles 10
//! chile_legal_news rescan-boilerplate --dry-run
//! ```
//!
//! ## Architecture
//!
//! 1. **Discovery**: every source adapter lists candidate article URLs
//! 2. **Fetching**: pages are downloaded with per-host throttling and retries
//! 3. **Parsing**: title, body and publication date are extracted and sanitized
//! 4. **Dedup**: each article is checked against the store by URL and fingerprint
//! 5. **Enrichment**: summary and keywords are requested under a rate limit
//! 6. **Upsert**: the record is inserted, updated or skipped
//!
//! The run report is printed to stdout as JSON; logs go to stderr.

use clap::Parser;
use serde::Serialize;
use std::collections::HashSet;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt as tfmt};

mod api;
mod cli;
mod config;
mod dates;
mod dedup;
mod enrich;
mod error;
mod fetcher;
mod maintenance;
mod models;
mod pipeline;
mod sanitize;
mod scrapers;
mod sink;
mod utils;

use api::{OpenAiChat, RetryAsk};
use cli::{Cli, Command};
use config::{Catalogue, LlmSettings, Settings};
use enrich::Enricher;
use error::ConfigError;
use fetcher::{FetchPolicy, HttpFetcher};
use pipeline::{RunContext, RunOptions};
use scrapers::SourceAdapter;
use sink::PostgrestStore;

/// Exit code for settings or catalogue problems found before any work.
const EXIT_CONFIG: u8 = 2;

#[tokio::main]
async fn main() -> ExitCode {
    // A missing .env is fine; the environment may already be set.
    let _ = dotenvy::dotenv();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tfmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_file(false)
        .with_line_number(false)
        .with_timer(tracing_subscriber::fmt::time::UtcTime::rfc_3339())
        .init();

    let cli = Cli::parse();
    let need_llm = match &cli.command {
        None => !cli.run.no_enrich && !cli.run.dry_run,
        Some(Command::Reenrich { .. }) => true,
        Some(_) => false,
    };
    let settings = match Settings::from_cli(&cli, need_llm) {
        Ok(s) => s,
        Err(e) => return config_failure(&e),
    };
    let catalogue = match Catalogue::load(cli.sources_file.as_deref()) {
        Ok(c) => c,
        Err(e) => return config_failure(&e),
    };
    let store = match PostgrestStore::new(&settings.sink) {
        Ok(s) => Arc::new(s),
        Err(e) => {
            error!(error = %e, "Could not build the store client");
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    match cli.command {
        None => ingest(&settings, &catalogue, store).await,
        Some(Command::RescanBoilerplate { source, dry_run }) => {
            let adapters = match catalogue.adapters(&[]) {
                Ok(a) => a,
                Err(e) => return config_failure(&e),
            };
            let result = maintenance::rescan_boilerplate(store.as_ref(), &adapters, source, dry_run).await;
            finish_maintenance(result)
        }
        Some(Command::Reenrich { all, source, limit }) => {
            let Some(llm) = settings.llm.as_ref() else {
                return config_failure(&ConfigError::Missing("LLM_API_KEY"));
            };
            let enricher = match build_enricher(llm) {
                Ok(e) => e,
                Err(e) => {
                    error!(error = %e, "Could not build the LLM client");
                    return ExitCode::from(EXIT_CONFIG);
                }
            };
            let result =
                maintenance::reenrich(store.as_ref(), &enricher, llm.concurrency, !all, source, limit).await;
            finish_maintenance(result)
        }
        Some(Command::PurgeSource { source, confirm }) => {
            let result = maintenance::purge_source(store.as_ref(), source, &confirm).await;
            finish_maintenance(result)
        }
    }
}

fn config_failure(e: &ConfigError) -> ExitCode {
    error!(error = %e, "Invalid configuration");
    eprintln!("configuration error: {e}");
    ExitCode::from(EXIT_CONFIG)
}

fn build_enricher(llm: &LlmSettings) -> Result<Enricher, reqwest::Error> {
    let chat = RetryAsk::new(OpenAiChat::new(llm)?, 2, Duration::from_secs(1));
    Ok(Enricher::new(Arc::new(chat), llm.concurrency, llm.requests_per_minute))
}

fn print_json<T: Serialize>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(json) => println!("{json}"),
        Err(e) => error!(error = %e, "Could not serialize report"),
    }
}

fn finish_maintenance<T: Serialize>(result: Result<T, error::MaintenanceError>) -> ExitCode {
    match result {
        Ok(report) => {
            print_json(&report);
            ExitCode::SUCCESS
        }
        Err(error::MaintenanceError::Config(e)) => config_failure(&e),
        Err(e) => {
            error!(error = %e, "Maintenance operation failed");
            ExitCode::FAILURE
        }
    }
}

/// One ingestion pass over the selected sources.
async fn ingest(settings: &Settings, catalogue: &Catalogue, store: Arc<PostgrestStore>) -> ExitCode {
    let run = &settings.run;
    let adapters = match catalogue.adapters(&run.sources) {
        Ok(a) => a,
        Err(e) => return config_failure(&e),
    };
    if adapters.is_empty() {
        warn!("No enabled sources selected");
    }

    let allowed_hosts: HashSet<String> = adapters.iter().flat_map(|a| a.allowed_hosts()).collect();
    let policy = FetchPolicy {
        host_min_delay: run.host_min_delay,
        ..FetchPolicy::default()
    };
    let fetcher = match HttpFetcher::new(policy, allowed_hosts) {
        Ok(f) => Arc::new(f),
        Err(e) => {
            error!(error = %e, "Could not build the HTTP client");
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    let enricher = match settings.llm.as_ref() {
        Some(llm) => match build_enricher(llm) {
            Ok(e) => Some(Arc::new(e)),
            Err(e) => {
                error!(error = %e, "Could not build the LLM client");
                return ExitCode::from(EXIT_CONFIG);
            }
        },
        None => {
            info!(dry_run = run.dry_run, "Enrichment disabled for this run");
            None
        }
    };

    let options = RunOptions {
        max_articles: run.max_articles,
        dry_run: run.dry_run,
        source_concurrency: run.source_concurrency,
        enrich_concurrency: settings.llm.as_ref().map_or(4, |l| l.concurrency),
        source_budget: run.source_budget,
    };
    let ctx = RunContext::new(fetcher, store, enricher, options, run.run_deadline);

    let adapters: Vec<Box<dyn SourceAdapter>> = adapters
        .into_iter()
        .map(|a| Box::new(a) as Box<dyn SourceAdapter>)
        .collect();
    let report = pipeline::run(&ctx, &adapters).await;

    print_json(&report);
    ExitCode::from(report.exit_code() as u8)
}
