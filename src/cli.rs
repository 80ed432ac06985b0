//! Command-line interface definitions.
//!
//! Without a subcommand the binary performs one ingestion pass. Connection
//! settings come from flags or, more usually, the environment (a `.env`
//! file in the working directory is loaded first).

use crate::models::SourceId;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// Ingest Chilean legal news into the store.
///
/// # Examples
///
/// ```sh
/// # One ingestion pass over every source
/// chile_legal_news
///
/// # Two sources, five articles each, no writes
/// chile_legal_news --sources sii,cde --max-articles 5 --dry-run
///
/// # Fill in missing summaries
/// chile_legal_news reenrich --limit 50
/// ```
#[derive(Parser, Debug)]
#[command(author, version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,

    #[command(flatten)]
    pub run: RunArgs,

    #[command(flatten)]
    pub sink: SinkArgs,

    #[command(flatten)]
    pub llm: LlmArgs,

    #[command(flatten)]
    pub limits: LimitArgs,

    /// Source catalogue to use instead of the built-in one
    #[arg(long, env = "SOURCES_FILE", global = true)]
    pub sources_file: Option<PathBuf>,
}

/// Flags of the default ingestion pass.
#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    /// Maximum articles per source
    #[arg(long, default_value_t = 10)]
    pub max_articles: usize,

    /// Comma-separated subset of sources (default: all enabled)
    #[arg(long, value_delimiter = ',')]
    pub sources: Vec<SourceId>,

    /// Look everything up but write nothing
    #[arg(long)]
    pub dry_run: bool,

    /// Skip the LLM; articles are stored without summary and keywords
    #[arg(long)]
    pub no_enrich: bool,
}

#[derive(Args, Debug, Clone)]
pub struct SinkArgs {
    /// Base URL of the REST store
    #[arg(long, env = "SINK_URL", global = true)]
    pub sink_url: Option<String>,

    /// Write credential for the store
    #[arg(long, env = "SINK_KEY", global = true, hide_env_values = true)]
    pub sink_key: Option<String>,

    /// Table holding the articles
    #[arg(long, env = "SINK_TABLE", global = true, default_value = "noticias_juridicas")]
    pub sink_table: String,
}

#[derive(Args, Debug, Clone)]
pub struct LlmArgs {
    /// API key of the OpenAI-compatible endpoint
    #[arg(long, env = "LLM_API_KEY", global = true, hide_env_values = true)]
    pub llm_api_key: Option<String>,

    #[arg(long, env = "LLM_BASE_URL", global = true, default_value = "https://api.openai.com/v1")]
    pub llm_base_url: String,

    #[arg(long, env = "LLM_MODEL", global = true, default_value = "gpt-4o-mini")]
    pub llm_model: String,

    /// Concurrent LLM calls
    #[arg(long, env = "LLM_CONCURRENCY", global = true, default_value_t = 4)]
    pub llm_concurrency: usize,

    /// Provider rate limit
    #[arg(long, env = "LLM_REQUESTS_PER_MINUTE", global = true, default_value_t = 60)]
    pub llm_requests_per_minute: u32,
}

#[derive(Args, Debug, Clone)]
pub struct LimitArgs {
    /// Sources processed in parallel
    #[arg(long, env = "SOURCE_CONCURRENCY", global = true, default_value_t = 1)]
    pub source_concurrency: usize,

    /// Minimum spacing between requests to one host, in milliseconds
    #[arg(long, env = "HOST_MIN_DELAY_MS", global = true, default_value_t = 1000)]
    pub host_min_delay_ms: u64,

    /// Wall-clock budget for the whole run, in seconds
    #[arg(long, env = "RUN_DEADLINE_SECS", global = true, default_value_t = 600)]
    pub run_deadline_secs: u64,

    /// Wall-clock budget per source, in seconds
    #[arg(long, env = "SOURCE_BUDGET_SECS", global = true, default_value_t = 120)]
    pub source_budget_secs: u64,
}

/// Maintenance operations over stored records.
#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Re-apply the current sanitizer to stored records
    RescanBoilerplate {
        /// Only records of this source
        #[arg(long)]
        source: Option<SourceId>,

        /// Report what would change without writing
        #[arg(long)]
        dry_run: bool,
    },

    /// Generate summaries and keywords for stored records
    Reenrich {
        /// Redo every record, not only the ones missing a summary
        #[arg(long)]
        all: bool,

        /// Only records of this source
        #[arg(long)]
        source: Option<SourceId>,

        /// Stop after this many records
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Delete every record of one source
    PurgeSource {
        source: SourceId,

        /// Must repeat the source id
        #[arg(long)]
        confirm: String,
    },
}
