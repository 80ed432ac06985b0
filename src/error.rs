//! Error taxonomy for the ingestion pipeline.
//!
//! Errors are grouped by how they are handled rather than by where they
//! come from: fetch failures are retried and then skipped, parse failures
//! discard one article, enrichment failures degrade to an unenriched write,
//! sink failures are counted, and configuration failures abort the run.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("network error fetching {url}: {reason}")]
    Network { url: String, reason: String },
    #[error("HTTP {status} fetching {url}")]
    Http { status: u16, url: String },
    #[error("timed out fetching {url}")]
    Timeout { url: String },
    #[error("refused redirect from {url} to off-domain host")]
    OffDomainRedirect { url: String },
}

impl FetchError {
    /// Whether another attempt may succeed: connection problems, timeouts,
    /// 5xx and 429.
    pub fn is_transient(&self) -> bool {
        match self {
            FetchError::Network { .. } | FetchError::Timeout { .. } => true,
            FetchError::Http { status, .. } => *status == 429 || *status >= 500,
            FetchError::OffDomainRedirect { .. } => false,
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ParseError {
    #[error("no_selector_match")]
    NoSelectorMatch,
    #[error("body_too_short")]
    BodyTooShort,
    #[error("empty_title")]
    EmptyTitle,
    #[error("listing: {0}")]
    Listing(String),
}

#[derive(Debug, Error, Clone)]
pub enum EnrichmentError {
    #[error("LLM transport error: {0}")]
    Transport(String),
    #[error("LLM API returned HTTP {status}")]
    Api { status: u16 },
    #[error("malformed LLM response: {0}")]
    Malformed(String),
    #[error("enrichment budget exhausted")]
    BudgetExhausted,
}

impl EnrichmentError {
    pub fn is_transient(&self) -> bool {
        match self {
            EnrichmentError::Transport(_) => true,
            EnrichmentError::Api { status } => *status == 429 || *status >= 500,
            EnrichmentError::Malformed(_) | EnrichmentError::BudgetExhausted => false,
        }
    }
}

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("sink transport error: {0}")]
    Transport(String),
    #[error("sink returned HTTP {status}: {body}")]
    Api { status: u16, body: String },
    #[error("could not decode sink response: {0}")]
    Decode(String),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required setting {0}")]
    Missing(&'static str),
    #[error("invalid value for {var}: {reason}")]
    Invalid { var: &'static str, reason: String },
    #[error("source catalogue: {0}")]
    Catalogue(String),
}

/// Why a whole source ended up `done_failed`.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("listing failed: {0}")]
    Listing(#[from] FetchError),
    #[error("listing could not be parsed: {0}")]
    ListingParse(#[from] ParseError),
    #[error("adapter panicked: {0}")]
    Panicked(String),
    #[error("run deadline reached before the source started")]
    NotStarted,
}

/// Failure of a single article; contained by the orchestrator.
#[derive(Debug, Error)]
pub enum ArticleError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error(transparent)]
    Sink(#[from] SinkError),
}

/// Failure of a maintenance command as a whole.
#[derive(Debug, Error)]
pub enum MaintenanceError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Sink(#[from] SinkError),
}
