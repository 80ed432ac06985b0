//! One ingestion run over the enabled sources.
//!
//! # Flow per source
//!
//! 1. The adapter lists candidates lazily, up to the article cap
//! 2. Each candidate is fetched, parsed and checked against the store, one
//!    at a time (the fetcher spaces requests per host)
//! 3. New and changed articles are enriched, up to N concurrently, while
//!    the next candidates are being fetched
//! 4. Results are upserted in listing order
//!
//! A source gets its own wall-clock budget, capped by the run deadline.
//! When the budget ends, in-flight fetches and LLM calls are dropped; an
//! article that already reached the upsert step is still written.
//! Failures never cross source boundaries: a listing error, or even a
//! panicking adapter, only marks that source `done_failed`.

use crate::dedup::{self, Decision, UrlClaims};
use crate::enrich::Enricher;
use crate::error::{ArticleError, EnrichmentError, SourceError};
use crate::fetcher::{Accept, Fetch};
use crate::models::{Article, CandidateRef, SourceId};
use crate::scrapers::SourceAdapter;
use crate::sink::{self, ArticleStore, UpsertOutcome};
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use futures::FutureExt;
use serde::Serialize;
use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, sleep_until};
use tracing::{Instrument, debug, error, info, info_span, instrument, warn};
use uuid::Uuid;

/// Longest slice of a source budget reserved for writing what is left
/// once enrichment has to stop.
const FLUSH_GRACE: Duration = Duration::from_secs(5);

/// Terminal (and transient) states of one source within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceState {
    Pending,
    Running,
    DoneOk,
    DoneEmpty,
    DoneFailed,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Counters {
    pub inserted: usize,
    pub updated: usize,
    pub skipped: usize,
    /// Articles that never reached an upsert outcome.
    pub failed: usize,
    pub parse_error: usize,
    pub fetch_error: usize,
    pub sink_error: usize,
    pub enrichment_failed: usize,
    /// Stored without enrichment because it was disabled or out of time.
    pub enrichment_skipped: usize,
}

impl Counters {
    fn add(&mut self, other: &Counters) {
        self.inserted += other.inserted;
        self.updated += other.updated;
        self.skipped += other.skipped;
        self.failed += other.failed;
        self.parse_error += other.parse_error;
        self.fetch_error += other.fetch_error;
        self.sink_error += other.sink_error;
        self.enrichment_failed += other.enrichment_failed;
        self.enrichment_skipped += other.enrichment_skipped;
    }

    /// Articles that reached an upsert outcome.
    pub fn upserts(&self) -> usize {
        self.inserted + self.updated + self.skipped
    }

    fn record_outcome(&mut self, outcome: UpsertOutcome) {
        match outcome {
            UpsertOutcome::Inserted => self.inserted += 1,
            UpsertOutcome::Updated => self.updated += 1,
            UpsertOutcome::Skipped => self.skipped += 1,
        }
    }

    fn record_failure(&mut self, e: &ArticleError) {
        self.failed += 1;
        match e {
            ArticleError::Fetch(_) => self.fetch_error += 1,
            ArticleError::Parse(_) => self.parse_error += 1,
            ArticleError::Sink(_) => self.sink_error += 1,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SourceReport {
    pub state: SourceState,
    #[serde(flatten)]
    pub counters: Counters,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub timed_out: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SourceReport {
    fn new() -> Self {
        Self {
            state: SourceState::Pending,
            counters: Counters::default(),
            timed_out: false,
            error: None,
        }
    }

    fn failed(error: &SourceError) -> Self {
        Self {
            state: SourceState::DoneFailed,
            error: Some(error.to_string()),
            ..Self::new()
        }
    }

    /// Settle the terminal state from the counters.
    fn finish(&mut self) {
        if self.state == SourceState::DoneFailed {
            return;
        }
        self.state = if self.counters.upserts() > 0 {
            SourceState::DoneOk
        } else if self.counters.failed > 0 {
            SourceState::DoneFailed
        } else {
            SourceState::DoneEmpty
        };
    }
}

/// The structured summary written to stdout at the end of a run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub duration_s: f64,
    pub dry_run: bool,
    pub timed_out: bool,
    pub per_source: BTreeMap<SourceId, SourceReport>,
    pub total: Counters,
}

impl RunReport {
    /// 0 when at least one source finished `done_ok`, 1 otherwise.
    pub fn exit_code(&self) -> i32 {
        let any_ok = self
            .per_source
            .values()
            .any(|r| r.state == SourceState::DoneOk);
        if any_ok { 0 } else { 1 }
    }
}

/// Knobs of one run.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub max_articles: usize,
    pub dry_run: bool,
    pub source_concurrency: usize,
    /// Articles of one source being enriched at once.
    pub enrich_concurrency: usize,
    pub source_budget: Duration,
}

/// Everything a run shares between its sources.
pub struct RunContext {
    pub fetcher: Arc<dyn Fetch>,
    pub store: Arc<dyn ArticleStore>,
    /// `None` when enrichment is disabled.
    pub enricher: Option<Arc<Enricher>>,
    pub claims: UrlClaims,
    pub options: RunOptions,
    pub deadline: Instant,
}

impl RunContext {
    pub fn new(
        fetcher: Arc<dyn Fetch>,
        store: Arc<dyn ArticleStore>,
        enricher: Option<Arc<Enricher>>,
        options: RunOptions,
        run_deadline: Duration,
    ) -> Self {
        Self {
            fetcher,
            store,
            enricher,
            claims: UrlClaims::default(),
            options,
            deadline: Instant::now() + run_deadline,
        }
    }
}

/// How enrichment went for one article.
enum Enriched {
    Done,
    Failed(EnrichmentError),
    Skipped,
}

/// A candidate after fetch, parse and the dedup lookup.
enum Prepared {
    ListingFailed(SourceError),
    AlreadyClaimed,
    Failed(ArticleError),
    Unchanged,
    Changed(Box<Article>, Decision),
}

/// A prepared candidate after the enrichment step.
enum Ready {
    ListingFailed(SourceError),
    AlreadyClaimed,
    Failed(ArticleError),
    Unchanged,
    Write(Box<Article>, Decision, Enriched),
}

#[instrument(level = "debug", skip_all)]
async fn prepare(
    ctx: &RunContext,
    adapter: &dyn SourceAdapter,
    item: Result<CandidateRef, SourceError>,
) -> Prepared {
    let candidate = match item {
        Ok(c) => c,
        Err(e) => return Prepared::ListingFailed(e),
    };
    if !ctx.claims.claim(&candidate.url) {
        debug!(url = %candidate.url, "URL already taken by an earlier source");
        return Prepared::AlreadyClaimed;
    }

    let page = match ctx.fetcher.fetch(&candidate.url, Accept::Html).await {
        Ok(page) => page,
        Err(e) => return Prepared::Failed(e.into()),
    };
    let fetched_at = Utc::now();

    let article = match adapter.parse_detail(&candidate, &page.body, fetched_at) {
        Ok(a) => a,
        Err(e) => return Prepared::Failed(e.into()),
    };

    match dedup::check(ctx.store.as_ref(), &article).await {
        Ok(decision) if !decision.needs_write() => Prepared::Unchanged,
        Ok(decision) => Prepared::Changed(Box::new(article), decision),
        Err(e) => Prepared::Failed(e.into()),
    }
}

async fn enrich_step(ctx: &RunContext, prepared: Prepared, enrich_deadline: Instant) -> Ready {
    match prepared {
        Prepared::ListingFailed(e) => Ready::ListingFailed(e),
        Prepared::AlreadyClaimed => Ready::AlreadyClaimed,
        Prepared::Failed(e) => Ready::Failed(e),
        Prepared::Unchanged => Ready::Unchanged,
        Prepared::Changed(mut article, decision) => {
            let status = match &ctx.enricher {
                None => Enriched::Skipped,
                Some(enricher) => match enricher.enrich(&article, Some(enrich_deadline)).await {
                    Ok(enrichment) => {
                        article.enrichment = Some(enrichment);
                        Enriched::Done
                    }
                    Err(EnrichmentError::BudgetExhausted) => Enriched::Skipped,
                    Err(e) => Enriched::Failed(e),
                },
            };
            Ready::Write(article, decision, status)
        }
    }
}

/// Process one source to completion (or to the end of its budget).
async fn process_source(ctx: &RunContext, adapter: &dyn SourceAdapter, budget_end: Instant) -> SourceReport {
    let source_id = adapter.id();
    let mut report = SourceReport::new();
    report.state = SourceState::Running;

    let grace = FLUSH_GRACE.min(ctx.options.source_budget / 4);
    let enrich_deadline = budget_end.checked_sub(grace).unwrap_or(budget_end);
    let enrich_slots = ctx.options.enrich_concurrency.max(1);

    let mut steps = Box::pin(
        adapter
            .list_candidates(ctx.fetcher.as_ref(), ctx.options.max_articles)
            .then(|item| prepare(ctx, adapter, item))
            .map(|prepared| enrich_step(ctx, prepared, enrich_deadline))
            .buffered(enrich_slots)
            .take_until(sleep_until(budget_end)),
    );

    while let Some(step) = steps.next().await {
        match step {
            Ready::ListingFailed(e) => {
                warn!(metric = "listing_failed", source_id = %source_id, error = %e, "Could not list candidates");
                return SourceReport::failed(&e);
            }
            Ready::AlreadyClaimed => {}
            Ready::Failed(e) => {
                let metric = match &e {
                    ArticleError::Fetch(_) => "fetch_error",
                    ArticleError::Parse(_) => "parse_error",
                    ArticleError::Sink(_) => "sink_error",
                };
                warn!(metric, source_id = %source_id, error = %e, "Article skipped");
                report.counters.record_failure(&e);
            }
            Ready::Unchanged => report.counters.skipped += 1,
            Ready::Write(article, decision, enriched) => {
                match enriched {
                    Enriched::Done => {}
                    Enriched::Skipped => report.counters.enrichment_skipped += 1,
                    Enriched::Failed(e) => {
                        warn!(
                            metric = "enrichment_failed",
                            source_id = %source_id,
                            url = %article.origin_url,
                            error = %e,
                            "Storing article without enrichment"
                        );
                        report.counters.enrichment_failed += 1;
                    }
                }

                if ctx.options.dry_run {
                    let outcome = match decision {
                        Decision::Update { .. } => UpsertOutcome::Updated,
                        _ => UpsertOutcome::Inserted,
                    };
                    info!(url = %article.origin_url, ?outcome, "Dry run; not writing");
                    report.counters.record_outcome(outcome);
                    continue;
                }

                match sink::upsert(ctx.store.as_ref(), &article, &decision).await {
                    Ok(outcome) => {
                        debug!(url = %article.origin_url, ?outcome, "Upserted");
                        report.counters.record_outcome(outcome);
                    }
                    Err(e) => {
                        let e = ArticleError::from(e);
                        warn!(metric = "sink_error", source_id = %source_id, url = %article.origin_url, error = %e, "Write failed");
                        report.counters.record_failure(&e);
                    }
                }
            }
        }
    }

    if steps.is_stopped() {
        warn!(metric = "timeout", source_id = %source_id, "Source budget exhausted");
        report.timed_out = true;
    }
    report
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

/// Run one source with its budget and panic containment.
async fn run_source(ctx: &RunContext, adapter: &dyn SourceAdapter) -> SourceReport {
    let source_id = adapter.id();
    let now = Instant::now();
    if now >= ctx.deadline {
        let e = SourceError::NotStarted;
        warn!(metric = "timeout", source_id = %source_id, "{e}");
        let mut report = SourceReport::failed(&e);
        report.timed_out = true;
        return report;
    }
    let budget_end = (now + ctx.options.source_budget).min(ctx.deadline);

    info!(source_id = %source_id, name = adapter.display_name(), "Source started");
    let t0 = Instant::now();
    let mut report = match AssertUnwindSafe(process_source(ctx, adapter, budget_end))
        .catch_unwind()
        .await
    {
        Ok(report) => report,
        Err(payload) => {
            let e = SourceError::Panicked(panic_message(payload.as_ref()));
            error!(source_id = %source_id, error = %e, "Adapter crashed");
            SourceReport::failed(&e)
        }
    };
    report.finish();

    let c = &report.counters;
    info!(
        metric = "source_done",
        source_id = %source_id,
        state = ?report.state,
        inserted = c.inserted,
        updated = c.updated,
        skipped = c.skipped,
        failed = c.failed,
        parse_error = c.parse_error,
        fetch_error = c.fetch_error,
        sink_error = c.sink_error,
        enrichment_failed = c.enrichment_failed,
        elapsed_ms = t0.elapsed().as_millis() as u64,
        "Source finished"
    );
    report
}

/// Run every adapter once and summarize.
///
/// Sources run in the given order, `source_concurrency` at a time.
///
/// # Arguments
///
/// * `ctx` - Shared clients, options and the run deadline
/// * `adapters` - Sources to process, in tie-break order
///
/// # Returns
///
/// The per-source and total counters. A failing source never aborts the
/// run; it shows up as `done_failed` in the report.
pub async fn run(ctx: &RunContext, adapters: &[Box<dyn SourceAdapter>]) -> RunReport {
    let run_id = Uuid::new_v4().to_string();
    let started_at = Utc::now();
    let t0 = Instant::now();
    info!(
        run_id = %run_id,
        sources = adapters.len(),
        dry_run = ctx.options.dry_run,
        max_articles = ctx.options.max_articles,
        "Run started"
    );

    let per_source: BTreeMap<SourceId, SourceReport> = stream::iter(adapters)
        .map(|adapter| {
            let span = info_span!("source", source_id = %adapter.id());
            async move { (adapter.id(), run_source(ctx, adapter.as_ref()).await) }.instrument(span)
        })
        .buffer_unordered(ctx.options.source_concurrency.max(1))
        .collect()
        .await;

    let mut total = Counters::default();
    for report in per_source.values() {
        total.add(&report.counters);
    }
    let timed_out = per_source.values().any(|r| r.timed_out);
    let duration_s = (t0.elapsed().as_secs_f64() * 1000.0).round() / 1000.0;

    info!(
        metric = "run_total",
        run_id = %run_id,
        inserted = total.inserted,
        updated = total.updated,
        skipped = total.skipped,
        failed = total.failed,
        timed_out,
        duration_s,
        "Run finished"
    );

    RunReport {
        run_id,
        started_at,
        duration_s,
        dry_run: ctx.options.dry_run,
        timed_out,
        per_source,
        total,
    }
}
