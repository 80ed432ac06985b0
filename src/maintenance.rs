//! Operations over records already in the store.
//!
//! All of them walk the table in `origin_url` order, page by page, and can
//! be run repeatedly: a second pass finds nothing left to do.

use crate::dedup::fingerprint;
use crate::enrich::Enricher;
use crate::error::{ConfigError, MaintenanceError, ParseError};
use crate::models::{Article, ArticleRecord, SourceId};
use crate::sanitize::{DENYLIST_VERSION, sanitize_title};
use crate::scrapers::ConfiguredAdapter;
use crate::sink::{ArticleStore, PageQuery, RecordPatch};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::collections::HashMap;
use tracing::{debug, info, warn};

/// Records fetched per request.
pub const PAGE_SIZE: usize = 100;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RescanReport {
    pub denylist_version: u32,
    pub dry_run: bool,
    pub scanned: usize,
    pub changed: usize,
    pub unchanged: usize,
    /// Left alone because the cleaned body would be too short.
    pub too_short: usize,
    /// Records of sources missing from the catalogue.
    pub unknown_source: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReenrichReport {
    pub scanned: usize,
    pub enriched: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PurgeReport {
    pub source: SourceId,
    pub deleted: usize,
}

/// Fetch the page after `query.after` and move the cursor past it.
/// `None` once the table is exhausted.
async fn next_page(
    store: &dyn ArticleStore,
    query: &mut PageQuery,
) -> Result<Option<Vec<ArticleRecord>>, MaintenanceError> {
    if query.limit == 0 {
        return Ok(None);
    }
    let page = store.page(query).await?;
    let Some(last) = page.last() else {
        return Ok(None);
    };
    query.after = Some(last.origin_url.clone());
    Ok(Some(page))
}

/// What a record looks like after the current sanitizer.
fn rescanned(
    adapter: &ConfiguredAdapter,
    record: &ArticleRecord,
) -> Result<Option<RecordPatch>, ParseError> {
    let prefix = adapter.config().title_prefix.as_deref();
    let title = sanitize_title(&record.title, prefix).unwrap_or_else(|_| record.title.clone());
    let body = adapter.sanitizer().sanitize_body(&record.body)?;
    if title == record.title && body == record.body {
        return Ok(None);
    }

    let fingerprint = fingerprint(&title, &body, &record.origin_url);
    Ok(Some(RecordPatch {
        title: (title != record.title).then_some(title),
        body: (body != record.body).then_some(body),
        fingerprint: Some(fingerprint),
        ..RecordPatch::default()
    }))
}

/// Re-apply the current title and body sanitizers to stored records.
///
/// Rewritten records get a fresh fingerprint so it keeps matching the
/// stored content.
pub async fn rescan_boilerplate(
    store: &dyn ArticleStore,
    adapters: &[ConfiguredAdapter],
    source: Option<SourceId>,
    dry_run: bool,
) -> Result<RescanReport, MaintenanceError> {
    let by_id: HashMap<SourceId, &ConfiguredAdapter> =
        adapters.iter().map(|a| (a.config().id, a)).collect();
    let mut report = RescanReport {
        denylist_version: DENYLIST_VERSION,
        dry_run,
        ..RescanReport::default()
    };
    info!(denylist_version = DENYLIST_VERSION, dry_run, ?source, "Rescanning stored records");

    let mut query = PageQuery {
        limit: PAGE_SIZE,
        source,
        ..PageQuery::default()
    };
    while let Some(page) = next_page(store, &mut query).await? {
        let last_page = page.len() < PAGE_SIZE;
        for record in page {
            report.scanned += 1;
            let Some(adapter) = by_id.get(&record.source_id) else {
                report.unknown_source += 1;
                continue;
            };
            let patch = match rescanned(adapter, &record) {
                Ok(Some(patch)) => patch,
                Ok(None) => {
                    report.unchanged += 1;
                    continue;
                }
                Err(e) => {
                    debug!(url = %record.origin_url, error = %e, "Leaving record untouched");
                    report.too_short += 1;
                    continue;
                }
            };
            if dry_run {
                info!(url = %record.origin_url, "Would rewrite");
                report.changed += 1;
                continue;
            }
            match store.patch(&record.origin_url, &patch).await {
                Ok(()) => report.changed += 1,
                Err(e) => {
                    warn!(url = %record.origin_url, error = %e, "Rescan write failed");
                    report.failed += 1;
                }
            }
        }
        if last_page {
            break;
        }
    }

    info!(
        scanned = report.scanned,
        changed = report.changed,
        too_short = report.too_short,
        failed = report.failed,
        "Rescan finished"
    );
    Ok(report)
}

/// Generate summaries and keywords for stored records.
///
/// With `missing_only`, records that already have a summary are skipped.
/// `limit` caps how many records are sent to the model.
pub async fn reenrich(
    store: &dyn ArticleStore,
    enricher: &Enricher,
    concurrency: usize,
    missing_only: bool,
    source: Option<SourceId>,
    limit: Option<usize>,
) -> Result<ReenrichReport, MaintenanceError> {
    let mut report = ReenrichReport::default();
    let limit = limit.unwrap_or(usize::MAX);
    info!(missing_only, ?source, limit, "Re-enriching stored records");

    let mut query = PageQuery {
        limit: PAGE_SIZE,
        source,
        missing_summary: missing_only,
        ..PageQuery::default()
    };
    while report.scanned < limit {
        let Some(page) = next_page(store, &mut query).await? else {
            break;
        };
        let last_page = page.len() < PAGE_SIZE;
        let room = limit - report.scanned;
        let batch: Vec<ArticleRecord> = page.into_iter().take(room).collect();
        report.scanned += batch.len();

        let results: Vec<bool> = stream::iter(batch)
            .map(|record| async move {
                let article = Article::from(record);
                let enrichment = match enricher.enrich(&article, None).await {
                    Ok(e) => e,
                    Err(e) => {
                        warn!(metric = "enrichment_failed", url = %article.origin_url, error = %e, "Re-enrichment failed");
                        return false;
                    }
                };
                let patch = RecordPatch {
                    executive_summary: Some(enrichment.executive_summary),
                    keywords: Some(enrichment.keywords),
                    ..RecordPatch::default()
                };
                match store.patch(&article.origin_url, &patch).await {
                    Ok(()) => true,
                    Err(e) => {
                        warn!(url = %article.origin_url, error = %e, "Re-enrichment write failed");
                        false
                    }
                }
            })
            .buffered(concurrency.max(1))
            .collect()
            .await;

        let enriched = results.iter().filter(|ok| **ok).count();
        report.enriched += enriched;
        report.failed += results.len() - enriched;
        if last_page {
            break;
        }
    }

    info!(
        scanned = report.scanned,
        enriched = report.enriched,
        failed = report.failed,
        "Re-enrichment finished"
    );
    Ok(report)
}

/// Delete every record of `source`. `confirm` must repeat the source id.
pub async fn purge_source(
    store: &dyn ArticleStore,
    source: SourceId,
    confirm: &str,
) -> Result<PurgeReport, MaintenanceError> {
    if confirm.trim() != source.as_str() {
        return Err(ConfigError::Invalid {
            var: "--confirm",
            reason: format!("must repeat the source id `{source}`"),
        }
        .into());
    }
    let deleted = store.delete_by_source(source).await?;
    warn!(source_id = %source, deleted, "Purged source");
    Ok(PurgeReport { source, deleted })
}
