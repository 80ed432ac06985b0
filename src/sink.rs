//! Persistence of article records.
//!
//! The store is a PostgREST-style REST endpoint (Supabase in production)
//! holding one row per `origin_url`. Every write is a conditional upsert
//! with `origin_url` as the conflict target, so a record written by a
//! concurrent run is never duplicated.
//!
//! # Protocol
//!
//! - lookup: `GET {table}?origin_url=eq.{url}&select=*&limit=1`
//! - insert: `POST {table}?on_conflict=origin_url` with
//!   `Prefer: resolution=ignore-duplicates,return=representation`; an empty
//!   representation means another writer got there first
//! - update: same endpoint with `Prefer: resolution=merge-duplicates`
//! - maintenance: keyset-paged `GET` (`origin_url=gt.{last}`),
//!   `PATCH ?origin_url=eq.` and `DELETE ?source_id=eq.`

use crate::config::SinkSettings;
use crate::dedup::Decision;
use crate::error::SinkError;
use crate::models::{Article, ArticleRecord, SourceId};
use crate::utils::truncate_for_log;
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tracing::{debug, instrument};

/// Result of one upsert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UpsertOutcome {
    Inserted,
    Updated,
    Skipped,
}

/// Which stored records a maintenance pass walks over.
///
/// Pages are keyed on `origin_url` rather than an offset, so records that
/// drop out of the filter while a pass patches them do not shift the
/// following pages.
#[derive(Debug, Clone, Default)]
pub struct PageQuery {
    /// Only records after this URL.
    pub after: Option<String>,
    pub limit: usize,
    pub source: Option<SourceId>,
    /// Only records without a summary.
    pub missing_summary: bool,
}

/// Partial update of one stored record. `None` fields are left alone.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecordPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub executive_summary: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keywords: Option<Vec<String>>,
}

impl RecordPatch {
    pub fn is_empty(&self) -> bool {
        *self == RecordPatch::default()
    }

    fn apply(&self, record: &mut ArticleRecord) {
        if let Some(title) = &self.title {
            record.title = title.clone();
        }
        if let Some(body) = &self.body {
            record.body = body.clone();
        }
        if let Some(fingerprint) = &self.fingerprint {
            record.fingerprint = fingerprint.clone();
        }
        if let Some(summary) = &self.executive_summary {
            record.executive_summary = Some(summary.clone());
        }
        if let Some(keywords) = &self.keywords {
            record.keywords = Some(keywords.clone());
        }
    }
}

/// The operations the pipeline and the maintenance commands need.
#[async_trait]
pub trait ArticleStore: Send + Sync {
    async fn lookup(&self, origin_url: &str) -> Result<Option<ArticleRecord>, SinkError>;

    /// Insert unless the URL already exists; `Skipped` when it does.
    async fn insert(&self, record: &ArticleRecord) -> Result<UpsertOutcome, SinkError>;

    /// Overwrite the stored row with the same `origin_url`.
    async fn update(&self, record: &ArticleRecord) -> Result<UpsertOutcome, SinkError>;

    /// Records ordered by `origin_url`.
    async fn page(&self, query: &PageQuery) -> Result<Vec<ArticleRecord>, SinkError>;

    async fn patch(&self, origin_url: &str, patch: &RecordPatch) -> Result<(), SinkError>;

    /// Delete every record of `source`, returning how many went.
    async fn delete_by_source(&self, source: SourceId) -> Result<usize, SinkError>;
}

/// The row to write for a revised article: new content, but the original
/// publication date unless that one was inferred.
pub fn revised_record(previous: &ArticleRecord, article: &Article) -> ArticleRecord {
    let mut record = ArticleRecord::from(article);
    if !previous.date_inferred {
        record.published_at = previous.published_at;
        record.date_inferred = false;
    }
    record
}

/// Apply a dedup decision. `Skip` never touches the store.
///
/// # Arguments
///
/// * `store` - Where the record is written
/// * `article` - The parsed, possibly enriched, article
/// * `decision` - The outcome of [`crate::dedup::check`] for this article
///
/// # Returns
///
/// The outcome reported by the store. An insert that loses a race with a
/// concurrent writer comes back as [`UpsertOutcome::Skipped`].
#[instrument(level = "debug", skip_all, fields(url = %article.origin_url))]
pub async fn upsert(
    store: &dyn ArticleStore,
    article: &Article,
    decision: &Decision,
) -> Result<UpsertOutcome, SinkError> {
    match decision {
        Decision::Skip => Ok(UpsertOutcome::Skipped),
        Decision::Insert => store.insert(&ArticleRecord::from(article)).await,
        Decision::Update { previous } => store.update(&revised_record(previous, article)).await,
    }
}

/// [`ArticleStore`] over PostgREST.
#[derive(Clone)]
pub struct PostgrestStore {
    client: Client,
    table_url: String,
    key: String,
}

impl fmt::Debug for PostgrestStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PostgrestStore")
            .field("table_url", &self.table_url)
            .finish()
    }
}

fn eq(value: &str) -> String {
    format!("eq.{}", urlencoding::encode(value))
}

impl PostgrestStore {
    pub fn new(settings: &SinkSettings) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            client,
            table_url: format!("{}/rest/v1/{}", settings.base_url, settings.table),
            key: settings.key.clone(),
        })
    }

    fn request(&self, method: reqwest::Method, query: &str) -> RequestBuilder {
        self.client
            .request(method, format!("{}?{}", self.table_url, query))
            .header("apikey", &self.key)
            .bearer_auth(&self.key)
    }

    async fn send(builder: RequestBuilder) -> Result<Response, SinkError> {
        let response = builder
            .send()
            .await
            .map_err(|e| SinkError::Transport(e.to_string()))?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(SinkError::Api {
            status: status.as_u16(),
            body: truncate_for_log(&body, 300),
        })
    }

    async fn decode<T: DeserializeOwned>(response: Response) -> Result<T, SinkError> {
        let text = response
            .text()
            .await
            .map_err(|e| SinkError::Transport(e.to_string()))?;
        serde_json::from_str(&text).map_err(|e| SinkError::Decode(e.to_string()))
    }

    async fn upsert_row(&self, record: &ArticleRecord, prefer: &str) -> Result<Response, SinkError> {
        let builder = self
            .request(reqwest::Method::POST, "on_conflict=origin_url")
            .header("Prefer", prefer)
            .json(&[record]);
        Self::send(builder).await
    }
}

#[async_trait]
impl ArticleStore for PostgrestStore {
    #[instrument(level = "debug", skip(self))]
    async fn lookup(&self, origin_url: &str) -> Result<Option<ArticleRecord>, SinkError> {
        let query = format!("origin_url={}&select=*&limit=1", eq(origin_url));
        let response = Self::send(self.request(reqwest::Method::GET, &query)).await?;
        let rows: Vec<ArticleRecord> = Self::decode(response).await?;
        Ok(rows.into_iter().next())
    }

    #[instrument(level = "debug", skip_all, fields(url = %record.origin_url))]
    async fn insert(&self, record: &ArticleRecord) -> Result<UpsertOutcome, SinkError> {
        let response = match self
            .upsert_row(record, "resolution=ignore-duplicates,return=representation")
            .await
        {
            Ok(response) => response,
            Err(SinkError::Api { status, .. }) if status == StatusCode::CONFLICT.as_u16() => {
                debug!("Row already present");
                return Ok(UpsertOutcome::Skipped);
            }
            Err(e) => return Err(e),
        };
        let rows: Vec<serde_json::Value> = Self::decode(response).await?;
        Ok(if rows.is_empty() {
            UpsertOutcome::Skipped
        } else {
            UpsertOutcome::Inserted
        })
    }

    #[instrument(level = "debug", skip_all, fields(url = %record.origin_url))]
    async fn update(&self, record: &ArticleRecord) -> Result<UpsertOutcome, SinkError> {
        self.upsert_row(record, "resolution=merge-duplicates,return=minimal")
            .await?;
        Ok(UpsertOutcome::Updated)
    }

    async fn page(&self, query: &PageQuery) -> Result<Vec<ArticleRecord>, SinkError> {
        let mut params = format!("select=*&order=origin_url.asc&limit={}", query.limit);
        if let Some(after) = &query.after {
            params.push_str(&format!("&origin_url=gt.{}", urlencoding::encode(after)));
        }
        if let Some(source) = query.source {
            params.push_str(&format!("&source_id={}", eq(source.as_str())));
        }
        if query.missing_summary {
            params.push_str("&executive_summary=is.null");
        }
        let response = Self::send(self.request(reqwest::Method::GET, &params)).await?;
        Self::decode(response).await
    }

    #[instrument(level = "debug", skip(self, patch))]
    async fn patch(&self, origin_url: &str, patch: &RecordPatch) -> Result<(), SinkError> {
        let query = format!("origin_url={}", eq(origin_url));
        let builder = self
            .request(reqwest::Method::PATCH, &query)
            .header("Prefer", "return=minimal")
            .json(patch);
        Self::send(builder).await?;
        Ok(())
    }

    #[instrument(level = "info", skip(self))]
    async fn delete_by_source(&self, source: SourceId) -> Result<usize, SinkError> {
        let query = format!("source_id={}&select=origin_url", eq(source.as_str()));
        let builder = self
            .request(reqwest::Method::DELETE, &query)
            .header("Prefer", "return=representation");
        let response = Self::send(builder).await?;
        let rows: Vec<serde_json::Value> = Self::decode(response).await?;
        Ok(rows.len())
    }
}

/// In-process store with the same upsert semantics, for tests.
#[cfg(test)]
#[derive(Debug, Default)]
pub(crate) struct MemoryStore {
    rows: std::sync::Mutex<std::collections::BTreeMap<String, ArticleRecord>>,
    writes: std::sync::atomic::AtomicUsize,
    fail_writes: std::sync::atomic::AtomicBool,
}

#[cfg(test)]
impl MemoryStore {
    pub(crate) fn with_records(records: impl IntoIterator<Item = ArticleRecord>) -> Self {
        let store = Self::default();
        {
            let mut rows = store.rows.lock().unwrap();
            for r in records {
                rows.insert(r.origin_url.clone(), r);
            }
        }
        store
    }

    pub(crate) fn get(&self, origin_url: &str) -> Option<ArticleRecord> {
        self.rows.lock().unwrap().get(origin_url).cloned()
    }

    pub(crate) fn all(&self) -> Vec<ArticleRecord> {
        self.rows.lock().unwrap().values().cloned().collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.rows.lock().unwrap().len()
    }

    /// Number of insert/update/patch/delete calls that changed something.
    pub(crate) fn writes(&self) -> usize {
        self.writes.load(std::sync::atomic::Ordering::SeqCst)
    }

    pub(crate) fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, std::sync::atomic::Ordering::SeqCst);
    }

    fn check_writable(&self) -> Result<(), SinkError> {
        if self.fail_writes.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(SinkError::Api {
                status: 400,
                body: "rejected".to_string(),
            });
        }
        self.writes.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
#[async_trait]
impl ArticleStore for MemoryStore {
    async fn lookup(&self, origin_url: &str) -> Result<Option<ArticleRecord>, SinkError> {
        Ok(self.get(origin_url))
    }

    async fn insert(&self, record: &ArticleRecord) -> Result<UpsertOutcome, SinkError> {
        self.check_writable()?;
        let mut rows = self.rows.lock().unwrap();
        if rows.contains_key(&record.origin_url) {
            return Ok(UpsertOutcome::Skipped);
        }
        rows.insert(record.origin_url.clone(), record.clone());
        Ok(UpsertOutcome::Inserted)
    }

    async fn update(&self, record: &ArticleRecord) -> Result<UpsertOutcome, SinkError> {
        self.check_writable()?;
        self.rows
            .lock()
            .unwrap()
            .insert(record.origin_url.clone(), record.clone());
        Ok(UpsertOutcome::Updated)
    }

    async fn page(&self, query: &PageQuery) -> Result<Vec<ArticleRecord>, SinkError> {
        Ok(self
            .rows
            .lock()
            .unwrap()
            .values()
            .filter(|r| query.source.is_none_or(|s| r.source_id == s))
            .filter(|r| query.after.as_ref().is_none_or(|after| r.origin_url > *after))
            .filter(|r| !query.missing_summary || r.executive_summary.is_none())
            .take(query.limit)
            .cloned()
            .collect())
    }

    async fn patch(&self, origin_url: &str, patch: &RecordPatch) -> Result<(), SinkError> {
        self.check_writable()?;
        if let Some(record) = self.rows.lock().unwrap().get_mut(origin_url) {
            patch.apply(record);
        }
        Ok(())
    }

    async fn delete_by_source(&self, source: SourceId) -> Result<usize, SinkError> {
        self.check_writable()?;
        let mut rows = self.rows.lock().unwrap();
        let before = rows.len();
        rows.retain(|_, r| r.source_id != source);
        Ok(before - rows.len())
    }
}
