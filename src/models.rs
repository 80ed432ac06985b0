//! Data models for ingested articles and their persisted representation.
//!
//! This module defines the core data structures used throughout the pipeline:
//! - [`SourceId`]: The closed set of upstream institutional sites
//! - [`CandidateRef`]: An article reference discovered on a listing page
//! - [`Article`]: A normalized, in-flight article (optionally enriched)
//! - [`ArticleRecord`]: The row shape exchanged with the sink store
//!
//! The record uses snake_case field names matching the store's column names.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Stable tag identifying one upstream site.
///
/// The set is closed: adding a source means adding a variant here and an
/// entry in the source catalogue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceId {
    PoderJudicial,
    MinisterioJusticia,
    Contraloria,
    Tdpi,
    Cde,
    Tdlc,
    #[serde(rename = "1ta")]
    PrimerTribunalAmbiental,
    #[serde(rename = "3ta")]
    TercerTribunalAmbiental,
    TribunalAmbiental,
    Sii,
    Inapi,
    Dt,
}

impl SourceId {
    pub const ALL: [SourceId; 12] = [
        SourceId::PoderJudicial,
        SourceId::MinisterioJusticia,
        SourceId::Contraloria,
        SourceId::Tdpi,
        SourceId::Cde,
        SourceId::Tdlc,
        SourceId::PrimerTribunalAmbiental,
        SourceId::TercerTribunalAmbiental,
        SourceId::TribunalAmbiental,
        SourceId::Sii,
        SourceId::Inapi,
        SourceId::Dt,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SourceId::PoderJudicial => "poder_judicial",
            SourceId::MinisterioJusticia => "ministerio_justicia",
            SourceId::Contraloria => "contraloria",
            SourceId::Tdpi => "tdpi",
            SourceId::Cde => "cde",
            SourceId::Tdlc => "tdlc",
            SourceId::PrimerTribunalAmbiental => "1ta",
            SourceId::TercerTribunalAmbiental => "3ta",
            SourceId::TribunalAmbiental => "tribunal_ambiental",
            SourceId::Sii => "sii",
            SourceId::Inapi => "inapi",
            SourceId::Dt => "dt",
        }
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_lowercase();
        SourceId::ALL
            .into_iter()
            .find(|id| id.as_str() == wanted)
            .ok_or_else(|| format!("unknown source id `{s}`"))
    }
}

/// An article reference emitted by an adapter's discovery step.
///
/// Nothing has been fetched for the article itself yet; the hints come from
/// the listing page (link text, a date printed next to the link, ...).
#[derive(Debug, Clone, PartialEq)]
pub struct CandidateRef {
    /// Absolute URL of the article page.
    pub url: String,
    /// Title as shown on the listing, if any.
    pub title_hint: Option<String>,
    /// Publication date as shown on the listing, if any.
    pub date_hint: Option<DateTime<Utc>>,
    /// The hint is only an approximation of the publication date, such as
    /// a sitemap `lastmod`.
    pub date_hint_inferred: bool,
}

impl CandidateRef {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            title_hint: None,
            date_hint: None,
            date_hint_inferred: false,
        }
    }
}

/// LLM-derived abstract attached to an article.
///
/// Summary and keywords travel together so a partially enriched article
/// cannot be represented.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Enrichment {
    pub executive_summary: String,
    pub keywords: Vec<String>,
}

/// A normalized article on its way through the pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct Article {
    pub source_id: SourceId,
    pub source_display_name: String,
    pub origin_url: String,
    pub title: String,
    pub body: String,
    pub published_at: DateTime<Utc>,
    pub fetched_at: DateTime<Utc>,
    pub fingerprint: String,
    pub date_inferred: bool,
    pub enrichment: Option<Enrichment>,
}

impl Article {
    pub fn executive_summary(&self) -> Option<&str> {
        self.enrichment
            .as_ref()
            .map(|e| e.executive_summary.as_str())
    }

    /// Keywords, empty when the article was not enriched.
    pub fn keywords(&self) -> &[String] {
        self.enrichment
            .as_ref()
            .map(|e| e.keywords.as_slice())
            .unwrap_or(&[])
    }
}

/// One row of the sink table.
///
/// Unenriched articles are stored with a null `executive_summary` and an
/// empty `keywords` list. Rows written before that convention may still
/// carry null keywords.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArticleRecord {
    pub origin_url: String,
    pub title: String,
    pub body: String,
    pub source_id: SourceId,
    #[serde(default)]
    pub source_display_name: Option<String>,
    pub published_at: DateTime<Utc>,
    pub fetched_at: DateTime<Utc>,
    pub fingerprint: String,
    #[serde(default)]
    pub executive_summary: Option<String>,
    #[serde(default)]
    pub keywords: Option<Vec<String>>,
    #[serde(default)]
    pub date_inferred: bool,
}

impl ArticleRecord {
    /// Enrichment is keyed on the summary; keywords are never null on write.
    pub fn is_enriched(&self) -> bool {
        self.executive_summary.is_some()
    }
}

impl From<&Article> for ArticleRecord {
    fn from(article: &Article) -> Self {
        Self {
            origin_url: article.origin_url.clone(),
            title: article.title.clone(),
            body: article.body.clone(),
            source_id: article.source_id,
            source_display_name: Some(article.source_display_name.clone()),
            published_at: article.published_at,
            fetched_at: article.fetched_at,
            fingerprint: article.fingerprint.clone(),
            executive_summary: article.executive_summary().map(str::to_string),
            keywords: Some(article.keywords().to_vec()),
            date_inferred: article.date_inferred,
        }
    }
}

/// Rebuild an in-flight article from a stored row, e.g. to enrich it again.
impl From<ArticleRecord> for Article {
    fn from(record: ArticleRecord) -> Self {
        let keywords = record.keywords.unwrap_or_default();
        let enrichment = record.executive_summary.map(|executive_summary| Enrichment {
            executive_summary,
            keywords,
        });
        Self {
            source_display_name: record
                .source_display_name
                .unwrap_or_else(|| record.source_id.to_string()),
            source_id: record.source_id,
            origin_url: record.origin_url,
            title: record.title,
            body: record.body,
            published_at: record.published_at,
            fetched_at: record.fetched_at,
            fingerprint: record.fingerprint,
            date_inferred: record.date_inferred,
            enrichment,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample_article() -> Article {
        let at = Utc.with_ymd_and_hms(2025, 7, 31, 0, 0, 0).unwrap();
        Article {
            source_id: SourceId::Sii,
            source_display_name: "Servicio de Impuestos Internos".to_string(),
            origin_url: "https://www.sii.cl/noticias/2025/310725noti01pcr.htm".to_string(),
            title: "Nuevo régimen simplificado".to_string(),
            body: "x".repeat(300),
            published_at: at,
            fetched_at: at,
            fingerprint: "abc".to_string(),
            date_inferred: false,
            enrichment: None,
        }
    }

    #[test]
    fn test_source_id_round_trips_through_str() {
        for id in SourceId::ALL {
            assert_eq!(id.as_str().parse::<SourceId>().unwrap(), id);
        }
        assert!("dpp".parse::<SourceId>().is_err());
    }

    #[test]
    fn test_source_id_serde_matches_as_str() {
        let json = serde_json::to_string(&SourceId::PrimerTribunalAmbiental).unwrap();
        assert_eq!(json, "\"1ta\"");
        let json = serde_json::to_string(&SourceId::PoderJudicial).unwrap();
        assert_eq!(json, "\"poder_judicial\"");
        let back: SourceId = serde_json::from_str("\"3ta\"").unwrap();
        assert_eq!(back, SourceId::TercerTribunalAmbiental);
    }

    #[test]
    fn test_unenriched_record_has_null_summary_and_empty_keywords() {
        let record = ArticleRecord::from(&sample_article());
        assert!(record.executive_summary.is_none());
        assert_eq!(record.keywords, Some(vec![]));
        assert!(!record.is_enriched());

        let json = serde_json::to_value(&record).unwrap();
        assert!(json["executive_summary"].is_null());
        assert_eq!(json["keywords"], serde_json::json!([]));
        assert_eq!(json["source_id"], "sii");
    }

    #[test]
    fn test_unenriched_record_survives_round_trip_through_article() {
        let record = ArticleRecord::from(&sample_article());
        let again = ArticleRecord::from(&Article::from(record.clone()));
        assert_eq!(again, record);
        let json = serde_json::to_value(&again).unwrap();
        assert_eq!(json["keywords"], serde_json::json!([]));

        // Legacy rows with null keywords are read as empty.
        let mut legacy = record;
        legacy.keywords = None;
        assert!(Article::from(legacy).keywords().is_empty());
    }

    #[test]
    fn test_enriched_record_carries_both_fields() {
        let mut article = sample_article();
        article.enrichment = Some(Enrichment {
            executive_summary: "Resumen".to_string(),
            keywords: vec!["tributario".to_string(), "pyme".to_string()],
        });
        assert_eq!(article.keywords().len(), 2);
        let record = ArticleRecord::from(&article);
        assert!(record.is_enriched());
        assert_eq!(record.keywords.unwrap(), vec!["tributario", "pyme"]);
    }

    #[test]
    fn test_record_converts_back_to_article() {
        let mut record = ArticleRecord::from(&sample_article());
        assert!(Article::from(record.clone()).enrichment.is_none());

        record.executive_summary = Some("Resumen".to_string());
        record.keywords = Some(vec!["pyme".to_string()]);
        let article = Article::from(record);
        assert_eq!(article.keywords(), ["pyme".to_string()]);
        assert_eq!(article.source_display_name, "Servicio de Impuestos Internos");
    }

    #[test]
    fn test_keywords_empty_without_enrichment() {
        let article = sample_article();
        assert!(article.keywords().is_empty());
        assert!(article.executive_summary().is_none());
    }
}
