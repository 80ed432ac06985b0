//! Content fingerprints and the insert / update / skip decision.
//!
//! The store is the only authority on whether an article exists. The
//! in-run [`UrlClaims`] set just keeps two sources from processing the same
//! URL in one run; it never persists.

use crate::error::SinkError;
use crate::models::{Article, ArticleRecord};
use crate::sink::ArticleStore;
use crate::utils::first_chars;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::sync::Mutex;

/// Number of body characters folded into the fingerprint.
pub const FINGERPRINT_BODY_CHARS: usize = 200;

/// `hex(sha256(lower(trim(title)) | first 200 chars of body | url))`.
pub fn fingerprint(title: &str, body: &str, origin_url: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(title.trim().to_lowercase().as_bytes());
    hasher.update(b"|");
    hasher.update(first_chars(body, FINGERPRINT_BODY_CHARS).as_bytes());
    hasher.update(b"|");
    hasher.update(origin_url.as_bytes());
    hex::encode(hasher.finalize())
}

/// What to do with a freshly parsed article.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// The URL is unknown to the store.
    Insert,
    /// Known URL, different content.
    Update { previous: ArticleRecord },
    /// Known URL, same fingerprint.
    Skip,
}

impl Decision {
    pub fn needs_write(&self) -> bool {
        !matches!(self, Decision::Skip)
    }
}

pub fn decide(existing: Option<ArticleRecord>, fingerprint: &str) -> Decision {
    match existing {
        None => Decision::Insert,
        Some(previous) if previous.fingerprint == fingerprint => Decision::Skip,
        Some(previous) => Decision::Update { previous },
    }
}

/// Look the article up by `origin_url` and decide.
///
/// # Arguments
///
/// * `store` - The store holding previously ingested records
/// * `article` - The freshly parsed article, with its fingerprint set
///
/// # Returns
///
/// `Insert` for an unknown URL, `Skip` when the stored fingerprint matches,
/// otherwise `Update` carrying the stored record.
pub async fn check(store: &dyn ArticleStore, article: &Article) -> Result<Decision, SinkError> {
    let existing = store.lookup(&article.origin_url).await?;
    Ok(decide(existing, &article.fingerprint))
}

/// URLs already taken by a source in the current run.
#[derive(Debug, Default)]
pub struct UrlClaims {
    seen: Mutex<HashSet<String>>,
}

impl UrlClaims {
    /// `true` the first time a URL is claimed, `false` afterwards.
    pub fn claim(&self, url: &str) -> bool {
        let mut seen = self.seen.lock().unwrap_or_else(|e| e.into_inner());
        seen.insert(url.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SourceId;
    use chrono::{TimeZone, Utc};

    fn record(fingerprint: &str) -> ArticleRecord {
        let at = Utc.with_ymd_and_hms(2025, 7, 31, 0, 0, 0).unwrap();
        ArticleRecord {
            origin_url: "https://www.sii.cl/noticias/2025/310725noti01pcr.htm".to_string(),
            title: "Nuevo régimen simplificado".to_string(),
            body: "cuerpo".to_string(),
            source_id: SourceId::Sii,
            source_display_name: None,
            published_at: at,
            fetched_at: at,
            fingerprint: fingerprint.to_string(),
            executive_summary: None,
            keywords: None,
            date_inferred: false,
        }
    }

    #[test]
    fn test_fingerprint_matches_definition() {
        let body = "é".repeat(300);
        let fp = fingerprint("  Nuevo Régimen ", &body, "https://x.cl/a");
        let mut h = Sha256::new();
        h.update(format!("nuevo régimen|{}|https://x.cl/a", "é".repeat(200)).as_bytes());
        assert_eq!(fp, hex::encode(h.finalize()));
        assert_eq!(fp.len(), 64);
    }

    #[test]
    fn test_fingerprint_ignores_body_after_200_chars() {
        let a = format!("{}{}", "a".repeat(200), "tail one");
        let b = format!("{}{}", "a".repeat(200), "tail two");
        assert_eq!(fingerprint("t", &a, "u"), fingerprint("t", &b, "u"));
        assert_ne!(fingerprint("t", &a, "u"), fingerprint("t", &a, "v"));
    }

    #[test]
    fn test_decide() {
        assert_eq!(decide(None, "abc"), Decision::Insert);
        assert_eq!(decide(Some(record("abc")), "abc"), Decision::Skip);
        match decide(Some(record("old")), "new") {
            Decision::Update { previous } => assert_eq!(previous.fingerprint, "old"),
            other => panic!("unexpected {other:?}"),
        }
        assert!(!Decision::Skip.needs_write());
        assert!(Decision::Insert.needs_write());
    }

    #[test]
    fn test_url_claims_first_wins() {
        let claims = UrlClaims::default();
        assert!(claims.claim("https://tribunalambiental.cl/a"));
        assert!(!claims.claim("https://tribunalambiental.cl/a"));
        assert!(claims.claim("https://tribunalambiental.cl/b"));
    }
}
