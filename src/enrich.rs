//! Executive summaries and keywords from the LLM.
//!
//! [`Enricher`] owns the run-wide throttles: a semaphore bounding concurrent
//! calls and a sliding one-minute window matching the provider's rate
//! limit. Calls still queued when the caller's deadline passes fail with
//! [`EnrichmentError::BudgetExhausted`] so the article can be stored
//! unenriched.

use crate::api::ChatBackend;
use crate::error::EnrichmentError;
use crate::models::{Article, Enrichment};
use crate::utils::{collapse_whitespace, first_chars, looks_truncated, strip_code_fence, truncate_for_log};
use itertools::Itertools;
use serde::Deserialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::{Instant, sleep, timeout_at};
use tracing::{debug, instrument, warn};

/// Body characters included in the prompt.
pub const PROMPT_BODY_CHARS: usize = 3000;
pub const MAX_KEYWORDS: usize = 8;

const SYSTEM_PROMPT: &str = "Eres un analista de noticias jurídicas chilenas. \
Para la noticia que recibes, redacta un resumen ejecutivo de un solo párrafo \
(entre 40 y 120 palabras) y entre 3 y 8 palabras clave breves (sustantivos o \
frases nominales). Responde únicamente con un objeto JSON de la forma \
{\"summary\": \"...\", \"keywords\": [\"...\"]}, sin texto adicional.";

/// The user message: title plus the head of the body.
pub fn build_prompt(article: &Article) -> String {
    format!(
        "Título: {}\n\nTexto:\n{}",
        article.title,
        first_chars(&article.body, PROMPT_BODY_CHARS)
    )
}

#[derive(Debug, Deserialize)]
struct RawEnrichment {
    #[serde(default, alias = "executive_summary", alias = "resumen")]
    summary: String,
    #[serde(default, alias = "palabras_clave")]
    keywords: Vec<String>,
}

/// Parse and normalize a model reply.
///
/// Keywords are trimmed, deduplicated case-insensitively and capped at
/// [`MAX_KEYWORDS`]. An empty summary or keyword list is malformed.
pub fn parse_enrichment(raw: &str) -> Result<Enrichment, EnrichmentError> {
    let parsed: RawEnrichment = serde_json::from_str(strip_code_fence(raw)).map_err(|e| {
        let reason = if looks_truncated(&e) {
            format!("truncated JSON: {e}")
        } else {
            e.to_string()
        };
        EnrichmentError::Malformed(reason)
    })?;

    let executive_summary = collapse_whitespace(&parsed.summary);
    if executive_summary.is_empty() {
        return Err(EnrichmentError::Malformed("empty summary".to_string()));
    }

    let keywords: Vec<String> = parsed
        .keywords
        .iter()
        .map(|k| collapse_whitespace(k))
        .filter(|k| !k.is_empty())
        .unique_by(|k| k.to_lowercase())
        .take(MAX_KEYWORDS)
        .collect();
    if keywords.is_empty() {
        return Err(EnrichmentError::Malformed("no keywords".to_string()));
    }

    Ok(Enrichment {
        executive_summary,
        keywords,
    })
}

/// Sliding-window request cap.
#[derive(Debug)]
pub struct RateLimiter {
    capacity: usize,
    window: Duration,
    sent: Mutex<VecDeque<Instant>>,
}

impl RateLimiter {
    pub fn new(capacity: usize, window: Duration) -> Self {
        Self {
            capacity: capacity.max(1),
            window,
            sent: Mutex::new(VecDeque::new()),
        }
    }

    pub fn per_minute(requests: u32) -> Self {
        Self::new(requests as usize, Duration::from_secs(60))
    }

    /// Wait for a free slot in the window and take it.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut sent = self.sent.lock().await;
                let now = Instant::now();
                while sent.front().is_some_and(|t| now.duration_since(*t) >= self.window) {
                    sent.pop_front();
                }
                if sent.len() < self.capacity {
                    sent.push_back(now);
                    return;
                }
                match sent.front() {
                    Some(oldest) => (*oldest + self.window).saturating_duration_since(now),
                    None => Duration::ZERO,
                }
            };
            debug!(wait_ms = wait.as_millis() as u64, "LLM rate limit reached; queuing");
            sleep(wait).await;
        }
    }
}

/// Run-wide LLM front end.
pub struct Enricher {
    backend: Arc<dyn ChatBackend>,
    permits: Semaphore,
    limiter: RateLimiter,
}

impl Enricher {
    pub fn new(backend: Arc<dyn ChatBackend>, concurrency: usize, requests_per_minute: u32) -> Self {
        Self {
            backend,
            permits: Semaphore::new(concurrency.max(1)),
            limiter: RateLimiter::per_minute(requests_per_minute),
        }
    }

    /// Ask the model for a summary and keywords.
    ///
    /// # Arguments
    ///
    /// * `article` - The article to summarize; only its title and the head
    ///   of its body are sent
    /// * `deadline` - When set, waiting for a slot or a reply stops here
    ///
    /// # Returns
    ///
    /// The normalized enrichment, [`EnrichmentError::BudgetExhausted`] once
    /// the deadline passes, or the transport or format error of the call.
    #[instrument(level = "debug", skip_all, fields(url = %article.origin_url))]
    pub async fn enrich(
        &self,
        article: &Article,
        deadline: Option<Instant>,
    ) -> Result<Enrichment, EnrichmentError> {
        match deadline {
            Some(deadline) if Instant::now() >= deadline => Err(EnrichmentError::BudgetExhausted),
            Some(deadline) => timeout_at(deadline, self.ask(article))
                .await
                .unwrap_or(Err(EnrichmentError::BudgetExhausted)),
            None => self.ask(article).await,
        }
    }

    async fn ask(&self, article: &Article) -> Result<Enrichment, EnrichmentError> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| EnrichmentError::BudgetExhausted)?;
        let prompt = build_prompt(article);

        // A malformed reply gets exactly one re-ask.
        let mut reasked = false;
        loop {
            self.limiter.acquire().await;
            let reply = self.backend.complete(SYSTEM_PROMPT, &prompt).await?;
            match parse_enrichment(&reply) {
                Ok(enrichment) => return Ok(enrichment),
                Err(e) if !reasked => {
                    warn!(
                        error = %e,
                        reply = %truncate_for_log(&reply, 200),
                        "Malformed LLM reply; asking again"
                    );
                    reasked = true;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::models::SourceId;
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Backend that answers every call with the same result.
    pub(crate) struct FixedChat {
        pub reply: Result<String, EnrichmentError>,
        pub calls: AtomicUsize,
    }

    impl FixedChat {
        pub(crate) fn ok(reply: &str) -> Self {
            Self {
                reply: Ok(reply.to_string()),
                calls: AtomicUsize::new(0),
            }
        }

        pub(crate) fn failing(err: EnrichmentError) -> Self {
            Self {
                reply: Err(err),
                calls: AtomicUsize::new(0),
            }
        }

        pub(crate) fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ChatBackend for FixedChat {
        async fn complete(&self, _system: &str, _user: &str) -> Result<String, EnrichmentError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.reply.clone()
        }
    }

    /// Malformed on the first call, valid afterwards.
    struct FlakyChat {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ChatBackend for FlakyChat {
        async fn complete(&self, _system: &str, _user: &str) -> Result<String, EnrichmentError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                Ok("Lo siento, no puedo".to_string())
            } else {
                Ok(r#"{"summary":"Resumen.","keywords":["tributario","pyme"]}"#.to_string())
            }
        }
    }

    fn article() -> Article {
        Article {
            source_id: SourceId::Sii,
            source_display_name: "SII".to_string(),
            origin_url: "https://www.sii.cl/noticias/2025/310725noti01pcr.htm".to_string(),
            title: "Nuevo régimen simplificado".to_string(),
            body: "ñ".repeat(5000),
            published_at: Utc::now(),
            fetched_at: Utc::now(),
            fingerprint: "fp".to_string(),
            date_inferred: false,
            enrichment: None,
        }
    }

    #[test]
    fn test_prompt_truncates_body() {
        let prompt = build_prompt(&article());
        assert!(prompt.starts_with("Título: Nuevo régimen simplificado\n\nTexto:\n"));
        assert_eq!(prompt.matches('ñ').count(), PROMPT_BODY_CHARS);
    }

    #[test]
    fn test_parse_normalizes_keywords() {
        let raw = "```json\n{\"summary\": \"  Un   resumen. \", \"keywords\": \
                   [\"Tributario\", \"tributario\", \" pyme \", \"\", \"a\", \"b\", \"c\", \"d\", \"e\", \"f\", \"g\"]}\n```";
        let e = parse_enrichment(raw).unwrap();
        assert_eq!(e.executive_summary, "Un resumen.");
        assert_eq!(e.keywords.len(), MAX_KEYWORDS);
        assert_eq!(&e.keywords[..3], ["Tributario", "pyme", "a"]);
    }

    #[test]
    fn test_parse_rejects_incomplete_replies() {
        assert!(matches!(
            parse_enrichment(r#"{"summary": "", "keywords": ["a"]}"#),
            Err(EnrichmentError::Malformed(_))
        ));
        assert!(matches!(
            parse_enrichment(r#"{"summary": "ok", "keywords": []}"#),
            Err(EnrichmentError::Malformed(_))
        ));
        match parse_enrichment(r#"{"summary": "ok", "keyw"#) {
            Err(EnrichmentError::Malformed(reason)) => assert!(reason.starts_with("truncated")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_malformed_reply_is_asked_once_more() {
        let backend = Arc::new(FlakyChat {
            calls: AtomicUsize::new(0),
        });
        let enricher = Enricher::new(backend.clone(), 2, 600);
        let e = enricher.enrich(&article(), None).await.unwrap();
        assert_eq!(e.keywords, vec!["tributario", "pyme"]);
        assert_eq!(backend.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_second_malformed_reply_fails() {
        let backend = Arc::new(FixedChat::ok("no es json"));
        let enricher = Enricher::new(backend.clone(), 2, 600);
        let err = enricher.enrich(&article(), None).await.unwrap_err();
        assert!(matches!(err, EnrichmentError::Malformed(_)));
        assert_eq!(backend.calls(), 2);
    }

    #[tokio::test]
    async fn test_api_errors_are_not_reasked() {
        let backend = Arc::new(FixedChat::failing(EnrichmentError::Api { status: 500 }));
        let enricher = Enricher::new(backend.clone(), 2, 600);
        assert!(matches!(
            enricher.enrich(&article(), None).await,
            Err(EnrichmentError::Api { status: 500 })
        ));
        assert_eq!(backend.calls(), 1);
    }

    #[tokio::test]
    async fn test_expired_deadline_exhausts_budget() {
        let backend = Arc::new(FixedChat::ok(r#"{"summary":"s","keywords":["k"]}"#));
        let enricher = Enricher::new(backend.clone(), 1, 600);
        let past = Instant::now() - Duration::from_millis(1);
        assert!(matches!(
            enricher.enrich(&article(), Some(past)).await,
            Err(EnrichmentError::BudgetExhausted)
        ));
        assert_eq!(backend.calls(), 0);
    }

    #[tokio::test]
    async fn test_rate_limiter_queues_past_capacity() {
        let limiter = RateLimiter::new(2, Duration::from_millis(60));
        let t0 = Instant::now();
        limiter.acquire().await;
        limiter.acquire().await;
        assert!(t0.elapsed() < Duration::from_millis(50));
        limiter.acquire().await;
        assert!(t0.elapsed() >= Duration::from_millis(60));
    }
}
