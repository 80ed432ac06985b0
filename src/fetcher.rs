//! HTTP fetching with retry, timeouts and per-host politeness.
//!
//! Every request made while scraping goes through one [`HttpFetcher`] per
//! run. It owns the only piece of state shared between sources: the
//! per-host schedule in [`HostThrottle`], so that running several sources in
//! parallel still never hits one host faster than the configured floor.
//!
//! # Retry Strategy
//!
//! - 3 attempts, waiting 0 s / 2 s / 5 s before each
//! - ±25% random jitter on every wait
//! - Only transient failures are retried (connection, DNS, timeout, 5xx, 429)

use crate::error::FetchError;
use async_trait::async_trait;
use rand::{Rng, rng};
use reqwest::header::{ACCEPT, ACCEPT_LANGUAGE, CONTENT_TYPE};
use reqwest::{Client, redirect};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::time::sleep;
use tracing::{debug, instrument, warn};
use url::Url;

/// Desktop browser identifier shared by every source; several of the
/// institutional sites serve an empty shell to unknown agents.
pub const USER_AGENT: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

/// What kind of document the caller expects back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Accept {
    Html,
    Xml,
}

impl Accept {
    fn header_value(self) -> &'static str {
        match self {
            Accept::Html => "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8",
            Accept::Xml => "application/xml,text/xml;q=0.9,*/*;q=0.5",
        }
    }
}

/// A successfully fetched document.
///
/// The body is decoded with the charset announced in `Content-Type`
/// (UTF-8 when absent); some of the sites still serve ISO-8859-1.
#[derive(Debug, Clone)]
pub struct FetchedPage {
    pub status: u16,
    pub final_url: String,
    pub content_type: Option<String>,
    pub body: String,
}

/// Anything able to fetch a URL. The pipeline only talks to this trait so
/// tests can serve canned pages.
#[async_trait]
pub trait Fetch: Send + Sync {
    async fn fetch(&self, url: &str, accept: Accept) -> Result<FetchedPage, FetchError>;
}

/// Timeouts, retry schedule and politeness floor.
#[derive(Debug, Clone)]
pub struct FetchPolicy {
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    /// Wait before each attempt; its length is the number of attempts.
    pub backoff: Vec<Duration>,
    /// Fraction of each wait added or removed at random.
    pub jitter: f64,
    /// Minimum spacing between two requests to the same host.
    pub host_min_delay: Duration,
}

impl Default for FetchPolicy {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(15),
            read_timeout: Duration::from_secs(30),
            backoff: vec![Duration::ZERO, Duration::from_secs(2), Duration::from_secs(5)],
            jitter: 0.25,
            host_min_delay: Duration::from_secs(1),
        }
    }
}

/// Apply full ±`fraction` jitter to `base`.
fn jittered(base: Duration, fraction: f64) -> Duration {
    if base.is_zero() || fraction <= 0.0 {
        return base;
    }
    let factor: f64 = rng().random_range((1.0 - fraction)..=(1.0 + fraction));
    base.mul_f64(factor.max(0.0))
}

/// Per-host request schedule.
///
/// Each call reserves the next free slot for its host before sleeping, so
/// concurrent callers queue up instead of all waking at once.
#[derive(Debug)]
pub struct HostThrottle {
    min_delay: Duration,
    next_slot: Mutex<HashMap<String, Instant>>,
}

impl HostThrottle {
    pub fn new(min_delay: Duration) -> Self {
        Self {
            min_delay,
            next_slot: Mutex::new(HashMap::new()),
        }
    }

    /// Wait until a request to `host` is allowed.
    pub async fn wait(&self, host: &str) {
        let wait = {
            let mut slots = self.next_slot.lock().await;
            let now = Instant::now();
            let slot = slots
                .get(host)
                .copied()
                .filter(|s| *s > now)
                .unwrap_or(now);
            slots.insert(host.to_string(), slot + self.min_delay);
            slot.saturating_duration_since(now)
        };
        if !wait.is_zero() {
            debug!(host, wait_ms = wait.as_millis() as u64, "Throttling request");
            sleep(wait).await;
        }
    }
}

fn bare_host(host: &str) -> &str {
    host.strip_prefix("www.").unwrap_or(host)
}

/// Whether `host` is one of the allowed hosts, ignoring a `www.` prefix.
pub fn host_allowed(allowed: &HashSet<String>, host: &str) -> bool {
    let host = bare_host(host);
    allowed.iter().any(|a| bare_host(a).eq_ignore_ascii_case(host))
}

/// The production [`Fetch`] implementation on top of `reqwest`.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: Client,
    policy: FetchPolicy,
    throttle: Arc<HostThrottle>,
}

impl HttpFetcher {
    /// Build a fetcher whose redirects may only land on `allowed_hosts`.
    pub fn new(policy: FetchPolicy, allowed_hosts: HashSet<String>) -> Result<Self, reqwest::Error> {
        let allowed = Arc::new(allowed_hosts);
        let redirect_policy = redirect::Policy::custom(move |attempt| {
            if attempt.previous().len() >= 10 {
                return attempt.error("too many redirects");
            }
            let permitted = attempt
                .url()
                .host_str()
                .is_some_and(|h| host_allowed(&allowed, h));
            if permitted {
                attempt.follow()
            } else {
                attempt.error("redirect to off-domain host")
            }
        });

        let client = Client::builder()
            .user_agent(USER_AGENT)
            .connect_timeout(policy.connect_timeout)
            .read_timeout(policy.read_timeout)
            .redirect(redirect_policy)
            .gzip(true)
            .build()?;

        Ok(Self {
            client,
            throttle: Arc::new(HostThrottle::new(policy.host_min_delay)),
            policy,
        })
    }

    fn classify(url: &str, e: reqwest::Error) -> FetchError {
        if e.is_timeout() {
            FetchError::Timeout { url: url.to_string() }
        } else if e.is_redirect() {
            FetchError::OffDomainRedirect { url: url.to_string() }
        } else {
            FetchError::Network {
                url: url.to_string(),
                reason: e.to_string(),
            }
        }
    }

    async fn attempt(&self, url: &str, accept: Accept) -> Result<FetchedPage, FetchError> {
        let response = self
            .client
            .get(url)
            .header(ACCEPT, accept.header_value())
            .header(ACCEPT_LANGUAGE, "es-CL,es;q=0.9,en;q=0.8")
            .send()
            .await
            .map_err(|e| Self::classify(url, e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Http {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }

        let final_url = response.url().to_string();
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = response.text().await.map_err(|e| Self::classify(url, e))?;

        Ok(FetchedPage {
            status: status.as_u16(),
            final_url,
            content_type,
            body,
        })
    }
}

#[async_trait]
impl Fetch for HttpFetcher {
    #[instrument(level = "debug", skip(self))]
    async fn fetch(&self, url: &str, accept: Accept) -> Result<FetchedPage, FetchError> {
        let host = Url::parse(url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_string))
            .ok_or_else(|| FetchError::Network {
                url: url.to_string(),
                reason: "not an absolute URL".to_string(),
            })?;

        let attempts = self.policy.backoff.len().max(1);
        let total_t0 = Instant::now();
        let mut last_err = None;

        for attempt in 0..attempts {
            let base = self
                .policy
                .backoff
                .get(attempt)
                .copied()
                .unwrap_or(Duration::ZERO);
            let delay = jittered(base, self.policy.jitter);
            if !delay.is_zero() {
                sleep(delay).await;
            }
            self.throttle.wait(&host).await;

            match self.attempt(url, accept).await {
                Ok(page) => {
                    debug!(
                        attempt = attempt + 1,
                        bytes = page.body.len(),
                        elapsed_ms_total = total_t0.elapsed().as_millis() as u64,
                        "Fetched"
                    );
                    return Ok(page);
                }
                Err(e) if e.is_transient() && attempt + 1 < attempts => {
                    warn!(
                        attempt = attempt + 1,
                        max = attempts,
                        error = %e,
                        "fetch attempt failed; backing off"
                    );
                    last_err = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_err.unwrap_or_else(|| FetchError::Network {
            url: url.to_string(),
            reason: "no attempt made".to_string(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serve canned responses in order (repeating the last one), one per
    /// connection, and count how many requests arrived.
    async fn serve(responses: Vec<(u16, &'static str)>) -> (String, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        tokio::spawn(async move {
            while let Ok((mut sock, _)) = listener.accept().await {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                let (status, body) = responses
                    .get(n)
                    .or(responses.last())
                    .copied()
                    .unwrap();
                let mut buf = [0u8; 4096];
                let _ = sock.read(&mut buf).await;
                let reply = format!(
                    "HTTP/1.1 {status} X\r\nContent-Type: text/html; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                    body.len()
                );
                let _ = sock.write_all(reply.as_bytes()).await;
                let _ = sock.shutdown().await;
            }
        });
        (format!("http://{addr}/noticia"), hits)
    }

    fn fast_policy() -> FetchPolicy {
        FetchPolicy {
            backoff: vec![Duration::ZERO, Duration::from_millis(10), Duration::from_millis(10)],
            host_min_delay: Duration::ZERO,
            ..FetchPolicy::default()
        }
    }

    fn fetcher() -> HttpFetcher {
        HttpFetcher::new(fast_policy(), HashSet::from(["127.0.0.1".to_string()])).unwrap()
    }

    #[tokio::test]
    async fn test_retries_transient_then_succeeds() {
        let (url, hits) = serve(vec![(503, "busy"), (200, "<html>ok</html>")]).await;
        let page = fetcher().fetch(&url, Accept::Html).await.unwrap();
        assert_eq!(page.status, 200);
        assert_eq!(page.body, "<html>ok</html>");
        assert!(page.content_type.unwrap().starts_with("text/html"));
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_gives_up_after_three_attempts() {
        let (url, hits) = serve(vec![(503, "busy")]).await;
        let err = fetcher().fetch(&url, Accept::Html).await.unwrap_err();
        assert!(matches!(err, FetchError::Http { status: 503, .. }));
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_does_not_retry_client_errors() {
        let (url, hits) = serve(vec![(404, "missing")]).await;
        let err = fetcher().fetch(&url, Accept::Html).await.unwrap_err();
        assert!(matches!(err, FetchError::Http { status: 404, .. }));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_relative_url_is_rejected() {
        let err = fetcher().fetch("/noticias", Accept::Html).await.unwrap_err();
        assert!(matches!(err, FetchError::Network { .. }));
    }

    #[tokio::test]
    async fn test_host_throttle_spaces_requests() {
        let throttle = HostThrottle::new(Duration::from_millis(40));
        let t0 = Instant::now();
        throttle.wait("www.sii.cl").await;
        throttle.wait("www.sii.cl").await;
        throttle.wait("www.sii.cl").await;
        assert!(t0.elapsed() >= Duration::from_millis(80));
    }

    #[tokio::test]
    async fn test_host_throttle_is_per_host() {
        let throttle = HostThrottle::new(Duration::from_millis(200));
        let t0 = Instant::now();
        throttle.wait("www.sii.cl").await;
        throttle.wait("www.pjud.cl").await;
        assert!(t0.elapsed() < Duration::from_millis(150));
    }

    #[test]
    fn test_host_allowed_ignores_www() {
        let allowed = HashSet::from(["www.cde.cl".to_string(), "3ta.cl".to_string()]);
        assert!(host_allowed(&allowed, "cde.cl"));
        assert!(host_allowed(&allowed, "www.3ta.cl"));
        assert!(!host_allowed(&allowed, "evil.example.com"));
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let base = Duration::from_secs(2);
        for _ in 0..100 {
            let d = jittered(base, 0.25);
            assert!(d >= Duration::from_millis(1500) && d <= Duration::from_millis(2500));
        }
        assert_eq!(jittered(Duration::ZERO, 0.25), Duration::ZERO);
    }
}
