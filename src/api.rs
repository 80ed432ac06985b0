//! LLM API interaction with exponential backoff retry logic.
//!
//! This module talks to an OpenAI-compatible chat completions endpoint. It
//! includes automatic retry logic with exponential backoff and jitter to
//! handle transient failures (connection errors, 429, 5xx).
//!
//! # Architecture
//!
//! - [`ChatBackend`]: Core trait defining one system + user exchange
//! - [`OpenAiChat`]: `reqwest` client for `POST {base}/chat/completions`
//! - [`RetryAsk`]: Decorator that adds retry logic to any `ChatBackend`
//!
//! # Retry Strategy
//!
//! - 2 retries by default
//! - Exponential backoff starting at the configured base delay
//! - Maximum delay capped at 30 seconds
//! - Random jitter (0-250ms) added to prevent thundering herd
//! - Only transient errors are retried; a 401 or a malformed reply is not

use crate::config::LlmSettings;
use crate::error::EnrichmentError;
use crate::utils::truncate_for_log;
use async_trait::async_trait;
use rand::{Rng, rng};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration as StdDuration, Instant};
use tokio::time::sleep;
use tracing::{debug, error, instrument, warn};

/// Sampling temperature for every request.
pub const TEMPERATURE: f32 = 0.2;

/// Trait for one chat exchange with an LLM.
///
/// Returns the raw text of the assistant message; interpreting it is the
/// caller's business.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    async fn complete(&self, system: &str, user: &str) -> Result<String, EnrichmentError>;
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    temperature: f32,
    response_format: ResponseFormat,
    messages: [ChatMessage<'a>; 2],
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

/// OpenAI-compatible chat client.
///
/// One instance per run; `reqwest::Client` pools connections internally.
#[derive(Clone)]
pub struct OpenAiChat {
    client: Client,
    endpoint: String,
    api_key: String,
    model: String,
}

impl fmt::Debug for OpenAiChat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpenAiChat")
            .field("endpoint", &self.endpoint)
            .field("model", &self.model)
            .finish()
    }
}

impl OpenAiChat {
    pub fn new(settings: &LlmSettings) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .connect_timeout(StdDuration::from_secs(15))
            .timeout(StdDuration::from_secs(90))
            .build()?;
        Ok(Self {
            client,
            endpoint: format!("{}/chat/completions", settings.base_url.trim_end_matches('/')),
            api_key: settings.api_key.clone(),
            model: settings.model.clone(),
        })
    }
}

#[async_trait]
impl ChatBackend for OpenAiChat {
    #[instrument(level = "debug", skip_all, fields(model = %self.model))]
    async fn complete(&self, system: &str, user: &str) -> Result<String, EnrichmentError> {
        let t0 = Instant::now();
        let request = ChatRequest {
            model: &self.model,
            temperature: TEMPERATURE,
            response_format: ResponseFormat { kind: "json_object" },
            messages: [
                ChatMessage { role: "system", content: system },
                ChatMessage { role: "user", content: user },
            ],
        };

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| EnrichmentError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(
                status = status.as_u16(),
                elapsed_ms = t0.elapsed().as_millis() as u64,
                body = %truncate_for_log(&body, 300),
                "API call failed"
            );
            return Err(EnrichmentError::Api {
                status: status.as_u16(),
            });
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| EnrichmentError::Malformed(e.to_string()))?;
        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| EnrichmentError::Malformed("no message content".to_string()))?;

        debug!(
            elapsed_ms = t0.elapsed().as_millis() as u64,
            chars = content.len(),
            "API call succeeded"
        );
        Ok(content)
    }
}

/// Wrapper that adds exponential backoff retry logic to any [`ChatBackend`].
///
/// The delay between retries follows this formula:
/// ```text
/// delay = min(base_delay * 2^(attempt-1), max_delay) + random_jitter(0..250ms)
/// ```
pub struct RetryAsk<T> {
    /// The underlying LLM client to wrap.
    inner: T,
    /// Maximum number of retry attempts before giving up.
    max_retries: usize,
    /// Initial delay between retries (doubles with each attempt).
    base_delay: StdDuration,
    /// Maximum delay cap to prevent excessive waiting.
    max_delay: StdDuration,
}

impl<T> RetryAsk<T>
where
    T: ChatBackend,
{
    /// Create a new retry wrapper around an existing [`ChatBackend`].
    ///
    /// # Example
    ///
    /// ```ignore
    /// let chat = RetryAsk::new(OpenAiChat::new(&settings)?, 2, Duration::from_secs(1));
    /// ```
    pub fn new(inner: T, max_retries: usize, base_delay: StdDuration) -> Self {
        Self {
            inner,
            max_retries,
            base_delay,
            max_delay: StdDuration::from_secs(30),
        }
    }

    fn delay_for(&self, attempt: usize) -> StdDuration {
        let shift = attempt.saturating_sub(1).min(16) as u32;
        let delay = self.base_delay.saturating_mul(1 << shift).min(self.max_delay);
        let jitter_ms: u64 = rng().random_range(0..=250);
        delay + StdDuration::from_millis(jitter_ms)
    }
}

impl<T> fmt::Debug for RetryAsk<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryAsk")
            .field("max_retries", &self.max_retries)
            .field("base_delay", &self.base_delay)
            .field("max_delay", &self.max_delay)
            .finish()
    }
}

#[async_trait]
impl<T> ChatBackend for RetryAsk<T>
where
    T: ChatBackend,
{
    #[instrument(level = "debug", skip_all)]
    async fn complete(&self, system: &str, user: &str) -> Result<String, EnrichmentError> {
        let total_t0 = Instant::now();
        let mut attempt = 0usize;

        loop {
            let attempt_t0 = Instant::now();
            match self.inner.complete(system, user).await {
                Ok(resp) => return Ok(resp),
                Err(e) => {
                    attempt += 1;
                    let attempt_dt = attempt_t0.elapsed();
                    let total_dt = total_t0.elapsed();

                    if !e.is_transient() || attempt > self.max_retries {
                        error!(
                            attempt,
                            max = self.max_retries,
                            elapsed_ms_attempt = attempt_dt.as_millis() as u64,
                            elapsed_ms_total = total_dt.as_millis() as u64,
                            error = %e,
                            "complete() gave up"
                        );
                        return Err(e);
                    }

                    let delay = self.delay_for(attempt);
                    warn!(
                        attempt,
                        max = self.max_retries,
                        elapsed_ms_attempt = attempt_dt.as_millis() as u64,
                        elapsed_ms_total = total_dt.as_millis() as u64,
                        ?delay,
                        error = %e,
                        "complete() attempt failed; backing off"
                    );
                    sleep(delay).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Replays scripted results, then keeps returning the last one.
    struct Scripted {
        script: Mutex<Vec<Result<String, EnrichmentError>>>,
        calls: AtomicUsize,
    }

    impl Scripted {
        fn new(mut script: Vec<Result<String, EnrichmentError>>) -> Self {
            script.reverse();
            Self {
                script: Mutex::new(script),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl ChatBackend for Scripted {
        async fn complete(&self, _system: &str, _user: &str) -> Result<String, EnrichmentError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut script = self.script.lock().unwrap();
            if script.len() > 1 {
                script.pop().unwrap()
            } else {
                script[0].clone()
            }
        }
    }

    #[tokio::test]
    async fn test_retry_recovers_from_transient_errors() {
        let inner = Scripted::new(vec![
            Err(EnrichmentError::Api { status: 503 }),
            Err(EnrichmentError::Transport("reset".into())),
            Ok("{}".into()),
        ]);
        let retry = RetryAsk::new(inner, 2, StdDuration::from_millis(1));
        assert_eq!(retry.complete("s", "u").await.unwrap(), "{}");
        assert_eq!(retry.inner.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_gives_up_after_max_retries() {
        let inner = Scripted::new(vec![Err(EnrichmentError::Api { status: 500 })]);
        let retry = RetryAsk::new(inner, 2, StdDuration::from_millis(1));
        let err = retry.complete("s", "u").await.unwrap_err();
        assert!(matches!(err, EnrichmentError::Api { status: 500 }));
        assert_eq!(retry.inner.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_skips_permanent_errors() {
        let inner = Scripted::new(vec![Err(EnrichmentError::Api { status: 401 })]);
        let retry = RetryAsk::new(inner, 2, StdDuration::from_millis(1));
        assert!(retry.complete("s", "u").await.is_err());
        assert_eq!(retry.inner.calls.load(Ordering::SeqCst), 1);
    }

    /// One-shot HTTP server returning `body` with `status`; the request
    /// text is sent back through the handle.
    async fn serve_once(status: u16, body: &'static str) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 16384];
            let mut seen = Vec::new();
            // Read until the JSON body has arrived.
            loop {
                let n = sock.read(&mut buf).await.unwrap();
                seen.extend_from_slice(&buf[..n]);
                if n == 0 || String::from_utf8_lossy(&seen).contains("\"messages\"") && seen.ends_with(b"}") {
                    break;
                }
            }
            let reply = format!(
                "HTTP/1.1 {status} X\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            );
            sock.write_all(reply.as_bytes()).await.unwrap();
            let _ = sock.shutdown().await;
            String::from_utf8_lossy(&seen).into_owned()
        });
        (format!("http://{addr}/v1/"), handle)
    }

    fn settings(base_url: String) -> LlmSettings {
        LlmSettings {
            api_key: "sk-test".to_string(),
            base_url,
            model: "gpt-4o-mini".to_string(),
            concurrency: 1,
            requests_per_minute: 60,
        }
    }

    #[tokio::test]
    async fn test_openai_chat_sends_json_request() {
        let (base, handle) = serve_once(
            200,
            r#"{"choices":[{"message":{"role":"assistant","content":"{\"summary\":\"ok\"}"}}]}"#,
        )
        .await;
        let chat = OpenAiChat::new(&settings(base)).unwrap();
        let reply = chat.complete("sistema", "usuario").await.unwrap();
        assert_eq!(reply, r#"{"summary":"ok"}"#);

        let request = handle.await.unwrap();
        assert!(request.starts_with("POST /v1/chat/completions"));
        assert!(request.to_lowercase().contains("authorization: bearer sk-test"));
        assert!(request.contains(r#""type":"json_object""#));
        assert!(request.contains(r#""temperature":0.2"#));
    }

    #[tokio::test]
    async fn test_openai_chat_maps_status() {
        let (base, _handle) = serve_once(500, r#"{"error":"boom"}"#).await;
        let chat = OpenAiChat::new(&settings(base)).unwrap();
        let err = chat.complete("s", "u").await.unwrap_err();
        assert!(matches!(err, EnrichmentError::Api { status: 500 }));
    }
}
