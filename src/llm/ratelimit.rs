// Rate-limited wrapper around a chat backend.
//
// Two token buckets (requests/minute and tokens/minute) shape admission;
// 429 responses trigger bounded exponential retry, honoring the most
// recently observed Retry-After header.

use std::time::Duration;

use parking_lot::Mutex;
// tokio's Instant tracks the (pausable) tokio clock the sleeps run on.
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::agent::types::{ChatRequest, ChatResponse, RateLimitStats};
use crate::config::ProviderConfig;

use super::{ChatBackend, LlmError};

const BACKOFF_BASE: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(60);

/// How long an observed Retry-After stays relevant.
const RETRY_AFTER_MEMORY: Duration = Duration::from_secs(60);

/// Token bucket: burst up to `capacity`, refilled continuously.
pub(crate) struct TokenBucket {
    tokens: f64,
    capacity: f64,
    refill_rate: f64,
    last_refill: Instant,
}

impl TokenBucket {
    /// A bucket admitting `limit` units per minute with burst = limit.
    pub fn per_minute(limit: u64) -> Self {
        let capacity = limit as f64;
        Self {
            tokens: capacity,
            capacity,
            refill_rate: capacity / 60.0,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.capacity);
        self.last_refill = now;
    }

    /// Take `n` tokens if available right now. Requests larger than the
    /// burst size are clamped so they can eventually be admitted.
    pub fn try_take(&mut self, n: f64) -> bool {
        let n = n.min(self.capacity);
        self.refill();
        if self.tokens >= n {
            self.tokens -= n;
            true
        } else {
            false
        }
    }

    /// Time until `n` tokens will have accumulated.
    pub fn time_until(&self, n: f64) -> Duration {
        if self.tokens >= n {
            return Duration::ZERO;
        }
        let needed = (n.min(self.capacity)) - self.tokens;
        Duration::from_secs_f64(needed / self.refill_rate)
    }
}

/// A chat backend with per-provider shaping, retry, and stats.
pub(crate) struct RateLimitedBackend {
    provider_name: String,
    provider_kind: String,
    inner: Box<dyn ChatBackend>,
    rpm: Option<Mutex<TokenBucket>>,
    tpm: Option<Mutex<TokenBucket>>,
    retry_on_429: bool,
    max_retries: u32,
    /// Most recent Retry-After seen on this provider, with when.
    last_retry_after: Mutex<Option<(Instant, Duration)>>,
    stats: Mutex<RateLimitStats>,
}

impl RateLimitedBackend {
    pub fn new(config: &ProviderConfig, inner: Box<dyn ChatBackend>) -> Self {
        let limits = config.rate_limits;
        let retry = config.retry.unwrap_or_default();
        Self {
            provider_name: config.name.clone(),
            provider_kind: config.kind.to_lowercase(),
            inner,
            rpm: limits
                .filter(|l| l.rpm > 0)
                .map(|l| Mutex::new(TokenBucket::per_minute(l.rpm))),
            tpm: limits
                .filter(|l| l.tpm > 0)
                .map(|l| Mutex::new(TokenBucket::per_minute(l.tpm))),
            retry_on_429: retry.retry_on_429,
            max_retries: retry.max_retries,
            last_retry_after: Mutex::new(None),
            stats: Mutex::new(RateLimitStats::default()),
        }
    }

    pub fn provider_kind(&self) -> &str {
        &self.provider_kind
    }

    /// Cumulative stats for this provider.
    pub fn stats(&self) -> RateLimitStats {
        *self.stats.lock()
    }

    /// One shaped, retried chat call.
    pub async fn chat(
        &self,
        cancel: &CancellationToken,
        request: ChatRequest,
    ) -> Result<ChatResponse, LlmError> {
        let estimate = prompt_token_estimate(&request);
        self.wait(&self.rpm, 1.0, cancel).await?;
        self.wait(&self.tpm, estimate as f64, cancel).await?;

        let mut attempt: u32 = 0;
        loop {
            let outcome = tokio::select! {
                _ = cancel.cancelled() => return Err(LlmError::Cancelled),
                outcome = self.inner.chat(request.clone()) => outcome,
            };
            match outcome {
                Ok(response) => {
                    if attempt > 0 {
                        self.stats.lock().retry_successes += 1;
                    }
                    return Ok(response);
                }
                Err(LlmError::RateLimited { retry_after }) => {
                    {
                        let mut stats = self.stats.lock();
                        stats.hits += 1;
                    }
                    if let Some(after) = retry_after {
                        *self.last_retry_after.lock() = Some((Instant::now(), after));
                    }
                    if !self.retry_on_429 || attempt >= self.max_retries {
                        return Err(LlmError::RateLimited { retry_after });
                    }

                    let backoff = exponential_backoff(attempt);
                    let delay = match self.remembered_retry_after() {
                        Some(after) => backoff.max(after),
                        None => backoff,
                    };
                    {
                        let mut stats = self.stats.lock();
                        stats.retries += 1;
                        stats.total_wait_ms += delay.as_millis() as u64;
                    }
                    tracing::warn!(
                        provider = %self.provider_name,
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        "rate limited, backing off"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(LlmError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                    attempt += 1;
                }
                Err(other) => return Err(other),
            }
        }
    }

    /// Block until the bucket admits `n` units, honoring cancellation.
    async fn wait(
        &self,
        bucket: &Option<Mutex<TokenBucket>>,
        n: f64,
        cancel: &CancellationToken,
    ) -> Result<(), LlmError> {
        let Some(bucket) = bucket else {
            return Ok(());
        };
        loop {
            let pause = {
                let mut guard = bucket.lock();
                if guard.try_take(n) {
                    return Ok(());
                }
                guard.time_until(n)
            };
            self.stats.lock().total_wait_ms += pause.as_millis() as u64;
            tokio::select! {
                _ = cancel.cancelled() => return Err(LlmError::Cancelled),
                _ = tokio::time::sleep(pause) => {}
            }
        }
    }

    fn remembered_retry_after(&self) -> Option<Duration> {
        let guard = self.last_retry_after.lock();
        match *guard {
            Some((seen, after)) if seen.elapsed() < RETRY_AFTER_MEMORY => Some(after),
            _ => None,
        }
    }
}

/// chars/4 estimate of the prompt, with a floor of one token.
fn prompt_token_estimate(request: &ChatRequest) -> u64 {
    let chars: usize = request
        .messages
        .iter()
        .map(|m| {
            m.content.len()
                + m.tool_calls
                    .iter()
                    .map(|tc| tc.name.len() + tc.arguments.len())
                    .sum::<usize>()
        })
        .sum();
    ((chars / 4) as u64).max(1)
}

fn exponential_backoff(attempt: u32) -> Duration {
    let factor = 1u64 << attempt.min(6);
    (BACKOFF_BASE * factor as u32).min(BACKOFF_CAP)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::types::ChatMessage;
    use crate::config::schema::{RateLimitsConfig, RetryConfig};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Backend that fails with 429 a fixed number of times, then succeeds.
    struct FlakyBackend {
        failures: AtomicU32,
        retry_after: Option<Duration>,
    }

    #[async_trait]
    impl ChatBackend for FlakyBackend {
        async fn chat(&self, _request: ChatRequest) -> Result<ChatResponse, LlmError> {
            if self.failures.load(Ordering::SeqCst) > 0 {
                self.failures.fetch_sub(1, Ordering::SeqCst);
                return Err(LlmError::RateLimited {
                    retry_after: self.retry_after,
                });
            }
            Ok(ChatResponse {
                content: "ok".to_string(),
                ..Default::default()
            })
        }
    }

    fn provider(rpm: u64, tpm: u64, retry_on_429: bool, max_retries: u32) -> ProviderConfig {
        ProviderConfig {
            name: "p".into(),
            kind: "OPENAI".into(),
            token: Some("k".into()),
            secret: None,
            model: "gpt-4o".into(),
            base_url: None,
            version: None,
            project_id: None,
            location: None,
            credentials_path: None,
            auth_type: None,
            rate_limits: (rpm > 0 || tpm > 0).then_some(RateLimitsConfig { tpm, rpm }),
            retry: Some(RetryConfig {
                retry_on_429,
                max_retries,
            }),
        }
    }

    fn request() -> ChatRequest {
        ChatRequest {
            messages: vec![ChatMessage::user("hello there")],
            tools: vec![],
            max_tokens: 128,
            temperature: None,
        }
    }

    #[test]
    fn test_bucket_burst_admitted() {
        let mut bucket = TokenBucket::per_minute(60);
        for _ in 0..60 {
            assert!(bucket.try_take(1.0));
        }
        assert!(!bucket.try_take(1.0));
    }

    #[test]
    fn test_bucket_time_until() {
        let mut bucket = TokenBucket::per_minute(60);
        while bucket.try_take(1.0) {}
        let wait = bucket.time_until(1.0);
        // 1 token per second refill.
        assert!(wait <= Duration::from_secs(1));
        assert!(wait > Duration::from_millis(800));
    }

    #[test]
    fn test_bucket_oversized_request_clamps_to_capacity() {
        let bucket = TokenBucket::per_minute(60);
        // Asking for more than capacity still yields a finite wait.
        assert!(bucket.time_until(10_000.0) <= Duration::from_secs(60));
    }

    #[test]
    fn test_prompt_token_estimate_floor() {
        let req = ChatRequest {
            messages: vec![ChatMessage::user("")],
            tools: vec![],
            max_tokens: 1,
            temperature: None,
        };
        assert_eq!(prompt_token_estimate(&req), 1);
    }

    #[test]
    fn test_prompt_token_estimate_chars_over_four() {
        let req = ChatRequest {
            messages: vec![ChatMessage::user(&"x".repeat(400))],
            tools: vec![],
            max_tokens: 1,
            temperature: None,
        };
        assert_eq!(prompt_token_estimate(&req), 100);
    }

    #[test]
    fn test_exponential_backoff_growth_and_cap() {
        assert_eq!(exponential_backoff(0), Duration::from_secs(1));
        assert_eq!(exponential_backoff(1), Duration::from_secs(2));
        assert_eq!(exponential_backoff(2), Duration::from_secs(4));
        assert_eq!(exponential_backoff(10), Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_succeeds_and_counts_stats() {
        let backend = RateLimitedBackend::new(
            &provider(0, 0, true, 3),
            Box::new(FlakyBackend {
                failures: AtomicU32::new(1),
                retry_after: Some(Duration::from_secs(2)),
            }),
        );
        let cancel = CancellationToken::new();
        let started = tokio::time::Instant::now();
        let response = backend.chat(&cancel, request()).await.unwrap();
        assert_eq!(response.content, "ok");
        // Retry-After of 2s dominates the 1s first backoff.
        assert!(started.elapsed() >= Duration::from_secs(2));

        let stats = backend.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.retries, 1);
        assert_eq!(stats.retry_successes, 1);
        assert!(stats.total_wait_ms >= 2000);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_exhaustion_returns_last_error() {
        let backend = RateLimitedBackend::new(
            &provider(0, 0, true, 2),
            Box::new(FlakyBackend {
                failures: AtomicU32::new(10),
                retry_after: None,
            }),
        );
        let cancel = CancellationToken::new();
        let result = backend.chat(&cancel, request()).await;
        assert!(matches!(result, Err(LlmError::RateLimited { .. })));

        let stats = backend.stats();
        // Initial attempt + 2 retries, all 429.
        assert_eq!(stats.hits, 3);
        assert_eq!(stats.retries, 2);
        assert_eq!(stats.retry_successes, 0);
    }

    #[tokio::test]
    async fn test_retry_disabled_fails_fast() {
        let backend = RateLimitedBackend::new(
            &provider(0, 0, false, 3),
            Box::new(FlakyBackend {
                failures: AtomicU32::new(1),
                retry_after: None,
            }),
        );
        let cancel = CancellationToken::new();
        let result = backend.chat(&cancel, request()).await;
        assert!(matches!(result, Err(LlmError::RateLimited { .. })));
        assert_eq!(backend.stats().retries, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rpm_bucket_shapes_admission() {
        // 60 rpm: the 61st request in one instant must wait ~1s.
        let backend = RateLimitedBackend::new(
            &provider(60, 0, true, 0),
            Box::new(FlakyBackend {
                failures: AtomicU32::new(0),
                retry_after: None,
            }),
        );
        let cancel = CancellationToken::new();
        let started = tokio::time::Instant::now();
        for _ in 0..61 {
            backend.chat(&cancel, request()).await.unwrap();
        }
        assert!(started.elapsed() >= Duration::from_millis(900));
    }

    #[tokio::test]
    async fn test_cancelled_wait_returns_promptly() {
        let backend = RateLimitedBackend::new(
            &provider(1, 0, true, 0),
            Box::new(FlakyBackend {
                failures: AtomicU32::new(0),
                retry_after: None,
            }),
        );
        let cancel = CancellationToken::new();
        // Drain the single-token bucket, then cancel mid-wait.
        backend.chat(&cancel, request()).await.unwrap();
        cancel.cancel();
        let result = backend.chat(&cancel, request()).await;
        assert!(matches!(result, Err(LlmError::Cancelled)));
    }
}
