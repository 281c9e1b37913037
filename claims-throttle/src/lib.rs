#![deny(clippy::print_stdout, clippy::print_stderr)]

//! Mediates every external call an adapter makes: per-`(provider,
//! endpoint_class)` token bucket, retry with jittered exponential backoff,
//! and single-shot credential refresh on `401`.
//!
//! The token bucket for a given key is owned by a single entry behind a
//! registry-wide `tokio::sync::Mutex`; callers never see or touch the bucket
//! directly, only `acquire`/`execute` — the "class-based service with shared
//! mutable fields becomes an owner task with a message-passing interface"
//! redesign applied to a rate limiter.

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;
use std::time::Instant;

use rand::Rng;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::sync::RwLock;
use tokio::time::sleep;
use tracing::info_span;
use tracing::warn;
use tracing::Instrument;

pub type ThrottleResult<T> = Result<T, ThrottleError>;

#[derive(Debug, Error)]
pub enum ThrottleError {
    #[error("rate limited calling {provider}/{endpoint_class}: {message}")]
    RateLimited {
        provider: String,
        endpoint_class: String,
        message: String,
    },
    #[error("transient failure calling {provider}/{endpoint_class}: {message}")]
    Transient {
        provider: String,
        endpoint_class: String,
        message: String,
    },
    #[error("auth failure calling {provider}/{endpoint_class}: {message}")]
    Auth {
        provider: String,
        endpoint_class: String,
        message: String,
    },
    #[error("resource not found calling {provider}/{endpoint_class}: {message}")]
    NotFound {
        provider: String,
        endpoint_class: String,
        message: String,
    },
    #[error("invalid call to {provider}/{endpoint_class}: {message}")]
    Invalid {
        provider: String,
        endpoint_class: String,
        message: String,
    },
    #[error("fatal error calling {provider}/{endpoint_class}: {message}")]
    Fatal {
        provider: String,
        endpoint_class: String,
        message: String,
    },
}

/// Classification of a single attempt's transport-level failure, reported by
/// the caller's operation closure. `status` carries the HTTP status when the
/// transport got a response at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    ConnectionReset,
    Timeout,
    Refused,
    Dns,
}

#[derive(Debug, Clone)]
pub struct AttemptFailure {
    pub status: Option<u16>,
    pub transport: Option<TransportErrorKind>,
    pub retry_after: Option<Duration>,
    pub message: String,
}

impl AttemptFailure {
    fn is_unauthorized(&self) -> bool {
        self.status == Some(401)
    }

    fn is_retryable(&self) -> bool {
        matches!(
            self.status,
            Some(408) | Some(429) | Some(502) | Some(503) | Some(504)
        ) || self.transport.is_some()
    }

    fn is_rate_limited(&self) -> bool {
        self.status == Some(429)
    }
}

#[derive(Debug, Clone)]
pub struct ThrottleConfig {
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub backoff_multiplier: u32,
    pub backoff_ceiling: Duration,
    pub jitter_fraction: f64,
    pub default_metadata_budget: Duration,
    pub default_parsing_budget: Duration,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff: Duration::from_secs(2),
            backoff_multiplier: 2,
            backoff_ceiling: Duration::from_secs(30),
            jitter_fraction: 0.25,
            default_metadata_budget: Duration::from_secs(30),
            default_parsing_budget: Duration::from_secs(90),
        }
    }
}

impl ThrottleConfig {
    fn backoff_for(&self, attempt: u32) -> Duration {
        let multiplier = self.backoff_multiplier.saturating_pow(attempt.saturating_sub(1));
        let base = self.base_backoff.saturating_mul(multiplier).min(self.backoff_ceiling);
        jitter(base, self.jitter_fraction)
    }
}

fn jitter(base: Duration, fraction: f64) -> Duration {
    if fraction <= 0.0 {
        return base;
    }
    let base_secs = base.as_secs_f64();
    let spread = base_secs * fraction;
    let offset = rand::rng().random_range(-spread..=spread);
    Duration::from_secs_f64((base_secs + offset).max(0.0))
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BucketKey {
    pub provider: String,
    pub endpoint_class: String,
}

impl BucketKey {
    #[must_use]
    pub fn new(provider: impl Into<String>, endpoint_class: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            endpoint_class: endpoint_class.into(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BucketSettings {
    pub capacity: u32,
    pub refill_per_second: f64,
}

impl Default for BucketSettings {
    fn default() -> Self {
        Self {
            capacity: 5,
            refill_per_second: 1.0,
        }
    }
}

struct TokenBucket {
    settings: BucketSettings,
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(settings: BucketSettings) -> Self {
        Self {
            tokens: f64::from(settings.capacity),
            settings,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.settings.refill_per_second)
            .min(f64::from(self.settings.capacity));
        self.last_refill = now;
    }

    /// Time until at least one token is available, `None` if one already is.
    fn wait_for_token(&mut self) -> Option<Duration> {
        self.refill();
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            None
        } else {
            let deficit = 1.0 - self.tokens;
            let seconds = deficit / self.settings.refill_per_second.max(f64::EPSILON);
            Some(Duration::from_secs_f64(seconds))
        }
    }
}

/// Registry of per-`(provider, endpoint_class)` token buckets. Each bucket is
/// behind its own `Mutex`; the registry's `RwLock` is only held long enough
/// to find-or-insert the bucket, never across the `await` that waits for
/// refill.
#[derive(Default)]
pub struct ThrottledClient {
    config: ThrottleConfig,
    buckets: RwLock<HashMap<BucketKey, Mutex<TokenBucket>>>,
    bucket_defaults: HashMap<String, BucketSettings>,
}

impl ThrottledClient {
    #[must_use]
    pub fn new(config: ThrottleConfig) -> Self {
        Self {
            config,
            buckets: RwLock::new(HashMap::new()),
            bucket_defaults: HashMap::new(),
        }
    }

    #[must_use]
    pub fn with_bucket_settings(mut self, provider: impl Into<String>, settings: BucketSettings) -> Self {
        self.bucket_defaults.insert(provider.into(), settings);
        self
    }

    fn settings_for(&self, provider: &str) -> BucketSettings {
        self.bucket_defaults.get(provider).copied().unwrap_or_default()
    }

    /// Blocks cooperatively (sleeping, not busy-waiting) until a token is
    /// available for `key`, or returns `Transient` once `budget` is spent.
    async fn acquire(&self, key: &BucketKey, budget: Duration) -> ThrottleResult<()> {
        let deadline = Instant::now() + budget;
        loop {
            let wait = {
                let guard = self.buckets.read().await;
                if let Some(bucket) = guard.get(key) {
                    bucket.lock().await.wait_for_token()
                } else {
                    drop(guard);
                    let settings = self.settings_for(&key.provider);
                    let mut guard = self.buckets.write().await;
                    guard
                        .entry(key.clone())
                        .or_insert_with(|| Mutex::new(TokenBucket::new(settings)));
                    drop(guard);
                    let guard = self.buckets.read().await;
                    guard
                        .get(key)
                        .unwrap()
                        .lock()
                        .await
                        .wait_for_token()
                }
            };
            match wait {
                None => return Ok(()),
                Some(wait) => {
                    if Instant::now() + wait > deadline {
                        return Err(ThrottleError::Transient {
                            provider: key.provider.clone(),
                            endpoint_class: key.endpoint_class.clone(),
                            message: "budget exhausted waiting for a rate-limit token".into(),
                        });
                    }
                    sleep(wait).await;
                }
            }
        }
    }

    /// Runs `op` under the throttle, retrying per the configured policy.
    /// `refresh` is called at most once, on the first `401`.
    pub async fn execute<F, Fut, T, R, RFut>(
        &self,
        provider: &str,
        endpoint_class: &str,
        budget: Duration,
        op: F,
        refresh: R,
    ) -> ThrottleResult<T>
    where
        F: Fn(u32) -> Fut,
        Fut: Future<Output = Result<T, AttemptFailure>>,
        R: FnOnce() -> RFut,
        RFut: Future<Output = bool>,
    {
        let key = BucketKey::new(provider, endpoint_class);
        let deadline = Instant::now() + budget;
        let mut refreshed = false;
        let mut last_failure: Option<AttemptFailure> = None;

        for attempt in 1..=self.config.max_attempts {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() && attempt > 1 {
                break;
            }
            self.acquire(&key, remaining).await?;

            let span = info_span!("throttled_call", provider, endpoint_class, attempt);
            let outcome = op(attempt).instrument(span).await;

            match outcome {
                Ok(value) => return Ok(value),
                Err(failure) => {
                    warn!(
                        provider,
                        endpoint_class,
                        attempt,
                        status = failure.status,
                        retryable = failure.is_retryable(),
                        "throttled call attempt failed"
                    );

                    if failure.is_unauthorized() && !refreshed {
                        refreshed = true;
                        if refresh().await {
                            continue;
                        }
                        return Err(ThrottleError::Auth {
                            provider: provider.to_string(),
                            endpoint_class: endpoint_class.to_string(),
                            message: "credential refresh failed".into(),
                        });
                    }
                    if failure.is_unauthorized() {
                        return Err(ThrottleError::Auth {
                            provider: provider.to_string(),
                            endpoint_class: endpoint_class.to_string(),
                            message: "unauthorized after credential refresh".into(),
                        });
                    }

                    if !failure.is_retryable() {
                        return Err(classify_terminal(provider, endpoint_class, &failure));
                    }

                    if attempt < self.config.max_attempts {
                        let wait = failure
                            .retry_after
                            .unwrap_or_else(|| self.config.backoff_for(attempt));
                        last_failure = Some(failure);
                        sleep(wait).await;
                        continue;
                    }
                    last_failure = Some(failure);
                }
            }
        }

        let failure = last_failure.unwrap_or(AttemptFailure {
            status: None,
            transport: None,
            retry_after: None,
            message: "exhausted retries with no recorded failure".into(),
        });
        if failure.is_rate_limited() {
            Err(ThrottleError::RateLimited {
                provider: provider.to_string(),
                endpoint_class: endpoint_class.to_string(),
                message: failure.message,
            })
        } else {
            Err(ThrottleError::Transient {
                provider: provider.to_string(),
                endpoint_class: endpoint_class.to_string(),
                message: failure.message,
            })
        }
    }
}

fn classify_terminal(provider: &str, endpoint_class: &str, failure: &AttemptFailure) -> ThrottleError {
    match failure.status {
        Some(404) => ThrottleError::NotFound {
            provider: provider.to_string(),
            endpoint_class: endpoint_class.to_string(),
            message: failure.message.clone(),
        },
        Some(400) | Some(422) => ThrottleError::Invalid {
            provider: provider.to_string(),
            endpoint_class: endpoint_class.to_string(),
            message: failure.message.clone(),
        },
        _ => ThrottleError::Fatal {
            provider: provider.to_string(),
            endpoint_class: endpoint_class.to_string(),
            message: failure.message.clone(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::sync::atomic::Ordering;
    use std::sync::Arc;

    #[tokio::test]
    async fn succeeds_on_first_try_without_retry() {
        let client = ThrottledClient::new(ThrottleConfig::default());
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = calls.clone();

        let result = client
            .execute(
                "amazon",
                "metadata",
                Duration::from_secs(5),
                move |_attempt| {
                    calls_clone.fetch_add(1, Ordering::SeqCst);
                    async { Ok::<_, AttemptFailure>(42) }
                },
                || async { true },
            )
            .await
            .expect("call should succeed");

        assert_eq!(result, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retries_transient_failures_up_to_three_attempts() {
        let mut config = ThrottleConfig::default();
        config.base_backoff = Duration::from_millis(1);
        config.jitter_fraction = 0.0;
        let client = ThrottledClient::new(config);
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = calls.clone();

        let err = client
            .execute(
                "amazon",
                "reports",
                Duration::from_secs(5),
                move |_attempt| {
                    calls_clone.fetch_add(1, Ordering::SeqCst);
                    async {
                        Err::<(), _>(AttemptFailure {
                            status: Some(503),
                            transport: None,
                            retry_after: None,
                            message: "service unavailable".into(),
                        })
                    }
                },
                || async { true },
            )
            .await
            .unwrap_err();

        assert!(matches!(err, ThrottleError::Transient { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn honors_retry_after_on_429() {
        let mut config = ThrottleConfig::default();
        config.jitter_fraction = 0.0;
        let client = ThrottledClient::new(config);
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = calls.clone();
        let started = Instant::now();

        let err = client
            .execute(
                "amazon",
                "reports",
                Duration::from_secs(10),
                move |_attempt| {
                    calls_clone.fetch_add(1, Ordering::SeqCst);
                    async {
                        Err::<(), _>(AttemptFailure {
                            status: Some(429),
                            transport: None,
                            retry_after: Some(Duration::from_millis(20)),
                            message: "rate limited".into(),
                        })
                    }
                },
                || async { true },
            )
            .await
            .unwrap_err();

        assert!(matches!(err, ThrottleError::RateLimited { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(started.elapsed() >= Duration::from_millis(40));
    }

    #[tokio::test]
    async fn refreshes_credentials_once_on_401_then_fails_permanently_on_second() {
        let client = ThrottledClient::new(ThrottleConfig::default());
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = calls.clone();

        let err = client
            .execute(
                "amazon",
                "orders",
                Duration::from_secs(5),
                move |_attempt| {
                    calls_clone.fetch_add(1, Ordering::SeqCst);
                    async {
                        Err::<(), _>(AttemptFailure {
                            status: Some(401),
                            transport: None,
                            retry_after: None,
                            message: "unauthorized".into(),
                        })
                    }
                },
                || async { true },
            )
            .await
            .unwrap_err();

        assert!(matches!(err, ThrottleError::Auth { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn non_retryable_status_surfaces_immediately() {
        let client = ThrottledClient::new(ThrottleConfig::default());
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = calls.clone();

        let err = client
            .execute(
                "amazon",
                "orders",
                Duration::from_secs(5),
                move |_attempt| {
                    calls_clone.fetch_add(1, Ordering::SeqCst);
                    async {
                        Err::<(), _>(AttemptFailure {
                            status: Some(404),
                            transport: None,
                            retry_after: None,
                            message: "missing".into(),
                        })
                    }
                },
                || async { true },
            )
            .await
            .unwrap_err();

        assert!(matches!(err, ThrottleError::NotFound { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
