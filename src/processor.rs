//! Batch Processor (Component D): `Process(urls[], extractor) → BatchResult`.
//!
//! Validates and deduplicates the input list, then runs a bounded worker
//! pool over it. Each worker calls the fetcher (optionally through the
//! normalizer) for one URL, hands the response to the injected `Extractor`,
//! and writes a per-item outcome into a pre-sized, index-keyed slot so
//! results come back in input order regardless of completion order.

use crate::error::Outcome;
use crate::extract::Extractor;
use crate::fetcher::{FetchOptions, Fetcher};
use crate::normalizer::Normalizer;
use crate::retry::RetryPolicy;
use crate::{Backoff, Jitter};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{watch, Notify, Semaphore};
use url::Url;

const TRACKING_PARAMS: &[&str] = &["utm_source", "utm_medium", "utm_campaign", "utm_term", "utm_content", "fbclid", "gclid"];
const MAX_URL_LENGTH: usize = 2048;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Network,
    Timeout,
    RateLimitExhausted,
    Http4xx,
    Http5xx,
    Parse,
    Validation,
    Blocked,
    Unknown,
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Network => "network",
            Self::Timeout => "timeout",
            Self::RateLimitExhausted => "rate-limit-exhausted",
            Self::Http4xx => "http-4xx",
            Self::Http5xx => "http-5xx",
            Self::Parse => "parse",
            Self::Validation => "validation",
            Self::Blocked => "blocked",
            Self::Unknown => "unknown",
        };
        write!(f, "{s}")
    }
}

fn categorize(outcome: &Outcome) -> ErrorCategory {
    match outcome {
        Outcome::NetworkError { .. } => ErrorCategory::Network,
        Outcome::Timeout => ErrorCategory::Timeout,
        Outcome::RateLimited { .. } | Outcome::CircuitOpen => ErrorCategory::RateLimitExhausted,
        Outcome::ClientError { .. } => ErrorCategory::Http4xx,
        Outcome::ServerError { .. } => ErrorCategory::Http5xx,
        Outcome::Validation { reason } if reason.starts_with("blocked host") => ErrorCategory::Blocked,
        Outcome::Validation { .. } => ErrorCategory::Validation,
        Outcome::Success { .. } => ErrorCategory::Unknown,
    }
}

/// Reject obviously-unsafe or malformed input up front, before it ever
/// reaches the fetcher.
fn validate_url(raw: &str) -> Result<Url, String> {
    if raw.is_empty() {
        return Err("empty url".to_string());
    }
    if raw.len() > MAX_URL_LENGTH {
        return Err(format!("url exceeds length cap ({} > {MAX_URL_LENGTH})", raw.len()));
    }
    let lower = raw.trim().to_lowercase();
    if lower.starts_with("javascript:") || lower.starts_with("data:") {
        return Err("unsupported scheme".to_string());
    }
    let parsed = Url::parse(raw).map_err(|e| format!("invalid url: {e}"))?;
    if parsed.scheme() != "http" && parsed.scheme() != "https" {
        return Err(format!("unsupported scheme: {}", parsed.scheme()));
    }
    let Some(host) = parsed.host_str() else {
        return Err("url has no host".to_string());
    };
    if let Ok(addr) = host.parse::<std::net::IpAddr>() {
        if crate::ssrf::classify_ip(addr).is_some() {
            return Err("private host rejected".to_string());
        }
    }
    if host.eq_ignore_ascii_case("localhost") {
        return Err("private host rejected".to_string());
    }
    Ok(parsed)
}

/// Normalize a URL for dedup comparison: lowercase scheme/host, strip
/// default ports, strip fragment and tracking params, drop a non-root
/// trailing slash.
fn dedup_key(url: &Url) -> String {
    let mut normalized = url.clone();
    let _ = normalized.set_scheme(&url.scheme().to_lowercase());
    if let Some(host) = url.host_str() {
        let _ = normalized.set_host(Some(&host.to_lowercase()));
    }
    normalized.set_fragment(None);

    let is_default_port = matches!((url.scheme(), url.port()), ("https", Some(443)) | ("http", Some(80)));
    if is_default_port {
        let _ = normalized.set_port(None);
    }

    let retained: Vec<(String, String)> = normalized
        .query_pairs()
        .filter(|(k, _)| !TRACKING_PARAMS.contains(&k.to_lowercase().as_str()))
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    if retained.is_empty() {
        normalized.set_query(None);
    } else {
        normalized.query_pairs_mut().clear().extend_pairs(&retained);
    }

    if normalized.path().len() > 1 && normalized.path().ends_with('/') {
        let trimmed = normalized.path().trim_end_matches('/').to_string();
        normalized.set_path(&trimmed);
    }

    normalized.to_string()
}

#[derive(Debug, Clone)]
pub struct ValidationReport {
    pub accepted: usize,
    pub rejected: usize,
    pub duplicates: usize,
    pub truncated: usize,
}

#[derive(Debug, Clone)]
pub struct ItemFailure {
    pub index: usize,
    pub url: String,
    pub category: ErrorCategory,
    pub message: String,
}

#[derive(Debug, Clone)]
pub struct ItemOutcome {
    pub index: usize,
    pub url: String,
    pub record: Option<Value>,
    pub failure: Option<ItemFailure>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProgressEvent {
    pub phase: Phase,
    pub completed: usize,
    pub total: usize,
    pub percentage: f64,
    pub errors: usize,
    pub estimated_time_remaining_ms: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Phase {
    Validating,
    Running,
    Paused,
    Completed,
    Stopped,
    Failed,
}

#[derive(Debug, Clone)]
pub struct BatchResult {
    pub validation: ValidationReport,
    pub items: Vec<ItemOutcome>,
    pub category_counts: Vec<(ErrorCategory, usize)>,
    pub host_failure_counts: Vec<(String, usize)>,
    pub failure_sample: Vec<ItemFailure>,
    pub recommendations: Vec<String>,
    pub phase: Phase,
}

#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    pub concurrency: usize,
    pub max_retries: usize,
    pub input_cap: usize,
    pub error_sample_cap: usize,
    pub graceful_shutdown_timeout: Duration,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            concurrency: 10,
            max_retries: 3,
            input_cap: 1500,
            error_sample_cap: 50,
            graceful_shutdown_timeout: Duration::from_secs(30),
        }
    }
}

struct Shared {
    cancelled: AtomicBool,
    paused: AtomicBool,
    resume_notify: Notify,
    cursor: AtomicUsize,
    completed: AtomicUsize,
    errors: AtomicUsize,
}

/// Handle for controlling a running batch: pause/resume/cancel and a
/// progress feed.
pub struct BatchHandle {
    shared: Arc<Shared>,
    pub progress: watch::Receiver<ProgressEvent>,
}

impl BatchHandle {
    pub fn pause(&self) {
        self.shared.paused.store(true, Ordering::Release);
    }

    pub fn resume(&self) {
        self.shared.paused.store(false, Ordering::Release);
        self.shared.resume_notify.notify_waiters();
    }

    pub fn cancel(&self) {
        self.shared.cancelled.store(true, Ordering::Release);
        self.shared.resume_notify.notify_waiters();
    }
}

pub struct Processor {
    fetcher: Arc<Fetcher>,
    normalizer: Option<Arc<Normalizer>>,
    config: ProcessorConfig,
}

impl Processor {
    pub fn new(fetcher: Arc<Fetcher>, config: ProcessorConfig) -> Self {
        Self { fetcher, normalizer: None, config }
    }

    pub fn with_normalizer(mut self, normalizer: Arc<Normalizer>) -> Self {
        self.normalizer = Some(normalizer);
        self
    }

    fn validate_and_dedup(&self, urls: &[String]) -> (Vec<(usize, Url)>, ValidationReport) {
        let mut seen = HashSet::new();
        let mut accepted = Vec::new();
        let mut rejected = 0usize;
        let mut duplicates = 0usize;

        let capped: &[String] = if urls.len() > self.config.input_cap { &urls[..self.config.input_cap] } else { urls };
        let truncated = urls.len().saturating_sub(capped.len());

        for raw in capped {
            match validate_url(raw) {
                Ok(parsed) => {
                    let key = dedup_key(&parsed);
                    if !seen.insert(key) {
                        duplicates += 1;
                        continue;
                    }
                    accepted.push(parsed);
                }
                Err(_) => rejected += 1,
            }
        }

        let report = ValidationReport { accepted: accepted.len(), rejected, duplicates, truncated };
        (accepted.into_iter().enumerate().collect(), report)
    }

    /// Run the batch to completion in the caller's own task. Equivalent to
    /// awaiting the join handle from [`Self::spawn`] directly.
    pub async fn run(&self, urls: &[String], extractor: Arc<dyn Extractor>) -> BatchResult {
        let (_handle, join) = self.spawn(urls, extractor);
        join.await.expect("batch worker task panicked")
    }

    /// Start the batch on a background task and return a [`BatchHandle`] for
    /// pause/resume/cancel plus a join handle yielding the final result.
    pub fn spawn(
        &self,
        urls: &[String],
        extractor: Arc<dyn Extractor>,
    ) -> (BatchHandle, tokio::task::JoinHandle<BatchResult>) {
        let (accepted, validation) = self.validate_and_dedup(urls);
        let total = accepted.len();
        let work: Arc<Vec<(usize, Url)>> = Arc::new(accepted);

        let shared = Arc::new(Shared {
            cancelled: AtomicBool::new(false),
            paused: AtomicBool::new(false),
            resume_notify: Notify::new(),
            cursor: AtomicUsize::new(0),
            completed: AtomicUsize::new(0),
            errors: AtomicUsize::new(0),
        });

        let slots: Arc<Mutex<Vec<Option<ItemOutcome>>>> = Arc::new(Mutex::new((0..total).map(|_| None).collect()));
        let durations: Arc<Mutex<Vec<Duration>>> = Arc::new(Mutex::new(Vec::new()));
        let (progress_tx, progress_rx) = watch::channel(ProgressEvent {
            phase: Phase::Running,
            completed: 0,
            total,
            percentage: 0.0,
            errors: 0,
            estimated_time_remaining_ms: None,
        });

        let semaphore = Arc::new(Semaphore::new(self.config.concurrency.max(1)));
        let retry_policy = Arc::new(
            RetryPolicy::<Outcome>::builder()
                .max_attempts(self.config.max_retries.max(1))
                .expect("configured concurrency is > 0")
                .backoff(Backoff::exponential(Duration::from_millis(200)))
                .with_jitter(Jitter::full())
                .should_retry(Outcome::is_retryable)
                .build(),
        );

        let concurrency = self.config.concurrency.max(1);
        let graceful_shutdown_timeout = self.config.graceful_shutdown_timeout;
        let error_sample_cap = self.config.error_sample_cap;
        let fetcher = self.fetcher.clone();
        let normalizer = self.normalizer.clone();

        let handle = BatchHandle { shared: shared.clone(), progress: progress_rx };

        let join = tokio::spawn(async move {
            let mut handles = Vec::with_capacity(concurrency);
            for _ in 0..concurrency {
                let shared = shared.clone();
                let work = work.clone();
                let slots = slots.clone();
                let durations = durations.clone();
                let progress_tx = progress_tx.clone();
                let semaphore = semaphore.clone();
                let retry_policy = retry_policy.clone();
                let fetcher = fetcher.clone();
                let normalizer = normalizer.clone();
                let extractor = extractor.clone();

                let task = async move {
                    loop {
                        if shared.cancelled.load(Ordering::Acquire) {
                            break;
                        }
                        while shared.paused.load(Ordering::Acquire) && !shared.cancelled.load(Ordering::Acquire) {
                            shared.resume_notify.notified().await;
                        }

                        let index = shared.cursor.fetch_add(1, Ordering::AcqRel);
                        if index >= work.len() {
                            break;
                        }

                        let _permit = semaphore.acquire().await.expect("semaphore not closed");
                        let (original_index, url) = &work[index];
                        let started = Instant::now();

                        let outcome = run_one(*original_index, &fetcher, normalizer.as_deref(), &retry_policy, &extractor, url).await;
                        let elapsed = started.elapsed();

                        {
                            let mut d = durations.lock().unwrap_or_else(|p| p.into_inner());
                            d.push(elapsed);
                            if d.len() > 64 {
                                d.remove(0);
                            }
                        }

                        let completed_so_far = shared.completed.fetch_add(1, Ordering::AcqRel) + 1;
                        if outcome.failure.is_some() {
                            shared.errors.fetch_add(1, Ordering::AcqRel);
                        }

                        {
                            let mut s = slots.lock().unwrap_or_else(|p| p.into_inner());
                            s[*original_index] = Some(outcome);
                        }

                        let avg_ms = {
                            let d = durations.lock().unwrap_or_else(|p| p.into_inner());
                            if d.is_empty() { 0.0 } else { d.iter().map(|x| x.as_millis() as f64).sum::<f64>() / d.len() as f64 }
                        };
                        let remaining = total.saturating_sub(completed_so_far);
                        let eta_ms = if completed_so_far > 0 { Some((avg_ms * remaining as f64) as u64) } else { None };

                        let _ = progress_tx.send(ProgressEvent {
                            phase: Phase::Running,
                            completed: completed_so_far,
                            total,
                            percentage: if total == 0 { 100.0 } else { (completed_so_far as f64 / total as f64) * 100.0 },
                            errors: shared.errors.load(Ordering::Acquire),
                            estimated_time_remaining_ms: eta_ms,
                        });
                    }
                };
                handles.push(tokio::spawn(task));
            }

            let join_all = futures::future::join_all(handles);
            if tokio::time::timeout(graceful_shutdown_timeout, join_all).await.is_err() {
                shared.cancelled.store(true, Ordering::Release);
                tracing::warn!("graceful shutdown timeout elapsed, workers aborted");
            }

            let cancelled = shared.cancelled.load(Ordering::Acquire);
            let items: Vec<ItemOutcome> = slots
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .drain(..)
                .enumerate()
                .map(|(index, slot)| {
                    slot.unwrap_or_else(|| {
                        let url = work.get(index).map(|(_, u)| u.to_string()).unwrap_or_default();
                        ItemOutcome {
                            index,
                            url: url.clone(),
                            record: None,
                            failure: Some(ItemFailure {
                                index,
                                url,
                                category: ErrorCategory::Unknown,
                                message: "cancelled before processing".to_string(),
                            }),
                        }
                    })
                })
                .collect();

            let (category_counts, host_failure_counts, failure_sample) = summarize_failures(&items, error_sample_cap);
            let recommendations = recommend(&category_counts, total);

            let phase = if cancelled { Phase::Stopped } else { Phase::Completed };
            let _ = progress_tx.send(ProgressEvent {
                phase,
                completed: shared.completed.load(Ordering::Acquire),
                total,
                percentage: 100.0,
                errors: shared.errors.load(Ordering::Acquire),
                estimated_time_remaining_ms: Some(0),
            });

            BatchResult { validation, items, category_counts, host_failure_counts, failure_sample, recommendations, phase }
        });

        (handle, join)
    }
}

async fn run_one(
    index: usize,
    fetcher: &Fetcher,
    normalizer: Option<&Normalizer>,
    retry_policy: &RetryPolicy<Outcome>,
    extractor: &Arc<dyn Extractor>,
    url: &Url,
) -> ItemOutcome {
    let mut url_str = url.to_string();
    if let Some(normalizer) = normalizer {
        if let Some(canonical) = normalizer.canonicalize(&url_str).await.canonical_url {
            url_str = canonical;
        }
    }

    let result = retry_policy
        .execute(|_attempt| {
            let fetcher = fetcher;
            let url_str = url_str.clone();
            async move {
                match fetcher.fetch(&url_str, &FetchOptions::default()).await {
                    Outcome::Success { response } => Ok(response),
                    other => Err(other),
                }
            }
        })
        .await;

    match result {
        Ok(response) => match extractor.extract(&url_str, &response) {
            Ok(record) => ItemOutcome { index, url: url_str, record: Some(record.data), failure: None },
            Err(e) => ItemOutcome {
                index,
                url: url_str.clone(),
                record: None,
                failure: Some(ItemFailure { index, url: url_str, category: ErrorCategory::Parse, message: e.reason }),
            },
        },
        Err(exhausted) => {
            let message = exhausted.to_string();
            let category = exhausted.failures.last().map(categorize).unwrap_or(ErrorCategory::Unknown);
            ItemOutcome {
                index,
                url: url_str.clone(),
                record: None,
                failure: Some(ItemFailure { index, url: url_str, category, message }),
            }
        }
    }
}

fn summarize_failures(items: &[ItemOutcome], sample_cap: usize) -> (Vec<(ErrorCategory, usize)>, Vec<(String, usize)>, Vec<ItemFailure>) {
    let mut category_counts: Vec<(ErrorCategory, usize)> = Vec::new();
    let mut host_counts: std::collections::HashMap<String, usize> = std::collections::HashMap::new();
    let mut sample = Vec::new();

    for item in items {
        let Some(failure) = &item.failure else { continue };
        if let Some(entry) = category_counts.iter_mut().find(|(c, _)| *c == failure.category) {
            entry.1 += 1;
        } else {
            category_counts.push((failure.category, 1));
        }

        if let Ok(parsed) = Url::parse(&item.url) {
            if let Some(host) = parsed.host_str() {
                *host_counts.entry(host.to_string()).or_insert(0) += 1;
            }
        }

        if sample.len() < sample_cap {
            sample.push(failure.clone());
        }
    }

    let host_failure_counts: Vec<(String, usize)> = host_counts.into_iter().collect();
    (category_counts, host_failure_counts, sample)
}

fn recommend(category_counts: &[(ErrorCategory, usize)], total: usize) -> Vec<String> {
    if total == 0 {
        return Vec::new();
    }
    let mut recommendations = Vec::new();
    for (category, count) in category_counts {
        let ratio = *count as f64 / total as f64;
        if ratio < 0.1 {
            continue;
        }
        let suggestion = match category {
            ErrorCategory::Timeout => "raise the per-request timeout",
            ErrorCategory::RateLimitExhausted => "reduce concurrency or raise host rate limits",
            ErrorCategory::Blocked => "check the host denylist configuration",
            ErrorCategory::Network => "verify DNS and connectivity to affected hosts",
            ErrorCategory::Http5xx => "the origin is degraded; consider backing off",
            _ => continue,
        };
        recommendations.push(suggestion.to_string());
    }
    recommendations
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_javascript_and_data_urls() {
        assert!(validate_url("javascript:alert(1)").is_err());
        assert!(validate_url("data:text/plain,hello").is_err());
    }

    #[test]
    fn rejects_empty_and_oversized_urls() {
        assert!(validate_url("").is_err());
        let long = format!("https://example.com/{}", "a".repeat(MAX_URL_LENGTH));
        assert!(validate_url(&long).is_err());
    }

    #[test]
    fn rejects_private_host() {
        assert!(validate_url("http://127.0.0.1/").is_err());
        assert!(validate_url("http://localhost/").is_err());
    }

    #[test]
    fn accepts_public_https_url() {
        assert!(validate_url("https://example.com/path").is_ok());
    }

    #[test]
    fn dedup_key_strips_default_port_and_tracking_params() {
        let a = Url::parse("https://Example.com:443/path/?utm_source=x&id=1").unwrap();
        let b = Url::parse("https://example.com/path?id=1").unwrap();
        assert_eq!(dedup_key(&a), dedup_key(&b));
    }

    #[test]
    fn dedup_key_preserves_root_slash() {
        let root = Url::parse("https://example.com/").unwrap();
        assert!(dedup_key(&root).ends_with('/'));
    }

    #[test]
    fn categorizes_rate_limited_and_circuit_open_together() {
        assert_eq!(categorize(&Outcome::RateLimited { retry_after: None }), ErrorCategory::RateLimitExhausted);
        assert_eq!(categorize(&Outcome::CircuitOpen), ErrorCategory::RateLimitExhausted);
    }

    #[test]
    fn recommend_skips_low_ratio_categories() {
        let counts = vec![(ErrorCategory::Timeout, 1)];
        assert!(recommend(&counts, 100).is_empty());
    }

    #[test]
    fn recommend_flags_high_ratio_timeout() {
        let counts = vec![(ErrorCategory::Timeout, 50)];
        let recs = recommend(&counts, 100);
        assert!(recs.iter().any(|r| r.contains("timeout")));
    }
}
