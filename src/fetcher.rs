//! Resilient Fetcher (Component B): `Fetch(url, options) → Outcome`.
//!
//! Every fetch — including canonicalization preflights — goes through the
//! same guarded path: breaker check, rate-limit token, SSRF/rebind guard,
//! attempt-scoped timeout, manual redirect handling, and response hygiene.
//! There is no "trusted URL" shortcut, per the hardened-client resolution in
//! the design notes.

use crate::clock::SharedClock;
use crate::error::{FetchResponse, Outcome};
use crate::metrics::Metrics;
use crate::registry::{normalize_host, AcquireError, HostRegistry};
use crate::ssrf::{self, RebindCheck, ResolvedAddressCache};
use bytes::Bytes;
use reqwest::Method;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "set-cookie",
];

#[derive(Debug, Clone)]
pub struct FetchOptions {
    pub method: Method,
    pub timeout: Duration,
    pub max_retries: usize,
    pub headers: Vec<(String, String)>,
    pub correlation_id: Option<String>,
    pub max_body_bytes: Option<u64>,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            method: Method::GET,
            timeout: Duration::from_millis(15_000),
            max_retries: 3,
            headers: Vec::new(),
            correlation_id: None,
            max_body_bytes: None,
        }
    }
}

pub struct Fetcher {
    client: reqwest::Client,
    registry: Arc<HostRegistry>,
    metrics: Arc<Metrics>,
    denylist_suffixes: Vec<String>,
    block_downgrade: bool,
    default_max_body_bytes: u64,
    max_redirects: u8,
    address_cache: ResolvedAddressCache,
    clock: SharedClock,
}

impl Fetcher {
    pub fn new(
        registry: Arc<HostRegistry>,
        metrics: Arc<Metrics>,
        security: &crate::config::FetchSecurityConfig,
        clock: SharedClock,
    ) -> reqwest::Result<Self> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .use_rustls_tls()
            .gzip(true)
            .brotli(true)
            .build()?;

        Ok(Self {
            client,
            registry,
            metrics,
            denylist_suffixes: security.denylist_suffixes.clone(),
            block_downgrade: security.block_downgrade,
            default_max_body_bytes: security.max_body_bytes,
            max_redirects: security.max_redirects,
            address_cache: ResolvedAddressCache::new(Duration::from_secs(60), clock.clone()),
            clock,
        })
    }

    fn validate(&self, url: &str, options: &FetchOptions) -> Result<Url, String> {
        let parsed = Url::parse(url).map_err(|e| format!("invalid url: {e}"))?;
        if parsed.scheme() != "http" && parsed.scheme() != "https" {
            return Err(format!("unsupported scheme: {}", parsed.scheme()));
        }
        if parsed.host_str().is_none() {
            return Err("url has no host".to_string());
        }
        if options.timeout < Duration::from_millis(100) || options.timeout > Duration::from_secs(60) {
            return Err("timeout must be between 100ms and 60000ms".to_string());
        }
        if options.max_retries > 10 {
            return Err("max_retries must be <= 10".to_string());
        }
        Ok(parsed)
    }

    async fn resolve_and_guard(&self, url: &Url) -> Result<IpAddr, Outcome> {
        let host = url.host_str().unwrap_or_default();
        let port = url.port_or_known_default().unwrap_or(if url.scheme() == "https" { 443 } else { 80 });

        let mut addrs = tokio::net::lookup_host((host, port))
            .await
            .map_err(|e| Outcome::NetworkError { cause: format!("dns resolution failed: {e}") })?;

        let resolved = addrs.next().ok_or_else(|| Outcome::NetworkError { cause: "no addresses resolved".into() })?;
        let addr = resolved.ip();

        if let Err(reason) = ssrf::check(host, addr, &self.denylist_suffixes) {
            tracing::warn!(host, %reason, "blocked host before dial");
            return Err(Outcome::Validation { reason: format!("blocked host: {reason}") });
        }

        match self.address_cache.check_rebind(host, addr) {
            RebindCheck::Mismatch => {
                self.address_cache.invalidate(host);
                if ssrf::classify_ip(addr).is_some() {
                    return Err(Outcome::Validation { reason: "dns rebind to private address".into() });
                }
            }
            RebindCheck::Consistent | RebindCheck::NoCacheEntry => {}
        }
        self.address_cache.record(host, addr);

        Ok(addr)
    }

    pub async fn fetch(&self, url: &str, options: &FetchOptions) -> Outcome {
        let parsed = match self.validate(url, options) {
            Ok(u) => u,
            Err(reason) => return Outcome::Validation { reason },
        };

        let host_key = normalize_host(parsed.host_str().unwrap_or_default(), parsed.port(), parsed.scheme() == "https");
        let mut attempt = 0usize;

        loop {
            let started = self.clock.now_millis();
            self.metrics.request_started(&host_key);
            let outcome = self.attempt_once(&parsed, options, &host_key).await;
            let elapsed = Duration::from_millis(self.clock.now_millis().saturating_sub(started));
            self.metrics.request_finished(&host_key, &outcome, elapsed);

            if !outcome.is_retryable() || attempt >= options.max_retries {
                return outcome;
            }

            let delay = self.retry_delay(&outcome, attempt, &host_key);
            self.metrics.retry_scheduled(&host_key);
            tracing::debug!(attempt, delay_ms = delay.as_millis() as u64, url, "scheduling retry");
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    fn retry_delay(&self, outcome: &Outcome, attempt: usize, host_key: &str) -> Duration {
        let policy = self.registry.get_policy(host_key);
        if let Outcome::RateLimited { retry_after: Some(d) } = outcome {
            return (*d).clamp(policy.base_backoff, policy.max_backoff);
        }
        let base = policy.base_backoff.checked_mul(1u32.checked_shl(attempt as u32).unwrap_or(u32::MAX)).unwrap_or(policy.max_backoff);
        let capped = base.min(policy.max_backoff);
        crate::jitter::Jitter::factor(policy.jitter_factor).apply(capped)
    }

    async fn attempt_once(&self, url: &Url, options: &FetchOptions, host_key: &str) -> Outcome {
        let policy = self.registry.get_policy(host_key);
        let state = self.registry.host_state(host_key);
        let (_, _in_flight_guard, permit) = match self.registry.try_acquire(host_key, options.timeout).await {
            Ok(acquired) => acquired,
            Err(AcquireError::CircuitOpen(_)) => return Outcome::CircuitOpen,
            Err(AcquireError::TokenWaitTimedOut) => return Outcome::Timeout,
        };

        let deadline = policy.deadline.min(options.timeout);
        let timeout_policy = crate::timeout::TimeoutPolicy::new(deadline).expect("validated above");

        match timeout_policy.run(self.follow_redirects(url.clone(), options)).await {
            Ok(outcome) => {
                if outcome.counts_as_breaker_failure() {
                    state.breaker.record_failure(permit);
                } else {
                    state.breaker.record_success(permit);
                }
                outcome
            }
            Err(elapsed) => {
                state.breaker.record_failure(permit);
                tracing::warn!(host = host_key, elapsed_ms = elapsed.elapsed.as_millis() as u64, "fetch attempt timed out");
                Outcome::Timeout
            }
        }
    }

    async fn follow_redirects(&self, mut url: Url, options: &FetchOptions) -> Outcome {
        let mut hops = 0u8;
        loop {
            if let Err(outcome) = self.resolve_and_guard(&url).await {
                return outcome;
            }

            let mut request = self.client.request(options.method.clone(), url.clone());
            for (name, value) in &options.headers {
                request = request.header(name, value);
            }

            let response = match request.send().await {
                Ok(r) => r,
                Err(e) => return Outcome::NetworkError { cause: e.to_string() },
            };

            let status = response.status();
            if status.is_redirection() {
                hops += 1;
                if hops > self.max_redirects {
                    return Outcome::NetworkError { cause: "too many redirects".into() };
                }
                let Some(location) = response.headers().get(reqwest::header::LOCATION).and_then(|v| v.to_str().ok())
                else {
                    return Outcome::NetworkError { cause: "redirect missing location".into() };
                };
                let next = match url.join(location) {
                    Ok(u) => u,
                    Err(e) => return Outcome::NetworkError { cause: format!("bad redirect location: {e}") },
                };
                if self.block_downgrade && url.scheme() == "https" && next.scheme() == "http" {
                    return Outcome::Validation { reason: "https to http downgrade blocked".into() };
                }
                url = next;
                continue;
            }

            return self.classify_response(response, options).await;
        }
    }

    async fn classify_response(&self, response: reqwest::Response, options: &FetchOptions) -> Outcome {
        let status = response.status();
        let final_url = response.url().to_string();

        if status.as_u16() == 429 {
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(parse_retry_after);
            return Outcome::RateLimited { retry_after };
        }

        if status.is_server_error() {
            return Outcome::ServerError { status: status.as_u16() };
        }

        if status.is_client_error() {
            return Outcome::ClientError { status: status.as_u16() };
        }

        let max_body = options.max_body_bytes.unwrap_or(self.default_max_body_bytes);
        if let Some(len) = response.content_length() {
            if len > max_body {
                return Outcome::Validation { reason: format!("response body exceeds cap ({len} > {max_body})") };
            }
        }

        let headers = strip_hop_by_hop(&response);
        let body = match read_body_capped(response, max_body).await {
            Ok(b) => b,
            Err(reason) => return Outcome::Validation { reason },
        };

        Outcome::Success { response: FetchResponse { status: status.as_u16(), final_url, headers, body } }
    }
}

fn strip_hop_by_hop(response: &reqwest::Response) -> Vec<(String, String)> {
    response
        .headers()
        .iter()
        .filter(|(name, _)| !HOP_BY_HOP_HEADERS.contains(&name.as_str().to_lowercase().as_str()))
        .filter_map(|(name, value)| value.to_str().ok().map(|v| (name.to_string(), v.to_string())))
        .collect()
}

async fn read_body_capped(response: reqwest::Response, max_body: u64) -> Result<Bytes, String> {
    let bytes = response.bytes().await.map_err(|e| format!("failed reading body: {e}"))?;
    if bytes.len() as u64 > max_body {
        return Err(format!("response body exceeds cap ({} > {})", bytes.len(), max_body));
    }
    Ok(bytes)
}

/// Parse `Retry-After` as either a delta-seconds integer or an HTTP-date.
/// A date in the past clamps to zero rather than going negative.
fn parse_retry_after(raw: &str) -> Option<Duration> {
    if let Ok(secs) = raw.trim().parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    httpdate::parse_http_date(raw.trim()).ok().map(|when| {
        when.duration_since(std::time::SystemTime::now()).unwrap_or(Duration::ZERO)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_numeric_retry_after() {
        assert_eq!(parse_retry_after("120"), Some(Duration::from_secs(120)));
    }

    #[test]
    fn rejects_garbage_retry_after() {
        assert_eq!(parse_retry_after("not-a-date"), None);
    }

    #[test]
    fn past_http_date_clamps_to_zero() {
        let past = "Sun, 06 Nov 1994 08:49:37 GMT";
        assert_eq!(parse_retry_after(past), Some(Duration::ZERO));
    }
}
