//! Host Policy Registry (Component A).
//!
//! A `DashMap<HostKey, Arc<HostState>>` — the same sharded, cross-lock-free
//! shape the single-id `CircuitBreakerRegistry` this crate descends from
//! already used, generalized from a bare `String` id to a normalized host
//! key, and bundling a token bucket and a per-host concurrency bulkhead
//! alongside the breaker rather than just the breaker alone.

use crate::bulkhead::BulkheadPolicy;
use crate::circuit_breaker::{CircuitBreakerConfig, CircuitBreakerPolicy};
use crate::clock::SharedClock;
use crate::config::{Config, HostOverride};
use crate::token_bucket::TokenBucket;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

pub type HostKey = String;

/// Normalize a hostname for use as a registry key: lowercase, default-port
/// stripped.
pub fn normalize_host(host: &str, port: Option<u16>, is_https: bool) -> HostKey {
    let host = host.to_lowercase();
    match port {
        Some(p) if (is_https && p == 443) || (!is_https && p == 80) => host,
        Some(p) => format!("{host}:{p}"),
        None => host,
    }
}

#[derive(Clone, Copy, Debug)]
pub struct HostPolicy {
    pub rps: f64,
    pub burst: f64,
    pub concurrency: usize,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    pub jitter_factor: f64,
    pub max_retries: usize,
    pub deadline: Duration,
    pub breaker_threshold: usize,
    pub breaker_reset_after: Duration,
    pub half_open_max_calls: usize,
}

impl HostPolicy {
    fn from_config(config: &Config, host: &str) -> Self {
        let mut policy = Self {
            rps: config.http.rate_limit_per_sec,
            burst: config.http.rate_limit_per_sec.max(1.0),
            concurrency: config.http.max_concurrency,
            base_backoff: config.http.base_backoff,
            max_backoff: config.http.max_backoff,
            jitter_factor: config.http.jitter_factor,
            max_retries: config.http.max_retries,
            deadline: config.http.deadline,
            breaker_threshold: config.http.circuit_breaker_threshold,
            breaker_reset_after: config.http.circuit_breaker_reset,
            half_open_max_calls: config.http.circuit_breaker_half_open_max_calls,
        };

        if let Some(HostOverride { rps, burst }) = config.host_overrides.get(host) {
            if let Some(rps) = rps {
                policy.rps = *rps;
            }
            if let Some(burst) = burst {
                policy.burst = *burst;
            }
        }

        policy
    }
}

pub struct HostState {
    pub policy: HostPolicy,
    pub limiter: TokenBucket,
    pub breaker: CircuitBreakerPolicy,
    pub bulkhead: BulkheadPolicy,
    last_touched_millis: AtomicU64,
    in_flight: AtomicUsize,
}

impl HostState {
    fn new(policy: HostPolicy, clock: SharedClock) -> Self {
        Self {
            limiter: TokenBucket::new(policy.burst, policy.rps, clock.clone()),
            breaker: CircuitBreakerPolicy::with_config(CircuitBreakerConfig {
                failure_threshold: policy.breaker_threshold,
                recovery_timeout: policy.breaker_reset_after,
                half_open_max_calls: policy.half_open_max_calls,
            })
            .with_clock(clock.clone()),
            bulkhead: BulkheadPolicy::new(policy.concurrency),
            policy,
            last_touched_millis: AtomicU64::new(clock.now_millis()),
            in_flight: AtomicUsize::new(0),
        }
    }

    fn touch(&self, clock: &SharedClock) {
        self.last_touched_millis.store(clock.now_millis(), Ordering::Release);
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }
}

/// RAII guard incrementing/decrementing a host's in-flight counter so the
/// idle sweeper can observe zero in-flight atomically.
pub struct InFlightGuard {
    state: Arc<HostState>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.state.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum AcquireError {
    #[error(transparent)]
    CircuitOpen(#[from] crate::circuit_breaker::CircuitOpen),
    #[error("timed out waiting for a rate-limit token")]
    TokenWaitTimedOut,
}

pub struct HostRegistry {
    hosts: DashMap<HostKey, Arc<HostState>>,
    config: Arc<Config>,
    clock: SharedClock,
    ttl: Duration,
    sweep_interval: Duration,
    shutdown: Arc<AtomicBool>,
    shutdown_notify: Arc<Notify>,
}

impl HostRegistry {
    pub fn new(config: Arc<Config>, clock: SharedClock) -> Arc<Self> {
        Self::with_ttl(config, clock, Duration::from_secs(20 * 60))
    }

    pub fn with_ttl(config: Arc<Config>, clock: SharedClock, ttl: Duration) -> Arc<Self> {
        let registry = Arc::new(Self {
            hosts: DashMap::new(),
            config,
            clock,
            ttl,
            sweep_interval: ttl / 5,
            shutdown: Arc::new(AtomicBool::new(false)),
            shutdown_notify: Arc::new(Notify::new()),
        });
        registry.clone().spawn_sweeper();
        registry
    }

    fn entry(&self, host: &str) -> Arc<HostState> {
        let key = host.to_string();
        if let Some(state) = self.hosts.get(&key) {
            state.touch(&self.clock);
            return state.clone();
        }
        let policy = HostPolicy::from_config(&self.config, host);
        let state = Arc::new(HostState::new(policy, self.clock.clone()));
        self.hosts.entry(key).or_insert(state).clone()
    }

    pub fn get_policy(&self, host: &str) -> HostPolicy {
        self.entry(host).policy
    }

    /// Fetch (creating on first use) the shared state for a host: its
    /// limiter, breaker, and bulkhead.
    pub fn host_state(&self, host: &str) -> Arc<HostState> {
        self.entry(host)
    }

    /// Acquire the per-host resources for one logical request: proof the
    /// breaker admits the call, then a rate-limit token bounded by
    /// `token_wait_budget` (the remainder of the caller's deadline), then an
    /// in-flight slot.
    pub async fn try_acquire(
        &self,
        host: &str,
        token_wait_budget: Duration,
    ) -> Result<(Arc<HostState>, InFlightGuard, crate::circuit_breaker::CircuitPermit), AcquireError> {
        let state = self.entry(host);
        let permit = state.breaker.try_acquire().map_err(AcquireError::CircuitOpen)?;
        tokio::time::timeout(token_wait_budget, state.limiter.acquire())
            .await
            .map_err(|_| AcquireError::TokenWaitTimedOut)?;
        state.in_flight.fetch_add(1, Ordering::AcqRel);
        Ok((state.clone(), InFlightGuard { state: state.clone() }, permit))
    }

    pub fn host_count(&self) -> usize {
        self.hosts.len()
    }

    fn spawn_sweeper(self: Arc<Self>) {
        let sweep_interval = self.sweep_interval.max(Duration::from_secs(1));
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(sweep_interval) => {}
                    _ = self.shutdown_notify.notified() => break,
                }
                if self.shutdown.load(Ordering::Acquire) {
                    break;
                }
                self.sweep_idle();
            }
        });
    }

    fn sweep_idle(&self) {
        let now = self.clock.now_millis();
        let ttl_millis = self.ttl.as_millis() as u64;
        self.hosts.retain(|_host, state| {
            let idle = now.saturating_sub(state.last_touched_millis.load(Ordering::Acquire));
            !(idle >= ttl_millis && state.in_flight() == 0)
        });
    }

    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.shutdown_notify.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn registry(ttl: Duration) -> (Arc<HostRegistry>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new());
        let config = Arc::new(Config::default());
        let registry = HostRegistry::with_ttl(config, clock.clone(), ttl);
        (registry, clock)
    }

    #[test]
    fn normalize_host_strips_default_ports() {
        assert_eq!(normalize_host("Example.com", Some(443), true), "example.com");
        assert_eq!(normalize_host("Example.com", Some(8443), true), "example.com:8443");
        assert_eq!(normalize_host("Example.com", Some(80), false), "example.com");
    }

    #[tokio::test]
    async fn lookup_is_create_on_miss_and_idempotent() {
        let (registry, _clock) = registry(Duration::from_secs(60));
        assert_eq!(registry.host_count(), 0);
        let _ = registry.get_policy("example.com");
        let _ = registry.get_policy("example.com");
        assert_eq!(registry.host_count(), 1);
    }

    #[tokio::test]
    async fn host_override_changes_rps() {
        let mut config = Config::default();
        config
            .host_overrides
            .0
            .insert("slow.example".to_string(), HostOverride { rps: Some(0.5), burst: Some(1.0) });
        let clock = Arc::new(ManualClock::new());
        let registry = HostRegistry::with_ttl(Arc::new(config), clock, Duration::from_secs(60));

        let policy = registry.get_policy("slow.example");
        assert_eq!(policy.rps, 0.5);
        let default_policy = registry.get_policy("other.example");
        assert_ne!(default_policy.rps, 0.5);
    }

    #[tokio::test]
    async fn sweep_removes_idle_entries_past_ttl() {
        let clock = Arc::new(ManualClock::new());
        let config = Arc::new(Config::default());
        let registry = HostRegistry::with_ttl(config, clock.clone(), Duration::from_millis(100));
        let _ = registry.get_policy("example.com");
        assert_eq!(registry.host_count(), 1);

        clock.advance(200);
        registry.sweep_idle();
        assert_eq!(registry.host_count(), 0);
    }

    #[tokio::test]
    async fn sweep_keeps_entries_with_in_flight_requests() {
        let clock = Arc::new(ManualClock::new());
        let config = Arc::new(Config::default());
        let registry = HostRegistry::with_ttl(config, clock.clone(), Duration::from_millis(100));
        let state = registry.entry("example.com");
        state.in_flight.fetch_add(1, Ordering::SeqCst);

        clock.advance(200);
        registry.sweep_idle();
        assert_eq!(registry.host_count(), 1);
    }
}
