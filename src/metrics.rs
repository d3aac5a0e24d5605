//! Process-wide metrics snapshot: atomics counters plus a bounded per-host
//! response-time ring buffer. No network exporter is implemented — that's
//! the excluded telemetry sink — but the shape is exporter-agnostic.

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

const RESPONSE_TIME_WINDOW: usize = 128;

#[derive(Debug, Default)]
struct HostCounters {
    requests: AtomicU64,
    success: AtomicU64,
    rate_limited: AtomicU64,
    server_errors: AtomicU64,
    client_errors: AtomicU64,
    timeouts: AtomicU64,
    network_errors: AtomicU64,
    retries: AtomicU64,
    circuit_opens: AtomicU64,
    circuit_closes: AtomicU64,
    response_times: Mutex<Vec<Duration>>,
}

impl HostCounters {
    fn record_response_time(&self, d: Duration) {
        let mut buf = self.response_times.lock().unwrap_or_else(|p| p.into_inner());
        buf.push(d);
        if buf.len() > RESPONSE_TIME_WINDOW {
            let excess = buf.len() - RESPONSE_TIME_WINDOW;
            buf.drain(0..excess);
        }
    }
}

pub struct Metrics {
    per_host: DashMap<String, HostCounters>,
    active_requests: AtomicUsize,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        Self { per_host: DashMap::new(), active_requests: AtomicUsize::new(0) }
    }

    fn counters(&self, host: &str) -> dashmap::mapref::one::Ref<'_, String, HostCounters> {
        self.per_host.entry(host.to_string()).or_default().downgrade()
    }

    pub fn request_started(&self, host: &str) {
        self.active_requests.fetch_add(1, Ordering::AcqRel);
        self.counters(host).requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn request_finished(&self, host: &str, outcome: &crate::error::Outcome, elapsed: Duration) {
        self.active_requests.fetch_sub(1, Ordering::AcqRel);
        let counters = self.counters(host);
        counters.record_response_time(elapsed);
        match outcome {
            crate::error::Outcome::Success { .. } => counters.success.fetch_add(1, Ordering::Relaxed),
            crate::error::Outcome::RateLimited { .. } => counters.rate_limited.fetch_add(1, Ordering::Relaxed),
            crate::error::Outcome::ServerError { .. } => counters.server_errors.fetch_add(1, Ordering::Relaxed),
            crate::error::Outcome::ClientError { .. } => counters.client_errors.fetch_add(1, Ordering::Relaxed),
            crate::error::Outcome::Timeout => counters.timeouts.fetch_add(1, Ordering::Relaxed),
            crate::error::Outcome::NetworkError { .. } => counters.network_errors.fetch_add(1, Ordering::Relaxed),
            crate::error::Outcome::CircuitOpen | crate::error::Outcome::Validation { .. } => 0,
        };
    }

    pub fn retry_scheduled(&self, host: &str) {
        self.counters(host).retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn circuit_opened(&self, host: &str) {
        self.counters(host).circuit_opens.fetch_add(1, Ordering::Relaxed);
    }

    pub fn circuit_closed(&self, host: &str) {
        self.counters(host).circuit_closes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn active_requests(&self) -> usize {
        self.active_requests.load(Ordering::Acquire)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let mut per_host = Vec::with_capacity(self.per_host.len());
        for entry in self.per_host.iter() {
            let c = entry.value();
            let response_times = c.response_times.lock().unwrap_or_else(|p| p.into_inner()).clone();
            per_host.push(HostSnapshot {
                host: entry.key().clone(),
                requests: c.requests.load(Ordering::Relaxed),
                success: c.success.load(Ordering::Relaxed),
                rate_limited: c.rate_limited.load(Ordering::Relaxed),
                server_errors: c.server_errors.load(Ordering::Relaxed),
                client_errors: c.client_errors.load(Ordering::Relaxed),
                timeouts: c.timeouts.load(Ordering::Relaxed),
                network_errors: c.network_errors.load(Ordering::Relaxed),
                retries: c.retries.load(Ordering::Relaxed),
                circuit_opens: c.circuit_opens.load(Ordering::Relaxed),
                circuit_closes: c.circuit_closes.load(Ordering::Relaxed),
                response_times,
            });
        }
        MetricsSnapshot { active_requests: self.active_requests(), per_host }
    }
}

#[derive(Debug, Clone)]
pub struct HostSnapshot {
    pub host: String,
    pub requests: u64,
    pub success: u64,
    pub rate_limited: u64,
    pub server_errors: u64,
    pub client_errors: u64,
    pub timeouts: u64,
    pub network_errors: u64,
    pub retries: u64,
    pub circuit_opens: u64,
    pub circuit_closes: u64,
    pub response_times: Vec<Duration>,
}

#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub active_requests: usize,
    pub per_host: Vec<HostSnapshot>,
}
