//! Per-host concurrency bound.
//!
//! A host's `concurrency` policy field caps the number of in-flight requests
//! to that host. Unlike a circuit breaker or token bucket, a saturated
//! bulkhead doesn't fail the caller — it makes them wait, the same way the
//! token bucket makes callers wait for a refill, so one slow host can't starve
//! others by piling up unboundedly many in-flight requests.

use std::sync::Arc;
use tokio::sync::{Semaphore, SemaphorePermit};

#[derive(Clone, Debug)]
pub struct BulkheadPolicy {
    semaphore: Arc<Semaphore>,
    max_concurrent: usize,
}

#[derive(Debug, thiserror::Error)]
#[error("bulkhead saturated ({in_flight} in flight, max {max})")]
pub struct BulkheadRejected {
    pub in_flight: usize,
    pub max: usize,
}

impl BulkheadPolicy {
    pub fn new(max_concurrent: usize) -> Self {
        Self { semaphore: Arc::new(Semaphore::new(max_concurrent.max(1))), max_concurrent: max_concurrent.max(1) }
    }

    pub fn unlimited() -> Self {
        Self::new(1_000_000_000)
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    pub fn in_flight(&self) -> usize {
        self.max_concurrent.saturating_sub(self.semaphore.available_permits())
    }

    /// Wait for a permit. Cancel-safe: dropping the future releases no permit
    /// because none was ever acquired.
    pub async fn acquire(&self) -> SemaphorePermit<'_> {
        self.semaphore.acquire().await.expect("bulkhead semaphore never closed")
    }

    /// Non-blocking variant for callers that want to fail fast instead of queueing.
    pub fn try_acquire(&self) -> Result<SemaphorePermit<'_>, BulkheadRejected> {
        self.semaphore.try_acquire().map_err(|_| BulkheadRejected {
            in_flight: self.in_flight(),
            max: self.max_concurrent,
        })
    }
}
