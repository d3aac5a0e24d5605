//! Per-host token bucket with continuous fractional refill.
//!
//! Grounded on the token-bucket math the teacher's distributed rate limiter
//! used against a pluggable store: `tokens = min(capacity, tokens + elapsed *
//! rate)`. That store was built for cross-process coordination; a single
//! scraping process has no such need, so the state lives behind a `Mutex`
//! instead of a swappable backend.

use crate::clock::SharedClock;
use std::sync::Mutex;
use std::time::Duration;

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill_millis: u64,
}

#[derive(Debug)]
pub struct TokenBucket {
    state: Mutex<BucketState>,
    capacity: f64,
    refill_per_sec: f64,
    clock: SharedClock,
}

/// Decision returned by a non-blocking probe.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Decision {
    Admit,
    Deny { retry_after: Duration },
}

impl TokenBucket {
    pub fn new(capacity: f64, refill_per_sec: f64, clock: SharedClock) -> Self {
        let now = clock.now_millis();
        Self {
            state: Mutex::new(BucketState { tokens: capacity, last_refill_millis: now }),
            capacity,
            refill_per_sec,
            clock,
        }
    }

    fn refill(&self, state: &mut BucketState) {
        let now = self.clock.now_millis();
        let elapsed_secs = now.saturating_sub(state.last_refill_millis) as f64 / 1000.0;
        state.tokens = (state.tokens + elapsed_secs * self.refill_per_sec).min(self.capacity);
        state.last_refill_millis = now;
    }

    /// Try to take one token without blocking.
    pub fn try_acquire(&self) -> Decision {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        self.refill(&mut state);

        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            Decision::Admit
        } else {
            let deficit = 1.0 - state.tokens;
            let wait_secs = if self.refill_per_sec > 0.0 { deficit / self.refill_per_sec } else { f64::MAX };
            Decision::Deny { retry_after: Duration::from_secs_f64(wait_secs.max(0.0)) }
        }
    }

    /// Wait until a token is available, then take it.
    pub async fn acquire(&self) {
        loop {
            match self.try_acquire() {
                Decision::Admit => return,
                Decision::Deny { retry_after } => {
                    tokio::time::sleep(retry_after.max(Duration::from_millis(1))).await;
                }
            }
        }
    }

    pub fn available_tokens(&self) -> f64 {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        self.refill(&mut state);
        state.tokens
    }

    pub fn capacity(&self) -> f64 {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::sync::Arc;

    #[test]
    fn starts_full_and_drains() {
        let clock = Arc::new(ManualClock::new());
        let bucket = TokenBucket::new(3.0, 1.0, clock);
        assert_eq!(bucket.try_acquire(), Decision::Admit);
        assert_eq!(bucket.try_acquire(), Decision::Admit);
        assert_eq!(bucket.try_acquire(), Decision::Admit);
        assert!(matches!(bucket.try_acquire(), Decision::Deny { .. }));
    }

    #[test]
    fn refills_continuously_with_elapsed_time() {
        let clock = Arc::new(ManualClock::new());
        let bucket = TokenBucket::new(1.0, 1.0, clock.clone());
        assert_eq!(bucket.try_acquire(), Decision::Admit);
        assert!(matches!(bucket.try_acquire(), Decision::Deny { .. }));

        clock.advance(500);
        assert!(matches!(bucket.try_acquire(), Decision::Deny { .. }));

        clock.advance(600);
        assert_eq!(bucket.try_acquire(), Decision::Admit);
    }

    #[test]
    fn never_exceeds_capacity() {
        let clock = Arc::new(ManualClock::new());
        let bucket = TokenBucket::new(2.0, 10.0, clock.clone());
        bucket.try_acquire();
        clock.advance(10_000);
        assert!((bucket.available_tokens() - 2.0).abs() < f64::EPSILON);
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_blocks_until_refilled() {
        let clock = Arc::new(ManualClock::new());
        let bucket = Arc::new(TokenBucket::new(1.0, 10.0, clock.clone()));
        bucket.try_acquire();

        let bucket2 = bucket.clone();
        let clock2 = clock.clone();
        let handle = tokio::spawn(async move {
            bucket2.acquire().await;
        });

        tokio::time::advance(Duration::from_millis(5)).await;
        clock2.advance(200);
        tokio::time::advance(Duration::from_millis(10)).await;
        handle.await.unwrap();
    }
}
