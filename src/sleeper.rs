//! Abstraction for sleeping/waiting.
//!
//! Enables fast, deterministic tests without real time delays, and lets retry
//! delays be cancelled early when a job is stopped.

use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

/// Abstraction for sleeping/waiting.
#[async_trait]
pub trait Sleeper: Send + Sync + std::fmt::Debug {
    async fn sleep(&self, duration: Duration);

    /// Sleep, but wake early if `cancel` fires. Returns `true` if the sleep
    /// ran to completion, `false` if it was cut short.
    async fn cancellable_sleep(&self, duration: Duration, cancel: &Notify) -> bool {
        tokio::select! {
            _ = self.sleep(duration) => true,
            _ = cancel.notified() => false,
        }
    }
}

/// Production sleeper using the tokio runtime.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await
    }
}

/// Test sleeper that doesn't actually sleep.
#[derive(Debug, Default, Clone, Copy)]
pub struct InstantSleeper;

#[async_trait]
impl Sleeper for InstantSleeper {
    async fn sleep(&self, _duration: Duration) {}
}

/// Test sleeper that records every requested duration instead of waiting.
#[derive(Debug, Clone, Default)]
pub struct TrackingSleeper {
    calls: Arc<Mutex<Vec<Duration>>>,
}

impl TrackingSleeper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> usize {
        self.calls.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn call_at(&self, index: usize) -> Option<Duration> {
        self.calls.lock().unwrap_or_else(|p| p.into_inner()).get(index).copied()
    }

    /// Sum of every duration ever requested, standing in for "wall time spent sleeping".
    pub fn total(&self) -> Duration {
        self.calls.lock().unwrap_or_else(|p| p.into_inner()).iter().sum()
    }

    pub fn clear(&self) {
        self.calls.lock().unwrap_or_else(|p| p.into_inner()).clear();
    }
}

#[async_trait]
impl Sleeper for TrackingSleeper {
    async fn sleep(&self, duration: Duration) {
        self.calls.lock().unwrap_or_else(|p| p.into_inner()).push(duration);
    }
}
