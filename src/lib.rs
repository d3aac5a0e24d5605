#![forbid(unsafe_code)]

//! # scrapecore
//!
//! A batch web-scraping engine built on outcome-driven resilience: per-host
//! rate limiting and circuit breaking, a redirect-aware fetcher with SSRF and
//! DNS-rebind guards, URL canonicalization and pagination discovery, a
//! cancellable worker pool with error categorization, and a job orchestrator
//! tying the pipeline together behind an optional HTTP surface.
//!
//! ## Components
//!
//! - [`registry`] — per-host token buckets, circuit breakers, and bulkheads
//! - [`fetcher`] — the resilient HTTP client built on top of the registry
//! - [`normalizer`] — URL canonicalization and `rel=next` pagination discovery
//! - [`processor`] — validated, deduplicated, cancellable batch execution
//! - [`job`] — job lifecycle state machine wrapping the processor
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use scrapecore::{clock::system_clock, config::Config, config::FetchSecurityConfig};
//! use scrapecore::{Extractor, Fetcher, HostRegistry, Processor, ProcessorConfig, RawTextExtractor};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let clock = system_clock();
//!     let config = Arc::new(Config::default());
//!     let registry = HostRegistry::new(config, clock.clone());
//!     let fetcher = Arc::new(Fetcher::new(
//!         registry,
//!         Arc::new(scrapecore::Metrics::new()),
//!         &FetchSecurityConfig::default(),
//!         clock,
//!     )?);
//!
//!     let processor = Processor::new(fetcher, ProcessorConfig::default());
//!     let result = processor
//!         .run(&["https://example.com/".to_string()], Arc::new(RawTextExtractor))
//!         .await;
//!     println!("{} succeeded, {} failed", result.items.iter().filter(|i| i.failure.is_none()).count(), result.failure_sample.len());
//!     Ok(())
//! }
//! ```

pub mod backoff;
pub mod bulkhead;
pub mod circuit_breaker;
pub mod clock;
pub mod config;
pub mod error;
pub mod extract;
pub mod fetcher;
#[cfg(feature = "server")]
pub mod http_api;
pub mod job;
pub mod joblog;
pub mod jitter;
pub mod metrics;
pub mod normalizer;
pub mod processor;
pub mod registry;
pub mod retry;
pub mod sleeper;
pub mod ssrf;
pub mod timeout;
pub mod token_bucket;

// Re-exports: resilience primitives.
pub use backoff::Backoff;
pub use bulkhead::{BulkheadPolicy, BulkheadRejected};
pub use circuit_breaker::{CircuitBreakerConfig, CircuitBreakerPolicy, CircuitOpen, CircuitPermit, CircuitState};
pub use clock::{Clock, ManualClock, MonotonicClock, SharedClock};
pub use jitter::Jitter;
pub use retry::{RetryExhausted, RetryPolicy, RetryPolicyBuilder};
pub use sleeper::{InstantSleeper, Sleeper, TokioSleeper, TrackingSleeper};
pub use timeout::{TimeoutError, TimeoutPolicy, MAX_TIMEOUT};

// Re-exports: scraping components.
pub use config::Config;
pub use error::{BuildError, JobError, Outcome};
pub use extract::{ExtractError, Extractor, RawTextExtractor, Record};
pub use fetcher::{FetchOptions, Fetcher};
pub use job::{JobId, JobOrchestrator, JobState, JobStatus};
pub use joblog::{JobLogSink, JobLogError, NdjsonFileSink, NullJobLogSink, SharedJobLogSink};
pub use metrics::Metrics;
pub use normalizer::Normalizer;
pub use processor::{BatchHandle, BatchResult, ErrorCategory, ItemFailure, ItemOutcome, Phase, Processor, ProcessorConfig, ProgressEvent};
pub use registry::{HostKey, HostPolicy, HostRegistry};

pub mod prelude;
