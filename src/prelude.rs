//! Convenient re-exports for common scrapecore types.
pub use crate::{
    clock::{Clock, ManualClock, SharedClock},
    config::Config,
    error::{FetchResponse, JobError, Outcome},
    extract::{ExtractError, Extractor, RawTextExtractor, Record},
    fetcher::{FetchOptions, Fetcher},
    job::{JobId, JobOrchestrator, JobState, JobStatus},
    joblog::{JobLogSink, NullJobLogSink, SharedJobLogSink},
    normalizer::Normalizer,
    processor::{BatchHandle, BatchResult, ErrorCategory, ItemOutcome, Phase, Processor, ProcessorConfig, ProgressEvent},
    registry::{HostPolicy, HostRegistry},
    Backoff, BulkheadPolicy, CircuitBreakerPolicy, Jitter, RetryPolicy, TimeoutPolicy,
};
