//! Job Orchestrator (Component E): `StartJob`/`GetStatus`/`CancelJob`/`GetResult`.
//!
//! Jobs are held in an explicitly constructed `Arc<DashMap<JobId, Arc<RwLock<JobRecord>>>>`
//! injected into the orchestrator — the same "no global state" idiom the
//! host policy registry uses, applied here to job records instead of hosts.

use crate::clock::SharedClock;
use crate::error::JobError;
use crate::extract::Extractor;
use crate::fetcher::Fetcher;
use crate::joblog::{JobEvent, JobLogRecord, SharedJobLogSink};
use crate::normalizer::Normalizer;
use crate::processor::{BatchHandle, BatchResult, Phase, ProcessorConfig, ProgressEvent};
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, RwLock};
use uuid::Uuid;

/// Default bounds for the pagination follow-up pass: a small fixed cap
/// keeps an unbounded pagination crawl from becoming its own resource risk
/// when the caller hasn't configured one explicitly.
const DEFAULT_PAGINATION_MAX_PAGES: usize = 20;
const DEFAULT_PAGINATION_404_THRESHOLD: usize = 3;

pub type JobId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

/// The caller's original request, snapshotted immutably at job creation and
/// never mutated afterward — the basis for the source/discovered URL
/// separation invariant.
#[derive(Debug, Clone)]
pub struct OriginalInput {
    pub mode: String,
    pub urls: Vec<String>,
}

pub struct JobRecord {
    pub id: JobId,
    pub state: JobState,
    pub original_input: OriginalInput,
    pub source_urls: Vec<String>,
    pub discovered_urls: Vec<String>,
    pub progress: Option<ProgressEvent>,
    pub result: Option<BatchResult>,
    pub started_at_millis: u64,
    pub ended_at_millis: Option<u64>,
    handle: Option<BatchHandle>,
}

pub struct JobOrchestrator {
    jobs: Arc<DashMap<JobId, Arc<RwLock<JobRecord>>>>,
    fetcher: Arc<Fetcher>,
    normalizer: Option<Arc<Normalizer>>,
    processor_config: ProcessorConfig,
    log_sink: SharedJobLogSink,
    clock: SharedClock,
    retention: Duration,
    shutdown: Arc<AtomicBool>,
    shutdown_notify: Arc<Notify>,
}

impl JobOrchestrator {
    pub fn new(
        fetcher: Arc<Fetcher>,
        normalizer: Option<Arc<Normalizer>>,
        processor_config: ProcessorConfig,
        log_sink: SharedJobLogSink,
        clock: SharedClock,
        retention: Duration,
    ) -> Arc<Self> {
        let orchestrator = Arc::new(Self {
            jobs: Arc::new(DashMap::new()),
            fetcher,
            normalizer,
            processor_config,
            log_sink,
            clock,
            retention,
            shutdown: Arc::new(AtomicBool::new(false)),
            shutdown_notify: Arc::new(Notify::new()),
        });
        orchestrator.clone().spawn_retention_sweeper();
        orchestrator
    }

    /// Validate the request, snapshot it as `originalInput`, transition
    /// `Pending -> Running`, and launch background processing. Returns the
    /// new job's id immediately.
    pub fn start_job(self: &Arc<Self>, mode: &str, urls: Vec<String>, extractor: Arc<dyn Extractor>) -> Result<JobId, JobError> {
        if mode.is_empty() {
            return Err(JobError::InvalidMode(mode.to_string()));
        }
        if urls.is_empty() {
            return Err(JobError::EmptyInput);
        }

        let id = Uuid::new_v4();
        let now = self.clock.now_millis();
        let original_input = OriginalInput { mode: mode.to_string(), urls: urls.clone() };

        let record = Arc::new(RwLock::new(JobRecord {
            id,
            state: JobState::Pending,
            original_input,
            source_urls: urls.clone(),
            discovered_urls: Vec::new(),
            progress: None,
            result: None,
            started_at_millis: now,
            ended_at_millis: None,
            handle: None,
        }));
        self.jobs.insert(id, record.clone());

        let orchestrator = self.clone();
        tokio::spawn(async move {
            orchestrator.run_job(id, record, urls, extractor).await;
        });

        Ok(id)
    }

    async fn run_job(self: Arc<Self>, id: JobId, record: Arc<RwLock<JobRecord>>, urls: Vec<String>, extractor: Arc<dyn Extractor>) {
        {
            let mut r = record.write().await;
            r.state = JobState::Running;
        }
        self.log(id, JobEvent::JobStarted, serde_json::json!({ "urlCount": urls.len() })).await;

        let mut processor = crate::processor::Processor::new(self.fetcher.clone(), self.processor_config.clone());
        if let Some(normalizer) = &self.normalizer {
            processor = processor.with_normalizer(normalizer.clone());
        }

        let (handle, join) = processor.spawn(&urls, extractor.clone());
        {
            let mut r = record.write().await;
            r.handle = Some(handle);
        }

        let mut result = join.await.ok();

        // Pagination follow-up: any HTML body (currently only surfaced by
        // text-shaped extractors, since `Extractor` doesn't otherwise expose
        // the raw response) is scanned for sibling pages; newly discovered
        // URLs are processed in a second pass and merged in, kept out of
        // `sourceUrls` per the source/discovered separation invariant.
        let mut discovered_urls = Vec::new();
        if let (Some(normalizer), Some(first_pass)) = (&self.normalizer, &result) {
            let mut known: HashSet<String> = urls.iter().cloned().collect();
            let mut new_pages = Vec::new();
            for item in &first_pass.items {
                if item.failure.is_some() {
                    continue;
                }
                if let Some(serde_json::Value::String(html)) = &item.record {
                    let pagination = normalizer
                        .discover_pagination(&item.url, html, DEFAULT_PAGINATION_MAX_PAGES, DEFAULT_PAGINATION_404_THRESHOLD)
                        .await;
                    for page in pagination.pages {
                        if known.insert(page.clone()) {
                            new_pages.push(page);
                        }
                    }
                }
            }

            if !new_pages.is_empty() {
                discovered_urls = new_pages.clone();
                let mut follow_up = crate::processor::Processor::new(self.fetcher.clone(), self.processor_config.clone());
                follow_up = follow_up.with_normalizer(normalizer.clone());
                let follow_up_result = follow_up.run(&new_pages, extractor).await;
                result = Some(merge_results(first_pass.clone(), follow_up_result));
            }
        }

        let mut r = record.write().await;
        r.handle = None;
        r.ended_at_millis = Some(self.clock.now_millis());
        r.discovered_urls = discovered_urls;
        match result {
            Some(result) => {
                r.state = match result.phase {
                    Phase::Stopped => JobState::Cancelled,
                    Phase::Failed => JobState::Failed,
                    _ => JobState::Completed,
                };
                r.progress = Some(ProgressEvent {
                    phase: result.phase,
                    completed: result.items.len(),
                    total: result.items.len(),
                    percentage: 100.0,
                    errors: result.failure_sample.len(),
                    estimated_time_remaining_ms: Some(0),
                });
                r.result = Some(result);
            }
            None => {
                r.state = JobState::Failed;
            }
        }
        debug_assert_eq!(r.source_urls, r.original_input.urls, "sourceUrls must equal originalInput.urls");
        let state = r.state;
        drop(r);

        let event = match state {
            JobState::Completed => JobEvent::JobCompleted,
            JobState::Cancelled => JobEvent::JobCancelled,
            _ => JobEvent::JobFailed,
        };
        self.log(id, event, serde_json::json!({})).await;
    }

    pub async fn get_status(&self, id: JobId) -> Result<JobStatus, JobError> {
        let record = self.jobs.get(&id).ok_or_else(|| JobError::NotFound(id.to_string()))?;
        let r = record.read().await;
        Ok(JobStatus {
            id,
            state: r.state,
            progress: r.progress.clone(),
            started_at_millis: r.started_at_millis,
            ended_at_millis: r.ended_at_millis,
        })
    }

    pub async fn cancel_job(&self, id: JobId) -> Result<JobState, JobError> {
        let record = self.jobs.get(&id).ok_or_else(|| JobError::NotFound(id.to_string()))?;
        let mut r = record.write().await;
        match r.state {
            JobState::Pending => {
                r.state = JobState::Cancelled;
                r.ended_at_millis = Some(self.clock.now_millis());
            }
            JobState::Running => {
                if let Some(handle) = &r.handle {
                    handle.cancel();
                }
            }
            _ => {}
        }
        Ok(r.state)
    }

    /// Only valid once `Completed`; formatting is delegated to an external
    /// exporter, so this returns the raw assembled result.
    pub async fn get_result(&self, id: JobId) -> Result<BatchResult, JobError> {
        let record = self.jobs.get(&id).ok_or_else(|| JobError::NotFound(id.to_string()))?;
        let r = record.read().await;
        if r.state != JobState::Completed {
            return Err(JobError::NotCompleted(id.to_string()));
        }
        r.result.clone().ok_or_else(|| JobError::NotCompleted(id.to_string()))
    }

    async fn log(&self, id: JobId, event: JobEvent, fields: serde_json::Value) {
        let record = JobLogRecord { timestamp: self.clock.now_millis(), job_id: id, event, fields };
        if let Err(e) = self.log_sink.append(record).await {
            tracing::warn!(job_id = %id, error = %e, "failed to append job log record");
        }
    }

    fn spawn_retention_sweeper(self: Arc<Self>) {
        let interval = (self.retention / 10).max(Duration::from_secs(30));
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = self.shutdown_notify.notified() => break,
                }
                if self.shutdown.load(Ordering::Acquire) {
                    break;
                }
                self.sweep_expired().await;
            }
        });
    }

    async fn sweep_expired(&self) {
        let now = self.clock.now_millis();
        let retention_millis = self.retention.as_millis() as u64;
        let mut expired = Vec::new();
        for entry in self.jobs.iter() {
            let r = entry.value().read().await;
            let terminal = matches!(r.state, JobState::Completed | JobState::Failed | JobState::Cancelled);
            if terminal {
                if let Some(ended) = r.ended_at_millis {
                    if now.saturating_sub(ended) >= retention_millis {
                        expired.push(*entry.key());
                    }
                }
            }
        }
        for id in expired {
            self.jobs.remove(&id);
        }
    }

    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.shutdown_notify.notify_waiters();
    }
}

/// Fold a pagination follow-up pass into the original batch result: items
/// are re-indexed to continue after the source pass, failure/category
/// tallies are summed, and the worse of the two phases wins.
fn merge_results(first: BatchResult, second: BatchResult) -> BatchResult {
    let offset = first.items.len();
    let mut items = first.items;
    items.extend(second.items.into_iter().map(|mut item| {
        item.index += offset;
        if let Some(failure) = &mut item.failure {
            failure.index += offset;
        }
        item
    }));

    let mut category_counts = first.category_counts;
    for (category, count) in second.category_counts {
        match category_counts.iter_mut().find(|(c, _)| *c == category) {
            Some(entry) => entry.1 += count,
            None => category_counts.push((category, count)),
        }
    }

    let mut host_failure_counts = first.host_failure_counts;
    for (host, count) in second.host_failure_counts {
        match host_failure_counts.iter_mut().find(|(h, _)| *h == host) {
            Some(entry) => entry.1 += count,
            None => host_failure_counts.push((host, count)),
        }
    }

    let mut failure_sample = first.failure_sample;
    failure_sample.extend(second.failure_sample);

    let mut recommendations = first.recommendations;
    for rec in second.recommendations {
        if !recommendations.contains(&rec) {
            recommendations.push(rec);
        }
    }

    let validation = crate::processor::ValidationReport {
        accepted: first.validation.accepted + second.validation.accepted,
        rejected: first.validation.rejected + second.validation.rejected,
        duplicates: first.validation.duplicates + second.validation.duplicates,
        truncated: first.validation.truncated + second.validation.truncated,
    };

    let phase = match (first.phase, second.phase) {
        (Phase::Stopped, _) | (_, Phase::Stopped) => Phase::Stopped,
        (Phase::Failed, _) | (_, Phase::Failed) => Phase::Failed,
        _ => Phase::Completed,
    };

    BatchResult { validation, items, category_counts, host_failure_counts, failure_sample, recommendations, phase }
}

#[derive(Debug, Clone)]
pub struct JobStatus {
    pub id: JobId,
    pub state: JobState,
    pub progress: Option<ProgressEvent>,
    pub started_at_millis: u64,
    pub ended_at_millis: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::FetchSecurityConfig;
    use crate::extract::RawTextExtractor;
    use crate::joblog::NullJobLogSink;
    use crate::registry::HostRegistry;

    fn orchestrator() -> Arc<JobOrchestrator> {
        let clock: SharedClock = Arc::new(ManualClock::new());
        let config = Arc::new(crate::config::Config::default());
        let registry = HostRegistry::new(config.clone(), clock.clone());
        let fetcher = Arc::new(Fetcher::new(registry, Arc::new(crate::metrics::Metrics::new()), &FetchSecurityConfig::default(), clock.clone()).unwrap());
        JobOrchestrator::new(fetcher, None, ProcessorConfig::default(), Arc::new(NullJobLogSink), clock, Duration::from_secs(3600))
    }

    #[tokio::test]
    async fn unknown_job_returns_not_found() {
        let orchestrator = orchestrator();
        let result = orchestrator.get_status(Uuid::new_v4()).await;
        assert!(matches!(result, Err(JobError::NotFound(_))));
    }

    #[tokio::test]
    async fn empty_mode_is_rejected() {
        let orchestrator = orchestrator();
        let result = orchestrator.start_job("", vec![], Arc::new(RawTextExtractor));
        assert!(matches!(result, Err(JobError::InvalidMode(_))));
    }

    #[tokio::test]
    async fn empty_urls_is_rejected() {
        let orchestrator = orchestrator();
        let result = orchestrator.start_job("list", vec![], Arc::new(RawTextExtractor));
        assert!(matches!(result, Err(JobError::EmptyInput)));
    }

    #[tokio::test]
    async fn pending_job_cancel_is_immediate() {
        let orchestrator = orchestrator();
        // An unsupported scheme is rejected during input validation rather
        // than fetched, so the job reaches a terminal state almost
        // immediately without touching the network.
        let id = orchestrator
            .start_job("list", vec!["ftp://unsupported.example/".to_string()], Arc::new(RawTextExtractor))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        let status = orchestrator.get_status(id).await.unwrap();
        assert!(matches!(status.state, JobState::Completed | JobState::Cancelled));
    }
}
