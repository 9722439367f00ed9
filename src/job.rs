use crate::cache::{CacheAble, CacheService};
use crate::config::JobConfig;
use crate::entity;
use crate::errors::{Error, JobError, Result};
use crate::lock::LockManager;
use crate::scrape::ScrapeService;
use crate::store::RecordStore;
use chrono::{DateTime, Utc};
use log::{error, info, warn};
use metrics::{counter, histogram};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Name of the execution lock shared by every trigger path.
const SCRAPE_LOCK: &str = "bcv_scraping";
/// Cache id under which the single in-flight status lives.
const STATUS_ID: &str = "current";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Running,
    Retrying,
    Completed,
    Failed,
    Error,
}

impl JobState {
    /// States that block a new execution from starting.
    pub fn is_live(&self) -> bool {
        matches!(self, JobState::Running | JobState::Retrying)
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobState::Running => write!(f, "running"),
            JobState::Retrying => write!(f, "retrying"),
            JobState::Completed => write!(f, "completed"),
            JobState::Failed => write!(f, "failed"),
            JobState::Error => write!(f, "error"),
        }
    }
}

/// Lifecycle snapshot of the current (or just-finished) scraping execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobStatus {
    pub status: JobState,
    pub job_id: String,
    pub attempt: u32,
    pub is_manual: bool,
    pub requested_by: Option<String>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_time_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_retry_at: Option<DateTime<Utc>>,
}

impl CacheAble for JobStatus {
    fn field() -> impl AsRef<str> {
        "job_status"
    }
}

/// Rolling success summary, written independently of the per-run status so
/// dashboards outlive the status TTL.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSuccess {
    pub completed_at: DateTime<Utc>,
    pub job_id: String,
    pub execution_time_ms: u64,
    pub attempts: u32,
    pub scrape_attempts: u32,
    pub usd_rate: Decimal,
    pub value_date: chrono::NaiveDate,
    pub is_manual: bool,
    pub requested_by: Option<String>,
}

impl CacheAble for JobSuccess {
    fn field() -> impl AsRef<str> {
        "last_job_success"
    }
}

/// Rolling failure summary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobFailure {
    pub failed_at: DateTime<Utc>,
    pub job_id: String,
    pub attempts: u32,
    pub error: String,
    pub is_manual: bool,
    pub requested_by: Option<String>,
}

impl CacheAble for JobFailure {
    fn field() -> impl AsRef<str> {
        "last_job_failure"
    }
}

/// Cache-backed view of the job state machine. All writes are
/// last-writer-wins: good enough for dashboards, not a coordination
/// primitive — that's what the named lock is for.
pub struct JobTracker {
    cache: Arc<CacheService>,
    status_ttl: Duration,
    summary_ttl: Duration,
}

impl JobTracker {
    pub fn new(cache: Arc<CacheService>, status_ttl: Duration, summary_ttl: Duration) -> Self {
        Self {
            cache,
            status_ttl,
            summary_ttl,
        }
    }

    pub async fn current(&self) -> Result<Option<JobStatus>> {
        Ok(JobStatus::sync(STATUS_ID, &self.cache).await?)
    }

    /// Whether a run is currently live (running or retrying). Advisory only.
    pub async fn is_live(&self) -> Result<bool> {
        Ok(self
            .current()
            .await?
            .is_some_and(|status| status.status.is_live()))
    }

    pub async fn update(&self, status: &JobStatus) -> Result<()> {
        status
            .send_with_ttl(STATUS_ID, &self.cache, self.status_ttl)
            .await?;
        Ok(())
    }

    pub async fn clear_status(&self) -> Result<()> {
        JobStatus::delete(STATUS_ID, &self.cache).await?;
        Ok(())
    }

    pub async fn record_success(&self, summary: &JobSuccess) -> Result<()> {
        summary
            .send_with_ttl(STATUS_ID, &self.cache, self.summary_ttl)
            .await?;
        Ok(())
    }

    pub async fn record_failure(&self, summary: &JobFailure) -> Result<()> {
        summary
            .send_with_ttl(STATUS_ID, &self.cache, self.summary_ttl)
            .await?;
        Ok(())
    }

    pub async fn last_success(&self) -> Result<Option<JobSuccess>> {
        Ok(JobSuccess::sync(STATUS_ID, &self.cache).await?)
    }

    pub async fn last_failure(&self) -> Result<Option<JobFailure>> {
        Ok(JobFailure::sync(STATUS_ID, &self.cache).await?)
    }

    /// Drops the status entry and both rolling summaries.
    pub async fn clear_all(&self) -> Result<()> {
        JobStatus::delete(STATUS_ID, &self.cache).await?;
        JobSuccess::delete(STATUS_ID, &self.cache).await?;
        JobFailure::delete(STATUS_ID, &self.cache).await?;
        Ok(())
    }
}

/// Who asked for this run, and how.
#[derive(Debug, Clone, Default)]
pub struct JobRequest {
    pub is_manual: bool,
    pub requested_by: Option<String>,
    /// Bypass the overlap and recent-data guards (backup schedules)
    pub force: bool,
}

impl JobRequest {
    pub fn manual(requested_by: impl Into<String>) -> Self {
        Self {
            is_manual: true,
            requested_by: Some(requested_by.into()),
            force: false,
        }
    }

    pub fn automatic() -> Self {
        Self {
            is_manual: false,
            requested_by: None,
            force: false,
        }
    }

    pub fn automatic_forced() -> Self {
        Self {
            is_manual: false,
            requested_by: None,
            force: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Another execution holds the lock or a live status entry exists
    Overlap,
    /// A record was scraped within the recent-data window
    RecentData,
}

/// What one job invocation amounted to. A terminal scrape failure is a
/// normal outcome here — `Err` is reserved for unexpected plumbing errors
/// (cache, lock), mirroring the `error` state.
#[derive(Debug)]
pub enum JobOutcome {
    Completed {
        record: entity::Model,
        scrape_attempts: u32,
        execution_time_ms: u64,
    },
    Skipped(SkipReason),
    Failed {
        attempts: u32,
        error: String,
    },
}

/// Execution wrapper around the scrape pipeline: overlap lock, recent-data
/// guard, the outer retry loop with its backoff table, and all state-machine
/// bookkeeping.
pub struct ScrapeJob {
    scraper: Arc<ScrapeService>,
    store: Arc<dyn RecordStore>,
    tracker: Arc<JobTracker>,
    locker: Arc<LockManager>,
    config: JobConfig,
}

impl ScrapeJob {
    pub fn new(
        scraper: Arc<ScrapeService>,
        store: Arc<dyn RecordStore>,
        tracker: Arc<JobTracker>,
        locker: Arc<LockManager>,
        config: JobConfig,
    ) -> Self {
        Self {
            scraper,
            store,
            tracker,
            locker,
            config,
        }
    }

    /// Delay before outer retry `attempt` (1-based). Attempt indexes beyond
    /// the table fall back to the first entry.
    fn backoff_for(&self, attempt: u32) -> Duration {
        let table = &self.config.backoff_secs;
        let secs = table
            .get(attempt.saturating_sub(1) as usize)
            .or_else(|| table.first())
            .copied()
            .unwrap_or(60);
        Duration::from_secs(secs)
    }

    pub async fn run(&self, request: JobRequest) -> Result<JobOutcome> {
        // Advisory overlap check before anything expensive. Callers see the
        // live status and can decide; `force` is that decision.
        if !request.force && self.tracker.is_live().await? {
            warn!("Scraping job skipped: another execution is live");
            counter!("scrape_jobs_total", "outcome" => "overlap").increment(1);
            return Ok(JobOutcome::Skipped(SkipReason::Overlap));
        }

        // The named lock is the enforcement backstop. Its TTL outlives the
        // handler timeout, so a wedged execution cannot be double-started.
        if !self
            .locker
            .acquire_lock(
                SCRAPE_LOCK,
                self.config.lock_ttl_secs,
                Duration::from_millis(50),
            )
            .await?
        {
            warn!("Scraping job skipped: execution lock is held");
            counter!("scrape_jobs_total", "outcome" => "overlap").increment(1);
            return Ok(JobOutcome::Skipped(SkipReason::Overlap));
        }

        let result = self.run_locked(&request).await;

        if let Err(e) = self.locker.release_lock(SCRAPE_LOCK).await {
            warn!("Failed to release scrape lock: {}", e);
        }

        match result {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                // Unexpected plumbing failure: record the `error` state and
                // surface the error unchanged so the caller's own retry
                // handling still applies.
                error!("Scraping job errored: {}", e);
                let mut status = self.base_status(&request, "unknown", 0, JobState::Error);
                status.error = Some(e.to_string());
                self.tracker.update(&status).await.ok();
                Err(e)
            }
        }
    }

    async fn run_locked(&self, request: &JobRequest) -> Result<JobOutcome> {
        // Recent-data guard, automatic triggers only: skip entirely when a
        // record landed within the window. No state transition.
        if !request.is_manual && !request.force {
            let window = chrono::Duration::seconds(self.config.recent_window_secs as i64);
            let since = Utc::now().naive_utc() - window;
            if self.store.count_since(since).await? > 0 {
                info!("Skipping automatic scraping: recent data exists");
                counter!("scrape_jobs_total", "outcome" => "recent_skip").increment(1);
                return Ok(JobOutcome::Skipped(SkipReason::RecentData));
            }
        }

        let job_id = Uuid::now_v7().to_string();
        let deadline = Instant::now() + Duration::from_secs(self.config.retry_deadline_secs);
        let max_attempts = self.config.max_job_attempts.max(1);
        let mut attempt = 0u32;

        info!(
            "Scraping job {} started (manual: {}, requested_by: {:?})",
            job_id, request.is_manual, request.requested_by
        );

        loop {
            attempt += 1;
            let started = Instant::now();

            self.tracker
                .update(&self.base_status(request, &job_id, attempt, JobState::Running))
                .await?;

            let handler_timeout = Duration::from_secs(self.config.handler_timeout_secs);
            let outcome =
                tokio::time::timeout(handler_timeout, self.scraper.scrape_and_save(&*self.store))
                    .await;

            let execution_time_ms = started.elapsed().as_millis() as u64;

            let failure_message = match outcome {
                Ok(Ok(saved)) => {
                    return self
                        .finish_success(request, &job_id, attempt, execution_time_ms, saved)
                        .await;
                }
                Ok(Err(failure)) => {
                    if failure.scraped.is_some() {
                        // The scrape itself succeeded; only persistence
                        // failed. Retrying re-runs the whole pipeline, which
                        // is safe: records are append-only.
                        warn!(
                            "Job {} scraped successfully but could not persist: {}",
                            job_id, failure.error
                        );
                    }
                    failure.to_string()
                }
                Err(_elapsed) => {
                    Error::from(JobError::Timeout(self.config.handler_timeout_secs)).to_string()
                }
            };

            let out_of_attempts = attempt >= max_attempts;
            let next_backoff = self.backoff_for(attempt);
            let past_deadline = Instant::now() + next_backoff >= deadline;

            if out_of_attempts || past_deadline {
                return self
                    .finish_failure(
                        request,
                        &job_id,
                        attempt,
                        execution_time_ms,
                        failure_message,
                        past_deadline && !out_of_attempts,
                    )
                    .await;
            }

            let mut status = self.base_status(request, &job_id, attempt, JobState::Retrying);
            status.execution_time_ms = Some(execution_time_ms);
            status.error = Some(failure_message.clone());
            status.next_retry_at = Some(
                Utc::now()
                    + chrono::Duration::from_std(next_backoff)
                        .unwrap_or_else(|_| chrono::Duration::zero()),
            );
            self.tracker.update(&status).await?;

            warn!(
                "Scraping job {} attempt {} failed ({}), retrying in {}s",
                job_id,
                attempt,
                failure_message,
                next_backoff.as_secs()
            );

            tokio::time::sleep(next_backoff).await;
        }
    }

    async fn finish_success(
        &self,
        request: &JobRequest,
        job_id: &str,
        attempt: u32,
        execution_time_ms: u64,
        saved: crate::scrape::SavedRate,
    ) -> Result<JobOutcome> {
        info!(
            "Scraping job {} completed in {}ms (rate {}, value date {})",
            job_id, execution_time_ms, saved.record.usd_rate, saved.record.value_date
        );
        counter!("scrape_jobs_total", "outcome" => "completed").increment(1);
        histogram!("scrape_job_duration_ms").record(execution_time_ms as f64);

        let mut status = self.base_status(request, job_id, attempt, JobState::Completed);
        status.execution_time_ms = Some(execution_time_ms);
        self.tracker.update(&status).await?;

        self.tracker
            .record_success(&JobSuccess {
                completed_at: Utc::now(),
                job_id: job_id.to_string(),
                execution_time_ms,
                attempts: attempt,
                scrape_attempts: saved.attempts,
                usd_rate: saved.record.usd_rate,
                value_date: saved.record.value_date,
                is_manual: request.is_manual,
                requested_by: request.requested_by.clone(),
            })
            .await?;

        Ok(JobOutcome::Completed {
            scrape_attempts: saved.attempts,
            execution_time_ms,
            record: saved.record,
        })
    }

    async fn finish_failure(
        &self,
        request: &JobRequest,
        job_id: &str,
        attempts: u32,
        execution_time_ms: u64,
        message: String,
        deadline_hit: bool,
    ) -> Result<JobOutcome> {
        error!(
            "Scraping job {} failed permanently after {} attempt(s): {}",
            job_id, attempts, message
        );
        counter!("scrape_jobs_total", "outcome" => "failed").increment(1);

        let mut status = self.base_status(request, job_id, attempts, JobState::Failed);
        status.execution_time_ms = Some(execution_time_ms);
        status.error = Some(message.clone());
        self.tracker.update(&status).await?;

        self.tracker
            .record_failure(&JobFailure {
                failed_at: Utc::now(),
                job_id: job_id.to_string(),
                attempts,
                error: message.clone(),
                is_manual: request.is_manual,
                requested_by: request.requested_by.clone(),
            })
            .await?;

        // Drop the running-state entry so the guard never outlives the run.
        self.tracker.clear_status().await?;

        if deadline_hit {
            warn!("Job {} gave up before exhausting attempts: retry deadline passed", job_id);
        }

        Ok(JobOutcome::Failed {
            attempts,
            error: message,
        })
    }

    fn base_status(
        &self,
        request: &JobRequest,
        job_id: &str,
        attempt: u32,
        state: JobState,
    ) -> JobStatus {
        JobStatus {
            status: state,
            job_id: job_id.to_string(),
            attempt,
            is_manual: request.is_manual,
            requested_by: request.requested_by.clone(),
            updated_at: Utc::now(),
            execution_time_ms: None,
            error: None,
            next_retry_at: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{MemoryStore, StubFetcher};
    use chrono::NaiveDate;
    use std::str::FromStr;

    struct Fixture {
        fetcher: Arc<StubFetcher>,
        store: Arc<MemoryStore>,
        tracker: Arc<JobTracker>,
        job: ScrapeJob,
    }

    fn fixture_with(fetch_failures: u32, store: MemoryStore, config: JobConfig) -> Fixture {
        let cache = Arc::new(CacheService::new(None, "test".to_string(), None));
        let tracker = Arc::new(JobTracker::new(
            cache,
            Duration::from_secs(1800),
            Duration::from_secs(86400),
        ));
        let fetcher = Arc::new(StubFetcher::new(fetch_failures));
        let scraper = Arc::new(ScrapeService::new(
            fetcher.clone(),
            3,
            Duration::from_millis(0),
        ));
        let store = Arc::new(store);
        let locker = Arc::new(LockManager::new(None, "test"));
        let job = ScrapeJob::new(
            scraper,
            store.clone(),
            tracker.clone(),
            locker,
            config,
        );
        Fixture {
            fetcher,
            store,
            tracker,
            job,
        }
    }

    fn fast_config() -> JobConfig {
        JobConfig {
            backoff_secs: vec![0, 0, 0],
            ..JobConfig::default()
        }
    }

    #[tokio::test]
    async fn test_successful_run_records_everything() {
        let f = fixture_with(0, MemoryStore::default(), fast_config());

        let outcome = f.job.run(JobRequest::manual("tester")).await.unwrap();
        let JobOutcome::Completed { record, scrape_attempts, .. } = outcome else {
            panic!("expected completion, got {:?}", outcome);
        };
        assert_eq!(scrape_attempts, 1);
        assert_eq!(record.usd_rate, Decimal::from_str("105.4527").unwrap());
        assert_eq!(f.store.len(), 1);

        let status = f.tracker.current().await.unwrap().unwrap();
        assert_eq!(status.status, JobState::Completed);
        assert!(status.is_manual);

        let success = f.tracker.last_success().await.unwrap().unwrap();
        assert_eq!(success.usd_rate, Decimal::from_str("105.4527").unwrap());
        assert_eq!(
            success.value_date,
            NaiveDate::from_ymd_opt(2025, 6, 25).unwrap()
        );

        // Stored row reads back identically and renders the display form
        let stored = f.store.most_recent().await.unwrap().unwrap();
        assert_eq!(stored.usd_rate, Decimal::from_str("105.4527").unwrap());
        assert_eq!(
            stored.value_date,
            NaiveDate::from_ymd_opt(2025, 6, 25).unwrap()
        );
        assert_eq!(stored.formatted_rate(), "105,45 Bs.");
    }

    #[tokio::test]
    async fn test_recent_data_guard_skips_automatic_runs() {
        let f = fixture_with(0, MemoryStore::default(), fast_config());

        // First automatic run scrapes and stores
        let outcome = f.job.run(JobRequest::automatic()).await.unwrap();
        assert!(matches!(outcome, JobOutcome::Completed { .. }));
        assert_eq!(f.fetcher.calls(), 1);

        // Second automatic run within the hour skips without fetching
        let outcome = f.job.run(JobRequest::automatic()).await.unwrap();
        assert!(matches!(outcome, JobOutcome::Skipped(SkipReason::RecentData)));
        assert_eq!(f.fetcher.calls(), 1);
        assert_eq!(f.store.len(), 1);
    }

    #[tokio::test]
    async fn test_manual_runs_ignore_recent_data() {
        let f = fixture_with(0, MemoryStore::default(), fast_config());

        f.job.run(JobRequest::automatic()).await.unwrap();
        let outcome = f.job.run(JobRequest::manual("tester")).await.unwrap();
        assert!(matches!(outcome, JobOutcome::Completed { .. }));
        assert_eq!(f.store.len(), 2);
    }

    #[tokio::test]
    async fn test_live_status_blocks_new_run() {
        let f = fixture_with(0, MemoryStore::default(), fast_config());

        // Simulate another process mid-run
        f.tracker
            .update(&JobStatus {
                status: JobState::Running,
                job_id: "other".to_string(),
                attempt: 1,
                is_manual: false,
                requested_by: None,
                updated_at: Utc::now(),
                execution_time_ms: None,
                error: None,
                next_retry_at: None,
            })
            .await
            .unwrap();

        let outcome = f.job.run(JobRequest::automatic()).await.unwrap();
        assert!(matches!(outcome, JobOutcome::Skipped(SkipReason::Overlap)));
        assert_eq!(f.fetcher.calls(), 0);

        // Forcing proceeds anyway
        let outcome = f.job.run(JobRequest::automatic_forced()).await.unwrap();
        assert!(matches!(outcome, JobOutcome::Completed { .. }));
    }

    #[tokio::test]
    async fn test_exhausted_attempts_record_failure_and_clear_status() {
        let config = JobConfig {
            max_job_attempts: 2,
            backoff_secs: vec![0, 0, 0],
            ..JobConfig::default()
        };
        // Fetcher never recovers
        let f = fixture_with(100, MemoryStore::default(), config);

        let outcome = f.job.run(JobRequest::manual("tester")).await.unwrap();
        let JobOutcome::Failed { attempts, .. } = outcome else {
            panic!("expected failure, got {:?}", outcome);
        };
        assert_eq!(attempts, 2);
        // 2 outer attempts x 3 scrape attempts each
        assert_eq!(f.fetcher.calls(), 6);
        assert_eq!(f.store.len(), 0);

        // Status entry cleared; rolling failure summary written
        assert!(f.tracker.current().await.unwrap().is_none());
        let failure = f.tracker.last_failure().await.unwrap().unwrap();
        assert_eq!(failure.attempts, 2);
        assert!(failure.is_manual);
    }

    #[tokio::test]
    async fn test_persistence_failure_carries_on_as_failure() {
        let config = JobConfig {
            max_job_attempts: 1,
            backoff_secs: vec![0],
            ..JobConfig::default()
        };
        let f = fixture_with(0, MemoryStore::failing(), config);

        let outcome = f.job.run(JobRequest::manual("tester")).await.unwrap();
        let JobOutcome::Failed { error, .. } = outcome else {
            panic!("expected failure, got {:?}", outcome);
        };
        assert!(error.contains("store"));

        let failure = f.tracker.last_failure().await.unwrap().unwrap();
        assert!(failure.error.contains("store"));
    }

    #[tokio::test]
    async fn test_backoff_table() {
        let f = fixture_with(0, MemoryStore::default(), JobConfig::default());
        assert_eq!(f.job.backoff_for(1), Duration::from_secs(60));
        assert_eq!(f.job.backoff_for(2), Duration::from_secs(120));
        assert_eq!(f.job.backoff_for(3), Duration::from_secs(240));
        // Beyond the table falls back to the first entry
        assert_eq!(f.job.backoff_for(4), Duration::from_secs(60));
    }

    #[test]
    fn test_job_state_liveness() {
        assert!(JobState::Running.is_live());
        assert!(JobState::Retrying.is_live());
        assert!(!JobState::Completed.is_live());
        assert!(!JobState::Failed.is_live());
        assert!(!JobState::Error.is_live());
    }

    #[test]
    fn test_job_status_serialization_shape() {
        let status = JobStatus {
            status: JobState::Retrying,
            job_id: "j1".to_string(),
            attempt: 2,
            is_manual: false,
            requested_by: None,
            updated_at: Utc::now(),
            execution_time_ms: Some(1200),
            error: Some("timeout".to_string()),
            next_retry_at: None,
        };
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["status"], "retrying");
        assert_eq!(json["attempt"], 2);
        // Absent optionals stay out of the payload
        assert!(json.get("next_retry_at").is_none());
    }
}
