#![deny(clippy::print_stdout, clippy::print_stderr)]

//! Sync Orchestrator: runs large, resumable per-seller sync jobs — a
//! 3-month-window × 18-month × 7-report-type task plan, paced, checkpointed,
//! cooperatively cancellable, with job-level retry.
//!
//! The queue-facade shape (submit, run, cancel, inspect status) follows this
//! workspace's ingestion-queue idiom; cancellation follows the "token
//! propagated down from the job, checked only at task boundaries" rule used
//! throughout this workspace for long-running work.

use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;

use async_trait::async_trait;
use chrono::DateTime;
use chrono::Utc;
use claims_ledger::CanonicalRecord;
use claims_ledger::LedgerError;
use claims_ledger::LedgerStore;
use claims_ledger::ReportType;
use claims_ledger::UpsertBatchRequest;
use claims_normalize::NormalizeError;
use claims_normalize::RawReportRow;
use claims_progress::NoopProgressSink;
use claims_progress::ProgressEvent;
use claims_progress::ProgressEventKind;
use claims_progress::ProgressSink;
use thiserror::Error;
use tokio::sync::Notify;
use tokio::sync::RwLock;
use uuid::Uuid;

pub type SellerId = String;
pub type JobId = String;

pub type OrchestratorResult<T> = Result<T, OrchestratorError>;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("resource not found: {0}")]
    NotFound(String),
    #[error("operation rejected: {0}")]
    Conflict(String),
    #[error("transient failure: {0}")]
    Transient(String),
    #[error("fatal error: {0}")]
    Fatal(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<LedgerError> for OrchestratorError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::NotFound(msg) => OrchestratorError::NotFound(msg),
            LedgerError::Validation(msg) => OrchestratorError::Validation(msg),
            LedgerError::Rejected(msg) => OrchestratorError::Conflict(msg),
            LedgerError::Internal(msg) => OrchestratorError::Internal(msg),
        }
    }
}

impl From<NormalizeError> for OrchestratorError {
    fn from(err: NormalizeError) -> Self {
        OrchestratorError::Validation(err.to_string())
    }
}

/// Environment knobs collected once at process start, per §6.1's
/// "immutable configuration captured at startup" rule. Task/window pacing
/// are design constants per the spec, not environment-tunable, but are
/// still threaded through the config struct so tests can shrink them.
#[derive(Debug, Clone, Copy)]
pub struct OrchestratorConfig {
    pub months_to_sync: u32,
    pub batch_window_months: u32,
    pub max_job_attempts: u32,
    pub report_download_workers: usize,
    pub task_pacing: Duration,
    pub window_pacing: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            months_to_sync: 18,
            batch_window_months: 3,
            max_job_attempts: 3,
            report_download_workers: 2,
            task_pacing: Duration::from_secs(1),
            window_pacing: Duration::from_secs(5),
        }
    }
}

impl OrchestratorConfig {
    #[must_use]
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            months_to_sync: env_or("MONTHS_TO_SYNC", defaults.months_to_sync),
            batch_window_months: env_or("BATCH_WINDOW_MONTHS", defaults.batch_window_months),
            max_job_attempts: env_or("MAX_JOB_ATTEMPTS", defaults.max_job_attempts),
            ..defaults
        }
    }
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}

/// Cooperative cancellation flag shared between the caller requesting
/// cancellation and the task loop checking it, never used to abort a task
/// mid-flight.
#[derive(Clone)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
            notify: Arc::new(Notify::new()),
        }
    }
}

impl CancellationToken {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Resolves immediately if already cancelled; otherwise waits for the
    /// next `cancel()` call.
    pub async fn cancelled(&self) {
        if self.is_cancelled() {
            return;
        }
        self.notify.notified().await;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub window_index: u32,
}

/// Tiles the last `months_to_sync` months into `window_months`-month
/// windows, newest first.
#[must_use]
pub fn generate_windows(now: DateTime<Utc>, months_to_sync: u32, window_months: u32) -> Vec<SyncWindow> {
    let mut windows = Vec::new();
    let mut window_end = now;
    let mut window_index = 0u32;
    let mut months_remaining = months_to_sync;
    while months_remaining > 0 {
        let span = window_months.min(months_remaining);
        let window_start = window_end
            .checked_sub_months(chrono::Months::new(span))
            .unwrap_or(window_end);
        windows.push(SyncWindow {
            start: window_start,
            end: window_end,
            window_index,
        });
        window_end = window_start;
        months_remaining -= span;
        window_index += 1;
    }
    windows
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncTask {
    pub window: SyncWindow,
    pub report_type: ReportType,
    pub task_index: u32,
}

/// Cartesian product of windows × the seven report types, in a fixed order
/// so the plan (and therefore job resumption) is deterministic.
#[must_use]
pub fn generate_tasks(windows: &[SyncWindow]) -> Vec<SyncTask> {
    let mut tasks = Vec::new();
    let mut task_index = 0u32;
    for window in windows {
        for report_type in ReportType::all() {
            tasks.push(SyncTask {
                window: *window,
                report_type,
                task_index,
            });
            task_index += 1;
        }
    }
    tasks
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct SyncJob {
    pub job_id: JobId,
    pub seller_id: SellerId,
    pub priority: u8,
    pub state: JobState,
    pub tasks: Vec<SyncTask>,
    pub current: u32,
    pub total: u32,
    pub attempts: u32,
    pub checkpoint: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Downloads a provider's raw rows for one `(seller, report_type, window)`
/// task. Delegated entirely to a Provider Adapter in production; this
/// trait is the orchestrator's only dependency on that collaborator.
#[async_trait]
pub trait ReportDownloader: Send + Sync {
    async fn download(
        &self,
        seller_id: &SellerId,
        report_type: ReportType,
        window: &SyncWindow,
    ) -> OrchestratorResult<Vec<RawReportRow>>;
}

pub struct SyncOrchestrator {
    config: OrchestratorConfig,
    downloader: Arc<dyn ReportDownloader>,
    ledger: Arc<dyn LedgerStore>,
    progress: Arc<dyn ProgressSink>,
    jobs: RwLock<HashMap<JobId, SyncJob>>,
    tokens: RwLock<HashMap<JobId, CancellationToken>>,
    running_sellers: RwLock<HashSet<SellerId>>,
}

impl SyncOrchestrator {
    #[must_use]
    pub fn new(
        config: OrchestratorConfig,
        downloader: Arc<dyn ReportDownloader>,
        ledger: Arc<dyn LedgerStore>,
    ) -> Self {
        Self::with_progress(config, downloader, ledger, Arc::new(NoopProgressSink))
    }

    #[must_use]
    pub fn with_progress(
        config: OrchestratorConfig,
        downloader: Arc<dyn ReportDownloader>,
        ledger: Arc<dyn LedgerStore>,
        progress: Arc<dyn ProgressSink>,
    ) -> Self {
        Self {
            config,
            downloader,
            ledger,
            progress,
            jobs: RwLock::new(HashMap::new()),
            tokens: RwLock::new(HashMap::new()),
            running_sellers: RwLock::new(HashSet::new()),
        }
    }

    /// Enqueues a full historical sync for `seller_id`. Does not start
    /// running it; callers invoke `run` (directly, or from a worker loop)
    /// to actually execute the plan.
    pub async fn submit(&self, seller_id: SellerId, priority: u8) -> JobId {
        let windows = generate_windows(Utc::now(), self.config.months_to_sync, self.config.batch_window_months);
        let tasks = generate_tasks(&windows);
        let total = tasks.len() as u32;
        let job_id = Uuid::new_v4().to_string();
        let now = Utc::now();
        let job = SyncJob {
            job_id: job_id.clone(),
            seller_id,
            priority,
            state: JobState::Queued,
            tasks,
            current: 0,
            total,
            attempts: 0,
            checkpoint: 0,
            created_at: now,
            updated_at: now,
        };
        self.jobs.write().await.insert(job_id.clone(), job);
        self.tokens
            .write()
            .await
            .insert(job_id.clone(), CancellationToken::new());
        job_id
    }

    pub async fn status(&self, job_id: &JobId) -> OrchestratorResult<SyncJob> {
        self.jobs
            .read()
            .await
            .get(job_id)
            .cloned()
            .ok_or_else(|| OrchestratorError::NotFound(job_id.clone()))
    }

    /// Requests cooperative cancellation; takes effect at the next task
    /// boundary inside `run`.
    pub async fn cancel(&self, job_id: &JobId) -> OrchestratorResult<()> {
        let tokens = self.tokens.read().await;
        let token = tokens
            .get(job_id)
            .ok_or_else(|| OrchestratorError::NotFound(job_id.clone()))?;
        token.cancel();
        Ok(())
    }

    /// Runs (or resumes) a job to completion, retrying the whole attempt up
    /// to `max_job_attempts` times only on a `Fatal` task error — ordinary
    /// per-task failures are logged and skipped, never retried at the job
    /// level (the Throttled Client already retried at the task level).
    pub async fn run(&self, job_id: &JobId) -> OrchestratorResult<JobState> {
        {
            let job = self.status(job_id).await?;
            let mut running = self.running_sellers.write().await;
            if !running.insert(job.seller_id.clone()) {
                return Err(OrchestratorError::Conflict(format!(
                    "seller {} already has a sync job running",
                    job.seller_id
                )));
            }
        }

        let outcome = self.run_with_retries(job_id).await;

        let seller_id = self.status(job_id).await.map(|job| job.seller_id).ok();
        if let Some(seller_id) = seller_id {
            self.running_sellers.write().await.remove(&seller_id);
        }
        outcome
    }

    async fn run_with_retries(&self, job_id: &JobId) -> OrchestratorResult<JobState> {
        loop {
            let state = self.run_once(job_id).await?;
            if state != JobState::Failed {
                return Ok(state);
            }

            let mut jobs = self.jobs.write().await;
            let job = jobs
                .get_mut(job_id)
                .ok_or_else(|| OrchestratorError::NotFound(job_id.clone()))?;
            if job.attempts >= self.config.max_job_attempts {
                return Ok(JobState::Failed);
            }
            job.attempts += 1;
            let attempt = job.attempts;
            drop(jobs);

            let backoff = Duration::from_secs(2u64.saturating_pow(attempt));
            tokio::time::sleep(backoff).await;
        }
    }

    async fn run_once(&self, job_id: &JobId) -> OrchestratorResult<JobState> {
        let token = self
            .tokens
            .read()
            .await
            .get(job_id)
            .cloned()
            .ok_or_else(|| OrchestratorError::NotFound(job_id.clone()))?;

        {
            let mut jobs = self.jobs.write().await;
            let job = jobs
                .get_mut(job_id)
                .ok_or_else(|| OrchestratorError::NotFound(job_id.clone()))?;
            job.state = JobState::Running;
        }

        let (seller_id, tasks, total, mut checkpoint) = {
            let job = self.status(job_id).await?;
            (job.seller_id, job.tasks, job.total, job.checkpoint)
        };

        let mut previous_window_index = tasks.get(checkpoint as usize).map(|task| task.window.window_index);

        while (checkpoint as usize) < tasks.len() {
            if token.is_cancelled() {
                self.finish(job_id, JobState::Cancelled, checkpoint, total).await?;
                return Ok(JobState::Cancelled);
            }

            let task = tasks[checkpoint as usize];
            let task_result = self.execute_task(&seller_id, &task).await;

            checkpoint += 1;

            match task_result {
                Ok(()) => {
                    self.emit_progress(&seller_id, job_id, checkpoint, total, task.report_type, None)
                        .await;
                }
                Err(OrchestratorError::Fatal(message)) => {
                    self.emit_progress(
                        &seller_id,
                        job_id,
                        checkpoint,
                        total,
                        task.report_type,
                        Some(message.clone()),
                    )
                    .await;
                    self.finish(job_id, JobState::Failed, checkpoint, total).await?;
                    return Ok(JobState::Failed);
                }
                Err(other) => {
                    tracing::warn!(seller_id = %seller_id, job_id = %job_id, report_type = task.report_type.as_str(), error = %other, "sync task failed; continuing");
                    self.emit_progress(
                        &seller_id,
                        job_id,
                        checkpoint,
                        total,
                        task.report_type,
                        Some(other.to_string()),
                    )
                    .await;
                }
            }

            self.checkpoint(job_id, checkpoint).await?;

            let next_window_index = tasks.get(checkpoint as usize).map(|task| task.window.window_index);
            if next_window_index.is_some() && next_window_index != previous_window_index {
                tokio::time::sleep(self.config.window_pacing).await;
            } else if next_window_index.is_some() {
                tokio::time::sleep(self.config.task_pacing).await;
            }
            previous_window_index = next_window_index;
        }

        self.finish(job_id, JobState::Completed, checkpoint, total).await?;
        Ok(JobState::Completed)
    }

    async fn execute_task(&self, seller_id: &SellerId, task: &SyncTask) -> OrchestratorResult<()> {
        let rows = self
            .downloader
            .download(seller_id, task.report_type, &task.window)
            .await?;

        let existing: HashSet<String> = self
            .ledger
            .list_records(seller_id, task.report_type)
            .await?
            .into_iter()
            .filter_map(|record| record.external_id)
            .collect();

        let records: Vec<CanonicalRecord> = claims_normalize::normalize_batch(
            rows,
            &existing,
            (task.window.start, task.window.end),
            Utc::now(),
        )?;

        self.ledger
            .upsert_batch(UpsertBatchRequest {
                seller_id: seller_id.clone(),
                report_type: task.report_type,
                records,
            })
            .await?;

        Ok(())
    }

    async fn checkpoint(&self, job_id: &JobId, checkpoint: u32) -> OrchestratorResult<()> {
        let mut jobs = self.jobs.write().await;
        let job = jobs
            .get_mut(job_id)
            .ok_or_else(|| OrchestratorError::NotFound(job_id.clone()))?;
        job.checkpoint = checkpoint;
        job.current = checkpoint;
        job.updated_at = Utc::now();
        Ok(())
    }

    async fn finish(&self, job_id: &JobId, state: JobState, checkpoint: u32, total: u32) -> OrchestratorResult<()> {
        let mut jobs = self.jobs.write().await;
        let job = jobs
            .get_mut(job_id)
            .ok_or_else(|| OrchestratorError::NotFound(job_id.clone()))?;
        job.state = state;
        job.checkpoint = checkpoint;
        job.current = checkpoint;
        job.total = total;
        job.updated_at = Utc::now();
        Ok(())
    }

    async fn emit_progress(
        &self,
        seller_id: &SellerId,
        job_id: &JobId,
        current: u32,
        total: u32,
        report_type: ReportType,
        message: Option<String>,
    ) {
        let kind = if message.is_some() {
            ProgressEventKind::Log(claims_progress::LogLevel::Warn)
        } else {
            ProgressEventKind::Progress
        };
        self.progress
            .publish(ProgressEvent {
                seller_id: seller_id.clone(),
                job_id: job_id.clone(),
                kind,
                current: u64::from(current),
                total: u64::from(total),
                report_type: Some(report_type.as_str().to_string()),
                message,
                emitted_at: Utc::now(),
            })
            .await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU32;

    use claims_ledger::InMemoryLedgerStore;
    use pretty_assertions::assert_eq;

    use super::*;

    fn test_config() -> OrchestratorConfig {
        OrchestratorConfig {
            task_pacing: Duration::from_millis(0),
            window_pacing: Duration::from_millis(0),
            ..OrchestratorConfig::default()
        }
    }

    struct FixtureDownloader {
        calls: AtomicU32,
        cancel_after: Option<(u32, CancellationToken)>,
    }

    fn fixture_row(task: &SyncTask, seller_id: &SellerId, external_id: String) -> RawReportRow {
        let mut fields = HashMap::new();
        fields.insert("total_fees".to_string(), "5.00".to_string());
        fields.insert(
            "record_date".to_string(),
            task.window.end.to_rfc3339(),
        );
        RawReportRow {
            seller_id: seller_id.clone(),
            report_type: task.report_type,
            source: "amazon_seller_central".into(),
            external_id: Some(external_id.clone()),
            currency_scoped_usd: true,
            fields,
            raw_bytes: external_id.into_bytes(),
        }
    }

    #[async_trait]
    impl ReportDownloader for FixtureDownloader {
        async fn download(
            &self,
            seller_id: &SellerId,
            _report_type: ReportType,
            _window: &SyncWindow,
        ) -> OrchestratorResult<Vec<RawReportRow>> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some((threshold, token)) = &self.cancel_after
                && call + 1 == *threshold
            {
                token.cancel();
            }
            let task = SyncTask {
                window: SyncWindow {
                    start: Utc::now(),
                    end: Utc::now(),
                    window_index: 0,
                },
                report_type: ReportType::Orders,
                task_index: call,
            };
            Ok(vec![fixture_row(&task, seller_id, format!("ext-{call}"))])
        }
    }

    #[test]
    fn generate_windows_tiles_eighteen_months_into_six_windows() {
        let now = Utc::now();
        let windows = generate_windows(now, 18, 3);
        assert_eq!(windows.len(), 6);
        assert_eq!(windows[0].window_index, 0);
        assert_eq!(windows[0].end, now);
        assert_eq!(windows[5].window_index, 5);
    }

    #[test]
    fn generate_tasks_is_cartesian_product_of_windows_and_report_types() {
        let windows = generate_windows(Utc::now(), 18, 3);
        let tasks = generate_tasks(&windows);
        assert_eq!(tasks.len(), 42);
        assert_eq!(tasks[0].report_type, ReportType::Orders);
        assert_eq!(tasks[6].report_type, ReportType::Reimbursements);
        assert_eq!(tasks[7].window.window_index, 1);
    }

    #[tokio::test]
    async fn full_job_runs_to_completion_and_upserts_every_task() {
        let ledger = Arc::new(InMemoryLedgerStore::new());
        let downloader = Arc::new(FixtureDownloader {
            calls: AtomicU32::new(0),
            cancel_after: None,
        });
        let orchestrator = SyncOrchestrator::new(test_config(), downloader, ledger.clone());

        let job_id = orchestrator.submit("seller-1".into(), 1).await;
        let state = orchestrator.run(&job_id).await.expect("run");
        assert_eq!(state, JobState::Completed);

        let job = orchestrator.status(&job_id).await.expect("status");
        assert_eq!(job.current, 42);
        assert_eq!(job.total, 42);

        let records = ledger
            .list_records(&"seller-1".to_string(), ReportType::Orders)
            .await
            .expect("list records");
        assert_eq!(records.len(), 6);
    }

    #[tokio::test]
    async fn cancellation_mid_run_stops_before_remaining_tasks() {
        let ledger = Arc::new(InMemoryLedgerStore::new());
        let token = CancellationToken::new();
        let downloader = Arc::new(FixtureDownloader {
            calls: AtomicU32::new(0),
            cancel_after: Some((10, token.clone())),
        });
        let orchestrator = SyncOrchestrator::new(test_config(), downloader, ledger);

        let job_id = orchestrator.submit("seller-1".into(), 1).await;
        orchestrator
            .tokens
            .write()
            .await
            .insert(job_id.clone(), token);

        let state = orchestrator.run(&job_id).await.expect("run");
        assert_eq!(state, JobState::Cancelled);

        let job = orchestrator.status(&job_id).await.expect("status");
        assert_eq!(job.current, 10);
    }

    #[tokio::test]
    async fn concurrent_runs_for_the_same_seller_are_rejected() {
        let ledger = Arc::new(InMemoryLedgerStore::new());
        let downloader = Arc::new(FixtureDownloader {
            calls: AtomicU32::new(0),
            cancel_after: None,
        });
        let orchestrator = Arc::new(SyncOrchestrator::new(test_config(), downloader, ledger));

        let job_a = orchestrator.submit("seller-1".into(), 1).await;
        let job_b = orchestrator.submit("seller-1".into(), 1).await;

        let orchestrator_clone = Arc::clone(&orchestrator);
        let job_a_clone = job_a.clone();
        let first = tokio::spawn(async move { orchestrator_clone.run(&job_a_clone).await });

        tokio::task::yield_now().await;
        let second = orchestrator.run(&job_b).await;
        assert!(matches!(second, Err(OrchestratorError::Conflict(_))));

        first.await.expect("task join").expect("first run");
    }
}
