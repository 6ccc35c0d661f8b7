//! Prioritized job queue in front of the coordinator.
//!
//! Jobs are search-style queries. A fixed pool of workers drains the queue
//! highest priority first (FIFO within a band) and drives each job through
//! [`ResourceCoordinator::execute`]; the coordinator's per-target lock is what
//! bounds real parallelism. Completed results land in a TTL cache so repeated
//! queries are answered without new work.

mod cache;

pub use self::cache::ResultCache;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use url::form_urlencoded;

use self::cache::cache_key;
use crate::coordinator::{CoordinatorError, CoordinatorResult, ErrorKind, ResourceCoordinator};
use crate::modules::clock::{SharedClock, chrono_duration};
use crate::modules::events::{CoordinatorEvent, JobEvent};

const MAX_PURGE_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub workers: usize,
    /// Lifetime of cached results; also how long finished jobs are retained.
    pub cache_ttl_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            cache_ttl_secs: 3600,
        }
    }
}

impl SchedulerConfig {
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }
}

/// Scheduling band, most urgent first.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobPriority {
    Urgent,
    High,
    #[default]
    Normal,
    Low,
    Background,
}

impl JobPriority {
    fn rank(self) -> u8 {
        match self {
            JobPriority::Urgent => 4,
            JobPriority::High => 3,
            JobPriority::Normal => 2,
            JobPriority::Low => 1,
            JobPriority::Background => 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobId(pub u64);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "job-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobFailureKind {
    Coordinator(ErrorKind),
    Panicked,
    Cancelled,
}

/// Why a job did not produce a page.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobFailure {
    pub kind: JobFailureKind,
    pub message: String,
    pub retryable: bool,
}

impl From<&CoordinatorError> for JobFailure {
    fn from(err: &CoordinatorError) -> Self {
        Self {
            kind: JobFailureKind::Coordinator(err.kind()),
            message: err.to_string(),
            retryable: err.is_retryable(),
        }
    }
}

impl fmt::Display for JobFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

pub type JobResult = Result<String, JobFailure>;

/// Invoked once when a job reaches a terminal state.
pub type JobCallback = Box<dyn FnOnce(JobId, &JobResult) + Send>;

/// Outcome of [`JobScheduler::queue_query`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Submission {
    /// Served from the result cache; no job was created.
    Cached(String),
    Queued(JobId),
}

impl Submission {
    pub fn job_id(&self) -> Option<JobId> {
        match self {
            Submission::Queued(id) => Some(*id),
            Submission::Cached(_) => None,
        }
    }
}

/// Turns a job's query into coordinated work.
#[async_trait]
pub trait JobExecutor: Send + Sync {
    async fn run(
        &self,
        coordinator: &ResourceCoordinator,
        query: &str,
        location: Option<&str>,
    ) -> CoordinatorResult<String>;
}

/// Loads a search page built from a URL template and returns its body.
///
/// `{query}` and `{location}` placeholders are replaced with their
/// form-encoded values.
#[derive(Debug, Clone)]
pub struct SearchPageExecutor {
    target: String,
    url_template: String,
}

impl SearchPageExecutor {
    pub fn new(target: impl Into<String>, url_template: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            url_template: url_template.into(),
        }
    }

    pub fn render_url(&self, query: &str, location: Option<&str>) -> String {
        let encode = |raw: &str| form_urlencoded::byte_serialize(raw.as_bytes()).collect::<String>();
        self.url_template
            .replace("{query}", &encode(query))
            .replace("{location}", &encode(location.unwrap_or_default()))
    }
}

#[async_trait]
impl JobExecutor for SearchPageExecutor {
    async fn run(
        &self,
        coordinator: &ResourceCoordinator,
        query: &str,
        location: Option<&str>,
    ) -> CoordinatorResult<String> {
        let url = self.render_url(query, location);
        coordinator
            .execute(&self.target, move |session| {
                Box::pin(async move {
                    session.navigate(&url).await?;
                    session.content().await
                })
            })
            .await
    }
}

/// Queue counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SchedulerStats {
    pub queued: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub cached_results: usize,
    pub workers: usize,
}

struct JobRecord {
    query: String,
    location: Option<String>,
    priority: JobPriority,
    status: JobStatus,
    submitted_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
    result: Option<JobResult>,
    callbacks: Vec<JobCallback>,
    status_tx: watch::Sender<JobStatus>,
}

#[derive(Debug, PartialEq, Eq)]
struct QueuedJob {
    id: JobId,
    priority: JobPriority,
    sequence: u64,
}

impl Ord for QueuedJob {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .rank()
            .cmp(&other.priority.rank())
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

impl PartialOrd for QueuedJob {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Default)]
struct QueueState {
    queue: BinaryHeap<QueuedJob>,
    jobs: HashMap<JobId, JobRecord>,
    in_flight: HashMap<String, JobId>,
    next_id: u64,
    next_sequence: u64,
}

impl QueueState {
    /// Drops finished jobs whose retention ended at or before `cutoff`.
    fn expire_finished(&mut self, cutoff: DateTime<Utc>) -> usize {
        let before = self.jobs.len();
        self.jobs.retain(|_, record| is_retained(record, cutoff));
        before - self.jobs.len()
    }

    /// A job still visible to callers.
    fn live(&self, id: JobId, cutoff: DateTime<Utc>) -> Option<&JobRecord> {
        self.jobs.get(&id).filter(|record| is_retained(record, cutoff))
    }

    /// Pops the next job still waiting to run; cancelled entries are skipped.
    fn pop_ready(&mut self) -> Option<JobId> {
        while let Some(queued) = self.queue.pop() {
            if let Some(record) = self.jobs.get_mut(&queued.id)
                && record.status == JobStatus::Queued
            {
                record.status = JobStatus::Processing;
                record.status_tx.send_replace(JobStatus::Processing);
                return Some(queued.id);
            }
        }
        None
    }
}

struct SchedulerInner {
    config: SchedulerConfig,
    clock: SharedClock,
    coordinator: Arc<ResourceCoordinator>,
    executor: Arc<dyn JobExecutor>,
    cache: ResultCache,
    state: Mutex<QueueState>,
    notify: Notify,
    stopped: Notify,
    shutdown: AtomicBool,
}

/// Worker pool draining the job queue through the coordinator.
pub struct JobScheduler {
    inner: Arc<SchedulerInner>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl fmt::Debug for JobScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobScheduler")
            .field("workers", &self.inner.config.workers)
            .field("stats", &self.stats())
            .finish()
    }
}

impl JobScheduler {
    /// Spawns the worker pool on the current tokio runtime, sized and cached
    /// per the coordinator's scheduler configuration.
    pub fn start(coordinator: Arc<ResourceCoordinator>, executor: Arc<dyn JobExecutor>) -> Self {
        let config = coordinator.config().scheduler.clone();
        let clock = coordinator.clock().clone();
        let inner = Arc::new(SchedulerInner {
            cache: ResultCache::new(config.cache_ttl(), clock.clone()),
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            stopped: Notify::new(),
            shutdown: AtomicBool::new(false),
            config,
            clock,
            coordinator,
            executor,
        });

        let mut workers: Vec<_> = (0..inner.config.workers.max(1))
            .map(|worker| tokio::spawn(worker_loop(inner.clone(), worker)))
            .collect();
        workers.push(tokio::spawn(janitor_loop(inner.clone())));
        log::info!("job scheduler started with {} worker(s)", inner.config.workers.max(1));

        Self {
            inner,
            workers: Mutex::new(workers),
        }
    }

    pub fn cache(&self) -> &ResultCache {
        &self.inner.cache
    }

    /// Enqueues a query and returns immediately. Cached results are returned
    /// synchronously; a query identical to one still queued or running joins
    /// that job.
    pub fn queue_query(
        &self,
        query: &str,
        location: Option<&str>,
        priority: JobPriority,
        callback: Option<JobCallback>,
    ) -> Submission {
        let key = cache_key(query, location);
        // Checked under the queue lock: a job caches its page before it leaves
        // `in_flight`, so one of the two always sees it.
        let mut state = self.inner.lock();
        if let Some(value) = self.inner.cache.get(query, location) {
            log::debug!("cache hit for '{query}'");
            return Submission::Cached(value);
        }
        if let Some(&existing) = state.in_flight.get(&key)
            && let Some(record) = state.jobs.get_mut(&existing)
        {
            record.callbacks.extend(callback);
            log::debug!("'{query}' coalesced onto {existing}");
            return Submission::Queued(existing);
        }

        state.next_id += 1;
        state.next_sequence += 1;
        let id = JobId(state.next_id);
        let sequence = state.next_sequence;
        let (status_tx, _) = watch::channel(JobStatus::Queued);
        state.jobs.insert(
            id,
            JobRecord {
                query: query.to_string(),
                location: location.map(str::to_string),
                priority,
                status: JobStatus::Queued,
                submitted_at: self.inner.clock.now(),
                finished_at: None,
                result: None,
                callbacks: callback.into_iter().collect(),
                status_tx,
            },
        );
        state.in_flight.insert(key, id);
        state.queue.push(QueuedJob {
            id,
            priority,
            sequence,
        });
        drop(state);

        log::debug!("queued {id} '{query}' ({priority:?})");
        self.inner.notify.notify_one();
        Submission::Queued(id)
    }

    /// Waits until the job is terminal or `timeout` passes.
    pub async fn wait_for_result(&self, id: JobId, timeout: Duration) -> Option<JobResult> {
        let mut status_rx = {
            let cutoff = self.inner.retention_cutoff();
            let state = self.inner.lock();
            state.live(id, cutoff)?.status_tx.subscribe()
        };
        let finished = tokio::time::timeout(timeout, status_rx.wait_for(|status| status.is_terminal()))
            .await
            .map(|waited| waited.is_ok())
            .unwrap_or(false);
        if !finished {
            return None;
        }
        self.get_job_result(id)
    }

    /// Result of a finished job still inside its retention window.
    pub fn get_job_result(&self, id: JobId) -> Option<JobResult> {
        let cutoff = self.inner.retention_cutoff();
        self.inner
            .lock()
            .live(id, cutoff)
            .and_then(|record| record.result.clone())
    }

    pub fn get_job_status(&self, id: JobId) -> Option<JobStatus> {
        let cutoff = self.inner.retention_cutoff();
        self.inner.lock().live(id, cutoff).map(|record| record.status)
    }

    /// Removes a finished job and hands back its result.
    pub fn take_job_result(&self, id: JobId) -> Option<JobResult> {
        let cutoff = self.inner.retention_cutoff();
        let mut state = self.inner.lock();
        if !state.live(id, cutoff)?.status.is_terminal() {
            return None;
        }
        state.jobs.remove(&id).and_then(|record| record.result)
    }

    /// Cancels a job that has not started yet.
    pub fn cancel(&self, id: JobId) -> bool {
        let failure = JobFailure {
            kind: JobFailureKind::Cancelled,
            message: format!("{id} cancelled before it ran"),
            retryable: true,
        };
        let callbacks = {
            let mut state = self.inner.lock();
            let Some(record) = state.jobs.get_mut(&id) else {
                return false;
            };
            if record.status != JobStatus::Queued {
                return false;
            }
            record.status = JobStatus::Cancelled;
            record.finished_at = Some(self.inner.clock.now());
            record.result = Some(Err(failure.clone()));
            record.status_tx.send_replace(JobStatus::Cancelled);
            let callbacks = std::mem::take(&mut record.callbacks);
            let key = cache_key(&record.query, record.location.as_deref());
            state.in_flight.remove(&key);
            callbacks
        };
        log::debug!("cancelled {id}");
        fire_callbacks(id, callbacks, &Err(failure));
        true
    }

    pub fn stats(&self) -> SchedulerStats {
        self.inner.purge_finished();
        let state = self.inner.lock();
        let mut stats = SchedulerStats {
            cached_results: self.inner.cache.len(),
            workers: self.inner.config.workers.max(1),
            ..SchedulerStats::default()
        };
        for record in state.jobs.values() {
            match record.status {
                JobStatus::Queued => stats.queued += 1,
                JobStatus::Processing => stats.processing += 1,
                JobStatus::Completed => stats.completed += 1,
                JobStatus::Failed => stats.failed += 1,
                JobStatus::Cancelled => stats.cancelled += 1,
            }
        }
        stats
    }

    /// Forgets finished jobs older than the cache TTL and expired cache
    /// entries. Returns the number of jobs removed.
    ///
    /// A background task also does this periodically.
    pub fn purge_finished(&self) -> usize {
        self.inner.purge_finished()
    }

    /// Stops the workers after their current job. Queued jobs stay queued.
    pub async fn shutdown(&self) {
        self.inner.stop();
        let workers = std::mem::take(
            &mut *self
                .workers
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        );
        for worker in workers {
            if let Err(err) = worker.await {
                log::error!("scheduler worker ended abnormally: {err}");
            }
        }
        log::info!("job scheduler stopped");
    }
}

impl Drop for JobScheduler {
    fn drop(&mut self) {
        self.inner.stop();
    }
}

impl SchedulerInner {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn is_stopping(&self) -> bool {
        self.shutdown.load(AtomicOrdering::Acquire)
    }

    fn stop(&self) {
        self.shutdown.store(true, AtomicOrdering::Release);
        self.notify.notify_waiters();
        self.stopped.notify_waiters();
    }

    /// Jobs that finished at or before this instant are gone.
    fn retention_cutoff(&self) -> DateTime<Utc> {
        self.clock.now() - chrono_duration(self.config.cache_ttl())
    }

    fn purge_finished(&self) -> usize {
        let cutoff = self.retention_cutoff();
        let purged = self.lock().expire_finished(cutoff);
        let expired = self.cache.purge_expired();
        if purged > 0 || expired > 0 {
            log::debug!("purged {purged} finished job(s), {expired} cached result(s)");
        }
        purged
    }

    async fn run_job(&self, id: JobId) {
        let Some((query, location)) = self
            .lock()
            .jobs
            .get(&id)
            .map(|record| (record.query.clone(), record.location.clone()))
        else {
            return;
        };

        let coordinator = self.coordinator.clone();
        let executor = self.executor.clone();
        let (task_query, task_location) = (query.clone(), location.clone());
        let task = tokio::spawn(async move {
            executor
                .run(&coordinator, &task_query, task_location.as_deref())
                .await
        });

        let result: JobResult = match task.await {
            Ok(Ok(page)) => Ok(page),
            Ok(Err(err)) => Err(JobFailure::from(&err)),
            Err(err) => Err(JobFailure {
                kind: JobFailureKind::Panicked,
                message: format!("{id} aborted: {err}"),
                retryable: false,
            }),
        };

        if let Ok(page) = &result {
            self.cache.insert(&query, location.as_deref(), page.clone());
        }
        self.finish(id, &query, location.as_deref(), result);
    }

    fn finish(&self, id: JobId, query: &str, location: Option<&str>, result: JobResult) {
        let status = if result.is_ok() {
            JobStatus::Completed
        } else {
            JobStatus::Failed
        };

        let callbacks = {
            let mut state = self.lock();
            let key = cache_key(query, location);
            if state.in_flight.get(&key) == Some(&id) {
                state.in_flight.remove(&key);
            }
            match state.jobs.get_mut(&id) {
                Some(record) => {
                    record.status = status;
                    record.finished_at = Some(self.clock.now());
                    record.result = Some(result.clone());
                    record.status_tx.send_replace(status);
                    log::debug!(
                        "{id} ({:?}) {status:?} after {}s",
                        record.priority,
                        (self.clock.now() - record.submitted_at).num_seconds()
                    );
                    std::mem::take(&mut record.callbacks)
                }
                None => Vec::new(),
            }
        };

        self.coordinator.emit(CoordinatorEvent::JobFinished(JobEvent {
            job_id: id.0,
            query: query.to_string(),
            success: result.is_ok(),
            timestamp: self.clock.now(),
        }));
        fire_callbacks(id, callbacks, &result);
    }
}

async fn worker_loop(inner: Arc<SchedulerInner>, worker: usize) {
    log::debug!("scheduler worker {worker} started");
    loop {
        if inner.is_stopping() {
            break;
        }
        // Registered before checking the queue so a push in between still wakes us.
        let notified = inner.notify.notified();
        let next = inner.lock().pop_ready();
        match next {
            Some(id) => inner.run_job(id).await,
            None => notified.await,
        }
    }
    log::debug!("scheduler worker {worker} stopped");
}

/// Periodically forgets finished jobs and expired cache entries.
async fn janitor_loop(inner: Arc<SchedulerInner>) {
    let period = inner
        .config
        .cache_ttl()
        .clamp(Duration::from_secs(1), MAX_PURGE_INTERVAL);
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        let stopped = inner.stopped.notified();
        if inner.is_stopping() {
            break;
        }
        tokio::select! {
            _ = ticker.tick() => {
                inner.purge_finished();
            }
            _ = stopped => break,
        }
    }
}

fn is_retained(record: &JobRecord, cutoff: DateTime<Utc>) -> bool {
    record.finished_at.is_none_or(|at| at > cutoff)
}

fn fire_callbacks(id: JobId, callbacks: Vec<JobCallback>, result: &JobResult) {
    for callback in callbacks {
        if catch_unwind(AssertUnwindSafe(|| callback(id, result))).is_err() {
            log::error!("callback for {id} panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn push(state: &mut QueueState, priority: JobPriority) -> JobId {
        state.next_id += 1;
        state.next_sequence += 1;
        let id = JobId(state.next_id);
        let (status_tx, _) = watch::channel(JobStatus::Queued);
        state.jobs.insert(
            id,
            JobRecord {
                query: format!("q{}", id.0),
                location: None,
                priority,
                status: JobStatus::Queued,
                submitted_at: Utc::now(),
                finished_at: None,
                result: None,
                callbacks: Vec::new(),
                status_tx,
            },
        );
        state.queue.push(QueuedJob {
            id,
            priority,
            sequence: state.next_sequence,
        });
        id
    }

    #[test]
    fn urgent_jobs_overtake_earlier_background_jobs() {
        let mut state = QueueState::default();
        let background = push(&mut state, JobPriority::Background);
        let normal = push(&mut state, JobPriority::Normal);
        let first_urgent = push(&mut state, JobPriority::Urgent);
        let second_urgent = push(&mut state, JobPriority::Urgent);

        let order: Vec<_> = std::iter::from_fn(|| state.pop_ready()).collect();
        assert_eq!(order, vec![first_urgent, second_urgent, normal, background]);
    }

    #[test]
    fn cancelled_entries_are_skipped() {
        let mut state = QueueState::default();
        let first = push(&mut state, JobPriority::High);
        let second = push(&mut state, JobPriority::Low);
        state.jobs.get_mut(&first).unwrap().status = JobStatus::Cancelled;

        assert_eq!(state.pop_ready(), Some(second));
        assert_eq!(state.jobs[&second].status, JobStatus::Processing);
        assert_eq!(state.pop_ready(), None);
    }

    #[test]
    fn search_urls_are_form_encoded() {
        let executor = SearchPageExecutor::new(
            "www.google.com",
            "https://www.google.com/search?q={query}&near={location}",
        );
        assert_eq!(
            executor.render_url("pizza & pasta", Some("Austin, TX")),
            "https://www.google.com/search?q=pizza+%26+pasta&near=Austin%2C+TX"
        );
        assert_eq!(
            executor.render_url("dentist", None),
            "https://www.google.com/search?q=dentist&near="
        );
    }

    #[test]
    fn job_ids_display_with_prefix() {
        assert_eq!(JobId(7).to_string(), "job-7");
        assert!(JobStatus::Cancelled.is_terminal());
        assert!(!JobStatus::Processing.is_terminal());
    }
}
