mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use common::{MockFactory, Scripted, fast_config};
use scrape_sentinel::{
    CoordinatorConfig, CoordinatorResult, ErrorKind, JobCallback, JobExecutor, JobFailureKind,
    JobId, JobPriority, JobResult, JobScheduler, JobStatus, ManualClock, PacingConfig,
    RateLimitConfig, ResourceCoordinator, SchedulerConfig, SearchPageExecutor, Submission,
};
use tokio::sync::Semaphore;

const WAIT: Duration = Duration::from_secs(5);

/// Records the order queries run in; blocks until the gate opens.
struct GatedExecutor {
    gate: Semaphore,
    runs: AtomicUsize,
    order: Mutex<Vec<String>>,
}

impl GatedExecutor {
    fn open() -> Arc<Self> {
        let executor = Self::closed();
        executor.release();
        executor
    }

    fn closed() -> Arc<Self> {
        Arc::new(Self {
            gate: Semaphore::new(0),
            runs: AtomicUsize::new(0),
            order: Mutex::new(Vec::new()),
        })
    }

    fn release(&self) {
        self.gate.add_permits(1_000);
    }

    fn order(&self) -> Vec<String> {
        self.order.lock().unwrap().clone()
    }
}

#[async_trait]
impl JobExecutor for GatedExecutor {
    async fn run(
        &self,
        _coordinator: &ResourceCoordinator,
        query: &str,
        location: Option<&str>,
    ) -> CoordinatorResult<String> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        let _permit = self.gate.acquire().await.expect("gate stays open");
        self.order.lock().unwrap().push(query.to_string());
        Ok(format!("results for {query} in {}", location.unwrap_or("anywhere")))
    }
}

fn config(workers: usize) -> CoordinatorConfig {
    config_with_ttl(workers, 3600)
}

fn config_with_ttl(workers: usize, cache_ttl_secs: u64) -> CoordinatorConfig {
    CoordinatorConfig::builder()
        .with_pacing(PacingConfig::disabled())
        .with_rate_limit(RateLimitConfig {
            wait_for_token: false,
            ..RateLimitConfig::default()
        })
        .with_scheduler(SchedulerConfig {
            workers,
            cache_ttl_secs,
        })
        .build()
        .unwrap()
}

fn coordinator(config: CoordinatorConfig, clock: &Arc<ManualClock>) -> Arc<ResourceCoordinator> {
    Arc::new(
        ResourceCoordinator::builder()
            .with_config(config)
            .with_clock(clock.clone())
            .with_session_factory(Arc::new(MockFactory::new()))
            .build()
            .unwrap(),
    )
}

fn collect_into(sink: &Arc<Mutex<Vec<(JobId, JobResult)>>>) -> JobCallback {
    let sink = sink.clone();
    Box::new(move |id: JobId, result: &JobResult| {
        sink.lock().unwrap().push((id, result.clone()));
    })
}

fn queued(submission: Submission) -> JobId {
    submission.job_id().expect("job was queued")
}

async fn until_processing(scheduler: &JobScheduler, id: JobId) {
    for _ in 0..500 {
        if scheduler.get_job_status(id) == Some(JobStatus::Processing) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    panic!("{id} never started");
}

#[tokio::test]
async fn completed_results_are_cached() {
    let clock = Arc::new(ManualClock::new());
    let executor = GatedExecutor::open();
    let scheduler = JobScheduler::start(coordinator(config(2), &clock), executor.clone());

    let id = queued(scheduler.queue_query("Plumbers", Some("Denver, CO"), JobPriority::Normal, None));
    let result = scheduler.wait_for_result(id, WAIT).await.unwrap();
    assert_eq!(result.unwrap(), "results for Plumbers in Denver, CO");
    assert_eq!(scheduler.get_job_status(id), Some(JobStatus::Completed));

    let again = scheduler.queue_query("  plumbers ", Some("denver,  co"), JobPriority::Urgent, None);
    assert_eq!(
        again,
        Submission::Cached("results for Plumbers in Denver, CO".to_string())
    );
    assert_eq!(executor.runs.load(Ordering::SeqCst), 1);
    assert_eq!(scheduler.stats().completed, 1);

    clock.advance_minutes(61);
    assert!(matches!(
        scheduler.queue_query("plumbers", Some("denver, co"), JobPriority::Normal, None),
        Submission::Queued(_)
    ));
}

#[tokio::test]
async fn urgent_jobs_run_before_earlier_background_jobs() {
    let clock = Arc::new(ManualClock::new());
    let executor = GatedExecutor::closed();
    let scheduler = JobScheduler::start(coordinator(config(1), &clock), executor.clone());

    let blocker = queued(scheduler.queue_query("blocker", None, JobPriority::Normal, None));
    until_processing(&scheduler, blocker).await;

    let background = queued(scheduler.queue_query("nightly", None, JobPriority::Background, None));
    let low = queued(scheduler.queue_query("weekly", None, JobPriority::Low, None));
    let first = queued(scheduler.queue_query("breaking", None, JobPriority::Urgent, None));
    let second = queued(scheduler.queue_query("escalation", None, JobPriority::Urgent, None));
    assert_eq!(scheduler.stats().queued, 4);

    executor.release();
    for id in [background, low, first, second] {
        scheduler.wait_for_result(id, WAIT).await.unwrap().unwrap();
    }
    assert_eq!(
        executor.order(),
        vec!["blocker", "breaking", "escalation", "weekly", "nightly"]
    );
}

#[tokio::test]
async fn duplicate_queries_share_a_job_and_callbacks_fire_once() {
    let clock = Arc::new(ManualClock::new());
    let executor = GatedExecutor::closed();
    let scheduler = JobScheduler::start(coordinator(config(1), &clock), executor.clone());
    let sink = Arc::new(Mutex::new(Vec::new()));

    let first = queued(scheduler.queue_query("hvac", Some("Austin"), JobPriority::High, Some(collect_into(&sink))));
    let second = queued(scheduler.queue_query("HVAC", Some("austin"), JobPriority::High, Some(collect_into(&sink))));
    assert_eq!(first, second);

    executor.release();
    scheduler.wait_for_result(first, WAIT).await.unwrap().unwrap();

    let calls = sink.lock().unwrap().clone();
    assert_eq!(calls.len(), 2);
    assert!(calls.iter().all(|(id, result)| *id == first && result.is_ok()));
    assert_eq!(executor.runs.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn only_queued_jobs_can_be_cancelled() {
    let clock = Arc::new(ManualClock::new());
    let executor = GatedExecutor::closed();
    let scheduler = JobScheduler::start(coordinator(config(1), &clock), executor.clone());
    let sink = Arc::new(Mutex::new(Vec::new()));

    let running = queued(scheduler.queue_query("running", None, JobPriority::Normal, None));
    until_processing(&scheduler, running).await;
    let waiting = queued(scheduler.queue_query("waiting", None, JobPriority::Normal, Some(collect_into(&sink))));

    assert!(!scheduler.cancel(running));
    assert!(scheduler.cancel(waiting));
    assert!(!scheduler.cancel(waiting));
    assert_eq!(scheduler.get_job_status(waiting), Some(JobStatus::Cancelled));

    let failure = scheduler.get_job_result(waiting).unwrap().unwrap_err();
    assert_eq!(failure.kind, JobFailureKind::Cancelled);
    assert_eq!(sink.lock().unwrap().len(), 1);

    executor.release();
    scheduler.wait_for_result(running, WAIT).await.unwrap().unwrap();
    assert_eq!(executor.order(), vec!["running"]);
    assert_eq!(scheduler.stats().cancelled, 1);
}

#[tokio::test]
async fn wait_for_result_times_out_and_take_removes_the_job() {
    let clock = Arc::new(ManualClock::new());
    let executor = GatedExecutor::closed();
    let scheduler = JobScheduler::start(coordinator(config(1), &clock), executor.clone());

    let id = queued(scheduler.queue_query("roofers", None, JobPriority::Normal, None));
    assert!(scheduler.wait_for_result(id, Duration::from_millis(20)).await.is_none());
    assert!(scheduler.take_job_result(id).is_none());
    assert!(scheduler.wait_for_result(JobId(999), WAIT).await.is_none());

    executor.release();
    scheduler.wait_for_result(id, WAIT).await.unwrap().unwrap();
    assert!(scheduler.take_job_result(id).unwrap().is_ok());
    assert_eq!(scheduler.get_job_status(id), None);
}

#[tokio::test]
async fn finished_jobs_are_purged_after_the_ttl() {
    let clock = Arc::new(ManualClock::new());
    let executor = GatedExecutor::open();
    let scheduler = JobScheduler::start(coordinator(config(2), &clock), executor);

    let id = queued(scheduler.queue_query("electricians", None, JobPriority::Low, None));
    scheduler.wait_for_result(id, WAIT).await.unwrap().unwrap();

    assert_eq!(scheduler.purge_finished(), 0);
    clock.advance_minutes(61);
    assert_eq!(scheduler.purge_finished(), 1);
    assert_eq!(scheduler.get_job_status(id), None);
    assert!(scheduler.cache().is_empty());

    scheduler.shutdown().await;
}

#[tokio::test]
async fn expired_jobs_are_gone_without_an_explicit_purge() {
    let clock = Arc::new(ManualClock::new());
    let executor = GatedExecutor::open();
    let scheduler = JobScheduler::start(coordinator(config(1), &clock), executor);

    let id = queued(scheduler.queue_query("locksmiths", Some("Tulsa"), JobPriority::Normal, None));
    scheduler.wait_for_result(id, WAIT).await.unwrap().unwrap();
    assert_eq!(scheduler.stats().completed, 1);

    clock.advance_minutes(48 * 60);
    assert_eq!(scheduler.get_job_status(id), None);
    assert!(scheduler.get_job_result(id).is_none());
    assert!(scheduler.take_job_result(id).is_none());
    assert!(scheduler.wait_for_result(id, WAIT).await.is_none());

    let stats = scheduler.stats();
    assert_eq!(stats.completed, 0);
    assert_eq!(stats.cached_results, 0);
}

#[tokio::test]
async fn background_purge_evicts_expired_results() {
    let clock = Arc::new(ManualClock::new());
    let executor = GatedExecutor::open();
    let scheduler = JobScheduler::start(coordinator(config_with_ttl(1, 1), &clock), executor);

    let id = queued(scheduler.queue_query("florists", None, JobPriority::Normal, None));
    scheduler.wait_for_result(id, WAIT).await.unwrap().unwrap();
    assert_eq!(scheduler.cache().len(), 1);

    clock.advance_minutes(5);
    for _ in 0..300 {
        if scheduler.cache().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(scheduler.cache().is_empty());
    scheduler.shutdown().await;
}

#[tokio::test]
async fn cached_pages_win_over_a_job_still_in_flight() {
    let clock = Arc::new(ManualClock::new());
    let executor = GatedExecutor::closed();
    let scheduler = JobScheduler::start(coordinator(config(1), &clock), executor.clone());

    let running = queued(scheduler.queue_query("painters", None, JobPriority::Normal, None));
    until_processing(&scheduler, running).await;
    scheduler.cache().insert("painters", None, "fresh page");

    assert_eq!(
        scheduler.queue_query("Painters", None, JobPriority::Normal, None),
        Submission::Cached("fresh page".to_string())
    );

    executor.release();
    scheduler.wait_for_result(running, WAIT).await.unwrap().unwrap();
    assert_eq!(executor.runs.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn search_pages_flow_through_the_coordinator() {
    let clock = Arc::new(ManualClock::new());
    let factory = MockFactory::new();
    let coordinator = Arc::new(
        ResourceCoordinator::builder()
            .with_config(fast_config())
            .with_clock(clock.clone())
            .with_session_factory(Arc::new(factory.clone()))
            .build()
            .unwrap(),
    );
    let executor = Arc::new(SearchPageExecutor::new(
        "www.google.com",
        "https://www.google.com/search?q={query}+{location}",
    ));
    let scheduler = JobScheduler::start(coordinator.clone(), executor);

    factory.push(Scripted::Page("<html>10 results</html>".into()));
    let id = queued(scheduler.queue_query("tax advisors", Some("Boise"), JobPriority::Normal, None));
    assert_eq!(
        scheduler.wait_for_result(id, WAIT).await.unwrap().unwrap(),
        "<html>10 results</html>"
    );
    assert_eq!(
        factory.probe.visited(),
        vec!["https://www.google.com/search?q=tax+advisors+Boise"]
    );

    factory.push(Scripted::Captcha);
    let id = queued(scheduler.queue_query("notaries", Some("Boise"), JobPriority::Normal, None));
    let failure = scheduler.wait_for_result(id, WAIT).await.unwrap().unwrap_err();
    assert_eq!(failure.kind, JobFailureKind::Coordinator(ErrorKind::DetectionSignal));
    assert!(failure.retryable);
    assert!(!scheduler.cache().is_empty());

    let metrics = coordinator.metrics().unwrap().snapshot();
    assert_eq!(metrics.global.jobs_completed, 1);
    assert_eq!(metrics.global.jobs_failed, 1);
    assert_eq!(metrics.global.detections, 1);
}
