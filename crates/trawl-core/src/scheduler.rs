//! Fixed worker pool draining a shared job queue.
//!
//! Each worker takes a job, waits for a rate-limit token for the job's
//! source, calls the extractor under a timeout, and then either hands the
//! terminal result to the aggregator or schedules a delayed re-enqueue.
//! Retry delays run on their own task so a backing-off job never occupies
//! a worker.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::aggregator::AggregatorMessage;
use crate::error::{AppError, ErrorKind};
use crate::job::ExtractionJob;
use crate::models::{ExtractedData, ExtractionResult, Target};
use crate::rate_limit::RateLimiter;
use crate::retry::{RetryDecision, RetryPolicy};
use crate::traits::ExtractorRegistry;

/// Events emitted by the workers for monitoring/logging.
#[derive(Debug, Clone)]
pub enum WorkerEvent<'a> {
    WorkerStarted {
        worker_id: usize,
    },
    /// A rate-limit slot was granted and the extractor is being called.
    JobStarted {
        job_id: Uuid,
        target: &'a Target,
        attempt: u32,
        queued: Duration,
    },
    JobSucceeded {
        job_id: Uuid,
        target: &'a Target,
        items: usize,
        attempts: u32,
    },
    JobFailed {
        job_id: Uuid,
        target: &'a Target,
        kind: ErrorKind,
        error: &'a str,
        will_retry: bool,
    },
    RetryScheduled {
        job_id: Uuid,
        target: &'a Target,
        attempt: u32,
        delay: Duration,
    },
    /// The run was cancelled before the job reached a terminal outcome.
    JobAbandoned {
        job_id: Uuid,
        target: &'a Target,
    },
    WorkerStopped {
        worker_id: usize,
    },
}

/// Trait for receiving worker events (decoupled logging).
pub trait WorkerReporter: Send + Sync {
    fn report(&self, event: WorkerEvent<'_>) {
        let _ = event;
    }
}

/// Reporter that uses the `tracing` crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingWorkerReporter;

impl WorkerReporter for TracingWorkerReporter {
    fn report(&self, event: WorkerEvent<'_>) {
        match event {
            WorkerEvent::WorkerStarted { worker_id } => {
                tracing::debug!(%worker_id, "Worker started");
            }
            WorkerEvent::JobStarted {
                job_id,
                target,
                attempt,
                queued,
            } => {
                tracing::info!(
                    %job_id,
                    %target,
                    attempt = attempt + 1,
                    queued_ms = %queued.as_millis(),
                    "Extracting"
                );
            }
            WorkerEvent::JobSucceeded {
                job_id,
                target,
                items,
                attempts,
            } => {
                tracing::info!(%job_id, %target, %items, %attempts, "Extraction succeeded");
            }
            WorkerEvent::JobFailed {
                job_id,
                target,
                kind,
                error,
                will_retry,
            } => {
                tracing::warn!(%job_id, %target, %kind, %error, %will_retry, "Extraction failed");
            }
            WorkerEvent::RetryScheduled {
                job_id,
                target,
                attempt,
                delay,
            } => {
                tracing::info!(
                    %job_id,
                    %target,
                    next_attempt = attempt + 1,
                    delay_ms = %delay.as_millis(),
                    "Retry scheduled"
                );
            }
            WorkerEvent::JobAbandoned { job_id, target } => {
                tracing::info!(%job_id, %target, "Job abandoned after cancel");
            }
            WorkerEvent::WorkerStopped { worker_id } => {
                tracing::debug!(%worker_id, "Worker stopped");
            }
        }
    }
}

/// Shared, immutable pieces every worker of every run needs.
pub(crate) struct Scheduler {
    registry: ExtractorRegistry,
    limiter: RateLimiter,
    retry: RetryPolicy,
    call_timeout: Duration,
    reporter: Arc<dyn WorkerReporter>,
}

/// Per-run channels and signals.
#[derive(Clone)]
pub(crate) struct RunChannels {
    pub results: mpsc::UnboundedSender<AggregatorMessage>,
    /// Run-level cancel requested by the caller.
    pub cancel: CancellationToken,
    /// Every job has a terminal result.
    pub all_done: CancellationToken,
}

type JobQueue = Arc<Mutex<mpsc::UnboundedReceiver<ExtractionJob>>>;

impl Scheduler {
    pub(crate) fn new(
        registry: ExtractorRegistry,
        limiter: RateLimiter,
        retry: RetryPolicy,
        call_timeout: Duration,
        reporter: Arc<dyn WorkerReporter>,
    ) -> Self {
        Self {
            registry,
            limiter,
            retry,
            call_timeout,
            reporter,
        }
    }

    pub(crate) fn registry(&self) -> &ExtractorRegistry {
        &self.registry
    }

    /// Runs `jobs` on up to `workers` workers and returns once every worker
    /// has exited, either because all jobs are done or the run was cancelled.
    pub(crate) async fn run(
        self: Arc<Self>,
        jobs: Vec<ExtractionJob>,
        workers: usize,
        channels: RunChannels,
    ) {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let pool_size = workers.min(jobs.len()).max(1);
        for job in jobs {
            // The receiver is alive until the workers below have exited.
            let _ = queue_tx.send(job);
        }
        let queue: JobQueue = Arc::new(Mutex::new(queue_rx));

        let mut set = JoinSet::new();
        for worker_id in 0..pool_size {
            let worker = Worker {
                id: worker_id,
                scheduler: Arc::clone(&self),
                queue: Arc::clone(&queue),
                requeue: queue_tx.clone(),
                channels: channels.clone(),
            };
            set.spawn(worker.run());
        }
        drop(queue_tx);

        while let Some(joined) = set.join_next().await {
            if let Err(e) = joined {
                tracing::error!(error = %e, "Worker task panicked");
            }
        }
    }
}

struct Worker {
    id: usize,
    scheduler: Arc<Scheduler>,
    queue: JobQueue,
    requeue: mpsc::UnboundedSender<ExtractionJob>,
    channels: RunChannels,
}

impl Worker {
    async fn run(self) {
        let reporter = &self.scheduler.reporter;
        reporter.report(WorkerEvent::WorkerStarted { worker_id: self.id });

        while let Some(job) = self.next_job().await {
            self.process(job).await;
        }

        reporter.report(WorkerEvent::WorkerStopped { worker_id: self.id });
    }

    /// Next queued job, or `None` once the run is cancelled or finished.
    async fn next_job(&self) -> Option<ExtractionJob> {
        let cancel = &self.channels.cancel;
        let all_done = &self.channels.all_done;

        let mut queue = tokio::select! {
            biased;
            () = cancel.cancelled() => return None,
            () = all_done.cancelled() => return None,
            queue = self.queue.lock() => queue,
        };
        tokio::select! {
            biased;
            () = cancel.cancelled() => None,
            () = all_done.cancelled() => None,
            job = queue.recv() => job,
        }
    }

    async fn process(&self, job: ExtractionJob) {
        let reporter = &self.scheduler.reporter;

        let permit = tokio::select! {
            biased;
            () = self.channels.cancel.cancelled() => {
                reporter.report(WorkerEvent::JobAbandoned { job_id: job.id, target: &job.target });
                return;
            }
            permit = self.scheduler.limiter.acquire(job.target.source()) => permit,
        };

        let outcome = match permit {
            Ok(permit) => {
                reporter.report(WorkerEvent::JobStarted {
                    job_id: job.id,
                    target: &job.target,
                    attempt: job.attempt,
                    queued: permit.waited(),
                });
                self.extract(&job).await
            }
            Err(e) => Err(e),
        };

        match outcome {
            Ok(data) => {
                reporter.report(WorkerEvent::JobSucceeded {
                    job_id: job.id,
                    target: &job.target,
                    items: data.items.len(),
                    attempts: job.attempts_made(),
                });
                let attempts = job.attempts_made();
                self.finish(ExtractionResult::success(job.id, job.target, data, attempts));
            }
            Err(error) => self.handle_failure(job, error),
        }
    }

    /// Calls the extractor under the per-call timeout. A panicking
    /// extractor becomes an `Unknown` failure for this job only.
    async fn extract(&self, job: &ExtractionJob) -> Result<ExtractedData, AppError> {
        let source = job.target.source();
        let extractor = self.scheduler.registry.get(source).ok_or_else(|| {
            AppError::InvalidInput(format!("No extractor registered for {source}"))
        })?;

        let call = AssertUnwindSafe(extractor.fetch_boxed(&job.target, job.max_items, job.since))
            .catch_unwind();
        match tokio::time::timeout(self.scheduler.call_timeout, call).await {
            Ok(Ok(result)) => result,
            Ok(Err(panic)) => Err(AppError::Generic(format!(
                "Extractor panicked: {}",
                panic_message(panic.as_ref())
            ))),
            Err(_) => Err(AppError::Timeout(self.scheduler.call_timeout)),
        }
    }

    fn handle_failure(&self, job: ExtractionJob, error: AppError) {
        let reporter = &self.scheduler.reporter;
        let kind = error.kind();
        let decision = self.scheduler.retry.decide(job.attempt, kind);
        let message = error.to_string();

        reporter.report(WorkerEvent::JobFailed {
            job_id: job.id,
            target: &job.target,
            kind,
            error: &message,
            will_retry: matches!(decision, RetryDecision::Retry(_)),
        });

        match decision {
            RetryDecision::Retry(backoff) => {
                let delay = match &error {
                    AppError::RateLimited {
                        retry_after: Some(retry_after),
                        ..
                    } => backoff.max(*retry_after).min(self.scheduler.retry.max_delay),
                    _ => backoff,
                };
                reporter.report(WorkerEvent::RetryScheduled {
                    job_id: job.id,
                    target: &job.target,
                    attempt: job.attempt,
                    delay,
                });
                self.schedule_retry(job.next_attempt(), delay);
            }
            RetryDecision::GiveUp => {
                let attempts = job.attempts_made();
                self.finish(ExtractionResult::failure(job.id, job.target, &error, attempts));
            }
        }
    }

    /// Puts `job` back on the queue after `delay`, unless the run is
    /// cancelled first.
    fn schedule_retry(&self, job: ExtractionJob, delay: Duration) {
        let requeue = self.requeue.clone();
        let cancel = self.channels.cancel.clone();
        let reporter = Arc::clone(&self.scheduler.reporter);

        tokio::spawn(async move {
            tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    reporter.report(WorkerEvent::JobAbandoned { job_id: job.id, target: &job.target });
                }
                () = tokio::time::sleep(delay) => {
                    if let Err(mpsc::error::SendError(job)) = requeue.send(job) {
                        tracing::debug!(job_id = %job.id, "Queue closed before retry");
                    }
                }
            }
        });
    }

    fn finish(&self, result: ExtractionResult) {
        if self
            .channels
            .results
            .send(AggregatorMessage::Finished(result))
            .is_err()
        {
            tracing::error!(worker_id = self.id, "Aggregator gone, result lost");
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string payload")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::Aggregator;
    use crate::job::{RunOptions, RunStatus};
    use crate::models::Source;
    use crate::rate_limit::RateLimit;
    use crate::testutil::{MockExtractor, MockReporter};

    fn scheduler(extractor: MockExtractor, retry: RetryPolicy, reporter: MockReporter) -> Arc<Scheduler> {
        let registry = ExtractorRegistry::new().with(Source::Instagram, extractor);
        let limiter = RateLimiter::new(
            RateLimit::new(100, Duration::from_millis(10)),
            Duration::from_secs(60),
        );
        Arc::new(Scheduler::new(
            registry,
            limiter,
            retry,
            Duration::from_secs(5),
            Arc::new(reporter),
        ))
    }

    fn jobs(ids: &[&str]) -> Vec<ExtractionJob> {
        ids.iter()
            .map(|id| {
                ExtractionJob::new(
                    Target::new(Source::Instagram, *id).unwrap(),
                    &RunOptions::default(),
                )
            })
            .collect()
    }

    async fn drive(scheduler: Arc<Scheduler>, jobs: Vec<ExtractionJob>, workers: usize) -> crate::aggregator::RunState {
        let all_done = CancellationToken::new();
        let (agg, mut state) = Aggregator::new(Uuid::new_v4(), jobs.len(), all_done.clone());
        let (tx, rx) = mpsc::unbounded_channel();
        let agg_task = tokio::spawn(agg.run(rx));

        let channels = RunChannels {
            results: tx,
            cancel: CancellationToken::new(),
            all_done,
        };
        scheduler.run(jobs, workers, channels).await;
        agg_task.await.unwrap();

        let snapshot = state.borrow_and_update().clone();
        snapshot
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_are_retried_until_success() {
        let extractor = MockExtractor::succeeding().with_script(
            "flaky",
            vec![
                Err(AppError::NetworkError("reset".into())),
                Err(AppError::Timeout(Duration::from_secs(1))),
            ],
        );
        let reporter = MockReporter::new();
        let sched = scheduler(extractor.clone(), RetryPolicy::default(), reporter.clone());

        let state = drive(sched, jobs(&["flaky"]), 2).await;

        assert_eq!(state.status, RunStatus::Completed);
        assert!(state.results[0].is_success());
        assert_eq!(state.results[0].attempts(), 3);
        assert_eq!(extractor.call_count_for("flaky"), 3);
        assert_eq!(reporter.count("retry_scheduled"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_delays_follow_backoff() {
        let extractor = MockExtractor::failing(|| AppError::HttpError("502".into()));
        let retry = RetryPolicy::default()
            .with_max_attempts(3)
            .with_delays(Duration::from_secs(1), Duration::from_secs(60));
        let sched = scheduler(extractor.clone(), retry, MockReporter::new());

        drive(sched, jobs(&["down"]), 1).await;

        let times = extractor.call_times_for("down");
        assert_eq!(times.len(), 3);
        assert!(times[1] - times[0] >= Duration::from_secs(1));
        assert!(times[2] - times[1] >= Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_failures_get_tighter_budget() {
        let extractor = MockExtractor::failing(|| AppError::ParseError("shape".into()));
        let retry = RetryPolicy::default()
            .with_max_attempts(5)
            .with_unknown_max_attempts(2);
        let sched = scheduler(extractor.clone(), retry, MockReporter::new());

        let state = drive(sched, jobs(&["odd"]), 1).await;

        assert_eq!(extractor.call_count_for("odd"), 2);
        assert!(matches!(
            &state.results[0],
            ExtractionResult::Failure { kind: ErrorKind::Unknown, attempts: 2, .. }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_extractor_times_out_as_transient() {
        let extractor = MockExtractor::succeeding().with_latency(Duration::from_secs(30));
        let sched = scheduler(
            extractor.clone(),
            RetryPolicy::default().with_max_attempts(2),
            MockReporter::new(),
        );

        let state = drive(sched, jobs(&["slow"]), 1).await;

        assert_eq!(extractor.call_count_for("slow"), 2);
        match &state.results[0] {
            ExtractionResult::Failure { kind, message, .. } => {
                assert_eq!(*kind, ErrorKind::Transient);
                assert!(message.contains("timed out"));
            }
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn pool_never_exceeds_job_count() {
        let reporter = MockReporter::new();
        let sched = scheduler(MockExtractor::succeeding(), RetryPolicy::default(), reporter.clone());

        drive(sched, jobs(&["a", "b"]), 8).await;

        assert_eq!(reporter.count("worker_started"), 2);
        assert_eq!(reporter.count("worker_stopped"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn panicking_extractor_fails_only_its_job() {
        let extractor = MockExtractor::always(|target: &Target| {
            if target.id() == "boom" {
                panic!("unexpected page layout");
            }
            Ok(crate::testutil::sample_data(target.id(), 1))
        });
        let retry = RetryPolicy::default().with_unknown_max_attempts(2);
        let sched = scheduler(extractor.clone(), retry, MockReporter::new());

        let state = tokio::time::timeout(
            Duration::from_secs(60),
            drive(sched, jobs(&["boom", "a", "b"]), 2),
        )
        .await
        .expect("run finishes");

        assert_eq!(state.status, RunStatus::Completed);
        assert_eq!(state.progress.completed, 3);
        assert_eq!(state.successes().count(), 2);
        let failure = state.failures().next().unwrap();
        assert_eq!(failure.target().id(), "boom");
        assert!(matches!(
            failure,
            ExtractionResult::Failure { kind: ErrorKind::Unknown, attempts: 2, message, .. }
                if message.contains("unexpected page layout")
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn single_worker_survives_a_panic() {
        let extractor = MockExtractor::always(|target: &Target| {
            if target.id() == "boom" {
                panic!("boom");
            }
            Ok(crate::testutil::sample_data(target.id(), 1))
        });
        let sched = scheduler(extractor.clone(), RetryPolicy::default(), MockReporter::new());

        let state = drive(sched, jobs(&["boom", "a", "b"]), 1).await;

        assert_eq!(state.status, RunStatus::Completed);
        assert_eq!(extractor.call_count_for("a"), 1);
        assert_eq!(extractor.call_count_for("b"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn job_started_is_reported_once_a_slot_is_granted() {
        let extractor = MockExtractor::succeeding();
        let reporter = MockReporter::new();
        let registry = ExtractorRegistry::new().with(Source::Instagram, extractor);
        let limiter = RateLimiter::new(
            RateLimit::new(1, Duration::from_secs(30)),
            Duration::from_secs(5),
        );
        let sched = Arc::new(Scheduler::new(
            registry,
            limiter,
            RetryPolicy::default().with_max_attempts(1),
            Duration::from_secs(5),
            Arc::new(reporter.clone()),
        ));

        let state = drive(sched, jobs(&["a", "b"]), 1).await;

        // "b" is throttled by the limiter and never reaches the extractor.
        assert_eq!(state.successes().count(), 1);
        assert_eq!(reporter.count("job_started"), 1);
        assert_eq!(reporter.count_for("job_failed", "instagram:b"), 1);
        assert_eq!(reporter.count_for("job_started", "instagram:b"), 0);
    }
}
