//! Public entry point: start, observe, cancel and release runs.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::aggregator::{Aggregator, AggregatorMessage, RunState};
use crate::config::EngineConfig;
use crate::error::AppError;
use crate::job::{ExtractionJob, RunOptions};
use crate::models::{Source, Target};
use crate::rate_limit::RateLimiter;
use crate::scheduler::{RunChannels, Scheduler, TracingWorkerReporter, WorkerReporter};
use crate::traits::ExtractorRegistry;

/// Opaque identifier of a run started by a [`RunController`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RunHandle(Uuid);

impl RunHandle {
    pub fn id(&self) -> Uuid {
        self.0
    }
}

impl fmt::Display for RunHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

struct RunEntry {
    cancel: CancellationToken,
    state: watch::Receiver<RunState>,
}

/// Owns every active run. Runs are independent of each other but share
/// the extractor registry and the per-source rate limiter, so concurrent
/// runs against one platform still respect its pacing.
#[derive(Clone)]
pub struct RunController {
    config: EngineConfig,
    scheduler: Arc<Scheduler>,
    runs: Arc<Mutex<HashMap<Uuid, RunEntry>>>,
}

impl RunController {
    /// Validates `config` and builds a controller logging through `tracing`.
    pub fn new(config: EngineConfig, registry: ExtractorRegistry) -> Result<Self, AppError> {
        Self::with_reporter(config, registry, Arc::new(TracingWorkerReporter))
    }

    pub fn with_reporter(
        config: EngineConfig,
        registry: ExtractorRegistry,
        reporter: Arc<dyn WorkerReporter>,
    ) -> Result<Self, AppError> {
        let limiter = config.rate_limiter();
        Self::build(config, registry, limiter, reporter)
    }

    /// Like [`new`](Self::new), pacing runs through `limiter` instead of a
    /// fresh one built from `config`. Extractors holding a clone of the same
    /// limiter then share its buckets with the scheduler.
    pub fn with_rate_limiter(
        config: EngineConfig,
        registry: ExtractorRegistry,
        limiter: RateLimiter,
    ) -> Result<Self, AppError> {
        Self::build(config, registry, limiter, Arc::new(TracingWorkerReporter))
    }

    fn build(
        config: EngineConfig,
        registry: ExtractorRegistry,
        limiter: RateLimiter,
        reporter: Arc<dyn WorkerReporter>,
    ) -> Result<Self, AppError> {
        config.validate()?;
        let scheduler = Scheduler::new(
            registry,
            limiter,
            config.retry.clone(),
            config.call_timeout,
            reporter,
        );
        Ok(Self {
            config,
            scheduler: Arc::new(scheduler),
            runs: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    /// Acquires the inner mutex lock, recovering from poison if necessary.
    fn lock_runs(&self) -> MutexGuard<'_, HashMap<Uuid, RunEntry>> {
        self.runs.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("Recovered from poisoned run registry mutex");
            poisoned.into_inner()
        })
    }

    /// Starts extracting `targets` in the background.
    ///
    /// Repeated targets are extracted once. Fails with
    /// [`AppError::InvalidInput`] when `targets` is empty or names a source
    /// without an extractor; nothing runs in that case.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start_run(
        &self,
        targets: Vec<Target>,
        options: RunOptions,
    ) -> Result<RunHandle, AppError> {
        if targets.is_empty() {
            return Err(AppError::InvalidInput("No targets to extract".into()));
        }

        let registry = self.scheduler.registry();
        let mut unsupported: Vec<Source> = targets
            .iter()
            .map(Target::source)
            .filter(|s| !registry.contains(*s))
            .collect();
        if !unsupported.is_empty() {
            unsupported.sort();
            unsupported.dedup();
            let names: Vec<_> = unsupported.iter().map(Source::as_str).collect();
            return Err(AppError::InvalidInput(format!(
                "No extractor available for: {}",
                names.join(", ")
            )));
        }

        let jobs = dedupe(targets)
            .into_iter()
            .map(|target| ExtractionJob::new(target, &options))
            .collect::<Vec<_>>();

        let run_id = Uuid::new_v4();
        let cancel = CancellationToken::new();
        let all_done = CancellationToken::new();
        let (aggregator, state) = Aggregator::new(run_id, jobs.len(), all_done.clone());
        let (results, inbox) = mpsc::unbounded_channel();

        tracing::info!(
            %run_id,
            jobs = jobs.len(),
            workers = self.config.workers,
            max_items = options.max_items,
            since = ?options.since,
            "Starting run"
        );

        tokio::spawn(aggregator.run(inbox));

        let scheduler = Arc::clone(&self.scheduler);
        let workers = self.config.workers;
        let channels = RunChannels {
            results: results.clone(),
            cancel: cancel.clone(),
            all_done,
        };
        tokio::spawn(async move {
            // Started goes out before any worker can report a result.
            let _ = results.send(AggregatorMessage::Started);
            scheduler.run(jobs, workers, channels.clone()).await;
            if channels.cancel.is_cancelled() {
                let _ = results.send(AggregatorMessage::Cancelled);
            }
        });

        self.lock_runs().insert(run_id, RunEntry { cancel, state });
        Ok(RunHandle(run_id))
    }

    /// Stops dequeuing jobs for the run. Jobs already talking to a source
    /// finish (bounded by the call timeout); their results are kept.
    pub fn cancel(&self, handle: RunHandle) -> Result<(), AppError> {
        let runs = self.lock_runs();
        let entry = runs
            .get(&handle.0)
            .ok_or_else(|| AppError::RunNotFound(handle.to_string()))?;
        if !entry.cancel.is_cancelled() {
            tracing::info!(run_id = %handle, "Cancelling run");
            entry.cancel.cancel();
        }
        Ok(())
    }

    /// Current snapshot of the run.
    pub fn state(&self, handle: RunHandle) -> Result<RunState, AppError> {
        let runs = self.lock_runs();
        let entry = runs
            .get(&handle.0)
            .ok_or_else(|| AppError::RunNotFound(handle.to_string()))?;
        let state = entry.state.borrow().clone();
        Ok(state)
    }

    /// Read-only subscription to the run's state; updated on every change.
    pub fn subscribe(&self, handle: RunHandle) -> Result<watch::Receiver<RunState>, AppError> {
        let runs = self.lock_runs();
        runs.get(&handle.0)
            .map(|entry| entry.state.clone())
            .ok_or_else(|| AppError::RunNotFound(handle.to_string()))
    }

    /// Waits until the run is completed or cancelled and returns the final
    /// snapshot.
    pub async fn wait(&self, handle: RunHandle) -> Result<RunState, AppError> {
        let mut rx = self.subscribe(handle)?;
        let state = rx
            .wait_for(|s| s.status.is_terminal())
            .await
            .map_err(|_| AppError::Generic(format!("Run {handle} stopped without finishing")))?
            .clone();
        Ok(state)
    }

    /// Forgets the run, cancelling it if it is still going, and returns its
    /// last snapshot.
    pub fn release(&self, handle: RunHandle) -> Result<RunState, AppError> {
        let entry = self
            .lock_runs()
            .remove(&handle.0)
            .ok_or_else(|| AppError::RunNotFound(handle.to_string()))?;
        entry.cancel.cancel();
        let state = entry.state.borrow().clone();
        Ok(state)
    }

    /// Handles of every run not yet released.
    pub fn active_runs(&self) -> Vec<RunHandle> {
        self.lock_runs().keys().copied().map(RunHandle).collect()
    }
}

impl fmt::Debug for RunController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunController")
            .field("config", &self.config)
            .field("runs", &self.lock_runs().len())
            .finish()
    }
}

/// Drops repeated targets, keeping first-seen order.
fn dedupe(targets: Vec<Target>) -> Vec<Target> {
    let mut seen = HashSet::new();
    let mut unique = Vec::with_capacity(targets.len());
    for target in targets {
        if seen.insert(target.clone()) {
            unique.push(target);
        } else {
            tracing::warn!(%target, "Duplicate target ignored");
        }
    }
    unique
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::RunStatus;
    use crate::testutil::MockExtractor;

    fn controller() -> RunController {
        let registry = ExtractorRegistry::new().with(Source::Instagram, MockExtractor::succeeding());
        RunController::new(EngineConfig::default(), registry).unwrap()
    }

    fn ig(id: &str) -> Target {
        Target::new(Source::Instagram, id).unwrap()
    }

    #[test]
    fn dedupe_keeps_first_seen_order() {
        let unique = dedupe(vec![ig("a"), ig("b"), ig("a"), ig("c")]);
        let ids: Vec<_> = unique.iter().map(Target::id).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }

    #[test]
    fn invalid_config_is_rejected_up_front() {
        let err = RunController::new(EngineConfig::default().with_workers(0), ExtractorRegistry::new())
            .unwrap_err();
        assert!(matches!(err, AppError::ConfigError(_)));
    }

    #[tokio::test]
    async fn empty_run_is_rejected() {
        let err = controller().start_run(vec![], RunOptions::default()).unwrap_err();
        assert!(matches!(err, AppError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn unsupported_source_is_rejected() {
        let controller = controller();
        let targets = vec![ig("a"), Target::new(Source::GoogleNews, "rust").unwrap()];
        let err = controller.start_run(targets, RunOptions::default()).unwrap_err();
        assert!(err.to_string().contains("google-news"));
        assert!(controller.active_runs().is_empty());
    }

    #[tokio::test]
    async fn duplicate_targets_run_once() {
        let controller = controller();
        let handle = controller
            .start_run(vec![ig("a"), ig("a"), ig("b")], RunOptions::default())
            .unwrap();
        let state = controller.wait(handle).await.unwrap();
        assert_eq!(state.status, RunStatus::Completed);
        assert_eq!(state.progress.total, 2);
        assert_eq!(state.results.len(), 2);
    }

    #[tokio::test]
    async fn unknown_handle_is_reported() {
        let controller = controller();
        let handle = controller.start_run(vec![ig("a")], RunOptions::default()).unwrap();
        controller.release(handle).unwrap();

        assert!(matches!(controller.state(handle), Err(AppError::RunNotFound(_))));
        assert!(matches!(controller.cancel(handle), Err(AppError::RunNotFound(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn shared_limiter_paces_runs_with_outside_callers() {
        use crate::rate_limit::RateLimit;
        use std::time::Duration;

        let limiter = RateLimiter::new(
            RateLimit::new(1, Duration::from_secs(3600)),
            Duration::from_secs(5),
        );
        // An extractor making its own calls through the same limiter.
        limiter.acquire(Source::Instagram).await.unwrap();

        let mock = MockExtractor::succeeding();
        let registry = ExtractorRegistry::new().with(Source::Instagram, mock.clone());
        let config = EngineConfig::default()
            .with_retry(crate::retry::RetryPolicy::default().with_max_attempts(1));
        let controller = RunController::with_rate_limiter(config, registry, limiter).unwrap();

        let handle = controller.start_run(vec![ig("a")], RunOptions::default()).unwrap();
        let state = controller.wait(handle).await.unwrap();

        assert_eq!(mock.call_count(), 0);
        assert_eq!(state.failures().count(), 1);
    }
}
