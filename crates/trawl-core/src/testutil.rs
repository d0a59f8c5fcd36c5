//! Test utilities: mock extractor and reporter.
//!
//! Handwritten mocks for dependency injection in unit and integration
//! tests. All mocks use `Arc<Mutex<_>>` for interior mutability, allowing
//! test assertions on recorded calls.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use tokio::time::Instant;

use crate::error::AppError;
use crate::models::{ExtractedData, ItemRecord, ProfileRecord, Target};
use crate::scheduler::{WorkerEvent, WorkerReporter};
use crate::traits::Extractor;
use crate::window::{ItemOrder, ItemWindow};

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

/// Fixed reference time so item timestamps are deterministic.
pub fn reference_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0)
        .single()
        .unwrap_or_default()
}

/// `n` items, newest first, one day apart starting at [`reference_time`].
pub fn sample_items(n: usize) -> Vec<ItemRecord> {
    (0..n)
        .map(|i| {
            let ts = reference_time() - chrono::Duration::days(i as i64);
            ItemRecord::new(format!("post {i}"), format!("https://example.com/p/{i}"))
                .with_timestamp(Some(ts))
                .with_count("likes", 10 * (i as i64 + 1))
                .with_count("comments", i as i64)
        })
        .collect()
}

/// A profile named `username` with `n` sample items.
pub fn sample_data(username: &str, n: usize) -> ExtractedData {
    let items = sample_items(n);
    let mut profile = ProfileRecord::new(username).with_counts(1_000, 100);
    profile.apply_engagement(&items);
    ExtractedData { profile, items }
}

// ---------------------------------------------------------------------------
// MockExtractor
// ---------------------------------------------------------------------------

type Responder = dyn Fn(&Target) -> Result<ExtractedData, AppError> + Send + Sync;

/// One recorded `fetch` call.
#[derive(Debug, Clone)]
pub struct MockCall {
    pub target: Target,
    pub max_items: usize,
    pub since: Option<DateTime<Utc>>,
    pub at: Instant,
}

/// Mock extractor with a default responder and optional per-target scripts.
///
/// A scripted target pops its queued results first and falls back to the
/// responder once the script runs out.
#[derive(Clone)]
pub struct MockExtractor {
    responder: Arc<Responder>,
    scripts: Arc<Mutex<HashMap<String, VecDeque<Result<ExtractedData, AppError>>>>>,
    calls: Arc<Mutex<Vec<MockCall>>>,
    latency: Duration,
}

impl MockExtractor {
    /// Responds with `fn(target)` on every call.
    pub fn always<F>(responder: F) -> Self
    where
        F: Fn(&Target) -> Result<ExtractedData, AppError> + Send + Sync + 'static,
    {
        Self {
            responder: Arc::new(responder),
            scripts: Arc::new(Mutex::new(HashMap::new())),
            calls: Arc::new(Mutex::new(Vec::new())),
            latency: Duration::ZERO,
        }
    }

    /// Returns [`sample_data`] for the target id with three items.
    pub fn succeeding() -> Self {
        Self::always(|target| Ok(sample_data(target.id(), 3)))
    }

    /// Fails every call with a fresh error from `make`.
    pub fn failing<F>(make: F) -> Self
    where
        F: Fn() -> AppError + Send + Sync + 'static,
    {
        Self::always(move |_| Err(make()))
    }

    /// Queues results for the target with the given id.
    pub fn with_script(self, target_id: &str, results: Vec<Result<ExtractedData, AppError>>) -> Self {
        self.scripts
            .lock()
            .unwrap()
            .entry(target_id.to_string())
            .or_default()
            .extend(results);
        self
    }

    /// Sleeps this long inside every call.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn calls(&self) -> Vec<MockCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn call_count_for(&self, target_id: &str) -> usize {
        self.call_times_for(target_id).len()
    }

    pub fn call_times_for(&self, target_id: &str) -> Vec<Instant> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.target.id() == target_id)
            .map(|c| c.at)
            .collect()
    }
}

impl Extractor for MockExtractor {
    async fn fetch(
        &self,
        target: &Target,
        max_items: usize,
        since: Option<DateTime<Utc>>,
    ) -> Result<ExtractedData, AppError> {
        self.calls.lock().unwrap().push(MockCall {
            target: target.clone(),
            max_items,
            since,
            at: Instant::now(),
        });

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        let scripted = {
            let mut scripts = self.scripts.lock().unwrap();
            scripts.get_mut(target.id()).and_then(VecDeque::pop_front)
        };
        let mut data = match scripted {
            Some(result) => result?,
            None => (self.responder)(target)?,
        };

        let mut window = ItemWindow::new(max_items, since, ItemOrder::NewestFirst);
        window.extend(data.items);
        data.items = window.into_items();
        Ok(data)
    }
}

// ---------------------------------------------------------------------------
// MockReporter
// ---------------------------------------------------------------------------

/// Owned copy of a [`WorkerEvent`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedEvent {
    pub name: &'static str,
    pub target: Option<String>,
}

/// Reporter that records every event.
#[derive(Clone, Default)]
pub struct MockReporter {
    events: Arc<Mutex<Vec<RecordedEvent>>>,
}

impl MockReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self, name: &str) -> usize {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.name == name)
            .count()
    }

    /// Events named `name` for the target rendered as `source:id`.
    pub fn count_for(&self, name: &str, target: &str) -> usize {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.name == name && e.target.as_deref() == Some(target))
            .count()
    }
}

impl WorkerReporter for MockReporter {
    fn report(&self, event: WorkerEvent<'_>) {
        let (name, target) = match event {
            WorkerEvent::WorkerStarted { .. } => ("worker_started", None),
            WorkerEvent::JobStarted { target, .. } => ("job_started", Some(target)),
            WorkerEvent::JobSucceeded { target, .. } => ("job_succeeded", Some(target)),
            WorkerEvent::JobFailed { target, .. } => ("job_failed", Some(target)),
            WorkerEvent::RetryScheduled { target, .. } => ("retry_scheduled", Some(target)),
            WorkerEvent::JobAbandoned { target, .. } => ("job_abandoned", Some(target)),
            WorkerEvent::WorkerStopped { .. } => ("worker_stopped", None),
        };
        self.events.lock().unwrap().push(RecordedEvent {
            name,
            target: target.map(ToString::to_string),
        });
    }
}
