//! Single owner of a run's [`RunState`].
//!
//! Workers never touch the state directly: they send [`AggregatorMessage`]s
//! and the aggregator task applies them in arrival order, publishing each
//! new snapshot on a `watch` channel.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::job::RunStatus;
use crate::models::ExtractionResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Progress {
    pub completed: usize,
    pub total: usize,
}

impl Progress {
    pub fn is_done(&self) -> bool {
        self.completed >= self.total
    }
}

/// Snapshot of one run. `results` is append-only and in completion order.
#[derive(Debug, Clone, Serialize)]
pub struct RunState {
    pub run_id: Uuid,
    pub status: RunStatus,
    pub results: Vec<ExtractionResult>,
    pub progress: Progress,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl RunState {
    pub fn new(run_id: Uuid, total: usize) -> Self {
        Self {
            run_id,
            status: RunStatus::Pending,
            results: Vec::new(),
            progress: Progress {
                completed: 0,
                total,
            },
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    pub fn successes(&self) -> impl Iterator<Item = &ExtractionResult> {
        self.results.iter().filter(|r| r.is_success())
    }

    pub fn failures(&self) -> impl Iterator<Item = &ExtractionResult> {
        self.results.iter().filter(|r| !r.is_success())
    }
}

#[derive(Debug)]
pub(crate) enum AggregatorMessage {
    Started,
    Finished(ExtractionResult),
    /// Sent once the workers of a cancelled run have drained.
    Cancelled,
}

pub(crate) struct Aggregator {
    state: watch::Sender<RunState>,
    recorded: HashSet<Uuid>,
    /// Fired when every job has a terminal result, so idle workers can exit.
    all_done: CancellationToken,
}

impl Aggregator {
    pub(crate) fn new(
        run_id: Uuid,
        total: usize,
        all_done: CancellationToken,
    ) -> (Self, watch::Receiver<RunState>) {
        let (state, rx) = watch::channel(RunState::new(run_id, total));
        (
            Self {
                state,
                recorded: HashSet::new(),
                all_done,
            },
            rx,
        )
    }

    /// Applies messages until every sender is gone.
    pub(crate) async fn run(mut self, mut rx: mpsc::UnboundedReceiver<AggregatorMessage>) {
        while let Some(message) = rx.recv().await {
            self.apply(message);
        }
    }

    fn apply(&mut self, message: AggregatorMessage) {
        if self.state.borrow().status.is_terminal() {
            tracing::debug!(?message, "Ignoring message for finished run");
            return;
        }

        match message {
            AggregatorMessage::Started => {
                self.state.send_modify(|s| s.status = RunStatus::Running);
            }
            AggregatorMessage::Finished(result) => self.record(result),
            AggregatorMessage::Cancelled => {
                self.state.send_modify(|s| {
                    s.status = RunStatus::Cancelled;
                    s.finished_at = Some(Utc::now());
                });
                let state = self.state.borrow();
                tracing::info!(
                    run_id = %state.run_id,
                    completed = state.progress.completed,
                    total = state.progress.total,
                    "Run cancelled"
                );
            }
        }
    }

    fn record(&mut self, result: ExtractionResult) {
        if !self.recorded.insert(result.job_id()) {
            tracing::warn!(
                job_id = %result.job_id(),
                target = %result.target(),
                "Duplicate result dropped"
            );
            return;
        }

        let mut finished = false;
        self.state.send_modify(|s| {
            s.results.push(result);
            s.progress.completed = (s.progress.completed + 1).min(s.progress.total);
            if s.progress.is_done() {
                s.status = RunStatus::Completed;
                s.finished_at = Some(Utc::now());
                finished = true;
            }
        });

        if finished {
            let state = self.state.borrow();
            tracing::info!(
                run_id = %state.run_id,
                succeeded = state.successes().count(),
                failed = state.failures().count(),
                "Run completed"
            );
            drop(state);
            self.all_done.cancel();
        }
    }
}
