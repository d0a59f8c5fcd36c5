use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::Target;

/// Lifecycle status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Cancelled)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Per-run extraction limits applied to every job of the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunOptions {
    pub max_items: usize,
    pub since: Option<DateTime<Utc>>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            max_items: 10,
            since: None,
        }
    }
}

impl RunOptions {
    pub fn with_max_items(mut self, max_items: usize) -> Self {
        self.max_items = max_items;
        self
    }

    pub fn with_since(mut self, since: DateTime<Utc>) -> Self {
        self.since = Some(since);
        self
    }
}

/// One unit of work: extract `target`, possibly over several attempts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractionJob {
    pub id: Uuid,
    pub target: Target,
    pub max_items: usize,
    pub since: Option<DateTime<Utc>>,
    /// Zero-based index of the attempt about to run.
    pub attempt: u32,
}

impl ExtractionJob {
    pub fn new(target: Target, options: &RunOptions) -> Self {
        Self {
            id: Uuid::new_v4(),
            target,
            max_items: options.max_items,
            since: options.since,
            attempt: 0,
        }
    }

    /// The same job, one attempt later.
    pub fn next_attempt(mut self) -> Self {
        self.attempt += 1;
        self
    }

    /// Number of attempts made once the current one finishes.
    pub fn attempts_made(&self) -> u32 {
        self.attempt + 1
    }
}
