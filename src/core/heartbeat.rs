//! Worker heartbeat snapshots.
//!
//! A heartbeat is the only channel from a worker to the coordinator. Each
//! worker overwrites its own snapshot; the coordinator only reads them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Identifier of a worker ("terminal"), e.g. `T1`.
pub type WorkerId = String;

/// What a worker reports it is doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Working,
    Waiting,
    Blocked,
    #[default]
    Idle,
}

impl std::fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerStatus::Working => write!(f, "working"),
            WorkerStatus::Waiting => write!(f, "waiting"),
            WorkerStatus::Blocked => write!(f, "blocked"),
            WorkerStatus::Idle => write!(f, "idle"),
        }
    }
}

impl std::str::FromStr for WorkerStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "working" => Ok(WorkerStatus::Working),
            "waiting" => Ok(WorkerStatus::Waiting),
            "blocked" => Ok(WorkerStatus::Blocked),
            "idle" => Ok(WorkerStatus::Idle),
            other => Err(format!("unknown worker status: {}", other)),
        }
    }
}

/// Latest liveness/status snapshot published by one worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub worker_id: WorkerId,
    pub status: WorkerStatus,
    pub current_task: Option<String>,
    /// Free text or a percentage such as `"60%"`.
    #[serde(default)]
    pub progress: String,
    #[serde(default)]
    pub files_touched: BTreeSet<String>,
    #[serde(default)]
    pub ready_artifacts: BTreeSet<String>,
    pub waiting_for: Option<String>,
    /// RFC 3339 write time. Kept as text because workers write it; an
    /// unparsable value marks the heartbeat stale.
    pub timestamp: String,
}

impl Heartbeat {
    /// A fresh snapshot stamped with the current time.
    pub fn new(worker_id: &str, status: WorkerStatus) -> Self {
        Self {
            worker_id: worker_id.to_string(),
            status,
            current_task: None,
            progress: String::new(),
            files_touched: BTreeSet::new(),
            ready_artifacts: BTreeSet::new(),
            waiting_for: None,
            timestamp: Utc::now().to_rfc3339(),
        }
    }

    pub fn with_task(mut self, task: &str) -> Self {
        self.current_task = Some(task.to_string());
        self
    }

    pub fn with_progress(mut self, progress: &str) -> Self {
        self.progress = progress.to_string();
        self
    }

    pub fn with_files<I, S>(mut self, files: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.files_touched = files.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_artifacts<I, S>(mut self, artifacts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.ready_artifacts = artifacts.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_waiting_for(mut self, reason: &str) -> Self {
        self.waiting_for = Some(reason.to_string());
        self
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp.to_rfc3339();
        self
    }

    pub fn timestamp_utc(&self) -> Option<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(self.timestamp.trim())
            .ok()
            .map(|t| t.with_timezone(&Utc))
    }

    /// Age relative to `now`, or `None` when the timestamp cannot be parsed.
    pub fn age_at(&self, now: DateTime<Utc>) -> Option<chrono::Duration> {
        self.timestamp_utc().map(|t| now - t)
    }

    /// Progress as a fraction in `[0, 1]` when it is written as a percentage.
    pub fn progress_fraction(&self) -> Option<f64> {
        let number = self.progress.trim().strip_suffix('%')?.trim();
        number
            .parse::<f64>()
            .ok()
            .map(|pct| crate::util::clamp_unit(pct / 100.0))
    }
}
