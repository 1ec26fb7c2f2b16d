//! Heartbeat bookkeeping: liveness, sync points and file conflicts.

use crate::core::{Heartbeat, WorkerId, WorkerStatus};
use crate::clog_debug;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

/// Default age after which a heartbeat is stale.
pub const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(90);

/// Whether `heartbeat` is older than `max_age` right now.
pub fn is_stale(heartbeat: &Heartbeat, max_age: Duration) -> bool {
    is_stale_at(heartbeat, max_age, Utc::now())
}

/// Strictly older than `max_age` at `now`. A heartbeat exactly `max_age` old
/// is still live; an unparsable timestamp is always stale.
pub fn is_stale_at(heartbeat: &Heartbeat, max_age: Duration, now: DateTime<Utc>) -> bool {
    match heartbeat.age_at(now) {
        None => true,
        // Timestamps from the future have a negative age and are live.
        Some(age) => age.to_std().is_ok_and(|age| age > max_age),
    }
}

/// A file reported by more than one working worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileConflict {
    pub path: String,
    /// Sorted, at least two entries.
    pub workers: Vec<WorkerId>,
}

/// Group `files_touched` across WORKING heartbeats and keep files claimed by
/// two or more workers. Output is sorted by path.
pub fn group_file_conflicts<'a, I>(heartbeats: I) -> Vec<FileConflict>
where
    I: IntoIterator<Item = &'a Heartbeat>,
{
    let mut owners: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();
    for hb in heartbeats
        .into_iter()
        .filter(|hb| hb.status == WorkerStatus::Working)
    {
        for path in &hb.files_touched {
            owners
                .entry(path.as_str())
                .or_default()
                .insert(hb.worker_id.as_str());
        }
    }
    owners
        .into_iter()
        .filter(|(_, workers)| workers.len() >= 2)
        .map(|(path, workers)| FileConflict {
            path: path.to_string(),
            workers: workers.into_iter().map(str::to_string).collect(),
        })
        .collect()
}

/// Classification of a set of workers at a potential sync point.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncPointStatus {
    pub all_ready: bool,
    pub working: Vec<WorkerId>,
    pub waiting: Vec<WorkerId>,
    pub blocked: Vec<WorkerId>,
    /// Idle workers plus workers with no heartbeat at all.
    pub idle: Vec<WorkerId>,
    pub stale: Vec<WorkerId>,
    /// Workers with no heartbeat. Also listed under `idle`.
    pub missing: Vec<WorkerId>,
    pub ready_artifacts: BTreeMap<WorkerId, BTreeSet<String>>,
}

/// Latest heartbeat per worker. Writes always replace the previous snapshot.
#[derive(Debug, Clone)]
pub struct SyncManager {
    heartbeats: BTreeMap<WorkerId, Heartbeat>,
    stale_after: Duration,
}

impl Default for SyncManager {
    fn default() -> Self {
        Self::new(DEFAULT_STALE_AFTER)
    }
}

impl SyncManager {
    pub fn new(stale_after: Duration) -> Self {
        Self {
            heartbeats: BTreeMap::new(),
            stale_after,
        }
    }

    pub fn stale_after(&self) -> Duration {
        self.stale_after
    }

    /// Publish a fresh snapshot for `worker_id`, replacing any previous one.
    #[allow(clippy::too_many_arguments)]
    pub fn write_heartbeat(
        &mut self,
        worker_id: &str,
        status: WorkerStatus,
        current_task: Option<&str>,
        progress: &str,
        files_touched: Option<BTreeSet<String>>,
        ready_artifacts: Option<BTreeSet<String>>,
        waiting_for: Option<&str>,
    ) -> &Heartbeat {
        let mut hb = Heartbeat::new(worker_id, status).with_progress(progress);
        hb.current_task = current_task.map(str::to_string);
        hb.files_touched = files_touched.unwrap_or_default();
        hb.ready_artifacts = ready_artifacts.unwrap_or_default();
        hb.waiting_for = waiting_for.map(str::to_string);
        self.ingest(hb)
    }

    /// Store a snapshot read from elsewhere (a worker's heartbeat file).
    pub fn ingest(&mut self, heartbeat: Heartbeat) -> &Heartbeat {
        clog_debug!(
            "SyncManager: {} {} task={:?}",
            heartbeat.worker_id,
            heartbeat.status,
            heartbeat.current_task
        );
        let worker = heartbeat.worker_id.clone();
        self.heartbeats.insert(worker.clone(), heartbeat);
        &self.heartbeats[&worker]
    }

    pub fn heartbeat(&self, worker_id: &str) -> Option<&Heartbeat> {
        self.heartbeats.get(worker_id)
    }

    pub fn heartbeats(&self) -> &BTreeMap<WorkerId, Heartbeat> {
        &self.heartbeats
    }

    pub fn remove(&mut self, worker_id: &str) -> Option<Heartbeat> {
        self.heartbeats.remove(worker_id)
    }

    pub fn clear(&mut self) {
        self.heartbeats.clear();
    }

    pub fn is_stale(&self, heartbeat: &Heartbeat) -> bool {
        is_stale(heartbeat, self.stale_after)
    }

    pub fn check_sync_point<S: AsRef<str>>(&self, workers: &[S]) -> SyncPointStatus {
        self.check_sync_point_at(workers, Utc::now())
    }

    /// Classify `workers` at `now`.
    ///
    /// Waiting workers and idle workers with a live heartbeat count as ready.
    /// Stale heartbeats are listed only under `stale`.
    pub fn check_sync_point_at<S: AsRef<str>>(
        &self,
        workers: &[S],
        now: DateTime<Utc>,
    ) -> SyncPointStatus {
        let mut status = SyncPointStatus::default();
        for worker in workers {
            let worker = worker.as_ref();
            let Some(hb) = self.heartbeats.get(worker) else {
                status.idle.push(worker.to_string());
                status.missing.push(worker.to_string());
                continue;
            };
            if !hb.ready_artifacts.is_empty() {
                status
                    .ready_artifacts
                    .insert(worker.to_string(), hb.ready_artifacts.clone());
            }
            if is_stale_at(hb, self.stale_after, now) {
                status.stale.push(worker.to_string());
                continue;
            }
            let bucket = match hb.status {
                WorkerStatus::Working => &mut status.working,
                WorkerStatus::Waiting => &mut status.waiting,
                WorkerStatus::Blocked => &mut status.blocked,
                WorkerStatus::Idle => &mut status.idle,
            };
            bucket.push(worker.to_string());
        }
        status.all_ready = status.working.is_empty()
            && status.blocked.is_empty()
            && status.stale.is_empty()
            && status.missing.is_empty();
        status
    }

    /// Raw file conflicts among `workers`.
    pub fn file_conflicts<S: AsRef<str>>(&self, workers: &[S]) -> Vec<FileConflict> {
        group_file_conflicts(
            workers
                .iter()
                .filter_map(|w| self.heartbeats.get(w.as_ref())),
        )
    }

    /// One line per BLOCKED worker with its reason.
    pub fn blocked_summary<S: AsRef<str>>(&self, workers: &[S]) -> Vec<String> {
        workers
            .iter()
            .filter_map(|w| self.heartbeats.get(w.as_ref()))
            .filter(|hb| hb.status == WorkerStatus::Blocked)
            .map(|hb| {
                let reason = hb
                    .waiting_for
                    .as_deref()
                    .filter(|r| !r.trim().is_empty())
                    .or_else(|| Some(hb.progress.as_str()).filter(|p| !p.trim().is_empty()))
                    .unwrap_or("no reason given");
                match &hb.current_task {
                    Some(task) => format!("{} blocked on {}: {}", hb.worker_id, task, reason),
                    None => format!("{} blocked: {}", hb.worker_id, reason),
                }
            })
            .collect()
    }
}
