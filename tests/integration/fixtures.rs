//! Test fixtures for integration tests.
//!
//! Provides helpers for:
//! - Temporary state directories with a `FileStore`
//! - Heartbeat maps and aged heartbeats
//! - Scripted executors and small plans

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::Utc;
use tempfile::TempDir;

use concord::config::Config;
use concord::core::{Heartbeat, Priority, WorkerId, WorkerStatus};
use concord::orchestration::{ExecutorError, MockExecutor, Plan, PlannedTask, WorkerReport};
use concord::state::FileStore;

/// A file store in a temporary directory that lives as long as the fixture.
pub struct TestState {
    pub temp_dir: TempDir,
    pub store: FileStore,
}

impl TestState {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let store = FileStore::new(temp_dir.path().join("state"));
        Self { temp_dir, store }
    }

    /// A second handle on the same directory, as another process would open it.
    pub fn reopen(&self) -> FileStore {
        FileStore::new(self.store.root())
    }
}

/// Config with fast ticks and an immediate manager scan.
pub fn fast_config(workers: &[&str]) -> Config {
    let mut config = Config::default();
    config.workers = workers.iter().map(|w| w.to_string()).collect();
    config.coordinator.tick_millis = 5;
    config.coordinator.manager_interval_secs = 0;
    config.coordinator.max_retries = 1;
    config
}

pub fn heartbeat(worker: &str, status: WorkerStatus) -> Heartbeat {
    Heartbeat::new(worker, status)
}

pub fn working_on(worker: &str, files: &[&str]) -> Heartbeat {
    Heartbeat::new(worker, WorkerStatus::Working).with_files(files.iter().copied())
}

/// A heartbeat written `secs` seconds ago.
pub fn aged(heartbeat: Heartbeat, secs: i64) -> Heartbeat {
    heartbeat.at(Utc::now() - chrono::Duration::seconds(secs))
}

pub fn heartbeat_map(heartbeats: Vec<Heartbeat>) -> BTreeMap<WorkerId, Heartbeat> {
    heartbeats
        .into_iter()
        .map(|hb| (hb.worker_id.clone(), hb))
        .collect()
}

pub fn no_reports() -> BTreeMap<WorkerId, Vec<WorkerReport>> {
    BTreeMap::new()
}

pub fn planned(title: &str, priority: Priority, phase: u32, deps: &[&str]) -> PlannedTask {
    PlannedTask {
        title: title.to_string(),
        description: format!("Work on {}", title),
        priority,
        phase,
        dependencies: deps.iter().map(|d| d.to_string()).collect(),
        assigned_to: None,
    }
}

pub fn plan_of(tasks: Vec<PlannedTask>) -> Plan {
    Plan {
        summary: "integration plan".to_string(),
        execution_order: tasks.iter().map(|t| t.title.clone()).collect(),
        tasks,
    }
}

/// Executor that reports success and echoes the task line as its summary.
pub fn reporting_executor() -> MockExecutor {
    MockExecutor::new(|prompt| {
        let task = prompt
            .lines()
            .find(|l| l.starts_with("TASK "))
            .unwrap_or("TASK ?");
        Ok(serde_json::json!({
            "summary": format!("finished {}", task),
            "files_modified": [],
            "success": true,
        })
        .to_string())
    })
}

/// Executor whose first answer for any prompt containing `marker` fails.
pub fn flaky_executor(marker: &'static str) -> MockExecutor {
    let failed = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
    MockExecutor::new(move |prompt| {
        if prompt.contains(marker) && !failed.swap(true, std::sync::atomic::Ordering::SeqCst) {
            return Err(ExecutorError::NonZeroExit {
                code: Some(1),
                stderr: "transient failure".to_string(),
            });
        }
        Ok(r#"{"summary": "ok", "success": true}"#.to_string())
    })
}

pub const SHORT: Duration = Duration::from_millis(50);
