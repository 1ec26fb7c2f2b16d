//! Corrective actions emitted by the manager.
//!
//! Actions describe an intervention; they never apply themselves. The
//! coordinator decides how each kind mutates scheduler and worker state.

use crate::core::task::{Priority, TaskId};
use crate::core::WorkerId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The intervention itself, one variant per action type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionKind {
    /// Move pending work ahead of the queue, reserved for an idle worker.
    ReorderTasks {
        task_id: TaskId,
        task_title: String,
        target_worker: WorkerId,
    },
    /// Add a new task, routed to the responsible worker.
    InjectTask {
        target_worker: WorkerId,
        task_title: String,
        task_description: String,
    },
    /// Tell every worker something.
    BroadcastUpdate { message: String },
    PauseWorker { target_worker: WorkerId },
    ResumeWorker { target_worker: WorkerId },
    /// Needs a human (or a mediator) to look at it.
    Escalate {
        target_worker: Option<WorkerId>,
        task: Option<String>,
    },
    TriggerSyncPoint { phase: u32 },
}

impl ActionKind {
    pub fn name(&self) -> &'static str {
        match self {
            ActionKind::ReorderTasks { .. } => "REORDER_TASKS",
            ActionKind::InjectTask { .. } => "INJECT_TASK",
            ActionKind::BroadcastUpdate { .. } => "BROADCAST_UPDATE",
            ActionKind::PauseWorker { .. } => "PAUSE_WORKER",
            ActionKind::ResumeWorker { .. } => "RESUME_WORKER",
            ActionKind::Escalate { .. } => "ESCALATE",
            ActionKind::TriggerSyncPoint { .. } => "TRIGGER_SYNC_POINT",
        }
    }
}

/// A manager decision with its justification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManagerAction {
    #[serde(flatten)]
    pub kind: ActionKind,
    pub reason: String,
    pub priority: Priority,
    pub created_at: DateTime<Utc>,
}

impl ManagerAction {
    fn build(kind: ActionKind, reason: impl Into<String>, priority: Priority) -> Self {
        Self {
            kind,
            reason: reason.into(),
            priority,
            created_at: Utc::now(),
        }
    }

    pub fn reorder_tasks(
        task_id: TaskId,
        task_title: &str,
        target_worker: &str,
        reason: impl Into<String>,
    ) -> Self {
        Self::build(
            ActionKind::ReorderTasks {
                task_id,
                task_title: task_title.to_string(),
                target_worker: target_worker.to_string(),
            },
            reason,
            Priority::Medium,
        )
    }

    pub fn inject_task(
        target_worker: &str,
        task_title: &str,
        task_description: &str,
        reason: impl Into<String>,
    ) -> Self {
        Self::build(
            ActionKind::InjectTask {
                target_worker: target_worker.to_string(),
                task_title: task_title.to_string(),
                task_description: task_description.to_string(),
            },
            reason,
            Priority::High,
        )
    }

    pub fn broadcast(message: &str, reason: impl Into<String>) -> Self {
        Self::build(
            ActionKind::BroadcastUpdate {
                message: message.to_string(),
            },
            reason,
            Priority::Medium,
        )
    }

    pub fn pause_worker(target_worker: &str, reason: impl Into<String>) -> Self {
        Self::build(
            ActionKind::PauseWorker {
                target_worker: target_worker.to_string(),
            },
            reason,
            Priority::High,
        )
    }

    pub fn resume_worker(target_worker: &str, reason: impl Into<String>) -> Self {
        Self::build(
            ActionKind::ResumeWorker {
                target_worker: target_worker.to_string(),
            },
            reason,
            Priority::High,
        )
    }

    pub fn escalate(
        target_worker: Option<&str>,
        task: Option<&str>,
        reason: impl Into<String>,
    ) -> Self {
        Self::build(
            ActionKind::Escalate {
                target_worker: target_worker.map(str::to_string),
                task: task.map(str::to_string),
            },
            reason,
            Priority::Critical,
        )
    }

    pub fn trigger_sync_point(phase: u32, reason: impl Into<String>) -> Self {
        Self::build(ActionKind::TriggerSyncPoint { phase }, reason, Priority::High)
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn name(&self) -> &'static str {
        self.kind.name()
    }

    /// Worker the action is aimed at, if any.
    pub fn target_worker(&self) -> Option<&str> {
        match &self.kind {
            ActionKind::ReorderTasks { target_worker, .. }
            | ActionKind::InjectTask { target_worker, .. }
            | ActionKind::PauseWorker { target_worker }
            | ActionKind::ResumeWorker { target_worker } => Some(target_worker),
            ActionKind::Escalate { target_worker, .. } => target_worker.as_deref(),
            ActionKind::BroadcastUpdate { .. } | ActionKind::TriggerSyncPoint { .. } => None,
        }
    }
}

impl std::fmt::Display for ManagerAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.target_worker() {
            Some(worker) => write!(f, "{} -> {}: {}", self.name(), worker, self.reason),
            None => write!(f, "{}: {}", self.name(), self.reason),
        }
    }
}
