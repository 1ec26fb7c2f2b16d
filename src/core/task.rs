//! Task data model for the scheduler.
//!
//! Tasks are the atomic units of work handed to workers. Each task tracks
//! its status, assignment, phase gate, quality gradient and flow state.
//! Workers never mutate tasks directly; the coordinator translates their
//! reports into scheduler calls.

use crate::core::WorkerId;
use crate::util::clamp_unit;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

/// Metadata key holding the reason a task was blocked.
pub const BLOCKED_REASON_KEY: &str = "blocked_reason";

/// Metadata key holding the RFC 3339 time a task was marked stalled.
pub const STALLED_SINCE_KEY: &str = "stalled_since";

/// Quality at or above which an in-progress task satisfies its dependents.
pub const SUBSTANTIAL_COMPLETION: f64 = 0.8;

/// Quality at or above which a task is flourishing.
pub const FLOURISHING_THRESHOLD: f64 = 0.7;

/// Quality at or above which a task is converging.
pub const CONVERGING_THRESHOLD: f64 = 0.9;

/// Identifier for a task, assigned in generation order by the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub u64);

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "task-{:03}", self.0)
    }
}

impl std::str::FromStr for TaskId {
    type Err = std::num::ParseIntError;

    /// Accepts both `task-007` and a bare `7`.
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let digits = s.trim().strip_prefix("task-").unwrap_or(s.trim());
        Ok(Self(digits.parse()?))
    }
}

/// Task status in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Pending => write!(f, "pending"),
            TaskStatus::InProgress => write!(f, "in_progress"),
            TaskStatus::Completed => write!(f, "completed"),
            TaskStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Task priority. Ordering is by urgency: `Critical < High < Medium < Low`,
/// so an ascending sort puts the most urgent work first.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Critical,
    High,
    #[default]
    Medium,
    Low,
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Priority::Critical => write!(f, "critical"),
            Priority::High => write!(f, "high"),
            Priority::Medium => write!(f, "medium"),
            Priority::Low => write!(f, "low"),
        }
    }
}

impl std::str::FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "critical" => Ok(Priority::Critical),
            "high" => Ok(Priority::High),
            "medium" => Ok(Priority::Medium),
            "low" => Ok(Priority::Low),
            other => Err(format!("unknown priority: {}", other)),
        }
    }
}

/// Derived progress-health label of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FlowState {
    #[default]
    Flowing,
    Blocked,
    Flourishing,
    Stalled,
    Converging,
}

impl FlowState {
    /// Flow state as a pure function of quality and the blocked/stalled flags.
    ///
    /// Precedence: blocked, stalled, converging, flourishing, flowing.
    pub fn derive(quality: f64, blocked: bool, stalled: bool) -> Self {
        if blocked {
            FlowState::Blocked
        } else if stalled {
            FlowState::Stalled
        } else if quality >= CONVERGING_THRESHOLD {
            FlowState::Converging
        } else if quality >= FLOURISHING_THRESHOLD {
            FlowState::Flourishing
        } else {
            FlowState::Flowing
        }
    }
}

impl std::fmt::Display for FlowState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FlowState::Flowing => write!(f, "flowing"),
            FlowState::Blocked => write!(f, "blocked"),
            FlowState::Flourishing => write!(f, "flourishing"),
            FlowState::Stalled => write!(f, "stalled"),
            FlowState::Converging => write!(f, "converging"),
        }
    }
}

fn default_phase() -> u32 {
    1
}

/// A unit of work tracked by the scheduler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub title: String,
    pub description: String,
    /// Worker the task is reserved for or running on.
    pub assigned_to: Option<WorkerId>,
    pub status: TaskStatus,
    pub priority: Priority,
    /// Task ids (`task-003`) or titles this task waits on.
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default = "default_phase")]
    pub phase: u32,
    #[serde(default)]
    pub quality_level: f64,
    #[serde(default)]
    pub flow_state: FlowState,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub result: Option<String>,
    pub error: Option<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl Task {
    /// Create a pending phase-1 task of medium priority.
    pub fn new(id: TaskId, title: &str, description: &str) -> Self {
        Self {
            id,
            title: title.to_string(),
            description: description.to_string(),
            assigned_to: None,
            status: TaskStatus::Pending,
            priority: Priority::Medium,
            dependencies: Vec::new(),
            phase: default_phase(),
            quality_level: 0.0,
            flow_state: FlowState::Flowing,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            result: None,
            error: None,
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_phase(mut self, phase: u32) -> Self {
        self.phase = phase;
        self
    }

    pub fn with_dependencies<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies = deps.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_assignee(mut self, worker: Option<WorkerId>) -> Self {
        self.assigned_to = worker;
        self
    }

    /// Sort key of the pending queue: phase, then urgency, then generation order.
    pub fn queue_key(&self) -> (u32, Priority, TaskId) {
        (self.phase, self.priority, self.id)
    }

    /// Whether `reference` names this task by id or by title.
    pub fn matches_ref(&self, reference: &str) -> bool {
        let reference = reference.trim();
        reference == self.title || reference.parse::<TaskId>().is_ok_and(|id| id == self.id)
    }

    pub fn is_blocked(&self) -> bool {
        self.metadata.contains_key(BLOCKED_REASON_KEY)
    }

    pub fn blocked_reason(&self) -> Option<&str> {
        self.metadata.get(BLOCKED_REASON_KEY).map(String::as_str)
    }

    pub fn is_stalled(&self) -> bool {
        self.metadata.contains_key(STALLED_SINCE_KEY)
    }

    /// Pending or in progress.
    pub fn is_active(&self) -> bool {
        matches!(self.status, TaskStatus::Pending | TaskStatus::InProgress)
    }

    pub fn is_finished(&self) -> bool {
        matches!(self.status, TaskStatus::Completed | TaskStatus::Failed)
    }

    /// Counts as done for dependents: completed, or in progress at substantial quality.
    pub fn satisfies_dependents(&self) -> bool {
        match self.status {
            TaskStatus::Completed => true,
            TaskStatus::InProgress => self.quality_level >= SUBSTANTIAL_COMPLETION,
            _ => false,
        }
    }

    /// Readiness under the phase gate.
    ///
    /// Phase 0 and 1 tasks are always ready. Later phases wait until the
    /// engine reaches their phase and every dependency id or title appears
    /// in `completed`.
    pub fn is_ready(&self, completed: &HashSet<String>, current_phase: u32) -> bool {
        if self.phase <= 1 {
            return true;
        }
        if self.phase > current_phase {
            return false;
        }
        self.dependencies.iter().all(|dep| dependency_met(dep, completed))
    }

    pub(crate) fn refresh_flow(&mut self) {
        self.flow_state = FlowState::derive(self.quality_level, self.is_blocked(), self.is_stalled());
    }

    pub(crate) fn start(&mut self, worker: &str) {
        self.status = TaskStatus::InProgress;
        self.assigned_to = Some(worker.to_string());
        self.started_at = Some(Utc::now());
    }

    /// Set quality (clamped) and recompute the flow state. Clears a stall.
    pub(crate) fn set_quality(&mut self, level: f64) {
        self.quality_level = clamp_unit(level);
        self.metadata.remove(STALLED_SINCE_KEY);
        self.refresh_flow();
    }

    pub(crate) fn block(&mut self, reason: &str) {
        self.metadata
            .insert(BLOCKED_REASON_KEY.to_string(), reason.to_string());
        self.refresh_flow();
    }

    pub(crate) fn unblock(&mut self) {
        self.metadata.remove(BLOCKED_REASON_KEY);
        self.refresh_flow();
    }

    pub(crate) fn stall(&mut self) {
        self.metadata
            .insert(STALLED_SINCE_KEY.to_string(), Utc::now().to_rfc3339());
        self.refresh_flow();
    }

    pub(crate) fn finish(&mut self, result: &str, success: bool, error: Option<&str>) {
        self.status = if success {
            TaskStatus::Completed
        } else {
            TaskStatus::Failed
        };
        self.result = Some(result.to_string());
        self.error = error.map(str::to_string);
        self.completed_at = Some(Utc::now());
    }

    /// Return a failed task to the pending queue for another attempt.
    pub(crate) fn reset_for_retry(&mut self) {
        self.status = TaskStatus::Pending;
        self.started_at = None;
        self.completed_at = None;
        self.result = None;
        self.quality_level = 0.0;
        self.metadata.remove(STALLED_SINCE_KEY);
        self.refresh_flow();
    }
}

/// A dependency is met when its title or id appears in `completed`. Ids may
/// be written in any form `TaskId` parses (`task-007`, `7`).
fn dependency_met(dep: &str, completed: &HashSet<String>) -> bool {
    let dep = dep.trim();
    completed.contains(dep)
        || dep
            .parse::<TaskId>()
            .is_ok_and(|id| completed.contains(&id.to_string()))
}

/// All references (ids and titles) that count as done for readiness checks.
pub fn completion_refs<'a, I>(tasks: I) -> HashSet<String>
where
    I: IntoIterator<Item = &'a Task>,
{
    let mut refs = HashSet::new();
    for task in tasks.into_iter().filter(|t| t.satisfies_dependents()) {
        refs.insert(task.id.to_string());
        refs.insert(task.title.clone());
    }
    refs
}
