//! Task scheduler: phase gates, dependency readiness and flow tracking.
//!
//! The scheduler owns every task record. Pending tasks are kept in a queue
//! sorted by `(phase, priority)`; a worker asking for work gets the first
//! queued task that is ready. Readiness is relaxed by the quality gradient:
//! an in-progress task at quality 0.8 or more already satisfies dependents.

use crate::core::task::{completion_refs, Task, TaskId, TaskStatus, FLOURISHING_THRESHOLD};
use crate::core::{FlowState, Priority};
use crate::error::{Error, Result};
use crate::{clog, clog_debug};
use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, NodeIndex};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};

/// Share of blocked active tasks above which the whole flow counts as blocked.
const BLOCKED_SHARE: f64 = 0.3;

/// Share of flourishing active tasks above which the whole flow is flourishing.
const FLOURISHING_SHARE: f64 = 0.5;

/// Aggregate health of all active (pending + in-progress) work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowSummary {
    pub quality_average: f64,
    pub blocked_count: usize,
    pub flourishing_count: usize,
    pub active_count: usize,
    pub overall_flow: FlowState,
    pub ready_for_convergence: bool,
}

/// Owner of task records, readiness and phase advancement.
///
/// # Example
///
/// ```
/// use concord::core::Priority;
/// use concord::orchestration::TaskScheduler;
///
/// let mut scheduler = TaskScheduler::new();
/// let design = scheduler.add_task("Design API", "Draft endpoints", Priority::High, vec![], 1, None).id;
/// scheduler.add_task("Build client", "Consume API", Priority::Medium, vec!["Design API".into()], 2, None);
///
/// scheduler.assign(design, "T1").unwrap();
/// scheduler.update_quality(design, 0.85);
///
/// let next = scheduler.next_task_for("T2", 2).unwrap();
/// assert_eq!(next.title, "Build client");
/// ```
#[derive(Debug, Default)]
pub struct TaskScheduler {
    tasks: BTreeMap<TaskId, Task>,
    /// Pending task ids sorted by `Task::queue_key`.
    pending: Vec<TaskId>,
    next_id: u64,
}

impl TaskScheduler {
    pub fn new() -> Self {
        Self {
            tasks: BTreeMap::new(),
            pending: Vec::new(),
            next_id: 1,
        }
    }

    /// Rebuild a scheduler from persisted tasks.
    pub fn restore(tasks: Vec<Task>) -> Self {
        let mut scheduler = Self::new();
        for task in tasks {
            scheduler.next_id = scheduler.next_id.max(task.id.0 + 1);
            scheduler.insert(task);
        }
        scheduler
    }

    /// All tasks in generation order.
    pub fn snapshot(&self) -> Vec<Task> {
        self.tasks.values().cloned().collect()
    }

    fn insert(&mut self, task: Task) {
        let id = task.id;
        if task.status == TaskStatus::Pending {
            let key = task.queue_key();
            let at = self.pending.partition_point(|pid| {
                self.tasks
                    .get(pid)
                    .is_some_and(|queued| queued.queue_key() < key)
            });
            self.pending.insert(at, id);
        }
        self.tasks.insert(id, task);
    }

    fn dequeue(&mut self, id: TaskId) {
        self.pending.retain(|pid| *pid != id);
    }

    /// Add a pending task. Always succeeds.
    pub fn add_task(
        &mut self,
        title: &str,
        description: &str,
        priority: Priority,
        dependencies: Vec<String>,
        phase: u32,
        assigned_to: Option<&str>,
    ) -> &Task {
        let id = TaskId(self.next_id);
        self.next_id += 1;
        let task = Task::new(id, title, description)
            .with_priority(priority)
            .with_phase(phase)
            .with_dependencies(dependencies)
            .with_assignee(assigned_to.map(str::to_string));
        clog_debug!(
            "Scheduler::add_task {} '{}' phase={} priority={}",
            id,
            title,
            phase,
            priority
        );
        self.insert(task);
        &self.tasks[&id]
    }

    pub fn get(&self, id: TaskId) -> Option<&Task> {
        self.tasks.get(&id)
    }

    /// Look a task up by id text (`task-003`) or title.
    pub fn find(&self, reference: &str) -> Option<&Task> {
        self.tasks.values().find(|t| t.matches_ref(reference))
    }

    /// Pending tasks in queue order.
    pub fn pending(&self) -> Vec<&Task> {
        self.pending
            .iter()
            .filter_map(|id| self.tasks.get(id))
            .collect()
    }

    pub fn in_progress(&self) -> Vec<&Task> {
        self.with_status(TaskStatus::InProgress)
    }

    pub fn with_status(&self, status: TaskStatus) -> Vec<&Task> {
        self.tasks.values().filter(|t| t.status == status).collect()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// No pending or in-progress work remains.
    pub fn all_finished(&self) -> bool {
        self.tasks.values().all(Task::is_finished)
    }

    /// Move a pending task to in-progress on `worker`.
    pub fn assign(&mut self, id: TaskId, worker: &str) -> Option<&Task> {
        let task = self.tasks.get_mut(&id)?;
        if task.status != TaskStatus::Pending {
            clog_debug!("Scheduler::assign {} ignored, status={}", id, task.status);
            return None;
        }
        task.start(worker);
        clog_debug!("Scheduler::assign {} -> {}", id, worker);
        self.dequeue(id);
        self.tasks.get(&id)
    }

    /// Record quality for in-progress work. Pending and finished tasks are
    /// not found: quality is a property of active work.
    pub fn update_quality(&mut self, id: TaskId, level: f64) -> Option<&Task> {
        let task = self
            .tasks
            .get_mut(&id)
            .filter(|t| t.status == TaskStatus::InProgress)?;
        task.set_quality(level);
        clog_debug!(
            "Scheduler::update_quality {} -> {:.2} ({})",
            id,
            task.quality_level,
            task.flow_state
        );
        Some(&*task)
    }

    /// Block a pending or in-progress task.
    pub fn mark_blocked(&mut self, id: TaskId, reason: &str) -> Option<&Task> {
        let task = self.tasks.get_mut(&id).filter(|t| t.is_active())?;
        task.block(reason);
        clog_debug!("Scheduler::mark_blocked {}: {}", id, reason);
        Some(&*task)
    }

    pub fn unblock(&mut self, id: TaskId) -> Option<&Task> {
        let task = self.tasks.get_mut(&id).filter(|t| t.is_active())?;
        task.unblock();
        clog_debug!("Scheduler::unblock {} -> {}", id, task.flow_state);
        Some(&*task)
    }

    /// Flag an in-progress task whose worker stopped reporting.
    pub fn mark_stalled(&mut self, id: TaskId) -> Option<&Task> {
        let task = self
            .tasks
            .get_mut(&id)
            .filter(|t| t.status == TaskStatus::InProgress)?;
        task.stall();
        clog_debug!("Scheduler::mark_stalled {}", id);
        Some(&*task)
    }

    /// Finish in-progress work as completed or failed.
    pub fn complete(
        &mut self,
        id: TaskId,
        result: &str,
        success: bool,
        error: Option<&str>,
    ) -> Option<&Task> {
        let task = self
            .tasks
            .get_mut(&id)
            .filter(|t| t.status == TaskStatus::InProgress)?;
        task.finish(result, success, error);
        clog!(
            "Task {} '{}' {} by {}",
            id,
            task.title,
            task.status,
            task.assigned_to.as_deref().unwrap_or("?")
        );
        Some(&*task)
    }

    /// Remove a pending task.
    ///
    /// Unknown ids return `Ok(None)`; active or finished work cannot be
    /// cancelled and is reported as a state conflict.
    pub fn cancel(&mut self, id: TaskId) -> Result<Option<Task>> {
        let Some(task) = self.tasks.get(&id) else {
            return Ok(None);
        };
        if task.status != TaskStatus::Pending {
            return Err(Error::InvalidTaskState {
                id,
                status: task.status,
                operation: "cancel",
            });
        }
        self.dequeue(id);
        clog_debug!("Scheduler::cancel {}", id);
        Ok(self.tasks.remove(&id))
    }

    /// Return a failed task to the queue for another attempt.
    pub fn requeue(&mut self, id: TaskId) -> Option<&Task> {
        let mut task = self
            .tasks
            .get(&id)
            .filter(|t| t.status == TaskStatus::Failed)?
            .clone();
        task.reset_for_retry();
        clog_debug!("Scheduler::requeue {}", id);
        self.insert(task);
        self.tasks.get(&id)
    }

    /// Raise a pending task to the front of its phase and reserve it.
    pub fn promote(&mut self, id: TaskId, worker: Option<&str>) -> Option<&Task> {
        let mut task = self.tasks.get(&id).filter(|t| t.status == TaskStatus::Pending)?.clone();
        self.dequeue(id);
        task.priority = Priority::Critical;
        if let Some(worker) = worker {
            task.assigned_to = Some(worker.to_string());
        }
        clog_debug!("Scheduler::promote {} for {:?}", id, worker);
        self.insert(task);
        self.tasks.get(&id)
    }

    /// References (ids and titles) that count as done for readiness.
    pub fn completed_refs(&self) -> HashSet<String> {
        completion_refs(self.tasks.values())
    }

    /// First ready pending task `worker` may take.
    ///
    /// Tasks reserved for another worker and blocked tasks are skipped.
    pub fn next_task_for(&self, worker: &str, current_phase: u32) -> Option<&Task> {
        let completed = self.completed_refs();
        self.pending().into_iter().find(|task| {
            task.assigned_to.as_deref().map_or(true, |w| w == worker)
                && !task.is_blocked()
                && task.is_ready(&completed, current_phase)
        })
    }

    /// Ready pending tasks nobody has reserved, in queue order.
    pub fn ready_unassigned(&self, current_phase: u32) -> Vec<&Task> {
        let completed = self.completed_refs();
        self.pending()
            .into_iter()
            .filter(|t| {
                t.assigned_to.is_none() && !t.is_blocked() && t.is_ready(&completed, current_phase)
            })
            .collect()
    }

    fn phase_complete(&self, phase: u32) -> bool {
        self.tasks
            .values()
            .filter(|t| t.phase == phase)
            .all(|t| t.status == TaskStatus::Completed)
    }

    fn has_phase(&self, phase: u32) -> bool {
        self.tasks.values().any(|t| t.phase == phase)
    }

    /// Phase the engine has advanced to.
    pub fn current_phase(&self) -> u32 {
        let phase0_done = self.phase_complete(0);
        let phase1_done = phase0_done && self.phase_complete(1);
        let has_phase2 = self.has_phase(2);

        if has_phase2 && phase0_done && self.phase_complete(2) {
            3
        } else if phase1_done && !has_phase2 && self.has_phase(3) {
            3
        } else if phase1_done && has_phase2 {
            2
        } else if phase0_done {
            1
        } else {
            0
        }
    }

    /// Aggregate flow view over active tasks.
    pub fn flow_state(&self) -> FlowSummary {
        let active: Vec<&Task> = self.tasks.values().filter(|t| t.is_active()).collect();
        let active_count = active.len();
        let quality_average = if active_count == 0 {
            0.0
        } else {
            active.iter().map(|t| t.quality_level).sum::<f64>() / active_count as f64
        };
        let blocked_count = active.iter().filter(|t| t.is_blocked()).count();
        let flourishing_count = active
            .iter()
            .filter(|t| t.quality_level >= FLOURISHING_THRESHOLD)
            .count();

        let share = |count: usize| {
            if active_count == 0 {
                0.0
            } else {
                count as f64 / active_count as f64
            }
        };
        let overall_flow = if share(blocked_count) > BLOCKED_SHARE {
            FlowState::Blocked
        } else if share(flourishing_count) > FLOURISHING_SHARE {
            FlowState::Flourishing
        } else {
            FlowState::Flowing
        };

        FlowSummary {
            quality_average,
            blocked_count,
            flourishing_count,
            active_count,
            overall_flow,
            ready_for_convergence: quality_average >= FLOURISHING_THRESHOLD && blocked_count == 0,
        }
    }

    /// Dependency cycles among unfinished tasks.
    ///
    /// Each returned group is a set of tasks that wait on each other, so
    /// none of them can ever become ready through dependencies alone.
    pub fn dependency_cycles(&self) -> Vec<Vec<TaskId>> {
        let open: Vec<&Task> = self.tasks.values().filter(|t| !t.is_finished()).collect();
        let mut graph: DiGraph<TaskId, ()> = DiGraph::new();
        let index: HashMap<TaskId, NodeIndex> = open
            .iter()
            .map(|t| (t.id, graph.add_node(t.id)))
            .collect();

        let mut self_loops = Vec::new();
        for task in &open {
            for dep in &task.dependencies {
                let Some(target) = open.iter().find(|o| o.matches_ref(dep)) else {
                    continue;
                };
                if target.id == task.id {
                    self_loops.push(vec![task.id]);
                    continue;
                }
                graph.add_edge(index[&target.id], index[&task.id], ());
            }
        }

        let mut cycles: Vec<Vec<TaskId>> = tarjan_scc(&graph)
            .into_iter()
            .filter(|component| component.len() > 1)
            .map(|component| {
                let mut ids: Vec<TaskId> = component.into_iter().map(|n| graph[n]).collect();
                ids.sort();
                ids
            })
            .chain(self_loops)
            .collect();
        cycles.sort();
        cycles.dedup();
        cycles
    }
}
