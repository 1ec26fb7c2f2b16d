//! The orchestrator loop.
//!
//! A [`Coordinator`] owns the scheduler, sync manager, contract manager and
//! manager intelligence for one session. [`Coordinator::step`] is a single
//! synchronous tick; [`Coordinator::run`] drives ticks on an interval and
//! runs dispatched work in parallel through the [`WorkerExecutor`].
//!
//! All state mutation happens on the loop. Executor calls are the only
//! long-running work and never touch coordinator state directly: they hand
//! their output back through the loop, which records the outcome.

use crate::config::Config;
use crate::core::{
    ActionKind, Contract, ContractRole, Heartbeat, ManagerAction, Task, TaskId, TaskStatus,
    WorkerId, WorkerStatus,
};
use crate::orchestration::contracts::ContractManager;
use crate::orchestration::executor::{ExecutorError, WorkerExecutor};
use crate::orchestration::manager::{ManagerIntelligence, ManagerSettings, Observation};
use crate::orchestration::report::{JsonReportParser, Plan, Planner, ReportParser, WorkerReport};
use crate::orchestration::scheduler::TaskScheduler;
use crate::orchestration::sync::SyncManager;
use crate::state::Store;
use crate::util::{blocking, truncate_chars};
use crate::{clog, clog_debug, clog_error, clog_warn};
use crate::Result;
use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Broadcast lines included in each prompt.
const PROMPT_BROADCASTS: usize = 5;

/// Tracks retry counts per task.
///
/// # Example
///
/// ```
/// use concord::core::TaskId;
/// use concord::orchestration::RetryTracker;
///
/// let mut tracker = RetryTracker::new(2);
/// assert!(tracker.can_retry(TaskId(1)));
/// tracker.increment(TaskId(1));
/// tracker.increment(TaskId(1));
/// assert!(!tracker.can_retry(TaskId(1)));
/// ```
#[derive(Debug, Clone, Default)]
pub struct RetryTracker {
    retries: HashMap<TaskId, u32>,
    max_retries: u32,
}

impl RetryTracker {
    pub fn new(max_retries: u32) -> Self {
        Self {
            retries: HashMap::new(),
            max_retries,
        }
    }

    /// Returns 0 if the task has not been retried.
    pub fn get_retries(&self, task_id: TaskId) -> u32 {
        self.retries.get(&task_id).copied().unwrap_or(0)
    }

    /// Returns the new retry count.
    pub fn increment(&mut self, task_id: TaskId) -> u32 {
        let count = self.retries.entry(task_id).or_insert(0);
        *count += 1;
        *count
    }

    pub fn can_retry(&self, task_id: TaskId) -> bool {
        self.get_retries(task_id) < self.max_retries
    }

    pub fn reset(&mut self, task_id: TaskId) {
        self.retries.remove(&task_id);
    }

    pub fn clear(&mut self) {
        self.retries.clear();
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }
}

/// Loop timing and limits, taken from [`Config`].
#[derive(Debug, Clone, PartialEq)]
pub struct CoordinatorSettings {
    pub workers: Vec<WorkerId>,
    pub executor_timeout: Duration,
    pub tick: Duration,
    pub manager_interval: Duration,
    pub max_retries: u32,
    pub history_limit: usize,
}

impl CoordinatorSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            workers: config.workers.clone(),
            executor_timeout: config.executor.timeout(),
            tick: config.coordinator.tick_interval(),
            manager_interval: config.coordinator.manager_interval(),
            max_retries: config.coordinator.max_retries,
            history_limit: config.coordinator.history_limit.max(1),
        }
    }
}

/// Work handed to a worker on one tick.
#[derive(Debug, Clone, PartialEq)]
pub struct Dispatch {
    pub task_id: TaskId,
    pub worker: WorkerId,
    pub prompt: String,
}

/// Lifecycle notifications for observers of a run.
#[derive(Debug, Clone, PartialEq)]
pub enum CoordinatorEvent {
    Dispatched {
        task_id: TaskId,
        worker: WorkerId,
    },
    Completed {
        task_id: TaskId,
        worker: WorkerId,
        summary: String,
    },
    Failed {
        task_id: TaskId,
        worker: WorkerId,
        error: String,
        retrying: bool,
    },
    Intervention(ManagerAction),
    Finished(RunSummary),
}

/// How a run ended.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunSummary {
    pub completed: usize,
    pub failed: usize,
    /// Tasks still pending or in progress.
    pub unfinished: usize,
    pub interventions: usize,
    /// Work remained, nothing could be dispatched, no worker was waiting on a
    /// contract and the manager had nothing left to do.
    pub stalled: bool,
    pub cancelled: bool,
}

/// One coordination session.
pub struct Coordinator<E: WorkerExecutor, S: Store> {
    settings: CoordinatorSettings,
    executor: Arc<E>,
    store: Arc<S>,
    parser: Box<dyn ReportParser>,
    scheduler: TaskScheduler,
    sync: SyncManager,
    contracts: ContractManager,
    manager: ManagerIntelligence,
    busy: BTreeMap<WorkerId, TaskId>,
    paused: BTreeSet<WorkerId>,
    reports: BTreeMap<WorkerId, Vec<WorkerReport>>,
    broadcasts: VecDeque<String>,
    retries: RetryTracker,
    interventions: usize,
    last_scan: Option<Instant>,
    scan_requested: bool,
    /// Whether the latest step ran a scan that emitted nothing.
    quiet_scan: bool,
    tasks_dirty: bool,
    dirty_heartbeats: BTreeSet<WorkerId>,
    events: Option<mpsc::Sender<CoordinatorEvent>>,
}

impl<E: WorkerExecutor, S: Store> Coordinator<E, S> {
    /// Fresh session with no tasks.
    pub fn new(config: &Config, executor: E, store: S) -> Self {
        let settings = CoordinatorSettings::from_config(config);
        Self {
            retries: RetryTracker::new(settings.max_retries),
            settings,
            executor: Arc::new(executor),
            store: Arc::new(store),
            parser: Box::new(JsonReportParser),
            scheduler: TaskScheduler::new(),
            sync: SyncManager::new(config.coordinator.stale_after()),
            contracts: ContractManager::new(),
            manager: ManagerIntelligence::new(ManagerSettings::from_config(config)),
            busy: BTreeMap::new(),
            paused: BTreeSet::new(),
            reports: BTreeMap::new(),
            broadcasts: VecDeque::new(),
            interventions: 0,
            last_scan: None,
            scan_requested: true,
            quiet_scan: false,
            tasks_dirty: false,
            dirty_heartbeats: BTreeSet::new(),
            events: None,
        }
    }

    /// Resume a session from the store.
    ///
    /// Tasks that were in progress when the previous session ended have no
    /// running worker any more; they go back to the queue.
    pub async fn restore(config: &Config, executor: E, store: S) -> Result<Self> {
        let mut coordinator = Self::new(config, executor, store);
        let store = Arc::clone(&coordinator.store);
        let (tasks, contracts, heartbeats) = blocking(move || {
            Ok((
                store.load_tasks()?,
                store.load_contracts()?,
                store.load_heartbeats()?,
            ))
        })
        .await?;

        coordinator.scheduler = TaskScheduler::restore(tasks);
        let orphaned: Vec<TaskId> = coordinator
            .scheduler
            .in_progress()
            .iter()
            .map(|t| t.id)
            .collect();
        for id in orphaned {
            clog_warn!("Task {} was in progress in a previous session, requeueing", id);
            coordinator
                .scheduler
                .complete(id, "", false, Some("interrupted"));
            coordinator.scheduler.requeue(id);
            coordinator.tasks_dirty = true;
        }
        coordinator.contracts = ContractManager::restore(contracts);
        for heartbeat in heartbeats {
            coordinator.sync.ingest(heartbeat);
        }
        clog!(
            "Coordinator restored: {} tasks, {} contracts, {} heartbeats",
            coordinator.scheduler.len(),
            coordinator.contracts.len(),
            coordinator.sync.heartbeats().len()
        );
        Ok(coordinator)
    }

    pub fn with_events(mut self, events: mpsc::Sender<CoordinatorEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn with_parser(mut self, parser: impl ReportParser + 'static) -> Self {
        self.parser = Box::new(parser);
        self
    }

    pub fn settings(&self) -> &CoordinatorSettings {
        &self.settings
    }

    pub fn scheduler(&self) -> &TaskScheduler {
        &self.scheduler
    }

    pub fn scheduler_mut(&mut self) -> &mut TaskScheduler {
        self.tasks_dirty = true;
        &mut self.scheduler
    }

    pub fn sync(&self) -> &SyncManager {
        &self.sync
    }

    pub fn contracts(&self) -> &ContractManager {
        &self.contracts
    }

    pub fn manager(&self) -> &ManagerIntelligence {
        &self.manager
    }

    pub fn reports(&self) -> &BTreeMap<WorkerId, Vec<WorkerReport>> {
        &self.reports
    }

    pub fn broadcasts(&self) -> impl Iterator<Item = &str> {
        self.broadcasts.iter().map(String::as_str)
    }

    pub fn paused(&self) -> &BTreeSet<WorkerId> {
        &self.paused
    }

    pub fn busy(&self) -> &BTreeMap<WorkerId, TaskId> {
        &self.busy
    }

    pub fn retries(&self) -> &RetryTracker {
        &self.retries
    }

    pub fn executor(&self) -> &E {
        &self.executor
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    fn emit(&self, event: CoordinatorEvent) {
        if let Some(events) = &self.events {
            if events.try_send(event).is_err() {
                clog_debug!("Coordinator event dropped, receiver full or gone");
            }
        }
    }

    /// Record a heartbeat published by a worker outside this process.
    pub fn ingest_heartbeat(&mut self, heartbeat: Heartbeat) {
        self.sync.ingest(heartbeat);
    }

    /// Replace the contract view, e.g. after workers negotiated through the store.
    pub fn replace_contracts(&mut self, contracts: Vec<Contract>) {
        self.contracts = ContractManager::restore(contracts);
    }

    /// Add every planned task. Reservations for unknown workers are dropped.
    pub fn seed_from_plan(&mut self, plan: &Plan) -> Vec<TaskId> {
        clog!(
            "Seeding {} tasks: {}",
            plan.tasks.len(),
            truncate_chars(&plan.summary, 120)
        );
        let mut ids = Vec::with_capacity(plan.tasks.len());
        for planned in &plan.tasks {
            let reserved = planned.assigned_to.as_deref().filter(|worker| {
                let known = self.settings.workers.iter().any(|w| w == worker);
                if !known {
                    clog_warn!(
                        "Plan assigns '{}' to unknown worker {}, leaving it unreserved",
                        planned.title,
                        worker
                    );
                }
                known
            });
            let task = self.scheduler.add_task(
                &planned.title,
                &planned.description,
                planned.priority,
                planned.dependencies.clone(),
                planned.phase,
                reserved,
            );
            ids.push(task.id);
        }
        self.tasks_dirty = true;
        self.scan_requested = true;
        ids
    }

    /// Ask `planner` for a plan and seed it. Planning never fails: the
    /// planner falls back to a single task.
    pub async fn plan_goal<P: Planner>(&mut self, planner: &P, goal: &str) -> Vec<TaskId> {
        let context = self.plan_context();
        let plan = planner.plan(goal, context.as_deref()).await;
        self.seed_from_plan(&plan)
    }

    fn plan_context(&self) -> Option<String> {
        if self.scheduler.is_empty() {
            return None;
        }
        let mut context = String::from("Existing tasks:\n");
        for task in self.scheduler.snapshot() {
            let _ = writeln!(context, "- {} [{}] {}", task.id, task.status, task.title);
        }
        Some(context)
    }

    /// One tick: keep busy workers' heartbeats live, run the manager scan
    /// when due, apply its actions and hand ready tasks to free workers.
    pub fn step(&mut self) -> Vec<Dispatch> {
        self.pulse_busy();

        let now = Instant::now();
        let due = self
            .last_scan
            .map_or(true, |at| now.duration_since(at) >= self.settings.manager_interval);
        self.quiet_scan = false;
        if due || self.scan_requested {
            let actions = self.scan();
            self.last_scan = Some(now);
            self.scan_requested = false;
            self.quiet_scan = actions.is_empty();
            self.apply_actions(&actions);
        }

        self.dispatch_ready()
    }

    fn scan(&mut self) -> Vec<ManagerAction> {
        let phase = self.scheduler.current_phase();
        let observation = Observation::new(self.sync.heartbeats(), &self.reports, phase)
            .with_scheduler(&self.scheduler)
            .with_contracts(&self.contracts);
        self.manager.analyze(&observation)
    }

    /// Busy workers are alive as long as their executor call is; refresh
    /// their snapshot before it could look stalled.
    fn pulse_busy(&mut self) {
        let refresh_after = self.sync.stale_after() / 3;
        let busy: Vec<(WorkerId, TaskId)> =
            self.busy.iter().map(|(w, t)| (w.clone(), *t)).collect();
        for (worker, task_id) in busy {
            let due = self.sync.heartbeat(&worker).map_or(true, |hb| {
                hb.age_at(chrono::Utc::now())
                    .and_then(|age| age.to_std().ok())
                    .map_or(true, |age| age >= refresh_after)
            });
            if !due {
                continue;
            }
            let files = self
                .sync
                .heartbeat(&worker)
                .map(|hb| hb.files_touched.clone());
            self.sync.write_heartbeat(
                &worker,
                WorkerStatus::Working,
                Some(&task_id.to_string()),
                "running",
                files,
                None,
                None,
            );
            self.dirty_heartbeats.insert(worker);
        }
    }

    /// Apply manager actions to scheduler and worker state.
    pub fn apply_actions(&mut self, actions: &[ManagerAction]) {
        for action in actions {
            self.interventions += 1;
            match &action.kind {
                ActionKind::ReorderTasks {
                    task_id,
                    target_worker,
                    ..
                } => {
                    if self.scheduler.promote(*task_id, Some(target_worker)).is_some() {
                        self.tasks_dirty = true;
                    }
                }
                ActionKind::InjectTask {
                    target_worker,
                    task_title,
                    task_description,
                } => {
                    let phase = self.scheduler.current_phase();
                    let reserved = self
                        .settings
                        .workers
                        .iter()
                        .any(|w| w == target_worker)
                        .then_some(target_worker.as_str());
                    self.scheduler.add_task(
                        task_title,
                        task_description,
                        action.priority,
                        Vec::new(),
                        phase,
                        reserved,
                    );
                    self.tasks_dirty = true;
                }
                ActionKind::BroadcastUpdate { message } => self.broadcast(message),
                ActionKind::PauseWorker { target_worker } => {
                    self.paused.insert(target_worker.clone());
                }
                ActionKind::ResumeWorker { target_worker } => {
                    self.paused.remove(target_worker);
                }
                ActionKind::Escalate { task, .. } => {
                    clog_warn!("Escalation: {}", action.reason);
                    let stalled = task
                        .as_deref()
                        .and_then(|t| self.scheduler.find(t))
                        .map(|t| t.id);
                    if let Some(id) = stalled {
                        if self.scheduler.mark_stalled(id).is_some() {
                            self.tasks_dirty = true;
                        }
                    }
                }
                ActionKind::TriggerSyncPoint { phase } => {
                    let status = self.sync.check_sync_point(&self.settings.workers);
                    let artifacts: usize = status.ready_artifacts.values().map(BTreeSet::len).sum();
                    self.broadcast(&format!(
                        "Sync point for phase {}: {} artifacts ready",
                        phase, artifacts
                    ));
                }
            }
            self.emit(CoordinatorEvent::Intervention(action.clone()));
        }
    }

    fn broadcast(&mut self, message: &str) {
        clog!("Broadcast: {}", message);
        self.broadcasts.push_back(message.to_string());
        while self.broadcasts.len() > self.settings.history_limit {
            self.broadcasts.pop_front();
        }
    }

    fn dispatch_ready(&mut self) -> Vec<Dispatch> {
        let phase = self.scheduler.current_phase();
        let mut dispatches = Vec::new();
        for worker in self.settings.workers.clone() {
            if self.busy.contains_key(&worker) || self.paused.contains(&worker) {
                continue;
            }
            let Some(task_id) = self.scheduler.next_task_for(&worker, phase).map(|t| t.id) else {
                continue;
            };
            if self.scheduler.assign(task_id, &worker).is_none() {
                continue;
            }
            let Some(task) = self.scheduler.get(task_id) else {
                continue;
            };
            let prompt = self.build_prompt(task, &worker);
            self.busy.insert(worker.clone(), task_id);
            self.sync.write_heartbeat(
                &worker,
                WorkerStatus::Working,
                Some(&task_id.to_string()),
                "0%",
                None,
                None,
                None,
            );
            self.dirty_heartbeats.insert(worker.clone());
            self.tasks_dirty = true;
            clog!("Dispatch {} -> {}", task_id, worker);
            self.emit(CoordinatorEvent::Dispatched {
                task_id,
                worker: worker.clone(),
            });
            dispatches.push(Dispatch {
                task_id,
                worker,
                prompt,
            });
        }
        dispatches
    }

    fn build_prompt(&self, task: &Task, worker: &str) -> String {
        let mut prompt = format!(
            "You are worker {} in a team of parallel agents.\n\nTASK {}: {}\n{}\n",
            worker, task.id, task.title, task.description
        );
        if !task.dependencies.is_empty() {
            let _ = writeln!(prompt, "\nBuilds on: {}", task.dependencies.join(", "));
        }
        let recent: Vec<&String> = self.broadcasts.iter().rev().take(PROMPT_BROADCASTS).collect();
        if !recent.is_empty() {
            prompt.push_str("\nCoordination updates:\n");
            for line in recent.into_iter().rev() {
                let _ = writeln!(prompt, "- {}", line);
            }
        }
        let contracts = self.contracts.for_worker(worker, ContractRole::All);
        if !contracts.is_empty() {
            prompt.push_str("\nContracts involving you:\n");
            for contract in contracts {
                let _ = writeln!(prompt, "- {} [{}]", contract.name, contract.status);
            }
        }
        prompt.push_str(
            "\nEnd your reply with one JSON object: {\"summary\", \"files_created\", \
             \"files_modified\", \"components_created\", \"provides_to_others\", \
             \"dependencies_needed\", \"next_steps\", \"blockers\", \"success\"}.",
        );
        prompt
    }

    /// Feed an executor result back into scheduler, reports and heartbeats.
    pub fn record_outcome(&mut self, dispatch: &Dispatch, outcome: std::result::Result<String, ExecutorError>) {
        let Dispatch {
            task_id, worker, ..
        } = dispatch;
        self.busy.remove(worker);
        self.scan_requested = true;
        self.tasks_dirty = true;

        let Some(task) = self.scheduler.get(*task_id).cloned() else {
            clog_warn!("Outcome for unknown task {} from {}", task_id, worker);
            return;
        };

        let (report, failure) = match outcome {
            Ok(raw) => {
                let report = self.parser.parse(&raw, &task, true);
                let failure = (!report.success).then(|| {
                    ExecutorError::Reported(if report.summary.is_empty() {
                        "worker reported failure".to_string()
                    } else {
                        report.summary.clone()
                    })
                });
                (report, failure)
            }
            Err(e) => (WorkerReport::fallback(&e.to_string(), false), Some(e)),
        };

        match &failure {
            None => {
                self.scheduler.update_quality(*task_id, 1.0);
                self.scheduler.complete(*task_id, &report.summary, true, None);
                self.retries.reset(*task_id);
                self.emit(CoordinatorEvent::Completed {
                    task_id: *task_id,
                    worker: worker.clone(),
                    summary: report.summary.clone(),
                });
            }
            Some(error) => {
                let message = error.to_string();
                self.scheduler
                    .complete(*task_id, &report.summary, false, Some(&message));
                let retrying = match error {
                    ExecutorError::Cancelled => true,
                    e if e.is_retryable() && self.retries.can_retry(*task_id) => {
                        let attempt = self.retries.increment(*task_id);
                        clog_warn!(
                            "Task {} failed on {} ({}), retry {}/{}",
                            task_id,
                            worker,
                            message,
                            attempt,
                            self.retries.max_retries()
                        );
                        true
                    }
                    _ => {
                        clog_warn!("Task {} failed on {}: {}", task_id, worker, message);
                        false
                    }
                };
                if retrying {
                    self.scheduler.requeue(*task_id);
                }
                self.emit(CoordinatorEvent::Failed {
                    task_id: *task_id,
                    worker: worker.clone(),
                    error: message,
                    retrying,
                });
            }
        }

        let files: BTreeSet<String> = report.files_touched().cloned().collect();
        let artifacts: BTreeSet<String> = report.provides_to_others.iter().cloned().collect();
        let (status, waiting_for) = match report.blockers.first() {
            Some(blocker) => (WorkerStatus::Blocked, Some(blocker.as_str())),
            None => (WorkerStatus::Idle, None),
        };
        let progress = if failure.is_none() { "100%" } else { "failed" };
        self.sync.write_heartbeat(
            worker,
            status,
            None,
            progress,
            Some(files),
            Some(artifacts),
            waiting_for,
        );
        self.dirty_heartbeats.insert(worker.clone());

        let history = self.reports.entry(worker.clone()).or_default();
        history.push(report);
        if history.len() > self.settings.history_limit {
            let excess = history.len() - self.settings.history_limit;
            history.drain(..excess);
        }
    }

    /// Pull heartbeats and contracts written by other processes.
    ///
    /// A stored heartbeat only replaces the in-memory one when it is at
    /// least as new.
    pub async fn refresh(&mut self) -> Result<()> {
        let store = Arc::clone(&self.store);
        let (heartbeats, contracts) =
            blocking(move || Ok((store.load_heartbeats()?, store.load_contracts()?))).await?;
        for heartbeat in heartbeats {
            let newer = self
                .sync
                .heartbeat(&heartbeat.worker_id)
                .map_or(true, |current| {
                    current != &heartbeat && heartbeat.timestamp_utc() >= current.timestamp_utc()
                });
            if newer && !self.dirty_heartbeats.contains(&heartbeat.worker_id) {
                self.sync.ingest(heartbeat);
            }
        }
        self.contracts = ContractManager::restore(contracts);
        Ok(())
    }

    /// Write changed tasks and heartbeats through the store.
    pub async fn persist(&mut self) -> Result<()> {
        let tasks = self.tasks_dirty.then(|| self.scheduler.snapshot());
        let heartbeats: Vec<Heartbeat> = self
            .dirty_heartbeats
            .iter()
            .filter_map(|w| self.sync.heartbeat(w).cloned())
            .collect();
        if tasks.is_none() && heartbeats.is_empty() {
            return Ok(());
        }
        let store = Arc::clone(&self.store);
        blocking(move || {
            if let Some(tasks) = &tasks {
                store.save_tasks(tasks)?;
            }
            for heartbeat in &heartbeats {
                store.save_heartbeat(heartbeat)?;
            }
            Ok(())
        })
        .await?;
        self.tasks_dirty = false;
        self.dirty_heartbeats.clear();
        Ok(())
    }

    fn launch(
        &self,
        dispatch: Dispatch,
        cancel: &CancellationToken,
    ) -> BoxFuture<'static, (Dispatch, std::result::Result<String, ExecutorError>)> {
        let executor = Arc::clone(&self.executor);
        let token = cancel.child_token();
        let timeout = self.settings.executor_timeout;
        Box::pin(async move {
            let outcome = executor.execute(&dispatch.prompt, timeout, token).await;
            (dispatch, outcome)
        })
    }

    pub fn summary(&self) -> RunSummary {
        RunSummary {
            completed: self.scheduler.with_status(TaskStatus::Completed).len(),
            failed: self.scheduler.with_status(TaskStatus::Failed).len(),
            unfinished: self.scheduler.pending().len() + self.scheduler.in_progress().len(),
            interventions: self.interventions,
            stalled: false,
            cancelled: false,
        }
    }

    /// Drive the session until all work is finished, nothing more can
    /// happen, or `cancel` fires. In-flight executions are cancelled with
    /// the session and their outcomes recorded before returning.
    pub async fn run(&mut self, cancel: CancellationToken) -> Result<RunSummary> {
        clog!(
            "Coordinator run: {} workers, {} tasks",
            self.settings.workers.len(),
            self.scheduler.len()
        );
        let mut in_flight = FuturesUnordered::new();
        let mut ticker = tokio::time::interval(self.settings.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut stalled = false;
        let mut cancelled = false;

        loop {
            if let Err(e) = self.persist().await {
                clog_error!("Failed to persist coordination state: {}", e);
            }
            if let Err(e) = self.refresh().await {
                clog_warn!("Failed to refresh from store: {}", e);
            }
            for dispatch in self.step() {
                in_flight.push(self.launch(dispatch, &cancel));
            }

            if in_flight.is_empty() {
                if self.scheduler.all_finished() {
                    break;
                }
                // A worker paused on a contract resumes once it settles in the store.
                if self.quiet_scan && self.manager.paused_workers().is_empty() {
                    clog_warn!("No runnable work and no interventions left, stopping");
                    stalled = true;
                    break;
                }
                self.scan_requested = true;
            }

            tokio::select! {
                _ = cancel.cancelled() => {
                    cancelled = true;
                    break;
                }
                Some((dispatch, outcome)) = in_flight.next(), if !in_flight.is_empty() => {
                    self.record_outcome(&dispatch, outcome);
                }
                _ = ticker.tick() => {}
            }
        }

        while let Some((dispatch, outcome)) = in_flight.next().await {
            self.record_outcome(&dispatch, outcome);
        }
        if let Err(e) = self.persist().await {
            clog_error!("Failed to persist coordination state: {}", e);
        }

        let summary = RunSummary {
            stalled,
            cancelled,
            ..self.summary()
        };
        clog!(
            "Coordinator finished: {} completed, {} failed, {} unfinished{}{}",
            summary.completed,
            summary.failed,
            summary.unfinished,
            if summary.stalled { ", stalled" } else { "" },
            if summary.cancelled { ", cancelled" } else { "" }
        );
        self.emit(CoordinatorEvent::Finished(summary.clone()));
        Ok(summary)
    }
}
