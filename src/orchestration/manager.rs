//! Manager intelligence: turns observed state into corrective actions.
//!
//! A scan reads heartbeats, worker reports and, when available, scheduler
//! and contract state. Each recurring condition is addressed once: the
//! manager remembers what it already acted on until [`ManagerIntelligence::clear_history`].

use crate::config::{Config, RoleMap, WorkerRole};
use crate::core::{ContractId, ContractStatus, Heartbeat, ManagerAction, Priority, TaskId, WorkerId, WorkerStatus};
use crate::orchestration::contracts::ContractManager;
use crate::orchestration::report::WorkerReport;
use crate::orchestration::scheduler::TaskScheduler;
use crate::orchestration::sync::{group_file_conflicts, is_stale_at};
use crate::util::truncate_chars;
use crate::{clog, clog_debug};
use chrono::{DateTime, Utc};
use regex::Regex;
use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};
use std::sync::OnceLock;
use std::time::Duration;

fn role_patterns() -> &'static [(WorkerRole, Regex)] {
    static PATTERNS: OnceLock<Vec<(WorkerRole, Regex)>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            (WorkerRole::Architecture, r"(?i)\b(model|service|api|backend)"),
            (WorkerRole::Interface, r"(?i)\b(view|component|ui\b)"),
            (WorkerRole::Documentation, r"(?i)\b(readme|doc)"),
            (WorkerRole::Quality, r"(?i)\b(test|verif)"),
        ]
        .into_iter()
        .filter_map(|(role, pattern)| Regex::new(pattern).ok().map(|re| (role, re)))
        .collect()
    })
}

/// Role responsible for resolving `text`, by keyword. Defaults to architecture.
pub fn route_role(text: &str) -> WorkerRole {
    role_patterns()
        .iter()
        .find(|(_, re)| re.is_match(text))
        .map(|(role, _)| *role)
        .unwrap_or(WorkerRole::Architecture)
}

#[derive(Debug, Clone, PartialEq)]
pub struct ManagerSettings {
    /// Heartbeat age after which a worker holding a task is stalled.
    pub stall_after: Duration,
    /// Workers whose heartbeat is older than this are not active for sync points.
    pub stale_after: Duration,
    pub history_limit: usize,
    pub roles: RoleMap,
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self {
            stall_after: Duration::from_secs(90),
            stale_after: Duration::from_secs(90),
            history_limit: 200,
            roles: RoleMap::default(),
        }
    }
}

impl ManagerSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            stall_after: config.coordinator.stall_after(),
            stale_after: config.coordinator.stale_after(),
            history_limit: config.coordinator.history_limit,
            roles: config.roles.clone(),
        }
    }
}

/// Everything one scan looks at.
#[derive(Debug, Clone, Copy)]
pub struct Observation<'a> {
    pub heartbeats: &'a BTreeMap<WorkerId, Heartbeat>,
    /// Reports per worker, oldest first.
    pub reports: &'a BTreeMap<WorkerId, Vec<WorkerReport>>,
    pub scheduler: Option<&'a TaskScheduler>,
    pub contracts: Option<&'a ContractManager>,
    pub current_phase: u32,
    pub now: DateTime<Utc>,
}

impl<'a> Observation<'a> {
    pub fn new(
        heartbeats: &'a BTreeMap<WorkerId, Heartbeat>,
        reports: &'a BTreeMap<WorkerId, Vec<WorkerReport>>,
        current_phase: u32,
    ) -> Self {
        Self {
            heartbeats,
            reports,
            scheduler: None,
            contracts: None,
            current_phase,
            now: Utc::now(),
        }
    }

    pub fn with_scheduler(mut self, scheduler: &'a TaskScheduler) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    pub fn with_contracts(mut self, contracts: &'a ContractManager) -> Self {
        self.contracts = Some(contracts);
        self
    }

    pub fn at(mut self, now: DateTime<Utc>) -> Self {
        self.now = now;
        self
    }
}

#[derive(Debug, Default)]
pub struct ManagerIntelligence {
    settings: ManagerSettings,
    recent_actions: VecDeque<ManagerAction>,
    seen_stalls: HashSet<(WorkerId, String, String)>,
    seen_blockers: HashSet<(WorkerId, String)>,
    seen_conflicts: HashSet<(String, Vec<WorkerId>)>,
    seen_mismatches: HashSet<(WorkerId, String)>,
    seen_promotions: HashSet<(WorkerId, TaskId)>,
    synced_phases: HashSet<u32>,
    seen_cycles: HashSet<Vec<TaskId>>,
    /// Contract id and the history index of the dispute entry.
    seen_disputes: HashSet<(ContractId, usize)>,
    /// Workers paused until a contract settles.
    paused: BTreeMap<WorkerId, ContractId>,
}

impl ManagerIntelligence {
    pub fn new(settings: ManagerSettings) -> Self {
        Self {
            settings,
            ..Self::default()
        }
    }

    pub fn settings(&self) -> &ManagerSettings {
        &self.settings
    }

    /// Scan heartbeats and reports only.
    pub fn analyze_and_decide(
        &mut self,
        heartbeats: &BTreeMap<WorkerId, Heartbeat>,
        reports: &BTreeMap<WorkerId, Vec<WorkerReport>>,
        current_phase: u32,
    ) -> Vec<ManagerAction> {
        self.analyze(&Observation::new(heartbeats, reports, current_phase))
    }

    /// Full scan. Returns only actions not emitted before.
    pub fn analyze(&mut self, obs: &Observation<'_>) -> Vec<ManagerAction> {
        let mut actions = Vec::new();
        self.check_stalls(obs, &mut actions);
        self.check_blockers(obs, &mut actions);
        self.check_file_conflicts(obs, &mut actions);
        self.check_interface_mismatches(obs, &mut actions);
        self.check_idle_workers(obs, &mut actions);
        self.check_sync_point(obs, &mut actions);
        self.check_cycles(obs, &mut actions);
        self.check_disputes(obs, &mut actions);
        self.check_resumes(obs, &mut actions);

        for action in &actions {
            clog!("Manager: {}", action);
            self.recent_actions.push_back(action.clone());
        }
        while self.recent_actions.len() > self.settings.history_limit {
            self.recent_actions.pop_front();
        }
        clog_debug!(
            "Manager scan: {} heartbeats, phase {}, {} actions",
            obs.heartbeats.len(),
            obs.current_phase,
            actions.len()
        );
        actions
    }

    pub fn recent_actions(&self) -> impl Iterator<Item = &ManagerAction> {
        self.recent_actions.iter()
    }

    /// Forget emitted actions and every dedup key.
    pub fn clear_history(&mut self) {
        self.recent_actions.clear();
        self.seen_stalls.clear();
        self.seen_blockers.clear();
        self.seen_conflicts.clear();
        self.seen_mismatches.clear();
        self.seen_promotions.clear();
        self.synced_phases.clear();
        self.seen_cycles.clear();
        self.seen_disputes.clear();
    }

    /// Session reset: history plus pause bookkeeping.
    pub fn reset(&mut self) {
        self.clear_history();
        self.paused.clear();
    }

    /// Workers currently paused on a contract.
    pub fn paused_workers(&self) -> &BTreeMap<WorkerId, ContractId> {
        &self.paused
    }

    fn check_stalls(&mut self, obs: &Observation<'_>, actions: &mut Vec<ManagerAction>) {
        for hb in obs.heartbeats.values() {
            let Some(task) = hb.current_task.as_deref() else {
                continue;
            };
            if !is_stale_at(hb, self.settings.stall_after, obs.now) {
                continue;
            }
            let key = (hb.worker_id.clone(), task.to_string(), hb.timestamp.clone());
            if !self.seen_stalls.insert(key) {
                continue;
            }
            let silence = hb
                .age_at(obs.now)
                .map(|age| format!("{}s", age.num_seconds()))
                .unwrap_or_else(|| "an unreadable time".to_string());
            actions.push(ManagerAction::escalate(
                Some(hb.worker_id.as_str()),
                Some(task),
                format!("{} has not reported for {} while on {}", hb.worker_id, silence, task),
            ));
        }
    }

    fn check_blockers(&mut self, obs: &Observation<'_>, actions: &mut Vec<ManagerAction>) {
        for hb in obs.heartbeats.values() {
            if hb.status != WorkerStatus::Blocked {
                continue;
            }
            let reason = hb
                .waiting_for
                .as_deref()
                .map(str::trim)
                .filter(|r| !r.is_empty())
                .unwrap_or_else(|| hb.progress.trim())
                .to_string();
            if !self
                .seen_blockers
                .insert((hb.worker_id.clone(), reason.clone()))
            {
                continue;
            }

            let notice = if reason.is_empty() {
                format!("{} is blocked", hb.worker_id)
            } else {
                format!("{} is blocked: {}", hb.worker_id, reason)
            };
            actions.push(ManagerAction::broadcast(&notice, "worker reported BLOCKED"));
            if reason.is_empty() {
                continue;
            }

            let contract = obs
                .contracts
                .and_then(|contracts| contract_named_in(contracts, &reason));
            match contract {
                Some((id, name, status)) if !status.is_settled() => {
                    if self.paused.contains_key(&hb.worker_id) {
                        continue;
                    }
                    self.paused.insert(hb.worker_id.clone(), id);
                    actions.push(ManagerAction::pause_worker(
                        &hb.worker_id,
                        format!("waiting for contract '{}' which is {}", name, status),
                    ));
                }
                // Already settled: the worker only needs to pick it up.
                Some(_) => {}
                None => {
                    let role = route_role(&reason);
                    let target = self.settings.roles.worker_for(role);
                    actions.push(ManagerAction::inject_task(
                        target,
                        &format!("Unblock {}: {}", hb.worker_id, truncate_chars(&reason, 60)),
                        &format!(
                            "{} is blocked waiting for: {}. Provide it so they can continue.",
                            hb.worker_id, reason
                        ),
                        format!("blocker routed to {} worker", role),
                    ));
                }
            }
        }
    }

    fn check_file_conflicts(&mut self, obs: &Observation<'_>, actions: &mut Vec<ManagerAction>) {
        for conflict in group_file_conflicts(obs.heartbeats.values()) {
            let key = (conflict.path.clone(), conflict.workers.clone());
            if !self.seen_conflicts.insert(key) {
                continue;
            }
            actions.push(
                ManagerAction::broadcast(
                    &format!(
                        "{} is being edited by {}; coordinate before writing",
                        conflict.path,
                        conflict.workers.join(", ")
                    ),
                    format!("file conflict on {}", conflict.path),
                )
                .with_priority(Priority::High),
            );
        }
    }

    fn check_interface_mismatches(
        &mut self,
        obs: &Observation<'_>,
        actions: &mut Vec<ManagerAction>,
    ) {
        // provider name (lowercase) -> workers providing it
        let mut provided: BTreeMap<String, BTreeSet<&str>> = BTreeMap::new();
        let offers = obs
            .reports
            .iter()
            .flat_map(|(worker, reports)| {
                reports
                    .iter()
                    .flat_map(|r| &r.provides_to_others)
                    .map(move |item| (item, worker.as_str()))
            })
            .chain(obs.heartbeats.values().flat_map(|hb| {
                hb.ready_artifacts
                    .iter()
                    .map(move |artifact| (artifact, hb.worker_id.as_str()))
            }));
        for (name, worker) in offers {
            let name = name.trim().to_lowercase();
            // A blank name would match every need.
            if !name.is_empty() {
                provided.entry(name).or_default().insert(worker);
            }
        }
        let settled: Vec<String> = obs
            .contracts
            .map(|contracts| {
                contracts
                    .all()
                    .filter(|c| c.status.is_settled())
                    .map(|c| c.name.to_lowercase())
                    .collect()
            })
            .unwrap_or_default();

        for (worker, reports) in obs.reports {
            let Some(latest) = reports.last() else {
                continue;
            };
            for need in &latest.dependencies_needed {
                let wanted = need.trim().to_lowercase();
                if wanted.is_empty() {
                    continue;
                }
                let by_other = provided.iter().any(|(name, workers)| {
                    names_match(name, &wanted) && workers.iter().any(|w| *w != worker.as_str())
                });
                let by_contract = settled.iter().any(|name| names_match(name, &wanted));
                if by_other || by_contract {
                    continue;
                }
                if !self.seen_mismatches.insert((worker.clone(), wanted)) {
                    continue;
                }
                let role = route_role(need);
                let target = self.settings.roles.worker_for(role);
                actions.push(ManagerAction::inject_task(
                    target,
                    &format!("Provide {} for {}", truncate_chars(need.trim(), 60), worker),
                    &format!(
                        "{} needs '{}' but no other worker provides it yet.",
                        worker,
                        need.trim()
                    ),
                    format!("interface mismatch: {} needs {}", worker, need.trim()),
                ));
            }
        }
    }

    fn check_idle_workers(&mut self, obs: &Observation<'_>, actions: &mut Vec<ManagerAction>) {
        let Some(scheduler) = obs.scheduler else {
            return;
        };
        let candidates: Vec<_> = scheduler
            .ready_unassigned(obs.current_phase)
            .into_iter()
            .filter(|t| t.priority <= Priority::High)
            .collect();
        let mut taken: HashSet<TaskId> = HashSet::new();
        for hb in obs.heartbeats.values() {
            if hb.status != WorkerStatus::Idle
                || is_stale_at(hb, self.settings.stale_after, obs.now)
                || self.paused.contains_key(&hb.worker_id)
            {
                continue;
            }
            let Some(task) = candidates.iter().find(|t| {
                !taken.contains(&t.id)
                    && !self.seen_promotions.contains(&(hb.worker_id.clone(), t.id))
            }) else {
                continue;
            };
            taken.insert(task.id);
            self.seen_promotions.insert((hb.worker_id.clone(), task.id));
            actions.push(ManagerAction::reorder_tasks(
                task.id,
                &task.title,
                &hb.worker_id,
                format!(
                    "{} is idle while {} priority '{}' waits unassigned",
                    hb.worker_id, task.priority, task.title
                ),
            ));
        }
    }

    fn check_sync_point(&mut self, obs: &Observation<'_>, actions: &mut Vec<ManagerAction>) {
        if self.synced_phases.contains(&obs.current_phase) {
            return;
        }
        let active: Vec<&Heartbeat> = obs
            .heartbeats
            .values()
            .filter(|hb| !is_stale_at(hb, self.settings.stale_after, obs.now))
            .collect();
        let all_settled = active
            .iter()
            .all(|hb| matches!(hb.status, WorkerStatus::Waiting | WorkerStatus::Idle));
        if active.is_empty() || !all_settled {
            return;
        }
        self.synced_phases.insert(obs.current_phase);
        actions.push(ManagerAction::trigger_sync_point(
            obs.current_phase,
            format!(
                "all {} active workers are waiting or idle in phase {}",
                active.len(),
                obs.current_phase
            ),
        ));
    }

    fn check_cycles(&mut self, obs: &Observation<'_>, actions: &mut Vec<ManagerAction>) {
        let Some(scheduler) = obs.scheduler else {
            return;
        };
        for cycle in scheduler.dependency_cycles() {
            if !self.seen_cycles.insert(cycle.clone()) {
                continue;
            }
            let ids: Vec<String> = cycle.iter().map(ToString::to_string).collect();
            actions.push(ManagerAction::escalate(
                None,
                Some(ids.join(", ").as_str()),
                format!("dependency cycle: {} can never become ready", ids.join(" <-> ")),
            ));
        }
    }

    fn check_disputes(&mut self, obs: &Observation<'_>, actions: &mut Vec<ManagerAction>) {
        let Some(contracts) = obs.contracts else {
            return;
        };
        for contract in contracts.by_status(ContractStatus::Disputed) {
            let Some((index, entry)) = contract
                .history
                .iter()
                .enumerate()
                .rev()
                .find(|(_, e)| e.transition == Some(ContractStatus::Disputed))
            else {
                continue;
            };
            if !self.seen_disputes.insert((contract.id, index)) {
                continue;
            }
            actions.push(ManagerAction::escalate(
                Some(entry.worker.as_str()),
                None,
                format!(
                    "contract '{}' disputed by {}: {}",
                    contract.name,
                    entry.worker,
                    truncate_chars(entry.content.trim(), 120)
                ),
            ));
        }
    }

    fn check_resumes(&mut self, obs: &Observation<'_>, actions: &mut Vec<ManagerAction>) {
        let Some(contracts) = obs.contracts else {
            return;
        };
        let ready: Vec<(WorkerId, String)> = self
            .paused
            .iter()
            .filter_map(|(worker, id)| match contracts.get(*id) {
                Some(c) if c.status.is_settled() => {
                    Some((worker.clone(), format!("contract '{}' is {}", c.name, c.status)))
                }
                Some(c) if c.status == ContractStatus::Deprecated => {
                    Some((worker.clone(), format!("contract '{}' was deprecated", c.name)))
                }
                Some(_) => None,
                None => Some((worker.clone(), "contract was removed".to_string())),
            })
            .collect();
        for (worker, reason) in ready {
            self.paused.remove(&worker);
            actions.push(ManagerAction::resume_worker(&worker, reason));
        }
    }
}

fn names_match(a: &str, b: &str) -> bool {
    a == b || a.contains(b) || b.contains(a)
}

/// Live contract whose name appears in `text`, longest name first.
fn contract_named_in(
    contracts: &ContractManager,
    text: &str,
) -> Option<(ContractId, String, ContractStatus)> {
    let text = text.to_lowercase();
    contracts
        .all()
        .filter(|c| c.status != ContractStatus::Deprecated)
        .filter(|c| text.contains(&c.name.to_lowercase()))
        .max_by_key(|c| c.name.len())
        .map(|c| (c.id, c.name.clone(), c.status))
}
