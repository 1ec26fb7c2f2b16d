//! Manager and sync-point tests over heartbeat snapshots.

use std::time::Duration;

use chrono::Utc;

use concord::core::{ActionKind, ManagerAction, Priority, WorkerStatus};
use concord::orchestration::{
    is_stale_at, ContractManager, ManagerIntelligence, ManagerSettings, Observation, RespondAction,
    SyncManager, TaskScheduler, WorkerReport,
};

use crate::fixtures::*;

fn kinds(actions: &[ManagerAction]) -> Vec<&'static str> {
    actions.iter().map(|a| a.kind.name()).collect()
}

#[test]
fn test_staleness_boundary() {
    let now = Utc::now();
    let max_age = Duration::from_secs(90);
    let exactly = heartbeat("T1", WorkerStatus::Working).at(now - chrono::Duration::seconds(90));
    let older = heartbeat("T1", WorkerStatus::Working).at(now - chrono::Duration::seconds(91));

    assert!(!is_stale_at(&exactly, max_age, now));
    assert!(is_stale_at(&older, max_age, now));

    let mut garbled = heartbeat("T1", WorkerStatus::Working);
    garbled.timestamp = "yesterday-ish".to_string();
    assert!(is_stale_at(&garbled, max_age, now));
}

/// Given three workers where one is still working
/// When the sync point is checked
/// Then it is not ready until that worker is waiting too
#[test]
fn test_sync_point_waits_for_working_worker() {
    let mut sync = SyncManager::default();
    sync.ingest(heartbeat("T1", WorkerStatus::Waiting).with_artifacts(["user-model"]));
    sync.ingest(heartbeat("T2", WorkerStatus::Working).with_task("task-002"));
    sync.ingest(heartbeat("T3", WorkerStatus::Idle));
    let workers = ["T1", "T2", "T3"];

    let status = sync.check_sync_point(&workers);
    assert!(!status.all_ready);
    assert_eq!(status.working, vec!["T2".to_string()]);
    assert!(status.ready_artifacts["T1"].contains("user-model"));

    sync.ingest(heartbeat("T2", WorkerStatus::Waiting));
    let status = sync.check_sync_point(&workers);
    assert!(status.all_ready);
    assert_eq!(status.waiting.len(), 2);
    assert_eq!(status.idle, vec!["T3".to_string()]);
}

#[test]
fn test_sync_point_counts_missing_and_stale_workers() {
    let mut sync = SyncManager::default();
    sync.ingest(heartbeat("T1", WorkerStatus::Waiting));
    sync.ingest(aged(heartbeat("T2", WorkerStatus::Working), 600));

    let status = sync.check_sync_point(&["T1", "T2", "T3"]);
    assert!(!status.all_ready);
    assert_eq!(status.stale, vec!["T2".to_string()]);
    assert_eq!(status.missing, vec!["T3".to_string()]);
    assert!(status.working.is_empty());
}

/// Given two working heartbeats that both touch `src/models/user.rs`
/// When the manager scans twice
/// Then one high-priority broadcast is emitted, only the first time
#[test]
fn test_file_conflict_is_broadcast_once() {
    let heartbeats = heartbeat_map(vec![
        working_on("T1", &["src/models/user.rs", "src/views/list.rs"]),
        working_on("T2", &["src/models/user.rs"]),
    ]);
    let mut manager = ManagerIntelligence::new(ManagerSettings::default());

    let first = manager.analyze_and_decide(&heartbeats, &no_reports(), 1);
    let conflicts: Vec<&ManagerAction> = first
        .iter()
        .filter(|a| matches!(&a.kind, ActionKind::BroadcastUpdate { message } if message.contains("src/models/user.rs")))
        .collect();
    assert_eq!(conflicts.len(), 1);
    assert_eq!(conflicts[0].priority, Priority::High);
    match &conflicts[0].kind {
        ActionKind::BroadcastUpdate { message } => assert!(message.contains("T1, T2")),
        other => panic!("unexpected action {:?}", other),
    }

    let second = manager.analyze_and_decide(&heartbeats, &no_reports(), 1);
    assert!(second
        .iter()
        .all(|a| !matches!(a.kind, ActionKind::BroadcastUpdate { .. })));

    manager.clear_history();
    let third = manager.analyze_and_decide(&heartbeats, &no_reports(), 1);
    assert_eq!(kinds(&third), vec!["BROADCAST_UPDATE"]);
}

/// Given T1 blocked on a contract still under negotiation
/// When the contract is agreed
/// Then T1 is paused first and resumed on the next scan
#[test]
fn test_contract_blocker_pauses_then_resumes() {
    let mut contracts = ContractManager::new();
    let id = contracts
        .propose("T2", "User API", "api", "GET /users", None)
        .unwrap()
        .id;
    let heartbeats = heartbeat_map(vec![heartbeat("T1", WorkerStatus::Blocked)
        .with_waiting_for("the User API contract")]);
    let reports = no_reports();
    let mut manager = ManagerIntelligence::new(ManagerSettings::default());

    let actions = manager.analyze(&Observation::new(&heartbeats, &reports, 1).with_contracts(&contracts));
    assert_eq!(kinds(&actions), vec!["BROADCAST_UPDATE", "PAUSE_WORKER"]);
    assert!(manager.paused_workers().contains_key("T1"));

    let quiet = manager.analyze(&Observation::new(&heartbeats, &reports, 1).with_contracts(&contracts));
    assert!(quiet.is_empty());

    contracts
        .respond("T1", id, "agreed", None, RespondAction::Agree)
        .unwrap();
    let actions = manager.analyze(&Observation::new(&heartbeats, &reports, 1).with_contracts(&contracts));
    assert_eq!(kinds(&actions), vec!["RESUME_WORKER"]);
    assert!(manager.paused_workers().is_empty());
}

#[test]
fn test_unknown_blocker_is_routed_as_a_task() {
    let heartbeats = heartbeat_map(vec![heartbeat("T3", WorkerStatus::Blocked)
        .with_waiting_for("test fixtures for the parser")]);
    let mut manager = ManagerIntelligence::new(ManagerSettings::default());

    let actions = manager.analyze_and_decide(&heartbeats, &no_reports(), 1);
    let inject = actions
        .iter()
        .find_map(|a| match &a.kind {
            ActionKind::InjectTask { target_worker, task_title, .. } => Some((target_worker, task_title)),
            _ => None,
        })
        .expect("an injected task");
    // Testing work belongs to the quality role, T5 by default.
    assert_eq!(inject.0, "T5");
    assert!(inject.1.starts_with("Unblock T3"));
}

#[test]
fn test_missing_interface_injects_provider_task() {
    let heartbeats = heartbeat_map(vec![heartbeat("T1", WorkerStatus::Working)]);
    let mut reports = no_reports();
    reports.insert(
        "T1".to_string(),
        vec![WorkerReport {
            summary: "list view".to_string(),
            dependencies_needed: vec!["user service".to_string()],
            success: true,
            ..WorkerReport::default()
        }],
    );
    let mut manager = ManagerIntelligence::new(ManagerSettings::default());
    let actions = manager.analyze_and_decide(&heartbeats, &reports, 1);
    assert!(actions.iter().any(|a| matches!(
        &a.kind,
        ActionKind::InjectTask { target_worker, task_title, .. }
            if target_worker == "T2" && task_title == "Provide user service for T1"
    )));

    // Once another worker provides it, a fresh manager sees no gap.
    reports.insert(
        "T2".to_string(),
        vec![WorkerReport {
            provides_to_others: vec!["User Service".to_string()],
            success: true,
            ..WorkerReport::default()
        }],
    );
    let mut fresh = ManagerIntelligence::new(ManagerSettings::default());
    let actions = fresh.analyze_and_decide(&heartbeats, &reports, 1);
    assert!(actions
        .iter()
        .all(|a| !matches!(a.kind, ActionKind::InjectTask { .. })));
}

#[test]
fn test_idle_worker_gets_urgent_work_and_phase_syncs_once() {
    let mut scheduler = TaskScheduler::new();
    let urgent = scheduler
        .add_task("Fix login", "", Priority::Critical, vec![], 1, None)
        .id;
    scheduler.add_task("Polish copy", "", Priority::Low, vec![], 1, None);
    let heartbeats = heartbeat_map(vec![
        heartbeat("T1", WorkerStatus::Idle),
        heartbeat("T2", WorkerStatus::Waiting),
    ]);
    let reports = no_reports();
    let mut manager = ManagerIntelligence::new(ManagerSettings::default());

    let obs = Observation::new(&heartbeats, &reports, 1).with_scheduler(&scheduler);
    let actions = manager.analyze(&obs);
    assert_eq!(kinds(&actions), vec!["REORDER_TASKS", "TRIGGER_SYNC_POINT"]);
    assert!(matches!(
        &actions[0].kind,
        ActionKind::ReorderTasks { task_id, target_worker, .. } if *task_id == urgent && target_worker == "T1"
    ));
    assert!(matches!(actions[1].kind, ActionKind::TriggerSyncPoint { phase: 1 }));

    assert!(manager.analyze(&obs).is_empty());
    assert_eq!(manager.recent_actions().count(), 2);
}

#[test]
fn test_stalled_worker_escalates() {
    let heartbeats = heartbeat_map(vec![aged(
        heartbeat("T2", WorkerStatus::Working).with_task("task-004"),
        300,
    )]);
    let mut manager = ManagerIntelligence::new(ManagerSettings::default());
    let actions = manager.analyze_and_decide(&heartbeats, &no_reports(), 1);
    assert!(actions.iter().any(|a| matches!(
        &a.kind,
        ActionKind::Escalate { target_worker: Some(w), task: Some(t) } if w == "T2" && t == "task-004"
    )));
}
