//! File store tests: what one process writes, another reads back.

use std::fs;

use concord::core::{ContractStatus, Priority, TaskStatus, WorkerStatus};
use concord::orchestration::{ContractManager, RespondAction, TaskScheduler};
use concord::state::{document, Store};
use tokio_test::assert_ok;

use crate::fixtures::*;

#[test]
fn test_tasks_survive_reopen() {
    let state = TestState::new();
    let mut scheduler = TaskScheduler::new();
    let design = scheduler
        .add_task("Design API", "Draft endpoints", Priority::High, vec![], 1, None)
        .id;
    scheduler.add_task(
        "Build client",
        "Consume the API",
        Priority::Medium,
        vec!["Design API".to_string()],
        2,
        Some("T2"),
    );
    scheduler.assign(design, "T1");
    scheduler.update_quality(design, 0.5);
    assert_ok!(state.store.save_tasks(&scheduler.snapshot()));

    let tasks = assert_ok!(state.reopen().load_tasks());
    assert_eq!(tasks.len(), 2);
    let mut restored = TaskScheduler::restore(tasks);
    let design_task = restored.get(design).unwrap();
    assert_eq!(design_task.status, TaskStatus::InProgress);
    assert_eq!(design_task.assigned_to.as_deref(), Some("T1"));
    assert_eq!(design_task.quality_level, 0.5);

    let client = restored.find("Build client").unwrap();
    assert_eq!(client.dependencies, vec!["Design API".to_string()]);
    assert_eq!(client.assigned_to.as_deref(), Some("T2"));
    let client_id = client.id;

    // New ids continue after the restored ones.
    let next = restored.add_task("Docs", "", Priority::Low, vec![], 1, None).id;
    assert!(next > client_id.max(design));
}

#[test]
fn test_second_save_keeps_a_backup() {
    let state = TestState::new();
    let mut scheduler = TaskScheduler::new();
    scheduler.add_task("First", "", Priority::Low, vec![], 1, None);
    assert_ok!(state.store.save_tasks(&scheduler.snapshot()));
    scheduler.add_task("Second", "", Priority::Low, vec![], 1, None);
    assert_ok!(state.store.save_tasks(&scheduler.snapshot()));

    let backup = state.store.tasks_path().with_extension("json.bak");
    assert!(backup.exists());
    assert!(fs::read_to_string(backup).unwrap().contains("First"));
    assert_eq!(assert_ok!(state.store.load_tasks()).len(), 2);
}

/// Given a negotiated contract saved by one handle
/// When the state directory is opened again
/// Then the Markdown document on disk reads back to the same contract
#[test]
fn test_contract_documents_on_disk() {
    let state = TestState::new();
    let mut contracts = ContractManager::new();
    let id = assert_ok!(contracts.propose(
        "T1",
        "User API",
        "api",
        "GET /users returns a list",
        Some("interface User {\n  id: string\n}")
    ))
    .id;
    assert_ok!(contracts.respond("T2", id, "agreed", None, RespondAction::Agree));
    let contract = contracts.get(id).unwrap().clone();
    assert_ok!(state.store.save_contract(&contract));

    let path = state.store.contract_path(id);
    let text = fs::read_to_string(&path).unwrap();
    assert!(text.starts_with("# Contract: User API"));
    assert!(text.contains("AGREED"));

    let loaded = assert_ok!(state.reopen().load_contracts());
    assert_eq!(loaded, vec![contract.clone()]);
    assert_eq!(assert_ok!(document::parse(&text)), contract);

    let restored = ContractManager::restore(loaded);
    assert_eq!(restored.by_name("user api").map(|c| c.status), Some(ContractStatus::Agreed));

    assert!(assert_ok!(state.store.delete_contract(id)));
    assert!(!assert_ok!(state.store.delete_contract(id)));
    assert!(assert_ok!(state.reopen().load_contracts()).is_empty());
}

#[test]
fn test_heartbeats_overwrite_per_worker() {
    let state = TestState::new();
    assert_ok!(state.store.save_heartbeat(&heartbeat("T1", WorkerStatus::Working)));
    assert_ok!(state.store.save_heartbeat(&working_on("T1", &["src/lib.rs"])
        .with_progress("40%")));
    assert_ok!(state.store.save_heartbeat(&heartbeat("T2", WorkerStatus::Idle)));

    let heartbeats = assert_ok!(state.reopen().load_heartbeats());
    assert_eq!(heartbeats.len(), 2);
    let t1 = heartbeats.iter().find(|hb| hb.worker_id == "T1").unwrap();
    assert_eq!(t1.progress, "40%");
    assert!(t1.files_touched.contains("src/lib.rs"));

    assert!(state.store.save_heartbeat(&heartbeat("../T3", WorkerStatus::Idle)).is_err());
}

#[test]
fn test_corrupt_files_are_skipped() {
    let state = TestState::new();
    assert_ok!(state.store.save_heartbeat(&heartbeat("T1", WorkerStatus::Idle)));
    let broken = state.store.root().join("heartbeats").join("T9.json");
    fs::write(&broken, "{ not json").unwrap();
    let contracts_dir = state.store.root().join("contracts");
    fs::create_dir_all(&contracts_dir).unwrap();
    fs::write(contracts_dir.join("garbage.md"), "hello").unwrap();

    assert_eq!(assert_ok!(state.store.load_heartbeats()).len(), 1);
    assert!(assert_ok!(state.store.load_contracts()).is_empty());
}

#[test]
fn test_empty_state_directory() {
    let state = TestState::new();
    assert!(assert_ok!(state.store.load_tasks()).is_empty());
    assert!(assert_ok!(state.store.load_contracts()).is_empty());
    assert!(assert_ok!(state.store.load_heartbeats()).is_empty());
}
