//! Full coordinator runs against a file store.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use concord::core::{Priority, TaskStatus, WorkerStatus};
use concord::orchestration::{ContractManager, Coordinator, CoordinatorEvent, MockExecutor, RespondAction};
use concord::state::{FileStore, Store};

use crate::fixtures::*;

/// Given a two-phase plan and two workers
/// When the coordinator runs to completion
/// Then every task is completed on disk and both workers end idle
#[tokio::test]
async fn test_phased_plan_runs_to_completion() {
    let state = TestState::new();
    let executor = reporting_executor();
    let mut coordinator = Coordinator::new(&fast_config(&["T1", "T2"]), executor.clone(), state.store.clone());
    let seeded = coordinator.seed_from_plan(&plan_of(vec![
        planned("Design API", Priority::High, 1, &[]),
        planned("Write models", Priority::Medium, 1, &[]),
        planned("Build client", Priority::Medium, 2, &["Design API"]),
    ]));
    assert_eq!(seeded.len(), 3);

    let summary = coordinator.run(CancellationToken::new()).await.unwrap();
    assert_eq!(summary.completed, 3);
    assert_eq!(summary.failed, 0);
    assert_eq!(summary.unfinished, 0);
    assert!(!summary.stalled && !summary.cancelled);
    assert_eq!(executor.call_count(), 3);

    // Phase-2 work is only dispatched after its phase opens.
    let calls = executor.calls();
    let client_call = calls
        .iter()
        .position(|p| p.contains("Build client"))
        .unwrap();
    let design_call = calls.iter().position(|p| p.contains("Design API")).unwrap();
    assert!(design_call < client_call);

    let stored = state.reopen().load_tasks().unwrap();
    assert_eq!(stored.len(), 3);
    assert!(stored.iter().all(|t| t.status == TaskStatus::Completed));
    assert!(stored
        .iter()
        .all(|t| t.result.as_deref().is_some_and(|r| r.starts_with("finished TASK"))));

    let heartbeats = state.reopen().load_heartbeats().unwrap();
    assert!(!heartbeats.is_empty());
    assert!(heartbeats.iter().all(|hb| hb.status == WorkerStatus::Idle));
}

#[tokio::test]
async fn test_transient_failure_is_retried() {
    let state = TestState::new();
    let executor = flaky_executor("Flaky step");
    let (tx, mut rx) = mpsc::channel(256);
    let mut coordinator = Coordinator::new(&fast_config(&["T1"]), executor.clone(), state.store.clone())
        .with_events(tx);
    coordinator.seed_from_plan(&plan_of(vec![
        planned("Flaky step", Priority::High, 1, &[]),
        planned("Steady step", Priority::Low, 1, &[]),
    ]));

    let summary = coordinator.run(CancellationToken::new()).await.unwrap();
    assert_eq!(summary.completed, 2);
    assert_eq!(executor.call_count(), 3);

    let mut retried = 0;
    let mut finished = None;
    while let Ok(event) = rx.try_recv() {
        match event {
            CoordinatorEvent::Failed { retrying, error, .. } => {
                assert!(retrying);
                assert!(error.contains("transient failure"));
                retried += 1;
            }
            CoordinatorEvent::Finished(summary) => finished = Some(summary),
            _ => {}
        }
    }
    assert_eq!(retried, 1);
    assert_eq!(finished, Some(summary));
}

#[tokio::test]
async fn test_restore_after_cancelled_run() {
    let state = TestState::new();
    let slow = MockExecutor::replying(r#"{"summary": "ok", "success": true}"#).with_delay(std::time::Duration::from_secs(30));
    let mut coordinator = Coordinator::new(&fast_config(&["T1"]), slow, state.store.clone());
    coordinator.seed_from_plan(&plan_of(vec![planned("Long job", Priority::Medium, 1, &[])]));

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(SHORT).await;
        trigger.cancel();
    });
    let summary = coordinator.run(cancel).await.unwrap();
    assert!(summary.cancelled);
    assert_eq!(summary.unfinished, 1);

    // A new session picks the work up from disk and finishes it.
    let executor = reporting_executor();
    let mut resumed = Coordinator::restore(&fast_config(&["T1"]), executor.clone(), state.reopen())
        .await
        .unwrap();
    assert_eq!(resumed.scheduler().pending().len(), 1);
    let summary = resumed.run(CancellationToken::new()).await.unwrap();
    assert_eq!(summary.completed, 1);
    assert_eq!(executor.call_count(), 1);
}

/// Given a contract proposed through the store by another process
/// When the coordinator dispatches work to the proposer
/// Then the prompt lists the contract with its status
#[tokio::test]
async fn test_stored_contracts_reach_worker_prompts() {
    let state = TestState::new();
    let mut contracts = ContractManager::new();
    let contract = contracts
        .propose("T1", "User API", "api", "GET /users", None)
        .unwrap()
        .clone();
    let writer: FileStore = state.reopen();
    writer.save_contract(&contract).unwrap();

    let executor = reporting_executor();
    let mut coordinator = Coordinator::restore(&fast_config(&["T1"]), executor.clone(), state.store.clone())
        .await
        .unwrap();
    assert_eq!(coordinator.contracts().len(), 1);
    coordinator.seed_from_plan(&plan_of(vec![planned("Build list view", Priority::Medium, 1, &[])]));
    coordinator.run(CancellationToken::new()).await.unwrap();

    let prompt = executor.calls().pop().unwrap();
    assert!(prompt.contains("User API [NEGOTIATING]"));
}

/// Given T1 blocked on a contract that is still being negotiated
/// When another process agrees the contract while the run is idle
/// Then the run waits, resumes T1 and finishes its task
#[tokio::test]
async fn test_paused_worker_resumes_within_the_run() {
    let state = TestState::new();
    let writer: FileStore = state.reopen();
    let mut contracts = ContractManager::new();
    let id = contracts
        .propose("T2", "User API", "api", "GET /users", None)
        .unwrap()
        .id;
    writer.save_contract(contracts.get(id).unwrap()).unwrap();
    writer
        .save_heartbeat(&heartbeat("T1", WorkerStatus::Blocked).with_waiting_for("the User API contract"))
        .unwrap();

    let executor = reporting_executor();
    let mut coordinator = Coordinator::restore(&fast_config(&["T1"]), executor.clone(), state.store.clone())
        .await
        .unwrap();
    coordinator.seed_from_plan(&plan_of(vec![planned("Build list view", Priority::Medium, 1, &[])]));

    tokio::spawn(async move {
        tokio::time::sleep(SHORT).await;
        let mut contracts = ContractManager::restore(writer.load_contracts().unwrap());
        let agreed = contracts
            .respond("T1", id, "agreed", None, RespondAction::Agree)
            .unwrap()
            .unwrap()
            .clone();
        writer.save_contract(&agreed).unwrap();
    });

    let summary = tokio::time::timeout(Duration::from_secs(10), coordinator.run(CancellationToken::new()))
        .await
        .expect("run should finish once the contract is agreed")
        .unwrap();
    assert!(!summary.stalled);
    assert_eq!(summary.completed, 1);
    assert_eq!(executor.call_count(), 1);
    assert!(coordinator.paused().is_empty());
}
