//! Scheduler integration tests: phase gates, quality-gradient readiness,
//! cancellation and retries.

use std::collections::HashSet;

use concord::core::{FlowState, Priority, Task, TaskId, TaskStatus};
use concord::orchestration::TaskScheduler;
use concord::Error;
use tokio_test::{assert_err, assert_ok};

fn two_phase() -> (TaskScheduler, TaskId, TaskId) {
    let mut scheduler = TaskScheduler::new();
    let design = scheduler
        .add_task("Design API", "Draft endpoints", Priority::High, vec![], 1, None)
        .id;
    let client = scheduler
        .add_task(
            "Build client",
            "Consume the API",
            Priority::Medium,
            vec!["Design API".to_string()],
            2,
            None,
        )
        .id;
    (scheduler, design, client)
}

/// Given "Design API" in progress at quality 0.85
/// When another worker asks for work in phase 2
/// Then it receives "Build client" even though its dependency is not completed
#[test]
fn test_quality_gradient_unblocks_dependents() {
    let (mut scheduler, design, client) = two_phase();

    assert!(scheduler.assign(design, "T1").is_some());
    assert!(scheduler.update_quality(design, 0.85).is_some());
    assert_eq!(scheduler.get(design).unwrap().status, TaskStatus::InProgress);

    let next = scheduler.next_task_for("T2", 2).expect("a ready task");
    assert_eq!(next.id, client);
    assert_eq!(next.title, "Build client");
}

#[test]
fn test_dependent_waits_below_substantial_quality() {
    let (mut scheduler, design, _) = two_phase();
    scheduler.assign(design, "T1");
    scheduler.update_quality(design, 0.5);
    assert!(scheduler.next_task_for("T2", 2).is_none());
}

#[test]
fn test_phase_two_waits_for_current_phase() {
    let (mut scheduler, design, client) = two_phase();
    scheduler.assign(design, "T1");
    scheduler.complete(design, "done", true, None);

    // Dependency met, but the engine is asked about phase 1.
    assert!(scheduler.next_task_for("T2", 1).is_none());
    assert_eq!(scheduler.current_phase(), 2);
    assert_eq!(scheduler.next_task_for("T2", 2).map(|t| t.id), Some(client));
}

#[test]
fn test_phase_one_is_always_ready() {
    let task = Task::new(TaskId(9), "Anything", "").with_dependencies(["never-done"]);
    for phase in 0..4 {
        assert!(task.is_ready(&HashSet::new(), phase));
    }
}

#[test]
fn test_quality_is_clamped_and_only_for_active_work() {
    let (mut scheduler, design, client) = two_phase();

    // Pending work has no quality yet.
    assert!(scheduler.update_quality(client, 0.4).is_none());
    assert_eq!(scheduler.get(client).unwrap().quality_level, 0.0);

    scheduler.assign(design, "T1");
    for level in [-3.0, 0.3, 7.5, f64::NAN] {
        let quality = scheduler.update_quality(design, level).unwrap().quality_level;
        assert!((0.0..=1.0).contains(&quality), "{} escaped [0, 1]", quality);
    }

    scheduler.update_quality(design, 0.9);
    scheduler.complete(design, "done", true, None);
    assert!(scheduler.update_quality(design, 0.1).is_none());
    assert_eq!(scheduler.get(design).unwrap().quality_level, 0.9);
}

#[test]
fn test_cancel_only_removes_pending_work() {
    let (mut scheduler, design, client) = two_phase();
    scheduler.assign(design, "T1");

    let err = assert_err!(scheduler.cancel(design));
    assert!(matches!(err, Error::InvalidTaskState { .. }));
    assert!(scheduler.get(design).is_some());

    let removed = assert_ok!(scheduler.cancel(client));
    assert_eq!(removed.map(|t| t.id), Some(client));
    assert!(scheduler.get(client).is_none());

    assert!(assert_ok!(scheduler.cancel(TaskId(999))).is_none());

    scheduler.complete(design, "done", true, None);
    assert_err!(scheduler.cancel(design));
}

#[test]
fn test_blocked_and_stalled_flow() {
    let (mut scheduler, design, client) = two_phase();
    scheduler.assign(design, "T1");
    scheduler.mark_blocked(design, "waiting on schema");
    assert_eq!(scheduler.get(design).unwrap().flow_state, FlowState::Blocked);
    assert_eq!(scheduler.flow_state().blocked_count, 1);

    scheduler.unblock(design);
    scheduler.mark_stalled(design);
    assert_eq!(scheduler.get(design).unwrap().flow_state, FlowState::Stalled);

    scheduler.update_quality(design, 0.95);
    assert_eq!(scheduler.get(design).unwrap().flow_state, FlowState::Converging);

    // Blocked pending work is skipped by dispatch.
    scheduler.complete(design, "done", true, None);
    scheduler.mark_blocked(client, "needs review");
    assert!(scheduler.next_task_for("T2", 2).is_none());
}

#[test]
fn test_failed_task_requeue_and_cycles() {
    let mut scheduler = TaskScheduler::new();
    let a = scheduler
        .add_task("A", "", Priority::Medium, vec!["B".to_string()], 2, None)
        .id;
    let b = scheduler
        .add_task("B", "", Priority::Medium, vec!["A".to_string()], 2, None)
        .id;
    assert_eq!(scheduler.dependency_cycles(), vec![vec![a, b]]);

    let c = scheduler.add_task("C", "", Priority::Low, vec![], 1, None).id;
    scheduler.assign(c, "T1");
    scheduler.complete(c, "", false, Some("boom"));
    assert_eq!(scheduler.get(c).unwrap().status, TaskStatus::Failed);
    assert_eq!(scheduler.requeue(c).map(|t| t.status), Some(TaskStatus::Pending));
    assert_eq!(scheduler.next_task_for("T1", 1).map(|t| t.id), Some(c));
}
