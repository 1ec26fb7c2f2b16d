//! Coordination layer.
//!
//! The four core components are plain owned values with no shared state:
//! [`TaskScheduler`], [`SyncManager`], [`ContractManager`] and
//! [`ManagerIntelligence`]. The [`Coordinator`] owns one of each and drives
//! them from a single control loop, handing prompts to a [`WorkerExecutor`].

mod contracts;
mod coordinator;
mod executor;
mod manager;
mod report;
mod scheduler;
mod sync;

pub use contracts::{ContractManager, RespondAction, SYSTEM_WORKER};
pub use coordinator::{
    Coordinator, CoordinatorEvent, CoordinatorSettings, Dispatch, RetryTracker, RunSummary,
};
pub use executor::{
    is_rate_limited, parse_agent_output, CommandExecutor, ExecutorError, MockExecutor,
    WorkerExecutor,
};
pub use manager::{route_role, ManagerIntelligence, ManagerSettings, Observation};
pub use report::{
    extract_json_object, ExecutorPlanner, JsonReportParser, Plan, PlannedTask, Planner,
    ReportParser, WorkerReport,
};
pub use scheduler::{FlowSummary, TaskScheduler};
pub use sync::{
    group_file_conflicts, is_stale, is_stale_at, FileConflict, SyncManager, SyncPointStatus,
    DEFAULT_STALE_AFTER,
};
