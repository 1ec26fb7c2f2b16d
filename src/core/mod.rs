//! Core domain models for the coordination engine.
//!
//! Plain data: tasks, heartbeats, contracts and manager actions. Behavior
//! that spans records lives in `orchestration`.

pub mod action;
pub mod contract;
pub mod heartbeat;
pub mod task;

pub use action::{ActionKind, ManagerAction};
pub use contract::{
    Contract, ContractId, ContractRole, ContractStatus, NegotiationAction, NegotiationEntry,
};
pub use heartbeat::{Heartbeat, WorkerId, WorkerStatus};
pub use task::{FlowState, Priority, Task, TaskId, TaskStatus};
