//! Integration test suite for concord.
//!
//! These tests drive the public API the way a coordinator binary would:
//! scheduler, contracts, sync manager and manager intelligence together,
//! persisted through a real store.
//!
//! # Test Categories
//!
//! - `scheduling`: phase gates, quality-gradient readiness, cancellation
//! - `negotiation`: contract state machine and history
//! - `coordination`: heartbeats, sync points and manager interventions
//! - `persistence`: file store and contract documents on disk
//! - `end_to_end`: full coordinator runs against a scripted executor
//!
//! # CI Compatibility
//!
//! Workers are simulated with `MockExecutor`; no agent process is started.

mod fixtures;

mod coordination;
mod end_to_end;
mod negotiation;
mod persistence;
mod scheduling;
