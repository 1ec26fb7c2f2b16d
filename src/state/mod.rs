//! Persistence for coordination state.
//!
//! The coordinator only talks to the [`Store`] trait. [`FileStore`] keeps
//! tasks, contract documents and heartbeats as flat files under a state
//! directory; [`MemoryStore`] keeps them in process.

pub mod document;
mod store;

pub use store::{FileStore, MemoryStore, Store};
