use thiserror::Error;

use crate::core::contract::{ContractId, ContractStatus};
use crate::core::task::{TaskId, TaskStatus};
use crate::orchestration::ExecutorError;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("No home directory")]
    NoHomeDir,

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Contract already exists: {0}")]
    ContractExists(String),

    #[error("Contract {id} is {status} and can no longer change")]
    ContractImmutable { id: ContractId, status: ContractStatus },

    #[error("Cannot {operation} task {id} while it is {status}")]
    InvalidTaskState {
        id: TaskId,
        status: TaskStatus,
        operation: &'static str,
    },

    #[error("Malformed contract document: {0}")]
    Document(String),

    #[error("Executor error: {0}")]
    Executor(#[from] ExecutorError),

    #[error("Operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Task join error: {0}")]
    TaskJoin(String),
}

pub type Result<T> = std::result::Result<T, Error>;
