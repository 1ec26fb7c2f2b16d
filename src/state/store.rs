use crate::core::{Contract, ContractId, Heartbeat, Task};
use crate::state::document;
use crate::{clog_debug, clog_warn};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

const TASKS_FILE: &str = "tasks.json";
const CONTRACTS_DIR: &str = "contracts";
const HEARTBEATS_DIR: &str = "heartbeats";
const TASKS_VERSION: u32 = 1;

/// Persistence for the coordinator's collections.
///
/// Methods are synchronous; async callers go through [`crate::util::blocking`].
pub trait Store: Send + Sync + 'static {
    fn load_tasks(&self) -> Result<Vec<Task>>;
    fn save_tasks(&self, tasks: &[Task]) -> Result<()>;

    fn load_contracts(&self) -> Result<Vec<Contract>>;
    fn save_contract(&self, contract: &Contract) -> Result<()>;
    /// Returns whether anything was removed.
    fn delete_contract(&self, id: ContractId) -> Result<bool>;

    fn load_heartbeats(&self) -> Result<Vec<Heartbeat>>;
    /// One record per worker, overwritten in place.
    fn save_heartbeat(&self, heartbeat: &Heartbeat) -> Result<()>;
}

#[derive(Serialize, Deserialize)]
struct TaskFile {
    version: u32,
    tasks: Vec<Task>,
}

/// Flat-file store rooted at a state directory:
///
/// - `tasks.json`
/// - `contracts/<id>.md`
/// - `heartbeats/<worker>.json`
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn tasks_path(&self) -> PathBuf {
        self.root.join(TASKS_FILE)
    }

    pub fn contract_path(&self, id: ContractId) -> PathBuf {
        self.root.join(CONTRACTS_DIR).join(format!("{}.md", id))
    }

    pub fn heartbeat_path(&self, worker_id: &str) -> Result<PathBuf> {
        let valid = !worker_id.is_empty()
            && worker_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
            && !worker_id.starts_with('.');
        if !valid {
            return Err(Error::Validation(format!(
                "worker id '{}' cannot be used as a file name",
                worker_id
            )));
        }
        Ok(self
            .root
            .join(HEARTBEATS_DIR)
            .join(format!("{}.json", worker_id)))
    }

    /// Write through a temp file and rename so readers never see a partial file.
    fn write_atomic(path: &Path, contents: &str, backup: bool) -> Result<()> {
        if let Some(dir) = path.parent() {
            if !dir.exists() {
                clog_debug!("Creating state directory: {}", dir.display());
                fs::create_dir_all(dir)?;
            }
        }
        if backup && path.exists() {
            let backup_path = path.with_extension("json.bak");
            clog_debug!("Creating backup: {}", backup_path.display());
            fs::copy(path, &backup_path)?;
        }
        let extension = path
            .extension()
            .map(|e| format!("{}.tmp", e.to_string_lossy()))
            .unwrap_or_else(|| "tmp".to_string());
        let temp_path = path.with_extension(extension);
        fs::write(&temp_path, contents)?;
        fs::rename(&temp_path, path)?;
        Ok(())
    }

    /// Files in `dir` with the given extension, sorted. A missing dir is empty.
    fn list(dir: &Path, extension: &str) -> Result<Vec<PathBuf>> {
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut paths = Vec::new();
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            if path.extension().is_some_and(|e| e == extension) {
                paths.push(path);
            }
        }
        paths.sort();
        Ok(paths)
    }
}

impl Store for FileStore {
    fn load_tasks(&self) -> Result<Vec<Task>> {
        let path = self.tasks_path();
        clog_debug!("FileStore::load_tasks path={}", path.display());
        if !path.exists() {
            clog_debug!("Task file not found, starting empty");
            return Ok(Vec::new());
        }
        let contents = fs::read_to_string(&path)?;
        let file: TaskFile = serde_json::from_str(&contents)?;
        if file.version != TASKS_VERSION {
            clog_warn!(
                "Task file version {} differs from {}, loading anyway",
                file.version,
                TASKS_VERSION
            );
        }
        clog_debug!("Loaded {} tasks", file.tasks.len());
        Ok(file.tasks)
    }

    fn save_tasks(&self, tasks: &[Task]) -> Result<()> {
        let file = TaskFile {
            version: TASKS_VERSION,
            tasks: tasks.to_vec(),
        };
        let contents = serde_json::to_string_pretty(&file)?;
        let path = self.tasks_path();
        Self::write_atomic(&path, &contents, true)?;
        clog_debug!("Saved {} tasks: {}", tasks.len(), path.display());
        Ok(())
    }

    fn load_contracts(&self) -> Result<Vec<Contract>> {
        let mut contracts = Vec::new();
        for path in Self::list(&self.root.join(CONTRACTS_DIR), "md")? {
            let parsed = fs::read_to_string(&path)
                .map_err(Error::from)
                .and_then(|text| document::parse(&text));
            match parsed {
                Ok(contract) => contracts.push(contract),
                Err(e) => clog_warn!("Skipping contract {}: {}", path.display(), e),
            }
        }
        clog_debug!("Loaded {} contracts", contracts.len());
        Ok(contracts)
    }

    fn save_contract(&self, contract: &Contract) -> Result<()> {
        let path = self.contract_path(contract.id);
        Self::write_atomic(&path, &document::render(contract), false)?;
        clog_debug!(
            "Saved contract '{}' [{}]: {}",
            contract.name,
            contract.status,
            path.display()
        );
        Ok(())
    }

    fn delete_contract(&self, id: ContractId) -> Result<bool> {
        let path = self.contract_path(id);
        if !path.exists() {
            return Ok(false);
        }
        fs::remove_file(&path)?;
        clog_debug!("Deleted contract file {}", path.display());
        Ok(true)
    }

    fn load_heartbeats(&self) -> Result<Vec<Heartbeat>> {
        let mut heartbeats = Vec::new();
        for path in Self::list(&self.root.join(HEARTBEATS_DIR), "json")? {
            let parsed = fs::read_to_string(&path)
                .map_err(Error::from)
                .and_then(|text| serde_json::from_str::<Heartbeat>(&text).map_err(Error::from));
            match parsed {
                Ok(heartbeat) => heartbeats.push(heartbeat),
                Err(e) => clog_warn!("Skipping heartbeat {}: {}", path.display(), e),
            }
        }
        Ok(heartbeats)
    }

    fn save_heartbeat(&self, heartbeat: &Heartbeat) -> Result<()> {
        let path = self.heartbeat_path(&heartbeat.worker_id)?;
        let contents = serde_json::to_string_pretty(heartbeat)?;
        Self::write_atomic(&path, &contents, false)?;
        clog_debug!(
            "Heartbeat {} [{}] written",
            heartbeat.worker_id,
            heartbeat.status
        );
        Ok(())
    }
}

#[derive(Debug, Default)]
struct Memory {
    tasks: Vec<Task>,
    contracts: BTreeMap<ContractId, Contract>,
    heartbeats: BTreeMap<String, Heartbeat>,
}

/// In-process store, used by tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Memory>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Memory> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Store for MemoryStore {
    fn load_tasks(&self) -> Result<Vec<Task>> {
        Ok(self.lock().tasks.clone())
    }

    fn save_tasks(&self, tasks: &[Task]) -> Result<()> {
        self.lock().tasks = tasks.to_vec();
        Ok(())
    }

    fn load_contracts(&self) -> Result<Vec<Contract>> {
        Ok(self.lock().contracts.values().cloned().collect())
    }

    fn save_contract(&self, contract: &Contract) -> Result<()> {
        self.lock().contracts.insert(contract.id, contract.clone());
        Ok(())
    }

    fn delete_contract(&self, id: ContractId) -> Result<bool> {
        Ok(self.lock().contracts.remove(&id).is_some())
    }

    fn load_heartbeats(&self) -> Result<Vec<Heartbeat>> {
        Ok(self.lock().heartbeats.values().cloned().collect())
    }

    fn save_heartbeat(&self, heartbeat: &Heartbeat) -> Result<()> {
        self.lock()
            .heartbeats
            .insert(heartbeat.worker_id.clone(), heartbeat.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Priority, TaskId, WorkerStatus};
    use crate::orchestration::{ContractManager, RespondAction};
    use tempfile::TempDir;

    fn sample_tasks() -> Vec<Task> {
        vec![
            Task::new(TaskId(1), "Design API", "endpoints").with_priority(Priority::High),
            Task::new(TaskId(2), "Build client", "uses the API")
                .with_phase(2)
                .with_dependencies(["Design API"]),
        ]
    }

    #[test]
    fn test_file_store_tasks_roundtrip() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::new(dir.path().join("state"));
        assert!(store.load_tasks().unwrap().is_empty());

        let tasks = sample_tasks();
        store.save_tasks(&tasks).unwrap();
        assert_eq!(store.load_tasks().unwrap(), tasks);

        // Second save leaves a backup and no temp file behind.
        store.save_tasks(&tasks[..1]).unwrap();
        assert!(store.tasks_path().with_extension("json.bak").exists());
        assert!(!store.tasks_path().with_extension("json.tmp").exists());
        assert_eq!(store.load_tasks().unwrap().len(), 1);
    }

    #[test]
    fn test_file_store_contracts() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::new(dir.path());
        let mut manager = ContractManager::new();
        let id = manager.propose("T2", "User API", "api", "GET /users", None).unwrap().id;
        manager.respond("T1", id, "fine", None, RespondAction::Agree).unwrap();
        let contract = manager.get(id).unwrap().clone();

        store.save_contract(&contract).unwrap();
        let text = fs::read_to_string(store.contract_path(id)).unwrap();
        assert!(text.starts_with("# Contract: User API"));
        assert_eq!(store.load_contracts().unwrap(), vec![contract]);

        assert!(store.delete_contract(id).unwrap());
        assert!(!store.delete_contract(id).unwrap());
        assert!(store.load_contracts().unwrap().is_empty());
    }

    #[test]
    fn test_file_store_skips_corrupt_contract() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::new(dir.path());
        fs::create_dir_all(dir.path().join(CONTRACTS_DIR)).unwrap();
        fs::write(dir.path().join(CONTRACTS_DIR).join("junk.md"), "not a contract").unwrap();
        assert!(store.load_contracts().unwrap().is_empty());
    }

    #[test]
    fn test_file_store_heartbeats_overwrite_in_place() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::new(dir.path());
        store
            .save_heartbeat(&Heartbeat::new("T1", WorkerStatus::Working))
            .unwrap();
        store
            .save_heartbeat(&Heartbeat::new("T1", WorkerStatus::Idle))
            .unwrap();
        store
            .save_heartbeat(&Heartbeat::new("T2", WorkerStatus::Waiting))
            .unwrap();
        fs::write(dir.path().join(HEARTBEATS_DIR).join("T9.json"), "{broken").unwrap();

        let heartbeats = store.load_heartbeats().unwrap();
        assert_eq!(heartbeats.len(), 2);
        assert_eq!(heartbeats[0].worker_id, "T1");
        assert_eq!(heartbeats[0].status, WorkerStatus::Idle);
    }

    #[test]
    fn test_heartbeat_path_rejects_traversal() {
        let store = FileStore::new("/tmp/state");
        assert!(store.heartbeat_path("../etc").is_err());
        assert!(store.heartbeat_path("").is_err());
        assert!(store.heartbeat_path("T1").is_ok());
    }

    #[test]
    fn test_memory_store() {
        let store = MemoryStore::new();
        store.save_tasks(&sample_tasks()).unwrap();
        assert_eq!(store.load_tasks().unwrap().len(), 2);

        store
            .save_heartbeat(&Heartbeat::new("T3", WorkerStatus::Blocked))
            .unwrap();
        store
            .save_heartbeat(&Heartbeat::new("T3", WorkerStatus::Working))
            .unwrap();
        let heartbeats = store.load_heartbeats().unwrap();
        assert_eq!(heartbeats.len(), 1);
        assert_eq!(heartbeats[0].status, WorkerStatus::Working);
        assert!(!store.delete_contract(ContractId::new()).unwrap());
    }
}
