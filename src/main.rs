use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use concord::config::Config;
use concord::core::{ContractId, ContractRole, ContractStatus, Heartbeat, WorkerStatus};
use concord::orchestration::{
    CommandExecutor, ContractManager, Coordinator, ExecutorPlanner, MockExecutor, Plan,
    RespondAction, RunSummary, SyncManager, TaskScheduler, WorkerExecutor,
};
use concord::state::{document, FileStore, Store};
use concord::{clog, Error, Result};

/// concord - coordinate parallel AI-agent workers
#[derive(Parser, Debug)]
#[command(name = "concord")]
#[command(version, about, long_about = None)]
#[command(after_help = "ENVIRONMENT:\n    CONCORD_DEBUG=1     Enable debug logging (alternative to --debug)")]
pub struct Cli {
    /// Enable debug logging (writes to ~/.concord/concord.log)
    #[arg(short = 'd', long, global = true)]
    pub debug: bool,

    /// Config file (default: ~/.concord/concord.toml)
    #[arg(short = 'c', long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Run a coordination session until all work is done
    Run {
        /// JSON plan file ({"summary", "tasks": [...]})
        #[arg(long, conflicts_with = "goal")]
        plan: Option<PathBuf>,

        /// Natural-language goal handed to the planner
        #[arg(long)]
        goal: Option<String>,

        /// Answer every prompt in-process instead of running the executor
        #[arg(long)]
        dry_run: bool,
    },

    /// Publish a worker heartbeat
    Heartbeat {
        worker: String,

        /// working, waiting, blocked or idle
        #[arg(long, default_value = "working")]
        status: String,

        #[arg(long)]
        task: Option<String>,

        #[arg(long, default_value = "")]
        progress: String,

        /// Comma-separated files being edited
        #[arg(long, value_delimiter = ',')]
        files: Vec<String>,

        /// Comma-separated artifacts ready for other workers
        #[arg(long, value_delimiter = ',')]
        artifacts: Vec<String>,

        #[arg(long)]
        waiting_for: Option<String>,
    },

    /// Show tasks, workers and contracts
    Status,

    /// Negotiate interface contracts
    #[command(subcommand)]
    Contract(ContractCommand),
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum ContractCommand {
    /// List contracts
    List {
        #[arg(long)]
        status: Option<String>,

        /// Only contracts this worker proposed, implements or took part in
        #[arg(long)]
        worker: Option<String>,

        /// Only contracts awaiting action
        #[arg(long)]
        pending: bool,
    },

    /// Print a contract document
    Show { contract: String },

    /// Propose a new contract
    Propose {
        #[arg(long)]
        worker: String,
        #[arg(long)]
        name: String,
        #[arg(long = "type", default_value = "api")]
        contract_type: String,
        #[arg(long)]
        content: String,
        /// File holding a code sample
        #[arg(long)]
        code: Option<PathBuf>,
    },

    /// Respond to a contract: response, counter, agree or dispute
    Respond {
        contract: String,
        #[arg(long)]
        worker: String,
        #[arg(long, default_value = "response")]
        action: String,
        #[arg(long, default_value = "")]
        content: String,
        #[arg(long)]
        code: Option<PathBuf>,
    },

    /// Settle a contract as mediator
    Resolve {
        contract: String,
        #[arg(long)]
        worker: String,
        #[arg(long)]
        content: String,
        #[arg(long)]
        code: Option<PathBuf>,
    },

    /// Record an implementation
    Implement {
        contract: String,
        #[arg(long)]
        worker: String,
        #[arg(long)]
        details: String,
        #[arg(long)]
        file: Option<String>,
        #[arg(long)]
        code: Option<PathBuf>,
        #[arg(long, default_value_t = 1.0)]
        quality: f64,
    },

    /// Verify an implementation (or reject it with --rejected)
    Verify {
        contract: String,
        #[arg(long)]
        worker: String,
        #[arg(long)]
        rejected: bool,
        #[arg(long, default_value = "")]
        notes: String,
        #[arg(long)]
        quality: Option<f64>,
    },

    /// Retire a contract
    Deprecate {
        contract: String,
        #[arg(long)]
        reason: String,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    concord::log::init(cli.debug);

    let config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    let store = FileStore::new(config.state_path()?);

    match cli.command {
        Command::Run {
            plan,
            goal,
            dry_run,
        } => run_session(&config, store, plan, goal, dry_run),
        Command::Heartbeat {
            worker,
            status,
            task,
            progress,
            files,
            artifacts,
            waiting_for,
        } => {
            let status: WorkerStatus = status.parse().map_err(Error::Validation)?;
            let mut heartbeat = Heartbeat::new(&worker, status).with_progress(&progress);
            heartbeat.current_task = task;
            heartbeat.files_touched = non_empty(files);
            heartbeat.ready_artifacts = non_empty(artifacts);
            heartbeat.waiting_for = waiting_for;
            store.save_heartbeat(&heartbeat)?;
            println!("{} {} at {}", heartbeat.worker_id, heartbeat.status, heartbeat.timestamp);
            Ok(())
        }
        Command::Status => print_status(&config, &store),
        Command::Contract(command) => run_contract(&store, command),
    }
}

fn non_empty(values: Vec<String>) -> BTreeSet<String> {
    values
        .into_iter()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .collect()
}

fn run_session(
    config: &Config,
    store: FileStore,
    plan: Option<PathBuf>,
    goal: Option<String>,
    dry_run: bool,
) -> Result<()> {
    clog!(
        "Run command: plan={:?}, goal={:?}, dry_run={}",
        plan,
        goal,
        dry_run
    );
    let plan = plan
        .map(|path| -> Result<Plan> {
            let raw = fs::read_to_string(&path)?;
            Ok(Plan::parse_or_fallback(&raw, &path.display().to_string()))
        })
        .transpose()?;

    let rt = tokio::runtime::Runtime::new()?;
    let summary = if dry_run {
        let executor = MockExecutor::new(|prompt| {
            let task = prompt.lines().find(|l| l.starts_with("TASK ")).unwrap_or("task");
            Ok(format!(
                "{{\"summary\": {}, \"success\": true}}",
                serde_json::Value::String(format!("dry run: {}", task))
            ))
        });
        rt.block_on(drive(config, executor, store, plan, goal))?
    } else {
        let executor = CommandExecutor::from_config(&config.executor)?;
        rt.block_on(drive(config, executor, store, plan, goal))?
    };

    println!(
        "Completed {}, failed {}, unfinished {}, interventions {}{}{}",
        summary.completed,
        summary.failed,
        summary.unfinished,
        summary.interventions,
        if summary.stalled { " (stalled)" } else { "" },
        if summary.cancelled { " (cancelled)" } else { "" }
    );
    Ok(())
}

async fn drive<E: WorkerExecutor + Clone>(
    config: &Config,
    executor: E,
    store: FileStore,
    plan: Option<Plan>,
    goal: Option<String>,
) -> Result<RunSummary> {
    let mut coordinator = Coordinator::restore(config, executor.clone(), store).await?;
    if let Some(plan) = &plan {
        coordinator.seed_from_plan(plan);
    }
    if let Some(goal) = &goal {
        let planner = ExecutorPlanner::new(executor, config.executor.timeout());
        coordinator.plan_goal(&planner, goal).await;
    }
    if coordinator.scheduler().is_empty() {
        println!("Nothing to do: pass --plan or --goal");
        return Ok(coordinator.summary());
    }

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            clog!("Interrupted, cancelling session");
            on_signal.cancel();
        }
    });
    coordinator.run(cancel).await
}

fn print_status(config: &Config, store: &FileStore) -> Result<()> {
    let scheduler = TaskScheduler::restore(store.load_tasks()?);
    let contracts = ContractManager::restore(store.load_contracts()?);
    let mut sync = SyncManager::new(config.coordinator.stale_after());
    for heartbeat in store.load_heartbeats()? {
        sync.ingest(heartbeat);
    }

    let flow = scheduler.flow_state();
    println!("State: {}", store.root().display());
    println!(
        "Phase {} | {} tasks | flow {} | quality {:.0}% | {} blocked",
        scheduler.current_phase(),
        scheduler.len(),
        flow.overall_flow,
        flow.quality_average * 100.0,
        flow.blocked_count
    );
    println!();
    println!("Tasks:");
    for task in scheduler.snapshot() {
        println!(
            "  {} [{}] {} ({}, phase {}, {}){}",
            task.id,
            task.status,
            task.title,
            task.priority,
            task.phase,
            task.flow_state,
            task.assigned_to
                .as_deref()
                .map(|w| format!(" -> {}", w))
                .unwrap_or_default()
        );
    }

    println!();
    println!("Workers:");
    let status = sync.check_sync_point(&config.workers);
    for heartbeat in sync.heartbeats().values() {
        let stale = if sync.is_stale(heartbeat) { " (stale)" } else { "" };
        println!(
            "  {} {}{} task={} progress={}",
            heartbeat.worker_id,
            heartbeat.status,
            stale,
            heartbeat.current_task.as_deref().unwrap_or("-"),
            heartbeat.progress
        );
    }
    if !status.missing.is_empty() {
        println!("  no heartbeat: {}", status.missing.join(", "));
    }
    println!("  sync point ready: {}", status.all_ready);
    for line in sync.blocked_summary(&config.workers) {
        println!("  {}", line);
    }
    for conflict in sync.file_conflicts(&config.workers) {
        println!(
            "  conflict: {} edited by {}",
            conflict.path,
            conflict.workers.join(", ")
        );
    }

    println!();
    println!("Contracts:");
    for contract in contracts.all() {
        println!(
            "  {} {} [{}] proposer={} implementer={}",
            contract.id.short(),
            contract.name,
            contract.status,
            contract.proposer,
            contract.implementer.as_deref().unwrap_or("-")
        );
    }
    Ok(())
}

fn read_code(path: Option<&Path>) -> Result<Option<String>> {
    path.map(fs::read_to_string).transpose().map_err(Error::from)
}

fn resolve_id(contracts: &ContractManager, reference: &str) -> Result<ContractId> {
    contracts
        .lookup(reference)
        .map(|c| c.id)
        .ok_or_else(|| Error::Validation(format!("no contract matches '{}'", reference)))
}

fn run_contract(store: &FileStore, command: ContractCommand) -> Result<()> {
    let mut contracts = ContractManager::restore(store.load_contracts()?);

    let changed = match command {
        ContractCommand::List {
            status,
            worker,
            pending,
        } => {
            let status: Option<ContractStatus> =
                status.map(|s| s.parse()).transpose().map_err(Error::Validation)?;
            let listed = if pending {
                contracts.pending(worker.as_deref())
            } else {
                contracts
                    .all()
                    .filter(|c| status.map_or(true, |s| c.status == s))
                    .filter(|c| {
                        worker
                            .as_deref()
                            .map_or(true, |w| c.involves(w, ContractRole::All))
                    })
                    .collect()
            };
            for contract in listed {
                println!(
                    "{} {:<30} {:<12} {}",
                    contract.id.short(),
                    contract.name,
                    contract.status,
                    contract.contract_type
                );
            }
            None
        }
        ContractCommand::Show { contract } => {
            let id = resolve_id(&contracts, &contract)?;
            if let Some(contract) = contracts.get(id) {
                print!("{}", document::render(contract));
            }
            None
        }
        ContractCommand::Propose {
            worker,
            name,
            contract_type,
            content,
            code,
        } => {
            let code = read_code(code.as_deref())?;
            let contract =
                contracts.propose(&worker, &name, &contract_type, &content, code.as_deref())?;
            println!("Proposed {} ({})", contract.name, contract.id);
            Some(contract.id)
        }
        ContractCommand::Respond {
            contract,
            worker,
            action,
            content,
            code,
        } => {
            let id = resolve_id(&contracts, &contract)?;
            let action: RespondAction = action.parse().map_err(Error::Validation)?;
            let code = read_code(code.as_deref())?;
            contracts
                .respond(&worker, id, &content, code.as_deref(), action)?
                .map(|c| c.id)
        }
        ContractCommand::Resolve {
            contract,
            worker,
            content,
            code,
        } => {
            let id = resolve_id(&contracts, &contract)?;
            let code = read_code(code.as_deref())?;
            contracts
                .resolve(&worker, id, &content, code.as_deref())?
                .map(|c| c.id)
        }
        ContractCommand::Implement {
            contract,
            worker,
            details,
            file,
            code,
            quality,
        } => {
            let id = resolve_id(&contracts, &contract)?;
            let code = read_code(code.as_deref())?;
            contracts
                .implement(&worker, id, &details, file.as_deref(), code.as_deref(), quality)?
                .map(|c| c.id)
        }
        ContractCommand::Verify {
            contract,
            worker,
            rejected,
            notes,
            quality,
        } => {
            let id = resolve_id(&contracts, &contract)?;
            contracts
                .verify(&worker, id, !rejected, &notes, quality)?
                .map(|c| c.id)
        }
        ContractCommand::Deprecate { contract, reason } => {
            let id = resolve_id(&contracts, &contract)?;
            contracts.deprecate(id, &reason)?.map(|c| c.id)
        }
    };

    if let Some(contract) = changed.and_then(|id| contracts.get(id)) {
        store.save_contract(contract)?;
        println!("{} is now {}", contract.name, contract.status);
    }
    Ok(())
}
