use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;

use claudiomiro::agent::{
    get_executor, install_signal_handlers, is_shutdown_requested, kill_all_children, run_agent,
    SupervisorOptions,
};
use claudiomiro::config::{default_max_concurrent, Cli};
use claudiomiro::error::OrchestratorError;
use claudiomiro::graph::{self, TASK_EXECUTOR_DIR};
use claudiomiro::log::LogLevel;
use claudiomiro::phase_runner::PhaseRunner;
use claudiomiro::registry::spawn_registry;
use claudiomiro::scheduler::{RebuildFn, Scheduler, SchedulerOptions};
use claudiomiro::types::Task;
use claudiomiro::{git, lock, log, multi_repo};
use claudiomiro::{log_error, log_info, log_warn};

const PENDING_CLARIFICATION_FLAG: &str = "PENDING_CLARIFICATION.flag";
const CLARIFICATION_ANSWERS_FILE: &str = "CLARIFICATION_ANSWERS.json";
const INSIGHTS_DIR: &str = "insights";

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if cli.quiet {
        log::set_log_level(LogLevel::Warn);
    } else if cli.verbose {
        log::set_log_level(LogLevel::Debug);
    }

    if let Err(e) = run(cli).await {
        let message = e.to_string();
        if message.contains("Please provide more details") {
            log_info!("{}", message);
            std::process::exit(0);
        }
        log_error!("Error: {}", message);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), OrchestratorError> {
    if let Err(e) = install_signal_handlers() {
        return Err(OrchestratorError::Other(e));
    }

    let folder = cli.folder.clone();
    if !folder.is_dir() {
        return Err(OrchestratorError::InvalidInput(format!(
            "folder does not exist: {}",
            folder.display()
        )));
    }

    let executor_variant = cli.executor_variant()?;
    let allowed_phases = cli.allowed_phases()?;
    let max_attempts = cli.max_attempts();
    cli.validate_multi_repo_pair()?;

    log_info!("[pre] Acquiring lock...");
    let runtime_dir = folder.join(".claudiomiro");
    let _lock = lock::try_acquire(&runtime_dir).map_err(OrchestratorError::Other)?;

    log_info!("[pre] Checking git preconditions...");
    git::check_preconditions(Some(&folder)).map_err(OrchestratorError::Other)?;

    for (label, path) in [
        ("--legacy-system", &cli.legacy_system),
        ("--legacy-backend", &cli.legacy_backend),
        ("--legacy-frontend", &cli.legacy_frontend),
    ] {
        if let Some(p) = path {
            if !p.exists() {
                return Err(OrchestratorError::InvalidInput(format!(
                    "{} path does not exist: {}",
                    label,
                    p.display()
                )));
            }
        }
    }

    let multi_repo_enabled = if cli.resume {
        match multi_repo::restore_on_continue(&folder) {
            Some(config) => {
                log_info!("Restored multi-repo mode: {:?}", config.mode);
                true
            }
            None => false,
        }
    } else if let (Some(backend), Some(frontend)) = (&cli.backend, &cli.frontend) {
        for (label, path) in [("--backend", backend), ("--frontend", frontend)] {
            if !path.exists() {
                return Err(OrchestratorError::InvalidInput(format!(
                    "{} path does not exist: {}",
                    label,
                    path.display()
                )));
            }
        }
        let detection = git::probe_multi_repo(backend, frontend)
            .map_err(|e| OrchestratorError::InvalidInput(format!("Invalid git configuration: {}", e)))?;
        multi_repo::set_multi_repo(&folder, backend, frontend, &detection)?;
        true
    } else {
        false
    };

    if cli.fresh {
        clean_fresh_state(&folder)?;
    }

    if let Some(phases) = &allowed_phases {
        let mut sorted: Vec<&u8> = phases.iter().collect();
        sorted.sort();
        let csv: Vec<String> = sorted.into_iter().map(|p| p.to_string()).collect();
        log_info!("Running only steps: {}", csv.join(", "));
    }

    let mut graph = graph::load_graph_from_dir(&folder)?;

    if cli.resume {
        restore_pending_clarifications(&folder, &graph);
    }

    if graph.is_empty() {
        log_warn!(
            "No tasks found under {}/{}",
            folder.display(),
            TASK_EXECUTOR_DIR
        );
        return Ok(());
    }

    let (registry, registry_join) = spawn_registry();

    let executor = get_executor(executor_variant);
    let executor: Arc<dyn claudiomiro::agent::Executor> = Arc::from(executor);
    let push = cli.push;

    let phase_runner = Arc::new(PhaseRunner {
        plan: make_phase_fn(
            Arc::clone(&executor),
            folder.clone(),
            PhaseKind::Plan,
            registry.clone(),
        ),
        implement: make_phase_fn(
            Arc::clone(&executor),
            folder.clone(),
            PhaseKind::Implement,
            registry.clone(),
        ),
        review: make_phase_fn(
            Arc::clone(&executor),
            folder.clone(),
            PhaseKind::Review { push },
            registry.clone(),
        ),
        allowed_phases: allowed_phases.clone(),
        max_attempts,
    });

    let options = SchedulerOptions {
        max_concurrent: default_max_concurrent(),
        multi_repo: multi_repo_enabled,
        ..SchedulerOptions::default()
    };

    let mut scheduler = Scheduler::new(std::mem::take(&mut graph), registry, options);

    let allow_global_sweep = allowed_phases
        .as_ref()
        .map(|phases| phases.contains(&claudiomiro::scheduler::PHASE_GLOBAL_SWEEP))
        .unwrap_or(true);

    let cancel = CancellationToken::new();
    let shutdown_cancel = cancel.clone();
    tokio::spawn(async move {
        loop {
            if is_shutdown_requested() {
                shutdown_cancel.cancel();
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        }
    });

    let rebuild_folder = folder.clone();
    let rebuild: RebuildFn = Arc::new(move || {
        let folder = rebuild_folder.clone();
        Box::pin(async move { graph::load_graph_from_dir(&folder) })
    });

    let result = scheduler
        .run(
            phase_runner,
            Some(rebuild),
            None,
            None,
            allow_global_sweep,
            cancel,
        )
        .await;

    kill_all_children();
    drop(scheduler);
    let _ = registry_join.await;

    let summary = result?;

    log_info!("");
    log_info!("--- Run Summary ---");
    log_info!("Completed: {}", summary.completed.join(", "));
    if !summary.failed.is_empty() {
        log_info!("Failed: {}", summary.failed.join(", "));
    }
    if summary.deadlock_attempts > 0 {
        log_info!("Deadlock resolution attempts: {}", summary.deadlock_attempts);
    }

    Ok(())
}

/// `--fresh`: remove the task-executor state directory but preserve
/// `insights/` by copying it aside first and restoring it afterward.
fn clean_fresh_state(folder: &Path) -> Result<(), OrchestratorError> {
    let state_dir = folder.join(TASK_EXECUTOR_DIR);
    if !state_dir.exists() {
        return Ok(());
    }

    let insights_src = state_dir.join(INSIGHTS_DIR);
    let preserved = if insights_src.exists() {
        let tmp = std::env::temp_dir().join(format!(
            "claudiomiro-insights-{}",
            std::process::id()
        ));
        copy_dir_recursive(&insights_src, &tmp)?;
        Some(tmp)
    } else {
        None
    };

    std::fs::remove_dir_all(&state_dir)?;

    if let Some(tmp) = preserved {
        let dest = state_dir.join(INSIGHTS_DIR);
        std::fs::create_dir_all(&state_dir)?;
        copy_dir_recursive(&tmp, &dest)?;
        std::fs::remove_dir_all(&tmp)?;
    }

    Ok(())
}

fn copy_dir_recursive(src: &Path, dest: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dest)?;
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let dest_path = dest.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir_recursive(&entry.path(), &dest_path)?;
        } else {
            std::fs::copy(entry.path(), dest_path)?;
        }
    }
    Ok(())
}

/// `--continue`: a task whose directory carries both the pending-
/// clarification flag and the recorded answers has already been answered —
/// delete the flag so the Phase Runner treats the task as unblocked.
fn restore_pending_clarifications(folder: &Path, graph: &graph::TaskGraph) {
    let _ = folder;
    for task in graph.iter() {
        let flag = task.dir.join(PENDING_CLARIFICATION_FLAG);
        let answers = task.dir.join(CLARIFICATION_ANSWERS_FILE);
        if flag.exists() && answers.exists() {
            if let Err(e) = std::fs::remove_file(&flag) {
                log_warn!(
                    "[{}] failed to clear {}: {}",
                    task.name,
                    PENDING_CLARIFICATION_FLAG,
                    e
                );
            }
        }
    }
}

enum PhaseKind {
    Plan,
    Implement,
    Review { push: bool },
}

impl PhaseKind {
    fn label(&self) -> &'static str {
        match self {
            PhaseKind::Plan => "plan",
            PhaseKind::Implement => "implement",
            PhaseKind::Review { .. } => "review",
        }
    }
}

/// Build the opaque phase function the Phase Runner invokes for one phase:
/// reads the task's prompt source off disk, shells out to the configured
/// executor variant, and (for the review phase, when `push` is set) stages
/// and commits the task's declared files on success.
fn make_phase_fn(
    executor: Arc<dyn claudiomiro::agent::Executor>,
    workspace_root: PathBuf,
    kind: PhaseKind,
    registry: claudiomiro::registry::RegistryHandle,
) -> claudiomiro::phase_runner::PhaseFn {
    Arc::new(move |task: Task, cancel: CancellationToken| {
        let executor = Arc::clone(&executor);
        let workspace_root = workspace_root.clone();
        let registry = registry.clone();
        let label = kind.label();
        let push = matches!(kind, PhaseKind::Review { push: true });
        Box::pin(async move {
            let prompt_text = build_prompt(&task, label)?;
            let log_path = task.dir.join("log.txt");
            let options = SupervisorOptions {
                working_dir: Some(workspace_root.clone()),
                task_name: Some(task.name.clone()),
                ..SupervisorOptions::default()
            };

            if cancel.is_cancelled() {
                return Err(OrchestratorError::Other("cancelled".to_string()));
            }

            run_agent(
                executor.as_ref(),
                &prompt_text,
                options,
                Some(&registry),
                false,
                &log_path,
            )
            .await?;

            if push && label == "review" {
                commit_reviewed_task(&task, &workspace_root);
            }

            Ok(())
        })
    })
}

/// Prompt construction itself is out of scope for this crate; this reads
/// `TASK.md` verbatim as the phase function's only input, matching the
/// "opaque phase function" boundary the Phase Runner delegates to.
fn build_prompt(task: &Task, phase_label: &str) -> Result<String, OrchestratorError> {
    let task_md = task.dir.join("TASK.md");
    let spec = std::fs::read_to_string(&task_md).unwrap_or_default();
    let prompt = format!("[{}] {}\n\n{}", phase_label, task.name, spec);
    if prompt.trim().len() <= 10 {
        return Err(OrchestratorError::InvalidInput(
            "Please provide more details".to_string(),
        ));
    }
    Ok(prompt)
}

fn commit_reviewed_task(task: &Task, workspace_root: &Path) {
    let repo_dir = Some(workspace_root);
    let paths: Vec<PathBuf> = task.files.iter().map(PathBuf::from).collect();
    let path_refs: Vec<&Path> = paths.iter().map(PathBuf::as_path).collect();
    if path_refs.is_empty() {
        return;
    }
    if let Err(e) = git::stage_paths(&path_refs, repo_dir) {
        log_warn!("[{}] failed to stage reviewed files: {}", task.name, e);
        return;
    }
    let message = format!("claudiomiro: complete {}", task.name);
    match git::commit(&message, repo_dir) {
        Ok(sha) => log_info!("[{}] committed {}", task.name, sha),
        Err(e) => log_warn!("[{}] commit failed: {}", task.name, e),
    }
}
