use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::conflict;
use crate::error::OrchestratorError;
use crate::graph::{self, GraphDiff, TaskGraph};
use crate::phase_runner::PhaseRunner;
use crate::registry::RegistryHandle;
use crate::types::{DeadlockReport, Scope, Task, TaskStatus, UnsatisfiedDependency};
use crate::{log_debug, log_info, log_warn};

/// The global bug sweep, the final phase run once across all tasks.
/// Subject to `--steps` filtering uniformly with phases 4-6.
pub const PHASE_GLOBAL_SWEEP: u8 = 7;

/// Bounded AI-assisted deadlock resolution attempts.
const MAX_DEADLOCK_ATTEMPTS: u32 = 3;

/// A pure, on-demand graph reload — the Scheduler calls this once per main
/// loop iteration and diffs the result against its in-memory graph. Returning
/// the same graph every call is a valid no-op rebuild function for tests.
pub type RebuildFn = Arc<
    dyn Fn() -> Pin<Box<dyn Future<Output = Result<TaskGraph, OrchestratorError>> + Send>>
        + Send
        + Sync,
>;

/// The opaque AI-assisted deadlock resolver: given the diagnostic bundle, it
/// may edit `TASK.md` files on disk to break a cycle. Its own reasoning is
/// out of scope for this crate.
pub type DeadlockResolverFn = Arc<
    dyn Fn(DeadlockReport) -> Pin<Box<dyn Future<Output = Result<(), OrchestratorError>> + Send>>
        + Send
        + Sync,
>;

/// The final global bug sweep phase, run once over every task that reached
/// the loop's terminal state.
pub type GlobalSweepFn = Arc<
    dyn Fn(Vec<Task>, CancellationToken) -> Pin<Box<dyn Future<Output = Result<(), OrchestratorError>> + Send>>
        + Send
        + Sync,
>;

/// Tunable poll cadence, broken out into its own struct so tests can shrink
/// it instead of sleeping real wall-clock seconds.
#[derive(Debug, Clone, Copy)]
pub struct SchedulerTiming {
    /// Pause between admission passes while at least one task is running (~500ms).
    pub running_poll: Duration,
    /// Pause between admission passes while idle and not yet stalled (~1s).
    pub idle_poll: Duration,
    /// Consecutive idle polls before engaging deadlock handling (5, ≈5s).
    pub stall_threshold: u32,
    /// Minimum gap between throttled pending-task snapshot logs (~10s).
    pub snapshot_log_interval: Duration,
}

impl Default for SchedulerTiming {
    fn default() -> Self {
        Self {
            running_poll: Duration::from_millis(500),
            idle_poll: Duration::from_secs(1),
            stall_threshold: 5,
            snapshot_log_interval: Duration::from_secs(10),
        }
    }
}

/// Construction parameters: concurrency cap, scope-aware admission mode,
/// and poll cadence.
pub struct SchedulerOptions {
    pub max_concurrent: u32,
    /// Whether per-scope admission caps apply in addition to the global cap
    /// (multi-repo mode). In single-repo mode only the global cap is
    /// enforced, regardless of what scope a task happens to carry.
    pub multi_repo: bool,
    pub timing: SchedulerTiming,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            max_concurrent: 4,
            multi_repo: false,
            timing: SchedulerTiming::default(),
        }
    }
}

#[derive(Debug, Default)]
pub struct SchedulerSummary {
    pub completed: Vec<String>,
    pub failed: Vec<String>,
    pub deadlock_attempts: u32,
}

/// The DAG Executor: owns the in-memory graph, the running set, and the
/// per-scope counters, and is the single mutation point for all three.
/// Phase Runners signal completion, they never touch scheduler state
/// directly.
pub struct Scheduler {
    graph: TaskGraph,
    running: HashSet<String>,
    scope_counters: HashMap<Scope, u32>,
    options: SchedulerOptions,
    registry: RegistryHandle,
    file_conflicts_resolved: bool,
}

impl Scheduler {
    pub fn new(graph: TaskGraph, registry: RegistryHandle, options: SchedulerOptions) -> Self {
        Self {
            graph,
            running: HashSet::new(),
            scope_counters: HashMap::new(),
            options,
            registry,
            file_conflicts_resolved: false,
        }
    }

    pub fn graph(&self) -> &TaskGraph {
        &self.graph
    }

    /// `ready = pending tasks whose deps are all completed`, enumerated in
    /// graph-insertion order so admission is deterministic.
    pub fn ready_tasks(&self) -> Vec<String> {
        self.graph
            .iter()
            .filter(|t| t.status == TaskStatus::Pending && self.deps_satisfied(t))
            .map(|t| t.name.clone())
            .collect()
    }

    fn deps_satisfied(&self, task: &Task) -> bool {
        task.deps.iter().all(|dep| {
            self.graph
                .get(dep)
                .is_some_and(|d| d.status == TaskStatus::Completed)
        })
    }

    /// The layered admission gate.
    pub fn can_execute(&self, name: &str) -> bool {
        let Some(task) = self.graph.get(name) else {
            return false;
        };
        if task.status != TaskStatus::Pending || !self.deps_satisfied(task) {
            return false;
        }

        if self.running.len() as u32 >= self.options.max_concurrent {
            return false;
        }

        if self.options.multi_repo && task.scope != Scope::Integration {
            let scope_running = *self.scope_counters.get(&task.scope).unwrap_or(&0);
            if scope_running >= self.options.max_concurrent {
                return false;
            }
        }

        true
    }

    /// Admit `name`: flips its status, adds it to the running set, and bumps
    /// its scope counter, atomically with respect to the next `can_execute`
    /// query.
    fn mark_running(&mut self, name: &str) {
        let Some(task) = self.graph.get_mut(name) else {
            return;
        };
        task.status = TaskStatus::Running;
        let scope = task.scope;
        self.running.insert(name.to_string());
        *self.scope_counters.entry(scope).or_insert(0) += 1;
    }

    /// Retire `name` with its final status, decrementing both the running
    /// set and its scope counter (saturating at 0).
    fn mark_complete(&mut self, name: &str, status: TaskStatus) {
        let Some(task) = self.graph.get_mut(name) else {
            return;
        };
        let scope = task.scope;
        task.status = status;
        self.running.remove(name);
        if let Some(counter) = self.scope_counters.get_mut(&scope) {
            *counter = counter.saturating_sub(1);
        }
    }

    fn build_deadlock_report(&self, attempt: u32) -> DeadlockReport {
        let mut pending = Vec::new();
        for task in self.graph.iter() {
            if task.status != TaskStatus::Pending {
                continue;
            }
            let unsatisfied: Vec<UnsatisfiedDependency> = task
                .deps
                .iter()
                .filter_map(|dep| match self.graph.get(dep) {
                    None => Some(UnsatisfiedDependency {
                        dep_name: dep.clone(),
                        exists: false,
                        status: None,
                    }),
                    Some(d) if d.status != TaskStatus::Completed => Some(UnsatisfiedDependency {
                        dep_name: dep.clone(),
                        exists: true,
                        status: Some(d.status),
                    }),
                    _ => None,
                })
                .collect();
            if !unsatisfied.is_empty() {
                pending.push((task.name.clone(), unsatisfied));
            }
        }
        DeadlockReport { pending, attempt }
    }

    fn log_pending_snapshot(&self) {
        let waiting: Vec<String> = self
            .graph
            .iter()
            .filter(|t| t.status == TaskStatus::Pending)
            .map(|t| {
                let unmet: Vec<&str> = t
                    .deps
                    .iter()
                    .filter(|d| {
                        self.graph
                            .get(d.as_str())
                            .map(|dt| dt.status != TaskStatus::Completed)
                            .unwrap_or(true)
                    })
                    .map(String::as_str)
                    .collect();
                if unmet.is_empty() {
                    t.name.clone()
                } else {
                    format!("{} (waiting on {})", t.name, unmet.join(", "))
                }
            })
            .collect();
        if !waiting.is_empty() {
            log_info!("[scheduler] pending: {}", waiting.join("; "));
        }
    }

    async fn apply_graph_diff(&mut self, diff: GraphDiff) {
        for name in &diff.added {
            self.registry.ensure_entry(name).await;
        }
        for name in &diff.promoted {
            let _ = self.registry.update_status(name, "completed").await;
        }
    }

    /// Seed the Registry with the current graph's task names, mirroring
    /// already-`completed` status from a restored graph so a restart of an
    /// all-approved directory reports every task done without an intervening
    /// `running` flicker.
    async fn seed_registry(&self) {
        let names: Vec<String> = self.graph.names().map(str::to_string).collect();
        self.registry.initialize(names).await;
        for task in self.graph.iter() {
            if task.status == TaskStatus::Completed {
                let _ = self.registry.update_status(&task.name, "completed").await;
            }
        }
    }

    /// Run the main loop to completion: admit ready tasks under the
    /// scope-aware cap, drive each through `phase_runner`, rebuild the graph
    /// between waves, and escalate to deadlock resolution on stall. After the
    /// loop drains, runs the final global sweep if no task failed.
    pub async fn run(
        &mut self,
        phase_runner: Arc<PhaseRunner>,
        rebuild_fn: Option<RebuildFn>,
        deadlock_resolver: Option<DeadlockResolverFn>,
        global_sweep: Option<GlobalSweepFn>,
        allow_global_sweep: bool,
        cancel: CancellationToken,
    ) -> Result<SchedulerSummary, OrchestratorError> {
        self.seed_registry().await;

        let mut summary = SchedulerSummary::default();
        let mut join_set: JoinSet<(Task, Result<(), OrchestratorError>)> = JoinSet::new();
        let mut stall_count: u32 = 0;
        let mut deadlock_attempts: u32 = 0;
        let mut last_snapshot_log = Instant::now()
            .checked_sub(self.options.timing.snapshot_log_interval)
            .unwrap_or_else(Instant::now);

        loop {
            if cancel.is_cancelled() {
                self.drain(&mut join_set, &mut summary).await;
                return Ok(summary);
            }

            if let Some(rebuild) = &rebuild_fn {
                let incoming = rebuild().await?;
                let diff = graph::merge_graph(&mut self.graph, incoming);
                self.apply_graph_diff(diff).await;
            }

            if !self.file_conflicts_resolved {
                conflict::resolve_file_conflicts(&mut self.graph);
                self.file_conflicts_resolved = true;
            }

            let ready = self.ready_tasks();
            for name in ready {
                if !self.can_execute(&name) {
                    continue;
                }
                self.mark_running(&name);
                let _ = self.registry.update_status(&name, "running").await;
                stall_count = 0;

                let task = self
                    .graph
                    .get(&name)
                    .expect("just admitted task must exist")
                    .clone();
                let runner = Arc::clone(&phase_runner);
                let child_cancel = cancel.clone();
                log_info!("[scheduler] admitting '{}' (scope={})", task.name, task.scope);
                join_set.spawn(async move {
                    let mut task = task;
                    let result = runner.run_task(&mut task, &child_cancel).await;
                    (task, result)
                });
            }

            if !self.running.is_empty() {
                tokio::select! {
                    Some(joined) = join_set.join_next() => {
                        self.handle_completion(joined, &mut summary).await;
                    }
                    _ = tokio::time::sleep(self.options.timing.running_poll) => {}
                }
                continue;
            }

            if self.graph.all_terminal_and_idle(&self.running) {
                break;
            }

            if self.ready_tasks().is_empty() {
                stall_count += 1;
                if stall_count >= self.options.timing.stall_threshold {
                    deadlock_attempts += 1;
                    if deadlock_attempts > MAX_DEADLOCK_ATTEMPTS {
                        summary.deadlock_attempts = deadlock_attempts - 1;
                        return Err(OrchestratorError::DeadlockUnresolvable {
                            attempts: MAX_DEADLOCK_ATTEMPTS,
                        });
                    }
                    let report = self.build_deadlock_report(deadlock_attempts);
                    log_warn!(
                        "[scheduler] deadlock detected (attempt {}/{}): {} task(s) blocked",
                        deadlock_attempts,
                        MAX_DEADLOCK_ATTEMPTS,
                        report.pending.len()
                    );
                    if let Some(resolver) = &deadlock_resolver {
                        resolver(report).await?;
                    }
                    stall_count = 0;
                } else {
                    if last_snapshot_log.elapsed() >= self.options.timing.snapshot_log_interval {
                        self.log_pending_snapshot();
                        last_snapshot_log = Instant::now();
                    }
                    tokio::time::sleep(self.options.timing.idle_poll).await;
                }
            } else {
                stall_count = 0;
            }
        }

        summary.deadlock_attempts = deadlock_attempts;

        if summary.failed.is_empty() && allow_global_sweep {
            if let Some(sweep) = global_sweep {
                let all_tasks: Vec<Task> = self.graph.iter().cloned().collect();
                log_debug!(
                    "[scheduler] running global bug sweep over {} task(s)",
                    all_tasks.len()
                );
                sweep(all_tasks, cancel).await?;
            }
        }

        Ok(summary)
    }

    async fn handle_completion(
        &mut self,
        joined: Result<(Task, Result<(), OrchestratorError>), tokio::task::JoinError>,
        summary: &mut SchedulerSummary,
    ) {
        let (task, result) = match joined {
            Ok(pair) => pair,
            Err(join_err) => {
                log_warn!("[scheduler] phase runner task panicked: {}", join_err);
                return;
            }
        };

        self.mark_complete(&task.name, task.status);
        let _ = self
            .registry
            .update_status(&task.name, &task.status.to_string())
            .await;

        match (task.status, result) {
            (TaskStatus::Completed, _) => summary.completed.push(task.name),
            (TaskStatus::Failed, Err(e)) => {
                log_warn!("[scheduler] task '{}' failed: {}", task.name, e);
                summary.failed.push(task.name);
            }
            (TaskStatus::Failed, Ok(())) => summary.failed.push(task.name),
            (_, _) => {}
        }
    }

    /// Await all in-flight Phase Runners before returning — shutdown on
    /// failure joins every Phase Runner rather than abandoning them.
    async fn drain(
        &mut self,
        join_set: &mut JoinSet<(Task, Result<(), OrchestratorError>)>,
        summary: &mut SchedulerSummary,
    ) {
        while let Some(joined) = join_set.join_next().await {
            self.handle_completion(joined, summary).await;
        }
    }
}
