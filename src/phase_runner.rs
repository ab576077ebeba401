use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::error::OrchestratorError;
use crate::graph::{has_approved_code_review, is_implemented, repair_todo_rename};
use crate::types::{Task, TaskStatus};
use crate::{log_info, log_warn};

const DEFAULT_MAX_ATTEMPTS: u32 = 20;
const IMPLEMENT_RETRY_BACKOFF: Duration = Duration::from_secs(1);

/// An injected phase function — the "opaque phase function" boundary. The
/// Runner never generates prompts or interprets AI output itself beyond the
/// `is_implemented`/`has_approved_code_review` predicates; everything else
/// is delegated here.
pub type PhaseFn = Arc<
    dyn Fn(Task, CancellationToken) -> Pin<Box<dyn Future<Output = Result<(), OrchestratorError>> + Send>>
        + Send
        + Sync,
>;

/// Phase numbers as named in the `--steps` surface: 4 (plan), 5 (implement),
/// 6 (review). Phase 7 (the global sweep) is driven by the Scheduler, not
/// the per-task Runner.
pub const PHASE_PLAN: u8 = 4;
pub const PHASE_IMPLEMENT: u8 = 5;
pub const PHASE_REVIEW: u8 = 6;

/// Drives a single task through plan → implement → review.
pub struct PhaseRunner {
    pub plan: PhaseFn,
    pub implement: PhaseFn,
    pub review: PhaseFn,
    /// `None` disallows nothing (every phase runs); `Some(set)` restricts
    /// execution to the listed phase numbers (`--steps`).
    pub allowed_phases: Option<HashSet<u8>>,
    /// `None` means unbounded (`--no-limit`); `Some(n)` caps implement/review
    /// attempts at `n` (default 20, `--limit`).
    pub max_attempts: Option<u32>,
}

impl PhaseRunner {
    fn phase_allowed(&self, phase: u8) -> bool {
        match &self.allowed_phases {
            None => true,
            Some(set) => set.contains(&phase),
        }
    }

    /// Run `task` to completion or failure. Mutates `task.status` in place;
    /// the Scheduler reads it back after this returns to drive counter/set
    /// bookkeeping — Runners signal completion, they don't mutate scheduler
    /// state directly, so `task.status` itself is the signal.
    pub async fn run_task(
        &self,
        task: &mut Task,
        cancel: &CancellationToken,
    ) -> Result<(), OrchestratorError> {
        // 1. Already approved — short-circuit.
        if is_implemented(&task.dir).completed && has_approved_code_review(&task.dir) {
            task.status = TaskStatus::Completed;
            return Ok(());
        }

        // 2. Repair a prior-run TODO.old.md rename.
        if let Err(e) = repair_todo_rename(&task.dir) {
            log_warn!(
                "[{}] failed to repair TODO.old.md rename: {}",
                task.name,
                e
            );
        }

        // 3. Plan phase, if needed and allowed.
        let todo_path = task.dir.join("TODO.md");
        if self.phase_allowed(PHASE_PLAN) && !todo_path.exists() {
            log_info!("[{}] running plan phase", task.name);
            let result = (self.plan)(task.clone(), cancel.clone()).await;
            if let Err(e) = result {
                task.status = TaskStatus::Failed;
                return Err(e);
            }
            if !task.dir.exists() {
                // The plan phase split this task into subtasks; the next
                // graph rebuild will import them.
                log_info!(
                    "[{}] directory vanished after plan phase — treating as split",
                    task.name
                );
                task.status = TaskStatus::Completed;
                return Ok(());
            }
        }

        // 4. Implement/review retry loop.
        let effective_max = self.max_attempts.unwrap_or(u32::MAX);
        let mut last_error: Option<String> = None;
        let mut approved = false;

        let mut attempt = 1;
        while attempt <= effective_max {
            if cancel.is_cancelled() {
                return Err(OrchestratorError::Other("cancelled".to_string()));
            }

            let implement_needed =
                self.phase_allowed(PHASE_IMPLEMENT) && !is_implemented(&task.dir).completed;
            if implement_needed {
                log_info!(
                    "[{}] running implement phase (attempt {}/{})",
                    task.name,
                    attempt,
                    if self.max_attempts.is_some() {
                        effective_max.to_string()
                    } else {
                        "unbounded".to_string()
                    }
                );
                match (self.implement)(task.clone(), cancel.clone()).await {
                    Ok(()) => {
                        last_error = None;
                    }
                    Err(e) => {
                        log_warn!(
                            "[{}] implement phase failed (attempt {}): {}",
                            task.name,
                            attempt,
                            e
                        );
                        last_error = Some(e.to_string());
                        tokio::time::sleep(IMPLEMENT_RETRY_BACKOFF).await;
                        attempt += 1;
                        continue;
                    }
                }
            }

            let review_needed =
                self.phase_allowed(PHASE_REVIEW) && !has_approved_code_review(&task.dir);
            if review_needed {
                log_info!("[{}] running review phase (attempt {})", task.name, attempt);
                if let Err(e) = (self.review)(task.clone(), cancel.clone()).await {
                    task.status = TaskStatus::Failed;
                    return Err(e);
                }
                if !has_approved_code_review(&task.dir) {
                    attempt += 1;
                    continue;
                }
            }

            approved = true;
            break;
        }

        if approved {
            task.status = TaskStatus::Completed;
            Ok(())
        } else {
            task.status = TaskStatus::Failed;
            Err(OrchestratorError::MaxAttemptsExceeded {
                task: task.name.clone(),
                last_error: last_error.unwrap_or_else(|| "no implement error recorded".to_string()),
            })
        }
    }
}
