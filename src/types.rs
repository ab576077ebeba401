use std::collections::HashSet;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// The four states a task can be in.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Pending => write!(f, "pending"),
            TaskStatus::Running => write!(f, "running"),
            TaskStatus::Completed => write!(f, "completed"),
            TaskStatus::Failed => write!(f, "failed"),
        }
    }
}

pub fn parse_task_status(s: &str) -> Result<TaskStatus, String> {
    match s.to_lowercase().as_str() {
        "pending" => Ok(TaskStatus::Pending),
        "running" => Ok(TaskStatus::Running),
        "completed" => Ok(TaskStatus::Completed),
        "failed" => Ok(TaskStatus::Failed),
        _ => Err(format!(
            "Invalid status '{}': expected pending, running, completed, or failed",
            s
        )),
    }
}

/// The scope tag used for scope-aware admission. Defaults to `Integration`
/// when absent or unparseable from `TASK.md`.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    Backend,
    Frontend,
    #[default]
    Integration,
}

impl std::fmt::Display for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Scope::Backend => write!(f, "backend"),
            Scope::Frontend => write!(f, "frontend"),
            Scope::Integration => write!(f, "integration"),
        }
    }
}

/// Parse a `@scope` value from `TASK.md`. Never fails: an unrecognized value
/// defaults to `Integration`, with the caller responsible for logging the
/// fallback.
pub fn parse_scope(s: &str) -> Scope {
    match s.trim().to_lowercase().as_str() {
        "backend" => Scope::Backend,
        "frontend" => Scope::Frontend,
        "integration" => Scope::Integration,
        _ => Scope::Integration,
    }
}

/// The executor variant selecting which external AI CLI a Subprocess Supervisor
/// invocation shells out to.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ExecutorVariant {
    #[default]
    Claude,
    Codex,
    Gemini,
    DeepSeek,
    Glm,
}

impl std::fmt::Display for ExecutorVariant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutorVariant::Claude => write!(f, "claude"),
            ExecutorVariant::Codex => write!(f, "codex"),
            ExecutorVariant::Gemini => write!(f, "gemini"),
            ExecutorVariant::DeepSeek => write!(f, "deep-seek"),
            ExecutorVariant::Glm => write!(f, "glm"),
        }
    }
}

pub fn parse_executor_variant(s: &str) -> Result<ExecutorVariant, String> {
    match s.to_lowercase().as_str() {
        "claude" => Ok(ExecutorVariant::Claude),
        "codex" => Ok(ExecutorVariant::Codex),
        "gemini" => Ok(ExecutorVariant::Gemini),
        "deep-seek" | "deepseek" => Ok(ExecutorVariant::DeepSeek),
        "glm" => Ok(ExecutorVariant::Glm),
        _ => Err(format!("Unknown executor type: {}", s)),
    }
}

/// The model tier requested of a Subprocess Supervisor invocation.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ModelTier {
    Fast,
    #[default]
    Medium,
    Hard,
}

impl ModelTier {
    /// The reasoning-effort string passed to the executor variant's CLI args.
    pub fn reasoning_effort(&self) -> &'static str {
        match self {
            ModelTier::Fast => "low",
            ModelTier::Medium => "medium",
            ModelTier::Hard => "high",
        }
    }
}

/// A single task in the graph. `deps`/`files` are kept as `HashSet` since
/// their membership is what matters, not their order; enumeration order for
/// scheduling is tracked separately by the Graph Store's insertion-ordered
/// name list.
#[derive(Clone, Debug, PartialEq)]
pub struct Task {
    pub name: String,
    pub deps: HashSet<String>,
    pub status: TaskStatus,
    pub scope: Scope,
    pub files: HashSet<String>,
    pub dir: PathBuf,
}

impl Task {
    pub fn new(name: impl Into<String>, dir: PathBuf) -> Self {
        Self {
            name: name.into(),
            deps: HashSet::new(),
            status: TaskStatus::Pending,
            scope: Scope::Integration,
            files: HashSet::new(),
            dir,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.status, TaskStatus::Completed | TaskStatus::Failed)
    }
}

/// The Registry's per-task entry. `message` is truncated to 103 characters
/// (100 + `"..."`) by the Registry actor, never by callers.
#[derive(Clone, Debug, PartialEq, Default)]
pub struct TaskStateEntry {
    pub status: TaskStatus,
    pub step: Option<String>,
    pub message: Option<String>,
}

/// Truncate a Registry message: strings over 100 characters are cut to the
/// first 100 and suffixed with `"..."` (103 chars total); empty or
/// whitespace-only input resets to `None`.
pub fn truncate_message(text: &str) -> Option<String> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return None;
    }
    if trimmed.chars().count() > 100 {
        let truncated: String = trimmed.chars().take(100).collect();
        Some(format!("{}...", truncated))
    } else {
        Some(trimmed.to_string())
    }
}

/// One unsatisfied dependency reported to the deadlock resolver:
/// distinguishes "exists but not completed" from "does not exist in graph".
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct UnsatisfiedDependency {
    pub dep_name: String,
    pub exists: bool,
    pub status: Option<TaskStatus>,
}

/// The diagnostic bundle handed to the external AI deadlock resolver.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct DeadlockReport {
    pub pending: Vec<(String, Vec<UnsatisfiedDependency>)>,
    pub attempt: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unrecognized_scope_defaults_to_integration() {
        assert_eq!(parse_scope("bogus"), Scope::Integration);
        assert_eq!(parse_scope(""), Scope::Integration);
        assert_eq!(parse_scope("BACKEND"), Scope::Backend);
    }

    #[test]
    fn message_truncation_caps_at_103_chars() {
        assert_eq!(truncate_message(""), None);
        assert_eq!(truncate_message("   "), None);
        let short = "hello";
        assert_eq!(truncate_message(short), Some("hello".to_string()));
        let long = "a".repeat(150);
        let truncated = truncate_message(&long).unwrap();
        assert_eq!(truncated.len(), 103);
        assert!(truncated.ends_with("..."));
    }

    #[test]
    fn unknown_executor_variant_fails() {
        assert!(parse_executor_variant("foo").is_err());
        assert_eq!(parse_executor_variant("deep-seek").unwrap(), ExecutorVariant::DeepSeek);
    }
}
