use std::collections::{HashMap, HashSet};
use std::path::Path;

use serde::Deserialize;

use crate::error::OrchestratorError;
use crate::log_warn;
use crate::types::{parse_scope, Scope, Task, TaskStatus};

/// Name of the execution marker file inspected by `is_implemented`.
const EXECUTION_MARKER_FILE: &str = "execution.json";
const CODE_REVIEW_FILE: &str = "CODE_REVIEW.md";
const TASK_FILE: &str = "TASK.md";
const TODO_FILE: &str = "TODO.md";
const TODO_OLD_FILE: &str = "TODO.old.md";

/// The in-memory task graph. Tasks are kept in insertion order so
/// readiness enumeration is deterministic.
#[derive(Clone, Debug, Default)]
pub struct TaskGraph {
    order: Vec<String>,
    tasks: HashMap<String, Task>,
}

impl TaskGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a task, preserving its original position if it was
    /// already present.
    pub fn insert(&mut self, task: Task) {
        if !self.tasks.contains_key(&task.name) {
            self.order.push(task.name.clone());
        }
        self.tasks.insert(task.name.clone(), task);
    }

    pub fn get(&self, name: &str) -> Option<&Task> {
        self.tasks.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Task> {
        self.tasks.get_mut(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tasks.contains_key(name)
    }

    pub fn remove(&mut self, name: &str) -> Option<Task> {
        self.order.retain(|n| n != name);
        self.tasks.remove(name)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Tasks in insertion order, so readiness enumeration mirrors insertion
    /// order.
    pub fn iter(&self) -> impl Iterator<Item = &Task> {
        self.order.iter().filter_map(move |name| self.tasks.get(name))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.order.iter().map(String::as_str)
    }

    pub fn all_terminal_and_idle(&self, running: &HashSet<String>) -> bool {
        running.is_empty() && self.tasks.values().all(Task::is_terminal)
    }
}

// --- On-disk projection: loading a task from its directory ---

/// Build a `Task` from its on-disk directory: reads `TASK.md` for `@scope`
/// and `@dependencies`, defaulting scope to `Integration` when absent or
/// unparseable.
pub fn load_task_from_dir(name: &str, dir: &Path) -> Result<Task, OrchestratorError> {
    let mut task = Task::new(name, dir.to_path_buf());
    let task_md_path = dir.join(TASK_FILE);
    if let Ok(contents) = std::fs::read_to_string(&task_md_path) {
        let (scope, deps) = parse_task_md(&contents);
        task.scope = scope;
        task.deps = deps;
    } else {
        log_warn!(
            "Graph Store: {} has no {}; defaulting scope to integration with no dependencies",
            dir.display(),
            TASK_FILE
        );
    }
    Ok(task)
}

/// Parse `@scope <value>` and `@dependencies [a, b, ...]` directives out of a
/// `TASK.md` body. Both are optional; unrecognized scope values default to
/// `Integration` (delegated to `parse_scope`), and a missing `@dependencies`
/// line yields an empty set.
fn parse_task_md(contents: &str) -> (Scope, HashSet<String>) {
    let mut scope = Scope::Integration;
    let mut deps = HashSet::new();

    for line in contents.lines() {
        let trimmed = line.trim();
        if let Some(rest) = trimmed
            .strip_prefix("@scope")
            .or_else(|| trimmed.strip_prefix("@Scope"))
        {
            scope = parse_scope(rest.trim());
        } else if let Some(rest) = trimmed.strip_prefix("@dependencies") {
            let rest = rest.trim().trim_start_matches('[').trim_end_matches(']');
            for dep in rest.split(',') {
                let dep = dep.trim().trim_matches('"').trim_matches('\'');
                if !dep.is_empty() {
                    deps.insert(dep.to_string());
                }
            }
        }
    }

    (scope, deps)
}

// --- Completion predicates ---

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CompletionStatus {
    pub completed: bool,
    pub confidence: f64,
    pub reason: &'static str,
}

#[derive(Debug, Deserialize, Default)]
struct ExecutionMarkerCompletion {
    status: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct ExecutionMarkerPhase {
    status: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct ExecutionMarker {
    status: Option<String>,
    completion: Option<ExecutionMarkerCompletion>,
    #[serde(default)]
    phases: Vec<ExecutionMarkerPhase>,
}

/// Inspect a task directory's execution marker and decide whether the
/// implement phase is done, per a priority-ordered rule set.
pub fn is_implemented(dir: &Path) -> CompletionStatus {
    let marker_path = dir.join(EXECUTION_MARKER_FILE);
    let contents = match std::fs::read_to_string(&marker_path) {
        Ok(c) => c,
        Err(_) => {
            return CompletionStatus {
                completed: false,
                confidence: 1.0,
                reason: "execution marker missing",
            }
        }
    };

    let marker: ExecutionMarker = match serde_json::from_str(&contents) {
        Ok(m) => m,
        Err(_) => {
            return CompletionStatus {
                completed: false,
                confidence: 0.5,
                reason: "Failed to parse execution.json",
            }
        }
    };

    if marker
        .completion
        .as_ref()
        .and_then(|c| c.status.as_deref())
        .is_some_and(|s| s.eq_ignore_ascii_case("completed"))
    {
        return CompletionStatus {
            completed: true,
            confidence: 1.0,
            reason: "completion.status == completed",
        };
    }

    if marker
        .status
        .as_deref()
        .is_some_and(|s| s.eq_ignore_ascii_case("completed"))
    {
        return CompletionStatus {
            completed: true,
            confidence: 0.9,
            reason: "status == completed",
        };
    }

    if marker
        .status
        .as_deref()
        .is_some_and(|s| s.eq_ignore_ascii_case("blocked"))
    {
        return CompletionStatus {
            completed: false,
            confidence: 1.0,
            reason: "status == blocked",
        };
    }

    if !marker.phases.is_empty()
        && marker
            .phases
            .iter()
            .all(|p| p.status.as_deref().is_some_and(|s| s.eq_ignore_ascii_case("completed")))
    {
        return CompletionStatus {
            completed: true,
            confidence: 0.85,
            reason: "all phases completed",
        };
    }

    CompletionStatus {
        completed: false,
        confidence: 0.8,
        reason: "no completion signal found",
    }
}

/// Check `CODE_REVIEW.md` for an approved `## Status` section.
pub fn has_approved_code_review(dir: &Path) -> bool {
    let path = dir.join(CODE_REVIEW_FILE);
    let Ok(contents) = std::fs::read_to_string(&path) else {
        return false;
    };

    let mut lines = contents.lines();
    let found_status_header = loop {
        match lines.next() {
            Some(line) if line.trim().eq_ignore_ascii_case("## status") => break true,
            Some(_) => continue,
            None => break false,
        }
    };
    if !found_status_header {
        return false;
    }

    for line in lines {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        return trimmed.to_lowercase().contains("approved");
    }
    false
}

/// Restore `TODO.old.md` to `TODO.md` if the review artifact exists but the
/// implementation plan was renamed aside (Phase Runner's repair step).
pub fn repair_todo_rename(dir: &Path) -> std::io::Result<()> {
    let todo_old = dir.join(TODO_OLD_FILE);
    let todo = dir.join(TODO_FILE);
    if todo_old.exists() && !todo.exists() {
        std::fs::rename(&todo_old, &todo)?;
    }
    Ok(())
}

/// Workspace-relative root that holds one subdirectory per task.
pub const TASK_EXECUTOR_DIR: &str = ".claudiomiro/task-executor";

/// Load the full task graph from `<workspace_root>/.claudiomiro/task-executor/`:
/// one `Task` per subdirectory, scope/deps parsed from `TASK.md`, status
/// derived from the completion predicates so a rebuild naturally reflects
/// on-disk progress made since the last load (an idempotent restart against
/// an all-approved directory simply finds everything already completed).
///
/// Used both as the initial graph at startup and as the default `rebuild_fn`
/// the Scheduler's main loop calls every iteration.
pub fn load_graph_from_dir(workspace_root: &Path) -> Result<TaskGraph, OrchestratorError> {
    let root = workspace_root.join(TASK_EXECUTOR_DIR);
    let mut graph = TaskGraph::new();

    let entries = match std::fs::read_dir(&root) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(graph),
        Err(e) => return Err(OrchestratorError::Io(e)),
    };

    let mut dirs: Vec<_> = entries
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.path().is_dir())
        .collect();
    dirs.sort_by_key(|entry| entry.file_name());

    for entry in dirs {
        let name = entry.file_name().to_string_lossy().to_string();
        let dir = entry.path();
        let mut task = load_task_from_dir(&name, &dir)?;
        if is_implemented(&dir).completed && has_approved_code_review(&dir) {
            task.status = TaskStatus::Completed;
        }
        graph.insert(task);
    }

    Ok(graph)
}

// --- Graph diff / rebuild ---

/// Merge a freshly loaded graph into the current one, applying the standard
/// diffing rules plus a split-safety coalescing exception: a task dropped in
/// the same rebuild that introduces replacements referencing it in their
/// `deps` is promoted to completed rather than discarded.
///
/// Existing deps are unioned with the incoming task's on-disk deps rather
/// than overwritten, so synthetic edges added by file-conflict resolution
/// survive a rebuild instead of being clobbered by the freshly reloaded
/// `TASK.md` edges.
///
/// Returns the names of tasks newly added (for Registry seeding) and the
/// names of tasks that were promoted to `completed` via the coalescing rule
/// or the stale-graph-promotion rule, so the caller can update the Registry.
pub fn merge_graph(current: &mut TaskGraph, incoming: TaskGraph) -> GraphDiff {
    let mut diff = GraphDiff::default();

    let incoming_names: HashSet<String> = incoming.names().map(str::to_string).collect();

    for incoming_task in incoming.iter() {
        match current.get_mut(&incoming_task.name) {
            None => {
                current.insert(incoming_task.clone());
                diff.added.push(incoming_task.name.clone());
            }
            Some(existing) => {
                existing.deps.extend(incoming_task.deps.iter().cloned());
                if existing.status == TaskStatus::Pending
                    && incoming_task.status == TaskStatus::Completed
                {
                    existing.status = TaskStatus::Completed;
                    diff.promoted.push(existing.name.clone());
                }
            }
        }
    }

    let tracked: Vec<String> = current.names().map(str::to_string).collect();
    for name in tracked {
        if incoming_names.contains(&name) {
            continue;
        }
        let Some(task) = current.get(&name) else {
            continue;
        };
        if task.status != TaskStatus::Pending {
            continue;
        }

        let has_replacement = diff
            .added
            .iter()
            .filter_map(|added_name| current.get(added_name))
            .any(|added| added.deps.contains(&name));

        if has_replacement {
            if let Some(task) = current.get_mut(&name) {
                task.status = TaskStatus::Completed;
            }
            diff.promoted.push(name);
        } else {
            current.remove(&name);
            diff.removed.push(name);
        }
    }

    diff
}

#[derive(Debug, Default)]
pub struct GraphDiff {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub promoted: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn task(name: &str, deps: &[&str], status: TaskStatus) -> Task {
        let mut t = Task::new(name, PathBuf::from(name));
        t.deps = deps.iter().map(|d| d.to_string()).collect();
        t.status = status;
        t
    }

    #[test]
    fn insertion_order_is_preserved() {
        let mut graph = TaskGraph::new();
        graph.insert(task("b", &[], TaskStatus::Pending));
        graph.insert(task("a", &[], TaskStatus::Pending));
        let names: Vec<&str> = graph.names().collect();
        assert_eq!(names, vec!["b", "a"]);
    }

    #[test]
    fn parse_task_md_extracts_scope_and_deps() {
        let contents = "@scope backend\n@dependencies [a, b, \"c\"]\nSome text\n";
        let (scope, deps) = parse_task_md(contents);
        assert_eq!(scope, Scope::Backend);
        assert_eq!(
            deps,
            HashSet::from(["a".to_string(), "b".to_string(), "c".to_string()])
        );
    }

    #[test]
    fn missing_task_md_defaults_to_integration_no_deps() {
        let (scope, deps) = parse_task_md("");
        assert_eq!(scope, Scope::Integration);
        assert!(deps.is_empty());
    }

    #[test]
    fn is_implemented_honors_priority_order() {
        let dir = TempDir::new().unwrap();

        assert_eq!(is_implemented(dir.path()).confidence, 1.0);
        assert!(!is_implemented(dir.path()).completed);

        std::fs::write(
            dir.path().join(EXECUTION_MARKER_FILE),
            r#"{"status": "blocked"}"#,
        )
        .unwrap();
        assert!(!is_implemented(dir.path()).completed);

        std::fs::write(
            dir.path().join(EXECUTION_MARKER_FILE),
            r#"{"status": "completed"}"#,
        )
        .unwrap();
        let result = is_implemented(dir.path());
        assert!(result.completed);
        assert_eq!(result.confidence, 0.9);

        std::fs::write(
            dir.path().join(EXECUTION_MARKER_FILE),
            r#"{"status": "running", "completion": {"status": "completed"}}"#,
        )
        .unwrap();
        let result = is_implemented(dir.path());
        assert!(result.completed);
        assert_eq!(result.confidence, 1.0);

        std::fs::write(dir.path().join(EXECUTION_MARKER_FILE), "not json").unwrap();
        let result = is_implemented(dir.path());
        assert!(!result.completed);
        assert_eq!(result.confidence, 0.5);
    }

    #[test]
    fn code_review_approval_requires_status_section() {
        let dir = TempDir::new().unwrap();
        assert!(!has_approved_code_review(dir.path()));

        std::fs::write(dir.path().join(CODE_REVIEW_FILE), "no status section here").unwrap();
        assert!(!has_approved_code_review(dir.path()));

        std::fs::write(
            dir.path().join(CODE_REVIEW_FILE),
            "# Review\n\n## Status\n\nApproved with nits\n",
        )
        .unwrap();
        assert!(has_approved_code_review(dir.path()));

        std::fs::write(
            dir.path().join(CODE_REVIEW_FILE),
            "## Status\nChanges requested\n",
        )
        .unwrap();
        assert!(!has_approved_code_review(dir.path()));
    }

    #[test]
    fn merge_graph_adds_promotes_and_removes() {
        let mut current = TaskGraph::new();
        current.insert(task("a", &[], TaskStatus::Completed));
        current.insert(task("b", &["a"], TaskStatus::Pending));
        current.insert(task("stale", &[], TaskStatus::Pending));

        let mut incoming = TaskGraph::new();
        incoming.insert(task("a", &[], TaskStatus::Completed));
        incoming.insert(task("b", &["a"], TaskStatus::Completed));
        incoming.insert(task("c", &[], TaskStatus::Pending));

        let diff = merge_graph(&mut current, incoming);

        assert_eq!(diff.added, vec!["c".to_string()]);
        assert_eq!(diff.removed, vec!["stale".to_string()]);
        assert!(diff.promoted.contains(&"b".to_string()));
        assert_eq!(current.get("b").unwrap().status, TaskStatus::Completed);
        assert!(current.get("stale").is_none());
    }

    #[test]
    fn load_graph_from_dir_reads_subdirectories_and_status() {
        let workspace = TempDir::new().unwrap();
        let task_dir = workspace.path().join(TASK_EXECUTOR_DIR).join("alpha");
        std::fs::create_dir_all(&task_dir).unwrap();
        std::fs::write(task_dir.join("TASK.md"), "@scope backend\n").unwrap();
        std::fs::write(task_dir.join("execution.json"), r#"{"status": "completed"}"#).unwrap();
        std::fs::write(task_dir.join("CODE_REVIEW.md"), "## Status\nApproved\n").unwrap();

        let other_dir = workspace.path().join(TASK_EXECUTOR_DIR).join("beta");
        std::fs::create_dir_all(&other_dir).unwrap();

        let graph = load_graph_from_dir(workspace.path()).unwrap();
        assert_eq!(graph.len(), 2);
        assert_eq!(graph.get("alpha").unwrap().scope, Scope::Backend);
        assert_eq!(graph.get("alpha").unwrap().status, TaskStatus::Completed);
        assert_eq!(graph.get("beta").unwrap().status, TaskStatus::Pending);
    }

    #[test]
    fn load_graph_from_dir_missing_root_is_empty() {
        let workspace = TempDir::new().unwrap();
        let graph = load_graph_from_dir(workspace.path()).unwrap();
        assert!(graph.is_empty());
    }

    #[test]
    fn merge_graph_coalesces_split_task_into_completed() {
        let mut current = TaskGraph::new();
        current.insert(task("parent", &[], TaskStatus::Pending));

        let mut incoming = TaskGraph::new();
        incoming.insert(task("parent.1", &["parent"], TaskStatus::Pending));
        incoming.insert(task("parent.2", &["parent"], TaskStatus::Pending));

        let diff = merge_graph(&mut current, incoming);

        assert!(diff.promoted.contains(&"parent".to_string()));
        assert!(diff.removed.is_empty());
        assert_eq!(current.get("parent").unwrap().status, TaskStatus::Completed);
        assert!(current.contains("parent.1"));
        assert!(current.contains("parent.2"));
    }
}
