use std::collections::{HashMap, HashSet};

use crate::graph::TaskGraph;
use crate::log_warn;

/// One detected overlap between two tasks' declared `files` sets.
#[derive(Debug, Clone, PartialEq)]
pub struct FileConflict {
    pub earlier: String,
    pub later: String,
    pub shared_files: Vec<String>,
}

/// Scan the graph for pairs of tasks with overlapping `files`, and add a
/// synthetic dependency edge (`later.deps.insert(earlier)`) for each pair
/// that doesn't already have one transitively, in graph-enumeration order.
/// Returns the conflicts found, for the caller's warning summary.
///
/// Runs a full pairwise scan once; callers are responsible for the
/// once-per-lifetime guard (the Scheduler's `file_conflicts_resolved` flag).
pub fn resolve_file_conflicts(graph: &mut TaskGraph) -> Vec<FileConflict> {
    let names: Vec<String> = graph.names().map(str::to_string).collect();
    let mut conflicts = Vec::new();

    for (i, earlier) in names.iter().enumerate() {
        for later in &names[i + 1..] {
            let shared = shared_files(graph, earlier, later);
            if shared.is_empty() {
                continue;
            }

            conflicts.push(FileConflict {
                earlier: earlier.clone(),
                later: later.clone(),
                shared_files: shared,
            });

            if reachable(graph, later, earlier) {
                // Adding `later` depends-on `earlier` would create a cycle
                // because `earlier` is already reachable from `later`.
                log_warn!(
                    "File conflict between '{}' and '{}' could not be serialized: \
                     adding the dependency would create a cycle",
                    earlier,
                    later
                );
                continue;
            }

            if let Some(task) = graph.get_mut(later) {
                task.deps.insert(earlier.clone());
            }
        }
    }

    if !conflicts.is_empty() {
        let summary: Vec<String> = conflicts
            .iter()
            .map(|c| format!("{} <-> {} ({})", c.earlier, c.later, c.shared_files.join(", ")))
            .collect();
        log_warn!("Resolved {} file conflict(s): {}", conflicts.len(), summary.join("; "));
    }

    conflicts
}

fn shared_files(graph: &TaskGraph, a: &str, b: &str) -> Vec<String> {
    let (Some(task_a), Some(task_b)) = (graph.get(a), graph.get(b)) else {
        return Vec::new();
    };
    let mut shared: Vec<String> = task_a.files.intersection(&task_b.files).cloned().collect();
    shared.sort();
    shared
}

/// DFS over `deps` edges: is `target` reachable from `start`? Mirrors the
/// three-color DFS cycle check used for dependency-graph validation, scoped
/// down to a single start/target reachability query.
fn reachable(graph: &TaskGraph, start: &str, target: &str) -> bool {
    let mut visited: HashSet<&str> = HashSet::new();
    let mut stack = vec![start];

    while let Some(current) = stack.pop() {
        if current == target {
            return true;
        }
        if !visited.insert(current) {
            continue;
        }
        if let Some(task) = graph.get(current) {
            for dep in &task.deps {
                if !visited.contains(dep.as_str()) {
                    stack.push(dep.as_str());
                }
            }
        }
    }

    false
}

/// Reverse-index helper used by tests and by callers that want to know, for
/// a given file path, which tasks declared it — not required by the
/// conflict-detection algorithm but convenient for constructing fixtures.
#[cfg(test)]
fn files_index(graph: &TaskGraph) -> HashMap<String, Vec<String>> {
    let mut index: HashMap<String, Vec<String>> = HashMap::new();
    for task in graph.iter() {
        for file in &task.files {
            index.entry(file.clone()).or_default().push(task.name.clone());
        }
    }
    index
}
