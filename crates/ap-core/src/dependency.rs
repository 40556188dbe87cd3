//! Dependency graph validation and ready-set computation for a [`TodoList`].
//!
//! Readiness is always derived from current item statuses and never cached:
//! an item is ready iff it is `Pending` and every dependency is `Completed`.

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::types::{Todo, TodoList, TodoStatus};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// A dependency reference that points at no item in the list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DanglingRef {
    pub todo_id: String,
    pub missing: String,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DependencyError {
    #[error("dangling dependency references: {}", format_dangling(.0))]
    Dangling(Vec<DanglingRef>),
    /// IDs along the cycle, first element repeated at the end.
    #[error("dependency cycle: {}", .0.join(" -> "))]
    Cycle(Vec<String>),
}

fn format_dangling(refs: &[DanglingRef]) -> String {
    refs.iter()
        .map(|r| format!("{} -> {}", r.todo_id, r.missing))
        .collect::<Vec<_>>()
        .join(", ")
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Reject dangling references and cycles (self-references included).
pub fn validate(list: &TodoList) -> Result<(), DependencyError> {
    let ids: HashSet<&str> = list.ids().collect();

    let dangling: Vec<DanglingRef> = list
        .todos
        .iter()
        .flat_map(|todo| {
            todo.dependencies
                .iter()
                .filter(|dep| !ids.contains(dep.as_str()))
                .map(|dep| DanglingRef {
                    todo_id: todo.id.clone(),
                    missing: dep.clone(),
                })
        })
        .collect();
    if !dangling.is_empty() {
        return Err(DependencyError::Dangling(dangling));
    }

    if let Some(cycle) = find_cycle(list) {
        return Err(DependencyError::Cycle(cycle));
    }
    Ok(())
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    OnStack,
    Done,
}

/// Depth-first search with an explicit recursion stack. Returns the first
/// cycle found in list order.
fn find_cycle(list: &TodoList) -> Option<Vec<String>> {
    let index: HashMap<&str, &Todo> = list.todos.iter().map(|t| (t.id.as_str(), t)).collect();
    let mut marks: HashMap<&str, Mark> = index.keys().map(|id| (*id, Mark::Unvisited)).collect();

    fn visit<'a>(
        id: &'a str,
        index: &HashMap<&'a str, &'a Todo>,
        marks: &mut HashMap<&'a str, Mark>,
        stack: &mut Vec<&'a str>,
    ) -> Option<Vec<String>> {
        marks.insert(id, Mark::OnStack);
        stack.push(id);
        if let Some(&todo) = index.get(id) {
            for dep in &todo.dependencies {
                let dep = dep.as_str();
                match marks.get(dep).copied() {
                    Some(Mark::OnStack) => {
                        let start = stack.iter().position(|s| *s == dep).unwrap_or(0);
                        let mut cycle: Vec<String> =
                            stack[start..].iter().map(|s| s.to_string()).collect();
                        cycle.push(dep.to_string());
                        return Some(cycle);
                    }
                    Some(Mark::Unvisited) => {
                        if let Some(cycle) = visit(dep, index, marks, stack) {
                            return Some(cycle);
                        }
                    }
                    Some(Mark::Done) | None => {}
                }
            }
        }
        stack.pop();
        marks.insert(id, Mark::Done);
        None
    }

    let mut stack = Vec::new();
    for todo in &list.todos {
        if marks.get(todo.id.as_str()) == Some(&Mark::Unvisited) {
            if let Some(cycle) = visit(todo.id.as_str(), &index, &mut marks, &mut stack) {
                return Some(cycle);
            }
        }
    }
    None
}

// ---------------------------------------------------------------------------
// Ready set
// ---------------------------------------------------------------------------

/// IDs of every ready item, in dispatch order.
///
/// Order: fewer declared dependencies first, then higher priority, then lower
/// complexity, then earlier `created_at`, then list position.
pub fn ready_set(list: &TodoList) -> Vec<String> {
    let status: HashMap<&str, TodoStatus> =
        list.todos.iter().map(|t| (t.id.as_str(), t.status)).collect();

    let mut ready: Vec<(usize, &Todo)> = list
        .todos
        .iter()
        .enumerate()
        .filter(|(_, t)| {
            t.status == TodoStatus::Pending
                && t.dependencies
                    .iter()
                    .all(|d| status.get(d.as_str()) == Some(&TodoStatus::Completed))
        })
        .collect();

    ready.sort_by(|(ia, a), (ib, b)| dispatch_order(a, b).then(ia.cmp(ib)));
    ready.into_iter().map(|(_, t)| t.id.clone()).collect()
}

fn dispatch_order(a: &Todo, b: &Todo) -> Ordering {
    a.dependencies
        .len()
        .cmp(&b.dependencies.len())
        .then_with(|| b.priority.cmp(&a.priority))
        .then_with(|| a.complexity.cmp(&b.complexity))
        .then_with(|| a.created_at.cmp(&b.created_at))
}

/// A pending item that cannot run, with the dependencies holding it back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockedTodo {
    pub todo_id: String,
    pub unmet: Vec<UnmetDependency>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnmetDependency {
    pub todo_id: String,
    /// `None` when the reference does not resolve to an item.
    pub status: Option<TodoStatus>,
}

impl fmt::Display for BlockedTodo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} waits on [", self.todo_id)?;
        for (i, dep) in self.unmet.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            match dep.status {
                Some(status) => write!(f, "{} ({})", dep.todo_id, status)?,
                None => write!(f, "{} (missing)", dep.todo_id)?,
            }
        }
        f.write_str("]")
    }
}

/// Every pending item with at least one dependency that is not `Completed`.
pub fn blocked_items(list: &TodoList) -> Vec<BlockedTodo> {
    let status: HashMap<&str, TodoStatus> =
        list.todos.iter().map(|t| (t.id.as_str(), t.status)).collect();

    list.todos
        .iter()
        .filter(|t| t.status == TodoStatus::Pending)
        .filter_map(|t| {
            let unmet: Vec<UnmetDependency> = t
                .dependencies
                .iter()
                .filter_map(|d| match status.get(d.as_str()) {
                    Some(TodoStatus::Completed) => None,
                    other => Some(UnmetDependency {
                        todo_id: d.clone(),
                        status: other.copied(),
                    }),
                })
                .collect();
            (!unmet.is_empty()).then(|| BlockedTodo {
                todo_id: t.id.clone(),
                unmet,
            })
        })
        .collect()
}

/// Pending items that can never run because a dependency, direct or
/// transitive, ended `Failed` or `Cancelled`.
pub fn doomed_items(list: &TodoList) -> HashSet<String> {
    let status: HashMap<&str, TodoStatus> =
        list.todos.iter().map(|t| (t.id.as_str(), t.status)).collect();
    let mut doomed: HashSet<String> = HashSet::new();

    loop {
        let before = doomed.len();
        for todo in list.todos.iter().filter(|t| t.status == TodoStatus::Pending) {
            if doomed.contains(&todo.id) {
                continue;
            }
            let hopeless = todo.dependencies.iter().any(|d| {
                matches!(
                    status.get(d.as_str()),
                    Some(TodoStatus::Failed) | Some(TodoStatus::Cancelled)
                ) || doomed.contains(d)
            });
            if hopeless {
                doomed.insert(todo.id.clone());
            }
        }
        if doomed.len() == before {
            return doomed;
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
