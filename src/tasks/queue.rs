//! Pure queries and edits over an in-memory task list.
//!
//! Nothing here mutates its input: edits return a new `Vec<Task>` so readers
//! holding the previous list are never disturbed.

use std::sync::LazyLock;

use regex::Regex;

use super::model::{Priority, Task, TaskScope, TaskStatus};

/// Description phrases that flag a HIGH task as an automatic fix.
static AUTO_FIX_SIGNAL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)fix critical error|\[auto-fix\]").expect("auto-fix pattern is valid")
});

/// Tasks bucketed by status, each bucket in input order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskGroups {
    pub pending: Vec<Task>,
    pub in_progress: Vec<Task>,
    pub blocked: Vec<Task>,
    pub completed: Vec<Task>,
}

impl TaskGroups {
    pub fn get(&self, status: TaskStatus) -> &[Task] {
        match status {
            TaskStatus::Pending => &self.pending,
            TaskStatus::InProgress => &self.in_progress,
            TaskStatus::Blocked => &self.blocked,
            TaskStatus::Completed => &self.completed,
        }
    }
}

pub fn group_by_status(tasks: &[Task]) -> TaskGroups {
    let mut groups = TaskGroups::default();
    for task in tasks {
        let bucket = match task.status {
            TaskStatus::Pending => &mut groups.pending,
            TaskStatus::InProgress => &mut groups.in_progress,
            TaskStatus::Blocked => &mut groups.blocked,
            TaskStatus::Completed => &mut groups.completed,
        };
        bucket.push(task.clone());
    }
    groups
}

/// Descending priority; equal priorities keep their input order.
pub fn sort_by_priority(tasks: &[Task]) -> Vec<Task> {
    let mut sorted = tasks.to_vec();
    sorted.sort_by(|a, b| b.priority_value().cmp(&a.priority_value()));
    sorted
}

/// Pending tasks the scheduler may run without sign-off.
pub fn auto_approved_pending(tasks: &[Task]) -> Vec<Task> {
    tasks
        .iter()
        .filter(|t| t.is_pending() && t.auto_approved && !t.approval_required)
        .cloned()
        .collect()
}

/// Pending system tasks waiting for human sign-off.
pub fn awaiting_approval(tasks: &[Task]) -> Vec<Task> {
    tasks
        .iter()
        .filter(|t| t.is_pending() && t.is_system() && t.approval_required)
        .cloned()
        .collect()
}

/// A system task that jumps the queue: CRITICAL, or HIGH with an auto-fix
/// signal in its description or metadata.
pub fn is_critical_auto_fix(task: &Task) -> bool {
    if !task.is_system() {
        return false;
    }
    match task.priority {
        Priority::Critical => true,
        Priority::High => {
            AUTO_FIX_SIGNAL.is_match(&task.description)
                || task
                    .metadata
                    .get("autofix")
                    .is_some_and(|v| v.trim().eq_ignore_ascii_case("true"))
        }
        _ => false,
    }
}

/// First pending critical auto-fix, otherwise the first pending task in
/// file order.
pub fn next_task(tasks: &[Task]) -> Option<&Task> {
    tasks
        .iter()
        .find(|t| t.is_pending() && is_critical_auto_fix(t))
        .or_else(|| tasks.iter().find(|t| t.is_pending()))
}

/// Insert a task, or replace the task with the same id in place.
pub fn add_task(tasks: &[Task], task: Task) -> Vec<Task> {
    let mut next = tasks.to_vec();
    match next.iter_mut().find(|t| t.id == task.id) {
        Some(existing) => *existing = task,
        None => next.push(task),
    }
    next
}

/// Apply `edit` to the task with `id`. Returns `None` if no such task.
pub fn update_task(tasks: &[Task], id: &str, edit: impl FnOnce(&mut Task)) -> Option<Vec<Task>> {
    let idx = tasks.iter().position(|t| t.id == id)?;
    let mut next = tasks.to_vec();
    edit(&mut next[idx]);
    Some(next)
}

/// Move a task to a new status.
pub fn set_status(tasks: &[Task], id: &str, status: TaskStatus) -> Option<Vec<Task>> {
    update_task(tasks, id, |t| t.status = status)
}

/// Remove the task with `id`. Returns `None` if no such task.
pub fn remove_task(tasks: &[Task], id: &str) -> Option<Vec<Task>> {
    if !tasks.iter().any(|t| t.id == id) {
        return None;
    }
    Some(tasks.iter().filter(|t| t.id != id).cloned().collect())
}

/// Order tasks by `ids`; tasks not named keep their relative order at the end.
/// Unknown ids are ignored.
pub fn reorder_tasks(tasks: &[Task], ids: &[String]) -> Vec<Task> {
    let mut ordered: Vec<Task> = Vec::with_capacity(tasks.len());
    for id in ids {
        if ordered.iter().any(|t| &t.id == id) {
            continue;
        }
        if let Some(task) = tasks.iter().find(|t| &t.id == id) {
            ordered.push(task.clone());
        }
    }
    for task in tasks {
        if !ordered.iter().any(|t| t.id == task.id) {
            ordered.push(task.clone());
        }
    }
    ordered
}

/// Next free numeric id for `scope`, zero-padded to three digits.
pub fn next_task_id(tasks: &[Task], scope: TaskScope) -> String {
    let prefix = scope.prefix();
    let max = tasks
        .iter()
        .filter_map(|t| t.id.strip_prefix(prefix))
        .filter_map(|n| n.parse::<u32>().ok())
        .max()
        .unwrap_or(0);
    format!("{prefix}{:03}", max + 1)
}
