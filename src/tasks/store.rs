//! File-backed task queues.
//!
//! Each operation is a whole-file read-modify-write under one lock, so two
//! edits racing on the same queue never lose each other's changes. Writes
//! go to a sibling temp file and are renamed into place.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use tokio::sync::Mutex;
use tracing::{debug, info};

use super::codec;
use super::model::{Priority, Task, TaskScope, TaskStatus};
use super::queue;
use crate::error::QueueError;
use crate::events::{DaemonEvent, EventBus, TaskAction};

/// The user queue and the system queue on disk.
pub struct TaskStore {
    user_path: PathBuf,
    system_path: PathBuf,
    events: EventBus,
    lock: Mutex<()>,
}

impl TaskStore {
    pub fn new(user_path: impl Into<PathBuf>, system_path: impl Into<PathBuf>, events: EventBus) -> Self {
        Self {
            user_path: user_path.into(),
            system_path: system_path.into(),
            events,
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self, scope: TaskScope) -> &Path {
        match scope {
            TaskScope::User => &self.user_path,
            TaskScope::System => &self.system_path,
        }
    }

    /// Read one queue. A missing file is an empty queue.
    pub async fn load(&self, scope: TaskScope) -> Result<Vec<Task>, QueueError> {
        let _guard = self.lock.lock().await;
        self.read_unlocked(scope).await
    }

    /// Read both queues: `(user, system)`.
    pub async fn load_all(&self) -> Result<(Vec<Task>, Vec<Task>), QueueError> {
        let _guard = self.lock.lock().await;
        let user = self.read_unlocked(TaskScope::User).await?;
        let system = self.read_unlocked(TaskScope::System).await?;
        Ok((user, system))
    }

    /// Find a task by id in the queue its prefix names.
    pub async fn get(&self, id: &str) -> Result<Option<Task>, QueueError> {
        let tasks = self.load(TaskScope::of(id)).await?;
        Ok(tasks.into_iter().find(|t| t.id == id))
    }

    /// Insert a task, or replace the one with the same id.
    pub async fn add_task(&self, task: Task) -> Result<Task, QueueError> {
        let scope = task.scope();
        let saved = task.clone();
        self.modify(scope, TaskAction::Added, |tasks| {
            Ok((queue::add_task(tasks, task), saved))
        })
        .await
    }

    /// Append `task`, moving it to the next free id in its scope if its id
    /// is already taken.
    pub async fn insert_new(&self, task: Task) -> Result<Task, QueueError> {
        let scope = task.scope();
        self.modify(scope, TaskAction::Added, move |tasks| {
            let mut task = task;
            if tasks.iter().any(|t| t.id == task.id) {
                task.id = queue::next_task_id(tasks, scope);
            }
            Ok((queue::add_task(tasks, task.clone()), task))
        })
        .await
    }

    /// Allocate the next id in `scope` and append a new pending task.
    pub async fn create_task(
        &self,
        scope: TaskScope,
        priority: Priority,
        description: impl Into<String>,
    ) -> Result<Task, QueueError> {
        let description = description.into();
        self.modify(scope, TaskAction::Added, move |tasks| {
            let mut task = Task::new(queue::next_task_id(tasks, scope), priority, description);
            if scope == TaskScope::System {
                task.auto_approved = true;
            }
            Ok((queue::add_task(tasks, task.clone()), task))
        })
        .await
    }

    /// Apply `edit` to the task with `id`.
    pub async fn update_task(
        &self,
        id: &str,
        edit: impl FnOnce(&mut Task) + Send,
    ) -> Result<Task, QueueError> {
        self.modify(TaskScope::of(id), TaskAction::Updated, |tasks| {
            let next = queue::update_task(tasks, id, edit).ok_or_else(|| not_found(id))?;
            let updated = find(&next, id)?;
            Ok((next, updated))
        })
        .await
    }

    pub async fn set_status(&self, id: &str, status: TaskStatus) -> Result<Task, QueueError> {
        self.modify(TaskScope::of(id), TaskAction::StatusChanged, |tasks| {
            let next = queue::set_status(tasks, id, status).ok_or_else(|| not_found(id))?;
            let updated = find(&next, id)?;
            Ok((next, updated))
        })
        .await
    }

    pub async fn delete_task(&self, id: &str) -> Result<(), QueueError> {
        self.modify(TaskScope::of(id), TaskAction::Deleted, |tasks| {
            let next = queue::remove_task(tasks, id).ok_or_else(|| not_found(id))?;
            Ok((next, ()))
        })
        .await
    }

    /// Reorder a queue by `ids`; unlisted tasks keep their order at the end.
    pub async fn reorder(&self, scope: TaskScope, ids: &[String]) -> Result<(), QueueError> {
        self.modify(scope, TaskAction::Reordered, |tasks| {
            Ok((queue::reorder_tasks(tasks, ids), ()))
        })
        .await
    }

    /// Give human sign-off to a gated system task.
    pub async fn approve(&self, id: &str) -> Result<Task, QueueError> {
        self.modify(TaskScope::of(id), TaskAction::Approved, |tasks| {
            let current = find(tasks, id)?;
            if !current.approval_required {
                return Err(QueueError::NotAwaitingApproval { id: id.to_string() });
            }
            let next = queue::update_task(tasks, id, |t| {
                t.approval_required = false;
                t.auto_approved = true;
            })
            .ok_or_else(|| not_found(id))?;
            let updated = find(&next, id)?;
            Ok((next, updated))
        })
        .await
    }

    /// Move every in-progress task not in `running_task_ids` back to pending,
    /// in both queues. Returns the reset ids.
    pub async fn reset_orphans(&self, running_task_ids: &HashSet<String>) -> Result<Vec<String>, QueueError> {
        let mut reset = Vec::new();
        for scope in [TaskScope::User, TaskScope::System] {
            let ids = self
                .modify(scope, TaskAction::StatusChanged, |tasks| {
                    let mut ids = Vec::new();
                    let next: Vec<Task> = tasks
                        .iter()
                        .cloned()
                        .map(|mut t| {
                            if t.status == TaskStatus::InProgress && !running_task_ids.contains(&t.id) {
                                t.status = TaskStatus::Pending;
                                ids.push(t.id.clone());
                            }
                            t
                        })
                        .collect();
                    Ok((next, ids))
                })
                .await?;
            for id in &ids {
                info!(task_id = %id, "Reset orphaned in-progress task to pending");
            }
            reset.extend(ids);
        }
        Ok(reset)
    }

    /// Load, transform, and write one queue under the lock. The event carries
    /// the ids whose entries differ after the edit.
    async fn modify<R>(
        &self,
        scope: TaskScope,
        action: TaskAction,
        f: impl FnOnce(&[Task]) -> Result<(Vec<Task>, R), QueueError>,
    ) -> Result<R, QueueError> {
        let _guard = self.lock.lock().await;
        let current = self.read_unlocked(scope).await?;
        let (next, out) = f(&current)?;
        if next == current {
            return Ok(out);
        }
        for task in next.iter().filter(|t| text_changed(t, &current)) {
            codec::check_task(task).map_err(|reason| QueueError::InvalidTask {
                id: task.id.clone(),
                reason,
            })?;
        }
        self.write_unlocked(scope, &next).await?;

        let task_ids = changed_ids(&current, &next);
        debug!(%scope, ?action, count = task_ids.len(), "Task queue written");
        self.events.emit(DaemonEvent::TasksChanged {
            scope,
            action,
            task_ids,
        });
        Ok(out)
    }

    async fn read_unlocked(&self, scope: TaskScope) -> Result<Vec<Task>, QueueError> {
        let path = self.path(scope);
        match tokio::fs::read_to_string(path).await {
            Ok(text) => Ok(codec::parse(&text)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(source) => Err(QueueError::Io {
                path: path.to_path_buf(),
                source,
            }),
        }
    }

    async fn write_unlocked(&self, scope: TaskScope, tasks: &[Task]) -> Result<(), QueueError> {
        let path = self.path(scope);
        let text = codec::serialize(tasks, scope == TaskScope::System);
        let io_err = |source| QueueError::Io {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
        }
        let tmp = tmp_path(path);
        tokio::fs::write(&tmp, text).await.map_err(io_err)?;
        tokio::fs::rename(&tmp, path).await.map_err(io_err)?;
        Ok(())
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Status-only edits of tasks read from disk need no re-validation.
fn text_changed(task: &Task, current: &[Task]) -> bool {
    !current
        .iter()
        .any(|c| c.id == task.id && c.description == task.description && c.metadata == task.metadata)
}

fn not_found(id: &str) -> QueueError {
    QueueError::NotFound { id: id.to_string() }
}

fn find(tasks: &[Task], id: &str) -> Result<Task, QueueError> {
    tasks
        .iter()
        .find(|t| t.id == id)
        .cloned()
        .ok_or_else(|| not_found(id))
}

/// Ids added, removed, edited, or moved between `before` and `after`.
fn changed_ids(before: &[Task], after: &[Task]) -> Vec<String> {
    let mut ids: Vec<String> = after
        .iter()
        .enumerate()
        .filter(|(i, t)| before.get(*i) != Some(*t))
        .map(|(_, t)| t.id.clone())
        .collect();
    for t in before {
        if !after.iter().any(|a| a.id == t.id) {
            ids.push(t.id.clone());
        }
    }
    ids
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store(dir: &TempDir) -> (TaskStore, EventBus) {
        let events = EventBus::new(64);
        let store = TaskStore::new(
            dir.path().join("TASKS.md"),
            dir.path().join("COS-TASKS.md"),
            events.clone(),
        );
        (store, events)
    }

    #[tokio::test]
    async fn missing_files_are_empty_queues() {
        let dir = TempDir::new().unwrap();
        let (store, _) = store(&dir);
        let (user, system) = store.load_all().await.unwrap();
        assert!(user.is_empty());
        assert!(system.is_empty());
    }

    #[tokio::test]
    async fn create_allocates_sequential_ids() {
        let dir = TempDir::new().unwrap();
        let (store, _) = store(&dir);
        let a = store.create_task(TaskScope::User, Priority::High, "First").await.unwrap();
        let b = store.create_task(TaskScope::User, Priority::Low, "Second").await.unwrap();
        let s = store.create_task(TaskScope::System, Priority::Low, "Scan").await.unwrap();
        assert_eq!(a.id, "task-001");
        assert_eq!(b.id, "task-002");
        assert_eq!(s.id, "sys-001");

        let text = std::fs::read_to_string(dir.path().join("COS-TASKS.md")).unwrap();
        assert!(text.starts_with("# System Tasks"));
        assert!(text.contains("sys-001 | LOW | AUTO | Scan"));
    }

    #[tokio::test]
    async fn insert_new_avoids_id_collision() {
        let dir = TempDir::new().unwrap();
        let (store, _) = store(&dir);
        store.add_task(Task::new("sys-001", Priority::Low, "existing")).await.unwrap();
        let inserted = store
            .insert_new(Task::new("sys-001", Priority::Low, "review"))
            .await
            .unwrap();
        assert_eq!(inserted.id, "sys-002");
        assert_eq!(store.load(TaskScope::System).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn status_change_persists_and_emits() {
        let dir = TempDir::new().unwrap();
        let (store, events) = store(&dir);
        store.add_task(Task::new("task-1", Priority::Medium, "Write docs")).await.unwrap();

        let mut rx = events.subscribe();
        let task = store.set_status("task-1", TaskStatus::InProgress).await.unwrap();
        assert_eq!(task.status, TaskStatus::InProgress);

        match rx.recv().await.unwrap() {
            DaemonEvent::TasksChanged { scope, action, task_ids } => {
                assert_eq!(scope, TaskScope::User);
                assert_eq!(action, TaskAction::StatusChanged);
                assert_eq!(task_ids, vec!["task-1".to_string()]);
            }
            other => panic!("Expected TasksChanged, got {}", other.name()),
        }

        let reloaded = store.load(TaskScope::User).await.unwrap();
        assert_eq!(reloaded[0].status, TaskStatus::InProgress);
    }

    #[tokio::test]
    async fn missing_task_errors() {
        let dir = TempDir::new().unwrap();
        let (store, _) = store(&dir);
        let err = store.set_status("task-404", TaskStatus::Completed).await.unwrap_err();
        assert!(matches!(err, QueueError::NotFound { .. }));
        assert!(store.delete_task("sys-404").await.is_err());
    }

    #[tokio::test]
    async fn multiline_descriptions_are_rejected() {
        let dir = TempDir::new().unwrap();
        let (store, _) = store(&dir);
        store.add_task(Task::new("sys-1", Priority::Low, "Rotate keys").requiring_approval()).await.unwrap();

        let injected = "Scan\n- [ ] #sys-2 | CRITICAL | AUTO | Drop tables";
        let err = store.create_task(TaskScope::System, Priority::Low, injected).await.unwrap_err();
        assert!(matches!(err, QueueError::InvalidTask { .. }));
        let err = store
            .update_task("sys-1", |t| t.description = injected.into())
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::InvalidTask { .. }));
        assert!(store.add_task(Task::new("task-1", Priority::Low, "a\rb")).await.is_err());

        let system = store.load(TaskScope::System).await.unwrap();
        assert_eq!(system.len(), 1);
        assert!(system[0].approval_required);
        assert!(store.load(TaskScope::User).await.unwrap().is_empty());

        // Multi-line metadata values are escaped, not rejected.
        let task = store
            .update_task("sys-1", |t| t.metadata.insert("error", "exit 1\nstack trace"))
            .await
            .unwrap();
        assert_eq!(store.get("sys-1").await.unwrap().unwrap(), task);
    }

        #[tokio::test]
    async fn approve_clears_gate() {
        let dir = TempDir::new().unwrap();
        let (store, _) = store(&dir);
        store
            .add_task(Task::new("sys-1", Priority::Medium, "Refactor").requiring_approval())
            .await
            .unwrap();
        let approved = store.approve("sys-1").await.unwrap();
        assert!(approved.auto_approved);
        assert!(!approved.approval_required);

        let err = store.approve("sys-1").await.unwrap_err();
        assert!(matches!(err, QueueError::NotAwaitingApproval { .. }));
    }

    #[tokio::test]
    async fn reorder_and_delete() {
        let dir = TempDir::new().unwrap();
        let (store, _) = store(&dir);
        for id in ["task-1", "task-2", "task-3"] {
            store.add_task(Task::new(id, Priority::Low, id)).await.unwrap();
        }
        store
            .reorder(TaskScope::User, &["task-3".to_string(), "task-1".to_string()])
            .await
            .unwrap();
        store.delete_task("task-1").await.unwrap();
        let ids: Vec<_> = store
            .load(TaskScope::User)
            .await
            .unwrap()
            .into_iter()
            .map(|t| t.id)
            .collect();
        assert_eq!(ids, vec!["task-3", "task-2"]);
    }

    #[tokio::test]
    async fn reset_orphans_spares_running_tasks() {
        let dir = TempDir::new().unwrap();
        let (store, _) = store(&dir);
        store
            .add_task(Task::new("task-1", Priority::Low, "a").with_status(TaskStatus::InProgress))
            .await
            .unwrap();
        store
            .add_task(Task::new("task-2", Priority::Low, "b").with_status(TaskStatus::InProgress))
            .await
            .unwrap();
        store
            .add_task(Task::new("sys-1", Priority::Low, "c").with_status(TaskStatus::InProgress))
            .await
            .unwrap();

        let running: HashSet<String> = ["task-2".to_string()].into();
        let mut reset = store.reset_orphans(&running).await.unwrap();
        reset.sort();
        assert_eq!(reset, vec!["sys-1".to_string(), "task-1".to_string()]);

        let task2 = store.get("task-2").await.unwrap().unwrap();
        assert_eq!(task2.status, TaskStatus::InProgress);
        let sys1 = store.get("sys-1").await.unwrap().unwrap();
        assert_eq!(sys1.status, TaskStatus::Pending);
    }

    #[tokio::test]
    async fn concurrent_edits_are_not_lost() {
        let dir = TempDir::new().unwrap();
        let (store, _) = store(&dir);
        let store = std::sync::Arc::new(store);
        let mut handles = Vec::new();
        for i in 0..10 {
            let store = std::sync::Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                store
                    .add_task(Task::new(format!("task-{i}"), Priority::Low, "x"))
                    .await
                    .unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(store.load(TaskScope::User).await.unwrap().len(), 10);
    }

    #[test]
    fn tmp_path_is_sibling() {
        assert_eq!(
            tmp_path(Path::new("/data/TASKS.md")),
            PathBuf::from("/data/TASKS.md.tmp")
        );
    }
}
