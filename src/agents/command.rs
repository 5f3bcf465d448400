//! Shell-command agent runner.
//!
//! Listens for `task:ready`, runs the configured command once per task with
//! the task passed through environment variables, streams its output into
//! the registry, and closes both the agent record and the task when the
//! process exits.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::RwLock;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::process;
use super::registry::AgentRegistry;
use super::runner::AgentRunner;
use crate::error::AgentError;
use crate::events::{DaemonEvent, EventBus};
use crate::state::model::AgentResult;
use crate::tasks::model::{Task, TaskStatus};
use crate::tasks::store::TaskStore;

pub struct CommandRunner {
    command: String,
    workdir: PathBuf,
    registry: Arc<AgentRegistry>,
    tasks: Arc<TaskStore>,
    /// Agent id → pid for processes this runner owns.
    active: RwLock<HashMap<String, Option<u32>>>,
}

impl CommandRunner {
    pub fn new(
        command: impl Into<String>,
        workdir: impl Into<PathBuf>,
        registry: Arc<AgentRegistry>,
        tasks: Arc<TaskStore>,
    ) -> Arc<Self> {
        Arc::new(Self {
            command: command.into(),
            workdir: workdir.into(),
            registry,
            tasks,
            active: RwLock::new(HashMap::new()),
        })
    }

    /// Consume daemon events until the bus closes.
    pub fn spawn_listener(self: &Arc<Self>, events: &EventBus) -> JoinHandle<()> {
        let mut rx = events.subscribe();
        let runner = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(DaemonEvent::TaskReady { task }) => {
                        let runner = Arc::clone(&runner);
                        tokio::spawn(async move { runner.run_task(task).await });
                    }
                    Ok(DaemonEvent::AgentTerminate { agent_id, pid }) => {
                        runner.request_stop(&agent_id, pid).await;
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Agent runner fell behind the event bus");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            debug!("Agent runner listener stopped");
        })
    }

    /// Run one task to completion.
    async fn run_task(self: Arc<Self>, task: Task) {
        let mut command = Command::new("sh");
        command
            .args(["-c", &self.command])
            .current_dir(&self.workdir)
            .env("COS_TASK_ID", &task.id)
            .env("COS_TASK_PRIORITY", task.priority.as_str())
            .env("COS_TASK_DESCRIPTION", &task.description)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(target) = task.target() {
            command.env("COS_TASK_TARGET", target);
        }

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                let err = AgentError::SpawnFailed {
                    task_id: task.id.clone(),
                    reason: e.to_string(),
                };
                error!(task_id = %task.id, error = %err, "Agent spawn failed");
                self.close_task(&task.id, &AgentResult::failed(err.to_string())).await;
                return;
            }
        };
        let pid = child.id();

        let mut metadata = BTreeMap::new();
        metadata.insert("command".to_string(), self.command.clone());
        if let Some(target) = task.target() {
            metadata.insert("target".to_string(), target.to_string());
        }
        let agent = match self.registry.register(&task.id, pid, metadata).await {
            Ok(agent) => agent,
            Err(e) => {
                error!(task_id = %task.id, error = %e, "Agent registration failed, killing process");
                let _ = child.kill().await;
                self.close_task(&task.id, &AgentResult::failed(e.to_string())).await;
                return;
            }
        };
        self.active.write().await.insert(agent.id.clone(), pid);
        info!(agent_id = %agent.id, task_id = %task.id, ?pid, "Agent process started");

        let readers: Vec<JoinHandle<()>> = [
            child.stdout.take().map(|out| self.spawn_reader(&agent.id, out, "")),
            child.stderr.take().map(|err| self.spawn_reader(&agent.id, err, "[stderr] ")),
        ]
        .into_iter()
        .flatten()
        .collect();

        let status = child.wait().await;
        for reader in readers {
            let _ = reader.await;
        }
        self.active.write().await.remove(&agent.id);

        let result = match status {
            Ok(status) if status.success() => AgentResult::ok(),
            Ok(status) => AgentResult::failed(format!("agent process {status}")),
            Err(e) => AgentResult::failed(format!("failed waiting on agent process: {e}")),
        };

        match self.registry.complete(&agent.id, result.clone()).await {
            Ok(_) => {}
            Err(AgentError::NotRunning { .. }) => {
                debug!(agent_id = %agent.id, "Agent already closed");
            }
            Err(e) => warn!(agent_id = %agent.id, error = %e, "Failed to record agent completion"),
        }
        self.close_task(&task.id, &result).await;
    }

    fn spawn_reader<R>(&self, agent_id: &str, reader: R, prefix: &'static str) -> JoinHandle<()>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let registry = Arc::clone(&self.registry);
        let agent_id = agent_id.to_string();
        tokio::spawn(async move {
            let mut lines = BufReader::new(reader).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                registry.append_output(&agent_id, format!("{prefix}{line}"));
            }
        })
    }

    /// Completed on success, blocked with the error recorded otherwise.
    async fn close_task(&self, task_id: &str, result: &AgentResult) {
        let status = if result.success {
            TaskStatus::Completed
        } else {
            TaskStatus::Blocked
        };
        let error = result.error.clone();
        let update = self
            .tasks
            .update_task(task_id, move |t| {
                t.status = status;
                match error {
                    Some(error) => t.metadata.insert("error", error),
                    None => {
                        t.metadata.remove("error");
                    }
                }
            })
            .await;
        if let Err(e) = update {
            warn!(task_id, error = %e, "Failed to update task after agent exit");
        }
    }

    /// Cooperative stop: SIGTERM to a process this runner owns.
    async fn request_stop(&self, agent_id: &str, pid: Option<u32>) {
        let Some(owned_pid) = self.active.read().await.get(agent_id).copied() else {
            return;
        };
        let Some(pid) = owned_pid.or(pid) else {
            warn!(agent_id, "Cannot stop agent without a pid");
            return;
        };
        match process::terminate(pid) {
            Ok(()) => info!(agent_id, pid, "Sent SIGTERM to agent"),
            Err(e) => warn!(agent_id, pid, error = %e, "SIGTERM failed"),
        }
    }
}

#[async_trait]
impl AgentRunner for CommandRunner {
    async fn is_active(&self, agent_id: &str) -> bool {
        self.active.read().await.contains_key(agent_id)
    }

    async fn kill(&self, agent_id: &str, pid: Option<u32>) -> Result<(), AgentError> {
        let owned = self.active.read().await.get(agent_id).copied().flatten();
        let Some(pid) = owned.or(pid) else {
            debug!(agent_id, "No pid to kill");
            return Ok(());
        };
        process::kill(pid).map_err(|e| AgentError::SignalFailed {
            id: agent_id.to_string(),
            reason: e.to_string(),
        })
    }
}
