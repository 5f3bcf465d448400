//! Agent registry.
//!
//! Agent records live in the daemon state snapshot. Output is buffered in
//! memory: a bounded live tail that is copied into the snapshot on each
//! health tick, and the full stream that is written to
//! `agent-logs/<agent-id>.log` (JSON lines) when the agent completes.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::process;
use super::runner::AgentRunner;
use crate::error::AgentError;
use crate::events::{DaemonEvent, EventBus};
use crate::state::model::{Agent, AgentResult, MAX_LIVE_OUTPUT, OutputLine};
use crate::state::store::StateStore;

/// Result error recorded for agents whose process vanished across a restart.
pub const ORPHANED_ERROR: &str = "orphaned (restart)";
/// Result error recorded when an agent is forcibly killed.
pub const FORCED_ERROR: &str = "terminated (forced)";

/// Outcome of a zombie sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ZombieCleanup {
    /// Running records examined.
    pub checked: usize,
    /// Agent ids marked completed.
    pub cleaned: Vec<String>,
}

#[derive(Debug, Default)]
struct OutputBuffer {
    live: VecDeque<OutputLine>,
    full: Vec<OutputLine>,
    dirty: bool,
}

pub struct AgentRegistry {
    state: Arc<StateStore>,
    events: EventBus,
    log_dir: PathBuf,
    buffers: Mutex<HashMap<String, OutputBuffer>>,
}

impl AgentRegistry {
    pub fn new(state: Arc<StateStore>, events: EventBus, log_dir: impl Into<PathBuf>) -> Self {
        Self {
            state,
            events,
            log_dir: log_dir.into(),
            buffers: Mutex::new(HashMap::new()),
        }
    }

    fn buffers(&self) -> MutexGuard<'_, HashMap<String, OutputBuffer>> {
        self.buffers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record a freshly spawned agent for `task_id`. Frees the dispatch slot
    /// the task was holding.
    pub async fn register(
        &self,
        task_id: &str,
        pid: Option<u32>,
        metadata: BTreeMap<String, String>,
    ) -> Result<Agent, AgentError> {
        let mut agent = Agent::new(task_id, pid);
        agent.metadata = metadata;
        let saved = agent.clone();

        self.state
            .update(move |s| {
                s.dispatched.remove(&agent.task_id);
                s.stats.agents_spawned += 1;
                s.agents.insert(agent.id.clone(), agent);
            })
            .await?;
        self.buffers().insert(saved.id.clone(), OutputBuffer::default());

        info!(agent_id = %saved.id, task_id, ?pid, "Agent registered");
        self.events.emit(DaemonEvent::AgentSpawned {
            agent: saved.clone(),
        });
        self.events.emit(DaemonEvent::AgentsChanged {
            action: "spawned".into(),
            agent_ids: vec![saved.id.clone()],
        });
        Ok(saved)
    }

    /// Attach a pid to an agent registered before its process started.
    pub async fn set_pid(&self, agent_id: &str, pid: u32) -> Result<Agent, AgentError> {
        let agent = self
            .state
            .try_update(|s| {
                let agent = running_mut(&mut s.agents, agent_id)?;
                agent.pid = Some(pid);
                Ok::<_, AgentError>(agent.clone())
            })
            .await?;
        debug!(agent_id, pid, "Agent pid recorded");
        self.events.emit(DaemonEvent::AgentUpdated {
            agent: agent.clone(),
        });
        Ok(agent)
    }

    /// Buffer one output line and publish it. Never touches disk. Lines for
    /// agents that are not running are dropped.
    pub fn append_output(&self, agent_id: &str, line: impl Into<String>) {
        let line = OutputLine::now(line);
        {
            let mut buffers = self.buffers();
            let Some(buffer) = buffers.get_mut(agent_id) else {
                debug!(agent_id, "Dropping output for unknown or finished agent");
                return;
            };
            if buffer.live.len() >= MAX_LIVE_OUTPUT {
                buffer.live.pop_front();
            }
            buffer.live.push_back(line.clone());
            buffer.full.push(line.clone());
            buffer.dirty = true;
        }
        self.events.emit(DaemonEvent::AgentOutput {
            agent_id: agent_id.to_string(),
            line,
        });
    }

    /// Copy changed live buffers into the snapshot. Returns how many agents
    /// were flushed.
    pub async fn flush_output(&self) -> Result<usize, AgentError> {
        let pending: Vec<(String, Vec<OutputLine>)> = {
            let mut buffers = self.buffers();
            buffers
                .iter_mut()
                .filter(|(_, b)| b.dirty)
                .map(|(id, b)| {
                    b.dirty = false;
                    (id.clone(), b.live.iter().cloned().collect())
                })
                .collect()
        };
        if pending.is_empty() {
            return Ok(0);
        }

        let flushed = self
            .state
            .update(|s| {
                let mut flushed = 0;
                for (id, lines) in pending {
                    if let Some(agent) = s.agents.get_mut(&id) {
                        agent.output = lines;
                        flushed += 1;
                    }
                }
                flushed
            })
            .await?;
        debug!(flushed, "Agent output flushed");
        Ok(flushed)
    }

    /// Close a running agent with `result` and write its full log.
    pub async fn complete(&self, agent_id: &str, result: AgentResult) -> Result<Agent, AgentError> {
        let live: Option<Vec<OutputLine>> = self
            .buffers()
            .get(agent_id)
            .map(|b| b.live.iter().cloned().collect());

        let outcome = result.clone();
        let agent = self
            .state
            .try_update(move |s| {
                let agent = running_mut(&mut s.agents, agent_id)?;
                if let Some(live) = live {
                    agent.output = live;
                }
                agent.finish(outcome);
                let agent = agent.clone();
                if result.success {
                    s.stats.tasks_completed += 1;
                }
                Ok::<_, AgentError>(agent)
            })
            .await?;

        let full = self.buffers().remove(agent_id).map(|b| b.full);
        self.write_log(&agent, full.as_deref()).await;

        let result = agent.result.clone().unwrap_or_else(AgentResult::ok);
        if result.success {
            info!(agent_id, task_id = %agent.task_id, "Agent completed");
        } else {
            warn!(agent_id, task_id = %agent.task_id, error = ?result.error, "Agent failed");
        }
        self.events.emit(DaemonEvent::AgentCompleted {
            agent_id: agent.id.clone(),
            task_id: agent.task_id.clone(),
            result,
        });
        self.events.emit(DaemonEvent::AgentUpdated {
            agent: agent.clone(),
        });
        Ok(agent)
    }

    /// Publish a cooperative stop request for the runner.
    pub async fn terminate(&self, agent_id: &str) -> Result<Agent, AgentError> {
        let agent = self.running(agent_id).await?;
        info!(agent_id, pid = ?agent.pid, "Requesting agent termination");
        self.events.emit(DaemonEvent::AgentTerminate {
            agent_id: agent.id.clone(),
            pid: agent.pid,
        });
        Ok(agent)
    }

    /// Force-stop an agent through `runner` and record it as forcibly
    /// terminated. A failed signal is logged; the record is closed anyway.
    pub async fn kill(&self, agent_id: &str, runner: &dyn AgentRunner) -> Result<Agent, AgentError> {
        let agent = self.running(agent_id).await?;
        if let Err(e) = runner.kill(agent_id, agent.pid).await {
            warn!(agent_id, error = %e, "Kill signal failed");
        }
        self.complete(agent_id, AgentResult::failed(FORCED_ERROR)).await
    }

    /// Close every running record whose process is gone. Records with a pid
    /// are probed at the OS; records without one ask `runner`.
    pub async fn cleanup_zombies(&self, runner: &dyn AgentRunner) -> Result<ZombieCleanup, AgentError> {
        let state = self.state.load().await?;
        let mut dead = Vec::new();
        let mut checked = 0;
        for agent in state.running_agents() {
            checked += 1;
            let alive = match agent.pid {
                Some(pid) => process::is_alive(pid),
                None => runner.is_active(&agent.id).await,
            };
            if alive {
                self.adopt(agent);
            } else {
                dead.push(agent.id.clone());
            }
        }
        if dead.is_empty() {
            return Ok(ZombieCleanup {
                checked,
                cleaned: Vec::new(),
            });
        }

        let closed = self
            .state
            .update(|s| {
                let mut closed = Vec::new();
                for id in &dead {
                    if let Some(agent) = s.agents.get_mut(id) {
                        if agent.is_running() {
                            agent.finish(AgentResult::failed(ORPHANED_ERROR));
                            closed.push(agent.clone());
                        }
                    }
                }
                closed
            })
            .await?;

        for agent in &closed {
            warn!(agent_id = %agent.id, task_id = %agent.task_id, pid = ?agent.pid, "Cleaned up zombie agent");
            let full = self.buffers().remove(&agent.id).map(|b| b.full);
            self.write_log(agent, full.as_deref()).await;
        }

        let cleaned: Vec<String> = closed.into_iter().map(|a| a.id).collect();
        self.events.emit(DaemonEvent::AgentsChanged {
            action: "zombies_cleaned".into(),
            agent_ids: cleaned.clone(),
        });
        Ok(ZombieCleanup { checked, cleaned })
    }

    /// Resume buffering for a running agent registered by an earlier
    /// process, seeded with the tail already in the snapshot.
    fn adopt(&self, agent: &Agent) {
        self.buffers().entry(agent.id.clone()).or_insert_with(|| OutputBuffer {
            live: agent.output.iter().cloned().collect(),
            full: agent.output.clone(),
            dirty: false,
        });
    }

    pub async fn get(&self, agent_id: &str) -> Result<Option<Agent>, AgentError> {
        Ok(self.state.load().await?.agents.get(agent_id).cloned())
    }

    pub async fn list(&self) -> Result<Vec<Agent>, AgentError> {
        Ok(self.state.load().await?.agents.into_values().collect())
    }

    pub async fn list_running(&self) -> Result<Vec<Agent>, AgentError> {
        Ok(self
            .state
            .load()
            .await?
            .agents
            .into_values()
            .filter(Agent::is_running)
            .collect())
    }

    /// Full output for an agent: the in-memory stream while it runs, then
    /// its log file, then whatever tail the snapshot holds.
    pub async fn output(&self, agent_id: &str) -> Result<Vec<OutputLine>, AgentError> {
        let buffered = self.buffers().get(agent_id).map(|b| b.full.clone());
        if let Some(full) = buffered {
            return Ok(full);
        }
        let agent = self
            .get(agent_id)
            .await?
            .ok_or_else(|| AgentError::NotFound {
                id: agent_id.to_string(),
            })?;
        match tokio::fs::read_to_string(self.log_path(agent_id)).await {
            Ok(text) => Ok(text
                .lines()
                .filter_map(|l| serde_json::from_str(l).ok())
                .collect()),
            Err(_) => Ok(agent.output),
        }
    }

    /// Drop completed records from the snapshot. Returns how many went.
    pub async fn clear_completed(&self) -> Result<usize, AgentError> {
        let removed = self
            .state
            .update(|s| {
                let ids: Vec<String> = s
                    .agents
                    .values()
                    .filter(|a| !a.is_running())
                    .map(|a| a.id.clone())
                    .collect();
                for id in &ids {
                    s.agents.remove(id);
                }
                ids
            })
            .await?;
        {
            let mut buffers = self.buffers();
            for id in &removed {
                buffers.remove(id);
            }
        }
        if !removed.is_empty() {
            info!(count = removed.len(), "Cleared completed agents");
            self.events.emit(DaemonEvent::AgentsChanged {
                action: "cleared".into(),
                agent_ids: removed.clone(),
            });
        }
        Ok(removed.len())
    }

    pub fn log_path(&self, agent_id: &str) -> PathBuf {
        self.log_dir.join(format!("{agent_id}.log"))
    }

    async fn running(&self, agent_id: &str) -> Result<Agent, AgentError> {
        let agent = self.get(agent_id).await?.ok_or_else(|| AgentError::NotFound {
            id: agent_id.to_string(),
        })?;
        if !agent.is_running() {
            return Err(AgentError::NotRunning {
                id: agent_id.to_string(),
            });
        }
        Ok(agent)
    }

    /// Best effort: a failed log write is reported, never propagated.
    async fn write_log(&self, agent: &Agent, full: Option<&[OutputLine]>) {
        let lines = full.unwrap_or(&agent.output);
        if let Err(e) = self.try_write_log(&agent.id, lines).await {
            warn!(agent_id = %agent.id, error = %e, "Failed to write agent log");
        }
    }

    async fn try_write_log(&self, agent_id: &str, lines: &[OutputLine]) -> Result<(), AgentError> {
        let log_err = |source| AgentError::Log {
            id: agent_id.to_string(),
            source,
        };
        tokio::fs::create_dir_all(&self.log_dir).await.map_err(log_err)?;
        let mut text = String::new();
        for line in lines {
            if let Ok(json) = serde_json::to_string(line) {
                text.push_str(&json);
                text.push('\n');
            }
        }
        tokio::fs::write(self.log_path(agent_id), text)
            .await
            .map_err(log_err)
    }
}

fn running_mut<'a>(agents: &'a mut BTreeMap<String, Agent>, id: &str) -> Result<&'a mut Agent, AgentError> {
    let agent = agents.get_mut(id).ok_or_else(|| AgentError::NotFound { id: id.to_string() })?;
    if !agent.is_running() {
        return Err(AgentError::NotRunning { id: id.to_string() });
    }
    Ok(agent)
}
