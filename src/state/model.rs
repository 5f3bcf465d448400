//! Daemon state snapshot: agents, stats, config, scheduling clocks.

use std::collections::{BTreeMap, HashSet};
use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::DaemonConfig;

/// Live output lines kept per agent in the snapshot.
pub const MAX_LIVE_OUTPUT: usize = 1000;

/// Agent lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Running,
    Completed,
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Running => f.write_str("running"),
            Self::Completed => f.write_str("completed"),
        }
    }
}

/// One captured output line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputLine {
    pub timestamp: DateTime<Utc>,
    pub line: String,
}

impl OutputLine {
    pub fn now(line: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            line: line.into(),
        }
    }
}

/// Outcome of an agent run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AgentResult {
    pub fn ok() -> Self {
        Self {
            success: true,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
        }
    }
}

/// A tracked external work process executing exactly one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Agent {
    pub id: String,
    pub task_id: String,
    pub status: AgentStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    /// OS process id. Absent on records written before pids were tracked.
    #[serde(default)]
    pub pid: Option<u32>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    #[serde(default)]
    pub result: Option<AgentResult>,
    #[serde(default)]
    pub output: Vec<OutputLine>,
}

impl Agent {
    pub fn new(task_id: impl Into<String>, pid: Option<u32>) -> Self {
        Self {
            id: format!("agent-{}", Uuid::new_v4().simple()),
            task_id: task_id.into(),
            status: AgentStatus::Running,
            started_at: Utc::now(),
            completed_at: None,
            pid,
            metadata: BTreeMap::new(),
            result: None,
            output: Vec::new(),
        }
    }

    pub fn is_running(&self) -> bool {
        self.status == AgentStatus::Running
    }

    /// Close the record.
    pub fn finish(&mut self, result: AgentResult) {
        self.status = AgentStatus::Completed;
        self.completed_at = Some(Utc::now());
        self.result = Some(result);
    }
}

/// Severity of a health issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IssueSeverity {
    /// Soft threshold exceeded.
    Warning,
    /// Hard failure.
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthIssueKind {
    HighProcessCount,
    HighMemory,
    ProcessCrashed,
    MetricsUnavailable,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthIssue {
    pub severity: IssueSeverity,
    pub kind: HealthIssueKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub process: Option<String>,
}

impl HealthIssue {
    pub fn warning(kind: HealthIssueKind, message: impl Into<String>) -> Self {
        Self {
            severity: IssueSeverity::Warning,
            kind,
            message: message.into(),
            process: None,
        }
    }

    pub fn error(kind: HealthIssueKind, message: impl Into<String>) -> Self {
        Self {
            severity: IssueSeverity::Error,
            kind,
            message: message.into(),
            process: None,
        }
    }

    pub fn for_process(mut self, name: impl Into<String>) -> Self {
        self.process = Some(name.into());
        self
    }

    pub fn is_error(&self) -> bool {
        self.severity == IssueSeverity::Error
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Stats {
    pub tasks_completed: u64,
    pub agents_spawned: u64,
    pub last_evaluation: Option<DateTime<Utc>>,
    pub last_health_check: Option<DateTime<Utc>>,
    pub health_issues: Vec<HealthIssue>,
}

/// The single authoritative daemon snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DaemonState {
    pub running: bool,
    pub paused: bool,
    pub paused_at: Option<DateTime<Utc>>,
    pub pause_reason: Option<String>,
    pub config: DaemonConfig,
    pub stats: Stats,
    pub agents: BTreeMap<String, Agent>,
    /// Target → when work last began against it.
    pub target_activity: BTreeMap<String, DateTime<Utc>>,
    /// Target → when it was last idle-reviewed.
    pub review_history: BTreeMap<String, DateTime<Utc>>,
    /// Task id → when `task:ready` went out, until an agent registers.
    pub dispatched: BTreeMap<String, DateTime<Utc>>,
}

impl DaemonState {
    pub fn running_agents(&self) -> impl Iterator<Item = &Agent> {
        self.agents.values().filter(|a| a.is_running())
    }

    pub fn running_count(&self) -> usize {
        self.running_agents().count()
    }

    pub fn running_task_ids(&self) -> HashSet<String> {
        self.running_agents().map(|a| a.task_id.clone()).collect()
    }

    /// Whether `target` is inside its cooldown window at `now`.
    pub fn on_cooldown(&self, target: &str, now: DateTime<Utc>) -> bool {
        self.target_activity
            .get(target)
            .is_some_and(|last| now - *last < self.config.cooldown())
    }

    /// Drop dispatches older than `timeout`. Returns the dropped task ids.
    pub fn prune_dispatched(&mut self, now: DateTime<Utc>, timeout: Duration) -> Vec<String> {
        let expired: Vec<String> = self
            .dispatched
            .iter()
            .filter(|(_, at)| now - **at >= timeout)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &expired {
            self.dispatched.remove(id);
        }
        expired
    }

    /// Slots left once running agents and pending dispatches are counted.
    pub fn available_slots(&self) -> usize {
        self.config
            .max_concurrent_agents
            .saturating_sub(self.running_count() + self.dispatched.len())
    }
}
