//! Event bus: typed daemon events fanned out over a broadcast channel.
//!
//! Every notification the daemon publishes is a [`DaemonEvent`] variant.
//! Subscribers (the agent runner, the notification layer, log forwarders)
//! each hold their own receiver; sending never blocks and is fine with no
//! receivers attached.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

use crate::config::DaemonConfig;
use crate::state::model::{Agent, AgentResult, HealthIssue, OutputLine};
use crate::tasks::model::{Task, TaskScope};

/// Default broadcast channel capacity.
const DEFAULT_CAPACITY: usize = 1024;

/// Severity of a `log` event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
    Success,
    Debug,
}

/// What happened to a queue file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskAction {
    Added,
    Updated,
    Deleted,
    Reordered,
    Approved,
    StatusChanged,
}

/// Why an evaluation tick did no work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    Paused,
    AtCapacity,
    NothingEligible,
}

/// Summary of one evaluation tick.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluationSummary {
    pub at: Option<DateTime<Utc>>,
    pub available_slots: usize,
    /// Task ids that received `task:ready`.
    pub dispatched: Vec<String>,
    /// Task ids passed over because their target is cooling down.
    pub skipped_cooldown: Vec<String>,
    /// Target of a synthesized idle review, if one was generated.
    pub idle_review: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skipped: Option<SkipReason>,
}

/// Everything the daemon publishes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum DaemonEvent {
    /// A task was selected; the agent runner should spawn it.
    #[serde(rename = "task:ready")]
    TaskReady { task: Task },

    #[serde(rename = "evaluation")]
    Evaluation { summary: EvaluationSummary },

    #[serde(rename = "agent:spawned")]
    AgentSpawned { agent: Agent },

    #[serde(rename = "agent:updated")]
    AgentUpdated { agent: Agent },

    #[serde(rename = "agent:output")]
    AgentOutput { agent_id: String, line: OutputLine },

    #[serde(rename = "agent:completed")]
    AgentCompleted {
        agent_id: String,
        task_id: String,
        result: AgentResult,
    },

    /// Cooperative stop request for the runner.
    #[serde(rename = "agent:terminate")]
    AgentTerminate { agent_id: String, pid: Option<u32> },

    /// Bulk change (registration, cleanup, clearing).
    #[serde(rename = "agents:changed")]
    AgentsChanged { action: String, agent_ids: Vec<String> },

    #[serde(rename = "health:check")]
    HealthCheck {
        issues: Vec<HealthIssue>,
        process_count: usize,
    },

    #[serde(rename = "health:critical")]
    HealthCritical { issues: Vec<HealthIssue> },

    #[serde(rename = "status")]
    Status { running: bool, paused: bool },

    #[serde(rename = "status:paused")]
    StatusPaused {
        reason: Option<String>,
        paused_at: DateTime<Utc>,
    },

    #[serde(rename = "status:resumed")]
    StatusResumed,

    #[serde(rename = "tasks:changed")]
    TasksChanged {
        scope: TaskScope,
        action: TaskAction,
        task_ids: Vec<String>,
    },

    #[serde(rename = "config:changed")]
    ConfigChanged { config: DaemonConfig },

    #[serde(rename = "log")]
    Log {
        level: LogLevel,
        message: String,
        timestamp: DateTime<Utc>,
    },
}

impl DaemonEvent {
    /// Wire name of the event (matches the serde tag).
    pub fn name(&self) -> &'static str {
        match self {
            Self::TaskReady { .. } => "task:ready",
            Self::Evaluation { .. } => "evaluation",
            Self::AgentSpawned { .. } => "agent:spawned",
            Self::AgentUpdated { .. } => "agent:updated",
            Self::AgentOutput { .. } => "agent:output",
            Self::AgentCompleted { .. } => "agent:completed",
            Self::AgentTerminate { .. } => "agent:terminate",
            Self::AgentsChanged { .. } => "agents:changed",
            Self::HealthCheck { .. } => "health:check",
            Self::HealthCritical { .. } => "health:critical",
            Self::Status { .. } => "status",
            Self::StatusPaused { .. } => "status:paused",
            Self::StatusResumed => "status:resumed",
            Self::TasksChanged { .. } => "tasks:changed",
            Self::ConfigChanged { .. } => "config:changed",
            Self::Log { .. } => "log",
        }
    }
}

/// Cloneable handle to the daemon's broadcast channel.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<DaemonEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DaemonEvent> {
        self.tx.subscribe()
    }

    /// Subscribe as a `Stream`. Lagged receivers yield an error item instead
    /// of ending the stream.
    pub fn stream(&self) -> BroadcastStream<DaemonEvent> {
        BroadcastStream::new(self.tx.subscribe())
    }

    /// Publish an event. Ok if nobody is listening.
    pub fn emit(&self, event: DaemonEvent) {
        let _ = self.tx.send(event);
    }

    /// Publish a `log` event and record it through `tracing`.
    pub fn log(&self, level: LogLevel, message: impl Into<String>) {
        let message = message.into();
        match level {
            LogLevel::Debug => tracing::debug!("{message}"),
            LogLevel::Info | LogLevel::Success => tracing::info!("{message}"),
            LogLevel::Warn => tracing::warn!("{message}"),
            LogLevel::Error => tracing::error!("{message}"),
        }
        self.emit(DaemonEvent::Log {
            level,
            message,
            timestamp: Utc::now(),
        });
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
