//! The daemon: lifecycle, pause control, config updates, agent control.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{info, warn};

use super::health::ProcessMetrics;
use super::recovery::RecoveryReport;
use super::ticker::Ticker;
use crate::agents::{AgentRegistry, AgentRunner, ZombieCleanup};
use crate::config::DaemonConfig;
use crate::error::DaemonError;
use crate::events::{DaemonEvent, EventBus, LogLevel};
use crate::state::model::{Agent, Stats};
use crate::state::store::StateStore;
use crate::tasks::store::TaskStore;

/// Everything the daemon is wired to.
pub struct DaemonDeps {
    pub state: Arc<StateStore>,
    pub tasks: Arc<TaskStore>,
    pub registry: Arc<AgentRegistry>,
    pub runner: Arc<dyn AgentRunner>,
    pub metrics: Arc<dyn ProcessMetrics>,
    pub events: EventBus,
}

/// Point-in-time view for status queries.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DaemonStatus {
    pub running: bool,
    pub paused: bool,
    pub paused_at: Option<DateTime<Utc>>,
    pub pause_reason: Option<String>,
    pub running_agents: usize,
    pub dispatched: usize,
    pub max_concurrent_agents: usize,
    pub stats: Stats,
    pub config: DaemonConfig,
}

struct Tickers {
    evaluation: Ticker,
    health: Ticker,
}

impl Tickers {
    async fn stop(self) {
        self.evaluation.stop().await;
        self.health.stop().await;
    }
}

pub struct Daemon {
    pub(super) state: Arc<StateStore>,
    pub(super) tasks: Arc<TaskStore>,
    pub(super) registry: Arc<AgentRegistry>,
    pub(super) runner: Arc<dyn AgentRunner>,
    pub(super) metrics: Arc<dyn ProcessMetrics>,
    pub(super) events: EventBus,
    /// Serializes evaluation ticks.
    pub(super) evaluation_lock: Mutex<()>,
    /// `Some` while started.
    tickers: Mutex<Option<Tickers>>,
}

impl Daemon {
    pub fn new(deps: DaemonDeps) -> Arc<Self> {
        Arc::new(Self {
            state: deps.state,
            tasks: deps.tasks,
            registry: deps.registry,
            runner: deps.runner,
            metrics: deps.metrics,
            events: deps.events,
            evaluation_lock: Mutex::new(()),
            tickers: Mutex::new(None),
        })
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn tasks(&self) -> &Arc<TaskStore> {
        &self.tasks
    }

    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    pub fn state(&self) -> &Arc<StateStore> {
        &self.state
    }

    pub async fn is_running(&self) -> bool {
        self.tickers.lock().await.is_some()
    }

    /// Reconcile persisted state against reality, then start the tickers.
    /// The first evaluation runs right away.
    pub async fn start(self: &Arc<Self>) -> Result<RecoveryReport, DaemonError> {
        let mut tickers = self.tickers.lock().await;
        if tickers.is_some() {
            return Err(DaemonError::AlreadyRunning);
        }

        self.state.reload().await?;
        let report = self.reconcile().await?;
        let state = self
            .state
            .update(|s| {
                s.running = true;
                s.clone()
            })
            .await?;
        *tickers = Some(self.spawn_tickers(&state.config));
        drop(tickers);

        self.events.emit(DaemonEvent::Status {
            running: true,
            paused: state.paused,
        });
        self.events.log(
            LogLevel::Success,
            format!(
                "Daemon started (max {} agents, evaluating every {}s)",
                state.config.max_concurrent_agents,
                state.config.evaluation_interval().as_secs()
            ),
        );
        if state.paused {
            self.events.log(
                LogLevel::Info,
                format!(
                    "Daemon is paused{}",
                    state
                        .pause_reason
                        .as_deref()
                        .map(|r| format!(": {r}"))
                        .unwrap_or_default()
                ),
            );
        }
        Ok(report)
    }

    /// Stop both tickers, letting in-flight ticks finish.
    pub async fn stop(&self) -> Result<(), DaemonError> {
        let mut tickers = self.tickers.lock().await;
        let Some(running) = tickers.take() else {
            return Err(DaemonError::NotRunning);
        };
        running.stop().await;
        let paused = self
            .state
            .update(|s| {
                s.running = false;
                s.paused
            })
            .await?;
        drop(tickers);

        self.events.emit(DaemonEvent::Status {
            running: false,
            paused,
        });
        self.events.log(LogLevel::Info, "Daemon stopped");
        Ok(())
    }

    /// Suspend new work. Running agents are left alone; tickers keep firing
    /// but evaluations are skipped.
    pub async fn pause(&self, reason: Option<String>) -> Result<(), DaemonError> {
        let now = Utc::now();
        let recorded = reason.clone();
        self.state
            .try_update(move |s| {
                if s.paused {
                    return Err(DaemonError::AlreadyPaused);
                }
                s.paused = true;
                s.paused_at = Some(now);
                s.pause_reason = recorded;
                Ok(())
            })
            .await?;

        info!(reason = ?reason, "Daemon paused");
        self.events.emit(DaemonEvent::StatusPaused {
            reason: reason.clone(),
            paused_at: now,
        });
        self.events.log(
            LogLevel::Info,
            match reason {
                Some(reason) => format!("Daemon paused: {reason}"),
                None => "Daemon paused".to_string(),
            },
        );
        Ok(())
    }

    /// Clear the pause and evaluate immediately if started.
    pub async fn resume(self: &Arc<Self>) -> Result<(), DaemonError> {
        self.state
            .try_update(|s| {
                if !s.paused {
                    return Err(DaemonError::NotPaused);
                }
                s.paused = false;
                s.paused_at = None;
                s.pause_reason = None;
                Ok(())
            })
            .await?;

        self.events.emit(DaemonEvent::StatusResumed);
        self.events.log(LogLevel::Info, "Daemon resumed");
        if self.is_running().await {
            self.spawn_evaluation();
        }
        Ok(())
    }

    pub async fn status(&self) -> Result<DaemonStatus, DaemonError> {
        let running = self.is_running().await;
        let state = self.state.load().await?;
        Ok(DaemonStatus {
            running,
            paused: state.paused,
            paused_at: state.paused_at,
            pause_reason: state.pause_reason.clone(),
            running_agents: state.running_count(),
            dispatched: state.dispatched.len(),
            max_concurrent_agents: state.config.max_concurrent_agents,
            stats: state.stats.clone(),
            config: state.config,
        })
    }

    /// Merge a partial config, persist it, and restart the tickers if an
    /// interval changed.
    pub async fn update_config(self: &Arc<Self>, patch: &serde_json::Value) -> Result<DaemonConfig, DaemonError> {
        let mut tickers = self.tickers.lock().await;
        let (config, intervals_changed) = self
            .state
            .try_update(|s| {
                let merged = s.config.merged(patch).map_err(DaemonError::InvalidConfig)?;
                let changed = merged.evaluation_interval_ms != s.config.evaluation_interval_ms
                    || merged.health_check_interval_ms != s.config.health_check_interval_ms;
                s.config = merged.clone();
                Ok::<_, DaemonError>((merged, changed))
            })
            .await?;

        if intervals_changed {
            if let Some(old) = tickers.take() {
                old.stop().await;
                *tickers = Some(self.spawn_tickers(&config));
                info!(
                    evaluation_ms = config.evaluation_interval_ms,
                    health_ms = config.health_check_interval_ms,
                    "Tickers restarted with new intervals"
                );
            }
        }
        drop(tickers);

        self.events.emit(DaemonEvent::ConfigChanged {
            config: config.clone(),
        });
        self.events.log(LogLevel::Info, "Daemon config updated");
        Ok(config)
    }

    /// Ask an agent to stop; kill it if it is still running after the grace
    /// period.
    pub async fn terminate_agent(self: &Arc<Self>, agent_id: &str) -> Result<(), DaemonError> {
        let agent = self.registry.terminate(agent_id).await?;
        let grace = self.state.load().await?.config.terminate_grace();

        let daemon = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            let still_running = matches!(
                daemon.registry.get(&agent.id).await,
                Ok(Some(a)) if a.is_running()
            );
            if !still_running {
                return;
            }
            warn!(agent_id = %agent.id, grace_ms = grace.as_millis() as u64, "Agent ignored terminate request, killing");
            match daemon.registry.kill(&agent.id, daemon.runner.as_ref()).await {
                Ok(_) => daemon.events.log(
                    LogLevel::Warn,
                    format!("Agent {} did not stop within the grace period and was killed", agent.id),
                ),
                Err(e) => warn!(agent_id = %agent.id, error = %e, "Forced kill failed"),
            }
        });
        Ok(())
    }

    /// Kill an agent immediately.
    pub async fn kill_agent(&self, agent_id: &str) -> Result<Agent, DaemonError> {
        Ok(self.registry.kill(agent_id, self.runner.as_ref()).await?)
    }

    /// On-demand zombie sweep.
    pub async fn cleanup_zombies(&self) -> Result<ZombieCleanup, DaemonError> {
        let report = self.registry.cleanup_zombies(self.runner.as_ref()).await?;
        if !report.cleaned.is_empty() {
            self.events.log(
                LogLevel::Warn,
                format!("Cleaned up {} zombie agent(s)", report.cleaned.len()),
            );
        }
        Ok(report)
    }

    fn spawn_tickers(self: &Arc<Self>, config: &DaemonConfig) -> Tickers {
        let daemon = Arc::downgrade(self);
        let evaluation = Ticker::spawn("evaluation", config.evaluation_interval(), move || {
            let daemon = daemon.clone();
            async move {
                match daemon.upgrade() {
                    Some(daemon) => {
                        daemon.run_evaluation().await;
                        true
                    }
                    None => false,
                }
            }
        });

        let daemon = Arc::downgrade(self);
        let health = Ticker::spawn("health", config.health_check_interval(), move || {
            let daemon = daemon.clone();
            async move {
                match daemon.upgrade() {
                    Some(daemon) => {
                        daemon.run_health_check().await;
                        true
                    }
                    None => false,
                }
            }
        });

        Tickers { evaluation, health }
    }
}
