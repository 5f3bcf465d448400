//! The seam between the registry and whatever actually runs agents.

use async_trait::async_trait;

use super::process;
use crate::error::AgentError;

/// Process control the registry and daemon need from an agent runner.
#[async_trait]
pub trait AgentRunner: Send + Sync {
    /// Whether the runner still holds `agent_id` in its active set. Used for
    /// agents recorded without a pid.
    async fn is_active(&self, agent_id: &str) -> bool;

    /// Forcefully stop an agent.
    async fn kill(&self, agent_id: &str, pid: Option<u32>) -> Result<(), AgentError>;
}

/// Runner for deployments where a separate process consumes `task:ready`.
/// It tracks nothing itself and can only signal known pids.
#[derive(Debug, Default, Clone, Copy)]
pub struct DetachedRunner;

#[async_trait]
impl AgentRunner for DetachedRunner {
    async fn is_active(&self, _agent_id: &str) -> bool {
        false
    }

    async fn kill(&self, agent_id: &str, pid: Option<u32>) -> Result<(), AgentError> {
        let Some(pid) = pid else {
            return Ok(());
        };
        process::kill(pid).map_err(|e| AgentError::SignalFailed {
            id: agent_id.to_string(),
            reason: e.to_string(),
        })
    }
}
