//! Configuration types.
//!
//! Two layers:
//! - [`AppConfig`]: process-level settings read from the environment.
//! - [`DaemonConfig`]: scheduler tunables persisted inside the daemon state
//!   snapshot. Missing keys fall back to defaults field by field.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::tasks::model::Priority;

/// User-scoped task queue file name.
pub const USER_TASKS_FILE: &str = "TASKS.md";
/// System-scoped task queue file name.
pub const SYSTEM_TASKS_FILE: &str = "COS-TASKS.md";
/// Daemon state snapshot file name.
pub const STATE_FILE: &str = "cos-state.json";
/// Directory (under the data dir) holding full per-agent output logs.
pub const AGENT_LOGS_DIR: &str = "agent-logs";

/// Default event bus capacity.
const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// Process-level configuration, built from environment variables.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Root directory for queue files, state snapshot, and agent logs.
    pub data_dir: PathBuf,
    /// Shell command the bundled runner executes per task. `None` means the
    /// daemon only emits `task:ready` and expects an external runner.
    pub agent_command: Option<String>,
    /// Directory for rolling daemon log files.
    pub log_dir: Option<PathBuf>,
    /// Broadcast capacity for the event bus.
    pub event_capacity: usize,
}

impl AppConfig {
    /// Build config from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let data_dir = match std::env::var("COS_DATA_DIR") {
            Ok(dir) => PathBuf::from(dir),
            Err(_) => {
                let home = std::env::var("HOME")
                    .map_err(|_| ConfigError::MissingEnvVar("COS_DATA_DIR or HOME".into()))?;
                PathBuf::from(home).join(".chief-of-staff")
            }
        };

        let agent_command = std::env::var("COS_AGENT_COMMAND")
            .ok()
            .filter(|s| !s.trim().is_empty());

        let log_dir = std::env::var("COS_LOG_DIR").ok().map(PathBuf::from);

        let event_capacity = match std::env::var("COS_EVENT_CAPACITY") {
            Ok(raw) => raw.parse::<usize>().map_err(|e| ConfigError::InvalidValue {
                key: "COS_EVENT_CAPACITY".into(),
                message: e.to_string(),
            })?,
            Err(_) => DEFAULT_EVENT_CAPACITY,
        };

        Ok(Self {
            data_dir,
            agent_command,
            log_dir,
            event_capacity,
        })
    }

    /// Config rooted at an explicit directory (tests, embedding).
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            agent_command: None,
            log_dir: None,
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }

    pub fn user_tasks_path(&self) -> PathBuf {
        self.data_dir.join(USER_TASKS_FILE)
    }

    pub fn system_tasks_path(&self) -> PathBuf {
        self.data_dir.join(SYSTEM_TASKS_FILE)
    }

    pub fn state_path(&self) -> PathBuf {
        self.data_dir.join(STATE_FILE)
    }

    pub fn agent_logs_dir(&self) -> PathBuf {
        self.data_dir.join(AGENT_LOGS_DIR)
    }
}

/// Limits for tasks an agent may fix without human sign-off.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AutoFixThresholds {
    /// Largest diff an auto-fix may produce.
    pub max_lines_changed: u32,
    /// Issue categories eligible for auto-fix.
    pub allowed_categories: Vec<String>,
}

impl Default for AutoFixThresholds {
    fn default() -> Self {
        Self {
            max_lines_changed: 50,
            allowed_categories: vec![
                "formatting".into(),
                "dead-code".into(),
                "typo".into(),
                "security".into(),
                "error-handling".into(),
            ],
        }
    }
}

/// Scheduler tunables stored in the daemon state snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DaemonConfig {
    pub evaluation_interval_ms: u64,
    pub health_check_interval_ms: u64,
    pub max_concurrent_agents: usize,
    pub max_process_memory_mb: u64,
    pub max_total_processes: usize,
    /// Per-target cooldown window.
    pub app_review_cooldown_ms: u64,
    pub idle_review_enabled: bool,
    pub idle_review_priority: Priority,
    /// Targets eligible for idle review, in tie-break order.
    pub idle_review_targets: Vec<String>,
    pub auto_fix_thresholds: AutoFixThresholds,
    /// How long a graceful terminate may take before the agent is killed.
    pub terminate_grace_ms: u64,
    /// How long a `task:ready` holds a slot while waiting for registration.
    pub dispatch_timeout_ms: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            evaluation_interval_ms: 60_000,
            health_check_interval_ms: 5 * 60_000,
            max_concurrent_agents: 3,
            max_process_memory_mb: 2048,
            max_total_processes: 50,
            app_review_cooldown_ms: 60 * 60_000, // 1 hour
            idle_review_enabled: true,
            idle_review_priority: Priority::Low,
            idle_review_targets: Vec::new(),
            auto_fix_thresholds: AutoFixThresholds::default(),
            terminate_grace_ms: 10_000,
            dispatch_timeout_ms: 5 * 60_000,
        }
    }
}

/// Smallest accepted ticker period.
const MIN_INTERVAL_MS: u64 = 1_000;

impl DaemonConfig {
    pub fn evaluation_interval(&self) -> Duration {
        Duration::from_millis(self.evaluation_interval_ms)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }

    pub fn cooldown(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.app_review_cooldown_ms as i64)
    }

    pub fn dispatch_timeout(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.dispatch_timeout_ms as i64)
    }

    pub fn terminate_grace(&self) -> Duration {
        Duration::from_millis(self.terminate_grace_ms)
    }

    /// Reject values the scheduler cannot run with.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_concurrent_agents == 0 {
            return Err("maxConcurrentAgents must be at least 1".into());
        }
        if self.evaluation_interval_ms < MIN_INTERVAL_MS {
            return Err(format!("evaluationIntervalMs must be >= {MIN_INTERVAL_MS}"));
        }
        if self.health_check_interval_ms < MIN_INTERVAL_MS {
            return Err(format!("healthCheckIntervalMs must be >= {MIN_INTERVAL_MS}"));
        }
        Ok(())
    }

    /// Merge a partial JSON object onto this config. Unknown keys are ignored,
    /// nested objects merge key by key.
    pub fn merged(&self, patch: &serde_json::Value) -> Result<Self, String> {
        let mut base = serde_json::to_value(self).map_err(|e| e.to_string())?;
        merge_json(&mut base, patch);
        let merged: Self = serde_json::from_value(base).map_err(|e| e.to_string())?;
        merged.validate()?;
        Ok(merged)
    }
}

fn merge_json(base: &mut serde_json::Value, patch: &serde_json::Value) {
    match (base, patch) {
        (serde_json::Value::Object(base), serde_json::Value::Object(patch)) => {
            for (key, value) in patch {
                match base.get_mut(key) {
                    Some(existing) if existing.is_object() && value.is_object() => {
                        merge_json(existing, value);
                    }
                    _ => {
                        base.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (base, patch) => *base = patch.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_cooldown_is_one_hour() {
        let config = DaemonConfig::default();
        assert_eq!(config.cooldown(), chrono::Duration::hours(1));
    }

    #[test]
    fn missing_keys_take_defaults() {
        let config: DaemonConfig =
            serde_json::from_str(r#"{"maxConcurrentAgents": 7}"#).unwrap();
        assert_eq!(config.max_concurrent_agents, 7);
        assert_eq!(config.evaluation_interval_ms, 60_000);
        assert!(config.idle_review_enabled);
        assert_eq!(config.auto_fix_thresholds.max_lines_changed, 50);
    }

    #[test]
    fn camel_case_keys() {
        let json = serde_json::to_value(DaemonConfig::default()).unwrap();
        assert!(json.get("appReviewCooldownMs").is_some());
        assert!(json["autoFixThresholds"].get("allowedCategories").is_some());
        assert_eq!(json["idleReviewPriority"], "LOW");
    }

    #[test]
    fn merge_nested_patch() {
        let config = DaemonConfig::default();
        let merged = config
            .merged(&serde_json::json!({
                "maxConcurrentAgents": 5,
                "autoFixThresholds": { "maxLinesChanged": 10 }
            }))
            .unwrap();
        assert_eq!(merged.max_concurrent_agents, 5);
        assert_eq!(merged.auto_fix_thresholds.max_lines_changed, 10);
        assert_eq!(
            merged.auto_fix_thresholds.allowed_categories,
            config.auto_fix_thresholds.allowed_categories
        );
    }

    #[test]
    fn merge_rejects_invalid() {
        let config = DaemonConfig::default();
        assert!(config.merged(&serde_json::json!({"maxConcurrentAgents": 0})).is_err());
        assert!(config.merged(&serde_json::json!({"evaluationIntervalMs": 10})).is_err());
        assert!(config.merged(&serde_json::json!({"idleReviewPriority": "URGENT"})).is_err());
    }

    #[test]
    fn app_config_paths() {
        let config = AppConfig::with_data_dir("/tmp/cos");
        assert_eq!(config.user_tasks_path(), PathBuf::from("/tmp/cos/TASKS.md"));
        assert_eq!(config.system_tasks_path(), PathBuf::from("/tmp/cos/COS-TASKS.md"));
        assert_eq!(config.state_path(), PathBuf::from("/tmp/cos/cos-state.json"));
    }
}
