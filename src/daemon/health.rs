//! Health checks over the processes of running agents.
//!
//! Process data comes through [`ProcessMetrics`]; the default implementation
//! reads `/proc`. Thresholds produce warnings, crashed processes produce
//! errors and a `health:critical` event.

use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use super::Daemon;
use crate::config::DaemonConfig;
use crate::error::{DaemonError, HealthError};
use crate::events::{DaemonEvent, LogLevel};
use crate::state::model::{HealthIssue, HealthIssueKind};

/// A process to probe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessTarget {
    /// Agent id owning the process.
    pub name: String,
    pub pid: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessStatus {
    Online,
    Stopped,
    Errored,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessInfo {
    pub name: String,
    pub pid: Option<u32>,
    pub status: ProcessStatus,
    pub memory_mb: u64,
}

/// Source of process status and memory.
#[async_trait]
pub trait ProcessMetrics: Send + Sync {
    async fn collect(&self, targets: &[ProcessTarget]) -> Result<Vec<ProcessInfo>, HealthError>;
}

/// Reads `/proc/<pid>/stat` and `/proc/<pid>/status`.
#[derive(Debug, Clone)]
pub struct ProcFsMetrics {
    root: PathBuf,
}

impl ProcFsMetrics {
    pub fn new() -> Self {
        Self::with_root("/proc")
    }

    /// Read from a different procfs mount.
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    async fn probe(&self, target: &ProcessTarget) -> ProcessInfo {
        let dir = self.root.join(target.pid.to_string());
        let status = match tokio::fs::read_to_string(dir.join("stat")).await {
            Ok(stat) => match stat_state(&stat) {
                Some('Z' | 'X' | 'x') => ProcessStatus::Errored,
                Some('T' | 't') => ProcessStatus::Stopped,
                Some(_) => ProcessStatus::Online,
                None => ProcessStatus::Errored,
            },
            // A running agent whose process is gone has crashed.
            Err(_) => ProcessStatus::Errored,
        };
        let memory_mb = match tokio::fs::read_to_string(dir.join("status")).await {
            Ok(text) => rss_mb(&text).unwrap_or(0),
            Err(_) => 0,
        };
        ProcessInfo {
            name: target.name.clone(),
            pid: Some(target.pid),
            status,
            memory_mb,
        }
    }
}

impl Default for ProcFsMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProcessMetrics for ProcFsMetrics {
    async fn collect(&self, targets: &[ProcessTarget]) -> Result<Vec<ProcessInfo>, HealthError> {
        if !tokio::fs::try_exists(&self.root).await.unwrap_or(false) {
            return Err(HealthError::MetricsUnavailable(format!(
                "{} is not mounted",
                self.root.display()
            )));
        }
        let mut processes = Vec::with_capacity(targets.len());
        for target in targets {
            processes.push(self.probe(target).await);
        }
        Ok(processes)
    }
}

/// State letter from a `/proc/<pid>/stat` line. The command name may hold
/// spaces and parentheses, so scan from the last `)`.
fn stat_state(stat: &str) -> Option<char> {
    let (_, rest) = stat.rsplit_once(')')?;
    rest.split_whitespace().next()?.chars().next()
}

/// `VmRSS` from `/proc/<pid>/status`, in MB.
fn rss_mb(status: &str) -> Option<u64> {
    let line = status.lines().find(|l| l.starts_with("VmRSS:"))?;
    let kb: u64 = line.split_whitespace().nth(1)?.parse().ok()?;
    Some(kb / 1024)
}

/// Turn collected process data into issues.
pub fn assess(processes: &[ProcessInfo], config: &DaemonConfig) -> Vec<HealthIssue> {
    let mut issues = Vec::new();
    if processes.len() > config.max_total_processes {
        issues.push(HealthIssue::warning(
            HealthIssueKind::HighProcessCount,
            format!(
                "{} processes running (limit {})",
                processes.len(),
                config.max_total_processes
            ),
        ));
    }
    for p in processes {
        if p.memory_mb > config.max_process_memory_mb {
            issues.push(
                HealthIssue::warning(
                    HealthIssueKind::HighMemory,
                    format!(
                        "{} using {} MB (limit {} MB)",
                        p.name, p.memory_mb, config.max_process_memory_mb
                    ),
                )
                .for_process(&p.name),
            );
        }
        if p.status == ProcessStatus::Errored {
            issues.push(
                HealthIssue::error(HealthIssueKind::ProcessCrashed, format!("{} has crashed", p.name))
                    .for_process(&p.name),
            );
        }
    }
    issues
}

/// Result of one health check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub at: DateTime<Utc>,
    pub processes: Vec<ProcessInfo>,
    pub issues: Vec<HealthIssue>,
}

impl HealthReport {
    pub fn has_errors(&self) -> bool {
        self.issues.iter().any(HealthIssue::is_error)
    }
}

impl Daemon {
    /// Flush agent output, probe running agents, and record the issues.
    pub async fn health_check(&self) -> Result<HealthReport, DaemonError> {
        if let Err(e) = self.registry.flush_output().await {
            warn!(error = %e, "Failed to flush agent output");
        }

        let state = self.state.load().await?;
        let targets: Vec<ProcessTarget> = state
            .running_agents()
            .filter_map(|a| {
                a.pid.map(|pid| ProcessTarget {
                    name: a.id.clone(),
                    pid,
                })
            })
            .collect();

        let (processes, mut issues) = match self.metrics.collect(&targets).await {
            Ok(processes) => {
                let issues = assess(&processes, &state.config);
                (processes, issues)
            }
            Err(e) => {
                warn!(error = %e, "Process metrics unavailable");
                let issue = HealthIssue::warning(HealthIssueKind::MetricsUnavailable, e.to_string());
                (Vec::new(), vec![issue])
            }
        };
        issues.sort_by_key(|i| !i.is_error());

        let now = Utc::now();
        let recorded = issues.clone();
        self.state
            .update(move |s| {
                s.stats.last_health_check = Some(now);
                s.stats.health_issues = recorded;
            })
            .await?;

        debug!(processes = processes.len(), issues = issues.len(), "Health check complete");
        self.events.emit(DaemonEvent::HealthCheck {
            issues: issues.clone(),
            process_count: processes.len(),
        });

        let critical: Vec<HealthIssue> = issues.iter().filter(|i| i.is_error()).cloned().collect();
        if !critical.is_empty() {
            for issue in &critical {
                error!(process = ?issue.process, "{}", issue.message);
            }
            self.events.log(
                LogLevel::Error,
                format!("Health check found {} critical issue(s)", critical.len()),
            );
            self.events.emit(DaemonEvent::HealthCritical { issues: critical });
        }

        Ok(HealthReport {
            at: now,
            processes,
            issues,
        })
    }

    pub(super) async fn run_health_check(&self) {
        if let Err(e) = self.health_check().await {
            self.events.log(LogLevel::Error, format!("Health check failed: {e}"));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn info(name: &str, status: ProcessStatus, memory_mb: u64) -> ProcessInfo {
        ProcessInfo {
            name: name.into(),
            pid: Some(1),
            status,
            memory_mb,
        }
    }

    #[test]
    fn parses_stat_state() {
        assert_eq!(stat_state("42 (sh) S 1 42 42 0"), Some('S'));
        assert_eq!(stat_state("42 (my (odd) name) Z 1 42"), Some('Z'));
        assert_eq!(stat_state("garbage"), None);
    }

    #[test]
    fn parses_rss() {
        let status = "Name:\tsh\nVmPeak:\t 9000 kB\nVmRSS:\t  204800 kB\n";
        assert_eq!(rss_mb(status), Some(200));
        assert_eq!(rss_mb("Name:\tsh\n"), None);
    }

    #[test]
    fn thresholds_produce_warnings() {
        let mut config = DaemonConfig::default();
        config.max_total_processes = 1;
        config.max_process_memory_mb = 100;
        let issues = assess(
            &[
                info("agent-a", ProcessStatus::Online, 50),
                info("agent-b", ProcessStatus::Online, 500),
            ],
            &config,
        );
        assert_eq!(issues.len(), 2);
        assert!(issues.iter().all(|i| !i.is_error()));
        assert_eq!(issues[0].kind, HealthIssueKind::HighProcessCount);
        assert_eq!(issues[1].process.as_deref(), Some("agent-b"));
    }

    #[test]
    fn errored_process_is_error() {
        let issues = assess(
            &[info("agent-a", ProcessStatus::Errored, 0)],
            &DaemonConfig::default(),
        );
        assert_eq!(issues.len(), 1);
        assert!(issues[0].is_error());
        assert_eq!(issues[0].kind, HealthIssueKind::ProcessCrashed);
    }

    #[tokio::test]
    async fn procfs_reads_fake_root() {
        let root = TempDir::new().unwrap();
        let live = root.path().join("100");
        std::fs::create_dir(&live).unwrap();
        std::fs::write(live.join("stat"), "100 (agent) R 1 100").unwrap();
        std::fs::write(live.join("status"), "VmRSS:\t 2048 kB\n").unwrap();
        let zombie = root.path().join("200");
        std::fs::create_dir(&zombie).unwrap();
        std::fs::write(zombie.join("stat"), "200 (agent) Z 1 200").unwrap();

        let metrics = ProcFsMetrics::with_root(root.path());
        let processes = metrics
            .collect(&[
                ProcessTarget { name: "a".into(), pid: 100 },
                ProcessTarget { name: "b".into(), pid: 200 },
                ProcessTarget { name: "c".into(), pid: 300 },
            ])
            .await
            .unwrap();
        assert_eq!(processes[0].status, ProcessStatus::Online);
        assert_eq!(processes[0].memory_mb, 2);
        assert_eq!(processes[1].status, ProcessStatus::Errored);
        assert_eq!(processes[2].status, ProcessStatus::Errored);
    }

    #[tokio::test]
    async fn missing_root_is_unavailable() {
        let metrics = ProcFsMetrics::with_root("/nonexistent/proc-root");
        let err = metrics.collect(&[]).await.unwrap_err();
        assert!(matches!(err, HealthError::MetricsUnavailable(_)));
    }
}
