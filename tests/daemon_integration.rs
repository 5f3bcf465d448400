//! Integration tests for the daemon: startup reconciliation, scheduling,
//! pause control, health checks and agent termination.
//!
//! Each test builds a daemon over a temporary data directory with a stub
//! runner and stub process metrics, then drives it through its public API
//! and the event bus.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tempfile::TempDir;
use tokio::sync::broadcast;
use tokio::time::timeout;

use chief_of_staff::agents::{AgentRegistry, AgentRunner};
use chief_of_staff::config::{AppConfig, DaemonConfig};
use chief_of_staff::daemon::{
    Daemon, DaemonDeps, ProcessInfo, ProcessMetrics, ProcessStatus, ProcessTarget,
};
use chief_of_staff::error::{AgentError, DaemonError, HealthError};
use chief_of_staff::events::{DaemonEvent, EventBus, SkipReason};
use chief_of_staff::state::{Agent, AgentResult, StateStore};
use chief_of_staff::tasks::{Priority, Task, TaskScope, TaskStatus, TaskStore};

/// Maximum time any test is allowed to run before we consider it hung.
const TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Runner stub: a fixed active set, kills are recorded.
#[derive(Default)]
struct StubRunner {
    active: Mutex<HashSet<String>>,
    killed: Mutex<Vec<String>>,
}

#[async_trait]
impl AgentRunner for StubRunner {
    async fn is_active(&self, agent_id: &str) -> bool {
        self.active.lock().unwrap().contains(agent_id)
    }

    async fn kill(&self, agent_id: &str, _pid: Option<u32>) -> Result<(), AgentError> {
        self.killed.lock().unwrap().push(agent_id.to_string());
        Ok(())
    }
}

/// Metrics stub reporting every target with a fixed status.
struct StubMetrics {
    status: ProcessStatus,
}

#[async_trait]
impl ProcessMetrics for StubMetrics {
    async fn collect(&self, targets: &[ProcessTarget]) -> Result<Vec<ProcessInfo>, HealthError> {
        Ok(targets
            .iter()
            .map(|t| ProcessInfo {
                name: t.name.clone(),
                pid: Some(t.pid),
                status: self.status,
                memory_mb: 10,
            })
            .collect())
    }
}

struct Harness {
    dir: TempDir,
    daemon: Arc<Daemon>,
    events: EventBus,
    state: Arc<StateStore>,
    tasks: Arc<TaskStore>,
    registry: Arc<AgentRegistry>,
    runner: Arc<StubRunner>,
}

/// Quiet defaults: tickers far apart, idle review off.
fn base_config() -> DaemonConfig {
    DaemonConfig {
        evaluation_interval_ms: 3_600_000,
        health_check_interval_ms: 3_600_000,
        idle_review_enabled: false,
        ..DaemonConfig::default()
    }
}

async fn harness_with(config: DaemonConfig, status: ProcessStatus) -> Harness {
    let dir = TempDir::new().unwrap();
    let app = AppConfig::with_data_dir(dir.path());
    let events = EventBus::new(1024);
    let state = Arc::new(StateStore::new(app.state_path(), events.clone()));
    state.update(move |s| s.config = config).await.unwrap();
    let tasks = Arc::new(TaskStore::new(
        app.user_tasks_path(),
        app.system_tasks_path(),
        events.clone(),
    ));
    let registry = Arc::new(AgentRegistry::new(
        Arc::clone(&state),
        events.clone(),
        app.agent_logs_dir(),
    ));
    let runner = Arc::new(StubRunner::default());
    let daemon = Daemon::new(DaemonDeps {
        state: Arc::clone(&state),
        tasks: Arc::clone(&tasks),
        registry: Arc::clone(&registry),
        runner: Arc::clone(&runner) as Arc<dyn AgentRunner>,
        metrics: Arc::new(StubMetrics { status }),
        events: events.clone(),
    });
    Harness {
        dir,
        daemon,
        events,
        state,
        tasks,
        registry,
        runner,
    }
}

async fn harness() -> Harness {
    harness_with(base_config(), ProcessStatus::Online).await
}

/// Wait for the next event named `name`, skipping others.
async fn next_event(rx: &mut broadcast::Receiver<DaemonEvent>, name: &str) -> DaemonEvent {
    loop {
        let event = rx.recv().await.unwrap();
        if event.name() == name {
            return event;
        }
    }
}

fn pending(id: &str) -> Task {
    Task::new(id, Priority::Medium, format!("work on {id}"))
}

// ── Startup reconciliation ──────────────────────────────────────────

#[tokio::test]
async fn start_resets_orphaned_tasks_before_first_evaluation() {
    timeout(TEST_TIMEOUT, async {
        let h = harness().await;
        std::fs::write(
            h.dir.path().join("TASKS.md"),
            "# Tasks\n\n## Pending\n\n- [ ] #task-2 | MEDIUM | Write release notes\n\n\
             ## In Progress\n\n- [~] #task-1 | HIGH | Fix login bug\n",
        )
        .unwrap();
        let mut rx = h.events.subscribe();

        let report = h.daemon.start().await.unwrap();
        assert_eq!(report.orphaned_tasks, vec!["task-1".to_string()]);

        let DaemonEvent::Evaluation { summary } = next_event(&mut rx, "evaluation").await else {
            unreachable!()
        };
        let mut dispatched = summary.dispatched.clone();
        dispatched.sort();
        assert_eq!(dispatched, vec!["task-1", "task-2"]);

        let tasks = h.tasks.load(TaskScope::User).await.unwrap();
        assert!(tasks.iter().all(|t| t.status == TaskStatus::InProgress));
        assert!(h.state.load().await.unwrap().running);

        h.daemon.stop().await.unwrap();
        assert!(!h.state.load().await.unwrap().running);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn reconcile_closes_zombies_and_requeues_their_tasks() {
    timeout(TEST_TIMEOUT, async {
        let h = harness().await;

        // A pid that is certainly gone.
        let mut child = tokio::process::Command::new("true").spawn().unwrap();
        let dead_pid = child.id().unwrap();
        child.wait().await.unwrap();

        let with_pid = Agent::new("task-1", Some(dead_pid));
        let without_pid = Agent::new("task-2", None);
        let tracked = Agent::new("task-3", None);
        h.runner.active.lock().unwrap().insert(tracked.id.clone());
        let ids = (with_pid.id.clone(), without_pid.id.clone(), tracked.id.clone());
        h.state
            .update(move |s| {
                for agent in [with_pid, without_pid, tracked] {
                    s.agents.insert(agent.id.clone(), agent);
                }
            })
            .await
            .unwrap();
        for id in ["task-1", "task-2", "task-3"] {
            h.tasks
                .add_task(pending(id).with_status(TaskStatus::InProgress))
                .await
                .unwrap();
        }

        let report = h.daemon.reconcile().await.unwrap();
        assert_eq!(report.zombies.checked, 3);
        let mut cleaned = report.zombies.cleaned.clone();
        cleaned.sort();
        let mut expected = vec![ids.0.clone(), ids.1.clone()];
        expected.sort();
        assert_eq!(cleaned, expected);

        let mut orphans = report.orphaned_tasks.clone();
        orphans.sort();
        assert_eq!(orphans, vec!["task-1", "task-2"]);

        let state = h.state.load().await.unwrap();
        let zombie = &state.agents[&ids.0];
        assert_eq!(
            zombie.result,
            Some(AgentResult::failed("orphaned (restart)"))
        );
        assert!(state.agents[&ids.2].is_running());
        assert_eq!(
            h.tasks.get("task-3").await.unwrap().unwrap().status,
            TaskStatus::InProgress
        );
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn corrupted_state_is_backed_up_on_start() {
    timeout(TEST_TIMEOUT, async {
        let h = harness().await;
        std::fs::write(h.state.path(), "{\"running\": false}}").unwrap();

        h.daemon.start().await.unwrap();
        let state = h.state.load().await.unwrap();
        assert!(state.running);
        assert_eq!(state.config, DaemonConfig::default());

        let backups: Vec<_> = std::fs::read_dir(h.dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| {
                e.file_name()
                    .to_string_lossy()
                    .starts_with("cos-state.json.corrupted-")
            })
            .collect();
        assert_eq!(backups.len(), 1);
        h.daemon.stop().await.unwrap();
    })
    .await
    .expect("test timed out");
}

// ── Lifecycle errors ────────────────────────────────────────────────

#[tokio::test]
async fn lifecycle_misuse_is_reported() {
    timeout(TEST_TIMEOUT, async {
        let h = harness().await;
        assert!(matches!(h.daemon.stop().await, Err(DaemonError::NotRunning)));
        assert!(matches!(h.daemon.resume().await, Err(DaemonError::NotPaused)));

        h.daemon.start().await.unwrap();
        assert!(matches!(h.daemon.start().await, Err(DaemonError::AlreadyRunning)));

        h.daemon.pause(None).await.unwrap();
        assert!(matches!(
            h.daemon.pause(Some("again".into())).await,
            Err(DaemonError::AlreadyPaused)
        ));
        h.daemon.stop().await.unwrap();
    })
    .await
    .expect("test timed out");
}

// ── Pause / resume ──────────────────────────────────────────────────

#[tokio::test]
async fn pause_skips_evaluation_and_resume_dispatches_immediately() {
    timeout(TEST_TIMEOUT, async {
        let h = harness().await;
        let mut rx = h.events.subscribe();
        h.daemon.start().await.unwrap();
        next_event(&mut rx, "evaluation").await;

        h.daemon.pause(Some("deploy freeze".into())).await.unwrap();
        let DaemonEvent::StatusPaused { reason, .. } = next_event(&mut rx, "status:paused").await else {
            unreachable!()
        };
        assert_eq!(reason.as_deref(), Some("deploy freeze"));

        h.tasks.add_task(pending("task-1")).await.unwrap();
        let summary = h.daemon.evaluate().await.unwrap();
        assert_eq!(summary.skipped, Some(SkipReason::Paused));
        assert!(summary.dispatched.is_empty());
        let status = h.daemon.status().await.unwrap();
        assert!(status.paused);
        assert_eq!(status.pause_reason.as_deref(), Some("deploy freeze"));

        h.daemon.resume().await.unwrap();
        let DaemonEvent::TaskReady { task } = next_event(&mut rx, "task:ready").await else {
            unreachable!()
        };
        assert_eq!(task.id, "task-1");
        assert_eq!(task.status, TaskStatus::InProgress);

        let state = h.state.load().await.unwrap();
        assert!(!state.paused);
        assert!(state.pause_reason.is_none());
        h.daemon.stop().await.unwrap();
    })
    .await
    .expect("test timed out");
}

// ── Scheduling ──────────────────────────────────────────────────────

#[tokio::test]
async fn concurrency_bound_counts_dispatched_and_running() {
    timeout(TEST_TIMEOUT, async {
        let h = harness_with(
            DaemonConfig {
                max_concurrent_agents: 2,
                ..base_config()
            },
            ProcessStatus::Online,
        )
        .await;
        for i in 1..=5 {
            h.tasks.add_task(pending(&format!("task-{i}"))).await.unwrap();
        }

        let first = h.daemon.evaluate().await.unwrap();
        assert_eq!(first.dispatched, vec!["task-1", "task-2"]);

        let second = h.daemon.evaluate().await.unwrap();
        assert_eq!(second.skipped, Some(SkipReason::AtCapacity));

        // Registration converts a dispatch into a running agent: still full.
        let agent = h
            .registry
            .register("task-1", None, BTreeMap::new())
            .await
            .unwrap();
        assert_eq!(
            h.daemon.evaluate().await.unwrap().skipped,
            Some(SkipReason::AtCapacity)
        );

        h.registry.complete(&agent.id, AgentResult::ok()).await.unwrap();
        let third = h.daemon.evaluate().await.unwrap();
        assert_eq!(third.dispatched, vec!["task-3"]);

        let status = h.daemon.status().await.unwrap();
        assert_eq!(status.running_agents + status.dispatched, 2);
        assert_eq!(status.stats.tasks_completed, 1);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn cooldown_holds_back_second_task_for_same_target() {
    timeout(TEST_TIMEOUT, async {
        let h = harness().await;
        h.tasks
            .add_task(pending("task-1").with_metadata("target", "billing-app"))
            .await
            .unwrap();
        h.tasks
            .add_task(pending("task-2").with_metadata("target", "billing-app"))
            .await
            .unwrap();

        let first = h.daemon.evaluate().await.unwrap();
        assert_eq!(first.dispatched, vec!["task-1"]);
        assert_eq!(first.skipped_cooldown, vec!["task-2"]);

        let second = h.daemon.evaluate().await.unwrap();
        assert!(second.dispatched.is_empty());
        assert_eq!(second.skipped_cooldown, vec!["task-2"]);

        let state = h.state.load().await.unwrap();
        assert!(state.target_activity.contains_key("billing-app"));
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn idle_review_only_when_queues_are_empty() {
    timeout(TEST_TIMEOUT, async {
        let h = harness_with(
            DaemonConfig {
                idle_review_enabled: true,
                idle_review_targets: vec!["billing-app".into()],
                ..base_config()
            },
            ProcessStatus::Online,
        )
        .await;
        let mut rx = h.events.subscribe();

        let summary = h.daemon.evaluate().await.unwrap();
        assert_eq!(summary.idle_review.as_deref(), Some("billing-app"));
        assert_eq!(summary.dispatched, vec!["sys-001"]);

        let DaemonEvent::TaskReady { task } = next_event(&mut rx, "task:ready").await else {
            unreachable!()
        };
        assert_eq!(task.target(), Some("billing-app"));
        assert_eq!(task.metadata.get("idleReview"), Some("true"));

        let system = h.tasks.load(TaskScope::System).await.unwrap();
        assert_eq!(system.len(), 1);
        assert_eq!(system[0].status, TaskStatus::InProgress);
        assert!(
            h.state
                .load()
                .await
                .unwrap()
                .review_history
                .contains_key("billing-app")
        );

        // The only target is now cooling down.
        let again = h.daemon.evaluate().await.unwrap();
        assert!(again.dispatched.is_empty());
        assert_eq!(again.skipped, Some(SkipReason::NothingEligible));

        // Real work always wins over idle review.
        h.tasks.add_task(pending("task-1")).await.unwrap();
        let with_work = h.daemon.evaluate().await.unwrap();
        assert_eq!(with_work.dispatched, vec!["task-1"]);
        assert!(with_work.idle_review.is_none());
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn expired_dispatch_returns_task_to_pending() {
    timeout(TEST_TIMEOUT, async {
        let h = harness().await;
        h.tasks
            .add_task(pending("task-1").with_status(TaskStatus::InProgress))
            .await
            .unwrap();
        h.state
            .update(|s| {
                s.dispatched
                    .insert("task-1".into(), Utc::now() - chrono::Duration::hours(1));
            })
            .await
            .unwrap();

        let summary = h.daemon.evaluate().await.unwrap();
        assert_eq!(summary.dispatched, vec!["task-1"]);
        let state = h.state.load().await.unwrap();
        assert_eq!(state.dispatched.len(), 1);
        assert!(Utc::now() - state.dispatched["task-1"] < chrono::Duration::minutes(1));
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn failed_dispatch_leaves_no_cooldown_behind() {
    timeout(TEST_TIMEOUT, async {
        let h = harness_with(
            DaemonConfig {
                idle_review_enabled: true,
                idle_review_targets: vec!["docs-site".into()],
                ..base_config()
            },
            ProcessStatus::Online,
        )
        .await;
        h.tasks
            .add_task(pending("task-1").with_metadata("target", "billing-app"))
            .await
            .unwrap();

        // A directory where the queue's temp file goes makes the write fail.
        let blocker = h.dir.path().join("TASKS.md.tmp");
        std::fs::create_dir(&blocker).unwrap();
        let failed = h.daemon.evaluate().await.unwrap();
        assert!(failed.dispatched.is_empty());
        let state = h.state.load().await.unwrap();
        assert!(state.dispatched.is_empty());
        assert!(!state.target_activity.contains_key("billing-app"));
        std::fs::remove_dir(&blocker).unwrap();

        let retried = h.daemon.evaluate().await.unwrap();
        assert_eq!(retried.dispatched, vec!["task-1"]);
        assert!(retried.skipped_cooldown.is_empty());

        // Same for an idle review that could not be written.
        let earlier = Utc::now() - chrono::Duration::days(1);
        h.state
            .update(move |s| {
                s.review_history.insert("docs-site".into(), earlier);
            })
            .await
            .unwrap();
        h.tasks.set_status("task-1", TaskStatus::Completed).await.unwrap();
        let blocker = h.dir.path().join("COS-TASKS.md.tmp");
        std::fs::create_dir(&blocker).unwrap();
        let failed = h.daemon.evaluate().await.unwrap();
        assert!(failed.idle_review.is_none());
        let state = h.state.load().await.unwrap();
        assert_eq!(state.review_history.get("docs-site"), Some(&earlier));
        assert!(!state.target_activity.contains_key("docs-site"));
        assert_eq!(state.dispatched.len(), 1);
    })
    .await
    .expect("test timed out");
}

// ── Health ──────────────────────────────────────────────────────────

#[tokio::test]
async fn crashed_agent_process_raises_critical() {
    timeout(TEST_TIMEOUT, async {
        let h = harness_with(base_config(), ProcessStatus::Errored).await;
        let agent = h
            .registry
            .register("task-1", Some(std::process::id()), BTreeMap::new())
            .await
            .unwrap();
        h.registry.append_output(&agent.id, "compiling");
        let mut rx = h.events.subscribe();

        let report = h.daemon.health_check().await.unwrap();
        assert!(report.has_errors());

        let DaemonEvent::HealthCritical { issues } = next_event(&mut rx, "health:critical").await else {
            unreachable!()
        };
        assert_eq!(issues[0].process.as_deref(), Some(agent.id.as_str()));

        let state = h.state.load().await.unwrap();
        assert!(state.stats.last_health_check.is_some());
        assert_eq!(state.stats.health_issues.len(), 1);
        // Output buffered since registration was flushed into the snapshot.
        assert_eq!(state.agents[&agent.id].output[0].line, "compiling");
    })
    .await
    .expect("test timed out");
}

// ── Agent control ───────────────────────────────────────────────────

#[tokio::test]
async fn terminate_escalates_to_kill_after_grace() {
    timeout(TEST_TIMEOUT, async {
        let h = harness_with(
            DaemonConfig {
                terminate_grace_ms: 50,
                ..base_config()
            },
            ProcessStatus::Online,
        )
        .await;
        let agent = h
            .registry
            .register("task-1", None, BTreeMap::new())
            .await
            .unwrap();
        let mut rx = h.events.subscribe();

        h.daemon.terminate_agent(&agent.id).await.unwrap();
        let DaemonEvent::AgentTerminate { agent_id, .. } = next_event(&mut rx, "agent:terminate").await else {
            unreachable!()
        };
        assert_eq!(agent_id, agent.id);

        let DaemonEvent::AgentCompleted { result, .. } = next_event(&mut rx, "agent:completed").await else {
            unreachable!()
        };
        assert_eq!(result, AgentResult::failed("terminated (forced)"));
        assert_eq!(h.runner.killed.lock().unwrap().as_slice(), [agent.id.clone()]);

        // Terminating a finished agent is rejected.
        assert!(matches!(
            h.daemon.terminate_agent(&agent.id).await,
            Err(DaemonError::Agent(AgentError::NotRunning { .. }))
        ));
    })
    .await
    .expect("test timed out");
}

// ── Config ──────────────────────────────────────────────────────────

#[tokio::test]
async fn config_patch_merges_and_validates() {
    timeout(TEST_TIMEOUT, async {
        let h = harness().await;
        let mut rx = h.events.subscribe();

        let updated = h
            .daemon
            .update_config(&serde_json::json!({
                "maxConcurrentAgents": 5,
                "autoFixThresholds": { "maxLinesChanged": 10 }
            }))
            .await
            .unwrap();
        assert_eq!(updated.max_concurrent_agents, 5);
        assert_eq!(updated.auto_fix_thresholds.max_lines_changed, 10);
        assert!(!updated.auto_fix_thresholds.allowed_categories.is_empty());
        next_event(&mut rx, "config:changed").await;

        let err = h
            .daemon
            .update_config(&serde_json::json!({ "maxConcurrentAgents": 0 }))
            .await
            .unwrap_err();
        assert!(matches!(err, DaemonError::InvalidConfig(_)));
        assert_eq!(
            h.state.load().await.unwrap().config.max_concurrent_agents,
            5
        );
    })
    .await
    .expect("test timed out");
}
