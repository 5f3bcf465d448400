use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use super::Daemon;
use super::scheduler::{Candidate, SelectionInput, Tier, select_candidates};
use crate::error::{DaemonError, QueueError};
use crate::events::{DaemonEvent, EvaluationSummary, LogLevel, SkipReason};
use crate::state::model::DaemonState;
use crate::tasks::model::{Task, TaskStatus};

/// Clocks a dispatch moved forward, kept so a failed dispatch can put them
/// back.
struct Reservation {
    target: Option<String>,
    previous_activity: Option<DateTime<Utc>>,
    previous_review: Option<DateTime<Utc>>,
    idle_review: bool,
}

impl Reservation {
    fn take(state: &mut DaemonState, candidate: &Candidate, now: DateTime<Utc>) -> Self {
        state.dispatched.insert(candidate.task.id.clone(), now);
        let idle_review = candidate.tier == Tier::IdleReview;
        let Some(target) = candidate.task.target() else {
            return Self {
                target: None,
                previous_activity: None,
                previous_review: None,
                idle_review,
            };
        };
        let previous_activity = state.target_activity.insert(target.to_string(), now);
        let previous_review = if idle_review {
            state.review_history.insert(target.to_string(), now)
        } else {
            None
        };
        Self {
            target: Some(target.to_string()),
            previous_activity,
            previous_review,
            idle_review,
        }
    }

    fn release(self, state: &mut DaemonState, task_id: &str, now: DateTime<Utc>) {
        state.dispatched.remove(task_id);
        let Some(target) = self.target else {
            return;
        };
        restore(&mut state.target_activity, &target, self.previous_activity, now);
        if self.idle_review {
            restore(&mut state.review_history, &target, self.previous_review, now);
        }
    }
}

/// Put back `previous` unless something newer than `now` was recorded.
fn restore(
    clocks: &mut BTreeMap<String, DateTime<Utc>>,
    key: &str,
    previous: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) {
    if clocks.get(key) != Some(&now) {
        return;
    }
    match previous {
        Some(at) => {
            clocks.insert(key.to_string(), at);
        }
        None => {
            clocks.remove(key);
        }
    }
}

impl Daemon {
    /// One scheduling pass: pick candidates within capacity, reserve their
    /// slots and targets, mark them in progress, and emit `task:ready`.
    pub async fn evaluate(&self) -> Result<EvaluationSummary, DaemonError> {
        let _guard = self.evaluation_lock.lock().await;
        let now = Utc::now();
        let mut summary = EvaluationSummary {
            at: Some(now),
            ..Default::default()
        };

        let state = self.state.load().await?;
        if state.paused {
            debug!("Evaluation skipped: paused");
            summary.skipped = Some(SkipReason::Paused);
            return Ok(summary);
        }
        let state = self.expire_dispatches(state, now).await?;

        summary.available_slots = state.available_slots();
        if summary.available_slots == 0 {
            self.events.log(
                LogLevel::Info,
                format!(
                    "At capacity ({} running, {} dispatched, max {})",
                    state.running_count(),
                    state.dispatched.len(),
                    state.config.max_concurrent_agents
                ),
            );
            self.state
                .update(|s| s.stats.last_evaluation = Some(now))
                .await?;
            summary.skipped = Some(SkipReason::AtCapacity);
            self.events.emit(DaemonEvent::Evaluation {
                summary: summary.clone(),
            });
            return Ok(summary);
        }

        let (user_tasks, system_tasks) = self.tasks.load_all().await?;
        let selection = select_candidates(&SelectionInput {
            user_tasks: &user_tasks,
            system_tasks: &system_tasks,
            available_slots: summary.available_slots,
            now,
            cooldown: state.config.cooldown(),
            target_activity: &state.target_activity,
            review_history: &state.review_history,
            idle_review_enabled: state.config.idle_review_enabled,
            idle_review_targets: &state.config.idle_review_targets,
            idle_review_priority: state.config.idle_review_priority,
        });
        summary.skipped_cooldown = selection.skipped_cooldown;

        // Capacity is checked again under the state lock so a registration
        // racing this tick cannot push the total over the limit.
        let committed = self
            .state
            .update(move |s| {
                let timeout = s.config.dispatch_timeout();
                s.prune_dispatched(now, timeout);
                let free = s.available_slots();
                let committed: Vec<(Candidate, Reservation)> = selection
                    .candidates
                    .into_iter()
                    .take(free)
                    .map(|candidate| {
                        let reservation = Reservation::take(s, &candidate, now);
                        (candidate, reservation)
                    })
                    .collect();
                s.stats.last_evaluation = Some(now);
                committed
            })
            .await?;

        for (candidate, reservation) in committed {
            let tier = candidate.tier;
            let reserved_id = candidate.task.id.clone();
            let task = match self.mark_in_progress(candidate).await {
                Ok(task) => task,
                Err(e) => {
                    warn!(task_id = %reserved_id, error = %e, "Could not mark task in progress, releasing slot");
                    self.state
                        .update(move |s| reservation.release(s, &reserved_id, now))
                        .await?;
                    continue;
                }
            };
            if task.id != reserved_id {
                let id = task.id.clone();
                self.state
                    .update(move |s| {
                        if let Some(at) = s.dispatched.remove(&reserved_id) {
                            s.dispatched.insert(id, at);
                        }
                    })
                    .await?;
            }

            info!(task_id = %task.id, %tier, priority = %task.priority, "Task ready");
            self.events.log(
                LogLevel::Info,
                format!("Dispatching {} ({tier}): {}", task.id, task.description),
            );
            if tier == Tier::IdleReview {
                summary.idle_review = task.target().map(str::to_string);
            }
            summary.dispatched.push(task.id.clone());
            self.events.emit(DaemonEvent::TaskReady { task });
        }

        if summary.dispatched.is_empty() {
            debug!("Nothing eligible to dispatch");
            summary.skipped = Some(SkipReason::NothingEligible);
        }
        self.events.emit(DaemonEvent::Evaluation {
            summary: summary.clone(),
        });
        Ok(summary)
    }

    /// Drop dispatches nobody registered for within the timeout and put
    /// their tasks back to pending.
    async fn expire_dispatches(&self, state: DaemonState, now: DateTime<Utc>) -> Result<DaemonState, DaemonError> {
        let timeout = state.config.dispatch_timeout();
        if !state.dispatched.values().any(|at| now - *at >= timeout) {
            return Ok(state);
        }

        let (state, expired) = self
            .state
            .update(|s| {
                let expired = s.prune_dispatched(now, timeout);
                (s.clone(), expired)
            })
            .await?;

        let running = state.running_task_ids();
        for id in expired.iter().filter(|id| !running.contains(*id)) {
            let requeued = self
                .tasks
                .update_task(id, |t| {
                    if t.status == TaskStatus::InProgress {
                        t.status = TaskStatus::Pending;
                    }
                })
                .await;
            match requeued {
                Ok(_) | Err(QueueError::NotFound { .. }) => {
                    self.events.log(
                        LogLevel::Warn,
                        format!("No agent picked up {id} in time; returned it to pending"),
                    );
                }
                Err(e) => warn!(task_id = %id, error = %e, "Failed to requeue expired dispatch"),
            }
        }
        Ok(state)
    }

    /// Persist the in-progress status. Idle reviews are new tasks and are
    /// appended to the system queue.
    async fn mark_in_progress(&self, candidate: Candidate) -> Result<Task, QueueError> {
        match candidate.tier {
            Tier::IdleReview => {
                self.tasks
                    .insert_new(candidate.task.with_status(TaskStatus::InProgress))
                    .await
            }
            Tier::User | Tier::System => {
                self.tasks
                    .set_status(&candidate.task.id, TaskStatus::InProgress)
                    .await
            }
        }
    }

    pub(super) async fn run_evaluation(&self) {
        if let Err(e) = self.evaluate().await {
            self.events.log(LogLevel::Error, format!("Evaluation failed: {e}"));
        }
    }

    /// Out-of-band evaluation, e.g. right after a resume.
    pub(super) fn spawn_evaluation(self: &Arc<Self>) {
        let daemon = Arc::clone(self);
        tokio::spawn(async move { daemon.run_evaluation().await });
    }
}
