//! Candidate selection for one evaluation tick.
//!
//! Pure: takes queue and state snapshots, returns what to dispatch. Tiers in
//! order: pending user tasks, auto-approved system tasks (critical auto-fixes
//! first), then a synthesized idle review when nothing else qualified. Each
//! target yields at most one candidate per tick and none while cooling down.

use std::collections::{BTreeMap, HashSet};
use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::tasks::model::{Priority, Task, TaskScope};
use crate::tasks::queue;

/// Which tier produced a candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    User,
    System,
    IdleReview,
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::User => f.write_str("user"),
            Self::System => f.write_str("system"),
            Self::IdleReview => f.write_str("idle_review"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub task: Task,
    pub tier: Tier,
}

/// Snapshots the selection works from.
#[derive(Debug, Clone)]
pub struct SelectionInput<'a> {
    pub user_tasks: &'a [Task],
    pub system_tasks: &'a [Task],
    pub available_slots: usize,
    pub now: DateTime<Utc>,
    pub cooldown: Duration,
    pub target_activity: &'a BTreeMap<String, DateTime<Utc>>,
    pub review_history: &'a BTreeMap<String, DateTime<Utc>>,
    pub idle_review_enabled: bool,
    pub idle_review_targets: &'a [String],
    pub idle_review_priority: Priority,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Selection {
    /// At most `available_slots` candidates, in dispatch order.
    pub candidates: Vec<Candidate>,
    /// Pending task ids passed over because their target is cooling down.
    pub skipped_cooldown: Vec<String>,
}

pub fn select_candidates(input: &SelectionInput<'_>) -> Selection {
    let mut selection = Selection::default();
    if input.available_slots == 0 {
        return selection;
    }

    // Targets claimed earlier in this tick count as cooling down.
    let mut claimed: HashSet<String> = HashSet::new();
    let on_cooldown = |target: &str, claimed: &HashSet<String>| {
        claimed.contains(target)
            || input
                .target_activity
                .get(target)
                .is_some_and(|last| input.now - *last < input.cooldown)
    };

    let user = input.user_tasks.iter().filter(|t| t.is_pending());
    let (critical, rest): (Vec<&Task>, Vec<&Task>) = input
        .system_tasks
        .iter()
        .filter(|t| t.is_pending() && t.is_executable_without_approval())
        .partition(|t| queue::is_critical_auto_fix(t));

    let tiers = user
        .map(|t| (t, Tier::User))
        .chain(critical.into_iter().map(|t| (t, Tier::System)))
        .chain(rest.into_iter().map(|t| (t, Tier::System)));

    for (task, tier) in tiers {
        if selection.candidates.len() >= input.available_slots {
            break;
        }
        if let Some(target) = task.target() {
            if on_cooldown(target, &claimed) {
                selection.skipped_cooldown.push(task.id.clone());
                continue;
            }
            claimed.insert(target.to_string());
        }
        selection.candidates.push(Candidate {
            task: task.clone(),
            tier,
        });
    }

    if selection.candidates.is_empty() && input.idle_review_enabled {
        if let Some(target) = pick_review_target(input, |t| on_cooldown(t, &claimed)) {
            let id = queue::next_task_id(input.system_tasks, TaskScope::System);
            selection.candidates.push(Candidate {
                task: review_task(id, target, input.idle_review_priority),
                tier: Tier::IdleReview,
            });
        }
    }

    selection
}

/// Least recently reviewed target that is not cooling down. Never-reviewed
/// targets come first; ties keep configuration order.
fn pick_review_target<'a>(
    input: &SelectionInput<'a>,
    on_cooldown: impl Fn(&str) -> bool,
) -> Option<&'a str> {
    input
        .idle_review_targets
        .iter()
        .map(String::as_str)
        .filter(|t| !t.trim().is_empty() && !on_cooldown(*t))
        .min_by_key(|t| input.review_history.get(*t).copied())
}

/// Synthesized system task reviewing `target`.
pub fn review_task(id: String, target: &str, priority: Priority) -> Task {
    Task::new(
        id,
        priority,
        format!("Idle review of {target}: look for bugs, dead code and small improvements"),
    )
    .with_metadata("target", target)
    .with_metadata("idleReview", "true")
}
