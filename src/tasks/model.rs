//! Task data model: status, priority, scope and ordered metadata.

use std::fmt;

use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// ID prefix for user-scoped tasks.
pub const USER_PREFIX: &str = "task-";
/// ID prefix for system-scoped tasks.
pub const SYSTEM_PREFIX: &str = "sys-";

/// Lifecycle status of a task. Declaration order is the section order in a
/// queue file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Blocked,
    Completed,
}

impl TaskStatus {
    /// All statuses in section order.
    pub const ALL: [TaskStatus; 4] = [
        TaskStatus::Pending,
        TaskStatus::InProgress,
        TaskStatus::Blocked,
        TaskStatus::Completed,
    ];

    /// Checkbox mark used on a task line.
    pub fn mark(self) -> char {
        match self {
            Self::Pending => ' ',
            Self::InProgress => '~',
            Self::Blocked => '!',
            Self::Completed => 'x',
        }
    }

    pub fn from_mark(mark: char) -> Option<Self> {
        match mark {
            ' ' => Some(Self::Pending),
            '~' => Some(Self::InProgress),
            '!' => Some(Self::Blocked),
            'x' | 'X' => Some(Self::Completed),
            _ => None,
        }
    }

    /// Section header title (without the `## ` prefix).
    pub fn section_title(self) -> &'static str {
        match self {
            Self::Pending => "Pending",
            Self::InProgress => "In Progress",
            Self::Blocked => "Blocked",
            Self::Completed => "Completed",
        }
    }

    pub fn from_section_title(title: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|s| s.section_title().eq_ignore_ascii_case(title.trim()))
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Blocked => "blocked",
            Self::Completed => "completed",
        };
        write!(f, "{s}")
    }
}

/// Task priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Priority {
    Critical,
    High,
    Medium,
    Low,
}

impl Priority {
    /// Sort ordinal: CRITICAL = 4 … LOW = 1.
    pub fn value(self) -> u8 {
        match self {
            Self::Critical => 4,
            Self::High => 3,
            Self::Medium => 2,
            Self::Low => 1,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Critical => "CRITICAL",
            Self::High => "HIGH",
            Self::Medium => "MEDIUM",
            Self::Low => "LOW",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "CRITICAL" => Some(Self::Critical),
            "HIGH" => Some(Self::High),
            "MEDIUM" => Some(Self::Medium),
            "LOW" => Some(Self::Low),
            _ => None,
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which queue a task belongs to, derived from its id prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskScope {
    User,
    System,
}

impl TaskScope {
    pub fn of(id: &str) -> Self {
        if id.starts_with(SYSTEM_PREFIX) {
            Self::System
        } else {
            Self::User
        }
    }

    pub fn prefix(self) -> &'static str {
        match self {
            Self::User => USER_PREFIX,
            Self::System => SYSTEM_PREFIX,
        }
    }
}

impl fmt::Display for TaskScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::User => f.write_str("user"),
            Self::System => f.write_str("system"),
        }
    }
}

/// Insertion-ordered string map. Keys are stored lowercase.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Metadata {
    entries: Vec<(String, String)>,
}

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        let key = key.to_lowercase();
        self.entries
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Insert or replace in place, keeping the original position.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into().to_lowercase();
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key, value)),
        }
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        let key = key.to_lowercase();
        let idx = self.entries.iter().position(|(k, _)| *k == key)?;
        Some(self.entries.remove(idx).1)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Serialize for Metadata {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (k, v) in &self.entries {
            map.serialize_entry(k, v)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for Metadata {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct MetadataVisitor;

        impl<'de> Visitor<'de> for MetadataVisitor {
            type Value = Metadata;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a map of string keys to string values")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Metadata, A::Error> {
                let mut metadata = Metadata::new();
                while let Some((k, v)) = access.next_entry::<String, String>()? {
                    metadata.insert(k, v);
                }
                Ok(metadata)
            }
        }

        deserializer.deserialize_map(MetadataVisitor)
    }
}

/// A single unit of orchestrated work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub status: TaskStatus,
    pub priority: Priority,
    pub description: String,
    #[serde(default)]
    pub metadata: Metadata,
    /// Section the task was parsed under. `None` for tasks built in memory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub section: Option<TaskStatus>,
    /// System tasks only: needs human sign-off before execution.
    #[serde(default)]
    pub approval_required: bool,
    /// System tasks only: may execute without sign-off.
    #[serde(default)]
    pub auto_approved: bool,
}

impl Task {
    /// Create a pending, auto-approved task. Ids without a known prefix are
    /// prefixed with `task-`.
    pub fn new(id: impl Into<String>, priority: Priority, description: impl Into<String>) -> Self {
        Self {
            id: normalize_id(&id.into()),
            status: TaskStatus::Pending,
            priority,
            description: description.into(),
            metadata: Metadata::new(),
            section: None,
            approval_required: false,
            auto_approved: true,
        }
    }

    /// Builder: set status.
    pub fn with_status(mut self, status: TaskStatus) -> Self {
        self.status = status;
        self
    }

    /// Builder: add a metadata entry.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key, value);
        self
    }

    /// Builder: gate the task behind human approval.
    pub fn requiring_approval(mut self) -> Self {
        self.approval_required = true;
        self.auto_approved = false;
        self
    }

    pub fn priority_value(&self) -> u8 {
        self.priority.value()
    }

    pub fn scope(&self) -> TaskScope {
        TaskScope::of(&self.id)
    }

    pub fn is_system(&self) -> bool {
        self.scope() == TaskScope::System
    }

    pub fn is_pending(&self) -> bool {
        self.status == TaskStatus::Pending
    }

    /// Schedulable target (e.g. an application id) this task works against.
    pub fn target(&self) -> Option<&str> {
        self.metadata.get("target").filter(|t| !t.trim().is_empty())
    }

    /// Whether the scheduler may run this task without sign-off. User tasks
    /// are always eligible once pending.
    pub fn is_executable_without_approval(&self) -> bool {
        match self.scope() {
            TaskScope::User => true,
            TaskScope::System => self.auto_approved && !self.approval_required,
        }
    }
}

/// Prefix bare ids with `task-`.
pub fn normalize_id(id: &str) -> String {
    let id = id.trim().trim_start_matches('#');
    if id.starts_with(USER_PREFIX) || id.starts_with(SYSTEM_PREFIX) {
        id.to_string()
    } else {
        format!("{USER_PREFIX}{id}")
    }
}
