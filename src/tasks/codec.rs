//! Task queue text format: parse and serialize.
//!
//! ```text
//! # Tasks
//!
//! ## Pending
//!
//! - [ ] #task-001 | HIGH | Fix login bug
//!   - Target: billing-app
//! - [ ] #sys-004 | MEDIUM | APPROVAL | Rotate API keys
//! ```
//!
//! Parsing is a line classifier: every line is a section header, a task
//! line, a metadata line, or ignored. Malformed task lines are dropped.
//! Tasks accepted by [`check_task`] survive `serialize` then `parse`
//! unchanged.

use std::borrow::Cow;

use super::model::{Metadata, Priority, Task, TaskStatus, normalize_id};

const USER_TITLE: &str = "# Tasks";
const SYSTEM_TITLE: &str = "# System Tasks";

/// Approval slot value for tasks that may run unattended.
const FLAG_AUTO: &str = "AUTO";
/// Approval slot value for tasks gated on sign-off.
const FLAG_APPROVAL: &str = "APPROVAL";

/// One classified input line.
#[derive(Debug, PartialEq)]
enum Line<'a> {
    Title,
    /// `## Heading`. `None` when the heading is not a known section.
    Section(Option<TaskStatus>),
    /// `- [m] #id | ...`. `None` when the line is malformed.
    Task(Option<Task>),
    /// Indented `- Key: Value`.
    Metadata { key: &'a str, value: &'a str },
    Other,
}

fn classify(line: &str) -> Line<'_> {
    let line = line.trim_end_matches('\r');
    let trimmed = line.trim_start();

    if trimmed.is_empty() {
        return Line::Other;
    }
    if let Some(title) = trimmed.strip_prefix("## ") {
        return Line::Section(TaskStatus::from_section_title(title));
    }
    if trimmed.starts_with("# ") {
        return Line::Title;
    }
    if line.starts_with("- [") {
        return Line::Task(parse_task_line(line));
    }
    let indented = line.len() != trimmed.len();
    if indented {
        if let Some(rest) = trimmed.strip_prefix("- ") {
            if let Some((key, value)) = rest.split_once(':') {
                let key = key.trim();
                if !key.is_empty() && !key.starts_with('[') {
                    return Line::Metadata {
                        key,
                        value: value.trim(),
                    };
                }
            }
        }
    }
    Line::Other
}

/// Parse `- [m] #id | PRIORITY | [FLAG |] description`.
fn parse_task_line(line: &str) -> Option<Task> {
    let rest = line.strip_prefix("- [")?;
    let mut chars = rest.chars();
    let status = TaskStatus::from_mark(chars.next()?)?;
    let rest = chars.as_str().strip_prefix(']')?.trim_start();
    let rest = rest.strip_prefix('#')?;

    let mut fields = rest.splitn(3, '|');
    let id = fields.next()?.trim();
    let priority = Priority::parse(fields.next()?)?;
    let remainder = fields.next()?;

    if id.is_empty() || id.contains(char::is_whitespace) {
        return None;
    }

    let (flag, description) = match remainder.split_once('|') {
        Some((head, tail)) if matches!(head.trim(), FLAG_AUTO | FLAG_APPROVAL) => {
            (Some(head.trim()), tail.trim())
        }
        _ => (None, remainder.trim()),
    };
    if description.is_empty() {
        return None;
    }

    let mut task = Task::new(normalize_id(id), priority, description).with_status(status);
    match flag {
        Some(FLAG_APPROVAL) => {
            task.approval_required = true;
            task.auto_approved = false;
        }
        _ => {
            task.approval_required = false;
            task.auto_approved = true;
        }
    }
    Some(task)
}

/// Parse queue text into tasks, in file order.
pub fn parse(text: &str) -> Vec<Task> {
    let mut tasks: Vec<Task> = Vec::new();
    let mut section: Option<TaskStatus> = None;
    // Whether metadata lines currently attach to `tasks.last()`.
    let mut attach = false;

    for raw in text.lines() {
        match classify(raw) {
            Line::Title | Line::Other => {}
            Line::Section(status) => {
                section = status;
                attach = false;
            }
            Line::Task(Some(mut task)) => {
                // Before any known header the mark decides.
                task.section = Some(section.unwrap_or(task.status));
                tasks.push(task);
                attach = true;
            }
            Line::Task(None) => {
                // Metadata under a dropped line must not leak onto the
                // previous task.
                attach = false;
            }
            Line::Metadata { key, value } => {
                if attach {
                    if let Some(task) = tasks.last_mut() {
                        task.metadata.insert(key, unescape_value(value));
                    }
                }
            }
        }
    }

    tasks
}

/// Serialize tasks into queue text. Tasks are grouped by status into fixed
/// sections and stable-sorted by priority within each. `include_approval`
/// emits the approval slot (system queue only).
pub fn serialize(tasks: &[Task], include_approval: bool) -> String {
    let mut out = String::new();
    out.push_str(if include_approval { SYSTEM_TITLE } else { USER_TITLE });
    out.push('\n');

    for status in TaskStatus::ALL {
        let mut section: Vec<&Task> = tasks.iter().filter(|t| t.status == status).collect();
        if section.is_empty() {
            continue;
        }
        section.sort_by(|a, b| b.priority_value().cmp(&a.priority_value()));

        out.push_str("\n## ");
        out.push_str(status.section_title());
        out.push_str("\n\n");
        for task in section {
            write_task(&mut out, task, include_approval);
        }
    }

    out
}

fn write_task(out: &mut String, task: &Task, include_approval: bool) {
    let description = single_line(&task.description);
    out.push_str("- [");
    out.push(task.status.mark());
    out.push_str("] #");
    out.push_str(&task.id);
    out.push_str(" | ");
    out.push_str(task.priority.as_str());
    out.push_str(" | ");
    // A description that itself opens with a flag would be read back as one.
    if include_approval || starts_with_flag(&description) {
        out.push_str(if task.approval_required {
            FLAG_APPROVAL
        } else {
            FLAG_AUTO
        });
        out.push_str(" | ");
    }
    out.push_str(&description);
    out.push('\n');
    write_metadata(out, &task.metadata);
}

fn write_metadata(out: &mut String, metadata: &Metadata) {
    for (key, value) in metadata.iter() {
        out.push_str("  - ");
        out.push_str(&single_line(&capitalize(key)));
        out.push_str(": ");
        out.push_str(&escape_value(value));
        out.push('\n');
    }
}

fn starts_with_flag(description: &str) -> bool {
    description
        .split_once('|')
        .is_some_and(|(head, _)| matches!(head.trim(), FLAG_AUTO | FLAG_APPROVAL))
}

/// Line breaks would start new lines in the file.
fn single_line(text: &str) -> Cow<'_, str> {
    if text.contains(['\n', '\r']) {
        Cow::Owned(text.replace("\r\n", " ").replace(['\n', '\r'], " "))
    } else {
        Cow::Borrowed(text)
    }
}

fn capitalize(key: &str) -> String {
    let mut chars = key.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Escape a metadata value. Values with a newline, carriage return,
/// backslash, double quote, or leading/trailing whitespace become JSON
/// string literals; anything else is written verbatim.
pub fn escape_value(value: &str) -> Cow<'_, str> {
    let padded = value.starts_with(char::is_whitespace) || value.ends_with(char::is_whitespace);
    if padded || value.contains(['\n', '\r', '\\', '"']) {
        Cow::Owned(serde_json::Value::String(value.to_owned()).to_string())
    } else {
        Cow::Borrowed(value)
    }
}

/// Reverse [`escape_value`]. Quoted values are decoded as JSON string
/// literals; values that fail to decode use the legacy `\n` substitution.
pub fn unescape_value(raw: &str) -> String {
    if raw.len() >= 2 && raw.starts_with('"') && raw.ends_with('"') {
        if let Ok(decoded) = serde_json::from_str::<String>(raw) {
            return decoded;
        }
    }
    raw.replace("\\n", "\n")
}

/// Whether `task` can be written to a queue file and read back unchanged.
/// Returns the reason when it cannot.
pub fn check_task(task: &Task) -> Result<(), String> {
    if task.id.is_empty() || task.id.contains(|c: char| c.is_whitespace() || c == '|') {
        return Err(format!("invalid id {:?}", task.id));
    }
    if normalize_id(&task.id) != task.id {
        return Err(format!("id {:?} has no task- or sys- prefix", task.id));
    }
    let description = &task.description;
    if description.trim().is_empty() {
        return Err("description is empty".into());
    }
    if description.contains(['\n', '\r']) {
        return Err("description contains a line break".into());
    }
    if description.trim() != description {
        return Err("description has leading or trailing whitespace".into());
    }
    for (key, _) in task.metadata.iter() {
        let valid = !key.is_empty()
            && key.trim() == key
            && !key.starts_with('[')
            && !key.contains([':', '\n', '\r'])
            && capitalize(key).to_lowercase() == key;
        if !valid {
            return Err(format!("invalid metadata key {key:?}"));
        }
    }
    Ok(())
}
