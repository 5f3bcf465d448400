//! Daemon state: the persisted snapshot and its store.

pub mod model;
pub mod store;

pub use model::{
    Agent, AgentResult, AgentStatus, DaemonState, HealthIssue, HealthIssueKind, IssueSeverity,
    OutputLine, Stats,
};
pub use store::StateStore;
