//! The scheduling daemon: periodic evaluation and health ticks, startup
//! reconciliation, pause control.

mod evaluation;
pub mod health;
mod lifecycle;
mod recovery;
pub mod scheduler;
mod ticker;

pub use health::{HealthReport, ProcFsMetrics, ProcessInfo, ProcessMetrics, ProcessStatus, ProcessTarget};
pub use lifecycle::{Daemon, DaemonDeps, DaemonStatus};
pub use recovery::RecoveryReport;
pub use scheduler::{Candidate, Tier};
