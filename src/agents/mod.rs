//! Agents: registry of running work processes, the runner seam, and the
//! bundled shell-command runner.

pub mod command;
pub mod process;
pub mod registry;
pub mod runner;

pub use command::CommandRunner;
pub use registry::{AgentRegistry, ZombieCleanup};
pub use runner::{AgentRunner, DetachedRunner};
