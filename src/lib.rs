//! Chief of Staff: autonomous task orchestration daemon.

pub mod agents;
pub mod config;
pub mod daemon;
pub mod error;
pub mod events;
pub mod state;
pub mod tasks;
