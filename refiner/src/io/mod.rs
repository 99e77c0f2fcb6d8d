//! Side-effecting collaborators: model and sandbox processes, prompts,
//! configuration and on-disk artifacts.

pub mod bridge;
pub mod config;
pub mod iteration_log;
pub mod model;
pub mod process;
pub mod prompt;
pub mod sandbox;
pub mod session_store;
