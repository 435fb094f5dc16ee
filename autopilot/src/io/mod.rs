//! Side-effecting adapters: files, processes, agents, prompts.

pub mod agent;
pub mod atomic;
pub mod command;
pub mod config;
pub mod process;
pub mod project_state;
pub mod prompt;
pub mod store;
