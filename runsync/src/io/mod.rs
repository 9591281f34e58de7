//! Side-effecting adapters: filesystem state, git, and child processes.

pub mod config;
pub mod git;
pub mod heartbeat;
pub mod lock;
pub mod log_sink;
pub mod process;
