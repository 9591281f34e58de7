//! Stable exit codes for the runsync CLI.

/// Run completed: changes pushed or nothing to sync.
pub const OK: i32 = 0;
/// Configuration missing or invalid; no run was attempted.
pub const CONFIG: i32 = 1;
/// The content task failed; sync was skipped.
pub const TASK: i32 = 2;
/// Git synchronization failed (conflict, local command, or exhausted retries).
pub const SYNC: i32 = 3;
/// Another run holds the lock; this trigger was skipped.
pub const LOCKED: i32 = 4;
/// Terminated by SIGINT/SIGTERM; the lock was released before exiting.
/// Follows the shell convention of 128 + signal number (SIGINT).
pub const INTERRUPTED: i32 = 130;
