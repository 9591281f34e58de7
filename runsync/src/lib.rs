//! Run-and-sync orchestrator for a recurring content-generation job.
//!
//! One invocation runs an external task and, only on success, publishes the
//! resulting file changes to a shared git remote. The crate guarantees:
//!
//! - **Single-flight**: a filesystem lock with staleness eviction admits at
//!   most one run per working directory ([`io::lock`]).
//! - **Deterministic reconciliation**: an explicit state machine
//!   (clean → stage → commit → fetch → rebase → push) keeps pushes
//!   fast-forward under concurrent remote activity ([`sync`]).
//! - **Transient-failure resilience**: only network steps are retried, with
//!   exponential backoff ([`retry`]); conflicts and local failures surface
//!   immediately.
//! - **Supervisor visibility**: a stable exit-code contract
//!   ([`exit_codes`]), a dated size-rotated run log ([`io::log_sink`]), and
//!   a heartbeat marker for an external health probe ([`io::heartbeat`]).

pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod retry;
pub mod run;
pub mod sync;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
