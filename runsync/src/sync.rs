//! Git synchronization state machine.
//!
//! One run walks `Clean → Stage → Commit → Fetch → Rebase → Push` at most
//! once. `Stage` short-circuits to a successful no-op when the staged diff
//! is empty. Fetch always happens after the commit and before the push, so
//! published history rebases local work onto the latest observed remote tip
//! and pushes stay fast-forward under non-conflicting concurrent activity.
//! Only the network steps (fetch, push) are retried; everything else fails
//! terminally on first error.

use std::fmt;

use chrono::{DateTime, FixedOffset, Utc};
use thiserror::Error;
use tracing::{info, warn};

use crate::io::config::RunConfig;
use crate::io::git::{Git, GitError};
use crate::io::log_sink::RunLog;
use crate::retry::{Transient, with_retry};

/// Protocol step, named in errors and logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStep {
    Clean,
    Stage,
    Commit,
    Fetch,
    Rebase,
    Push,
}

impl fmt::Display for SyncStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SyncStep::Clean => "clean",
            SyncStep::Stage => "stage",
            SyncStep::Commit => "commit",
            SyncStep::Fetch => "fetch",
            SyncStep::Rebase => "rebase",
            SyncStep::Push => "push",
        };
        f.write_str(name)
    }
}

/// Terminal success states of the protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    /// The task produced no changes; nothing was committed, no network call
    /// was made. Success: the run is an idempotent no-op.
    NoChanges,
    /// The local commit was rebased onto the remote tip and published.
    Synced { commit: String },
}

#[derive(Debug, Error)]
pub enum SyncError {
    /// The local commit could not be replayed onto the remote tip. The
    /// rebase was aborted, restoring the pre-rebase tree. Requires operator
    /// intervention; never retried.
    #[error("rebase onto {upstream} conflicts; manual resolution required")]
    Conflict { upstream: String },

    /// A network step kept failing until the retry budget ran out.
    #[error("{step} failed after retries: {source}")]
    Network {
        step: SyncStep,
        #[source]
        source: GitError,
    },

    /// A local git step failed; deterministic, never retried.
    #[error("{step} failed: {source}")]
    Command {
        step: SyncStep,
        #[source]
        source: GitError,
    },
}

/// Build the commit message: fixed prefix plus the run date in the
/// configured zone, e.g. `Update news 20250115`.
pub fn commit_message(prefix: &str, offset: FixedOffset, now: DateTime<Utc>) -> String {
    format!("{prefix} {}", now.with_timezone(&offset).format("%Y%m%d"))
}

/// Run the synchronization protocol once against `git`'s working directory.
pub fn sync_repo(git: &Git, cfg: &RunConfig, log: &RunLog) -> Result<SyncOutcome, SyncError> {
    let runtime_paths = cfg.runtime_paths();

    // Clean: reconcile to a known baseline. Only orchestrator-owned runtime
    // paths are touched; task output and any other working-tree state stay
    // as the task left them.
    log.info("sync: reconciling runtime paths");
    if let Some(url) = &cfg.remote_url {
        git.set_remote_url(&cfg.remote, url)
            .map_err(|source| command(SyncStep::Clean, source))?;
    }
    // Untracked runtime files (the live run log, the heartbeat) are left on
    // disk; unstaging below keeps them out of the commit, and deleting them
    // here would destroy the log we are currently writing.
    git.restore_paths(&runtime_paths);

    // Stage: everything the task produced, minus our own runtime artifacts.
    git.add_all()
        .map_err(|source| command(SyncStep::Stage, source))?;
    git.unstage_paths(&runtime_paths)
        .map_err(|source| command(SyncStep::Stage, source))?;
    if !git
        .has_staged_changes()
        .map_err(|source| command(SyncStep::Stage, source))?
    {
        log.info("sync: no changes to commit");
        info!("no changes to sync");
        return Ok(SyncOutcome::NoChanges);
    }

    let message = commit_message(&cfg.commit_prefix, cfg.offset(), Utc::now());
    log.info(&format!("sync: committing `{message}`"));
    git.commit(&cfg.author_name, &cfg.author_email, &message)
        .map_err(|source| command(SyncStep::Commit, source))?;

    let policy = cfg.retry.policy();

    log.info(&format!("sync: fetching {}/{}", cfg.remote, cfg.branch));
    with_retry(&policy, "fetch", || git.fetch(&cfg.remote, &cfg.branch))
        .map_err(|source| network(SyncStep::Fetch, source))?;

    let upstream = format!("{}/{}", cfg.remote, cfg.branch);
    log.info(&format!("sync: rebasing onto {upstream}"));
    if let Err(source) = git.rebase(&upstream) {
        warn!(error = %source, "rebase failed, aborting to restore the tree");
        log.error(&format!("sync: rebase onto {upstream} failed, aborting"));
        git.rebase_abort();
        return Err(SyncError::Conflict { upstream });
    }

    log.info(&format!("sync: pushing to {}/{}", cfg.remote, cfg.branch));
    with_retry(&policy, "push", || git.push(&cfg.remote, &cfg.branch))
        .map_err(|source| network(SyncStep::Push, source))?;

    let commit = git
        .head_short_sha()
        .map_err(|source| command(SyncStep::Push, source))?;
    log.info(&format!("sync: pushed {commit}"));
    info!(commit, "sync complete");
    Ok(SyncOutcome::Synced { commit })
}

fn command(step: SyncStep, source: GitError) -> SyncError {
    SyncError::Command { step, source }
}

/// Exhausted retries on a transient error surface as a network failure;
/// a terminal error on a network step stays a command failure.
fn network(step: SyncStep, source: GitError) -> SyncError {
    if source.is_transient() {
        SyncError::Network { step, source }
    } else {
        SyncError::Command { step, source }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn commit_message_uses_the_configured_offset() {
        // 2025-01-16 03:30 UTC is still 2025-01-15 in UTC-5.
        let now = Utc.with_ymd_and_hms(2025, 1, 16, 3, 30, 0).single().expect("ts");
        let offset = FixedOffset::east_opt(-5 * 3600).expect("offset");
        assert_eq!(commit_message("Update news", offset, now), "Update news 20250115");

        let utc = FixedOffset::east_opt(0).expect("offset");
        assert_eq!(commit_message("Update news", utc, now), "Update news 20250116");
    }

    #[test]
    fn exhausted_transport_error_maps_to_network_failure() {
        let err = network(
            SyncStep::Push,
            GitError::Transport {
                args: "push origin HEAD:main".to_string(),
                detail: "could not resolve host".to_string(),
            },
        );
        assert!(matches!(
            err,
            SyncError::Network {
                step: SyncStep::Push,
                ..
            }
        ));
    }

    #[test]
    fn terminal_error_on_network_step_stays_a_command_failure() {
        let err = network(
            SyncStep::Fetch,
            GitError::Command {
                args: "fetch origin main".to_string(),
                detail: "Authentication failed".to_string(),
            },
        );
        assert!(matches!(
            err,
            SyncError::Command {
                step: SyncStep::Fetch,
                ..
            }
        ));
    }

    #[test]
    fn step_names_render_for_logs() {
        assert_eq!(SyncStep::Clean.to_string(), "clean");
        assert_eq!(SyncStep::Push.to_string(), "push");
    }
}
