//! Orchestration of one full run: lock, task, sync, heartbeat, report.

use std::fs;

use anyhow::{Context, Result};
use chrono::Utc;
use serde::Serialize;
use tracing::{info, instrument, warn};

use crate::exit_codes;
use crate::io::config::RunConfig;
use crate::io::git::Git;
use crate::io::heartbeat;
use crate::io::lock::{self, LockError};
use crate::io::log_sink::RunLog;
use crate::io::process::{TaskOutcome, TaskRequest, run_task};
use crate::sync::{SyncOutcome, sync_repo};

/// Final state of one orchestrator invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Task succeeded, local commit published to the remote.
    Synced,
    /// Task succeeded, nothing to publish.
    NoChanges,
    /// Another run holds the lock; this trigger was skipped.
    Locked,
    /// The task itself failed; sync was skipped.
    TaskFailed,
    /// The task succeeded but synchronization failed.
    SyncFailed,
}

/// Summary of the run, also serialized to `logs/last_run.json`.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub status: RunStatus,
    pub exit_code: i32,
    /// Short SHA of the published commit, for `Synced` only.
    pub commit: Option<String>,
    /// The task's exit code when it failed (None if it never launched).
    pub task_exit_code: Option<i32>,
    /// Human-readable failure detail, when there is one.
    pub detail: Option<String>,
    pub finished_at: String,
}

impl RunReport {
    fn new(status: RunStatus, exit_code: i32) -> Self {
        Self {
            status,
            exit_code,
            commit: None,
            task_exit_code: None,
            detail: None,
            finished_at: Utc::now().to_rfc3339(),
        }
    }
}

/// Execute one run end to end and map the result to an exit code.
///
/// The lock guard is scoped to this function, so the lock is released on
/// every path out of it — task failure, sync failure, and early `?` returns
/// included. `Err` is reserved for orchestrator-internal failures (log or
/// lock I/O); every expected outcome is an `Ok(RunReport)`.
#[instrument(skip_all)]
pub fn run_once(cfg: &RunConfig) -> Result<RunReport> {
    let today = Utc::now().with_timezone(&cfg.offset()).date_naive();
    let log = RunLog::open(&cfg.log_dir(), today)?;
    log.info("run started");

    let guard = match lock::acquire(&cfg.lock_path(), cfg.lock_stale_after()) {
        Ok(guard) => guard,
        Err(LockError::Contention { age_secs, .. }) => {
            warn!(age_secs, "lock contention, skipping this trigger");
            log.warn(&format!(
                "another run holds the lock (age {age_secs}s); skipping this trigger"
            ));
            let mut report = RunReport::new(RunStatus::Locked, exit_codes::LOCKED);
            report.detail = Some(format!("lock held for {age_secs}s"));
            return finish(cfg, &log, report);
        }
        Err(err @ LockError::Io { .. }) => return Err(err).context("acquire run lock"),
    };
    // From here on the guard owns the lock file; it drops on every path out.
    let _guard = guard;

    let outcome = run_task(
        &TaskRequest {
            workdir: &cfg.workdir,
            command: &cfg.task_command,
            output_limit_bytes: cfg.task_output_limit_bytes,
        },
        &log,
    )?;

    let report = match outcome {
        TaskOutcome::Failed { exit_code, tail } => {
            log.error("task failed; skipping git sync");
            let mut report = RunReport::new(RunStatus::TaskFailed, exit_codes::TASK);
            report.task_exit_code = exit_code;
            report.detail = Some(tail);
            report
        }
        TaskOutcome::Success { .. } => {
            let git = Git::new(&cfg.workdir, cfg.git_timeout());
            match sync_repo(&git, cfg, &log) {
                Ok(SyncOutcome::NoChanges) => {
                    heartbeat::touch(&cfg.heartbeat_path(), Utc::now())
                        .context("update heartbeat")?;
                    RunReport::new(RunStatus::NoChanges, exit_codes::OK)
                }
                Ok(SyncOutcome::Synced { commit }) => {
                    heartbeat::touch(&cfg.heartbeat_path(), Utc::now())
                        .context("update heartbeat")?;
                    let mut report = RunReport::new(RunStatus::Synced, exit_codes::OK);
                    report.commit = Some(commit);
                    report
                }
                Err(err) => {
                    log.error(&format!("sync failed: {err}"));
                    let mut report = RunReport::new(RunStatus::SyncFailed, exit_codes::SYNC);
                    report.detail = Some(err.to_string());
                    report
                }
            }
        }
    };

    info!(status = ?report.status, exit_code = report.exit_code, "run finished");
    finish(cfg, &log, report)
}

/// Persist `last_run.json` and close out the run log.
fn finish(cfg: &RunConfig, log: &RunLog, report: RunReport) -> Result<RunReport> {
    let path = cfg.log_dir().join("last_run.json");
    let mut buf = serde_json::to_string_pretty(&report).context("serialize run report")?;
    buf.push('\n');
    fs::write(&path, buf).with_context(|| format!("write {}", path.display()))?;
    log.info(&format!("run finished (exit code {})", report.exit_code));
    Ok(report)
}
