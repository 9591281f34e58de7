//! Resolved run configuration, loaded from a TOML file in the workdir.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use chrono::{FixedOffset, Offset, Utc};
use serde::{Deserialize, Serialize};

use crate::retry::RetryPolicy;

/// Immutable input for one orchestrator invocation (TOML).
///
/// This file is intended to be edited by humans and must remain stable and
/// automatable. Missing fields default to sensible values; the task command
/// is the only field with no usable default.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RunConfig {
    /// Git working directory the task writes into. Relative paths below
    /// resolve against it.
    pub workdir: PathBuf,

    /// Argv vector for the content-generation task (e.g. `["python3","gen.py"]`).
    pub task_command: Vec<String>,

    /// Remote name to fetch from and push to.
    pub remote: String,

    /// Branch synchronized on the remote.
    pub branch: String,

    /// Remote URL to apply before syncing, credentials already embedded.
    /// Left untouched when absent.
    pub remote_url: Option<String>,

    /// Commit author name.
    pub author_name: String,

    /// Commit author email.
    pub author_email: String,

    /// Fixed prefix for commit messages; the run date is appended.
    pub commit_prefix: String,

    /// UTC offset (hours) used for commit date tokens and log file names.
    pub utc_offset_hours: i32,

    /// Lock file guarding single-flight execution.
    pub lock_path: PathBuf,

    /// Age beyond which an existing lock file counts as abandoned.
    pub lock_stale_secs: u64,

    /// Liveness marker overwritten after every successful run.
    pub heartbeat_path: PathBuf,

    /// Directory for dated, size-rotated run logs.
    pub log_dir: PathBuf,

    /// Wall-clock bound for each individual git subprocess.
    pub git_timeout_secs: u64,

    /// Keep at most this many bytes (the tail) of task output in memory.
    pub task_output_limit_bytes: usize,

    pub retry: RetryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts per network operation (first try included).
    pub max_attempts: u32,

    /// Delay before the first retry, in milliseconds.
    pub base_delay_ms: u64,

    /// Exponential backoff multiplier.
    pub multiplier: f64,

    /// Upper bound on any single backoff delay, in milliseconds.
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 2_000,
            multiplier: 2.0,
            max_delay_ms: 60_000,
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            base_delay: Duration::from_millis(self.base_delay_ms),
            multiplier: self.multiplier,
            max_delay: Duration::from_millis(self.max_delay_ms),
        }
    }
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            workdir: PathBuf::from("."),
            task_command: Vec::new(),
            remote: "origin".to_string(),
            branch: "main".to_string(),
            remote_url: None,
            author_name: "Runsync Bot".to_string(),
            author_email: "bot@runsync.local".to_string(),
            commit_prefix: "Update news".to_string(),
            utc_offset_hours: -5,
            lock_path: PathBuf::from(".run.lock"),
            lock_stale_secs: 30 * 60,
            heartbeat_path: PathBuf::from(".last_run"),
            log_dir: PathBuf::from("logs"),
            git_timeout_secs: 300,
            task_output_limit_bytes: 256 * 1024,
            retry: RetryConfig::default(),
        }
    }
}

impl RunConfig {
    pub fn validate(&self) -> Result<()> {
        if self.task_command.is_empty() || self.task_command[0].trim().is_empty() {
            return Err(anyhow!("task_command must be a non-empty argv array"));
        }
        if self.remote.trim().is_empty() || self.branch.trim().is_empty() {
            return Err(anyhow!("remote and branch must be non-empty"));
        }
        if self.retry.max_attempts == 0 {
            return Err(anyhow!("retry.max_attempts must be > 0"));
        }
        if self.retry.multiplier < 1.0 {
            return Err(anyhow!("retry.multiplier must be >= 1.0"));
        }
        if self.git_timeout_secs == 0 {
            return Err(anyhow!("git_timeout_secs must be > 0"));
        }
        if self.task_output_limit_bytes == 0 {
            return Err(anyhow!("task_output_limit_bytes must be > 0"));
        }
        if self
            .utc_offset_hours
            .checked_mul(3600)
            .and_then(FixedOffset::east_opt)
            .is_none()
        {
            return Err(anyhow!(
                "utc_offset_hours {} is out of range",
                self.utc_offset_hours
            ));
        }
        Ok(())
    }

    /// Clock offset for date tokens. `validate` guarantees the range.
    pub fn offset(&self) -> FixedOffset {
        self.utc_offset_hours
            .checked_mul(3600)
            .and_then(FixedOffset::east_opt)
            .unwrap_or_else(|| Utc.fix())
    }

    pub fn lock_path(&self) -> PathBuf {
        self.resolve(&self.lock_path)
    }

    pub fn heartbeat_path(&self) -> PathBuf {
        self.resolve(&self.heartbeat_path)
    }

    pub fn log_dir(&self) -> PathBuf {
        self.resolve(&self.log_dir)
    }

    pub fn lock_stale_after(&self) -> Duration {
        Duration::from_secs(self.lock_stale_secs)
    }

    pub fn git_timeout(&self) -> Duration {
        Duration::from_secs(self.git_timeout_secs)
    }

    /// Workdir-relative path strings for the orchestrator's own runtime
    /// artifacts, as git should see them. These are restored during the
    /// clean step and unstaged before every commit.
    pub fn runtime_paths(&self) -> Vec<String> {
        [&self.lock_path, &self.heartbeat_path, &self.log_dir]
            .into_iter()
            .map(|p| p.to_string_lossy().into_owned())
            .collect()
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.workdir.join(path)
        }
    }
}

/// Load config from a TOML file.
///
/// A missing file is a configuration error: a sync bot with no task command
/// is never runnable, so there is no useful default to fall back to.
pub fn load_config(path: &Path) -> Result<RunConfig> {
    if !path.exists() {
        bail!("configuration file not found: {}", path.display());
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: RunConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn runnable() -> RunConfig {
        RunConfig {
            task_command: vec!["true".to_string()],
            ..RunConfig::default()
        }
    }

    #[test]
    fn load_missing_file_is_an_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        let err = load_config(&temp.path().join("missing.toml")).expect_err("missing config");
        assert!(err.to_string().contains("not found"));
    }

    #[test]
    fn write_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        let cfg = runnable();
        let buf = toml::to_string_pretty(&cfg).expect("serialize");
        fs::write(&path, buf).expect("write");
        let loaded = load_config(&path).expect("load");
        assert_eq!(loaded, cfg);
    }

    #[test]
    fn empty_task_command_is_rejected() {
        let cfg = RunConfig::default();
        assert!(cfg.validate().is_err());

        let cfg = RunConfig {
            task_command: vec!["  ".to_string()],
            ..RunConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn out_of_range_offset_is_rejected() {
        let cfg = RunConfig {
            utc_offset_hours: 30,
            ..runnable()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn extreme_offset_is_a_config_error_not_an_overflow() {
        // Multiplying by 3600 overflows i32 here; it must come back as a
        // validation error, and offset() must still fall back to UTC.
        let cfg = RunConfig {
            utc_offset_hours: 1_000_000,
            ..runnable()
        };
        assert!(cfg.validate().is_err());
        assert_eq!(cfg.offset(), Utc.fix());

        let cfg = RunConfig {
            utc_offset_hours: i32::MIN,
            ..runnable()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn relative_paths_resolve_against_workdir() {
        let cfg = RunConfig {
            workdir: PathBuf::from("/srv/stories"),
            ..runnable()
        };
        assert_eq!(cfg.lock_path(), PathBuf::from("/srv/stories/.run.lock"));
        assert_eq!(cfg.log_dir(), PathBuf::from("/srv/stories/logs"));
    }

    #[test]
    fn runtime_paths_cover_lock_heartbeat_and_logs() {
        let cfg = runnable();
        let paths = cfg.runtime_paths();
        assert_eq!(paths, vec![".run.lock", ".last_run", "logs"]);
    }
}
