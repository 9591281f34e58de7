//! Git adapter for the sync protocol.
//!
//! The orchestrator drives git deterministically, so we keep a small,
//! explicit wrapper around `git` subprocess calls. Every call is bounded by
//! a wall-clock timeout, and failures carry an explicit classification so
//! the retry policy can dispatch on error kind instead of sniffing output
//! at the call site.

use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};
use std::thread;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, warn};
use wait_timeout::ChildExt;

use crate::retry::Transient;

#[derive(Debug, Error)]
pub enum GitError {
    #[error("spawn git {args}: {source}")]
    Spawn {
        args: String,
        #[source]
        source: io::Error,
    },

    #[error("git {args}: {source}")]
    Io {
        args: String,
        #[source]
        source: io::Error,
    },

    /// The subprocess exceeded its wall-clock bound and was killed.
    #[error("git {args} timed out after {}s", timeout.as_secs())]
    Timeout { args: String, timeout: Duration },

    /// Terminal command failure: misconfiguration, bad ref, rejected auth.
    #[error("git {args} failed: {detail}")]
    Command { args: String, detail: String },

    /// Transport-level failure on a network step; plausibly temporary.
    #[error("git {args} transport error: {detail}")]
    Transport { args: String, detail: String },
}

impl Transient for GitError {
    fn is_transient(&self) -> bool {
        matches!(
            self,
            GitError::Transport { .. } | GitError::Timeout { .. }
        )
    }
}

struct GitOutput {
    status: ExitStatus,
    stdout: String,
    stderr: String,
}

impl GitOutput {
    fn detail(&self) -> String {
        let err = self.stderr.trim();
        if err.is_empty() {
            self.stdout.trim().to_string()
        } else {
            err.to_string()
        }
    }
}

/// Wrapper for executing git commands in a working directory.
#[derive(Debug, Clone)]
pub struct Git {
    workdir: PathBuf,
    timeout: Duration,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            workdir: workdir.into(),
            timeout,
        }
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// Point `remote` at `url` (credentials already embedded by the caller).
    pub fn set_remote_url(&self, remote: &str, url: &str) -> Result<(), GitError> {
        self.run_checked(&["remote", "set-url", remote, url])?;
        Ok(())
    }

    /// Restore the tracked state of `paths`, tolerating paths that are
    /// untracked or absent (git errors on those, which is fine here).
    pub fn restore_paths(&self, paths: &[String]) {
        for path in paths {
            match self.run(&["checkout", "--", path]) {
                Ok(out) if out.status.success() => {}
                Ok(out) => debug!(path, detail = %out.detail(), "restore skipped"),
                Err(err) => warn!(path, error = %err, "restore failed"),
            }
        }
    }

    /// Stage all changes (respects .gitignore).
    pub fn add_all(&self) -> Result<(), GitError> {
        self.run_checked(&["add", "-A"])?;
        Ok(())
    }

    /// Drop `paths` from the pending commit set, keeping them on disk.
    pub fn unstage_paths(&self, paths: &[String]) -> Result<(), GitError> {
        let mut args = vec!["reset", "-q", "--"];
        args.extend(paths.iter().map(String::as_str));
        self.run_checked(&args)?;
        Ok(())
    }

    /// True if there is anything staged for commit.
    pub fn has_staged_changes(&self) -> Result<bool, GitError> {
        let args = ["diff", "--cached", "--quiet"];
        let out = self.run(&args)?;
        match out.status.code() {
            Some(0) => Ok(false),
            Some(1) => Ok(true),
            _ => Err(GitError::Command {
                args: args.join(" "),
                detail: out.detail(),
            }),
        }
    }

    /// Commit staged changes with the given author identity, without
    /// mutating the repository's own config.
    pub fn commit(&self, name: &str, email: &str, message: &str) -> Result<(), GitError> {
        let user_name = format!("user.name={name}");
        let user_email = format!("user.email={email}");
        self.run_checked(&[
            "-c",
            &user_name,
            "-c",
            &user_email,
            "commit",
            "-m",
            message,
        ])?;
        Ok(())
    }

    /// Retrieve the remote branch's latest history (network-sensitive).
    pub fn fetch(&self, remote: &str, branch: &str) -> Result<(), GitError> {
        self.run_network(&["fetch", remote, branch])
    }

    /// Replay local commits on top of `upstream` (e.g. `origin/main`).
    pub fn rebase(&self, upstream: &str) -> Result<(), GitError> {
        self.run_checked(&["rebase", upstream])?;
        Ok(())
    }

    /// Abort an in-progress rebase, restoring the pre-rebase tree.
    /// Best effort: failure is logged, not propagated, because the caller
    /// is already on an error path.
    pub fn rebase_abort(&self) {
        match self.run(&["rebase", "--abort"]) {
            Ok(out) if out.status.success() => {}
            Ok(out) => warn!(detail = %out.detail(), "rebase --abort failed"),
            Err(err) => warn!(error = %err, "rebase --abort failed"),
        }
    }

    /// Publish the local branch head to the remote (network-sensitive).
    pub fn push(&self, remote: &str, branch: &str) -> Result<(), GitError> {
        let refspec = format!("HEAD:{branch}");
        self.run_network(&["push", remote, &refspec])
    }

    /// Short SHA of the current HEAD.
    pub fn head_short_sha(&self) -> Result<String, GitError> {
        let out = self.run_checked(&["rev-parse", "--short=12", "HEAD"])?;
        Ok(out.stdout.trim().to_string())
    }

    fn run_checked(&self, args: &[&str]) -> Result<GitOutput, GitError> {
        let out = self.run(args)?;
        if !out.status.success() {
            return Err(GitError::Command {
                args: args.join(" "),
                detail: out.detail(),
            });
        }
        Ok(out)
    }

    /// Like [`Self::run_checked`], but classifies failures on a
    /// network-facing step: transport-looking stderr becomes
    /// [`GitError::Transport`] (retryable), anything else stays terminal.
    fn run_network(&self, args: &[&str]) -> Result<(), GitError> {
        let out = self.run(args)?;
        if out.status.success() {
            return Ok(());
        }
        let detail = out.detail();
        if is_transport_error(&detail) {
            Err(GitError::Transport {
                args: args.join(" "),
                detail,
            })
        } else {
            Err(GitError::Command {
                args: args.join(" "),
                detail,
            })
        }
    }

    fn run(&self, args: &[&str]) -> Result<GitOutput, GitError> {
        let rendered = args.join(" ");
        debug!(args = %rendered, workdir = %self.workdir.display(), "running git");

        let mut child = Command::new("git")
            .args(args)
            .current_dir(&self.workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| GitError::Spawn {
                args: rendered.clone(),
                source,
            })?;

        let stdout = child.stdout.take().ok_or_else(|| GitError::Io {
            args: rendered.clone(),
            source: io::Error::other("stdout was not piped"),
        })?;
        let stderr = child.stderr.take().ok_or_else(|| GitError::Io {
            args: rendered.clone(),
            source: io::Error::other("stderr was not piped"),
        })?;

        // Drain both pipes off-thread so a chatty command cannot deadlock
        // against a full pipe buffer while we wait on it.
        let stdout_handle = thread::spawn(move || read_to_string_lossy(stdout));
        let stderr_handle = thread::spawn(move || read_to_string_lossy(stderr));

        let status = match child.wait_timeout(self.timeout).map_err(|source| GitError::Io {
            args: rendered.clone(),
            source,
        })? {
            Some(status) => status,
            None => {
                warn!(args = %rendered, timeout_secs = self.timeout.as_secs(), "git timed out, killing");
                child.kill().map_err(|source| GitError::Io {
                    args: rendered.clone(),
                    source,
                })?;
                child.wait().map_err(|source| GitError::Io {
                    args: rendered.clone(),
                    source,
                })?;
                return Err(GitError::Timeout {
                    args: rendered,
                    timeout: self.timeout,
                });
            }
        };

        let stdout = join_reader(stdout_handle, &rendered)?;
        let stderr = join_reader(stderr_handle, &rendered)?;
        debug!(args = %rendered, exit_code = ?status.code(), "git finished");

        Ok(GitOutput {
            status,
            stdout,
            stderr,
        })
    }
}

fn join_reader(handle: thread::JoinHandle<String>, args: &str) -> Result<String, GitError> {
    handle.join().map_err(|_| GitError::Io {
        args: args.to_string(),
        source: io::Error::other("output reader thread panicked"),
    })
}

fn read_to_string_lossy<R: Read>(mut reader: R) -> String {
    let mut buf = Vec::new();
    let _ = reader.read_to_end(&mut buf);
    String::from_utf8_lossy(&buf).into_owned()
}

/// Heuristic over git's stderr for transport-level failures. Auth errors
/// deliberately do not match: retrying bad credentials is wasted time.
fn is_transport_error(detail: &str) -> bool {
    const MARKERS: &[&str] = &[
        "could not resolve host",
        "failed to connect",
        "connection refused",
        "connection reset",
        "connection timed out",
        "operation timed out",
        "network is unreachable",
        "early eof",
        "the remote end hung up",
        "gnutls recv error",
        "rpc failed",
    ];
    let lower = detail.to_ascii_lowercase();
    MARKERS.iter().any(|marker| lower.contains(marker))
}
