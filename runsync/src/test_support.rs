//! Test-only fixtures: a real git remote plus a working clone in a tempdir.
//!
//! Integration tests drive the orchestrator against actual git repositories
//! so fetch, rebase, and push run for real rather than against stubs. The
//! "remote" is a local bare repository, which exercises the full transport
//! path without any network.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use tempfile::TempDir;

use crate::io::config::RunConfig;

/// A bare `origin` and a seeded working clone under one tempdir.
///
/// The working clone starts on `main` with a single commit containing
/// `story.md`, matching the steady state the orchestrator expects.
pub struct TestRemote {
    _temp: TempDir,
    /// Path of the bare repository the work clone pushes to.
    pub remote: PathBuf,
    /// Path of the working clone the orchestrator runs in.
    pub work: PathBuf,
}

impl TestRemote {
    pub fn new() -> Self {
        let temp = tempfile::tempdir().expect("tempdir");
        let remote = temp.path().join("remote.git");
        let work = temp.path().join("work");
        fs::create_dir(&remote).expect("create remote dir");
        fs::create_dir(&work).expect("create work dir");

        git_in(&remote, &["init", "--bare", "--initial-branch", "main"]);

        git_in(&work, &["init", "--initial-branch", "main"]);
        git_in(&work, &["config", "user.email", "test@example.com"]);
        git_in(&work, &["config", "user.name", "test"]);
        fs::write(work.join("story.md"), "day one\n").expect("seed story.md");
        git_in(&work, &["add", "story.md"]);
        git_in(&work, &["commit", "-m", "seed"]);
        git_in(&work, &["remote", "add", "origin", remote.to_str().expect("utf8 path")]);
        git_in(&work, &["push", "-u", "origin", "main"]);

        Self {
            _temp: temp,
            remote,
            work,
        }
    }

    /// A config pointed at the working clone, with short timings so lock
    /// and retry tests stay fast. The task command must be set by the test.
    pub fn config(&self) -> RunConfig {
        RunConfig {
            workdir: self.work.clone(),
            retry: crate::io::config::RetryConfig {
                base_delay_ms: 10,
                ..Default::default()
            },
            ..RunConfig::default()
        }
    }

    /// Run a git command in the working clone, asserting success.
    pub fn git(&self, args: &[&str]) {
        git_in(&self.work, args);
    }

    /// Commit and push a change from "someone else" via a fresh clone,
    /// advancing the remote behind the orchestrator's back.
    pub fn push_remote_change(&self, file: &str, contents: &str, message: &str) {
        let clone = self._temp.path().join("other");
        if clone.exists() {
            fs::remove_dir_all(&clone).expect("reset other clone");
        }
        let status = Command::new("git")
            .args([
                "clone",
                self.remote.to_str().expect("utf8 path"),
                clone.to_str().expect("utf8 path"),
            ])
            .status()
            .expect("git clone");
        assert!(status.success());
        git_in(&clone, &["config", "user.email", "other@example.com"]);
        git_in(&clone, &["config", "user.name", "other"]);
        fs::write(clone.join(file), contents).expect("write remote-side file");
        git_in(&clone, &["add", file]);
        git_in(&clone, &["commit", "-m", message]);
        git_in(&clone, &["push", "origin", "main"]);
    }

    /// Subject line of the remote's `main` head commit.
    pub fn remote_head_subject(&self) -> String {
        git_stdout(&self.remote, &["log", "-1", "--format=%s", "main"])
            .trim()
            .to_string()
    }

    /// Number of commits on the remote's `main`.
    pub fn remote_commit_count(&self) -> usize {
        git_stdout(&self.remote, &["rev-list", "--count", "main"])
            .trim()
            .parse()
            .expect("commit count")
    }

    /// Blob paths in the remote's `main` head tree.
    pub fn remote_tree_paths(&self) -> Vec<String> {
        git_stdout(&self.remote, &["ls-tree", "-r", "--name-only", "main"])
            .lines()
            .map(str::to_string)
            .collect()
    }
}

impl Default for TestRemote {
    fn default() -> Self {
        Self::new()
    }
}

fn git_in(dir: &Path, args: &[&str]) {
    let status = Command::new("git")
        .args(args)
        .current_dir(dir)
        .status()
        .unwrap_or_else(|err| panic!("spawn git {args:?}: {err}"));
    assert!(status.success(), "git {args:?} failed in {}", dir.display());
}

fn git_stdout(dir: &Path, args: &[&str]) -> String {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .unwrap_or_else(|err| panic!("spawn git {args:?}: {err}"));
    assert!(
        output.status.success(),
        "git {args:?} failed in {}",
        dir.display()
    );
    String::from_utf8(output.stdout).expect("git output utf8")
}
