//! End-to-end lifecycle tests: one full orchestrator run against real git.
//!
//! Each test stands up a bare "origin" plus a working clone, points the
//! config at the clone, and drives `run_once` with a real task command,
//! then asserts on exit code, remote history, and on-disk runtime state.

use std::fs;
use std::process::Command;
use std::thread;
use std::time::Duration;

use runsync::exit_codes;
use runsync::run::{RunStatus, run_once};
use runsync::test_support::TestRemote;

fn task(script: &str) -> Vec<String> {
    vec!["sh".to_string(), "-c".to_string(), script.to_string()]
}

/// Task succeeds but produces no file changes: nothing is committed, the
/// heartbeat still advances, and the lock is released.
#[test]
fn successful_noop_task_syncs_nothing() {
    let remote = TestRemote::new();
    let mut cfg = remote.config();
    cfg.task_command = task("true");

    let before = remote.remote_commit_count();
    let report = run_once(&cfg).expect("run");

    assert_eq!(report.status, RunStatus::NoChanges);
    assert_eq!(report.exit_code, exit_codes::OK);
    assert_eq!(report.commit, None);
    assert_eq!(remote.remote_commit_count(), before);
    assert!(cfg.heartbeat_path().exists(), "heartbeat after success");
    assert!(!cfg.lock_path().exists(), "lock released");
}

/// Task writes content: one commit lands on the remote with the dated
/// message, and the report carries the published short SHA.
#[test]
fn successful_task_publishes_one_commit() {
    let remote = TestRemote::new();
    let mut cfg = remote.config();
    cfg.task_command = task("echo 'day two' > story.md");

    let before = remote.remote_commit_count();
    let report = run_once(&cfg).expect("run");

    assert_eq!(report.status, RunStatus::Synced);
    assert_eq!(report.exit_code, exit_codes::OK);
    assert!(report.commit.is_some(), "published commit sha");
    assert_eq!(remote.remote_commit_count(), before + 1);
    assert!(
        remote.remote_head_subject().starts_with("Update news "),
        "dated commit message, got {:?}",
        remote.remote_head_subject()
    );
    assert!(cfg.heartbeat_path().exists());
}

/// Task fails: sync never runs, the task's exit code is reported, and the
/// heartbeat is not touched.
#[test]
fn failing_task_skips_sync() {
    let remote = TestRemote::new();
    let mut cfg = remote.config();
    cfg.task_command = task("echo boom >&2; exit 5");

    let before = remote.remote_commit_count();
    let report = run_once(&cfg).expect("run");

    assert_eq!(report.status, RunStatus::TaskFailed);
    assert_eq!(report.exit_code, exit_codes::TASK);
    assert_eq!(report.task_exit_code, Some(5));
    assert!(report.detail.unwrap_or_default().contains("boom"));
    assert_eq!(remote.remote_commit_count(), before);
    assert!(!cfg.heartbeat_path().exists(), "no heartbeat on failure");
    assert!(!cfg.lock_path().exists(), "lock released on failure too");
}

/// A live foreign lock skips the whole run, including the task, and the
/// foreign lock file is left exactly as found.
#[test]
fn fresh_foreign_lock_skips_the_run() {
    let remote = TestRemote::new();
    let mut cfg = remote.config();
    cfg.task_command = task("touch marker.txt");

    fs::write(cfg.lock_path(), "99999\n").expect("plant foreign lock");
    let report = run_once(&cfg).expect("run");

    assert_eq!(report.status, RunStatus::Locked);
    assert_eq!(report.exit_code, exit_codes::LOCKED);
    assert!(!remote.work.join("marker.txt").exists(), "task never ran");
    let contents = fs::read_to_string(cfg.lock_path()).expect("foreign lock survives");
    assert_eq!(contents, "99999\n");
}

/// Runtime artifacts (lock, heartbeat, log dir) never reach the remote,
/// even when the task dirties the tree around them.
#[test]
fn runtime_paths_are_never_committed() {
    let remote = TestRemote::new();
    let mut cfg = remote.config();
    cfg.task_command = task("echo 'day three' > story.md");

    let report = run_once(&cfg).expect("run");
    assert_eq!(report.status, RunStatus::Synced);

    let paths = remote.remote_tree_paths();
    assert!(paths.contains(&"story.md".to_string()));
    assert!(!paths.iter().any(|p| p == ".run.lock"));
    assert!(!paths.iter().any(|p| p == ".last_run"));
    assert!(!paths.iter().any(|p| p.starts_with("logs/")));
}

/// SIGTERM mid-run releases the lock before exiting: the guard's `Drop`
/// never runs on a signal exit, so the handler has to remove the file, and
/// the next trigger must not be blocked for the staleness window.
#[test]
fn sigterm_during_a_run_releases_the_lock() {
    let remote = TestRemote::new();
    let mut cfg = remote.config();
    cfg.task_command = task("sleep 30");
    // Config lives outside the workdir so it never enters the sync.
    let config_path = remote.work.parent().expect("tempdir").join("config.toml");
    let rendered = toml::to_string_pretty(&cfg).expect("render config");
    fs::write(&config_path, rendered).expect("write config");

    let mut child = Command::new(env!("CARGO_BIN_EXE_runsync"))
        .args(["run", "--config"])
        .arg(&config_path)
        .spawn()
        .expect("spawn runsync");

    let lock = cfg.lock_path();
    for _ in 0..100 {
        if lock.exists() {
            break;
        }
        thread::sleep(Duration::from_millis(50));
    }
    assert!(lock.exists(), "run never took the lock");

    let kill = Command::new("kill")
        .args(["-TERM", &child.id().to_string()])
        .status()
        .expect("send SIGTERM");
    assert!(kill.success());

    let status = child.wait().expect("wait for runsync");
    assert_eq!(status.code(), Some(exit_codes::INTERRUPTED));
    assert!(!lock.exists(), "lock released on termination");
}

/// Every run leaves a machine-readable `last_run.json` next to the logs.
#[test]
fn run_report_is_persisted_as_json() {
    let remote = TestRemote::new();
    let mut cfg = remote.config();
    cfg.task_command = task("true");

    run_once(&cfg).expect("run");

    let raw = fs::read_to_string(cfg.log_dir().join("last_run.json")).expect("report file");
    let value: serde_json::Value = serde_json::from_str(&raw).expect("valid json");
    assert_eq!(value["status"], "no_changes");
    assert_eq!(value["exit_code"], 0);
}
