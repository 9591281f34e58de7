//! Run an external content task and sync its output to a git remote.
//!
//! Invoked once per scheduler trigger (cron, systemd timer); calendar logic
//! lives outside. The exit code is the contract with the supervisor, see
//! [`runsync::exit_codes`].

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use runsync::io::config::load_config;
use runsync::io::{heartbeat, lock};
use runsync::{exit_codes, logging, run};
use tracing::warn;

#[derive(Parser)]
#[command(
    name = "runsync",
    version,
    about = "Run a content-generation task and sync its output to a git remote"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Execute one run: task first, git sync only on success.
    Run {
        /// Path to the TOML configuration file.
        #[arg(short, long, default_value = "config.toml")]
        config: PathBuf,
    },
    /// Validate the configuration and report heartbeat status.
    Check {
        /// Path to the TOML configuration file.
        #[arg(short, long, default_value = "config.toml")]
        config: PathBuf,
    },
}

fn main() {
    logging::init();
    install_signal_handler();
    let cli = Cli::parse();
    let code = match cli.command {
        Command::Run { config } => cmd_run(&config),
        Command::Check { config } => cmd_check(&config),
    };
    std::process::exit(code);
}

/// Release the run lock on SIGINT/SIGTERM.
///
/// A termination signal exits the process without unwinding, so the lock
/// guard's `Drop` never runs; without this handler an interrupted run would
/// leave a lock that blocks every trigger until staleness eviction kicks in.
fn install_signal_handler() {
    let result = ctrlc::set_handler(|| {
        lock::release_held_locks();
        std::process::exit(exit_codes::INTERRUPTED);
    });
    if let Err(err) = result {
        warn!(error = %err, "failed to install signal handler");
    }
}

fn cmd_run(config: &Path) -> i32 {
    let cfg = match load_config(config) {
        Ok(cfg) => cfg,
        Err(err) => {
            eprintln!("configuration error: {err:#}");
            return exit_codes::CONFIG;
        }
    };
    match run::run_once(&cfg) {
        Ok(report) => {
            println!(
                "run: status={:?} exit_code={} commit={}",
                report.status,
                report.exit_code,
                report.commit.as_deref().unwrap_or("-")
            );
            report.exit_code
        }
        Err(err) => {
            // Internal I/O failure around logs or the lock; the supervisor
            // retries on the next trigger.
            eprintln!("run failed: {err:#}");
            exit_codes::TASK
        }
    }
}

fn cmd_check(config: &Path) -> i32 {
    let cfg = match load_config(config) {
        Ok(cfg) => cfg,
        Err(err) => {
            eprintln!("configuration error: {err:#}");
            return exit_codes::CONFIG;
        }
    };
    println!("config: ok");
    println!("workdir: {}", cfg.workdir.display());
    println!("task: {}", cfg.task_command.join(" "));
    println!("remote: {}/{}", cfg.remote, cfg.branch);
    match heartbeat::age(&cfg.heartbeat_path(), chrono::Utc::now()) {
        Ok(Some(age)) => println!("heartbeat: {}s ago", age.as_secs()),
        Ok(None) => println!("heartbeat: never"),
        Err(err) => println!("heartbeat: unreadable ({err:#})"),
    }
    exit_codes::OK
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_run_with_default_config_path() {
        let cli = Cli::parse_from(["runsync", "run"]);
        match cli.command {
            Command::Run { config } => assert_eq!(config, PathBuf::from("config.toml")),
            Command::Check { .. } => panic!("expected run"),
        }
    }

    #[test]
    fn parse_check_with_explicit_config_path() {
        let cli = Cli::parse_from(["runsync", "check", "--config", "/etc/runsync.toml"]);
        match cli.command {
            Command::Check { config } => assert_eq!(config, PathBuf::from("/etc/runsync.toml")),
            Command::Run { .. } => panic!("expected check"),
        }
    }
}
