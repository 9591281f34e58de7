//! Runner for the external content-generation task.
//!
//! The task is an opaque executable: it reads and writes its own files and
//! reports success through its exit status. Its output is teed line by line
//! to the run log and to the orchestrator's own streams, while only a
//! bounded tail is kept in memory so a runaway task cannot grow the
//! orchestrator without bound.
//!
//! No timeout is imposed on the task. That is deliberate, not an oversight:
//! the task is trusted to terminate, and a hung task shows up as a stuck
//! lock which the next trigger repairs via staleness eviction.

use std::io::{BufRead, BufReader, Read, Write};
use std::path::Path;
use std::process::{Command, Stdio};
use std::thread;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, warn};

use crate::io::log_sink::RunLog;

#[derive(Debug, Clone)]
pub struct TaskRequest<'a> {
    pub workdir: &'a Path,
    /// Argv vector; the first element is the program.
    pub command: &'a [String],
    /// Keep at most this many bytes (the most recent ones) per stream.
    pub output_limit_bytes: usize,
}

/// Result of one task execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Success {
        /// Bounded tail of the merged output, for the run report.
        tail: String,
    },
    Failed {
        /// `None` when the task could not be launched at all.
        exit_code: Option<i32>,
        tail: String,
    },
}

/// Execute the task and map its exit status to an outcome.
///
/// Only exit status 0 counts as success. A spawn failure is a task failure
/// (the supervisor retries on the next trigger), not an orchestrator error.
pub fn run_task(request: &TaskRequest<'_>, log: &RunLog) -> Result<TaskOutcome> {
    let (program, args) = request
        .command
        .split_first()
        .ok_or_else(|| anyhow!("task command is empty"))?;

    debug!(program, args = ?args, workdir = %request.workdir.display(), "spawning task");
    log.info(&format!("task: starting `{}`", request.command.join(" ")));

    let mut child = match Command::new(program)
        .args(args)
        .current_dir(request.workdir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
    {
        Ok(child) => child,
        Err(err) => {
            let detail = format!("task: failed to launch `{program}`: {err}");
            log.error(&detail);
            return Ok(TaskOutcome::Failed {
                exit_code: None,
                tail: detail,
            });
        }
    };

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("task stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("task stderr was not piped"))?;

    let limit = request.output_limit_bytes;
    let out_log = log.clone();
    let err_log = log.clone();
    let stdout_handle =
        thread::spawn(move || tee_stream(stdout, "stdout", limit, &out_log, &mut std::io::stdout()));
    let stderr_handle =
        thread::spawn(move || tee_stream(stderr, "stderr", limit, &err_log, &mut std::io::stderr()));

    let status = child.wait().context("wait for task")?;

    let stdout_tail = join_tee(stdout_handle).context("join task stdout")?;
    let stderr_tail = join_tee(stderr_handle).context("join task stderr")?;
    let tail = merge_tails(&stdout_tail, &stderr_tail, limit);

    if status.success() {
        log.info("task: completed successfully");
        Ok(TaskOutcome::Success { tail })
    } else {
        let code = status.code();
        log.error(&format!("task: failed with exit status {code:?}"));
        Ok(TaskOutcome::Failed {
            exit_code: code,
            tail,
        })
    }
}

fn join_tee(handle: thread::JoinHandle<Vec<u8>>) -> Result<Vec<u8>> {
    handle
        .join()
        .map_err(|_| anyhow!("task output reader thread panicked"))
}

/// Read `reader` line by line: forward each line to the run log and to
/// `own_stream`, and keep only the last `limit` bytes.
fn tee_stream<R: Read, W: Write>(
    reader: R,
    stream: &str,
    limit: usize,
    log: &RunLog,
    own_stream: &mut W,
) -> Vec<u8> {
    let mut buf_reader = BufReader::new(reader);
    let mut tail: Vec<u8> = Vec::new();

    loop {
        let mut line = Vec::new();
        match buf_reader.read_until(b'\n', &mut line) {
            Ok(0) => break,
            Ok(_) => {}
            Err(err) => {
                warn!(stream, error = %err, "failed to read task output");
                break;
            }
        }

        if let Err(err) = own_stream.write_all(&line).and_then(|()| own_stream.flush()) {
            warn!(stream, error = %err, "failed to forward task output");
        }
        let text = String::from_utf8_lossy(&line);
        log.task_line(stream, text.trim_end_matches(['\n', '\r']));

        push_tail(&mut tail, &line, limit);
    }

    tail
}

/// Append `line`, then trim from the front so the buffer holds the tail.
fn push_tail(buf: &mut Vec<u8>, line: &[u8], limit: usize) {
    if line.len() >= limit {
        buf.clear();
        buf.extend_from_slice(&line[line.len() - limit..]);
        return;
    }
    buf.extend_from_slice(line);
    if buf.len() > limit {
        let excess = buf.len() - limit;
        buf.drain(..excess);
    }
}

fn merge_tails(stdout: &[u8], stderr: &[u8], limit: usize) -> String {
    let mut merged = Vec::with_capacity(stdout.len() + stderr.len());
    merged.extend_from_slice(stdout);
    merged.extend_from_slice(stderr);
    if merged.len() > limit {
        let excess = merged.len() - limit;
        merged.drain(..excess);
    }
    String::from_utf8_lossy(&merged).into_owned()
}
