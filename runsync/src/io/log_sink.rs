//! Dated, size-rotated run log.
//!
//! Every run appends to `logs/run_YYYYMMDD.log`: task output lines and sync
//! step results, consumed by operators and log shippers. Rotation keeps the
//! live file under 10 MiB with at most 7 numbered backups
//! (`run_20250115.log` → `run_20250115.log.1` → … → `.7`).

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use chrono::{NaiveDate, Utc};
use tracing::warn;

/// Maximum live log size before rotation (10 MiB).
pub const MAX_LOG_BYTES: u64 = 10 * 1024 * 1024;

/// Maximum number of rotated backup files to keep.
pub const MAX_ROTATED_FILES: usize = 7;

/// Append-only handle to the current run's dated log file.
///
/// Cheap to clone; clones share the same file and serialize writes, so the
/// task output reader threads and the driver can log concurrently.
#[derive(Clone)]
pub struct RunLog {
    inner: Arc<Inner>,
}

struct Inner {
    path: PathBuf,
    writer: Mutex<BufWriter<File>>,
}

impl RunLog {
    /// Open (appending) the dated log file under `dir`, rotating first if the
    /// previous contents grew past [`MAX_LOG_BYTES`].
    pub fn open(dir: &Path, date: NaiveDate) -> Result<Self> {
        fs::create_dir_all(dir).with_context(|| format!("create log dir {}", dir.display()))?;
        let path = dir.join(format!("run_{}.log", date.format("%Y%m%d")));
        rotate_if_needed(&path, MAX_LOG_BYTES, MAX_ROTATED_FILES)
            .with_context(|| format!("rotate {}", path.display()))?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("open {}", path.display()))?;
        Ok(Self {
            inner: Arc::new(Inner {
                path,
                writer: Mutex::new(BufWriter::new(file)),
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    pub fn info(&self, msg: &str) {
        self.write("INFO", msg);
    }

    pub fn warn(&self, msg: &str) {
        self.write("WARN", msg);
    }

    pub fn error(&self, msg: &str) {
        self.write("ERROR", msg);
    }

    /// Record one line of task output, tagged with its stream.
    pub fn task_line(&self, stream: &str, line: &str) {
        self.write("INFO", &format!("[task {stream}] {line}"));
    }

    fn write(&self, level: &str, msg: &str) {
        let ts = Utc::now().format("%Y-%m-%d %H:%M:%S");
        let line = format!("[{ts}] [{level}] {msg}\n");
        let Ok(mut writer) = self.inner.writer.lock() else {
            warn!(path = %self.inner.path.display(), "run log mutex poisoned, dropping line");
            return;
        };
        // Flush per line: the log must survive a crash mid-run.
        if let Err(err) = writer.write_all(line.as_bytes()).and_then(|()| writer.flush()) {
            warn!(path = %self.inner.path.display(), error = %err, "failed to write run log");
        }
    }
}

/// Rotate `log_path` if its size reached `max_bytes`.
///
/// Sequence (oldest first): `<name>.<max_files>` deleted, `<name>.<n>` →
/// `<name>.<n+1>`, `<name>` → `<name>.1`, fresh empty `<name>`. Returns
/// `true` if rotation occurred; a missing live file is not an error.
pub fn rotate_if_needed(log_path: &Path, max_bytes: u64, max_files: usize) -> io::Result<bool> {
    let size = match fs::metadata(log_path) {
        Ok(meta) => meta.len(),
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(err) => return Err(err),
    };
    if size < max_bytes {
        return Ok(false);
    }

    let oldest = numbered_path(log_path, max_files);
    if oldest.exists() {
        fs::remove_file(&oldest)?;
    }
    for n in (1..max_files).rev() {
        let src = numbered_path(log_path, n);
        if src.exists() {
            fs::rename(&src, numbered_path(log_path, n + 1))?;
        }
    }
    fs::rename(log_path, numbered_path(log_path, 1))?;
    drop(
        OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .open(log_path)?,
    );
    Ok(true)
}

fn numbered_path(base: &Path, n: usize) -> PathBuf {
    let name = base
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("run.log");
    base.with_file_name(format!("{name}.{n}"))
}
