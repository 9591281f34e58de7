//! Liveness marker for the external health probe.
//!
//! A single RFC 3339 timestamp, overwritten (never appended) after any run
//! where the task succeeded. The probe considers the system healthy iff the
//! marker exists and its age is under the probe's own threshold.

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};

/// Overwrite the marker at `path` with `now`.
pub fn touch(path: &Path, now: DateTime<Utc>) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)
            .with_context(|| format!("create heartbeat dir {}", parent.display()))?;
    }
    let mut buf = now.to_rfc3339();
    buf.push('\n');
    fs::write(path, buf).with_context(|| format!("write heartbeat {}", path.display()))
}

/// Age of the marker, or `None` when no run has ever succeeded.
pub fn age(path: &Path, now: DateTime<Utc>) -> Result<Option<Duration>> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => {
            return Err(err).with_context(|| format!("read heartbeat {}", path.display()));
        }
    };
    let recorded = DateTime::parse_from_rfc3339(contents.trim())
        .with_context(|| format!("parse heartbeat {}", path.display()))?
        .with_timezone(&Utc);
    let age = (now - recorded).to_std().unwrap_or(Duration::ZERO);
    Ok(Some(age))
}
