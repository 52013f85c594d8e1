//! The single optional destination for normalized log lines.
//!
//! Best-effort by design: a failed write is logged and swallowed so one bad
//! disk never takes down draining for every connected client.

use anyhow::{Context, Result};
use log::warn;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;

/// Append-only sink. Opened once at startup, never rotated or truncated.
/// With no destination configured every write is a no-op.
pub struct Sink {
    file: Option<File>,
}

impl Sink {
    /// A sink that discards everything.
    pub fn discard() -> Self {
        Self { file: None }
    }

    /// Opens `path` in append mode, creating it if absent. Log contents are
    /// not for everyone, so a created file is 0640. Failure here is a broken
    /// deployment and left to the caller to treat as fatal.
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .append(true)
            .create(true)
            .mode(0o640)
            .open(path)
            .with_context(|| format!("unable to open {}", path.display()))?;
        Ok(Self { file: Some(file) })
    }

    pub fn is_discard(&self) -> bool {
        self.file.is_none()
    }

    /// Appends one normalized record. One call, one underlying write; no
    /// internal buffering. Write failures are not escalated.
    pub fn write(&mut self, bytes: &[u8]) {
        if let Some(file) = self.file.as_mut() {
            if let Err(e) = file.write_all(bytes) {
                warn!("sink write failed: {}", e);
            }
        }
    }
}
