// =============================================================================
// Audit Log — append-only NDJSON trail of operator-facing events
// =============================================================================
//
// One JSON object per line at `logs/audit.ndjson`, fields
// {timestamp, level, message}. Messages are plain English for the operator;
// raw event dumps and latency measurements belong in the technical log.
//
// The transport task writes connection-lifecycle records here, so appends are
// serialized behind a mutex. A failed append is reported to the technical
// log and the daemon continues: losing one audit line must never take the
// protection loop down.
// =============================================================================

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::error;

pub const AUDIT_LOG_PATH: &str = "logs/audit.ndjson";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub timestamp: String,
    pub level: String,
    pub message: String,
}

pub struct AuditLog {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl AuditLog {
    /// Create the audit log, ensuring the parent directory exists.
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create audit dir {}", parent.display()))?;
        }
        Ok(Self {
            path,
            write_lock: Mutex::new(()),
        })
    }

    pub fn info(&self, message: impl Into<String>) {
        self.append("INFO", message.into());
    }

    pub fn warning(&self, message: impl Into<String>) {
        self.append("WARNING", message.into());
    }

    pub fn error(&self, message: impl Into<String>) {
        self.append("ERROR", message.into());
    }

    fn append(&self, level: &str, message: String) {
        let record = AuditRecord {
            timestamp: Utc::now().to_rfc3339(),
            level: level.to_string(),
            message,
        };
        if let Err(e) = self.try_append(&record) {
            error!(error = %e, "audit append failed");
        }
    }

    fn try_append(&self, record: &AuditRecord) -> Result<()> {
        let line = serde_json::to_string(record).context("serialise audit record failed")?;

        let _guard = self.write_lock.lock();
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("open audit log {}", self.path.display()))?;
        file.write_all(line.as_bytes())
            .context("write audit line failed")?;
        file.write_all(b"\n").context("write newline failed")?;
        Ok(())
    }
}

impl std::fmt::Debug for AuditLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditLog").field("path", &self.path).finish()
    }
}
