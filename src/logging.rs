// =============================================================================
// Technical logging — console plus size-rotated live.log
// =============================================================================
//
// Raw event dumps, broker I/O traces, and latency measurements go to
// `logs/live.log` through the tracing file layer. The file rotates at 10 MiB
// with five numbered backups (`live.log.1` is the most recent). The console
// layer mirrors the same events for an attached operator.
// =============================================================================

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub const LIVE_LOG_PATH: &str = "logs/live.log";

const MAX_LOG_BYTES: u64 = 10 * 1024 * 1024;
const MAX_BACKUPS: usize = 5;

// ---------------------------------------------------------------------------
// Rotating file writer
// ---------------------------------------------------------------------------

/// Append-only writer that rotates `live.log` -> `live.log.1` -> ... ->
/// `live.log.N` once the active file would exceed `max_bytes`.
pub struct RotatingFile {
    path: PathBuf,
    file: File,
    written: u64,
    max_bytes: u64,
    backups: usize,
}

impl RotatingFile {
    pub fn open(path: impl AsRef<Path>, max_bytes: u64, backups: usize) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create log dir {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("open technical log {}", path.display()))?;
        let written = file.metadata().map(|m| m.len()).unwrap_or(0);
        Ok(Self {
            path,
            file,
            written,
            max_bytes,
            backups,
        })
    }

    fn numbered(&self, n: usize) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(format!(".{n}"));
        PathBuf::from(name)
    }

    fn rotate(&mut self) -> io::Result<()> {
        self.file.flush()?;

        // Shift backups upward; the oldest falls off the end.
        for n in (1..self.backups).rev() {
            let from = self.numbered(n);
            if from.exists() {
                let _ = fs::rename(&from, self.numbered(n + 1));
            }
        }
        fs::rename(&self.path, self.numbered(1))?;

        self.file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        self.written = 0;
        Ok(())
    }
}

impl Write for RotatingFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.written + buf.len() as u64 > self.max_bytes && self.written > 0 {
            self.rotate()?;
        }
        let n = self.file.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

// ---------------------------------------------------------------------------
// Subscriber installation
// ---------------------------------------------------------------------------

fn env_filter(default_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level.to_lowercase()))
}

/// Install the global subscriber with both the console layer and the rotating
/// technical log. `default_level` applies when RUST_LOG is unset.
pub fn init(default_level: &str) -> Result<()> {
    let technical = RotatingFile::open(LIVE_LOG_PATH, MAX_LOG_BYTES, MAX_BACKUPS)?;

    tracing_subscriber::registry()
        .with(env_filter(default_level))
        .with(fmt::layer())
        .with(
            fmt::layer()
                .with_ansi(false)
                .with_writer(std::sync::Mutex::new(technical)),
        )
        .try_init()
        .map_err(|e| anyhow!("failed to install tracing subscriber: {e}"))?;
    Ok(())
}

/// Console-only subscriber for short-lived commands (`status`, `validate`)
/// that must not touch the running daemon's technical log.
pub fn init_console(default_level: &str) -> Result<()> {
    tracing_subscriber::registry()
        .with(env_filter(default_level))
        .with(fmt::layer())
        .try_init()
        .map_err(|e| anyhow!("failed to install tracing subscriber: {e}"))?;
    Ok(())
}
