// =============================================================================
// Session State — persisted daily P&L, reset date, and trading lock
// =============================================================================
//
// The session file at `logs/daily_pnl.json` is the daemon's restart memory:
// the realized P&L accumulated since the most recent 17:00 America/Chicago
// rollover, the calendar date of that rollover, and whether the kill switch
// has locked trading. It is checkpointed after every mutation with the
// tmp + rename pattern so a crash never leaves a torn file.
//
// Restoration never trusts a stale checkpoint: when the saved reset date is
// not the current session's, the broker's portfolio P&L is the source of
// truth, cross-checked against the performance-metrics query.
// =============================================================================

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, NaiveDate, SecondsFormat, Timelike, Utc};
use chrono_tz::America::Chicago;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::broker::Broker;

pub const SESSION_STATE_PATH: &str = "logs/daily_pnl.json";

/// Hour of day (America/Chicago) at which the trading session rolls over.
pub const SESSION_ROLLOVER_HOUR: u32 = 17;

/// Tolerance when cross-checking the two broker P&L sources.
const PNL_CROSS_CHECK_TOLERANCE: f64 = 0.01;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionState {
    #[serde(default)]
    pub daily_realized_pnl: f64,
    #[serde(default)]
    pub last_reset_date: Option<NaiveDate>,
    #[serde(default)]
    pub trading_locked: bool,
    #[serde(default)]
    pub checkpoint_ts: String,
}

impl Default for SessionState {
    fn default() -> Self {
        Self {
            daily_realized_pnl: 0.0,
            last_reset_date: None,
            trading_locked: false,
            checkpoint_ts: String::new(),
        }
    }
}

/// Calendar date (America/Chicago) of the most recent 17:00 rollover
/// relative to `now`. Before 17:00 the running session still belongs to the
/// previous calendar date.
pub fn session_date(now: DateTime<Utc>) -> NaiveDate {
    let ct = now.with_timezone(&Chicago);
    if ct.hour() >= SESSION_ROLLOVER_HOUR {
        ct.date_naive()
    } else {
        ct.date_naive() - Duration::days(1)
    }
}

/// Read the persisted state as-is, without session-date validation. Used by
/// the `status` command for display.
pub fn read_state(path: impl AsRef<Path>) -> Result<SessionState> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read session state from {}", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("failed to parse session state from {}", path.display()))
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

pub struct SessionStore {
    path: PathBuf,
    state: SessionState,
}

impl SessionStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            state: SessionState::default(),
        }
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn daily_realized_pnl(&self) -> f64 {
        self.state.daily_realized_pnl
    }

    pub fn trading_locked(&self) -> bool {
        self.state.trading_locked
    }

    pub fn add_realized(&mut self, delta: f64) {
        self.state.daily_realized_pnl += delta;
    }

    pub fn set_locked(&mut self, locked: bool) {
        self.state.trading_locked = locked;
    }

    /// Zero the session for a fresh rollover at `date`.
    pub fn reset_for(&mut self, date: NaiveDate) {
        self.state.daily_realized_pnl = 0.0;
        self.state.trading_locked = false;
        self.state.last_reset_date = Some(date);
    }

    // -------------------------------------------------------------------------
    // Persistence
    // -------------------------------------------------------------------------

    /// Write the state atomically. `checkpoint_ts` is stamped on every write
    /// and strictly increases within a session.
    pub fn checkpoint(&mut self) -> Result<()> {
        self.state.checkpoint_ts = Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true);

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create state dir {}", parent.display()))?;
        }

        let content = serde_json::to_string_pretty(&self.state)
            .context("failed to serialise session state")?;

        let tmp_path = self.path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp state to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, &self.path)
            .with_context(|| format!("failed to rename tmp state to {}", self.path.display()))?;

        Ok(())
    }

    /// Load the checkpoint when it belongs to the current session. Returns
    /// true on restore; a missing file is simply false, a corrupt one is an
    /// error so the caller can warn and fall through to the broker query.
    fn load_if_current(&mut self, now: DateTime<Utc>) -> Result<bool> {
        if !self.path.exists() {
            return Ok(false);
        }

        let content = std::fs::read_to_string(&self.path)
            .with_context(|| format!("failed to read session state from {}", self.path.display()))?;

        let saved: SessionState = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse session state from {}", self.path.display()))?;

        if saved.last_reset_date == Some(session_date(now)) {
            self.state = saved;
            Ok(true)
        } else {
            info!("persisted session state is from an earlier session");
            Ok(false)
        }
    }

    // -------------------------------------------------------------------------
    // Restore protocol
    // -------------------------------------------------------------------------

    /// Source-of-truth restoration: same-session checkpoint if present,
    /// otherwise the broker's portfolio P&L (day figure, falling back to the
    /// realized figure), cross-checked against the performance-metrics query.
    pub async fn restore(&mut self, broker: &dyn Broker, now: DateTime<Utc>) -> Result<()> {
        match self.load_if_current(now) {
            Ok(true) => {
                info!(
                    daily_realized_pnl = self.state.daily_realized_pnl,
                    trading_locked = self.state.trading_locked,
                    "session state restored from checkpoint"
                );
                return Ok(());
            }
            Ok(false) => {}
            Err(e) => warn!(error = %e, "checkpoint unreadable, querying broker"),
        }

        let pnl = match broker.get_portfolio_pnl().await {
            Ok(summary) => {
                let pnl = if summary.day_pnl != 0.0 {
                    summary.day_pnl
                } else {
                    summary.realized_pnl
                };
                info!(
                    day_pnl = summary.day_pnl,
                    realized_pnl = summary.realized_pnl,
                    "daily P&L fetched from portfolio query"
                );
                pnl
            }
            Err(e) => {
                error!(error = %e, "portfolio P&L query failed, starting session at 0.00");
                0.0
            }
        };

        self.state.daily_realized_pnl = pnl;
        self.state.last_reset_date = Some(session_date(now));
        self.state.trading_locked = false;

        match broker
            .get_performance_metrics(now - Duration::hours(24), now)
            .await
        {
            Ok(perf) => {
                if (perf.daily_pnl - pnl).abs() > PNL_CROSS_CHECK_TOLERANCE {
                    warn!(
                        portfolio = pnl,
                        performance = perf.daily_pnl,
                        "P&L sources disagree, keeping portfolio figure"
                    );
                }
            }
            Err(e) => warn!(error = %e, "performance metrics query failed, skipping cross-check"),
        }

        if let Err(e) = self.checkpoint() {
            warn!(error = %e, "failed to checkpoint restored session state");
        }
        Ok(())
    }
}

impl std::fmt::Debug for SessionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionStore")
            .field("path", &self.path)
            .field("state", &self.state)
            .finish()
    }
}
