// =============================================================================
// Sentinel Risk Daemon — Main Entry Point
// =============================================================================
//
// Operator surface: start / stop / status / tail / dry-run / validate.
// `start` and `stop` are gated by the admin passcode, read from
// SENTINEL_ADMIN_PASSCODE and compared in constant time. The daemon starts
// in whatever mode the config file says; `dry-run` forces suppression of
// enforcement before starting.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod audit;
mod broker;
mod config;
mod contract;
mod dispatch;
mod enforce;
mod events;
mod logging;
mod pnl;
mod rules;
mod session;
mod tracker;

use std::io::{self, Write};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

use crate::audit::{AuditLog, AUDIT_LOG_PATH};
use crate::broker::client::GatewayClient;
use crate::broker::stream::UserEventStream;
use crate::broker::Broker;
use crate::config::{RiskConfig, DEFAULT_CONFIG_PATH};
use crate::dispatch::Daemon;
use crate::session::{SessionStore, SESSION_STATE_PATH};

const STOP_MARKER_PATH: &str = "logs/daemon.stop";
const PID_FILE_PATH: &str = "logs/daemon.pid";
const EVENT_QUEUE_CAPACITY: usize = 256;

// ── CLI ──────────────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(name = "sentinel", version, about = "Futures account risk-management daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the protection loop (passcode required).
    Start,
    /// Request a clean shutdown of a running daemon (passcode required).
    Stop,
    /// Report config, rules, P&L, and lock state.
    Status,
    /// Follow the technical log.
    Tail,
    /// Force dry_run in the config, then start.
    DryRun,
    /// Smoke-test broker connectivity without subscribing to events.
    Validate,
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenv::dotenv();

    let cli = Cli::parse();
    match cli.command {
        Command::Start => cmd_start(false).await,
        Command::DryRun => cmd_start(true).await,
        Command::Stop => cmd_stop(),
        Command::Status => cmd_status().await,
        Command::Tail => cmd_tail().await,
        Command::Validate => cmd_validate().await,
    }
}

// ── Passcode gate ────────────────────────────────────────────────────────────

/// Compare two byte slices in constant time. The comparison examines every
/// byte even after a mismatch, preventing timing side-channels.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut result: u8 = 0;
    for (x, y) in a.iter().zip(b.iter()) {
        result |= x ^ y;
    }
    result == 0
}

fn require_passcode() -> Result<()> {
    let expected = std::env::var("SENTINEL_ADMIN_PASSCODE")
        .context("SENTINEL_ADMIN_PASSCODE is not set; the admin passcode is never hard-coded")?;

    print!("Enter admin passcode: ");
    io::stdout().flush().context("stdout flush failed")?;

    let mut entered = String::new();
    io::stdin()
        .read_line(&mut entered)
        .context("failed to read passcode")?;

    if !constant_time_eq(entered.trim_end().as_bytes(), expected.as_bytes()) {
        bail!("invalid passcode");
    }
    Ok(())
}

fn account_id_from_env() -> Result<i64> {
    let raw = std::env::var("PROJECT_X_ACCOUNT_ID").context("PROJECT_X_ACCOUNT_ID is not set")?;
    raw.trim()
        .parse::<i64>()
        .with_context(|| format!("PROJECT_X_ACCOUNT_ID is not an integer: {raw}"))
}

/// Load the config document, falling back to the in-memory default. The
/// warning is returned rather than logged so it can be emitted after the
/// subscriber is installed (and audited).
fn load_config() -> (RiskConfig, Option<String>) {
    match RiskConfig::load_or_init(DEFAULT_CONFIG_PATH) {
        Ok(config) => (config, None),
        Err(e) => (
            RiskConfig::default(),
            Some(format!("Failed to load config: {e:#} - using safe defaults")),
        ),
    }
}

// ── start / dry-run ──────────────────────────────────────────────────────────

async fn cmd_start(force_dry_run: bool) -> Result<()> {
    require_passcode()?;

    let (mut config, config_warning) = load_config();

    let mut save_warning = None;
    if force_dry_run {
        config.dry_run = true;
        if let Err(e) = config.save(DEFAULT_CONFIG_PATH) {
            save_warning = Some(format!("Failed to persist dry-run flag: {e:#}"));
        }
    }

    logging::init(&config.log_level)?;

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║           Sentinel Risk Daemon — Starting Up             ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let audit = Arc::new(AuditLog::new(AUDIT_LOG_PATH)?);
    if let Some(warning) = &config_warning {
        warn!("{warning}");
        audit.warning(warning.clone());
    }
    if let Some(warning) = &save_warning {
        warn!("{warning}");
    }

    // Override symbols from env if available.
    if let Ok(symbols) = std::env::var("SENTINEL_SYMBOLS") {
        config.symbols = symbols
            .split(',')
            .map(|s| s.trim().to_uppercase())
            .filter(|s| !s.is_empty())
            .collect();
    }
    if config.symbols.is_empty() {
        config.symbols = vec!["MNQ".to_string()];
    }

    info!(
        dry_run = config.dry_run,
        symbols = ?config.symbols,
        rules = ?config.rules.keys().collect::<Vec<_>>(),
        "configuration loaded"
    );

    let account_id = account_id_from_env()?;
    let client = Arc::new(GatewayClient::from_env()?);
    client
        .authenticate()
        .await
        .context("broker authentication failed")?;

    let mut session = SessionStore::new(SESSION_STATE_PATH);
    session.restore(client.as_ref(), Utc::now()).await?;

    let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut feed = UserEventStream::connect(client.ws_url(), &client.session_token()?).await?;
    feed.subscribe_user_updates(account_id).await?;
    let transport = tokio::spawn(feed.run(events_tx.clone(), audit.clone(), shutdown_rx));

    // A marker left behind by a crashed stop must not kill this run.
    let _ = std::fs::remove_file(STOP_MARKER_PATH);
    std::fs::write(PID_FILE_PATH, std::process::id().to_string())
        .context("failed to write pid file")?;

    let mut daemon = Daemon::new(
        config,
        client.clone() as Arc<dyn Broker>,
        audit.clone(),
        session,
        account_id,
        events_tx,
        STOP_MARKER_PATH.into(),
    );

    if let Err(e) = daemon.seed_tracker().await {
        warn!(error = %e, "could not seed tracker from broker positions");
        audit.warning(format!("Could not seed position tracker: {e}"));
    }

    audit.info("Daemon started.");
    info!("daemon running; press Ctrl+C to stop");

    let result = daemon.run(events_rx).await;

    // Clean transport shutdown: unsubscribe and disconnect.
    let _ = shutdown_tx.send(true);
    let _ = tokio::time::timeout(Duration::from_secs(5), transport).await;

    let _ = std::fs::remove_file(PID_FILE_PATH);
    audit.info("Daemon stopped.");
    info!("daemon stopped");
    result
}

// ── stop ─────────────────────────────────────────────────────────────────────

fn cmd_stop() -> Result<()> {
    require_passcode()?;

    if !Path::new(PID_FILE_PATH).exists() {
        println!("Daemon does not appear to be running.");
    }

    std::fs::create_dir_all("logs").context("failed to create logs dir")?;
    std::fs::write(STOP_MARKER_PATH, b"stop").context("failed to write stop marker")?;
    println!("Stop requested. The daemon will checkpoint and exit.");
    Ok(())
}

// ── status ───────────────────────────────────────────────────────────────────

async fn cmd_status() -> Result<()> {
    logging::init_console("warn")?;

    let (config, config_warning) = load_config();
    if let Some(warning) = config_warning {
        eprintln!("{warning}");
    }

    println!(
        "Config loaded: dry_run={}, symbols={:?}",
        config.dry_run, config.symbols
    );
    println!(
        "Rules enabled in config: {:?}",
        config.enabled_rules().map(|(n, _)| n).collect::<Vec<_>>()
    );
    let loaded = rules::build_rules(&config, None);
    println!(
        "Rules successfully loaded: {:?}",
        loaded.iter().map(|r| r.name()).collect::<Vec<_>>()
    );

    let mut daily = 0.0;
    let mut open_positions = None;
    match GatewayClient::from_env() {
        Ok(client) => match client.authenticate().await {
            Ok(()) => {
                match client.get_portfolio_pnl().await {
                    Ok(summary) => {
                        daily = if summary.day_pnl != 0.0 {
                            summary.day_pnl
                        } else {
                            summary.realized_pnl
                        };
                    }
                    Err(e) => eprintln!("P&L query failed: {e:#} - using 0.00"),
                }
                if let Ok(account_id) = account_id_from_env() {
                    match client.get_all_positions(account_id).await {
                        Ok(positions) => {
                            open_positions =
                                Some(positions.iter().filter(|p| p.size != 0).count());
                        }
                        Err(e) => eprintln!("Position query failed: {e:#}"),
                    }
                }
            }
            Err(e) => eprintln!("Broker authentication failed: {e:#} - using 0.00"),
        },
        Err(e) => eprintln!("Broker client unavailable: {e:#} - using 0.00"),
    }
    println!("Current daily realized P&L: {daily:.2} (resets 5PM CT)");
    if let Some(count) = open_positions {
        println!("Open positions on the account: {count}");
    }

    match session::read_state(SESSION_STATE_PATH) {
        Ok(state) => {
            let reset_date = state
                .last_reset_date
                .map(|d| d.to_string())
                .unwrap_or_else(|| "none".to_string());
            println!(
                "Last checkpoint: {} (reset date {reset_date}, booked P&L {:.2})",
                state.checkpoint_ts, state.daily_realized_pnl
            );
            if state.trading_locked {
                println!("Trading locked (daily loss breach).");
            }
        }
        Err(_) => println!("No session checkpoint on disk."),
    }

    if Path::new(PID_FILE_PATH).exists() {
        println!("Daemon is running.");
    } else {
        println!("Daemon is not running.");
    }
    Ok(())
}

// ── tail ─────────────────────────────────────────────────────────────────────

async fn cmd_tail() -> Result<()> {
    use std::io::{Read, Seek, SeekFrom};

    let mut file = std::fs::File::open(logging::LIVE_LOG_PATH)
        .with_context(|| format!("failed to open {}", logging::LIVE_LOG_PATH))?;
    file.seek(SeekFrom::End(0)).context("seek failed")?;

    let mut buf = [0u8; 1024];
    loop {
        let n = file.read(&mut buf).context("read failed")?;
        if n > 0 {
            io::stdout().write_all(&buf[..n])?;
            io::stdout().flush()?;
        } else {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }
}

// ── validate ─────────────────────────────────────────────────────────────────

async fn cmd_validate() -> Result<()> {
    logging::init_console("warn")?;

    let (config, config_warning) = load_config();
    match config_warning {
        Some(warning) => eprintln!("{warning}"),
        None => println!("Config loaded successfully."),
    }
    println!("Watching symbols: {:?}", config.symbols);

    let result: Result<()> = async {
        let client = GatewayClient::from_env()?;
        client
            .authenticate()
            .await
            .context("broker authentication failed")?;
        println!("Broker authentication succeeded.");

        let feed = UserEventStream::connect(client.ws_url(), &client.session_token()?).await?;
        println!("Realtime feed started.");
        feed.close().await?;
        println!("Realtime feed stopped.");
        Ok(())
    }
    .await;

    match result {
        Ok(()) => {
            println!("Validation passed.");
            Ok(())
        }
        Err(e) => {
            eprintln!("Validation failed: {e:#}");
            Err(e)
        }
    }
}
