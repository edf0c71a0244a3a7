// =============================================================================
// Event Dispatcher — the single-consumer protection loop
// =============================================================================
//
// One task owns every piece of mutable state: session store, tracker, P&L
// engine, rules, and enforcement. Events arrive over a bounded FIFO in
// broker order and are processed to completion, enforcement included, before
// the next event is dequeued. Rules therefore always observe the post-update
// tracker and accumulator for the event under evaluation.
//
// Per event: technical log -> quote filter -> tracker -> P&L (reset +
// attribution + checkpoint) -> plain-English audit -> rules (first breach
// wins) -> enforcement -> lock sweep -> sell-side close-confirmation poll.
// =============================================================================

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::audit::AuditLog;
use crate::broker::stream::Inbound;
use crate::broker::Broker;
use crate::config::RiskConfig;
use crate::contract::{display_symbol, InstrumentCatalog};
use crate::enforce::{self, EnforcementEngine};
use crate::events::{Event, EventPayload, Side};
use crate::pnl::PnlEngine;
use crate::rules::{build_rules, BreachResult, RiskRule, RuleAction};
use crate::session::SessionStore;
use crate::tracker::PositionTracker;

/// Delay before the close-confirmation poll fires after a SELL fill.
const CLOSE_POLL_DELAY: Duration = Duration::from_secs(1);
/// How often the loop checks for an operator stop request.
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(500);

pub struct Daemon {
    config: RiskConfig,
    broker: Arc<dyn Broker>,
    audit: Arc<AuditLog>,
    session: SessionStore,
    tracker: PositionTracker,
    pnl: PnlEngine,
    rules: Vec<Box<dyn RiskRule>>,
    enforcement: EnforcementEngine,
    account_id: i64,
    /// Sender for synthesized events (close-confirmation polls).
    events_tx: mpsc::Sender<Inbound>,
    stop_marker: PathBuf,
}

impl Daemon {
    pub fn new(
        config: RiskConfig,
        broker: Arc<dyn Broker>,
        audit: Arc<AuditLog>,
        session: SessionStore,
        account_id: i64,
        events_tx: mpsc::Sender<Inbound>,
        stop_marker: PathBuf,
    ) -> Self {
        let rules = build_rules(&config, Some(audit.as_ref()));
        let enforcement = EnforcementEngine::new(broker.clone(), account_id);

        Self {
            config,
            broker,
            audit,
            session,
            tracker: PositionTracker::new(InstrumentCatalog::new()),
            pnl: PnlEngine::new(),
            rules,
            enforcement,
            account_id,
            events_tx,
            stop_marker,
        }
    }

    /// Rebuild the tracker from the broker's authoritative open positions.
    pub async fn seed_tracker(&mut self) -> Result<()> {
        let positions = self
            .broker
            .get_all_positions(self.account_id)
            .await
            .context("startup position query failed")?;

        let mut seeded = 0usize;
        for position in positions {
            if position.size == 0 {
                continue;
            }
            let side = if position.size >= 0 {
                crate::events::PositionType::Long
            } else {
                crate::events::PositionType::Short
            };
            self.tracker
                .apply_snapshot(&position.contract_id, position.size, position.average_price, side);
            seeded += 1;
        }
        info!(count = seeded, "tracker seeded from broker positions");
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Main loop
    // -------------------------------------------------------------------------

    /// Consume events until stop, interrupt, or stream loss. Session state is
    /// checkpointed on every exit path; stream loss is a non-zero exit.
    pub async fn run(&mut self, mut rx: mpsc::Receiver<Inbound>) -> Result<()> {
        self.startup_breach_advisory();

        let mut stop_timer = tokio::time::interval(STOP_POLL_INTERVAL);

        let result = loop {
            tokio::select! {
                inbound = rx.recv() => match inbound {
                    Some(Inbound::Event(event)) => self.handle_event(event).await,
                    Some(Inbound::StreamClosed(reason)) => {
                        error!(reason = %reason, "realtime subscription lost");
                        break Err(anyhow!("realtime subscription lost: {reason}"));
                    }
                    None => break Err(anyhow!("event channel closed")),
                },
                _ = stop_timer.tick() => {
                    if self.stop_requested() {
                        info!("stop requested, shutting down");
                        break Ok(());
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    warn!("interrupt received, shutting down");
                    break Ok(());
                }
            }
        };

        if let Err(e) = self.session.checkpoint() {
            warn!(error = %e, "checkpoint on shutdown failed");
            self.audit
                .warning(format!("Failed to checkpoint session state on shutdown: {e}"));
        }

        result
    }

    fn stop_requested(&self) -> bool {
        if self.stop_marker.exists() {
            let _ = std::fs::remove_file(&self.stop_marker);
            return true;
        }
        false
    }

    fn startup_breach_advisory(&self) {
        let Some(rule_config) = self.config.rules.get("daily_loss") else {
            return;
        };
        let max_usd = rule_config.param_f64("max_usd", 200.0);
        let pnl = self.session.daily_realized_pnl();
        if pnl < -max_usd {
            warn!(daily_pnl = pnl, max_usd, "startup P&L already past the daily loss limit");
            self.audit.warning(format!(
                "Startup: Daily P&L {pnl:.2} below -{max_usd:.2} limit - trading at risk."
            ));
        }
    }

    // -------------------------------------------------------------------------
    // Per-event pipeline
    // -------------------------------------------------------------------------

    async fn handle_event(&mut self, event: Event) {
        let received_at = Instant::now();

        if matches!(event.payload, EventPayload::QuoteUpdate) {
            debug!("quote tick received");
            return;
        }
        info!(kind = event.kind(), payload = ?event.payload, "event received");

        // Tracker update.
        match &event.payload {
            EventPayload::OrderFilled(fill) => {
                let effect = self.tracker.apply_fill(fill);
                if let Some(realized) = effect.realized {
                    debug!(
                        contract = %fill.contract_id,
                        realized,
                        closed_lot = effect.closed_existing,
                        "local realization on lot reduction"
                    );
                }
            }
            EventPayload::PositionUpdated(update) if update.size != 0 => {
                self.tracker.apply_snapshot(
                    &update.contract_id,
                    update.size,
                    update.average_price,
                    update.position_type,
                );
            }
            _ => {}
        }

        // Session reset, then P&L attribution and checkpoint. Rules run after
        // this, so they see the post-update accumulator.
        self.pnl.check_reset(
            event.timestamp,
            &mut self.session,
            &mut self.tracker,
            self.audit.as_ref(),
        );
        self.pnl
            .apply(&event, &mut self.session, &mut self.tracker, self.broker.as_ref())
            .await;

        // Plain-English audit, folded together with any breach below.
        let audit_msg = self.describe(&event);

        // Rule evaluation: declaration order, first breach wins.
        let mut breach: Option<(&'static str, BreachResult)> = None;
        for rule in &self.rules {
            let Some(rule_config) = self.config.rules.get(rule.name()) else {
                continue;
            };
            let result = rule
                .check(
                    &event,
                    rule_config,
                    self.broker.as_ref(),
                    self.config.dry_run,
                    self.session.daily_realized_pnl(),
                )
                .await;
            if result.is_breach() {
                warn!(rule = rule.name(), reason = %result.reason, "rule breach");
                breach = Some((rule.name(), result));
                break;
            }
        }

        match &breach {
            Some((name, result)) => {
                let mut message = format!(
                    "{audit_msg} - BREACH ({name}): {}. Action: {}",
                    result.reason, result.action
                );
                if self.config.dry_run {
                    message.push_str(" (dry-run: no enforcement)");
                }
                self.audit.warning(message);
            }
            None => self.audit.info(audit_msg),
        }

        // Enforcement.
        if let Some((name, result)) = breach {
            if self.config.dry_run {
                info!(rule = name, "enforcement suppressed by dry-run");
            } else {
                self.enforce_breach(name, &result, &event, received_at).await;
            }
        }

        // Locked account: any fill that leaves a lot alive is force-flattened
        // regardless of rule results.
        if self.session.trading_locked() && !self.config.dry_run {
            if let EventPayload::OrderFilled(fill) = &event.payload {
                if fill.size > 0 && self.tracker.get(&fill.contract_id).is_some() {
                    self.enforcement
                        .flatten(
                            &fill.contract_id,
                            "trading lock (daily loss breach)",
                            received_at,
                            self.audit.as_ref(),
                        )
                        .await;
                    self.audit.warning(format!(
                        "Trading locked: Flattened new fill on {} due to daily loss breach.",
                        fill.contract_id
                    ));
                    self.tracker.remove(&fill.contract_id);
                }
            }
        }

        // Streams sometimes drop the close event after a sell; poll shortly
        // after and synthesize the silent close if the book went flat.
        if let EventPayload::OrderFilled(fill) = &event.payload {
            if fill.side == Side::Sell {
                let broker = self.broker.clone();
                let tx = self.events_tx.clone();
                let account_id = self.account_id;
                let symbol = fill.symbol().to_string();
                tokio::spawn(async move {
                    tokio::time::sleep(CLOSE_POLL_DELAY).await;
                    match enforce::confirm_close(broker.as_ref(), account_id, &symbol, &tx).await {
                        Ok(found) => debug!(symbol = %symbol, found, "close-confirmation poll done"),
                        Err(e) => error!(symbol = %symbol, error = %e, "close-confirmation poll failed"),
                    }
                });
            }
        }
    }

    async fn enforce_breach(
        &mut self,
        rule_name: &str,
        result: &BreachResult,
        event: &Event,
        received_at: Instant,
    ) {
        match result.action {
            RuleAction::Flatten => {
                let contract = result
                    .target_contract
                    .clone()
                    .or_else(|| contract_of(&event.payload));
                match contract {
                    Some(contract_id) => {
                        self.enforcement
                            .flatten(&contract_id, &result.reason, received_at, self.audit.as_ref())
                            .await;
                    }
                    None => {
                        error!(rule = rule_name, "no target contract for flatten");
                        self.audit.error(format!(
                            "Enforcement failed: no target contract for rule {rule_name}"
                        ));
                    }
                }
            }
            RuleAction::KillSwitch => {
                self.enforcement
                    .kill_switch(&result.reason, received_at, &mut self.session, self.audit.as_ref())
                    .await;
            }
            RuleAction::None => {}
        }
    }

    fn describe(&self, event: &Event) -> String {
        match &event.payload {
            EventPayload::OrderFilled(fill) => format!(
                "Order filled for {}: {} {} contracts at {}.",
                fill.symbol(),
                fill.side.as_str(),
                fill.size,
                fill.filled_price
            ),
            EventPayload::PositionUpdated(update) => {
                let pnl = update
                    .pnl
                    .map(|p| format!("{p:.2}"))
                    .unwrap_or_else(|| "N/A".to_string());
                let mut message = format!(
                    "Position updated for {}: size {} (P&L {pnl}).",
                    display_symbol(&update.contract_id),
                    update.size.abs()
                );
                if update.size == 0 {
                    message.push_str(" (possible close)");
                }
                message
            }
            EventPayload::PositionClosed(closed) => format!(
                "Position closed: realized P&L {:.2} (cumulative {:.2}).",
                closed.pnl,
                self.session.daily_realized_pnl()
            ),
            EventPayload::PositionPnlUpdate(update) => format!(
                "Position P&L updated: realized {:+.2} (cumulative {:.2}).",
                update.realized_pnl,
                self.session.daily_realized_pnl()
            ),
            EventPayload::QuoteUpdate => "Event received: quote_update.".to_string(),
        }
    }

    #[cfg(test)]
    pub fn session(&self) -> &SessionStore {
        &self.session
    }

    #[cfg(test)]
    pub fn tracker(&self) -> &PositionTracker {
        &self.tracker
    }

    #[cfg(test)]
    pub fn session_mut(&mut self) -> &mut SessionStore {
        &mut self.session
    }
}

fn contract_of(payload: &EventPayload) -> Option<String> {
    match payload {
        EventPayload::OrderFilled(fill) => Some(fill.contract_id.clone()),
        EventPayload::PositionUpdated(update) => Some(update.contract_id.clone()),
        EventPayload::PositionClosed(closed) => Some(closed.contract_id.clone()),
        EventPayload::PositionPnlUpdate(update) => update.contract_id.clone(),
        EventPayload::QuoteUpdate => None,
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditRecord;
    use crate::broker::mock::MockBroker;
    use crate::events::{ClosedPosition, OrderFill, PositionType, PositionUpdate};
    use crate::session::session_date;
    use chrono::{DateTime, Utc};

    const MNQ: &str = "CON.F.US.MNQ.Z25";

    struct Harness {
        daemon: Daemon,
        broker: Arc<MockBroker>,
        audit_path: std::path::PathBuf,
        _rx: mpsc::Receiver<Inbound>,
        _dir: tempfile::TempDir,
    }

    fn harness(config_json: &str) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let config: RiskConfig = serde_json::from_str(config_json).unwrap();
        let broker = Arc::new(MockBroker::new());
        let audit_path = dir.path().join("audit.ndjson");
        let audit = Arc::new(AuditLog::new(&audit_path).unwrap());
        let session = SessionStore::new(dir.path().join("daily_pnl.json"));
        let (tx, rx) = mpsc::channel(16);

        let daemon = Daemon::new(
            config,
            broker.clone() as Arc<dyn Broker>,
            audit,
            session,
            1,
            tx,
            dir.path().join("daemon.stop"),
        );

        Harness {
            daemon,
            broker,
            audit_path,
            _rx: rx,
            _dir: dir,
        }
    }

    fn audit_records(path: &std::path::Path) -> Vec<AuditRecord> {
        std::fs::read_to_string(path)
            .unwrap_or_default()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect()
    }

    fn buy(size: u32, price: f64) -> Event {
        Event::now(EventPayload::OrderFilled(OrderFill {
            contract_id: MNQ.to_string(),
            symbol_id: "F.US.MNQ".to_string(),
            side: Side::Buy,
            size,
            filled_price: price,
        }))
    }

    fn closed(pnl: f64) -> Event {
        Event::now(EventPayload::PositionClosed(ClosedPosition {
            contract_id: MNQ.to_string(),
            pnl,
            close_price: None,
        }))
    }

    fn utc(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    const MAX_CONTRACTS_DRY: &str = r#"{
        "dry_run": true,
        "rules": {
            "max_contracts": { "enabled": true, "severity": "high", "parameters": { "max_contracts": 4, "enforcement": "flatten" } }
        }
    }"#;

    const DAILY_LOSS_LIVE: &str = r#"{
        "dry_run": false,
        "rules": {
            "daily_loss": { "enabled": true, "severity": "high", "parameters": { "max_usd": 200 } }
        }
    }"#;

    #[tokio::test]
    async fn dry_run_breach_is_audited_but_not_enforced() {
        let mut h = harness(MAX_CONTRACTS_DRY);

        // No broker position yet: projection falls back to fill-size check.
        h.daemon.handle_event(buy(3, 100.0)).await;
        // Broker now reports the 3-lot; buying 2 more projects to 5 > 4.
        h.broker.insert_position(MNQ, 3, 0.0);
        h.daemon.handle_event(buy(2, 101.0)).await;

        let records = audit_records(&h.audit_path);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].level, "INFO");
        assert_eq!(records[1].level, "WARNING");
        assert!(records[1].message.contains("max_contracts"));
        assert!(records[1].message.contains("Projected net position size 5"));
        assert!(records[1].message.contains("(dry-run: no enforcement)"));
        assert!(h.broker.closed_contracts().is_empty());
    }

    #[tokio::test]
    async fn daily_loss_kill_switch_fires_past_the_limit() {
        let mut h = harness(DAILY_LOSS_LIVE);
        h.broker.insert_position(MNQ, 2, 0.0);

        h.daemon.handle_event(closed(-150.0)).await;
        assert!(!h.daemon.session().trading_locked());
        assert!(h.broker.closed_contracts().is_empty());

        h.daemon.handle_event(closed(-60.0)).await;
        assert_eq!(h.daemon.session().daily_realized_pnl(), -210.0);
        assert!(h.daemon.session().trading_locked());
        assert_eq!(h.broker.closed_contracts(), vec![MNQ.to_string()]);

        let records = audit_records(&h.audit_path);
        let summary = records
            .iter()
            .find(|r| r.message.contains("Trading disabled until next reset"))
            .expect("kill switch summary missing");
        assert!(summary.message.contains("Closed 1/1"));
    }

    #[tokio::test]
    async fn locked_account_force_flattens_new_fills() {
        let mut h = harness(r#"{ "dry_run": false, "rules": {} }"#);
        h.daemon.session_mut().set_locked(true);

        h.daemon.handle_event(buy(2, 100.0)).await;

        assert_eq!(h.broker.closed_contracts(), vec![MNQ.to_string()]);
        assert!(h.daemon.tracker().get(MNQ).is_none());
        let records = audit_records(&h.audit_path);
        assert!(records
            .iter()
            .any(|r| r.message.contains("Trading locked: Flattened new fill")));
    }

    #[tokio::test]
    async fn silent_close_attributes_pnl_and_removes_lot() {
        let mut h = harness(MAX_CONTRACTS_DRY);

        h.daemon.handle_event(buy(2, 100.0)).await;
        assert!(h.daemon.tracker().get(MNQ).is_some());

        h.broker.insert_position(MNQ, 0, -50.0);
        let event = Event::now(EventPayload::PositionUpdated(PositionUpdate {
            contract_id: MNQ.to_string(),
            size: 0,
            average_price: 0.0,
            position_type: PositionType::Long,
            pnl: None,
        }));
        h.daemon.handle_event(event).await;

        assert_eq!(h.daemon.session().daily_realized_pnl(), -50.0);
        assert!(h.daemon.tracker().get(MNQ).is_none());
        let records = audit_records(&h.audit_path);
        assert!(records
            .iter()
            .any(|r| r.message.contains("(possible close)")));
    }

    #[tokio::test]
    async fn session_resets_at_the_boundary_between_events() {
        let mut h = harness(MAX_CONTRACTS_DRY);
        h.daemon.session_mut().set_locked(true);

        // 14:00 CST on Jan 15.
        let first = Event::at(
            utc("2025-01-15T20:00:00Z"),
            EventPayload::PositionClosed(ClosedPosition {
                contract_id: MNQ.to_string(),
                pnl: -80.0,
                close_price: None,
            }),
        );
        h.daemon.handle_event(first).await;
        assert_eq!(h.daemon.session().daily_realized_pnl(), -80.0);

        // 17:00:01 CST on Jan 16: rollover, then the new event's P&L.
        let second = Event::at(
            utc("2025-01-16T23:00:01Z"),
            EventPayload::PositionClosed(ClosedPosition {
                contract_id: MNQ.to_string(),
                pnl: -30.0,
                close_price: None,
            }),
        );
        h.daemon.handle_event(second).await;

        assert_eq!(h.daemon.session().daily_realized_pnl(), -30.0);
        assert!(!h.daemon.session().trading_locked());
        let records = audit_records(&h.audit_path);
        assert!(records
            .iter()
            .any(|r| r.message.contains("Daily session reset")));
    }

    #[tokio::test]
    async fn quote_updates_are_filtered_before_audit() {
        let mut h = harness(MAX_CONTRACTS_DRY);
        h.daemon.handle_event(Event::now(EventPayload::QuoteUpdate)).await;
        assert!(audit_records(&h.audit_path).is_empty());
    }

    #[tokio::test]
    async fn restart_continuity_through_the_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let state_path = dir.path().join("daily_pnl.json");
        let config: RiskConfig = serde_json::from_str(DAILY_LOSS_LIVE).unwrap();
        let broker = Arc::new(MockBroker::new());
        let audit_path = dir.path().join("audit.ndjson");
        let now = Utc::now();

        // First daemon life: book a -150 close, then die.
        {
            let audit = Arc::new(AuditLog::new(&audit_path).unwrap());
            let mut session = SessionStore::new(&state_path);
            session.reset_for(session_date(now));
            session.checkpoint().unwrap();
            let (tx, _rx) = mpsc::channel(16);
            let mut daemon = Daemon::new(
                config.clone(),
                broker.clone() as Arc<dyn Broker>,
                audit,
                session,
                1,
                tx,
                dir.path().join("daemon.stop"),
            );
            daemon.handle_event(closed(-150.0)).await;
            assert_eq!(daemon.session().daily_realized_pnl(), -150.0);
        }

        // Second life: restore the same-day checkpoint, next loss kills.
        let audit = Arc::new(AuditLog::new(&audit_path).unwrap());
        let mut session = SessionStore::new(&state_path);
        session.restore(broker.as_ref(), now).await.unwrap();
        assert_eq!(session.daily_realized_pnl(), -150.0);

        broker.insert_position(MNQ, 1, 0.0);
        let (tx, _rx) = mpsc::channel(16);
        let mut daemon = Daemon::new(
            config,
            broker.clone() as Arc<dyn Broker>,
            audit,
            session,
            1,
            tx,
            dir.path().join("daemon.stop"),
        );
        daemon.handle_event(closed(-60.0)).await;

        assert_eq!(daemon.session().daily_realized_pnl(), -210.0);
        assert!(daemon.session().trading_locked());
        assert_eq!(broker.closed_contracts(), vec![MNQ.to_string()]);
    }

    #[tokio::test]
    async fn seed_tracker_rebuilds_from_broker() {
        let mut h = harness(MAX_CONTRACTS_DRY);
        h.broker.insert_position(MNQ, -3, 0.0);
        h.broker.insert_position("CON.F.US.MES.H26", 0, 0.0);

        h.daemon.seed_tracker().await.unwrap();

        let lot = h.daemon.tracker().get(MNQ).unwrap();
        assert_eq!(lot.size, 3);
        assert_eq!(lot.side, PositionType::Short);
        assert!(h.daemon.tracker().get("CON.F.US.MES.H26").is_none());
    }

    #[tokio::test]
    async fn first_breach_wins_in_declaration_order() {
        // daily_loss declared first; a silent close while deep in deficit
        // must trigger the kill switch, not max_contracts.
        let mut h = harness(
            r#"{
                "dry_run": false,
                "rules": {
                    "daily_loss": { "enabled": true, "parameters": { "max_usd": 100 } },
                    "max_contracts": { "enabled": true, "parameters": { "max_contracts": 1 } }
                }
            }"#,
        );
        h.daemon.session_mut().add_realized(-90.0);
        h.broker.insert_position(MNQ, 0, -20.0);
        h.daemon.handle_event(buy(1, 100.0)).await;

        let event = Event::now(EventPayload::PositionUpdated(PositionUpdate {
            contract_id: MNQ.to_string(),
            size: 0,
            average_price: 0.0,
            position_type: PositionType::Long,
            pnl: None,
        }));
        h.daemon.handle_event(event).await;

        // -90 - 20 = -110 < -100: kill switch, and the lock is set.
        assert!(h.daemon.session().trading_locked());
        let records = audit_records(&h.audit_path);
        assert!(records.iter().any(|r| r.message.contains("daily_loss")));
    }
}
