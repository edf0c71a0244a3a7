// =============================================================================
// P&L Engine — daily realized accumulator with 17:00 CT reset
// =============================================================================
//
// The gateway omits the realized figure on a material fraction of close
// events, so attribution runs a fallback chain: the event's own pnl, the
// broker's final unrealized figure for the position, reconstruction from the
// tracked lot at the close price, and finally the last market price. The
// daily number must stay correct or the kill switch loses its meaning.
//
// The accumulator and checkpoint are updated before rules run for an event,
// so P&L-scoped rules always evaluate the post-update value.
// =============================================================================

use chrono::{DateTime, Timelike, Utc};
use chrono_tz::America::Chicago;
use tracing::{debug, info, warn};

use crate::audit::AuditLog;
use crate::broker::Broker;
use crate::contract::display_symbol;
use crate::events::{Event, EventPayload};
use crate::session::{SessionStore, SESSION_ROLLOVER_HOUR};
use crate::tracker::PositionTracker;

pub struct PnlEngine;

impl PnlEngine {
    pub fn new() -> Self {
        Self
    }

    // -------------------------------------------------------------------------
    // Session reset
    // -------------------------------------------------------------------------

    /// Roll the session over when `event_ts` has crossed 17:00 America/Chicago
    /// since the last reset. Returns true when a reset happened.
    pub fn check_reset(
        &self,
        event_ts: DateTime<Utc>,
        session: &mut SessionStore,
        tracker: &mut PositionTracker,
        audit: &AuditLog,
    ) -> bool {
        let ct = event_ts.with_timezone(&Chicago);
        if ct.hour() < SESSION_ROLLOVER_HOUR {
            return false;
        }
        let today = ct.date_naive();
        if session.state().last_reset_date == Some(today) {
            return false;
        }

        let was_locked = session.trading_locked();
        session.reset_for(today);
        if !tracker.is_empty() {
            info!(cleared_lots = tracker.len(), "tracked lots cleared by session reset");
        }
        tracker.clear();
        if let Err(e) = session.checkpoint() {
            warn!(error = %e, "checkpoint after session reset failed");
        }

        if was_locked {
            audit.info(
                "Daily session reset at 5:00 PM CT. Loss/profit counters cleared, trading unlocked.",
            );
        } else {
            audit.info("Daily session reset at 5:00 PM CT. Loss/profit counters cleared.");
        }
        info!(date = %today, "daily P&L reset at 5:00 PM CT");
        true
    }

    // -------------------------------------------------------------------------
    // Attribution
    // -------------------------------------------------------------------------

    /// Apply the event's realized P&L to the session. Returns the Δ added to
    /// the accumulator (0.0 for events that carry none).
    pub async fn apply(
        &self,
        event: &Event,
        session: &mut SessionStore,
        tracker: &mut PositionTracker,
        broker: &dyn Broker,
    ) -> f64 {
        match &event.payload {
            EventPayload::PositionClosed(closed) => {
                let delta = self
                    .attribute_close(&closed.contract_id, closed.pnl, closed.close_price, tracker, broker)
                    .await;
                tracker.remove(&closed.contract_id);
                self.commit(delta, "close", session);
                delta
            }
            EventPayload::PositionPnlUpdate(update) => {
                if update.realized_pnl == 0.0 {
                    return 0.0;
                }
                self.commit(update.realized_pnl, "pnl_update", session);
                update.realized_pnl
            }
            EventPayload::PositionUpdated(update) if update.size == 0 => {
                let delta = self
                    .attribute_close(&update.contract_id, update.pnl.unwrap_or(0.0), None, tracker, broker)
                    .await;
                tracker.remove(&update.contract_id);
                self.commit(delta, "silent_close", session);
                delta
            }
            _ => 0.0,
        }
    }

    fn commit(&self, delta: f64, source: &str, session: &mut SessionStore) {
        session.add_realized(delta);
        info!(
            delta,
            cumulative = session.daily_realized_pnl(),
            source,
            "daily P&L updated"
        );
        if let Err(e) = session.checkpoint() {
            warn!(error = %e, "P&L checkpoint failed");
        }
    }

    /// Multi-source attribution for a close: event pnl, then the broker's
    /// final unrealized figure, then reconstruction from the tracked lot
    /// (with a last-price query when the close price is absent).
    async fn attribute_close(
        &self,
        contract_id: &str,
        payload_pnl: f64,
        close_price: Option<f64>,
        tracker: &mut PositionTracker,
        broker: &dyn Broker,
    ) -> f64 {
        if payload_pnl != 0.0 {
            return payload_pnl;
        }

        match broker.get_position(contract_id).await {
            Ok(pos) if pos.unrealized_pnl != 0.0 => {
                debug!(
                    contract = %contract_id,
                    pnl = pos.unrealized_pnl,
                    "realized taken from final unrealized P&L"
                );
                return pos.unrealized_pnl;
            }
            Ok(_) => {
                debug!(contract = %contract_id, "broker reports zero P&L, reconstructing from lot")
            }
            Err(e) => {
                warn!(contract = %contract_id, error = %e, "position query failed, reconstructing from lot")
            }
        }

        let Some(lot) = tracker.remove(contract_id) else {
            warn!(contract = %contract_id, "no P&L data or tracked lot for close, using 0");
            return 0.0;
        };
        if lot.avg_entry_price <= 0.0 {
            warn!(contract = %contract_id, "tracked lot has no entry price, using 0");
            return 0.0;
        }

        let exit_price = match close_price {
            Some(p) => p,
            None => {
                let symbol = display_symbol(contract_id);
                match broker.get_current_price(symbol).await {
                    Ok(p) => {
                        debug!(symbol, price = p, "fallback exit price from last market price");
                        p
                    }
                    Err(e) => {
                        warn!(symbol, error = %e, "price query failed, using 0");
                        0.0
                    }
                }
            }
        };

        let point_value = tracker.point_value(contract_id);
        let size = lot.size as f64;
        let pnl = match lot.side {
            crate::events::PositionType::Long => (exit_price - lot.avg_entry_price) * size * point_value,
            crate::events::PositionType::Short => (lot.avg_entry_price - exit_price) * size * point_value,
        };
        debug!(
            contract = %contract_id,
            entry = lot.avg_entry_price,
            exit = exit_price,
            size = lot.size,
            pnl,
            "realized P&L reconstructed from tracked lot"
        );
        pnl
    }
}

impl Default for PnlEngine {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::mock::MockBroker;
    use crate::contract::InstrumentCatalog;
    use crate::events::{ClosedPosition, OrderFill, PnlUpdate, PositionType, PositionUpdate, Side};

    const MNQ: &str = "CON.F.US.MNQ.Z25";

    struct Fixture {
        _dir: tempfile::TempDir,
        session: SessionStore,
        tracker: PositionTracker,
        audit: AuditLog,
        audit_path: std::path::PathBuf,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let session = SessionStore::new(dir.path().join("daily_pnl.json"));
        let audit_path = dir.path().join("audit.ndjson");
        let audit = AuditLog::new(&audit_path).unwrap();
        Fixture {
            session,
            tracker: PositionTracker::new(InstrumentCatalog::new()),
            audit,
            audit_path,
            _dir: dir,
        }
    }

    fn closed_event(pnl: f64) -> Event {
        Event::now(EventPayload::PositionClosed(ClosedPosition {
            contract_id: MNQ.to_string(),
            pnl,
            close_price: None,
        }))
    }

    fn utc(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    fn audit_messages(path: &std::path::Path) -> Vec<String> {
        std::fs::read_to_string(path)
            .unwrap_or_default()
            .lines()
            .map(|l| {
                serde_json::from_str::<crate::audit::AuditRecord>(l)
                    .unwrap()
                    .message
            })
            .collect()
    }

    #[tokio::test]
    async fn event_pnl_is_used_directly() {
        let mut fx = fixture();
        let broker = MockBroker::new();

        let delta = PnlEngine::new()
            .apply(&closed_event(-150.0), &mut fx.session, &mut fx.tracker, &broker)
            .await;

        assert_eq!(delta, -150.0);
        assert_eq!(fx.session.daily_realized_pnl(), -150.0);
    }

    #[tokio::test]
    async fn missing_pnl_recovered_from_broker_unrealized() {
        let mut fx = fixture();
        fx.tracker.apply_fill(&OrderFill {
            contract_id: MNQ.to_string(),
            symbol_id: "F.US.MNQ".to_string(),
            side: Side::Buy,
            size: 2,
            filled_price: 100.0,
        });

        let broker = MockBroker::new();
        broker.insert_position(MNQ, 0, -50.0);

        let delta = PnlEngine::new()
            .apply(&closed_event(0.0), &mut fx.session, &mut fx.tracker, &broker)
            .await;

        assert_eq!(delta, -50.0);
        assert_eq!(fx.session.daily_realized_pnl(), -50.0);
        assert!(fx.tracker.get(MNQ).is_none());
    }

    #[tokio::test]
    async fn missing_pnl_reconstructed_from_lot_at_last_price() {
        let mut fx = fixture();
        fx.tracker.apply_fill(&OrderFill {
            contract_id: MNQ.to_string(),
            symbol_id: "F.US.MNQ".to_string(),
            side: Side::Buy,
            size: 2,
            filled_price: 100.0,
        });

        let broker = MockBroker::new();
        *broker.fail_position_query.lock() = true;
        *broker.last_price.lock() = Some(97.0);

        let delta = PnlEngine::new()
            .apply(&closed_event(0.0), &mut fx.session, &mut fx.tracker, &broker)
            .await;

        // Long 2 @ 100 closed at 97: -3 points x 2 x $5.
        assert_eq!(delta, -30.0);
        assert!(fx.tracker.get(MNQ).is_none());
    }

    #[tokio::test]
    async fn close_price_on_event_beats_price_query() {
        let mut fx = fixture();
        fx.tracker.apply_fill(&OrderFill {
            contract_id: MNQ.to_string(),
            symbol_id: "F.US.MNQ".to_string(),
            side: Side::Sell,
            size: 1,
            filled_price: 100.0,
        });

        let broker = MockBroker::new();
        *broker.fail_position_query.lock() = true;
        *broker.last_price.lock() = Some(400.0); // must not be consulted

        let event = Event::now(EventPayload::PositionClosed(ClosedPosition {
            contract_id: MNQ.to_string(),
            pnl: 0.0,
            close_price: Some(98.0),
        }));
        let delta = PnlEngine::new()
            .apply(&event, &mut fx.session, &mut fx.tracker, &broker)
            .await;

        // Short 1 @ 100 closed at 98: +2 points x $5.
        assert_eq!(delta, 10.0);
    }

    #[tokio::test]
    async fn untracked_close_without_data_contributes_zero() {
        let mut fx = fixture();
        let broker = MockBroker::new();
        *broker.fail_position_query.lock() = true;

        let delta = PnlEngine::new()
            .apply(&closed_event(0.0), &mut fx.session, &mut fx.tracker, &broker)
            .await;
        assert_eq!(delta, 0.0);
        assert_eq!(fx.session.daily_realized_pnl(), 0.0);
    }

    #[tokio::test]
    async fn pnl_update_adds_realized() {
        let mut fx = fixture();
        let broker = MockBroker::new();

        let event = Event::now(EventPayload::PositionPnlUpdate(PnlUpdate {
            contract_id: Some(MNQ.to_string()),
            realized_pnl: 25.5,
        }));
        let delta = PnlEngine::new()
            .apply(&event, &mut fx.session, &mut fx.tracker, &broker)
            .await;
        assert_eq!(delta, 25.5);

        let zero = Event::now(EventPayload::PositionPnlUpdate(PnlUpdate {
            contract_id: None,
            realized_pnl: 0.0,
        }));
        let delta = PnlEngine::new()
            .apply(&zero, &mut fx.session, &mut fx.tracker, &broker)
            .await;
        assert_eq!(delta, 0.0);
        assert_eq!(fx.session.daily_realized_pnl(), 25.5);
    }

    #[tokio::test]
    async fn silent_close_uses_same_attribution_chain() {
        let mut fx = fixture();
        fx.tracker.apply_fill(&OrderFill {
            contract_id: MNQ.to_string(),
            symbol_id: "F.US.MNQ".to_string(),
            side: Side::Buy,
            size: 1,
            filled_price: 100.0,
        });

        let broker = MockBroker::new();
        broker.insert_position(MNQ, 0, -12.5);

        let event = Event::now(EventPayload::PositionUpdated(PositionUpdate {
            contract_id: MNQ.to_string(),
            size: 0,
            average_price: 0.0,
            position_type: PositionType::Long,
            pnl: None,
        }));
        let delta = PnlEngine::new()
            .apply(&event, &mut fx.session, &mut fx.tracker, &broker)
            .await;

        assert_eq!(delta, -12.5);
        assert!(fx.tracker.get(MNQ).is_none());
    }

    #[tokio::test]
    async fn accumulator_equals_sum_of_deltas() {
        let mut fx = fixture();
        let broker = MockBroker::new();
        let engine = PnlEngine::new();

        let mut expected = 0.0;
        for pnl in [-150.0, 40.0, -60.0] {
            expected += engine
                .apply(&closed_event(pnl), &mut fx.session, &mut fx.tracker, &broker)
                .await;
        }
        assert_eq!(fx.session.daily_realized_pnl(), expected);
        assert_eq!(expected, -170.0);
    }

    #[test]
    fn reset_fires_once_per_session_date() {
        let mut fx = fixture();
        let engine = PnlEngine::new();

        fx.session.add_realized(-210.0);
        fx.session.set_locked(true);
        fx.tracker.apply_snapshot(MNQ, 2, 100.0, PositionType::Long);

        // 2025-01-16 17:00:01 CST == 23:00:01 UTC.
        let ts = utc("2025-01-16T23:00:01Z");
        assert!(engine.check_reset(ts, &mut fx.session, &mut fx.tracker, &fx.audit));

        assert_eq!(fx.session.daily_realized_pnl(), 0.0);
        assert!(!fx.session.trading_locked());
        assert!(fx.tracker.is_empty());

        let messages = audit_messages(&fx.audit_path);
        assert!(messages.iter().any(|m| m.contains("Daily session reset")));

        // Same boundary again: no second reset.
        assert!(!engine.check_reset(ts, &mut fx.session, &mut fx.tracker, &fx.audit));
    }

    #[test]
    fn no_reset_before_boundary() {
        let mut fx = fixture();
        fx.session.add_realized(-50.0);

        // 16:59 CST.
        let ts = utc("2025-01-16T22:59:00Z");
        assert!(!PnlEngine::new().check_reset(ts, &mut fx.session, &mut fx.tracker, &fx.audit));
        assert_eq!(fx.session.daily_realized_pnl(), -50.0);
    }
}
