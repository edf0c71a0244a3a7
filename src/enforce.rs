// =============================================================================
// Enforcement Engine — flatten one contract or kill the whole book
// =============================================================================
//
// Both actions run inline on the dispatcher task so no later event can race
// ahead of enforcement for the same contract. Every close carries two
// measured latencies in the technical log: event arrival to close dispatch,
// and the close call itself. A failed flatten is audited and left to the
// operator; a partially-failed kill switch still locks trading.
// =============================================================================

use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::audit::AuditLog;
use crate::broker::stream::Inbound;
use crate::broker::Broker;
use crate::contract::display_symbol;
use crate::events::{Event, EventPayload, PositionType, PositionUpdate};
use crate::session::SessionStore;

pub struct EnforcementEngine {
    broker: Arc<dyn Broker>,
    account_id: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KillSwitchOutcome {
    pub closed: usize,
    pub total: usize,
}

impl EnforcementEngine {
    pub fn new(broker: Arc<dyn Broker>, account_id: i64) -> Self {
        Self { broker, account_id }
    }

    // -------------------------------------------------------------------------
    // Flatten
    // -------------------------------------------------------------------------

    /// Close a single contract's position. `received_at` is the instant the
    /// triggering event reached the dispatcher. Returns true on success.
    pub async fn flatten(
        &self,
        contract_id: &str,
        reason: &str,
        received_at: Instant,
        audit: &AuditLog,
    ) -> bool {
        info!(contract = %contract_id, "attempting to flatten position");
        let dispatch_ms = received_at.elapsed().as_millis() as u64;

        let call_start = Instant::now();
        let result = self.broker.close_position(contract_id, self.account_id).await;
        let call_ms = call_start.elapsed().as_millis() as u64;

        info!(
            contract = %contract_id,
            dispatch_ms,
            call_ms,
            "flatten enforcement latency"
        );

        match result {
            Ok(resp) if resp.success => {
                info!(contract = %contract_id, "enforced flatten successful");
                audit.info(format!("Enforced: Flattened {contract_id} due to {reason}."));
                true
            }
            Ok(resp) => {
                let msg = resp
                    .error_message
                    .unwrap_or_else(|| "unknown error".to_string());
                error!(contract = %contract_id, error = %msg, "flatten failed");
                audit.error(format!("Enforcement failed for {contract_id}: {msg}"));
                false
            }
            Err(e) => {
                error!(contract = %contract_id, error = %e, "flatten request failed");
                audit.error(format!("Enforcement failed for {contract_id}: {e}"));
                false
            }
        }
    }

    // -------------------------------------------------------------------------
    // Kill switch
    // -------------------------------------------------------------------------

    /// Close every open position and lock trading until the next session
    /// reset. The lock is set even when some closes fail; only an operator
    /// or the rollover clears it.
    pub async fn kill_switch(
        &self,
        reason: &str,
        received_at: Instant,
        session: &mut SessionStore,
        audit: &AuditLog,
    ) -> KillSwitchOutcome {
        let dispatch_ms = received_at.elapsed().as_millis() as u64;

        let positions = match self.broker.get_all_positions(self.account_id).await {
            Ok(positions) => positions,
            Err(e) => {
                error!(error = %e, "kill switch could not enumerate positions");
                audit.error(format!("Kill switch could not enumerate positions: {e}"));
                Vec::new()
            }
        };

        let open: Vec<_> = positions.into_iter().filter(|p| p.size != 0).collect();
        let total = open.len();
        let mut closed = 0usize;

        for position in &open {
            match self
                .broker
                .close_position(&position.contract_id, self.account_id)
                .await
            {
                Ok(resp) if resp.success => closed += 1,
                Ok(resp) => error!(
                    contract = %position.contract_id,
                    error = ?resp.error_message,
                    "kill switch close failed"
                ),
                Err(e) => error!(
                    contract = %position.contract_id,
                    error = %e,
                    "kill switch close request failed"
                ),
            }
        }

        session.set_locked(true);
        if let Err(e) = session.checkpoint() {
            warn!(error = %e, "checkpoint after kill switch failed");
        }

        let outcome = KillSwitchOutcome { closed, total };
        info!(
            closed = outcome.closed,
            total = outcome.total,
            dispatch_ms,
            "daily loss kill switch executed"
        );
        audit.warning(format!(
            "{reason}. Closed {}/{} positions. Trading disabled until next reset (5:00 PM CT).",
            outcome.closed, outcome.total
        ));

        outcome
    }
}

impl std::fmt::Debug for EnforcementEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnforcementEngine")
            .field("account_id", &self.account_id)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Close-confirmation poll
// ---------------------------------------------------------------------------

/// After a SELL fill, check whether the gateway went flat on the filled
/// symbol without emitting a close event; if so, synthesize the silent-close
/// `PositionUpdated{size: 0}` back into the dispatcher queue.
pub async fn confirm_close(
    broker: &dyn Broker,
    account_id: i64,
    symbol: &str,
    tx: &mpsc::Sender<Inbound>,
) -> Result<bool> {
    let positions = broker.get_all_positions(account_id).await?;

    for position in positions {
        let matches_symbol = position.symbol_id == format!("F.US.{symbol}")
            || display_symbol(&position.contract_id) == symbol;
        if matches_symbol && position.size == 0 {
            info!(
                symbol,
                contract = %position.contract_id,
                "close-confirmation poll found flat position"
            );
            let event = Event::now(EventPayload::PositionUpdated(PositionUpdate {
                contract_id: position.contract_id,
                size: 0,
                average_price: 0.0,
                position_type: PositionType::Long,
                pnl: None,
            }));
            let _ = tx.send(Inbound::Event(event)).await;
            return Ok(true);
        }
    }

    Ok(false)
}
