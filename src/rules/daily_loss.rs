// =============================================================================
// daily_loss — kill switch on the session's realized loss
// =============================================================================
//
// Fires on events that move realized P&L: closes, P&L updates, and silent
// closes. The dispatcher updates the accumulator before rules run, so the
// breach condition reads the post-update value directly; adding the event's
// own P&L here again would double-count it.
// =============================================================================

use async_trait::async_trait;

use crate::broker::Broker;
use crate::config::RuleConfig;
use crate::events::{Event, EventPayload};

use super::{BreachResult, RiskRule, RuleAction};

pub struct DailyLoss;

#[async_trait]
impl RiskRule for DailyLoss {
    fn name(&self) -> &'static str {
        "daily_loss"
    }

    async fn check(
        &self,
        event: &Event,
        config: &RuleConfig,
        _broker: &dyn Broker,
        _dry_run: bool,
        daily_pnl: f64,
    ) -> BreachResult {
        let moves_realized_pnl = matches!(
            event.payload,
            EventPayload::PositionClosed(_) | EventPayload::PositionPnlUpdate(_)
        ) || matches!(&event.payload, EventPayload::PositionUpdated(u) if u.size == 0);

        if !moves_realized_pnl {
            return BreachResult::valid();
        }

        let max_usd = config.param_f64("max_usd", 200.0);
        if daily_pnl < -max_usd {
            BreachResult::breach(
                format!("Daily realized P&L {daily_pnl:.2} < -{max_usd:.2}"),
                RuleAction::KillSwitch,
                None,
            )
        } else {
            BreachResult::valid()
        }
    }
}
