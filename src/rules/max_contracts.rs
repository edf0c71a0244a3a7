// =============================================================================
// max_contracts — cap the net position size per contract
// =============================================================================
//
// Position updates are checked against the cap directly. Fills are checked
// against the *projected* net size: current broker position plus the signed
// fill. When the broker query fails the rule degrades to a conservative
// fill-size check rather than silently passing.
// =============================================================================

use async_trait::async_trait;
use tracing::warn;

use crate::broker::Broker;
use crate::config::RuleConfig;
use crate::events::{Event, EventPayload, Side};

use super::{BreachResult, RiskRule, RuleAction};

pub struct MaxContracts;

#[async_trait]
impl RiskRule for MaxContracts {
    fn name(&self) -> &'static str {
        "max_contracts"
    }

    async fn check(
        &self,
        event: &Event,
        config: &RuleConfig,
        broker: &dyn Broker,
        dry_run: bool,
        _daily_pnl: f64,
    ) -> BreachResult {
        let max = config.param_i64("max_contracts", 4);

        match &event.payload {
            EventPayload::PositionUpdated(update) => {
                let size = update.size.abs();
                if size > max {
                    BreachResult::breach(
                        format!("Net position size {size} exceeds max {max}"),
                        RuleAction::Flatten,
                        Some(update.contract_id.clone()),
                    )
                } else {
                    BreachResult::valid()
                }
            }
            EventPayload::OrderFilled(fill) => {
                if fill.size == 0 {
                    return BreachResult::valid();
                }
                let delta = match fill.side {
                    Side::Buy => fill.size as i64,
                    Side::Sell => -(fill.size as i64),
                };

                match broker.get_position(&fill.contract_id).await {
                    Ok(position) => {
                        let projected = position.size + delta;
                        if projected.abs() > max {
                            BreachResult::breach(
                                format!(
                                    "Projected net position size {} exceeds max {max}",
                                    projected.abs()
                                ),
                                RuleAction::Flatten,
                                Some(fill.contract_id.clone()),
                            )
                        } else {
                            BreachResult::valid()
                        }
                    }
                    Err(e) => {
                        warn!(
                            contract = %fill.contract_id,
                            error = %e,
                            "position query failed, falling back to fill-size check"
                        );
                        if fill.size as i64 > max {
                            let reason = if dry_run {
                                format!("Dry-run fill size {} exceeds max {max}", fill.size)
                            } else {
                                format!("Fill size {} exceeds max {max} (query failed)", fill.size)
                            };
                            BreachResult::breach(
                                reason,
                                RuleAction::Flatten,
                                Some(fill.contract_id.clone()),
                            )
                        } else {
                            BreachResult::valid()
                        }
                    }
                }
            }
            _ => BreachResult::valid(),
        }
    }
}
