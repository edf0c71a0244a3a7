// =============================================================================
// Risk rules — build-time registry selected by config name
// =============================================================================
//
// Each rule is a plugin behind the [`RiskRule`] trait. The set is known at
// compile time; the config's `rules` keys select and order them, and the
// dispatcher stops at the first breach. Rules never mutate daemon state:
// the broker client is their only window on the world, and the daily
// accumulator is handed in already updated for the event under evaluation.
// =============================================================================

mod daily_loss;
mod max_contracts;

pub use daily_loss::DailyLoss;
pub use max_contracts::MaxContracts;

use async_trait::async_trait;
use tracing::{error, info};

use crate::audit::AuditLog;
use crate::broker::Broker;
use crate::config::{RiskConfig, RuleConfig};
use crate::events::Event;

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleStatus {
    Valid,
    Breach,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleAction {
    None,
    Flatten,
    KillSwitch,
}

impl std::fmt::Display for RuleAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::None => write!(f, "none"),
            Self::Flatten => write!(f, "flatten"),
            Self::KillSwitch => write!(f, "kill_switch"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BreachResult {
    pub status: RuleStatus,
    pub reason: String,
    pub action: RuleAction,
    pub target_contract: Option<String>,
}

impl BreachResult {
    pub fn valid() -> Self {
        Self {
            status: RuleStatus::Valid,
            reason: String::new(),
            action: RuleAction::None,
            target_contract: None,
        }
    }

    pub fn breach(
        reason: impl Into<String>,
        action: RuleAction,
        target_contract: Option<String>,
    ) -> Self {
        Self {
            status: RuleStatus::Breach,
            reason: reason.into(),
            action,
            target_contract,
        }
    }

    pub fn is_breach(&self) -> bool {
        self.status == RuleStatus::Breach
    }
}

// ---------------------------------------------------------------------------
// Trait and registry
// ---------------------------------------------------------------------------

/// One pluggable risk rule.
///
/// `daily_pnl` is the accumulator *after* the event's P&L has been applied.
#[async_trait]
pub trait RiskRule: Send + Sync {
    fn name(&self) -> &'static str;

    async fn check(
        &self,
        event: &Event,
        config: &RuleConfig,
        broker: &dyn Broker,
        dry_run: bool,
        daily_pnl: f64,
    ) -> BreachResult;
}

/// Instantiate the enabled rules in config-declaration order. Unknown names
/// are reported and skipped; protection continues with the remaining rules.
pub fn build_rules(config: &RiskConfig, audit: Option<&AuditLog>) -> Vec<Box<dyn RiskRule>> {
    let mut rules: Vec<Box<dyn RiskRule>> = Vec::new();

    for (name, _) in config.enabled_rules() {
        match name.as_str() {
            "max_contracts" => rules.push(Box::new(MaxContracts)),
            "daily_loss" => rules.push(Box::new(DailyLoss)),
            other => {
                error!(rule = other, "no rule module with this name");
                if let Some(audit) = audit {
                    audit.error(format!("Failed to load rule module: {other} - unknown rule name"));
                }
                continue;
            }
        }
        info!(rule = %name, "rule module loaded");
    }

    rules
}
