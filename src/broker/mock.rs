// =============================================================================
// Scripted broker for unit tests
// =============================================================================

use std::collections::HashMap;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use super::{Broker, CloseResponse, PerformanceMetrics, PortfolioPnl, PositionSnapshot};
use crate::contract::display_symbol;

/// In-memory broker with scripted responses. Close requests are recorded so
/// tests can assert on enforcement behaviour; failure flags force the
/// daemon's fallback paths.
#[derive(Default)]
pub struct MockBroker {
    pub positions: Mutex<HashMap<String, PositionSnapshot>>,
    pub portfolio: Mutex<PortfolioPnl>,
    pub performance: Mutex<PerformanceMetrics>,
    pub last_price: Mutex<Option<f64>>,
    /// Scripted per-contract close outcomes; unscripted contracts succeed.
    pub close_results: Mutex<HashMap<String, CloseResponse>>,
    /// Contracts a close was requested for, in order.
    pub closed: Mutex<Vec<String>>,
    pub fail_position_query: Mutex<bool>,
    pub fail_portfolio_query: Mutex<bool>,
    pub fail_performance_query: Mutex<bool>,
    pub fail_price_query: Mutex<bool>,
}

impl MockBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(contract_id: &str, size: i64, unrealized_pnl: f64) -> PositionSnapshot {
        PositionSnapshot {
            contract_id: contract_id.to_string(),
            symbol_id: format!("F.US.{}", display_symbol(contract_id)),
            size,
            average_price: 0.0,
            unrealized_pnl,
        }
    }

    pub fn insert_position(&self, contract_id: &str, size: i64, unrealized_pnl: f64) {
        self.positions.lock().insert(
            contract_id.to_string(),
            Self::snapshot(contract_id, size, unrealized_pnl),
        );
    }

    pub fn set_portfolio(&self, day_pnl: f64, realized_pnl: f64) {
        *self.portfolio.lock() = PortfolioPnl {
            day_pnl,
            realized_pnl,
        };
    }

    pub fn set_performance(&self, daily_pnl: f64) {
        *self.performance.lock() = PerformanceMetrics { daily_pnl };
    }

    pub fn closed_contracts(&self) -> Vec<String> {
        self.closed.lock().clone()
    }
}

#[async_trait]
impl Broker for MockBroker {
    async fn get_position(&self, contract_id: &str) -> Result<PositionSnapshot> {
        if *self.fail_position_query.lock() {
            return Err(anyhow!("scripted position query failure"));
        }
        self.positions
            .lock()
            .get(contract_id)
            .cloned()
            .ok_or_else(|| anyhow!("position not found: {contract_id}"))
    }

    async fn get_all_positions(&self, _account_id: i64) -> Result<Vec<PositionSnapshot>> {
        if *self.fail_position_query.lock() {
            return Err(anyhow!("scripted position query failure"));
        }
        Ok(self.positions.lock().values().cloned().collect())
    }

    async fn get_portfolio_pnl(&self) -> Result<PortfolioPnl> {
        if *self.fail_portfolio_query.lock() {
            return Err(anyhow!("scripted portfolio query failure"));
        }
        Ok(*self.portfolio.lock())
    }

    async fn get_performance_metrics(
        &self,
        _from: DateTime<Utc>,
        _to: DateTime<Utc>,
    ) -> Result<PerformanceMetrics> {
        if *self.fail_performance_query.lock() {
            return Err(anyhow!("scripted performance query failure"));
        }
        Ok(*self.performance.lock())
    }

    async fn close_position(&self, contract_id: &str, _account_id: i64) -> Result<CloseResponse> {
        self.closed.lock().push(contract_id.to_string());
        Ok(self
            .close_results
            .lock()
            .get(contract_id)
            .cloned()
            .unwrap_or(CloseResponse {
                success: true,
                error_message: None,
            }))
    }

    async fn get_current_price(&self, _symbol: &str) -> Result<f64> {
        if *self.fail_price_query.lock() {
            return Err(anyhow!("scripted price query failure"));
        }
        self.last_price
            .lock()
            .ok_or_else(|| anyhow!("no last price scripted"))
    }
}
