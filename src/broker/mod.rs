// =============================================================================
// Broker surface — account queries, position closes, realtime feed
// =============================================================================
//
// The daemon never talks HTTP or WebSocket directly; everything goes through
// the [`Broker`] trait so the dispatcher, P&L engine, and rules can be
// exercised against a mock. Production wires in [`client::GatewayClient`]
// for queries and [`stream::UserEventStream`] for the realtime feed.
// =============================================================================

pub mod client;
#[cfg(test)]
pub mod mock;
pub mod stream;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;

/// One account position as reported by the gateway.
#[derive(Debug, Clone, Deserialize)]
pub struct PositionSnapshot {
    #[serde(rename = "contractId")]
    pub contract_id: String,
    #[serde(rename = "symbolId", default)]
    pub symbol_id: String,
    /// Signed net size; 0 means flat.
    #[serde(default)]
    pub size: i64,
    #[serde(rename = "averagePrice", default)]
    pub average_price: f64,
    /// On a closed position this is the final realized figure.
    #[serde(rename = "unrealizedPnl", default)]
    pub unrealized_pnl: f64,
}

/// Account-level P&L summary.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct PortfolioPnl {
    #[serde(default)]
    pub day_pnl: f64,
    #[serde(default)]
    pub realized_pnl: f64,
}

/// Aggregated performance over a query window.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct PerformanceMetrics {
    #[serde(default)]
    pub daily_pnl: f64,
}

/// Result of a close-position request.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CloseResponse {
    #[serde(default)]
    pub success: bool,
    #[serde(rename = "errorMessage", default)]
    pub error_message: Option<String>,
}

/// Query and order surface the daemon requires from the broker SDK.
///
/// Every call may suspend on network I/O. Failures are surfaced to the
/// caller, which follows its fallback path; the core never retries.
#[async_trait]
pub trait Broker: Send + Sync {
    async fn get_position(&self, contract_id: &str) -> Result<PositionSnapshot>;

    async fn get_all_positions(&self, account_id: i64) -> Result<Vec<PositionSnapshot>>;

    async fn get_portfolio_pnl(&self) -> Result<PortfolioPnl>;

    async fn get_performance_metrics(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<PerformanceMetrics>;

    async fn close_position(&self, contract_id: &str, account_id: i64) -> Result<CloseResponse>;

    /// Last traded price for a display symbol (price-based P&L fallback).
    async fn get_current_price(&self, symbol: &str) -> Result<f64>;
}
