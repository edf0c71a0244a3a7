// =============================================================================
// Gateway REST API Client — token-authenticated JSON requests
// =============================================================================
//
// SECURITY: the API key is exchanged once for a session token via
// /api/Auth/loginKey and never appears in query strings or logs. All
// subsequent requests carry the token as a Bearer header with a 10 s timeout.
// =============================================================================

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde_json::{json, Value};
use tracing::{debug, instrument};

use super::{Broker, CloseResponse, PerformanceMetrics, PortfolioPnl, PositionSnapshot};

const DEFAULT_API_URL: &str = "https://gateway.projectx.com";
const DEFAULT_WS_URL: &str = "wss://gateway.projectx.com/hubs/user";

/// Gateway REST client with loginKey token authentication.
pub struct GatewayClient {
    base_url: String,
    ws_url: String,
    username: String,
    api_key: String,
    token: RwLock<Option<String>>,
    client: reqwest::Client,
}

impl GatewayClient {
    // -------------------------------------------------------------------------
    // Construction
    // -------------------------------------------------------------------------

    /// Build a client from `PROJECT_X_USERNAME` / `PROJECT_X_API_KEY`, with
    /// optional `PROJECT_X_API_URL` / `PROJECT_X_WS_URL` overrides.
    pub fn from_env() -> Result<Self> {
        let username =
            std::env::var("PROJECT_X_USERNAME").context("PROJECT_X_USERNAME is not set")?;
        let api_key = std::env::var("PROJECT_X_API_KEY").context("PROJECT_X_API_KEY is not set")?;
        let base_url =
            std::env::var("PROJECT_X_API_URL").unwrap_or_else(|_| DEFAULT_API_URL.to_string());
        let ws_url =
            std::env::var("PROJECT_X_WS_URL").unwrap_or_else(|_| DEFAULT_WS_URL.to_string());
        Ok(Self::new(base_url, ws_url, username, api_key))
    }

    pub fn new(
        base_url: impl Into<String>,
        ws_url: impl Into<String>,
        username: impl Into<String>,
        api_key: impl Into<String>,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");

        Self {
            base_url: base_url.into(),
            ws_url: ws_url.into(),
            username: username.into(),
            api_key: api_key.into(),
            token: RwLock::new(None),
            client,
        }
    }

    pub fn ws_url(&self) -> &str {
        &self.ws_url
    }

    /// Current session token; error when [`authenticate`] has not run.
    pub fn session_token(&self) -> Result<String> {
        self.token
            .read()
            .clone()
            .context("gateway client is not authenticated")
    }

    // -------------------------------------------------------------------------
    // Authentication
    // -------------------------------------------------------------------------

    /// POST /api/Auth/loginKey — exchange the API key for a session token.
    #[instrument(skip(self), name = "gateway::authenticate")]
    pub async fn authenticate(&self) -> Result<()> {
        let url = format!("{}/api/Auth/loginKey", self.base_url);
        let body = json!({ "userName": self.username, "apiKey": self.api_key });

        let resp = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .context("POST /api/Auth/loginKey request failed")?;

        let status = resp.status();
        let parsed: Value = resp.json().await.context("failed to parse login response")?;

        if !status.is_success() {
            anyhow::bail!("gateway POST /api/Auth/loginKey returned {status}: {parsed}");
        }

        let token = parsed["token"]
            .as_str()
            .context("login response missing 'token'")?
            .to_string();
        *self.token.write() = Some(token);

        debug!("gateway session token acquired");
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Request helpers
    // -------------------------------------------------------------------------

    async fn post_json(&self, path: &str, body: Value) -> Result<Value> {
        let token = self.session_token()?;
        let url = format!("{}{}", self.base_url, path);

        let resp = self
            .client
            .post(&url)
            .bearer_auth(token)
            .json(&body)
            .send()
            .await
            .with_context(|| format!("POST {path} request failed"))?;

        let status = resp.status();
        let parsed: Value = resp
            .json()
            .await
            .with_context(|| format!("failed to parse {path} response"))?;

        if !status.is_success() {
            anyhow::bail!("gateway POST {path} returned {status}: {parsed}");
        }

        Ok(parsed)
    }
}

// ---------------------------------------------------------------------------
// Broker implementation
// ---------------------------------------------------------------------------

#[async_trait]
impl Broker for GatewayClient {
    #[instrument(skip(self), name = "gateway::get_position")]
    async fn get_position(&self, contract_id: &str) -> Result<PositionSnapshot> {
        let body = self
            .post_json("/api/Position/search", json!({ "contractId": contract_id }))
            .await?;

        let position: PositionSnapshot = serde_json::from_value(body["position"].clone())
            .context("position search response missing 'position'")?;

        debug!(contract_id, size = position.size, "position retrieved");
        Ok(position)
    }

    #[instrument(skip(self), name = "gateway::get_all_positions")]
    async fn get_all_positions(&self, account_id: i64) -> Result<Vec<PositionSnapshot>> {
        let body = self
            .post_json("/api/Position/searchOpen", json!({ "accountId": account_id }))
            .await?;

        let positions: Vec<PositionSnapshot> = serde_json::from_value(body["positions"].clone())
            .context("position list response missing 'positions'")?;

        debug!(count = positions.len(), "open positions retrieved");
        Ok(positions)
    }

    #[instrument(skip(self), name = "gateway::get_portfolio_pnl")]
    async fn get_portfolio_pnl(&self) -> Result<PortfolioPnl> {
        let body = self.post_json("/api/Portfolio/pnl", json!({})).await?;

        let summary: PortfolioPnl =
            serde_json::from_value(body).context("failed to decode portfolio P&L response")?;

        debug!(
            day_pnl = summary.day_pnl,
            realized_pnl = summary.realized_pnl,
            "portfolio P&L retrieved"
        );
        Ok(summary)
    }

    #[instrument(skip(self), name = "gateway::get_performance_metrics")]
    async fn get_performance_metrics(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<PerformanceMetrics> {
        let body = self
            .post_json(
                "/api/Portfolio/performance",
                json!({ "from": from.to_rfc3339(), "to": to.to_rfc3339() }),
            )
            .await?;

        let metrics: PerformanceMetrics =
            serde_json::from_value(body).context("failed to decode performance response")?;

        debug!(daily_pnl = metrics.daily_pnl, "performance metrics retrieved");
        Ok(metrics)
    }

    #[instrument(skip(self), name = "gateway::close_position")]
    async fn close_position(&self, contract_id: &str, account_id: i64) -> Result<CloseResponse> {
        let body = self
            .post_json(
                "/api/Position/closeContract",
                json!({ "accountId": account_id, "contractId": contract_id }),
            )
            .await?;

        let response: CloseResponse =
            serde_json::from_value(body).context("failed to decode close response")?;

        debug!(contract_id, success = response.success, "close request completed");
        Ok(response)
    }

    #[instrument(skip(self), name = "gateway::get_current_price")]
    async fn get_current_price(&self, symbol: &str) -> Result<f64> {
        let body = self
            .post_json("/api/MarketData/lastPrice", json!({ "symbol": symbol }))
            .await?;

        let price = body["price"]
            .as_f64()
            .context("last price response missing 'price'")?;

        debug!(symbol, price, "last price retrieved");
        Ok(price)
    }
}

impl std::fmt::Debug for GatewayClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayClient")
            .field("base_url", &self.base_url)
            .field("username", &self.username)
            .field("api_key", &"<redacted>")
            .field("token", &"<redacted>")
            .finish()
    }
}
