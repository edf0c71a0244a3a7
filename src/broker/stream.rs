// =============================================================================
// Realtime user-event feed — gateway WebSocket to dispatcher channel
// =============================================================================
//
// The transport owns the socket on its own task and hands normalized events
// to the dispatcher over a bounded FIFO. Everything except quote ticks is
// delivered with back-pressure; quote ticks are dropped when the queue is
// full because no rule ever consults them.
//
// Stream loss is fatal by policy: the transport emits `StreamClosed` and the
// dispatcher exits non-zero so the operator knows protection has lapsed.
// =============================================================================

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

use crate::audit::AuditLog;
use crate::events::{self, Event, EventPayload};

/// Messages handed from the transport task to the dispatcher.
#[derive(Debug)]
pub enum Inbound {
    Event(Event),
    /// The realtime subscription ended (error or remote close).
    StreamClosed(String),
}

pub struct UserEventStream {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    subscribed_account: Option<i64>,
}

impl UserEventStream {
    /// Connect the realtime feed; the session token authenticates the
    /// upgrade request.
    pub async fn connect(ws_url: &str, token: &str) -> Result<Self> {
        let url = format!("{ws_url}?access_token={token}");
        let (ws, _) = connect_async(&url)
            .await
            .context("realtime feed connection failed")?;

        info!(url = %ws_url, "realtime feed connected");
        Ok(Self {
            ws,
            subscribed_account: None,
        })
    }

    /// Subscribe to account-scoped user updates (fills, positions, P&L,
    /// quotes).
    pub async fn subscribe_user_updates(&mut self, account_id: i64) -> Result<()> {
        let frame = json!({ "action": "subscribe", "channel": "user", "accountId": account_id });
        self.ws
            .send(Message::Text(frame.to_string()))
            .await
            .context("subscribe frame send failed")?;
        self.subscribed_account = Some(account_id);
        info!(account_id, "subscribed to user updates");
        Ok(())
    }

    async fn unsubscribe_user_updates(&mut self) -> Result<()> {
        let Some(account_id) = self.subscribed_account.take() else {
            return Ok(());
        };
        let frame = json!({ "action": "unsubscribe", "channel": "user", "accountId": account_id });
        self.ws
            .send(Message::Text(frame.to_string()))
            .await
            .context("unsubscribe frame send failed")?;
        info!(account_id, "unsubscribed from user updates");
        Ok(())
    }

    /// Close the socket without subscribing (used by `validate`).
    pub async fn close(mut self) -> Result<()> {
        self.ws.close(None).await.context("feed close failed")?;
        info!("realtime feed closed");
        Ok(())
    }

    /// Pump wire frames into the dispatcher channel until the stream ends or
    /// `shutdown` flips. On shutdown the feed unsubscribes and disconnects
    /// cleanly; on stream loss it reports `StreamClosed`.
    pub async fn run(
        mut self,
        tx: mpsc::Sender<Inbound>,
        audit: Arc<AuditLog>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        audit.info("Realtime event stream connected.");

        let reason = loop {
            tokio::select! {
                frame = self.ws.next() => match frame {
                    Some(Ok(Message::Text(text))) => {
                        if let Some(event) = parse_frame(&text) {
                            if !forward(&tx, event).await {
                                break "dispatcher channel closed".to_string();
                            }
                        }
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        if let Err(e) = self.ws.send(Message::Pong(payload)).await {
                            break format!("pong send failed: {e}");
                        }
                    }
                    Some(Ok(Message::Close(_))) => break "remote close".to_string(),
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => break format!("read error: {e}"),
                    None => break "stream ended".to_string(),
                },
                changed = shutdown.changed() => {
                    // A dropped sender counts as a shutdown request.
                    if changed.is_err() || *shutdown.borrow() {
                        if let Err(e) = self.unsubscribe_user_updates().await {
                            warn!(error = %e, "unsubscribe on shutdown failed");
                        }
                        if let Err(e) = self.ws.close(None).await {
                            warn!(error = %e, "feed close on shutdown failed");
                        }
                        audit.info("Realtime event stream disconnected.");
                        return;
                    }
                }
            }
        };

        error!(reason = %reason, "realtime feed lost");
        audit.warning(format!("Realtime event stream disconnected: {reason}."));
        let _ = tx.send(Inbound::StreamClosed(reason)).await;
    }
}

/// Deliver one event to the dispatcher. Quote ticks are dropped when the
/// queue is full; everything else back-pressures the transport. Returns
/// false when the receiver is gone.
async fn forward(tx: &mpsc::Sender<Inbound>, event: Event) -> bool {
    if matches!(event.payload, EventPayload::QuoteUpdate) {
        match tx.try_send(Inbound::Event(event)) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!("event queue full, quote tick dropped");
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    } else {
        tx.send(Inbound::Event(event)).await.is_ok()
    }
}

fn parse_frame(text: &str) -> Option<Event> {
    let value: Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(e) => {
            warn!(error = %e, "unparseable realtime frame");
            return None;
        }
    };

    let Some(event_type) = value["type"].as_str() else {
        warn!("realtime frame missing 'type'");
        return None;
    };

    let timestamp = frame_timestamp(&value);

    match events::parse_wire(event_type, &value["data"], timestamp) {
        Ok(event) => event,
        Err(e) => {
            warn!(event_type, error = %e, "malformed realtime frame skipped");
            None
        }
    }
}

fn frame_timestamp(value: &Value) -> DateTime<Utc> {
    value["timestamp"]
        .as_str()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(Utc::now)
}
