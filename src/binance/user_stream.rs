// =============================================================================
// User Data Stream — account-scoped events over a single authenticated socket
// =============================================================================
//
// Maintains exactly one connection to the Binance user-data stream:
//   1. Create a listen key over REST.
//   2. Connect `wss://.../ws/<listenKey>` and decode inbound frames.
//   3. Renew the listen key on a fixed keepalive interval.
//   4. On socket error, keepalive failure, or stream end: reconnect with
//      bounded exponential backoff. The loop never terminates the process.
//
// Decoded events fan out on a broadcast channel. Execution reports feed the
// durable store, so a lagging subscriber is logged loudly - drop-oldest is
// the channel's back-pressure policy and losing reports here is a last
// resort, recoverable only through exchange-side reconciliation.
// =============================================================================

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::StreamExt;
use parking_lot::RwLock;
use tokio::sync::broadcast;
use tokio_tungstenite::connect_async;
use tracing::{debug, error, info, warn};

use crate::binance::client::BinanceClient;
use crate::types::{BalanceInfo, OrderSide, OrderStatus};

/// Broadcast capacity for decoded user-stream events.
const EVENT_CHANNEL_CAPACITY: usize = 1024;

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// An immutable, exchange-delivered fact about an order's fill progress.
///
/// The raw payload is retained verbatim so the store can persist it
/// independently of whether a matching trade exists.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionReport {
    /// Exchange event time in milliseconds.
    pub event_time: i64,
    pub symbol: String,
    pub order_id: u64,
    pub client_order_id: String,
    pub side: OrderSide,
    pub status: OrderStatus,
    /// Quantity filled by this report's execution.
    pub last_fill_qty: f64,
    /// Price of this report's execution.
    pub last_fill_price: f64,
    /// Cumulative filled quantity for the order.
    pub cumulative_qty: f64,
    /// Cumulative quote volume for the order.
    pub cumulative_quote: f64,
    /// The frame exactly as received.
    pub raw: String,
}

/// Decoded user-stream event.
#[derive(Debug, Clone)]
pub enum UserStreamEvent {
    ExecutionReport(ExecutionReport),
    BalanceUpdate(Vec<BalanceInfo>),
}

// ---------------------------------------------------------------------------
// Stream
// ---------------------------------------------------------------------------

/// The single authenticated account event stream.
pub struct UserDataStream {
    client: Arc<BinanceClient>,
    ws_base_url: String,
    keepalive_secs: u64,
    base_backoff: Duration,
    max_backoff: Duration,
    tx: broadcast::Sender<UserStreamEvent>,
    connected: RwLock<bool>,
    last_event: RwLock<Instant>,
}

impl UserDataStream {
    pub fn new(
        client: Arc<BinanceClient>,
        ws_base_url: impl Into<String>,
        keepalive_secs: u64,
        base_backoff: Duration,
        max_backoff: Duration,
    ) -> Self {
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            client,
            ws_base_url: ws_base_url.into(),
            keepalive_secs,
            base_backoff,
            max_backoff,
            tx,
            connected: RwLock::new(false),
            last_event: RwLock::new(Instant::now()),
        }
    }

    /// Obtain a dedicated receiver. Multiple subscribers may coexist.
    pub fn subscribe(&self) -> broadcast::Receiver<UserStreamEvent> {
        self.tx.subscribe()
    }

    /// Observable health: is the socket currently up?
    pub fn is_connected(&self) -> bool {
        *self.connected.read()
    }

    /// Observable health: time since the last decoded event.
    pub fn last_event_age(&self) -> Duration {
        self.last_event.read().elapsed()
    }

    /// Run the stream forever. Spawn once at startup:
    ///
    ///   tokio::spawn(user_stream.clone().run());
    pub async fn run(self: Arc<Self>) {
        let mut backoff = self.base_backoff;

        loop {
            let listen_key = match self.client.create_listen_key().await {
                Ok(key) => key,
                Err(e) => {
                    warn!(error = %e, delay = ?backoff, "failed to create listen key - retrying");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(self.max_backoff);
                    continue;
                }
            };

            match self.run_connection(&listen_key).await {
                Ok(()) => {
                    warn!("user-data stream ended - reconnecting");
                }
                Err(e) => {
                    warn!(error = %e, delay = ?backoff, "user-data stream failed - reconnecting");
                }
            }

            *self.connected.write() = false;
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(self.max_backoff);
        }
    }

    /// Serve a single connection until it fails or the stream ends cleanly.
    async fn run_connection(&self, listen_key: &str) -> anyhow::Result<()> {
        let url = format!("{}/ws/{}", self.ws_base_url, listen_key);
        info!("connecting to user-data stream");

        let (ws_stream, _response) = connect_async(&url).await?;
        info!("user-data stream connected");

        *self.connected.write() = true;
        let (_write, mut read) = ws_stream.split();

        let mut keepalive = tokio::time::interval(Duration::from_secs(self.keepalive_secs));
        // The first tick fires immediately; renewing right after connect is
        // harmless and keeps the loop simple.

        loop {
            tokio::select! {
                msg = read.next() => {
                    match msg {
                        Some(Ok(tokio_tungstenite::tungstenite::Message::Text(text))) => {
                            *self.last_event.write() = Instant::now();
                            if let Some(event) = parse_event(&text) {
                                self.deliver(event);
                            }
                        }
                        Some(Ok(_)) => {
                            // Ping/pong handled by tungstenite; ignore the rest.
                        }
                        Some(Err(e)) => {
                            error!(error = %e, "user-data stream read error");
                            return Err(e.into());
                        }
                        None => {
                            warn!("user-data stream closed by server");
                            return Ok(());
                        }
                    }
                }
                _ = keepalive.tick() => {
                    if let Err(e) = self.client.keepalive_listen_key(listen_key).await {
                        warn!(error = %e, "listen key keepalive failed - reconnecting");
                        return Err(anyhow::anyhow!("listen key keepalive failed: {e}"));
                    }
                    debug!("listen key keepalive sent");
                }
            }
        }
    }

    /// Fan out a decoded event without ever blocking the read loop.
    fn deliver(&self, event: UserStreamEvent) {
        // broadcast::send only fails when no subscriber exists, which is
        // normal before the trade service attaches.
        let _ = self.tx.send(event);
    }
}

impl std::fmt::Debug for UserDataStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UserDataStream")
            .field("connected", &self.is_connected())
            .field("keepalive_secs", &self.keepalive_secs)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Frame decoding
// ---------------------------------------------------------------------------

/// Decode a user-stream frame into a typed event. Unknown event types are
/// ignored.
pub fn parse_event(text: &str) -> Option<UserStreamEvent> {
    let root: serde_json::Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(e) => {
            warn!(error = %e, "failed to parse user-stream frame");
            return None;
        }
    };

    match root["e"].as_str() {
        Some("executionReport") => {
            parse_execution_report(text).map(UserStreamEvent::ExecutionReport)
        }
        Some("outboundAccountPosition") => {
            let balances = root["B"]
                .as_array()?
                .iter()
                .filter_map(|b| {
                    Some(BalanceInfo {
                        asset: b["a"].as_str()?.to_string(),
                        free: b["f"].as_str()?.parse().ok()?,
                        locked: b["l"].as_str()?.parse().ok()?,
                    })
                })
                .collect();
            Some(UserStreamEvent::BalanceUpdate(balances))
        }
        _ => None,
    }
}

/// Decode an `executionReport` payload. Also used during recovery to replay
/// persisted raw reports.
///
/// Field mapping (Binance spot):
///   E event time, s symbol, i order id, c client order id, S side,
///   X order status, l last fill qty, L last fill price,
///   z cumulative filled qty, Z cumulative quote volume.
pub fn parse_execution_report(payload: &str) -> Option<ExecutionReport> {
    let root: serde_json::Value = serde_json::from_str(payload).ok()?;

    if root["e"].as_str() != Some("executionReport") {
        return None;
    }

    let status_str = root["X"].as_str()?;
    let status = match OrderStatus::from_exchange(status_str) {
        Some(s) => s,
        None => {
            warn!(status = status_str, "unknown order status in execution report");
            return None;
        }
    };

    Some(ExecutionReport {
        event_time: root["E"].as_i64()?,
        symbol: root["s"].as_str()?.to_string(),
        order_id: root["i"].as_u64()?,
        client_order_id: root["c"].as_str().unwrap_or_default().to_string(),
        side: OrderSide::from_exchange(root["S"].as_str()?)?,
        status,
        last_fill_qty: parse_str_f64(&root["l"])?,
        last_fill_price: parse_str_f64(&root["L"])?,
        cumulative_qty: parse_str_f64(&root["z"])?,
        cumulative_quote: parse_str_f64(&root["Z"])?,
        raw: payload.to_string(),
    })
}

/// Parse a JSON value that may be either a string or a number into `f64`.
fn parse_str_f64(val: &serde_json::Value) -> Option<f64> {
    if let Some(s) = val.as_str() {
        s.parse().ok()
    } else {
        val.as_f64()
    }
}

// =============================================================================
// Tests
// =============================================================================
