// =============================================================================
// Trade Stream Manager — per-symbol live price ticks
// =============================================================================
//
// One aggTrade subscription per symbol of interest. Subscriptions are
// refcounted: the socket task starts with the first subscriber and stops when
// the last one releases. Each symbol reconnects independently on failure.
//
// Ticks are ephemeral - consumed for exit evaluation, never persisted.
// =============================================================================

use std::collections::HashMap;

use futures_util::StreamExt;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tracing::{error, info, warn};

/// Broadcast capacity per symbol feed.
const TICK_CHANNEL_CAPACITY: usize = 256;

/// Delay before reconnecting a failed symbol stream.
const RECONNECT_DELAY_SECS: u64 = 5;

/// A single live trade tick.
#[derive(Debug, Clone, PartialEq)]
pub struct PriceTick {
    pub symbol: String,
    pub price: f64,
    /// Exchange event time in milliseconds.
    pub event_time: i64,
}

struct SymbolFeed {
    tx: broadcast::Sender<PriceTick>,
    subscribers: usize,
    task: JoinHandle<()>,
}

/// Owns one socket task per subscribed symbol and fans ticks out to
/// subscribers via per-symbol broadcast channels.
pub struct TradeStreamManager {
    ws_base_url: String,
    feeds: Mutex<HashMap<String, SymbolFeed>>,
}

impl TradeStreamManager {
    pub fn new(ws_base_url: impl Into<String>) -> Self {
        Self {
            ws_base_url: ws_base_url.into(),
            feeds: Mutex::new(HashMap::new()),
        }
    }

    /// Subscribe to `symbol`, starting its socket task if this is the first
    /// subscriber.
    pub fn subscribe(&self, symbol: &str) -> broadcast::Receiver<PriceTick> {
        let mut feeds = self.feeds.lock();

        if let Some(feed) = feeds.get_mut(symbol) {
            feed.subscribers += 1;
            return feed.tx.subscribe();
        }

        let (tx, rx) = broadcast::channel(TICK_CHANNEL_CAPACITY);
        let task = spawn_symbol_stream(&self.ws_base_url, symbol, tx.clone());

        info!(symbol, "trade stream subscription started");
        feeds.insert(
            symbol.to_string(),
            SymbolFeed {
                tx,
                subscribers: 1,
                task,
            },
        );
        rx
    }

    /// Release one subscription on `symbol`; the socket task stops when the
    /// count reaches zero.
    pub fn release(&self, symbol: &str) {
        let mut feeds = self.feeds.lock();
        let remove = match feeds.get_mut(symbol) {
            Some(feed) => {
                feed.subscribers = feed.subscribers.saturating_sub(1);
                feed.subscribers == 0
            }
            None => false,
        };

        if remove {
            if let Some(feed) = feeds.remove(symbol) {
                feed.task.abort();
                info!(symbol, "trade stream subscription stopped");
            }
        }
    }

    /// Symbols with a live subscription, for health reporting.
    pub fn active_symbols(&self) -> Vec<String> {
        self.feeds.lock().keys().cloned().collect()
    }
}

impl std::fmt::Debug for TradeStreamManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TradeStreamManager")
            .field("active_symbols", &self.active_symbols())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Socket task
// ---------------------------------------------------------------------------

/// Spawn the reconnecting socket loop for one symbol.
fn spawn_symbol_stream(
    ws_base_url: &str,
    symbol: &str,
    tx: broadcast::Sender<PriceTick>,
) -> JoinHandle<()> {
    let base = ws_base_url.to_string();
    let sym = symbol.to_string();

    tokio::spawn(async move {
        loop {
            if let Err(e) = run_symbol_stream(&base, &sym, &tx).await {
                error!(symbol = %sym, error = %e, "trade stream error - reconnecting");
            }
            tokio::time::sleep(std::time::Duration::from_secs(RECONNECT_DELAY_SECS)).await;
        }
    })
}

/// Connect to the aggTrade stream for a single symbol and fan ticks out.
///
/// Runs until the stream disconnects or an error occurs, then returns so the
/// outer loop can reconnect.
async fn run_symbol_stream(
    ws_base_url: &str,
    symbol: &str,
    tx: &broadcast::Sender<PriceTick>,
) -> anyhow::Result<()> {
    let lower = symbol.to_lowercase();
    let url = format!("{ws_base_url}/ws/{lower}@aggTrade");
    info!(symbol = %symbol, "connecting to trade stream");

    let (ws_stream, _response) = connect_async(&url).await?;
    info!(symbol = %symbol, "trade stream connected");
    let (_write, mut read) = ws_stream.split();

    loop {
        match read.next().await {
            Some(Ok(msg)) => {
                if let tokio_tungstenite::tungstenite::Message::Text(text) = msg {
                    match parse_agg_trade(symbol, &text) {
                        Some(tick) => {
                            // No subscribers is transient; keep reading.
                            let _ = tx.send(tick);
                        }
                        None => {
                            warn!(symbol = %symbol, "failed to parse aggTrade message");
                        }
                    }
                }
            }
            Some(Err(e)) => {
                error!(symbol = %symbol, error = %e, "trade stream read error");
                return Err(e.into());
            }
            None => {
                warn!(symbol = %symbol, "trade stream ended");
                return Ok(());
            }
        }
    }
}

/// Parse a Binance aggTrade message.
///
/// Expected shape:
/// ```json
/// { "e": "aggTrade", "E": 1700000000123, "s": "BTCUSDT", "p": "37000.00", "q": "0.123", "m": true }
/// ```
fn parse_agg_trade(symbol: &str, text: &str) -> Option<PriceTick> {
    let root: serde_json::Value = serde_json::from_str(text).ok()?;

    let price: f64 = root["p"].as_str()?.parse().ok()?;
    let event_time = root["E"].as_i64().unwrap_or(0);

    Some(PriceTick {
        symbol: root["s"].as_str().unwrap_or(symbol).to_string(),
        price,
        event_time,
    })
}

// =============================================================================
// Tests
// =============================================================================
