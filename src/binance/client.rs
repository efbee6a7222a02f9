// =============================================================================
// Binance REST API Client — HMAC-SHA256 signed requests
// =============================================================================
//
// SECURITY: The secret key is never logged or serialized. All signed requests
// include X-MBX-APIKEY as a header and a recvWindow of 5 000 ms to tolerate
// minor clock drift between the engine and Binance servers.
//
// Every request carries a bounded timeout; exceeding it (or any other
// transport failure) surfaces as `ExchangeUnreachable`, while a non-success
// HTTP status surfaces as `ExchangeRejected`. No request is retried here.
// =============================================================================

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use reqwest::header::{HeaderMap, HeaderValue};
use sha2::Sha256;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, instrument};

use crate::errors::TradeError;
use crate::trade::gateway::{NewOrder, OrderAck, OrderGateway, OrderKind};
use crate::types::OrderStatus;

type HmacSha256 = Hmac<Sha256>;

/// Default recv-window sent with every signed request (milliseconds).
const RECV_WINDOW: u64 = 5000;

/// Request timeout; a request exceeding it maps to `ExchangeUnreachable`.
const REQUEST_TIMEOUT_SECS: u64 = 10;

/// Binance error code for "Unknown order sent" - the order is already gone.
const ERR_UNKNOWN_ORDER: i64 = -2011;

/// Binance REST API client with HMAC-SHA256 request signing.
#[derive(Clone)]
pub struct BinanceClient {
    api_key: String,
    secret: String,
    base_url: String,
    client: reqwest::Client,
}

impl BinanceClient {
    // -------------------------------------------------------------------------
    // Construction
    // -------------------------------------------------------------------------

    /// Create a new `BinanceClient`.
    ///
    /// # Arguments
    /// * `api_key`  — Binance API key (sent as a header, never in query params).
    /// * `secret`   — Binance secret key used exclusively for HMAC signing.
    /// * `base_url` — REST base, e.g. "https://api.binance.com".
    pub fn new(
        api_key: impl Into<String>,
        secret: impl Into<String>,
        base_url: impl Into<String>,
    ) -> Self {
        let api_key = api_key.into();
        let secret = secret.into();
        let base_url = base_url.into();

        let mut default_headers = HeaderMap::new();
        // The API key header is required for all signed endpoints.
        if let Ok(val) = HeaderValue::from_str(&api_key) {
            default_headers.insert("X-MBX-APIKEY", val);
        }

        let client = reqwest::Client::builder()
            .default_headers(default_headers)
            .timeout(std::time::Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .expect("failed to build reqwest client");

        debug!(base_url = %base_url, "BinanceClient initialised");

        Self {
            api_key,
            secret,
            base_url,
            client,
        }
    }

    // -------------------------------------------------------------------------
    // Signing helpers
    // -------------------------------------------------------------------------

    /// Produce an HMAC-SHA256 hex signature of `query`.
    pub fn sign(&self, query: &str) -> String {
        let mut mac =
            HmacSha256::new_from_slice(self.secret.as_bytes()).expect("HMAC accepts any key size");
        mac.update(query.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// Current UNIX timestamp in milliseconds.
    pub fn timestamp_ms() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before UNIX epoch")
            .as_millis() as u64
    }

    /// Build the full query string for a signed request (appends timestamp,
    /// recvWindow, and signature).
    fn signed_query(&self, params: &str) -> String {
        let ts = Self::timestamp_ms();
        let base = if params.is_empty() {
            format!("timestamp={ts}&recvWindow={RECV_WINDOW}")
        } else {
            format!("{params}&timestamp={ts}&recvWindow={RECV_WINDOW}")
        };
        let sig = self.sign(&base);
        format!("{base}&signature={sig}")
    }

    /// Turn a response into parsed JSON, mapping non-success statuses to
    /// `ExchangeRejected` and transport/parse failures to
    /// `ExchangeUnreachable`.
    async fn read_json(
        resp: reqwest::Response,
        what: &str,
    ) -> Result<serde_json::Value, TradeError> {
        let status = resp.status();
        let body = resp
            .text()
            .await
            .map_err(|e| TradeError::ExchangeUnreachable(format!("{what}: {e}")))?;

        let json: serde_json::Value = serde_json::from_str(&body).unwrap_or_default();

        if !status.is_success() {
            return Err(TradeError::ExchangeRejected(format!(
                "{what} returned {status}: {body}"
            )));
        }

        Ok(json)
    }

    fn transport_err(what: &str, e: reqwest::Error) -> TradeError {
        TradeError::ExchangeUnreachable(format!("{what}: {e}"))
    }

    // -------------------------------------------------------------------------
    // Time
    // -------------------------------------------------------------------------

    /// GET /api/v3/time (public) — exchange server time in milliseconds.
    #[instrument(skip(self), name = "binance::get_server_time")]
    pub async fn get_server_time(&self) -> Result<i64, TradeError> {
        let url = format!("{}/api/v3/time", self.base_url);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| Self::transport_err("GET /api/v3/time", e))?;

        let body = Self::read_json(resp, "GET /api/v3/time").await?;
        body["serverTime"].as_i64().ok_or_else(|| {
            TradeError::ExchangeUnreachable("time response missing serverTime".to_string())
        })
    }

    // -------------------------------------------------------------------------
    // Exchange info
    // -------------------------------------------------------------------------

    /// GET /api/v3/exchangeInfo (public) — full symbol/filter listing.
    #[instrument(skip(self), name = "binance::get_exchange_info")]
    pub async fn get_exchange_info(&self) -> Result<serde_json::Value, TradeError> {
        let url = format!("{}/api/v3/exchangeInfo", self.base_url);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| Self::transport_err("GET /api/v3/exchangeInfo", e))?;

        Self::read_json(resp, "GET /api/v3/exchangeInfo").await
    }

    // -------------------------------------------------------------------------
    // User data stream listen key
    // -------------------------------------------------------------------------

    /// POST /api/v3/userDataStream — obtain a listen key for the account
    /// stream. Authenticated by the API key header alone (no signature).
    #[instrument(skip(self), name = "binance::create_listen_key")]
    pub async fn create_listen_key(&self) -> Result<String, TradeError> {
        let url = format!("{}/api/v3/userDataStream", self.base_url);
        let resp = self
            .client
            .post(&url)
            .send()
            .await
            .map_err(|e| Self::transport_err("POST /api/v3/userDataStream", e))?;

        let body = Self::read_json(resp, "POST /api/v3/userDataStream").await?;
        body["listenKey"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| {
                TradeError::ExchangeUnreachable("response missing listenKey".to_string())
            })
    }

    /// PUT /api/v3/userDataStream — keep an existing listen key alive.
    #[instrument(skip(self, listen_key), name = "binance::keepalive_listen_key")]
    pub async fn keepalive_listen_key(&self, listen_key: &str) -> Result<(), TradeError> {
        let url = format!(
            "{}/api/v3/userDataStream?listenKey={}",
            self.base_url, listen_key
        );
        let resp = self
            .client
            .put(&url)
            .send()
            .await
            .map_err(|e| Self::transport_err("PUT /api/v3/userDataStream", e))?;

        Self::read_json(resp, "PUT /api/v3/userDataStream").await?;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Orders
    // -------------------------------------------------------------------------

    /// POST /api/v3/order (signed) — submit a new order.
    #[instrument(skip(self, order), name = "binance::place_order")]
    pub async fn place_order(&self, order: &NewOrder) -> Result<serde_json::Value, TradeError> {
        let mut params = format!(
            "symbol={}&side={}&type={}&quantity={}",
            order.symbol,
            order.side.as_str(),
            order.kind.as_str(),
            order.quantity
        );

        if let Some(p) = order.price {
            params.push_str(&format!("&price={p}"));
        }
        if order.kind == OrderKind::Limit {
            params.push_str("&timeInForce=GTC");
        }
        params.push_str(&format!("&newClientOrderId={}", order.client_order_id));

        let qs = self.signed_query(&params);
        let url = format!("{}/api/v3/order?{}", self.base_url, qs);

        debug!(
            symbol = %order.symbol,
            side = %order.side,
            kind = order.kind.as_str(),
            quantity = order.quantity,
            "placing order"
        );

        let resp = self
            .client
            .post(&url)
            .send()
            .await
            .map_err(|e| Self::transport_err("POST /api/v3/order", e))?;

        let body = Self::read_json(resp, "POST /api/v3/order").await?;
        debug!(symbol = %order.symbol, side = %order.side, "order placed");
        Ok(body)
    }

    /// DELETE /api/v3/order (signed) — cancel an existing order.
    ///
    /// A cancel rejected with "Unknown order sent" is treated as success: the
    /// order is already gone, which is all the caller needs.
    #[instrument(skip(self), name = "binance::cancel_order")]
    pub async fn cancel_order_by_id(&self, symbol: &str, order_id: u64) -> Result<(), TradeError> {
        let params = format!("symbol={symbol}&orderId={order_id}");
        let qs = self.signed_query(&params);
        let url = format!("{}/api/v3/order?{}", self.base_url, qs);

        debug!(symbol, order_id, "cancelling order");

        let resp = self
            .client
            .delete(&url)
            .send()
            .await
            .map_err(|e| Self::transport_err("DELETE /api/v3/order", e))?;

        match Self::read_json(resp, "DELETE /api/v3/order").await {
            Ok(_) => {
                debug!(symbol, order_id, "order cancelled");
                Ok(())
            }
            Err(TradeError::ExchangeRejected(msg))
                if msg.contains(&format!("\"code\":{ERR_UNKNOWN_ORDER}")) =>
            {
                debug!(symbol, order_id, "order already gone - cancel treated as success");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

// ---------------------------------------------------------------------------
// OrderGateway implementation
// ---------------------------------------------------------------------------

#[async_trait]
impl OrderGateway for BinanceClient {
    async fn submit_order(&self, order: &NewOrder) -> Result<OrderAck, TradeError> {
        let body = self.place_order(order).await?;

        let order_id = body["orderId"].as_u64().ok_or_else(|| {
            TradeError::ExchangeUnreachable("order response missing orderId".to_string())
        })?;

        let status = body["status"]
            .as_str()
            .and_then(OrderStatus::from_exchange)
            .unwrap_or(OrderStatus::New);

        Ok(OrderAck {
            order_id,
            client_order_id: body["clientOrderId"]
                .as_str()
                .unwrap_or(&order.client_order_id)
                .to_string(),
            status,
        })
    }

    async fn cancel_order(&self, symbol: &str, order_id: u64) -> Result<(), TradeError> {
        self.cancel_order_by_id(symbol, order_id).await
    }
}

impl std::fmt::Debug for BinanceClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BinanceClient")
            .field("api_key", &"<redacted>")
            .field("secret", &"<redacted>")
            .field("base_url", &self.base_url)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_is_deterministic_hex() {
        let client = BinanceClient::new("key", "secret", "https://api.binance.com");
        let sig = client.sign("symbol=BTCUSDT&side=BUY");
        assert_eq!(sig, client.sign("symbol=BTCUSDT&side=BUY"));
        assert_eq!(sig.len(), 64);
        assert!(sig.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn debug_redacts_credentials() {
        let client = BinanceClient::new("my-key", "my-secret", "https://api.binance.com");
        let rendered = format!("{client:?}");
        assert!(!rendered.contains("my-key"));
        assert!(!rendered.contains("my-secret"));
    }
}
