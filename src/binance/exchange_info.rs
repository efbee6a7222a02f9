// =============================================================================
// Exchange Info Cache — per-symbol trading constraints
// =============================================================================
//
// Periodically refreshed snapshot of the symbol filters that order parameters
// must respect: price tick size, quantity step size, and minimum notional.
// On refresh failure the previous snapshot is retained - a stale cache is
// preferred over a blocking one.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, error, info};

use crate::binance::client::BinanceClient;
use crate::errors::TradeError;

/// Trading constraints for a single symbol.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SymbolFilters {
    /// Price must be a multiple of this.
    pub tick_size: f64,
    /// Quantity must be a multiple of this.
    pub step_size: f64,
    /// quantity * price must be at least this.
    pub min_notional: f64,
}

/// Read-side lookup of per-symbol constraints with atomic snapshot
/// replacement.
pub struct ExchangeInfoService {
    client: Arc<BinanceClient>,
    filters: RwLock<HashMap<String, SymbolFilters>>,
}

impl ExchangeInfoService {
    pub fn new(client: Arc<BinanceClient>) -> Self {
        Self {
            client,
            filters: RwLock::new(HashMap::new()),
        }
    }

    // -------------------------------------------------------------------------
    // Refresh
    // -------------------------------------------------------------------------

    /// Fetch the current exchange info and replace the snapshot.
    pub async fn update(&self) -> Result<(), TradeError> {
        let body = self.client.get_exchange_info().await?;
        let snapshot = parse_filters(&body);
        let count = snapshot.len();
        self.apply_snapshot(snapshot);
        debug!(symbols = count, "exchange info snapshot refreshed");
        Ok(())
    }

    /// Replace the whole snapshot atomically.
    pub fn apply_snapshot(&self, snapshot: HashMap<String, SymbolFilters>) {
        *self.filters.write() = snapshot;
    }

    /// Run the refresh loop forever. Spawn once at startup.
    pub async fn run_refresh_loop(self: Arc<Self>, interval_secs: u64) {
        info!(interval_secs, "exchange info refresh loop started");
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(interval_secs));
        interval.tick().await; // The initial update happened at startup.

        loop {
            interval.tick().await;
            if let Err(e) = self.update().await {
                // Keep the previous snapshot; stale beats blocking.
                error!(error = %e, "exchange info refresh failed - keeping previous snapshot");
            }
        }
    }

    // -------------------------------------------------------------------------
    // Lookups
    // -------------------------------------------------------------------------

    /// Filters for `symbol`, or a validation error if the symbol is unknown.
    pub fn filters(&self, symbol: &str) -> Result<SymbolFilters, TradeError> {
        self.filters
            .read()
            .get(symbol)
            .copied()
            .ok_or_else(|| TradeError::Validation(format!("unknown symbol: {symbol}")))
    }

    /// Round `price` down to the symbol's tick size.
    pub fn round_price(&self, symbol: &str, price: f64) -> Result<f64, TradeError> {
        let f = self.filters(symbol)?;
        Ok(round_to_step(price, f.tick_size))
    }

    /// Round `qty` down to the symbol's step size.
    pub fn round_quantity(&self, symbol: &str, qty: f64) -> Result<f64, TradeError> {
        let f = self.filters(symbol)?;
        Ok(round_to_step(qty, f.step_size))
    }

    /// Whether `qty * price` satisfies the symbol's minimum notional.
    pub fn meets_min_notional(
        &self,
        symbol: &str,
        qty: f64,
        price: f64,
    ) -> Result<bool, TradeError> {
        let f = self.filters(symbol)?;
        Ok(qty * price >= f.min_notional)
    }
}

impl std::fmt::Debug for ExchangeInfoService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExchangeInfoService")
            .field("symbols", &self.filters.read().len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Parsing helpers
// ---------------------------------------------------------------------------

/// Round `value` down to a multiple of `step`. The epsilon is relative to the
/// quotient so that exact multiples survive at any magnitude (33000 / 0.01 is
/// 3299999.9999999995 in floats and must still round to 33000, not 32999.99).
fn round_to_step(value: f64, step: f64) -> f64 {
    if step <= 0.0 {
        return value;
    }
    let steps = value / step;
    (steps + steps.abs() * 1e-9 + 1e-9).floor() * step
}

/// Extract per-symbol filters from a full exchangeInfo response.
pub fn parse_filters(body: &serde_json::Value) -> HashMap<String, SymbolFilters> {
    let mut out = HashMap::new();

    let symbols = match body["symbols"].as_array() {
        Some(arr) => arr,
        None => return out,
    };

    for sym in symbols {
        let name = match sym["symbol"].as_str() {
            Some(s) => s.to_string(),
            None => continue,
        };

        let mut filters = SymbolFilters {
            tick_size: 0.0,
            step_size: 0.0,
            min_notional: 0.0,
        };

        if let Some(list) = sym["filters"].as_array() {
            for f in list {
                match f["filterType"].as_str() {
                    Some("PRICE_FILTER") => {
                        filters.tick_size = str_f64(&f["tickSize"]);
                    }
                    Some("LOT_SIZE") => {
                        filters.step_size = str_f64(&f["stepSize"]);
                    }
                    // Spot API renamed MIN_NOTIONAL to NOTIONAL; accept both.
                    Some("MIN_NOTIONAL") => {
                        filters.min_notional = str_f64(&f["minNotional"]);
                    }
                    Some("NOTIONAL") => {
                        filters.min_notional = str_f64(&f["minNotional"]);
                    }
                    _ => {}
                }
            }
        }

        out.insert(name, filters);
    }

    out
}

fn str_f64(val: &serde_json::Value) -> f64 {
    val.as_str()
        .and_then(|s| s.parse().ok())
        .or_else(|| val.as_f64())
        .unwrap_or(0.0)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn service_with_btc() -> ExchangeInfoService {
        let client = Arc::new(BinanceClient::new("", "", "https://api.binance.com"));
        let svc = ExchangeInfoService::new(client);
        let mut snapshot = HashMap::new();
        snapshot.insert(
            "BTCUSDT".to_string(),
            SymbolFilters {
                tick_size: 0.01,
                step_size: 0.00001,
                min_notional: 10.0,
            },
        );
        svc.apply_snapshot(snapshot);
        svc
    }

    #[test]
    fn rounds_price_down_to_tick() {
        let svc = service_with_btc();
        let rounded = svc.round_price("BTCUSDT", 30000.1234).unwrap();
        assert!((rounded - 30000.12).abs() < 1e-9);
    }

    #[test]
    fn rounds_quantity_down_to_step() {
        let svc = service_with_btc();
        let rounded = svc.round_quantity("BTCUSDT", 0.0123456).unwrap();
        assert!((rounded - 0.01234).abs() < 1e-12);
    }

    #[test]
    fn exact_multiples_survive_rounding() {
        let svc = service_with_btc();
        assert!((svc.round_price("BTCUSDT", 30000.12).unwrap() - 30000.12).abs() < 1e-9);
        assert!((svc.round_price("BTCUSDT", 33000.0).unwrap() - 33000.0).abs() < 1e-9);
        assert!((svc.round_quantity("BTCUSDT", 0.01).unwrap() - 0.01).abs() < 1e-12);
    }

    #[test]
    fn min_notional_check() {
        let svc = service_with_btc();
        assert!(svc.meets_min_notional("BTCUSDT", 0.001, 30000.0).unwrap());
        assert!(!svc.meets_min_notional("BTCUSDT", 0.0001, 30000.0).unwrap());
    }

    #[test]
    fn unknown_symbol_is_a_validation_error() {
        let svc = service_with_btc();
        assert!(matches!(
            svc.round_price("DOGEUSDT", 1.0),
            Err(TradeError::Validation(_))
        ));
    }

    #[test]
    fn parses_filters_from_exchange_info() {
        let body: serde_json::Value = serde_json::from_str(
            r#"{
                "symbols": [
                    {
                        "symbol": "BTCUSDT",
                        "filters": [
                            {"filterType": "PRICE_FILTER", "tickSize": "0.01000000"},
                            {"filterType": "LOT_SIZE", "stepSize": "0.00001000"},
                            {"filterType": "NOTIONAL", "minNotional": "10.00000000"}
                        ]
                    },
                    {
                        "symbol": "ETHBTC",
                        "filters": [
                            {"filterType": "PRICE_FILTER", "tickSize": "0.00000100"},
                            {"filterType": "LOT_SIZE", "stepSize": "0.00100000"},
                            {"filterType": "MIN_NOTIONAL", "minNotional": "0.00010000"}
                        ]
                    }
                ]
            }"#,
        )
        .unwrap();

        let filters = parse_filters(&body);
        assert_eq!(filters.len(), 2);

        let btc = filters["BTCUSDT"];
        assert!((btc.tick_size - 0.01).abs() < 1e-12);
        assert!((btc.step_size - 0.00001).abs() < 1e-12);
        assert!((btc.min_notional - 10.0).abs() < 1e-9);

        let eth = filters["ETHBTC"];
        assert!((eth.min_notional - 0.0001).abs() < 1e-12);
    }
}
