// =============================================================================
// Order Gateway — the order-entry seam between the trade service and the
// exchange
// =============================================================================
//
// The trade service never talks HTTP directly; it submits and cancels orders
// through this trait. `BinanceClient` is the production implementation; tests
// drive the service with a scripted mock.
// =============================================================================

use async_trait::async_trait;

use crate::errors::TradeError;
use crate::types::{OrderSide, OrderStatus};

/// Order type supported by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderKind {
    Limit,
    Market,
}

impl OrderKind {
    /// Wire representation expected by the exchange.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Limit => "LIMIT",
            Self::Market => "MARKET",
        }
    }
}

/// A new order to submit to the exchange.
#[derive(Debug, Clone)]
pub struct NewOrder {
    pub symbol: String,
    pub side: OrderSide,
    pub kind: OrderKind,
    pub quantity: f64,
    /// Required for limit orders, `None` for market orders.
    pub price: Option<f64>,
    pub client_order_id: String,
}

/// Acknowledgement returned by the exchange on order acceptance. Fill
/// progress arrives separately through the user-data stream.
#[derive(Debug, Clone)]
pub struct OrderAck {
    pub order_id: u64,
    pub client_order_id: String,
    pub status: OrderStatus,
}

/// Order entry/cancel operations against the exchange.
///
/// A cancel for an order that is already gone must be reported as success so
/// that exit-order replacement can proceed.
#[async_trait]
pub trait OrderGateway: Send + Sync {
    async fn submit_order(&self, order: &NewOrder) -> Result<OrderAck, TradeError>;

    async fn cancel_order(&self, symbol: &str, order_id: u64) -> Result<(), TradeError>;
}
