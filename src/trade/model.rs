// =============================================================================
// Trade model — the tracked position from buy to close/abandon/archive
// =============================================================================
//
// Life-cycle:
//   EntryPending -> Open        (entry order fully filled)
//   EntryPending -> Cancelled   (entry cancelled before full fill)
//   Open         -> ExitPending (exit order placed)
//   ExitPending  -> Closed      (exit order fully filled)
//   ExitPending  -> Open        (exit order cancelled exchange-side)
//   any non-terminal -> Abandoned
//   Closed/Abandoned -> archived flag set
//
// `Cancelled` and archived trades are immutable. At most one exit strategy is
// active at any instant; installing a new one cancels the previously placed
// pending exit order first.
// =============================================================================

use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::binance::user_stream::ExecutionReport;
use crate::types::{OrderSide, OrderStatus};

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Current life-cycle state of a trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TradeStatus {
    EntryPending,
    Open,
    ExitPending,
    Closed,
    Cancelled,
    Abandoned,
}

impl TradeStatus {
    /// Terminal states accept no further mutation (archiving excepted for
    /// `Closed` and `Abandoned`).
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed | Self::Cancelled | Self::Abandoned)
    }
}

impl std::fmt::Display for TradeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::EntryPending => "EntryPending",
            Self::Open => "Open",
            Self::ExitPending => "ExitPending",
            Self::Closed => "Closed",
            Self::Cancelled => "Cancelled",
            Self::Abandoned => "Abandoned",
        };
        write!(f, "{s}")
    }
}

// ---------------------------------------------------------------------------
// Exit strategies
// ---------------------------------------------------------------------------

/// Stop-loss trigger as given by the caller.
#[derive(Debug, Clone, Copy)]
pub enum StopLossSpec {
    /// Absolute trigger price.
    Price(f64),
    /// Percent below the entry's average fill price.
    PercentBelowEntry(f64),
}

/// The single active exit strategy of a trade. Mutually exclusive by
/// construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExitStrategy {
    None,
    StopLoss {
        trigger_price: f64,
    },
    TrailingProfit {
        /// Percent above entry at which trailing arms.
        activation_pct: f64,
        /// Retracement percent from the high water that triggers the exit.
        trailing_pct: f64,
        #[serde(default)]
        activated: bool,
        /// Highest price observed since activation. Non-decreasing.
        #[serde(default)]
        high_water: f64,
    },
    LimitSell {
        limit_price: f64,
    },
    MarketSell,
}

impl Default for ExitStrategy {
    fn default() -> Self {
        Self::None
    }
}

impl ExitStrategy {
    pub fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }
}

// ---------------------------------------------------------------------------
// Order reference
// ---------------------------------------------------------------------------

/// Reference to an exchange order with its fill state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRef {
    pub order_id: u64,
    pub client_order_id: String,
    pub side: OrderSide,
    /// Requested quantity.
    pub quantity: f64,
    /// Requested price for limit orders.
    pub price: Option<f64>,
    #[serde(default)]
    pub filled_qty: f64,
    /// Cumulative quote volume filled; drives the average fill price.
    #[serde(default)]
    pub cumulative_quote: f64,
    #[serde(default)]
    pub avg_fill_price: f64,
    pub status: OrderStatus,
}

impl OrderRef {
    /// Whether `report` carries newer fill state than this reference.
    ///
    /// A report is newer when its cumulative fill quantity grows, or stays
    /// equal while the order status advances. Anything else is a redelivery.
    pub fn is_newer(&self, report: &ExecutionReport) -> bool {
        if report.cumulative_qty > self.filled_qty {
            return true;
        }
        report.cumulative_qty == self.filled_qty && report.status.rank() > self.status.rank()
    }

    /// Apply an execution report. Returns `false` (leaving the reference
    /// untouched) when the report is not newer than the recorded state.
    pub fn apply_report(&mut self, report: &ExecutionReport) -> bool {
        if !self.is_newer(report) {
            return false;
        }

        self.filled_qty = report.cumulative_qty;
        self.cumulative_quote = report.cumulative_quote;
        self.status = report.status;
        if self.filled_qty > 0.0 {
            self.avg_fill_price = self.cumulative_quote / self.filled_qty;
        }
        true
    }
}

// ---------------------------------------------------------------------------
// Trade
// ---------------------------------------------------------------------------

/// One tracked position. Mutated exclusively through the trade service's
/// single-writer path; serialized verbatim into the store on every commit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    /// Process-unique identifier, stable across restarts.
    pub id: String,
    pub symbol: String,
    pub status: TradeStatus,
    /// The entry (buy) order.
    pub entry: OrderRef,
    #[serde(default)]
    pub exit_strategy: ExitStrategy,
    /// The currently placed exit order, if any.
    #[serde(default)]
    pub exit_order: Option<OrderRef>,
    /// Removed from active dashboards, retained for history.
    #[serde(default)]
    pub archived: bool,
    /// Event time (ms) of the last applied execution report. Used as the
    /// replay marker during recovery.
    #[serde(default)]
    pub last_report_time: i64,
    pub created_at: String,
    pub updated_at: String,
}

impl Trade {
    /// Create a new trade in `EntryPending` for a just-accepted buy order.
    pub fn new(symbol: impl Into<String>, entry: OrderRef) -> Self {
        let now = Utc::now().to_rfc3339();
        Self {
            id: Uuid::new_v4().to_string(),
            symbol: symbol.into(),
            status: TradeStatus::EntryPending,
            entry,
            exit_strategy: ExitStrategy::None,
            exit_order: None,
            archived: false,
            last_report_time: 0,
            created_at: now.clone(),
            updated_at: now,
        }
    }

    /// Average fill price of the entry order.
    pub fn entry_avg_price(&self) -> f64 {
        self.entry.avg_fill_price
    }

    /// Whether any mutation is still accepted.
    pub fn is_mutable(&self) -> bool {
        !self.status.is_terminal() && !self.archived
    }

    /// Whether this trade needs live price ticks for exit evaluation.
    pub fn needs_price_feed(&self) -> bool {
        matches!(self.status, TradeStatus::Open | TradeStatus::ExitPending)
    }

    /// Refresh the last-updated timestamp.
    pub fn touch(&mut self) {
        self.updated_at = Utc::now().to_rfc3339();
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn report(order_id: u64, cumulative_qty: f64, cumulative_quote: f64, status: OrderStatus) -> ExecutionReport {
        ExecutionReport {
            event_time: 1_700_000_000_000,
            symbol: "BTCUSDT".to_string(),
            order_id,
            client_order_id: "c1".to_string(),
            side: OrderSide::Buy,
            status,
            last_fill_qty: 0.0,
            last_fill_price: 0.0,
            cumulative_qty,
            cumulative_quote,
            raw: "{}".to_string(),
        }
    }

    fn entry_ref() -> OrderRef {
        OrderRef {
            order_id: 42,
            client_order_id: "c1".to_string(),
            side: OrderSide::Buy,
            quantity: 0.01,
            price: Some(30000.0),
            filled_qty: 0.0,
            cumulative_quote: 0.0,
            avg_fill_price: 0.0,
            status: OrderStatus::New,
        }
    }

    #[test]
    fn apply_report_updates_fill_state() {
        let mut entry = entry_ref();
        let applied = entry.apply_report(&report(42, 0.01, 300.0, OrderStatus::Filled));
        assert!(applied);
        assert_eq!(entry.filled_qty, 0.01);
        assert_eq!(entry.status, OrderStatus::Filled);
        assert!((entry.avg_fill_price - 30000.0).abs() < 1e-9);
    }

    #[test]
    fn duplicate_report_is_a_noop() {
        let mut entry = entry_ref();
        let r = report(42, 0.01, 300.0, OrderStatus::Filled);
        assert!(entry.apply_report(&r));
        assert!(!entry.apply_report(&r));
        assert_eq!(entry.filled_qty, 0.01);
        assert!((entry.avg_fill_price - 30000.0).abs() < 1e-9);
    }

    #[test]
    fn stale_report_with_smaller_fill_is_rejected() {
        let mut entry = entry_ref();
        assert!(entry.apply_report(&report(42, 0.01, 300.0, OrderStatus::Filled)));
        assert!(!entry.apply_report(&report(42, 0.005, 150.0, OrderStatus::PartiallyFilled)));
        assert_eq!(entry.filled_qty, 0.01);
    }

    #[test]
    fn cancel_after_partial_fill_applies_on_equal_quantity() {
        let mut entry = entry_ref();
        assert!(entry.apply_report(&report(42, 0.005, 150.0, OrderStatus::PartiallyFilled)));
        // Same cumulative quantity, but the status advances.
        assert!(entry.apply_report(&report(42, 0.005, 150.0, OrderStatus::Canceled)));
        assert_eq!(entry.status, OrderStatus::Canceled);
    }

    #[test]
    fn new_trade_starts_entry_pending() {
        let trade = Trade::new("BTCUSDT", entry_ref());
        assert_eq!(trade.status, TradeStatus::EntryPending);
        assert!(trade.exit_strategy.is_none());
        assert!(!trade.archived);
        assert!(trade.is_mutable());
        assert!(!trade.needs_price_feed());
    }

    #[test]
    fn terminal_states_are_not_mutable() {
        let mut trade = Trade::new("BTCUSDT", entry_ref());
        trade.status = TradeStatus::Cancelled;
        assert!(!trade.is_mutable());

        trade.status = TradeStatus::Closed;
        assert!(!trade.is_mutable());
        trade.archived = true;
        assert!(!trade.is_mutable());
    }

    #[test]
    fn trade_snapshot_round_trips_through_json() {
        let mut trade = Trade::new("BTCUSDT", entry_ref());
        trade.exit_strategy = ExitStrategy::TrailingProfit {
            activation_pct: 5.0,
            trailing_pct: 2.0,
            activated: true,
            high_water: 32000.0,
        };

        let json = serde_json::to_string(&trade).unwrap();
        let back: Trade = serde_json::from_str(&json).unwrap();
        assert_eq!(back, trade);
    }

    #[test]
    fn older_snapshots_without_new_fields_still_load() {
        // A record written before exit strategies and the replay marker
        // existed must still deserialize.
        let json = r#"{
            "id": "t-1",
            "symbol": "BTCUSDT",
            "status": "Open",
            "entry": {
                "order_id": 42,
                "client_order_id": "c1",
                "side": "Buy",
                "quantity": 0.01,
                "price": 30000.0,
                "status": "Filled"
            },
            "created_at": "2024-01-01T00:00:00Z",
            "updated_at": "2024-01-01T00:00:00Z"
        }"#;
        let trade: Trade = serde_json::from_str(json).unwrap();
        assert_eq!(trade.status, TradeStatus::Open);
        assert!(trade.exit_strategy.is_none());
        assert_eq!(trade.last_report_time, 0);
    }
}
