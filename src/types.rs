// =============================================================================
// Shared types used across the Borealis trade engine
// =============================================================================

use serde::{Deserialize, Serialize};

/// Order side as submitted to the exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    /// Wire representation expected by the exchange ("BUY" / "SELL").
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Buy => "BUY",
            Self::Sell => "SELL",
        }
    }

    /// Parse the exchange wire representation.
    pub fn from_exchange(s: &str) -> Option<Self> {
        match s {
            "BUY" => Some(Self::Buy),
            "SELL" => Some(Self::Sell),
            _ => None,
        }
    }
}

impl std::fmt::Display for OrderSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Exchange-reported order status.
///
/// `rank` orders the states by fill progression so that a redelivered
/// execution report can be recognised as stale: a report is only applied when
/// its cumulative fill quantity grows, or stays equal while the status rank
/// advances (e.g. `PartiallyFilled` -> `Canceled` with no new fill).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    New,
    PartiallyFilled,
    Filled,
    Canceled,
    Rejected,
    Expired,
}

impl OrderStatus {
    /// Parse the exchange wire representation (e.g. "PARTIALLY_FILLED").
    pub fn from_exchange(s: &str) -> Option<Self> {
        match s {
            "NEW" => Some(Self::New),
            "PARTIALLY_FILLED" => Some(Self::PartiallyFilled),
            "FILLED" => Some(Self::Filled),
            "CANCELED" => Some(Self::Canceled),
            "REJECTED" => Some(Self::Rejected),
            "EXPIRED" => Some(Self::Expired),
            _ => None,
        }
    }

    /// Progression rank used for idempotent report application.
    pub fn rank(&self) -> u8 {
        match self {
            Self::New => 0,
            Self::PartiallyFilled => 1,
            Self::Filled | Self::Canceled | Self::Rejected | Self::Expired => 2,
        }
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::New => "New",
            Self::PartiallyFilled => "PartiallyFilled",
            Self::Filled => "Filled",
            Self::Canceled => "Canceled",
            Self::Rejected => "Rejected",
            Self::Expired => "Expired",
        };
        write!(f, "{s}")
    }
}

/// Balance snapshot for a single asset from the exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BalanceInfo {
    pub asset: String,
    #[serde(default)]
    pub free: f64,
    #[serde(default)]
    pub locked: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn order_status_round_trips_from_exchange() {
        assert_eq!(
            OrderStatus::from_exchange("PARTIALLY_FILLED"),
            Some(OrderStatus::PartiallyFilled)
        );
        assert_eq!(OrderStatus::from_exchange("FILLED"), Some(OrderStatus::Filled));
        assert_eq!(OrderStatus::from_exchange("bogus"), None);
    }

    #[test]
    fn status_rank_is_monotonic_over_fill_progression() {
        assert!(OrderStatus::New.rank() < OrderStatus::PartiallyFilled.rank());
        assert!(OrderStatus::PartiallyFilled.rank() < OrderStatus::Filled.rank());
        assert!(OrderStatus::PartiallyFilled.rank() < OrderStatus::Canceled.rank());
    }

    #[test]
    fn side_wire_format() {
        assert_eq!(OrderSide::Buy.as_str(), "BUY");
        assert_eq!(OrderSide::from_exchange("SELL"), Some(OrderSide::Sell));
    }
}
