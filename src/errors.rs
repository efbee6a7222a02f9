// =============================================================================
// Error taxonomy for trade commands and event intake
// =============================================================================
//
// Validation and state errors are returned to the command caller and never
// logged as fatal. Persistence errors are severe: the in-memory mutation is
// not applied when the store cannot confirm durability.
// =============================================================================

use thiserror::Error;

use crate::trade::model::TradeStatus;

/// Typed failure returned by every `TradeService` operation.
#[derive(Debug, Error)]
pub enum TradeError {
    /// Caller-correctable input problem (e.g. order size below the exchange
    /// minimum, unknown symbol).
    #[error("validation failed: {0}")]
    Validation(String),

    /// The operation is not valid for the trade's current state.
    #[error("invalid state {status}: {reason}")]
    InvalidState { status: TradeStatus, reason: String },

    /// The exchange refused the request. Not retried.
    #[error("exchange rejected request: {0}")]
    ExchangeRejected(String),

    /// Transport or timeout failure talking to the exchange. The caller may
    /// retry; the local trade state is left unchanged.
    #[error("exchange unreachable: {0}")]
    ExchangeUnreachable(String),

    /// The store could not durably record a transition.
    #[error("persistence failure: {0}")]
    Persistence(String),

    /// No trade with the given ID.
    #[error("trade not found: {0}")]
    NotFound(String),
}

impl TradeError {
    /// Shorthand for an `InvalidState` error.
    pub fn invalid_state(status: TradeStatus, reason: impl Into<String>) -> Self {
        Self::InvalidState {
            status,
            reason: reason.into(),
        }
    }
}

impl From<sqlx::Error> for TradeError {
    fn from(e: sqlx::Error) -> Self {
        TradeError::Persistence(e.to_string())
    }
}
