// =============================================================================
// Trade Module
// =============================================================================
//
// The trade lifecycle core: the entity model, the order-entry gateway seam,
// the durable store, and the single-writer trade service that ties them
// together.

pub mod gateway;
pub mod model;
pub mod service;
pub mod store;

pub use model::{ExitStrategy, StopLossSpec, Trade, TradeStatus};
pub use service::{BuyOrder, TradeQuery, TradeService};
pub use store::TradeStore;
