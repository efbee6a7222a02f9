// =============================================================================
// Binance Integration Module
// =============================================================================
//
// Signed REST client, the exchange-info filter cache, and the two live
// streams: the authenticated user-data stream (execution reports, balances)
// and the per-symbol trade tick streams.

pub mod client;
pub mod exchange_info;
pub mod trade_stream;
pub mod user_stream;

pub use client::BinanceClient;
pub use exchange_info::ExchangeInfoService;
pub use trade_stream::{PriceTick, TradeStreamManager};
pub use user_stream::{ExecutionReport, UserDataStream, UserStreamEvent};
