// =============================================================================
// Observer API Module
// =============================================================================
//
// Read-only HTTP endpoints plus the WebSocket notice/trade feed. Command
// handling lives with the (external) request layer, not here.

pub mod rest;
pub mod ws;

pub use rest::{router, ApiState};
