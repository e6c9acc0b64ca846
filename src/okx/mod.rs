// =============================================================================
// OKX v5 REST surface — signed client plus a local request budget
// =============================================================================

pub mod client;
pub mod rate_limit;

pub use client::{
    AccountBalance, Candle, ExchangePosition, Instrument, MarginMode, OkxClient, OrderAck,
    OrderRequest, OrderSide,
};
pub use rate_limit::RequestBudget;
