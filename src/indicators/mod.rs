// =============================================================================
// Indicators — price-series math shared by the price ring and market context
// =============================================================================

pub mod ema;
pub mod rsi;

pub use ema::{ema_last, ema_series};
pub use rsi::rsi;
