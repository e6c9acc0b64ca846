// =============================================================================
// Market Data — local rolling views of price and iceberg flow
// =============================================================================

pub mod iceberg_stats;
pub mod price_ring;

pub use iceberg_stats::IcebergStats;
pub use price_ring::{PricePoint, PriceRing};
