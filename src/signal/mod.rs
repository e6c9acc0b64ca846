// =============================================================================
// Signal ingestion — tailing, normalization, feed liveness, recent history
// =============================================================================

pub mod heartbeat;
pub mod history;
pub mod normalizer;
pub mod tailer;

pub use heartbeat::{FeedHeartbeat, FeedState};
pub use history::SignalHistory;
pub use normalizer::{normalize, RejectReason, Signal};
pub use tailer::{SignalTailer, TailerStats};
