//! Cache Module
//!
//! Per-origin response caching: Cache-Control evaluation, the per-location
//! state machine, and size-bounded eviction.

mod evict;
mod rules;
mod stats;
mod status;
mod target;


// Re-export public types
pub use evict::EvictionMap;
pub use rules::CacheRules;
pub use stats::CacheStats;
pub use status::{LocationStatus, Unblock};
pub use target::Target;

// == Public Constants ==
/// Diagnostic header stamped on responses the layer handled.
///
/// Values begin with `HIT`, `MISS`, or `NOSTORE`, followed by the elapsed
/// time, e.g. `HIT in 2 ms`. Server-error responses carry no such header.
pub const STATUS_HEADER: &str = "snarfetch-status";
