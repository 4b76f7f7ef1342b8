//! snarfetch - client-side HTTP response caching
//!
//! Sits in front of an HTTP fetcher and, per outbound request, throttles
//! concurrency per origin, coalesces identical in-flight requests onto one
//! network round-trip, and reuses recent responses under Cache-Control
//! rules with size-bounded eviction (per origin and overall).
//!
//! Every response handled by the layer carries a `snarfetch-status` header
//! whose value starts with `HIT`, `MISS`, or `NOSTORE`; cache hits also
//! carry an integer `Age` header.

pub mod cache;
pub mod clock;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod fetch;
pub mod tasks;

pub use cache::{CacheRules, CacheStats, EvictionMap, LocationStatus, Target, STATUS_HEADER};
pub use clock::{ByteCount, Clock, Duration, Instant, ManualClock, SystemClock};
pub use config::{Config, Options};
pub use coordinator::{global, Coordinator};
pub use error::{FetchError, Result};
pub use fetch::{Fetcher, HttpFetcher, MaxInFlight, NoThrottle, RequestInit, ThrottlePolicy};
pub use tasks::spawn_gc_task;
