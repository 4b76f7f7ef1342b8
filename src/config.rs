//! Configuration Module
//!
//! Storage budgets and timing knobs, plus the record of injectable
//! collaborators a coordinator is built from.

use std::env;
use std::fmt;
use std::sync::Arc;

use crate::clock::{ByteCount, Clock, Duration, SystemClock};
use crate::fetch::{Fetcher, HttpFetcher, NoThrottle, ThrottlePolicy};

/// Storage and timing configuration.
///
/// All values can be configured via environment variables with sensible defaults.
#[derive(Debug, Clone)]
pub struct Config {
    /// Minimum interval between cross-origin rebalancing passes
    pub gc_interval: Duration,
    /// Upper bound on cached bytes across all origins
    pub max_storage_bytes: ByteCount,
    /// Upper bound on cached bytes within a single origin
    pub max_storage_per_target_bytes: ByteCount,
}

impl Config {
    /// Creates a new Config by loading values from environment variables.
    ///
    /// # Environment Variables
    /// - `SNARFETCH_GC_INTERVAL_MS` - Rebalancing interval in milliseconds (default: 60000)
    /// - `SNARFETCH_MAX_STORAGE_BYTES` - Global cache budget (default: 200 MiB)
    /// - `SNARFETCH_MAX_STORAGE_PER_TARGET_BYTES` - Per-origin cache budget (default: 50 MiB)
    pub fn from_env() -> Self {
        Self {
            gc_interval: env::var("SNARFETCH_GC_INTERVAL_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(Duration::from_secs(60)),
            max_storage_bytes: env::var("SNARFETCH_MAX_STORAGE_BYTES")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(ByteCount::bytes)
                .unwrap_or(ByteCount::mib(200)),
            max_storage_per_target_bytes: env::var("SNARFETCH_MAX_STORAGE_PER_TARGET_BYTES")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(ByteCount::bytes)
                .unwrap_or(ByteCount::mib(50)),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            gc_interval: Duration::from_secs(60),
            max_storage_bytes: ByteCount::mib(200),
            max_storage_per_target_bytes: ByteCount::mib(50),
        }
    }
}

/// Injectable collaborators for a coordinator.
///
/// Defaults wire in the reqwest-backed fetcher, no throttling, and the
/// system clock; tests swap in scripted fetchers and a manual clock.
#[derive(Clone)]
pub struct Options {
    pub config: Config,
    pub fetcher: Arc<dyn Fetcher>,
    pub throttle: Arc<dyn ThrottlePolicy>,
    pub clock: Arc<dyn Clock>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            config: Config::default(),
            fetcher: Arc::new(HttpFetcher::new()),
            throttle: Arc::new(NoThrottle),
            clock: Arc::new(SystemClock::new()),
        }
    }
}

impl fmt::Debug for Options {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Options")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
