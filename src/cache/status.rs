//! Per-location cache state
//!
//! Each location a target has seen is in exactly one of four states:
//! a request is in flight and cacheability is unknown, the origin forbade
//! caching, a buffered response is held, or the last attempt failed
//! upstream. Transitions replace the whole value; only the recency stamp
//! of a cached entry is updated in place.

use std::fmt;

use bytes::Bytes;
use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use http::{HeaderMap, StatusCode};
use tokio::sync::oneshot;

use crate::cache::CacheRules;
use crate::clock::{ByteCount, Instant};

/// Settle signal for an in-flight location.
///
/// Every coalesced caller awaits its own clone; all of them complete when
/// the flight settles (the holder of the paired sender drops it after
/// writing the outcome back into the map).
pub type Unblock = Shared<BoxFuture<'static, ()>>;

/// Creates the settle signal for a new in-flight location.
pub(crate) fn unblock_channel() -> (oneshot::Sender<()>, Unblock) {
    let (tx, rx) = oneshot::channel();
    (tx, rx.map(|_| ()).boxed().shared())
}

// == Location Status ==
/// State of a single location within a target.
pub enum LocationStatus {
    /// A first request is in flight; cacheability is not yet known
    Unknown { unblock: Unblock },
    /// The origin forbids caching; every request is issued afresh
    NoStore,
    /// A fully buffered response available for reuse
    Cached {
        body: Bytes,
        status: StatusCode,
        headers: HeaderMap,
        rules: CacheRules,
        last_used: Instant,
    },
    /// The last attempt returned a server error
    Fail,
}

impl LocationStatus {
    /// Recency sort key: the stored stamp for a cached entry, `now` for
    /// everything else.
    pub fn last_used(&self, now: Instant) -> Instant {
        match self {
            LocationStatus::Cached { last_used, .. } => *last_used,
            _ => now,
        }
    }

    /// Buffered body size; zero for anything without a body.
    pub fn size(&self) -> ByteCount {
        match self {
            LocationStatus::Cached { body, .. } => ByteCount::bytes(body.len() as u64),
            _ => ByteCount::ZERO,
        }
    }

    /// Whether the entry may satisfy a request at `now`.
    pub fn is_valid(&self, now: Instant) -> bool {
        match self {
            LocationStatus::Unknown { .. } | LocationStatus::NoStore => true,
            LocationStatus::Cached { rules, .. } => rules.valid_at(now),
            LocationStatus::Fail => false,
        }
    }
}

impl fmt::Debug for LocationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LocationStatus::Unknown { .. } => f.write_str("Unknown"),
            LocationStatus::NoStore => f.write_str("NoStore"),
            LocationStatus::Cached {
                status, last_used, ..
            } => f
                .debug_struct("Cached")
                .field("status", status)
                .field("size", &self.size().get())
                .field("last_used", last_used)
                .finish_non_exhaustive(),
            LocationStatus::Fail => f.write_str("Fail"),
        }
    }
}
