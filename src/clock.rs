//! Time and size primitives.
//!
//! All timekeeping goes through the [`Clock`] trait so tests can drive time
//! deterministically. Instants and durations are integer milliseconds;
//! storage sizes are byte counts with 1024-base unit constructors.

use std::ops::{Add, Div, Sub};
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

// == Instant ==
/// A point in time, in integer milliseconds. Totally ordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Instant(i64);

impl Instant {
    /// Creates an instant from a millisecond timestamp.
    pub const fn from_millis(millis: i64) -> Self {
        Self(millis)
    }

    /// The underlying millisecond timestamp.
    pub const fn as_millis(self) -> i64 {
        self.0
    }

    /// Time elapsed from `self` to `other`.
    ///
    /// Note the orientation: the result is `other − self`, so
    /// `request_start.since(clock.now())` is the positive elapsed time.
    pub fn since(self, other: Instant) -> Duration {
        Duration::from_millis(other.0.saturating_sub(self.0))
    }
}

impl Add<Duration> for Instant {
    type Output = Instant;

    fn add(self, rhs: Duration) -> Instant {
        Instant(self.0.saturating_add(rhs.0))
    }
}

impl Sub<Duration> for Instant {
    type Output = Instant;

    fn sub(self, rhs: Duration) -> Instant {
        Instant(self.0.saturating_sub(rhs.0))
    }
}

// == Duration ==
/// A signed span of time in integer milliseconds.
///
/// Negative durations are permitted; seconds are a derived quantity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Duration(i64);

impl Duration {
    pub const ZERO: Duration = Duration(0);

    pub const fn from_millis(millis: i64) -> Self {
        Self(millis)
    }

    pub const fn from_secs(secs: i64) -> Self {
        Self(secs.saturating_mul(1000))
    }

    pub const fn as_millis(self) -> i64 {
        self.0
    }

    /// Whole seconds, rounded toward positive infinity.
    pub const fn ceil_secs(self) -> i64 {
        let quotient = self.0 / 1000;
        if self.0 % 1000 > 0 {
            quotient + 1
        } else {
            quotient
        }
    }
}

impl Add for Duration {
    type Output = Duration;

    fn add(self, rhs: Duration) -> Duration {
        Duration(self.0.saturating_add(rhs.0))
    }
}

// == Byte Count ==
/// A non-negative count of bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ByteCount(u64);

impl ByteCount {
    pub const ZERO: ByteCount = ByteCount(0);

    /// Sentinel weight that can never fit under any finite limit; entries
    /// weighed this are always evicted first.
    pub const INF: ByteCount = ByteCount(u64::MAX);

    pub const fn bytes(count: u64) -> Self {
        Self(count)
    }

    pub const fn kib(count: u64) -> Self {
        Self(count.saturating_mul(1024))
    }

    pub const fn mib(count: u64) -> Self {
        Self(count.saturating_mul(1024 * 1024))
    }

    pub const fn gib(count: u64) -> Self {
        Self(count.saturating_mul(1024 * 1024 * 1024))
    }

    pub const fn get(self) -> u64 {
        self.0
    }

    pub const fn saturating_add(self, rhs: ByteCount) -> ByteCount {
        ByteCount(self.0.saturating_add(rhs.0))
    }

    pub const fn saturating_sub(self, rhs: ByteCount) -> ByteCount {
        ByteCount(self.0.saturating_sub(rhs.0))
    }
}

impl Div<u64> for ByteCount {
    type Output = ByteCount;

    fn div(self, rhs: u64) -> ByteCount {
        ByteCount(self.0 / rhs)
    }
}

// == Clock ==
/// Source of the current time. Injected so tests can control it.
pub trait Clock: Send + Sync {
    /// Current time, monotonically non-decreasing.
    fn now(&self) -> Instant;
}

/// Wall clock reporting Unix epoch milliseconds.
///
/// Readings are clamped so the reported time never moves backwards even if
/// the system clock does.
#[derive(Debug, Default)]
pub struct SystemClock {
    floor_ms: AtomicI64,
}

impl SystemClock {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        let wall = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("Time went backwards")
            .as_millis() as i64;
        let previous = self.floor_ms.fetch_max(wall, Ordering::AcqRel);
        Instant::from_millis(previous.max(wall))
    }
}

/// Deterministic clock for tests; time moves only when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now_ms: AtomicI64,
}

impl ManualClock {
    /// Starts at instant zero.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn starting_at(instant: Instant) -> Self {
        Self {
            now_ms: AtomicI64::new(instant.as_millis()),
        }
    }

    /// Moves time forward by `delta`.
    pub fn advance(&self, delta: Duration) {
        self.now_ms.fetch_add(delta.as_millis(), Ordering::AcqRel);
    }

    /// Jumps to an absolute instant.
    pub fn set(&self, instant: Instant) {
        self.now_ms.store(instant.as_millis(), Ordering::Release);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        Instant::from_millis(self.now_ms.load(Ordering::Acquire))
    }
}
