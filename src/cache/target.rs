//! Per-origin cache controller
//!
//! A [`Target`] owns every location fetched from one `host:port` authority:
//! the location table, the single-flight gate that deduplicates concurrent
//! requests while cacheability is still unknown, and the eviction pass that
//! keeps buffered bodies under the origin's byte budget.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use http::header::AGE;
use http::{HeaderMap, HeaderValue, Response, StatusCode};
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, warn};
use url::Url;

use crate::cache::status::{unblock_channel, Unblock};
use crate::cache::{CacheRules, CacheStats, EvictionMap, LocationStatus, STATUS_HEADER};
use crate::clock::{ByteCount, Clock, Instant};
use crate::error::{FetchError, Result};
use crate::fetch::{Fetcher, RequestInit};

/// Location table plus its counters, guarded together.
struct TargetState {
    known: EvictionMap<String, LocationStatus>,
    stats: CacheStats,
}

/// Bookkeeping for the single eviction pass allowed at a time.
#[derive(Default)]
struct GcGate {
    running: bool,
    waiters: Vec<oneshot::Sender<std::result::Result<ByteCount, ()>>>,
}

/// Outcome of one locked look at a location's state.
enum Dispatch {
    /// A request is in flight; wait for it to settle and look again
    Wait(Unblock),
    /// A fresh buffered response was served
    Hit(Response<Bytes>),
    /// Go to the network, installing the coalescing gate when first in
    Refetch { install: bool },
}

struct TargetInner {
    key: String,
    fetcher: Arc<dyn Fetcher>,
    clock: Arc<dyn Clock>,
    state: Mutex<TargetState>,
    gate: Mutex<GcGate>,
    /// Current byte budget for this origin
    limit_bytes: AtomicU64,
}

// == Target ==
/// Per-origin controller: throttled fetcher plus the location state machine.
///
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Target {
    inner: Arc<TargetInner>,
}

impl Target {
    pub(crate) fn new(
        key: String,
        fetcher: Arc<dyn Fetcher>,
        clock: Arc<dyn Clock>,
        limit: ByteCount,
    ) -> Self {
        Self {
            inner: Arc::new(TargetInner {
                key,
                fetcher,
                clock,
                state: Mutex::new(TargetState {
                    known: EvictionMap::new(),
                    stats: CacheStats::new(),
                }),
                gate: Mutex::new(GcGate::default()),
                limit_bytes: AtomicU64::new(limit.get()),
            }),
        }
    }

    /// `host:port` authority this target serves.
    pub fn key(&self) -> &str {
        &self.inner.key
    }

    /// Cache key within a target: path plus query; fragments are ignored.
    pub fn location_key(url: &Url) -> String {
        match url.query() {
            Some(query) => format!("{}?{}", url.path(), query),
            None => url.path().to_string(),
        }
    }

    /// Current byte budget.
    pub fn limit(&self) -> ByteCount {
        ByteCount::bytes(self.inner.limit_bytes.load(Ordering::Acquire))
    }

    // == Fetch ==
    /// Fetches `url`, serving from cache when a fresh response is buffered
    /// and coalescing concurrent callers onto one in-flight request while
    /// cacheability is unknown.
    ///
    /// Validity is judged against the instant this caller arrived, so a
    /// response that was fresh when asked for stays served even if the
    /// entry expires while the caller is queued behind an in-flight fetch.
    pub async fn fetch(&self, url: &Url, init: &RequestInit) -> Result<Response<Bytes>> {
        let loc = Self::location_key(url);
        let t0 = self.inner.clock.now();

        let settled = loop {
            let mut guard = self.inner.state.lock().await;
            let state = &mut *guard;
            let now = self.inner.clock.now();

            let dispatch = match state.known.get_mut(&loc) {
                Some(LocationStatus::Unknown { unblock }) => Dispatch::Wait(unblock.clone()),
                Some(LocationStatus::Cached {
                    body,
                    status,
                    headers,
                    rules,
                    last_used,
                }) => {
                    if rules.valid_at(t0) {
                        let response = hit_response(body.clone(), *status, headers, rules, t0, now);
                        *last_used = now;
                        state.stats.record_hit();
                        Dispatch::Hit(response)
                    } else {
                        // TODO: revalidate with ETag / If-Modified-Since
                        // instead of refetching the full body.
                        Dispatch::Refetch { install: true }
                    }
                }
                Some(_) => Dispatch::Refetch { install: false },
                None => Dispatch::Refetch { install: true },
            };

            match dispatch {
                Dispatch::Hit(response) => return Ok(response),
                Dispatch::Wait(unblock) => {
                    drop(guard);
                    unblock.await;
                }
                Dispatch::Refetch { install } => {
                    if install {
                        let (tx, unblock) = unblock_channel();
                        state.known.insert(loc.clone(), LocationStatus::Unknown { unblock });
                        state.stats.set_tracked_locations(state.known.len());
                        break Some(tx);
                    }
                    break None;
                }
            }
        };

        let outcome = self
            .inner
            .fetcher
            .fetch(url.clone(), init.clone())
            .await;
        let now = self.inner.clock.now();
        let elapsed_ms = t0.since(now).as_millis();

        let response = match outcome {
            Ok(response) => response,
            Err(error) => {
                // Clear the gate so waiters retry instead of observing a
                // stale in-flight marker.
                if settled.is_some() {
                    let mut guard = self.inner.state.lock().await;
                    let state = &mut *guard;
                    if matches!(state.known.get(&loc), Some(LocationStatus::Unknown { .. })) {
                        state.known.remove(&loc);
                        state.stats.set_tracked_locations(state.known.len());
                    }
                }
                drop(settled);
                return Err(error);
            }
        };

        if response.status().as_u16() >= 500 {
            let mut guard = self.inner.state.lock().await;
            let state = &mut *guard;
            state.known.insert(loc, LocationStatus::Fail);
            state.stats.record_failure();
            state.stats.set_tracked_locations(state.known.len());
            drop(guard);
            drop(settled);
            // Server errors pass through untouched
            return Ok(response);
        }

        let rules = CacheRules::extract(response.headers(), now);
        if rules.no_store {
            let mut response = response;
            {
                let mut guard = self.inner.state.lock().await;
                let state = &mut *guard;
                state.known.insert(loc, LocationStatus::NoStore);
                state.stats.record_no_store();
                state.stats.set_tracked_locations(state.known.len());
            }
            drop(settled);
            annotate(&mut response, "NOSTORE", elapsed_ms);
            return Ok(response);
        }

        // Cacheable: keep the buffered body and hand the caller a rebuilt
        // response, so the cached copy and the caller's copy stay
        // independently consumable.
        let (parts, body) = response.into_parts();
        {
            let mut guard = self.inner.state.lock().await;
            let state = &mut *guard;
            state.known.insert(
                loc,
                LocationStatus::Cached {
                    body: body.clone(),
                    status: parts.status,
                    headers: parts.headers.clone(),
                    rules,
                    last_used: now,
                },
            );
            state.stats.record_miss();
            state.stats.set_tracked_locations(state.known.len());
        }
        drop(settled);
        self.schedule_gc();

        let mut response = Response::from_parts(parts, body);
        annotate(&mut response, "MISS", elapsed_ms);
        Ok(response)
    }

    // == Eviction ==
    /// Resets this origin's byte budget and forces an eviction pass.
    ///
    /// Returns the post-pass total of cached bytes.
    pub async fn gc(&self, limit: ByteCount) -> Result<ByteCount> {
        self.inner.limit_bytes.store(limit.get(), Ordering::Release);
        self.run_gc_pass().await
    }

    /// Schedules a deferred pass after a cache insertion.
    fn schedule_gc(&self) {
        let target = self.clone();
        tokio::spawn(async move {
            if let Err(error) = target.run_gc_pass().await {
                warn!("eviction pass for {} failed: {}", target.inner.key, error);
            }
        });
    }

    /// Runs one eviction pass, or waits on the one already running.
    ///
    /// Callers arriving mid-pass are resolved with that pass's resulting
    /// weight rather than starting another sweep.
    async fn run_gc_pass(&self) -> Result<ByteCount> {
        let waiter = {
            let mut gate = self.inner.gate.lock().await;
            if gate.running {
                let (tx, rx) = oneshot::channel();
                gate.waiters.push(tx);
                Some(rx)
            } else {
                gate.running = true;
                None
            }
        };
        if let Some(rx) = waiter {
            return match rx.await {
                Ok(Ok(weight)) => Ok(weight),
                _ => Err(FetchError::GcInterrupted),
            };
        }

        let outcome = self.gc_pass().await;

        let mut gate = self.inner.gate.lock().await;
        gate.running = false;
        let shared = match &outcome {
            Ok(weight) => Ok(*weight),
            Err(_) => Err(()),
        };
        for tx in gate.waiters.drain(..) {
            let _ = tx.send(shared);
        }
        outcome
    }

    /// The sweep itself: measure, and evict least-recent entries when the
    /// table is over budget. Entries that are no longer valid weigh
    /// [`ByteCount::INF`] so they are always dropped first.
    async fn gc_pass(&self) -> Result<ByteCount> {
        let limit = self.limit();
        let now = self.inner.clock.now();

        let mut guard = self.inner.state.lock().await;
        let state = &mut *guard;

        let total = state.known.weight(|status| Ok(status.size()))?;
        if total <= limit {
            return Ok(total);
        }

        let before = state.known.len();
        let retained = state.known.gc(
            limit,
            |status| status.last_used(now),
            |status| {
                Ok(if status.is_valid(now) {
                    status.size()
                } else {
                    ByteCount::INF
                })
            },
        )?;
        let evicted = (before - state.known.len()) as u64;
        state.stats.record_evictions(evicted);
        state.stats.set_tracked_locations(state.known.len());
        debug!(
            "evicted {} entries from {}: {} -> {} bytes (limit {})",
            evicted,
            self.inner.key,
            total.get(),
            retained.get(),
            limit.get()
        );
        Ok(retained)
    }

    // == Introspection ==
    /// Total cached bytes right now, without evicting anything.
    pub async fn weight(&self) -> ByteCount {
        let guard = self.inner.state.lock().await;
        guard
            .known
            .weight(|status| Ok(status.size()))
            .unwrap_or(ByteCount::ZERO)
    }

    /// Snapshot of this origin's counters.
    pub async fn stats(&self) -> CacheStats {
        let guard = self.inner.state.lock().await;
        let mut stats = guard.stats.clone();
        stats.set_tracked_locations(guard.known.len());
        stats
    }
}

impl std::fmt::Debug for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Target")
            .field("key", &self.inner.key)
            .field("limit_bytes", &self.inner.limit_bytes.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

/// Rebuilds a hit from the buffered body, overwriting `Age` with the
/// seconds elapsed since the response's age base.
fn hit_response(
    body: Bytes,
    status: StatusCode,
    headers: &HeaderMap,
    rules: &CacheRules,
    t0: Instant,
    now: Instant,
) -> Response<Bytes> {
    let mut response = Response::new(body);
    *response.status_mut() = status;
    *response.headers_mut() = headers.clone();
    let age_secs = rules.age_base.since(now).ceil_secs();
    response.headers_mut().insert(AGE, HeaderValue::from(age_secs));
    annotate(&mut response, "HIT", t0.since(now).as_millis());
    response
}

/// Stamps the diagnostic header, e.g. `MISS in 12 ms`.
fn annotate(response: &mut Response<Bytes>, verdict: &str, elapsed_ms: i64) {
    let value = format!("{} in {} ms", verdict, elapsed_ms);
    if let Ok(value) = HeaderValue::from_str(&value) {
        response.headers_mut().insert(STATUS_HEADER, value);
    }
}

// == Unit Tests ==
#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Duration, ManualClock};
    use futures::future::BoxFuture;
    use futures::FutureExt;
    use http::header::CACHE_CONTROL;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex as StdMutex;

    struct Scripted {
        status: u16,
        cache_control: Option<&'static str>,
        body: &'static str,
        fail: bool,
    }

    impl Scripted {
        fn ok(cache_control: Option<&'static str>, body: &'static str) -> Self {
            Self {
                status: 200,
                cache_control,
                body,
                fail: false,
            }
        }

        fn status(status: u16, body: &'static str) -> Self {
            Self {
                status,
                cache_control: None,
                body,
                fail: false,
            }
        }

        fn error() -> Self {
            Self {
                status: 0,
                cache_control: None,
                body: "",
                fail: true,
            }
        }
    }

    struct MockFetcher {
        script: StdMutex<VecDeque<Scripted>>,
        calls: AtomicUsize,
    }

    impl MockFetcher {
        fn new(script: Vec<Scripted>) -> Arc<Self> {
            Arc::new(Self {
                script: StdMutex::new(script.into()),
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl Fetcher for Arc<MockFetcher> {
        fn fetch(&self, _url: Url, _init: RequestInit) -> BoxFuture<'static, Result<Response<Bytes>>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let next = self.script.lock().unwrap().pop_front();
            async move {
                let scripted = next.expect("fetcher called more times than scripted");
                if scripted.fail {
                    return Err(FetchError::Transport("connection refused".into()));
                }
                let mut response = Response::new(Bytes::from(scripted.body));
                *response.status_mut() = StatusCode::from_u16(scripted.status).unwrap();
                if let Some(cc) = scripted.cache_control {
                    response
                        .headers_mut()
                        .insert(CACHE_CONTROL, HeaderValue::from_static(cc));
                }
                Ok(response)
            }
            .boxed()
        }
    }

    fn target_with(
        script: Vec<Scripted>,
        clock: Arc<ManualClock>,
        limit: ByteCount,
    ) -> (Target, Arc<MockFetcher>) {
        let fetcher = MockFetcher::new(script);
        let target = Target::new(
            "origin.test:80".to_string(),
            Arc::new(Arc::clone(&fetcher)),
            clock,
            limit,
        );
        (target, fetcher)
    }

    fn status_header(response: &Response<Bytes>) -> &str {
        response
            .headers()
            .get(STATUS_HEADER)
            .map(|v| v.to_str().unwrap())
            .unwrap_or("")
    }

    #[test]
    fn test_location_key() {
        let plain = Url::parse("http://origin.test/a/b").unwrap();
        assert_eq!(Target::location_key(&plain), "/a/b");

        let with_query = Url::parse("http://origin.test/a?x=1&y=2").unwrap();
        assert_eq!(Target::location_key(&with_query), "/a?x=1&y=2");

        let with_fragment = Url::parse("http://origin.test/a?x=1#frag").unwrap();
        assert_eq!(Target::location_key(&with_fragment), "/a?x=1");
    }

    #[tokio::test]
    async fn test_miss_then_hit() {
        let clock = Arc::new(ManualClock::new());
        let (target, fetcher) = target_with(
            vec![Scripted::ok(Some("max-age=60"), "payload")],
            Arc::clone(&clock),
            ByteCount::mib(1),
        );
        let url = Url::parse("http://origin.test/data").unwrap();

        let first = target.fetch(&url, &RequestInit::default()).await.unwrap();
        assert_eq!(first.body().as_ref(), b"payload");
        assert!(status_header(&first).starts_with("MISS"));

        clock.advance(Duration::from_secs(10));
        let second = target.fetch(&url, &RequestInit::default()).await.unwrap();
        assert_eq!(second.body().as_ref(), b"payload");
        assert!(status_header(&second).starts_with("HIT"));
        assert_eq!(second.headers().get(AGE).unwrap(), "10");

        assert_eq!(fetcher.calls(), 1);
        let stats = target.stats().await;
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }

    #[tokio::test]
    async fn test_no_store_always_refetches() {
        let clock = Arc::new(ManualClock::new());
        let (target, fetcher) = target_with(
            vec![
                Scripted::ok(Some("no-store"), "1"),
                Scripted::ok(Some("no-store"), "2"),
            ],
            clock,
            ByteCount::mib(1),
        );
        let url = Url::parse("http://origin.test/volatile").unwrap();

        let first = target.fetch(&url, &RequestInit::default()).await.unwrap();
        assert!(status_header(&first).starts_with("NOSTORE"));

        let second = target.fetch(&url, &RequestInit::default()).await.unwrap();
        assert_eq!(second.body().as_ref(), b"2");
        assert!(status_header(&second).starts_with("NOSTORE"));
        assert_eq!(fetcher.calls(), 2);
    }

    #[tokio::test]
    async fn test_server_error_passes_through_unannotated() {
        let clock = Arc::new(ManualClock::new());
        let (target, _fetcher) = target_with(
            vec![Scripted::status(503, "unavailable")],
            clock,
            ByteCount::mib(1),
        );
        let url = Url::parse("http://origin.test/broken").unwrap();

        let response = target.fetch(&url, &RequestInit::default()).await.unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert!(response.headers().get(STATUS_HEADER).is_none());

        let stats = target.stats().await;
        assert_eq!(stats.failures, 1);
    }

    #[tokio::test]
    async fn test_fetch_error_clears_gate_for_retry() {
        let clock = Arc::new(ManualClock::new());
        let (target, fetcher) = target_with(
            vec![Scripted::error(), Scripted::ok(Some("max-age=60"), "ok")],
            clock,
            ByteCount::mib(1),
        );
        let url = Url::parse("http://origin.test/flaky").unwrap();

        let first = target.fetch(&url, &RequestInit::default()).await;
        assert!(matches!(first, Err(FetchError::Transport(_))));

        let second = target.fetch(&url, &RequestInit::default()).await.unwrap();
        assert_eq!(second.body().as_ref(), b"ok");
        assert_eq!(fetcher.calls(), 2);
    }

    #[tokio::test]
    async fn test_gc_trims_to_limit_most_recent_first() {
        let clock = Arc::new(ManualClock::new());
        let (target, _fetcher) = target_with(
            vec![
                Scripted::ok(Some("max-age=600"), "aaaaaaaaaa"),
                Scripted::ok(Some("max-age=600"), "bbbbbbbbbb"),
                Scripted::ok(Some("max-age=600"), "cccccccccc"),
            ],
            Arc::clone(&clock),
            ByteCount::mib(1),
        );

        for path in ["/one", "/two", "/three"] {
            let url = Url::parse(&format!("http://origin.test{}", path)).unwrap();
            target.fetch(&url, &RequestInit::default()).await.unwrap();
            clock.advance(Duration::from_secs(1));
        }
        assert_eq!(target.weight().await, ByteCount::bytes(30));

        // Budget for two bodies: the least recently used entry goes.
        let retained = target.gc(ByteCount::bytes(20)).await.unwrap();
        assert_eq!(retained, ByteCount::bytes(20));

        clock.advance(Duration::from_secs(1));
        let url = Url::parse("http://origin.test/three").unwrap();
        let response = target.fetch(&url, &RequestInit::default()).await.unwrap();
        assert!(status_header(&response).starts_with("HIT"));

        let stats = target.stats().await;
        assert_eq!(stats.evictions, 1);
    }

    #[tokio::test]
    async fn test_gc_drops_failed_entries_despite_recency() {
        let clock = Arc::new(ManualClock::new());
        let (target, _fetcher) = target_with(
            vec![
                Scripted::ok(Some("max-age=600"), "old"),
                Scripted::ok(Some("max-age=600"), "new"),
                Scripted::status(500, "boom"),
            ],
            Arc::clone(&clock),
            ByteCount::mib(1),
        );

        for path in ["/a", "/b"] {
            let url = Url::parse(&format!("http://origin.test{}", path)).unwrap();
            target.fetch(&url, &RequestInit::default()).await.unwrap();
            clock.advance(Duration::from_secs(1));
        }
        let failed = Url::parse("http://origin.test/failed").unwrap();
        target.fetch(&failed, &RequestInit::default()).await.unwrap();

        // The failed entry ranks as most recent but can never fit; the
        // budget then covers one cached body.
        let retained = target.gc(ByteCount::bytes(3)).await.unwrap();
        assert_eq!(retained, ByteCount::bytes(3));

        let stats = target.stats().await;
        assert_eq!(stats.tracked_locations, 1);

        let fresh = Url::parse("http://origin.test/b").unwrap();
        let response = target.fetch(&fresh, &RequestInit::default()).await.unwrap();
        assert!(status_header(&response).starts_with("HIT"));
    }

    #[tokio::test]
    async fn test_expired_entry_refetched() {
        let clock = Arc::new(ManualClock::new());
        let (target, fetcher) = target_with(
            vec![
                Scripted::ok(Some("max-age=60"), "old"),
                Scripted::ok(Some("max-age=60"), "new"),
            ],
            Arc::clone(&clock),
            ByteCount::mib(1),
        );
        let url = Url::parse("http://origin.test/data").unwrap();

        target.fetch(&url, &RequestInit::default()).await.unwrap();

        clock.advance(Duration::from_millis(60_001));
        let second = target.fetch(&url, &RequestInit::default()).await.unwrap();
        assert_eq!(second.body().as_ref(), b"new");
        assert!(status_header(&second).starts_with("MISS"));
        assert_eq!(fetcher.calls(), 2);
    }
}
