//! Process-wide dispatch across per-origin targets
//!
//! The coordinator routes each request to the [`Target`] keyed by the URL
//! authority, creating targets lazily, and periodically rebalances cached
//! storage across origins so the global budget holds.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, OnceLock};

use bytes::Bytes;
use futures::future::join_all;
use http::Response;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::{CacheStats, Target};
use crate::clock::ByteCount;
use crate::config::Options;
use crate::error::{FetchError, Result};
use crate::fetch::RequestInit;

struct CoordinatorInner {
    options: Options,
    targets: RwLock<HashMap<String, Target>>,
    /// Earliest instant (millis) the next global pass may start
    next_gc_ms: AtomicI64,
    gc_in_progress: AtomicBool,
}

// == Coordinator ==
/// Routes requests to per-origin targets and runs the cross-origin
/// storage rebalancing pass.
///
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Coordinator {
    inner: Arc<CoordinatorInner>,
}

impl Coordinator {
    pub fn new(options: Options) -> Self {
        let next_gc_ms = AtomicI64::new(options.clock.now().as_millis());
        Self {
            inner: Arc::new(CoordinatorInner {
                options,
                targets: RwLock::new(HashMap::new()),
                next_gc_ms,
                gc_in_progress: AtomicBool::new(false),
            }),
        }
    }

    /// Fetches with default request settings.
    pub async fn fetch(&self, url: &str) -> Result<Response<Bytes>> {
        self.fetch_with(url, RequestInit::default()).await
    }

    /// Fetches `url`, routing through the per-origin cache.
    pub async fn fetch_with(&self, url: &str, init: RequestInit) -> Result<Response<Bytes>> {
        let url = Url::parse(url)?;
        let target = self.target_for(&url).await?;
        self.maybe_gc();
        target.fetch(&url, &init).await
    }

    /// `host:port` authority key; URLs without a host are rejected.
    fn target_key(url: &Url) -> Result<String> {
        let host = url
            .host_str()
            .ok_or_else(|| FetchError::UnsupportedUrl(url.to_string()))?;
        let port = url.port_or_known_default().unwrap_or(0);
        Ok(format!("{}:{}", host, port))
    }

    /// Looks up or lazily creates the target for `url`'s origin.
    async fn target_for(&self, url: &Url) -> Result<Target> {
        let key = Self::target_key(url)?;
        {
            let targets = self.inner.targets.read().await;
            if let Some(target) = targets.get(&key) {
                return Ok(target.clone());
            }
        }

        let mut targets = self.inner.targets.write().await;
        // Another caller may have created it while we waited for the lock
        let target = targets.entry(key.clone()).or_insert_with(|| {
            let options = &self.inner.options;
            let fetcher = options.throttle.wrap(Arc::clone(&options.fetcher));
            Target::new(
                key,
                fetcher,
                Arc::clone(&options.clock),
                options.config.max_storage_per_target_bytes,
            )
        });
        Ok(target.clone())
    }

    // == Global Eviction ==
    /// Kicks a deferred global pass when one is due and none is running.
    fn maybe_gc(&self) {
        let now = self.inner.options.clock.now();
        if now.as_millis() < self.inner.next_gc_ms.load(Ordering::Acquire) {
            return;
        }
        if self.inner.gc_in_progress.swap(true, Ordering::AcqRel) {
            return;
        }

        let coordinator = self.clone();
        tokio::spawn(async move {
            if let Err(error) = coordinator.run_gc().await {
                warn!("global eviction pass failed: {}", error);
            }
            // Reset unconditionally so a benign pass cannot starve later ones
            let inner = &coordinator.inner;
            let next = inner.options.clock.now() + inner.options.config.gc_interval;
            inner.next_gc_ms.store(next.as_millis(), Ordering::Release);
            inner.gc_in_progress.store(false, Ordering::Release);
        });
    }

    /// Forces the cross-origin pass: per-target sweeps, then fair-share
    /// rebalancing when the global budget is exceeded.
    ///
    /// Returns the total cached bytes measured before rebalancing.
    pub async fn run_gc(&self) -> Result<ByteCount> {
        let config = &self.inner.options.config;
        let targets: Vec<Target> = {
            let targets = self.inner.targets.read().await;
            targets.values().cloned().collect()
        };

        let weights = join_all(targets.iter().map(|target| {
            let target = target.clone();
            let limit = config.max_storage_per_target_bytes;
            async move { target.gc(limit).await }
        }))
        .await;

        let mut pairs = Vec::with_capacity(targets.len());
        let mut total = ByteCount::ZERO;
        for (target, weight) in targets.into_iter().zip(weights) {
            let weight = weight?;
            total = total.saturating_add(weight);
            pairs.push((target, weight));
        }

        if total > config.max_storage_bytes {
            // Fair-share rebalancing: origins already below an equal split
            // keep what they have; the rest divide the remaining budget.
            pairs.sort_by_key(|(_, weight)| *weight);
            let mut budget = config.max_storage_bytes;
            while !pairs.is_empty() && budget / pairs.len() as u64 > pairs[0].1 {
                let (_, weight) = pairs.remove(0);
                budget = budget.saturating_sub(weight);
            }

            if !pairs.is_empty() {
                let share = budget / pairs.len() as u64;
                info!(
                    "rebalancing {} origins to {} bytes each ({} bytes cached)",
                    pairs.len(),
                    share.get(),
                    total.get()
                );
                let passes = join_all(pairs.iter().map(|(target, _)| {
                    let target = target.clone();
                    async move { target.gc(share).await }
                }))
                .await;
                for pass in passes {
                    pass?;
                }
            }
        } else {
            debug!(
                "{} bytes cached across {} origins, within budget",
                total.get(),
                pairs.len()
            );
        }

        Ok(total)
    }

    // == Introspection ==
    /// Total cached bytes across every origin, without evicting anything.
    pub async fn weight(&self) -> ByteCount {
        let targets: Vec<Target> = {
            let targets = self.inner.targets.read().await;
            targets.values().cloned().collect()
        };
        let mut total = ByteCount::ZERO;
        for target in targets {
            total = total.saturating_add(target.weight().await);
        }
        total
    }

    /// Aggregated counters across every origin.
    pub async fn stats(&self) -> CacheStats {
        let targets: Vec<Target> = {
            let targets = self.inner.targets.read().await;
            targets.values().cloned().collect()
        };
        let mut total = CacheStats::new();
        for target in targets {
            total.merge(&target.stats().await);
        }
        total
    }

    /// Number of origins currently tracked.
    pub async fn target_count(&self) -> usize {
        self.inner.targets.read().await.len()
    }
}

impl Default for Coordinator {
    fn default() -> Self {
        Self::new(Options::default())
    }
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("options", &self.inner.options)
            .finish_non_exhaustive()
    }
}

// == Global Instance ==
static GLOBAL: OnceLock<Coordinator> = OnceLock::new();

/// Process-wide coordinator with default options, initialised on first use.
pub fn global() -> &'static Coordinator {
    GLOBAL.get_or_init(Coordinator::default)
}
