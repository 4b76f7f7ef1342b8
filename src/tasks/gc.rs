//! Periodic Eviction Task
//!
//! Background task that forces the global eviction pass on a timer, so
//! cached storage shrinks back under budget even when no requests are
//! arriving to trigger passes.

use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::clock::Duration;
use crate::coordinator::Coordinator;

/// Spawns a background task that forces a global eviction pass at a fixed
/// interval.
///
/// The task runs in an infinite loop, sleeping for the specified interval
/// between passes.
///
/// # Arguments
/// * `coordinator` - Coordinator whose origins are swept
/// * `every` - Interval between passes
///
/// # Returns
/// A JoinHandle for the spawned task, which can be used to abort the task
/// during graceful shutdown.
pub fn spawn_gc_task(coordinator: Coordinator, every: Duration) -> JoinHandle<()> {
    let interval = std::time::Duration::from_millis(every.as_millis().max(0) as u64);

    tokio::spawn(async move {
        info!("Starting eviction task with interval of {:?}", interval);

        loop {
            // Sleep for the configured interval
            tokio::time::sleep(interval).await;

            match coordinator.run_gc().await {
                Ok(total) => {
                    debug!("Eviction pass complete: {} bytes cached", total.get());
                }
                Err(error) => {
                    info!("Eviction pass failed: {}", error);
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{ByteCount, ManualClock};
    use crate::config::{Config, Options};
    use crate::error::Result;
    use crate::fetch::{Fetcher, NoThrottle, RequestInit};
    use bytes::Bytes;
    use futures::future::BoxFuture;
    use futures::FutureExt;
    use http::header::CACHE_CONTROL;
    use http::{HeaderValue, Response};
    use std::sync::Arc;
    use url::Url;

    /// Always returns a long-lived 16-byte cacheable body.
    struct ChunkFetcher;

    impl Fetcher for ChunkFetcher {
        fn fetch(&self, _url: Url, _init: RequestInit) -> BoxFuture<'static, Result<Response<Bytes>>> {
            async move {
                let mut response = Response::new(Bytes::from_static(b"0123456789abcdef"));
                response
                    .headers_mut()
                    .insert(CACHE_CONTROL, HeaderValue::from_static("max-age=3600"));
                Ok(response)
            }
            .boxed()
        }
    }

    fn small_budget_coordinator() -> (Coordinator, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new());
        let options = Options {
            config: Config {
                gc_interval: Duration::from_secs(3600),
                // Generous per-origin budgets; only the global budget binds
                max_storage_bytes: ByteCount::bytes(16),
                max_storage_per_target_bytes: ByteCount::bytes(64),
            },
            fetcher: Arc::new(ChunkFetcher),
            throttle: Arc::new(NoThrottle),
            clock: Arc::clone(&clock) as Arc<dyn crate::clock::Clock>,
        };
        (Coordinator::new(options), clock)
    }

    #[tokio::test]
    async fn test_gc_task_trims_over_budget_storage() {
        let (coordinator, _clock) = small_budget_coordinator();

        // 16 cached bytes per origin against a 16-byte global budget
        coordinator.fetch("http://one.test/a").await.unwrap();
        coordinator.fetch("http://two.test/a").await.unwrap();

        let handle = spawn_gc_task(coordinator.clone(), Duration::from_millis(20));
        tokio::time::sleep(std::time::Duration::from_millis(80)).await;

        let stats = coordinator.stats().await;
        assert!(stats.evictions >= 1, "over-budget entry should be evicted");
        assert!(coordinator.weight().await <= ByteCount::bytes(16));

        handle.abort();
    }

    #[tokio::test]
    async fn test_gc_task_preserves_storage_within_budget() {
        let (coordinator, _clock) = small_budget_coordinator();

        coordinator.fetch("http://origin.test/a").await.unwrap();

        let handle = spawn_gc_task(coordinator.clone(), Duration::from_millis(20));
        tokio::time::sleep(std::time::Duration::from_millis(80)).await;

        let total = coordinator.run_gc().await.unwrap();
        assert_eq!(total, ByteCount::bytes(16));

        handle.abort();
    }

    #[tokio::test]
    async fn test_gc_task_can_be_aborted() {
        let (coordinator, _clock) = small_budget_coordinator();

        let handle = spawn_gc_task(coordinator, Duration::from_millis(20));
        handle.abort();

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(handle.is_finished(), "Task should be finished after abort");
    }
}
