//! Fetcher and throttle seams
//!
//! The cache core stays agnostic about how responses are actually
//! retrieved. Everything reaches the network through the [`Fetcher`]
//! trait, which lets callers plug in mocks for tests, offline sources, or
//! instrumented clients; the [`ThrottlePolicy`] trait wraps a fetcher with
//! a same-signature wrapper that may bound or delay calls.

use std::sync::Arc;

use bytes::Bytes;
use futures::future::BoxFuture;
use futures::FutureExt;
use http::{HeaderMap, Method, Response};
use tokio::sync::Semaphore;
use url::Url;

use crate::error::{FetchError, Result};

/// Per-request customization forwarded to the underlying fetcher.
#[derive(Debug, Clone)]
pub struct RequestInit {
    pub method: Method,
    pub headers: HeaderMap,
}

impl Default for RequestInit {
    fn default() -> Self {
        Self {
            method: Method::GET,
            headers: HeaderMap::new(),
        }
    }
}

/// The underlying HTTP fetch primitive.
///
/// Implementations must resolve with a fully buffered response; the cache
/// keys retention decisions off the body length, so streaming bodies are
/// not supported here.
pub trait Fetcher: Send + Sync {
    fn fetch(&self, url: Url, init: RequestInit) -> BoxFuture<'static, Result<Response<Bytes>>>;
}

/// Default fetcher backed by a shared reqwest client.
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    /// Uses an existing client (connection pool, proxy settings, ...).
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl Default for HttpFetcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Fetcher for HttpFetcher {
    fn fetch(&self, url: Url, init: RequestInit) -> BoxFuture<'static, Result<Response<Bytes>>> {
        let client = self.client.clone();
        async move {
            let mut request = client.request(init.method, url.as_str());
            for (name, value) in init.headers.iter() {
                request = request.header(name, value);
            }
            let upstream = request
                .send()
                .await
                .map_err(|e| FetchError::Transport(Box::new(e)))?;

            let status = upstream.status();
            let headers = upstream.headers().clone();
            let body = upstream
                .bytes()
                .await
                .map_err(|e| FetchError::Transport(Box::new(e)))?;

            let mut response = Response::new(body);
            *response.status_mut() = status;
            *response.headers_mut() = headers;
            Ok(response)
        }
        .boxed()
    }
}

/// Wraps a target's fetcher before first use.
///
/// The wrapper must preserve the fetcher signature; what it does inside
/// (bounding concurrency, backing off on failure) is its own business.
pub trait ThrottlePolicy: Send + Sync {
    fn wrap(&self, inner: Arc<dyn Fetcher>) -> Arc<dyn Fetcher>;
}

/// Identity wrapper; the fetcher is used as-is.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoThrottle;

impl ThrottlePolicy for NoThrottle {
    fn wrap(&self, inner: Arc<dyn Fetcher>) -> Arc<dyn Fetcher> {
        inner
    }
}

/// Bounds concurrent fetches through a wrapped fetcher.
///
/// Each `wrap` call creates a fresh semaphore, so the bound applies
/// per origin rather than process-wide.
#[derive(Debug, Clone, Copy)]
pub struct MaxInFlight {
    permits: usize,
}

impl MaxInFlight {
    pub fn new(permits: usize) -> Self {
        Self {
            permits: permits.max(1),
        }
    }
}

impl ThrottlePolicy for MaxInFlight {
    fn wrap(&self, inner: Arc<dyn Fetcher>) -> Arc<dyn Fetcher> {
        Arc::new(BoundedFetcher {
            inner,
            permits: Arc::new(Semaphore::new(self.permits)),
        })
    }
}

struct BoundedFetcher {
    inner: Arc<dyn Fetcher>,
    permits: Arc<Semaphore>,
}

impl Fetcher for BoundedFetcher {
    fn fetch(&self, url: Url, init: RequestInit) -> BoxFuture<'static, Result<Response<Bytes>>> {
        let inner = Arc::clone(&self.inner);
        let permits = Arc::clone(&self.permits);
        async move {
            let _permit = permits
                .acquire_owned()
                .await
                .map_err(|e| FetchError::Transport(Box::new(e)))?;
            inner.fetch(url, init).await
        }
        .boxed()
    }
}
