//! Cached, de-duplicated JSON fetching.
//!
//! Every upstream request goes through [`Fetcher::fetch_json`], keyed by its
//! full URL. Lookup order on each call:
//!
//! 1. volatile cache (L1),
//! 2. persistent cache (L2, unless the caller opts out),
//! 3. the in-flight table: a request already outstanding for the same key is
//!    joined instead of duplicated,
//! 4. a fresh network call, registered in the in-flight table until it settles.
//!
//! The in-flight table holds weak handles. A request stays alive only while
//! at least one caller is waiting on it, so when every waiter has been
//! cancelled the request itself is dropped and the next caller for that key
//! issues a new one.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared, WeakShared};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::CoreError;
use crate::cache::ResponseCache;
use crate::rate_limit::{RequestPacer, backoff_for, retry_after_header};

/// A raw upstream response.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    /// Parsed `Retry-After` advice, if the server sent one.
    pub retry_after: Option<Duration>,
    pub body: String,
}

/// The network seam: issues a single GET for a URL.
///
/// Errors are transport failures (DNS, TLS, timeouts); any HTTP status,
/// including errors, comes back as `Ok`.
pub trait Transport: Send + Sync {
    fn get<'a>(
        &'a self,
        url: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<HttpResponse, String>> + Send + 'a>>;
}

/// [`Transport`] backed by `reqwest`.
pub struct ReqwestTransport {
    client: reqwest::Client,
    api_token: Option<String>,
    timeout: Duration,
}

impl ReqwestTransport {
    pub fn new(api_token: Option<String>, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .pool_max_idle_per_host(8)
            .pool_idle_timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            client,
            api_token,
            timeout,
        }
    }
}

impl Transport for ReqwestTransport {
    fn get<'a>(
        &'a self,
        url: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<HttpResponse, String>> + Send + 'a>> {
        Box::pin(async move {
            let mut req = self
                .client
                .get(url)
                .header("Accept", "application/json")
                .header("User-Agent", concat!("costar/", env!("CARGO_PKG_VERSION")))
                .timeout(self.timeout);

            if let Some(ref token) = self.api_token {
                req = req.bearer_auth(token);
            }

            let resp = req.send().await.map_err(|e| e.to_string())?;
            let status = resp.status().as_u16();
            let retry_after = retry_after_header(resp.headers());
            let body = resp.text().await.map_err(|e| e.to_string())?;

            Ok(HttpResponse {
                status,
                retry_after,
                body,
            })
        })
    }
}

/// Per-call options for [`Fetcher::fetch_json`].
#[derive(Debug, Clone, Copy)]
pub struct FetchOptions {
    /// Read from and write to the persistent tier.
    pub persist: bool,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self { persist: true }
    }
}

type FetchFuture = BoxFuture<'static, Result<Arc<Value>, CoreError>>;

enum Lookup {
    Ready(Arc<Value>),
    Pending(Shared<FetchFuture>),
}

struct FetcherInner {
    transport: Arc<dyn Transport>,
    cache: Arc<ResponseCache>,
    limiter: Option<Arc<RequestPacer>>,
    inflight: DashMap<String, WeakShared<FetchFuture>>,
    network_calls: AtomicU64,
}

/// Shared JSON client with two-tier caching, request coalescing and a single
/// rate-limit retry. Cheap to clone.
#[derive(Clone)]
pub struct Fetcher {
    inner: Arc<FetcherInner>,
}

impl Fetcher {
    pub fn new(
        transport: Arc<dyn Transport>,
        cache: Arc<ResponseCache>,
        limiter: Option<Arc<RequestPacer>>,
    ) -> Self {
        Self {
            inner: Arc::new(FetcherInner {
                transport,
                cache,
                limiter,
                inflight: DashMap::new(),
                network_calls: AtomicU64::new(0),
            }),
        }
    }

    /// Fetch and parse the JSON document at `key`.
    ///
    /// Fails with [`CoreError::Cancelled`] if `cancel` is already signalled
    /// (no work is started) or becomes signalled while waiting. Cancelling
    /// one waiter does not disturb other waiters on the same key.
    pub async fn fetch_json(
        &self,
        key: &str,
        options: FetchOptions,
        cancel: &CancellationToken,
    ) -> Result<Arc<Value>, CoreError> {
        if cancel.is_cancelled() {
            return Err(CoreError::Cancelled);
        }

        if let Some(value) = self.inner.cache.get(key, options.persist) {
            return Ok(value);
        }

        let pending = match self.join_or_issue(key, options) {
            Lookup::Ready(value) => return Ok(value),
            Lookup::Pending(pending) => pending,
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                tracing::debug!(key, "fetch cancelled");
                Err(CoreError::Cancelled)
            }
            result = pending => result,
        }
    }

    /// [`fetch_json`](Self::fetch_json), then deserialize into `T`.
    pub async fn fetch_as<T: DeserializeOwned>(
        &self,
        key: &str,
        options: FetchOptions,
        cancel: &CancellationToken,
    ) -> Result<T, CoreError> {
        let value = self.fetch_json(key, options, cancel).await?;
        T::deserialize(value.as_ref()).map_err(|e| CoreError::Decode {
            key: key.to_string(),
            message: e.to_string(),
        })
    }

    /// Find the outstanding request for `key` or register a new one.
    ///
    /// The check and the registration happen under the same map-entry lock,
    /// so two callers can never both decide they are first.
    fn join_or_issue(&self, key: &str, options: FetchOptions) -> Lookup {
        match self.inner.inflight.entry(key.to_string()) {
            Entry::Occupied(mut entry) => {
                if let Some(shared) = entry.get().upgrade() {
                    tracing::debug!(key, "joining in-flight request");
                    return Lookup::Pending(shared);
                }
                // Every previous waiter gave up and the request was dropped.
                let shared = self.issue(key, options);
                if let Some(weak) = shared.downgrade() {
                    entry.insert(weak);
                }
                Lookup::Pending(shared)
            }
            Entry::Vacant(entry) => {
                // A request for this key may have settled between our cache
                // check and taking the entry lock.
                if let Some(value) = self.inner.cache.peek_volatile(key) {
                    return Lookup::Ready(value);
                }
                let shared = self.issue(key, options);
                if let Some(weak) = shared.downgrade() {
                    entry.insert(weak);
                }
                Lookup::Pending(shared)
            }
        }
    }

    fn issue(&self, key: &str, options: FetchOptions) -> Shared<FetchFuture> {
        let inner = Arc::clone(&self.inner);
        let key = key.to_string();
        let guard = InflightGuard {
            inner: Arc::clone(&inner),
            key: key.clone(),
        };
        async move {
            let _guard = guard;
            let result = inner.request(&key).await;
            if let Ok(ref value) = result {
                inner.cache.insert(&key, Arc::clone(value), options.persist);
            }
            // Cache first, then clear the entry: a caller that misses the
            // entry is guaranteed to see the cached payload.
            inner.inflight.remove(&key);
            result
        }
        .boxed()
        .shared()
    }

    /// The cache backing this fetcher.
    pub fn cache(&self) -> &Arc<ResponseCache> {
        &self.inner.cache
    }

    /// Number of requests handed to the transport (retries included).
    pub fn network_calls(&self) -> u64 {
        self.inner.network_calls.load(Ordering::Relaxed)
    }

    /// Number of keys with an outstanding request.
    pub fn inflight_len(&self) -> usize {
        self.inner.inflight.len()
    }
}

/// Lives inside an issued request. If every waiter gives up, the request is
/// dropped before it can clear its in-flight entry; the guard clears it then.
struct InflightGuard {
    inner: Arc<FetcherInner>,
    key: String,
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        // Only a dead handle is ours to remove; a live one belongs to a newer
        // request for the same key.
        self.inner
            .inflight
            .remove_if(&self.key, |_, weak| weak.upgrade().is_none());
    }
}

impl FetcherInner {
    /// Issue the network call, retrying once on 429.
    async fn request(&self, key: &str) -> Result<Arc<Value>, CoreError> {
        let mut retried = false;
        loop {
            if let Some(ref limiter) = self.limiter {
                limiter.acquire().await;
            }

            self.network_calls.fetch_add(1, Ordering::Relaxed);
            let resp = self
                .transport
                .get(key)
                .await
                .map_err(|message| CoreError::Transport {
                    key: key.to_string(),
                    message,
                })?;

            if resp.status == 429 {
                if let Some(ref limiter) = self.limiter {
                    limiter.on_rate_limited();
                }
                if !retried {
                    retried = true;
                    let wait = backoff_for(resp.retry_after);
                    tracing::info!(
                        key,
                        wait_secs = wait.as_secs_f64(),
                        "rate limited, retrying once"
                    );
                    tokio::time::sleep(wait).await;
                    continue;
                }
            }

            if !(200..300).contains(&resp.status) {
                return Err(CoreError::Http {
                    status: resp.status,
                    key: key.to_string(),
                });
            }

            let value: Value =
                serde_json::from_str(&resp.body).map_err(|e| CoreError::Decode {
                    key: key.to_string(),
                    message: e.to_string(),
                })?;
            return Ok(Arc::new(value));
        }
    }
}

impl std::fmt::Debug for Fetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fetcher")
            .field("cache", &self.inner.cache)
            .field("inflight", &self.inner.inflight.len())
            .field("network_calls", &self.network_calls())
            .finish()
    }
}
