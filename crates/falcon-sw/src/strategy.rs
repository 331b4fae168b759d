//! The three resolution policies.
//!
//! Every network call goes through [`StrategyContext::network`], which applies
//! the configured deadline. Only 2xx responses to GET requests are ever
//! written, and always into the dynamic bucket.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use falcon_common::with_timeout;
use falcon_net::{Request, Response};
use http::Method;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};
use url::Url;

use crate::cache::{request_key, CacheEntry, CacheStore};
use crate::config::BucketNames;
use crate::fetch::Fetcher;
use crate::route::Strategy;
use crate::{Result, SwError};

/// Where a resolved response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseSource {
    /// A current bucket held the requested URL.
    Cache,
    /// Fresh from the network.
    Network,
    /// The cached root document, served in place of a failed navigation.
    Fallback,
}

/// Result of resolving an intercepted request.
#[derive(Debug, Clone)]
pub struct FetchOutcome {
    pub response: Response,
    pub source: ResponseSource,
    pub strategy: Strategy,
}

impl FetchOutcome {
    fn new(response: Response, source: ResponseSource, strategy: Strategy) -> Self {
        Self {
            response,
            source,
            strategy,
        }
    }
}

/// Work that outlives the request it was started for (revalidations).
#[derive(Debug, Default)]
pub struct BackgroundTasks {
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl BackgroundTasks {
    fn spawn<F>(&self, task: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(task);
        if let Ok(mut handles) = self.handles.lock() {
            handles.retain(|h| !h.is_finished());
            handles.push(handle);
        }
    }

    /// Wait for every task spawned so far.
    pub async fn settle(&self) {
        let handles = match self.handles.lock() {
            Ok(mut handles) => std::mem::take(&mut *handles),
            Err(_) => return,
        };
        for handle in handles {
            if let Err(e) = handle.await {
                error!(error = %e, "Background task panicked");
            }
        }
    }

    /// Number of tasks still running.
    pub fn pending(&self) -> usize {
        self.handles
            .lock()
            .map(|handles| handles.iter().filter(|h| !h.is_finished()).count())
            .unwrap_or_default()
    }
}

/// Capabilities and settings shared by the strategies.
#[derive(Clone)]
pub struct StrategyContext {
    pub store: Arc<dyn CacheStore>,
    pub fetcher: Arc<dyn Fetcher>,
    pub buckets: BucketNames,
    pub root_document: Url,
    pub fetch_timeout: Option<Duration>,
    pub background: Arc<BackgroundTasks>,
}

impl StrategyContext {
    /// Look up a URL in the current buckets, static first.
    pub async fn lookup(&self, url: &Url) -> Option<Response> {
        for bucket in [&self.buckets.static_name, &self.buckets.dynamic_name] {
            if let Some(response) = self.lookup_in(bucket, url).await {
                return Some(response);
            }
        }
        None
    }

    /// Look up a URL in a single bucket.
    pub async fn lookup_in(&self, bucket: &str, url: &Url) -> Option<Response> {
        let key = request_key(url);
        match self.store.match_in(bucket, &key).await {
            Ok(Some(entry)) => match entry.to_response() {
                Ok(response) => Some(response),
                Err(e) => {
                    warn!(bucket = %bucket, key = %key, error = %e, "Unreadable cache entry");
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                warn!(bucket = %bucket, key = %key, error = %e, "Cache lookup failed");
                None
            }
        }
    }

    /// Fetch from the network under the configured deadline.
    pub async fn network(&self, request: Request) -> Result<Response> {
        let fetcher = Arc::clone(&self.fetcher);
        match self.fetch_timeout {
            Some(timeout) => with_timeout(timeout, || async move { fetcher.fetch(request).await })
                .await?
                .map_err(SwError::from),
            None => fetcher.fetch(request).await.map_err(SwError::from),
        }
    }

    /// Store a clone of a successful GET response in the dynamic bucket.
    ///
    /// Write failures are logged, never returned. Returns whether an entry
    /// was written.
    pub async fn store_dynamic(&self, request: &Request, response: &Response) -> bool {
        if !response.ok() || request.method != Method::GET {
            debug!(url = %request.url, status = %response.status, method = %request.method, "Not caching response");
            return false;
        }

        let entry = CacheEntry::capture(&request.url, &request.method, response);
        match self.store.put(&self.buckets.dynamic_name, entry).await {
            Ok(()) => true,
            Err(e) => {
                warn!(url = %request.url, error = %e, "Cache write failed");
                false
            }
        }
    }

    async fn root_fallback(&self) -> Option<Response> {
        self.lookup(&self.root_document).await
    }
}

/// Requests other than GET never match a cached entry: they go to the
/// network, and a network failure is returned as is.
async fn pass_through(ctx: &StrategyContext, request: Request, strategy: Strategy) -> Result<FetchOutcome> {
    debug!(url = %request.url, method = %request.method, "Bypassing cache");
    let response = ctx.network(request).await?;
    Ok(FetchOutcome::new(response, ResponseSource::Network, strategy))
}

/// Serve from cache unconditionally; fetch and store on a miss.
pub async fn cache_first(ctx: &StrategyContext, request: Request) -> Result<FetchOutcome> {
    if request.method != Method::GET {
        return pass_through(ctx, request, Strategy::CacheFirst).await;
    }
    if let Some(cached) = ctx.lookup(&request.url).await {
        debug!(url = %request.url, "Cache-first hit");
        return Ok(FetchOutcome::new(cached, ResponseSource::Cache, Strategy::CacheFirst));
    }

    let is_navigation = request.is_navigation();
    let url = request.url.clone();
    match ctx.network(request.clone()).await {
        Ok(response) => {
            ctx.store_dynamic(&request, &response).await;
            Ok(FetchOutcome::new(response, ResponseSource::Network, Strategy::CacheFirst))
        }
        Err(e) => {
            error!(url = %url, error = %e, "Cache-first failed");
            if is_navigation {
                if let Some(root) = ctx.root_fallback().await {
                    return Ok(FetchOutcome::new(root, ResponseSource::Fallback, Strategy::CacheFirst));
                }
            }
            Err(e)
        }
    }
}

/// Try the network; fall back to whatever the cache holds.
pub async fn network_first(ctx: &StrategyContext, request: Request) -> Result<FetchOutcome> {
    if request.method != Method::GET {
        return pass_through(ctx, request, Strategy::NetworkFirst).await;
    }
    match ctx.network(request.clone()).await {
        Ok(response) => {
            ctx.store_dynamic(&request, &response).await;
            Ok(FetchOutcome::new(response, ResponseSource::Network, Strategy::NetworkFirst))
        }
        Err(e) => {
            debug!(url = %request.url, error = %e, "Network failed, trying cache");
            match ctx.lookup(&request.url).await {
                Some(cached) => Ok(FetchOutcome::new(cached, ResponseSource::Cache, Strategy::NetworkFirst)),
                None => Err(e),
            }
        }
    }
}

/// Serve the dynamic bucket's copy now and refresh it in the background;
/// with no copy, wait for the network and fall back to the root document.
///
/// Only the dynamic bucket is read, since that is where refreshes land.
pub async fn stale_while_revalidate(ctx: &StrategyContext, request: Request) -> Result<FetchOutcome> {
    if request.method != Method::GET {
        return pass_through(ctx, request, Strategy::StaleWhileRevalidate).await;
    }

    if let Some(cached) = ctx.lookup_in(&ctx.buckets.dynamic_name, &request.url).await {
        debug!(url = %request.url, "Serving stale, revalidating in background");
        let background = ctx.clone();
        ctx.background.spawn(async move {
            match background.network(request.clone()).await {
                Ok(response) => {
                    background.store_dynamic(&request, &response).await;
                }
                Err(e) => debug!(url = %request.url, error = %e, "Revalidation failed"),
            }
        });
        return Ok(FetchOutcome::new(
            cached,
            ResponseSource::Cache,
            Strategy::StaleWhileRevalidate,
        ));
    }

    match ctx.network(request.clone()).await {
        Ok(response) => {
            ctx.store_dynamic(&request, &response).await;
            Ok(FetchOutcome::new(
                response,
                ResponseSource::Network,
                Strategy::StaleWhileRevalidate,
            ))
        }
        Err(e) => {
            debug!(url = %request.url, error = %e, "Network failed with nothing cached");
            match ctx.root_fallback().await {
                Some(root) => Ok(FetchOutcome::new(
                    root,
                    ResponseSource::Fallback,
                    Strategy::StaleWhileRevalidate,
                )),
                None => Err(e),
            }
        }
    }
}

/// Dispatch to the policy for `strategy`.
pub async fn resolve(ctx: &StrategyContext, strategy: Strategy, request: Request) -> Result<FetchOutcome> {
    match strategy {
        Strategy::CacheFirst => cache_first(ctx, request).await,
        Strategy::NetworkFirst => network_first(ctx, request).await,
        Strategy::StaleWhileRevalidate => stale_while_revalidate(ctx, request).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCacheStore;
    use async_trait::async_trait;
    use falcon_net::{Destination, NetError};
    use http::{HeaderMap, StatusCode};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Notify;

    /// Answers every request with a fixed status, or fails when offline.
    struct StubFetcher {
        status: StatusCode,
        body: &'static str,
        online: bool,
        calls: AtomicUsize,
        gate: Option<Arc<Notify>>,
    }

    impl StubFetcher {
        fn online(status: StatusCode, body: &'static str) -> Self {
            Self {
                status,
                body,
                online: true,
                calls: AtomicUsize::new(0),
                gate: None,
            }
        }

        fn offline() -> Self {
            Self {
                online: false,
                ..Self::online(StatusCode::OK, "")
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Fetcher for StubFetcher {
        async fn fetch(&self, request: Request) -> std::result::Result<Response, NetError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            if !self.online {
                return Err(NetError::RequestFailed("offline".to_string()));
            }
            Ok(Response::new(request.url, self.status, HeaderMap::new(), self.body))
        }
    }

    /// Answers with "v0", "v1", ... so refreshes are visible.
    #[derive(Default)]
    struct VersionedFetcher {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Fetcher for VersionedFetcher {
        async fn fetch(&self, request: Request) -> std::result::Result<Response, NetError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(Response::new(request.url, StatusCode::OK, HeaderMap::new(), format!("v{n}")))
        }
    }

    fn context(store: Arc<MemoryCacheStore>, fetcher: Arc<dyn Fetcher>) -> StrategyContext {
        StrategyContext {
            store,
            fetcher,
            buckets: BucketNames::new("", "v1.0.0"),
            root_document: Url::parse("http://localhost:3000/index.html").unwrap(),
            fetch_timeout: Some(Duration::from_secs(5)),
            background: Arc::new(BackgroundTasks::default()),
        }
    }

    async fn seed(store: &MemoryCacheStore, bucket: &str, url: &str, body: &str) {
        let url = Url::parse(url).unwrap();
        let response = Response::new(url.clone(), StatusCode::OK, HeaderMap::new(), body.to_string());
        store
            .put(bucket, CacheEntry::capture(&url, &Method::GET, &response))
            .await
            .unwrap();
    }

    fn get(url: &str) -> Request {
        Request::get(Url::parse(url).unwrap())
    }

    #[tokio::test]
    async fn test_cache_first_hit_skips_network() {
        let store = Arc::new(MemoryCacheStore::new());
        let fetcher = Arc::new(StubFetcher::online(StatusCode::OK, "fresh"));
        seed(&store, "static-v1.0.0", "http://localhost:3000/src/App.css", "cached").await;
        let ctx = context(store, fetcher.clone());

        let outcome = cache_first(&ctx, get("http://localhost:3000/src/App.css").destination(Destination::Style))
            .await
            .unwrap();

        assert_eq!(outcome.source, ResponseSource::Cache);
        assert_eq!(outcome.response.body().as_ref(), b"cached");
        assert_eq!(fetcher.calls(), 0);
    }

    #[tokio::test]
    async fn test_cache_first_miss_stores_in_dynamic() {
        let store = Arc::new(MemoryCacheStore::new());
        let fetcher = Arc::new(StubFetcher::online(StatusCode::OK, "fresh"));
        let ctx = context(store.clone(), fetcher.clone());

        let outcome = cache_first(&ctx, get("http://localhost:3000/logo.svg")).await.unwrap();

        assert_eq!(outcome.source, ResponseSource::Network);
        assert_eq!(store.entry_count("dynamic-v1.0.0").await, Some(1));
        assert_eq!(store.entry_count("static-v1.0.0").await, None);
    }

    #[tokio::test]
    async fn test_error_status_not_cached() {
        let store = Arc::new(MemoryCacheStore::new());
        let fetcher = Arc::new(StubFetcher::online(StatusCode::NOT_FOUND, "missing"));
        let ctx = context(store.clone(), fetcher);

        let outcome = cache_first(&ctx, get("http://localhost:3000/nope.png")).await.unwrap();
        assert_eq!(outcome.response.status, StatusCode::NOT_FOUND);

        let outcome = network_first(&ctx, get("http://localhost:3000/api/pecas")).await.unwrap();
        assert_eq!(outcome.response.status, StatusCode::NOT_FOUND);

        assert!(store.keys().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_post_is_not_cached() {
        let store = Arc::new(MemoryCacheStore::new());
        let fetcher = Arc::new(StubFetcher::online(StatusCode::CREATED, "{}"));
        let ctx = context(store.clone(), fetcher);

        let request = Request::post(
            Url::parse("http://localhost:3000/api/cotacao").unwrap(),
            bytes::Bytes::from_static(b"{}"),
        );
        network_first(&ctx, request).await.unwrap();
        assert!(store.keys().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cache_first_offline_non_navigation_propagates() {
        let store = Arc::new(MemoryCacheStore::new());
        seed(&store, "static-v1.0.0", "http://localhost:3000/index.html", "<html>").await;
        let ctx = context(store, Arc::new(StubFetcher::offline()));

        let result = cache_first(&ctx, get("http://localhost:3000/icons/missing.png")).await;
        assert!(matches!(result, Err(SwError::Network(_))));
    }

    #[tokio::test]
    async fn test_cache_first_offline_navigation_falls_back_to_root() {
        let store = Arc::new(MemoryCacheStore::new());
        seed(&store, "static-v1.0.0", "http://localhost:3000/index.html", "<html>").await;
        let ctx = context(store, Arc::new(StubFetcher::offline()));

        let request = Request::navigate(Url::parse("http://localhost:3000/usuarios").unwrap());
        let outcome = cache_first(&ctx, request).await.unwrap();
        assert_eq!(outcome.source, ResponseSource::Fallback);
        assert_eq!(outcome.response.body().as_ref(), b"<html>");
    }

    #[tokio::test]
    async fn test_network_first_falls_back_to_cache() {
        let store = Arc::new(MemoryCacheStore::new());
        seed(&store, "dynamic-v1.0.0", "http://localhost:3000/api/pecas", "[1]").await;
        let ctx = context(store, Arc::new(StubFetcher::offline()));

        let outcome = network_first(&ctx, get("http://localhost:3000/api/pecas")).await.unwrap();
        assert_eq!(outcome.source, ResponseSource::Cache);
        assert_eq!(outcome.response.body().as_ref(), b"[1]");

        let missing = network_first(&ctx, get("http://localhost:3000/api/outros")).await;
        assert!(missing.is_err());
    }

    #[tokio::test]
    async fn test_stale_while_revalidate_does_not_wait() {
        let store = Arc::new(MemoryCacheStore::new());
        seed(&store, "dynamic-v1.0.0", "http://localhost:3000/catalogo", "old").await;
        let gate = Arc::new(Notify::new());
        let fetcher = Arc::new(StubFetcher {
            gate: Some(gate.clone()),
            ..StubFetcher::online(StatusCode::OK, "new")
        });
        let ctx = context(store.clone(), fetcher);

        let request = Request::navigate(Url::parse("http://localhost:3000/catalogo").unwrap());
        let outcome = tokio::time::timeout(Duration::from_secs(1), stale_while_revalidate(&ctx, request))
            .await
            .expect("stale copy served without waiting for the network")
            .unwrap();
        assert_eq!(outcome.response.body().as_ref(), b"old");

        gate.notify_one();
        ctx.background.settle().await;

        let refreshed = ctx
            .lookup(&Url::parse("http://localhost:3000/catalogo").unwrap())
            .await
            .unwrap();
        assert_eq!(refreshed.body().as_ref(), b"new");
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_a_network_failure() {
        let store = Arc::new(MemoryCacheStore::new());
        seed(&store, "dynamic-v1.0.0", "http://localhost:3000/api/pecas", "cached").await;
        // never released
        let fetcher = Arc::new(StubFetcher {
            gate: Some(Arc::new(Notify::new())),
            ..StubFetcher::online(StatusCode::OK, "late")
        });
        let ctx = context(store, fetcher);

        let outcome = network_first(&ctx, get("http://localhost:3000/api/pecas")).await.unwrap();
        assert_eq!(outcome.source, ResponseSource::Cache);
        assert_eq!(outcome.response.body().as_ref(), b"cached");
    }

    #[tokio::test]
    async fn test_stale_while_revalidate_serves_refreshed_copy() {
        let store = Arc::new(MemoryCacheStore::new());
        seed(&store, "static-v1.0.0", "http://localhost:3000/", "install").await;
        let ctx = context(store, Arc::new(VersionedFetcher::default()));
        let root = Url::parse("http://localhost:3000/").unwrap();

        let mut bodies = Vec::new();
        for _ in 0..3 {
            let outcome = stale_while_revalidate(&ctx, Request::navigate(root.clone()))
                .await
                .unwrap();
            bodies.push(outcome.response.text().unwrap());
            ctx.background.settle().await;
        }

        // first visit waits for the network, later ones get the last refresh
        assert_eq!(bodies, vec!["v0", "v0", "v1"]);
    }

    #[tokio::test]
    async fn test_online_post_reaches_network_despite_cached_get() {
        let store = Arc::new(MemoryCacheStore::new());
        seed(&store, "static-v1.0.0", "http://localhost:3000/contato", "form page").await;
        let fetcher = Arc::new(StubFetcher::online(StatusCode::CREATED, "enviado"));
        let ctx = context(store.clone(), fetcher.clone());

        let request = Request::post(
            Url::parse("http://localhost:3000/contato").unwrap(),
            bytes::Bytes::from_static(b"nome=Ana"),
        );
        let outcome = cache_first(&ctx, request).await.unwrap();

        assert_eq!(outcome.source, ResponseSource::Network);
        assert_eq!(outcome.response.status, StatusCode::CREATED);
        assert_eq!(fetcher.calls(), 1);
        assert_eq!(store.entry_count("dynamic-v1.0.0").await, None);
    }

    #[tokio::test]
    async fn test_offline_post_is_not_answered_from_cache() {
        let store = Arc::new(MemoryCacheStore::new());
        seed(&store, "dynamic-v1.0.0", "http://localhost:3000/api/cotacao", "list of cotacoes").await;
        seed(&store, "static-v1.0.0", "http://localhost:3000/index.html", "<html>").await;
        let ctx = context(store, Arc::new(StubFetcher::offline()));
        let url = Url::parse("http://localhost:3000/api/cotacao").unwrap();
        let post = || Request::post(url.clone(), bytes::Bytes::from_static(b"{}"));

        assert!(matches!(network_first(&ctx, post()).await, Err(SwError::Network(_))));
        assert!(matches!(cache_first(&ctx, post()).await, Err(SwError::Network(_))));
        assert!(matches!(
            stale_while_revalidate(&ctx, post()).await,
            Err(SwError::Network(_))
        ));
    }
}
