//! Cache layer that orchestrates caching strategies with network fetching.

use std::future::Future;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::{AgentError, AgentResult};
use crate::network::{Request, Response};

use super::key::RequestKey;
use super::result::{CacheResult, CachedEntry};
use super::storage::{CacheStorage, StoreHandle};

/// Cache layer implementing the cache-first and network-first strategies.
///
/// This layer sits between the request interceptor and the network client.
/// The network is tried at most once per request; recovery comes from the
/// store, never from retrying. Store failures degrade to a miss on reads and
/// to a dropped write on puts.
pub struct CacheLayer<S: CacheStorage> {
  storage: Arc<S>,
  /// Precached page served when a navigation cannot be answered otherwise
  offline_document: Option<RequestKey>,
}

impl<S: CacheStorage> CacheLayer<S> {
  /// Create a new cache layer over the given storage backend.
  pub fn new(storage: Arc<S>) -> Self {
    Self {
      storage,
      offline_document: None,
    }
  }

  pub fn with_offline_document(mut self, key: RequestKey) -> Self {
    self.offline_document = Some(key);
    self
  }

  /// Fetch with the cache-first strategy.
  ///
  /// 1. Check the store - if present, return immediately (no revalidation)
  /// 2. On miss, fetch from network and store a successful response
  /// 3. On network failure, serve the offline document for navigations
  pub async fn cache_first<F, Fut>(
    &self,
    store: &StoreHandle,
    request: &Request,
    fetcher: F,
  ) -> AgentResult<CacheResult<Response>>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = AgentResult<Response>>,
  {
    let key = RequestKey::for_request(request);

    if let Some(cached) = self.lookup(store, &key) {
      debug!(%key, "cache hit");
      return Ok(CacheResult::from_cache(cached.response, cached.cached_at));
    }

    match fetcher().await {
      Ok(response) => {
        self.remember(store, &key, &response);
        Ok(CacheResult::from_network(response))
      }
      Err(err) => {
        warn!(%key, error = %err, "network failed on cache miss");
        if request.is_navigation() {
          if let Some(page) = self.offline_page(store) {
            return Ok(page);
          }
        }
        Err(AgentError::exhausted(key.url(), err))
      }
    }
  }

  /// Fetch with the network-first strategy.
  ///
  /// 1. Try the network - on success refresh the stored copy and return
  /// 2. On failure, serve the stored copy of the same request
  /// 3. Otherwise serve the offline document
  pub async fn network_first<F, Fut>(
    &self,
    store: &StoreHandle,
    request: &Request,
    fetcher: F,
  ) -> AgentResult<CacheResult<Response>>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = AgentResult<Response>>,
  {
    let key = RequestKey::for_request(request);

    match fetcher().await {
      Ok(response) => {
        self.remember(store, &key, &response);
        Ok(CacheResult::from_network(response))
      }
      Err(err) => {
        warn!(%key, error = %err, "network failed, falling back to store");
        if let Some(cached) = self.lookup(store, &key) {
          return Ok(CacheResult::offline(cached.response, cached.cached_at));
        }
        if let Some(page) = self.offline_page(store) {
          return Ok(page);
        }
        Err(AgentError::exhausted(key.url(), err))
      }
    }
  }

  /// Store read that treats a failing backend as a miss.
  fn lookup(&self, store: &StoreHandle, key: &RequestKey) -> Option<CachedEntry> {
    match self.storage.get(store, key) {
      Ok(entry) => entry,
      Err(e) => {
        warn!(%key, store = store.name(), error = %e, "store read failed, treating as miss");
        None
      }
    }
  }

  /// Best-effort store write; never blocks serving the response.
  fn remember(&self, store: &StoreHandle, key: &RequestKey, response: &Response) {
    if !response.is_cacheable() {
      debug!(%key, status = response.status, "not caching unsuccessful response");
      return;
    }
    match self.storage.put(store, key, response) {
      Ok(_) => debug!(%key, store = store.name(), "cached"),
      Err(e) => warn!(%key, store = store.name(), error = %e, "store write dropped"),
    }
  }

  fn offline_page(&self, store: &StoreHandle) -> Option<CacheResult<Response>> {
    let key = self.offline_document.as_ref()?;
    let cached = self.lookup(store, key)?;
    debug!(%key, "serving offline document");
    Some(CacheResult::offline_document(cached.response, cached.cached_at))
  }
}

impl<S: CacheStorage> Clone for CacheLayer<S> {
  fn clone(&self) -> Self {
    Self {
      storage: Arc::clone(&self.storage),
      offline_document: self.offline_document.clone(),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::storage::SqliteStorage;
  use crate::cache::CacheSource;
  use crate::network::scripted::ScriptedFetcher;
  use crate::network::Fetch;
  use color_eyre::{eyre::eyre, Result};
  use url::Url;

  const ORIGIN: &str = "https://example.com";

  fn url(path: &str) -> Url {
    Url::parse(ORIGIN).unwrap().join(path).unwrap()
  }

  struct Fixture {
    storage: Arc<SqliteStorage>,
    store: StoreHandle,
    layer: CacheLayer<SqliteStorage>,
    network: ScriptedFetcher,
  }

  fn fixture() -> Fixture {
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    let store = storage.open("site-v1").unwrap();
    let layer = CacheLayer::new(Arc::clone(&storage))
      .with_offline_document(RequestKey::from_url(&url("/offline.html")));
    Fixture {
      storage,
      store,
      layer,
      network: ScriptedFetcher::new(),
    }
  }

  impl Fixture {
    fn seed(&self, path: &str, body: &str) {
      self
        .storage
        .put(
          &self.store,
          &RequestKey::from_url(&url(path)),
          &Response::new(200, body),
        )
        .unwrap();
    }

    async fn cache_first(&self, request: &Request) -> AgentResult<CacheResult<Response>> {
      self
        .layer
        .cache_first(&self.store, request, || self.network.fetch(request))
        .await
    }

    async fn network_first(&self, request: &Request) -> AgentResult<CacheResult<Response>> {
      self
        .layer
        .network_first(&self.store, request, || self.network.fetch(request))
        .await
    }
  }

  #[tokio::test]
  async fn test_cache_first_hit_skips_network() {
    let f = fixture();
    f.seed("/app.css", "cached");

    let result = f.cache_first(&Request::get(url("/app.css"))).await.unwrap();

    assert_eq!(result.source, CacheSource::Cache);
    assert_eq!(result.data.body, b"cached".to_vec());
    assert!(result.cached_at.is_some());
    assert_eq!(f.network.call_count(), 0);
  }

  #[tokio::test]
  async fn test_cache_first_miss_fetches_and_stores() {
    let f = fixture();
    f.network
      .respond(url("/logo.png").as_str(), Response::new(200, vec![1, 2, 3]));

    let first = f.cache_first(&Request::get(url("/logo.png"))).await.unwrap();
    assert_eq!(first.source, CacheSource::Network);

    f.network.set_online(false);
    let second = f.cache_first(&Request::get(url("/logo.png"))).await.unwrap();

    assert_eq!(second.source, CacheSource::Cache);
    assert_eq!(second.data.body, vec![1, 2, 3]);
    assert_eq!(f.network.calls_to(url("/logo.png").as_str()), 1);
  }

  #[tokio::test]
  async fn test_cache_first_does_not_store_errors() {
    let f = fixture();
    f.network
      .respond(url("/broken.png").as_str(), Response::new(503, "busy"));

    let result = f.cache_first(&Request::get(url("/broken.png"))).await.unwrap();

    assert_eq!(result.data.status, 503);
    assert_eq!(f.storage.entry_count(&f.store).unwrap(), 0);
  }

  #[tokio::test]
  async fn test_cache_first_offline_miss_propagates() {
    let f = fixture();
    f.seed("/offline.html", "offline");
    f.network.set_online(false);

    let err = f
      .cache_first(&Request::get(url("/photo.jpg")))
      .await
      .unwrap_err();

    assert!(matches!(err, AgentError::Exhausted { .. }));
  }

  #[tokio::test]
  async fn test_cache_first_offline_navigation_gets_offline_document() {
    let f = fixture();
    f.seed("/offline.html", "offline");
    f.network.set_online(false);

    let result = f
      .cache_first(&Request::navigate(url("/images/big.jpg")))
      .await
      .unwrap();

    assert_eq!(result.source, CacheSource::OfflineDocument);
    assert_eq!(result.data.body, b"offline".to_vec());
  }

  #[tokio::test]
  async fn test_network_first_refreshes_then_serves_stale() {
    let f = fixture();
    f.seed("/", "old");
    f.network.respond(url("/").as_str(), Response::new(200, "live"));

    let live = f.network_first(&Request::navigate(url("/"))).await.unwrap();
    assert_eq!(live.source, CacheSource::Network);
    assert_eq!(live.data.body, b"live".to_vec());

    f.network.set_online(false);
    let stale = f.network_first(&Request::navigate(url("/"))).await.unwrap();

    assert_eq!(stale.source, CacheSource::Offline);
    assert_eq!(stale.data.body, b"live".to_vec());
  }

  #[tokio::test]
  async fn test_network_first_error_status_is_returned_not_stored() {
    let f = fixture();
    f.seed("/about.html", "cached about");
    f.network
      .respond(url("/about.html").as_str(), Response::new(500, "oops"));

    let result = f
      .network_first(&Request::navigate(url("/about.html")))
      .await
      .unwrap();

    assert_eq!(result.source, CacheSource::Network);
    assert_eq!(result.data.status, 500);
    let stored = f
      .storage
      .get(&f.store, &RequestKey::from_url(&url("/about.html")))
      .unwrap()
      .unwrap();
    assert_eq!(stored.response.body, b"cached about".to_vec());
  }

  #[tokio::test]
  async fn test_network_first_falls_back_to_offline_document() {
    let f = fixture();
    f.seed("/offline.html", "offline");
    f.network.set_online(false);

    let result = f
      .network_first(&Request::navigate(url("/never-seen")))
      .await
      .unwrap();

    assert_eq!(result.source, CacheSource::OfflineDocument);
  }

  #[tokio::test]
  async fn test_network_first_exhausted() {
    let f = fixture();
    f.network.set_online(false);

    let err = f
      .network_first(&Request::navigate(url("/never-seen")))
      .await
      .unwrap_err();

    assert!(err.is_network());
    assert!(matches!(err, AgentError::Exhausted { .. }));
  }

  /// Backend whose every operation fails.
  struct BrokenStorage;

  impl CacheStorage for BrokenStorage {
    fn open(&self, _name: &str) -> Result<StoreHandle> {
      Err(eyre!("disk gone"))
    }
    fn store_names(&self) -> Result<Vec<String>> {
      Err(eyre!("disk gone"))
    }
    fn get(&self, _store: &StoreHandle, _key: &RequestKey) -> Result<Option<CachedEntry>> {
      Err(eyre!("disk gone"))
    }
    fn put(&self, _store: &StoreHandle, _key: &RequestKey, _response: &Response) -> Result<bool> {
      Err(eyre!("disk gone"))
    }
    fn put_all(&self, _name: &str, _entries: &[(RequestKey, Response)]) -> Result<StoreHandle> {
      Err(eyre!("disk gone"))
    }
    fn entry_count(&self, _store: &StoreHandle) -> Result<usize> {
      Err(eyre!("disk gone"))
    }
    fn delete(&self, _name: &str) -> Result<bool> {
      Err(eyre!("disk gone"))
    }
    fn active_store(&self) -> Result<Option<String>> {
      Err(eyre!("disk gone"))
    }
    fn set_active_store(&self, _name: &str) -> Result<()> {
      Err(eyre!("disk gone"))
    }
  }

  #[tokio::test]
  async fn test_broken_store_still_serves_network() {
    let working = SqliteStorage::open_in_memory().unwrap();
    let store = working.open("site-v1").unwrap();
    let layer = CacheLayer::new(Arc::new(BrokenStorage));
    let network = ScriptedFetcher::new();
    network.respond(url("/app.js").as_str(), Response::new(200, "js"));
    let request = Request::get(url("/app.js"));

    let result = layer
      .cache_first(&store, &request, || network.fetch(&request))
      .await
      .unwrap();

    assert_eq!(result.source, CacheSource::Network);
    assert_eq!(result.data.body, b"js".to_vec());
  }
}
