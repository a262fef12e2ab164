//! The request interceptor: every outgoing request enters the agent here.
//!
//! Requests from clients the agent does not control, and requests classified
//! network-only, go straight to the network. Everything else is served by the
//! strategy matching its policy, against the active generation's store.

use color_eyre::{eyre::eyre, Result};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, warn};
use url::Url;

use crate::cache::{CacheLayer, CacheResult, CacheStorage, RequestKey};
use crate::commands::{AgentCommand, VersionReply};
use crate::config::Config;
use crate::error::AgentResult;
use crate::lifecycle::{self, ClientId, Generation, LifecycleController, LifecyclePhase};
use crate::network::{Fetch, Request, Response};
use crate::routes::{Policy, RouteRule, RouteTable};

pub struct Agent<S: CacheStorage> {
  origin: Url,
  namespace: String,
  version: String,
  precache: Vec<String>,
  routes: RouteTable,
  cache: CacheLayer<S>,
  storage: Arc<S>,
  network: Arc<dyn Fetch>,
  lifecycle: RwLock<LifecycleController<S>>,
}

impl<S: CacheStorage> Agent<S> {
  /// Build the agent for the configured generation, resuming whatever
  /// generations a previous run left in `storage`.
  pub fn new(config: &Config, storage: Arc<S>, network: Arc<dyn Fetch>) -> Result<Self> {
    let mut lifecycle = LifecycleController::new(Arc::clone(&storage), config.namespace.clone())
      .with_skip_waiting(config.skip_waiting)
      .with_claim_on_activate(config.claim_on_activate);
    lifecycle.restore(&config.version)?;

    let mut cache = CacheLayer::new(Arc::clone(&storage));
    if let Some(path) = &config.offline_document {
      let url = config
        .origin
        .join(path)
        .map_err(|e| eyre!("Invalid offline document {}: {}", path, e))?;
      cache = cache.with_offline_document(RequestKey::from_url(&url));
    }

    Ok(Self {
      origin: config.origin.clone(),
      namespace: config.namespace.clone(),
      version: config.version.clone(),
      precache: config.precache.clone(),
      routes: RouteTable::new(&config.origin, &config.precache, &config.routes),
      cache,
      storage,
      network,
      lifecycle: RwLock::new(lifecycle),
    })
  }

  /// Install the configured generation.
  ///
  /// The manifest is fetched without holding the lifecycle lock, so requests
  /// keep being served by the current generation meanwhile.
  pub async fn install(&self) -> AgentResult<LifecyclePhase> {
    let installation = lifecycle::precache(
      self.network.as_ref(),
      &self.origin,
      &self.namespace,
      &self.version,
      &self.precache,
    )
    .await?;
    debug!(store = installation.generation().store().name(), "precache fetched");

    let mut lifecycle = self.lifecycle.write().await;
    if let Err(e) = lifecycle.restore(&self.version) {
      warn!(error = %e, "could not re-read lifecycle state");
    }
    lifecycle.commit(installation)
  }

  /// Handle one outgoing request from `client`.
  pub async fn handle(&self, client: ClientId, request: &Request) -> AgentResult<CacheResult<Response>> {
    self.follow_activation().await;

    let store = {
      let lifecycle = self.lifecycle.read().await;
      if lifecycle.is_controlled(client) {
        lifecycle.current_store().cloned()
      } else {
        None
      }
    };

    let Some(store) = store else {
      debug!(url = %request.url, client, "client not controlled, passing through");
      return self.passthrough(request).await;
    };

    let policy = self.routes.classify(request);
    debug!(url = %request.url, method = %request.method, %policy, "intercepted");

    match policy {
      Policy::NetworkOnly => self.passthrough(request).await,
      Policy::PrecachePinned | Policy::LazyCacheable => {
        self
          .cache
          .cache_first(&store, request, || self.network.fetch(request))
          .await
      }
      Policy::NavigationFallback => {
        self
          .cache
          .network_first(&store, request, || self.network.fetch(request))
          .await
      }
    }
  }

  async fn passthrough(&self, request: &Request) -> AgentResult<CacheResult<Response>> {
    self
      .network
      .fetch(request)
      .await
      .map(CacheResult::passthrough)
  }

  pub async fn message(&self, command: AgentCommand) -> AgentResult<Option<VersionReply>> {
    let mut lifecycle = self.lifecycle.write().await;
    // Another process may have installed or activated since the last look
    if let Err(e) = lifecycle.restore(&self.version) {
      warn!(error = %e, "could not re-read lifecycle state");
    }
    lifecycle.handle_command(command)
  }

  /// Re-read lifecycle state if the recorded active store moved under us.
  async fn follow_activation(&self) {
    let recorded = match self.storage.active_store() {
      Ok(recorded) => recorded,
      Err(e) => {
        warn!(error = %e, "could not read active store marker");
        return;
      }
    };

    let current = self.lifecycle.read().await.current_store().map(|s| s.name().to_string());
    if current == recorded {
      return;
    }

    debug!(?current, ?recorded, "active store changed outside this agent");
    if let Err(e) = self.lifecycle.write().await.restore(&self.version) {
      warn!(error = %e, "could not re-read lifecycle state");
    }
  }

  pub async fn connect(&self) -> ClientId {
    self.lifecycle.write().await.connect()
  }

  pub async fn disconnect(&self, client: ClientId) {
    self.lifecycle.write().await.disconnect(client)
  }

  /// The rule that decides how `request` would be served.
  pub fn route(&self, request: &Request) -> &RouteRule {
    self.routes.route(request)
  }

  /// Snapshot of the active and waiting generations.
  pub async fn generations(&self) -> (Option<Generation>, Option<Generation>) {
    let lifecycle = self.lifecycle.read().await;
    (lifecycle.active().cloned(), lifecycle.waiting().cloned())
  }

  pub fn origin(&self) -> &Url {
    &self.origin
  }

  pub fn storage(&self) -> &S {
    &self.storage
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{CacheSource, SqliteStorage, StoreHandle};
  use crate::error::AgentError;
  use crate::network::scripted::ScriptedFetcher;

  const ORIGIN: &str = "https://example.com";

  fn config(version: &str, precache: &[&str]) -> Config {
    let paths = precache
      .iter()
      .map(|p| format!("\"{}\"", p))
      .collect::<Vec<_>>()
      .join(", ");
    let yaml = format!(
      "namespace: portfolio\nversion: {}\norigin: {}\nprecache: [{}]\noffline_document: /offline.html\n",
      version, ORIGIN, paths
    );
    let config = Config::from_yaml(&yaml).unwrap();
    config.validate().unwrap();
    config
  }

  fn url(path: &str) -> Url {
    Url::parse(ORIGIN).unwrap().join(path).unwrap()
  }

  struct Harness {
    storage: Arc<SqliteStorage>,
    network: Arc<ScriptedFetcher>,
  }

  impl Harness {
    fn new() -> Self {
      let network = Arc::new(ScriptedFetcher::new());
      for (path, body) in [
        ("/", "<h1>home</h1>"),
        ("/offline.html", "<h1>offline</h1>"),
        ("/app.css", "body { color: red }"),
        ("/app.v2.css", "body { color: blue }"),
      ] {
        network.respond(url(path).as_str(), Response::new(200, body));
      }
      Self {
        storage: Arc::new(SqliteStorage::open_in_memory().unwrap()),
        network,
      }
    }

    fn agent(&self, config: &Config) -> Agent<SqliteStorage> {
      let network: Arc<dyn Fetch> = self.network.clone();
      Agent::new(config, Arc::clone(&self.storage), network).unwrap()
    }

    /// Installed and active v1 with the default manifest, plus a controlled client.
    async fn installed(&self) -> (Agent<SqliteStorage>, ClientId) {
      let agent = self.agent(&config("v1", &["/", "/offline.html", "/app.css"]));
      agent.install().await.unwrap();
      let client = agent.connect().await;
      (agent, client)
    }

    fn entries(&self, store: &str) -> usize {
      self.storage.entry_count(&StoreHandle::new(store)).unwrap()
    }
  }

  #[tokio::test]
  async fn test_install_populates_store() {
    let h = Harness::new();
    let (agent, _) = h.installed().await;

    let (active, waiting) = agent.generations().await;
    assert_eq!(active.map(|g| g.phase()), Some(LifecyclePhase::Active));
    assert!(waiting.is_none());
    assert_eq!(h.entries("portfolio-v1"), 3);
  }

  #[tokio::test]
  async fn test_precached_asset_served_offline() {
    let h = Harness::new();
    let (agent, client) = h.installed().await;
    h.network.set_online(false);

    let result = agent
      .handle(client, &Request::get(url("/app.css")))
      .await
      .unwrap();

    assert_eq!(result.source, CacheSource::Cache);
    assert_eq!(result.data.body, b"body { color: red }".to_vec());
  }

  #[tokio::test]
  async fn test_cache_hit_makes_no_network_call() {
    let h = Harness::new();
    let (agent, client) = h.installed().await;
    let before = h.network.call_count();

    agent
      .handle(client, &Request::get(url("/app.css")))
      .await
      .unwrap();

    assert_eq!(h.network.call_count(), before);
  }

  #[tokio::test]
  async fn test_lazy_asset_roundtrip() {
    let h = Harness::new();
    let (agent, client) = h.installed().await;
    let png: Vec<u8> = vec![0x89, b'P', b'N', b'G', 0, 255, 13, 10];
    h.network
      .respond(url("/images/me.png").as_str(), Response::new(200, png.clone()));

    let first = agent
      .handle(client, &Request::get(url("/images/me.png")))
      .await
      .unwrap();
    assert_eq!(first.source, CacheSource::Network);

    h.network.set_online(false);
    let second = agent
      .handle(client, &Request::get(url("/images/me.png")))
      .await
      .unwrap();

    assert_eq!(second.source, CacheSource::Cache);
    assert_eq!(second.data.body, png);
  }

  #[tokio::test]
  async fn test_navigation_refreshes_then_falls_back() {
    let h = Harness::new();
    let (agent, client) = h.installed().await;
    h.network
      .respond(url("/").as_str(), Response::new(200, "<h1>home, updated</h1>"));

    let live = agent
      .handle(client, &Request::navigate(url("/")))
      .await
      .unwrap();
    assert_eq!(live.source, CacheSource::Network);
    assert_eq!(live.data.body, b"<h1>home, updated</h1>".to_vec());

    h.network.set_online(false);
    let offline = agent
      .handle(client, &Request::navigate(url("/")))
      .await
      .unwrap();

    assert_eq!(offline.source, CacheSource::Offline);
    assert_eq!(offline.data.body, b"<h1>home, updated</h1>".to_vec());
  }

  #[tokio::test]
  async fn test_unknown_page_offline_gets_offline_document() {
    let h = Harness::new();
    let (agent, client) = h.installed().await;
    h.network.set_online(false);

    let result = agent
      .handle(client, &Request::navigate(url("/blog/some-post")))
      .await
      .unwrap();

    assert_eq!(result.source, CacheSource::OfflineDocument);
    assert_eq!(result.data.body, b"<h1>offline</h1>".to_vec());
  }

  #[tokio::test]
  async fn test_network_only_never_touches_store() {
    let h = Harness::new();
    let (agent, client) = h.installed().await;
    h.network
      .respond(url("/api/contact").as_str(), Response::new(500, "boom"));
    let before = h.entries("portfolio-v1");

    for _ in 0..2 {
      let result = agent
        .handle(client, &Request::get(url("/api/contact")))
        .await
        .unwrap();
      assert_eq!(result.source, CacheSource::Passthrough);
      assert_eq!(result.data.status, 500);
    }

    assert_eq!(h.network.calls_to(url("/api/contact").as_str()), 2);
    assert_eq!(h.entries("portfolio-v1"), before);
  }

  #[tokio::test]
  async fn test_network_only_offline_is_an_error() {
    let h = Harness::new();
    let (agent, client) = h.installed().await;
    h.network.set_online(false);

    let err = agent
      .handle(client, &Request::get(url("/api/contact")))
      .await
      .unwrap_err();

    assert!(matches!(err, AgentError::Network { .. }));
  }

  #[tokio::test]
  async fn test_non_get_passes_through() {
    let h = Harness::new();
    let (agent, client) = h.installed().await;
    let before = h.network.call_count();

    let request = Request::get(url("/app.css")).with_method("POST");
    let result = agent.handle(client, &request).await.unwrap();

    assert_eq!(result.source, CacheSource::Passthrough);
    assert_eq!(h.network.call_count(), before + 1);
  }

  #[tokio::test]
  async fn test_uncontrolled_client_bypasses_cache() {
    let h = Harness::new();
    let agent = h.agent(&config("v1", &["/", "/offline.html", "/app.css"]));
    let early = agent.connect().await;
    agent.install().await.unwrap();
    h.network.set_online(false);

    let err = agent
      .handle(early, &Request::get(url("/app.css")))
      .await
      .unwrap_err();
    assert!(matches!(err, AgentError::Network { .. }));

    agent.message(AgentCommand::ClientsClaim).await.unwrap();
    let result = agent
      .handle(early, &Request::get(url("/app.css")))
      .await
      .unwrap();
    assert_eq!(result.source, CacheSource::Cache);
  }

  #[tokio::test]
  async fn test_upgrade_replaces_generation() {
    let h = Harness::new();
    let (v1, _) = h.installed().await;
    drop(v1);

    let v2 = h.agent(&config("v2", &["/", "/offline.html", "/app.v2.css"]));
    let client = v2.connect().await;
    assert_eq!(v2.install().await.unwrap(), LifecyclePhase::Waiting);

    // Still served by v1 until activation
    let reply = v2.message(AgentCommand::GetVersion).await.unwrap();
    assert_eq!(reply.map(|r| r.version).as_deref(), Some("v1"));
    assert!(h.storage.has_store("portfolio-v1").unwrap());

    v2.message(AgentCommand::SkipWaiting).await.unwrap();

    let reply = v2.message(AgentCommand::GetVersion).await.unwrap();
    assert_eq!(reply.map(|r| r.version).as_deref(), Some("v2"));
    assert!(!h.storage.has_store("portfolio-v1").unwrap());
    assert_eq!(h.entries("portfolio-v2"), 3);

    // The old stylesheet is gone with its generation
    h.network.set_online(false);
    assert!(v2
      .handle(client, &Request::get(url("/app.css")))
      .await
      .is_err());
    let fresh = v2
      .handle(client, &Request::get(url("/app.v2.css")))
      .await
      .unwrap();
    assert_eq!(fresh.data.body, b"body { color: blue }".to_vec());
  }

  #[tokio::test]
  async fn test_failed_upgrade_keeps_serving_previous() {
    let h = Harness::new();
    let (v1, _) = h.installed().await;
    drop(v1);

    let v2 = h.agent(&config("v2", &["/", "/offline.html", "/missing.js"]));
    let client = v2.connect().await;

    assert!(matches!(
      v2.install().await,
      Err(AgentError::Precache { .. })
    ));
    assert!(!h.storage.has_store("portfolio-v2").unwrap());

    h.network.set_online(false);
    let result = v2
      .handle(client, &Request::get(url("/app.css")))
      .await
      .unwrap();
    assert_eq!(result.source, CacheSource::Cache);
  }

  #[tokio::test]
  async fn test_concurrent_misses_store_one_entry() {
    let h = Harness::new();
    let (agent, client) = h.installed().await;
    let agent = Arc::new(agent);
    h.network
      .respond(url("/icons/a.svg").as_str(), Response::new(200, "<svg/>"));
    let before = h.entries("portfolio-v1");

    let request = Request::get(url("/icons/a.svg"));
    let (a, b) = tokio::join!(agent.handle(client, &request), agent.handle(client, &request));

    assert_eq!(a.unwrap().data.body, b"<svg/>".to_vec());
    assert_eq!(b.unwrap().data.body, b"<svg/>".to_vec());
    assert_eq!(h.entries("portfolio-v1"), before + 1);
  }

  #[tokio::test]
  async fn test_route_explains_policy() {
    let h = Harness::new();
    let agent = h.agent(&config("v1", &["/", "/offline.html", "/app.css"]));

    let rule = agent.route(&Request::get(url("/app.css")));
    assert_eq!(rule.name, "precache");
    assert_eq!(rule.policy, Policy::PrecachePinned);
  }

  #[tokio::test]
  async fn test_running_agent_follows_upgrade_from_another_process() {
    let h = Harness::new();
    let (server, client) = h.installed().await;
    let v2 = config("v2", &["/", "/offline.html", "/app.v2.css"]);

    let cli = h.agent(&v2);
    assert_eq!(cli.install().await.unwrap(), LifecyclePhase::Waiting);

    // The running agent still serves v1 until someone activates
    let reply = server.message(AgentCommand::GetVersion).await.unwrap();
    assert_eq!(reply.map(|r| r.version).as_deref(), Some("v1"));

    cli.message(AgentCommand::SkipWaiting).await.unwrap();
    assert_eq!(h.storage.store_names().unwrap(), vec!["portfolio-v2".to_string()]);

    let reply = server.message(AgentCommand::GetVersion).await.unwrap();
    assert_eq!(reply.map(|r| r.version).as_deref(), Some("v2"));

    h.network.set_online(false);
    let css = server
      .handle(client, &Request::get(url("/app.v2.css")))
      .await
      .unwrap();
    assert_eq!(css.source, CacheSource::Cache);
    assert_eq!(css.data.body, b"body { color: blue }".to_vec());

    let page = server
      .handle(client, &Request::navigate(url("/about")))
      .await
      .unwrap();
    assert_eq!(page.source, CacheSource::OfflineDocument);
  }

  #[tokio::test]
  async fn test_running_agent_activates_generation_installed_elsewhere() {
    let h = Harness::new();
    drop(h.installed().await);
    let v2 = config("v2", &["/", "/offline.html", "/app.v2.css"]);
    let server = h.agent(&v2);
    let client = server.connect().await;

    assert_eq!(h.agent(&v2).install().await.unwrap(), LifecyclePhase::Waiting);
    server.message(AgentCommand::SkipWaiting).await.unwrap();

    assert_eq!(h.storage.store_names().unwrap(), vec!["portfolio-v2".to_string()]);
    h.network.set_online(false);
    let css = server
      .handle(client, &Request::get(url("/app.v2.css")))
      .await
      .unwrap();
    assert_eq!(css.source, CacheSource::Cache);
  }

  #[tokio::test]
  async fn test_uncontrolled_client_claimed_after_install_elsewhere() {
    let h = Harness::new();
    let v1 = config("v1", &["/", "/offline.html", "/app.css"]);
    let server = h.agent(&v1);
    let client = server.connect().await;

    h.agent(&v1).install().await.unwrap();
    server.message(AgentCommand::ClientsClaim).await.unwrap();

    h.network.set_online(false);
    let result = server
      .handle(client, &Request::get(url("/app.css")))
      .await
      .unwrap();
    assert_eq!(result.source, CacheSource::Cache);
  }
}
