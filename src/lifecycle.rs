//! Cache generation lifecycle.
//!
//! A generation moves through `Installing -> Waiting -> Activating -> Active`
//! and ends `Redundant` once superseded. Installing fetches the whole precache
//! manifest before anything is written, so a failed install leaves storage
//! exactly as it was and the previous generation keeps serving. Activation is
//! the only place stores are deleted: every other store of the namespace goes.

use futures::future::try_join_all;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::{CacheStorage, RequestKey, StoreHandle};
use crate::commands::{AgentCommand, VersionReply};
use crate::error::{AgentError, AgentResult};
use crate::network::{Fetch, Request, Response};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecyclePhase {
  Installing,
  Waiting,
  Activating,
  Active,
  Redundant,
}

impl fmt::Display for LifecyclePhase {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      Self::Installing => "installing",
      Self::Waiting => "waiting",
      Self::Activating => "activating",
      Self::Active => "active",
      Self::Redundant => "redundant",
    };
    f.write_str(name)
  }
}

pub type ClientId = u64;

/// One version of the cache and the store that holds it.
#[derive(Debug, Clone)]
pub struct Generation {
  version: String,
  store: StoreHandle,
  phase: LifecyclePhase,
}

impl Generation {
  fn new(namespace: &str, version: &str, phase: LifecyclePhase) -> Self {
    Self {
      version: version.to_string(),
      store: StoreHandle::new(format!("{}-{}", namespace, version)),
      phase,
    }
  }

  pub fn version(&self) -> &str {
    &self.version
  }

  pub fn store(&self) -> &StoreHandle {
    &self.store
  }

  pub fn phase(&self) -> LifecyclePhase {
    self.phase
  }
}

/// A fully fetched precache, ready to be committed.
#[derive(Debug)]
pub struct Installation {
  generation: Generation,
  entries: Vec<(RequestKey, Response)>,
}

impl Installation {
  pub fn generation(&self) -> &Generation {
    &self.generation
  }
}

/// Fetch every manifest path for a new generation.
///
/// Touches no storage. Any rejected fetch or unsuccessful status fails the
/// whole install.
pub async fn precache(
  fetcher: &dyn Fetch,
  origin: &Url,
  namespace: &str,
  version: &str,
  manifest: &[String],
) -> AgentResult<Installation> {
  let mut generation = Generation::new(namespace, version, LifecyclePhase::Installing);
  info!(store = generation.store.name(), paths = manifest.len(), "installing");

  let fetches = manifest.iter().map(|path| async move {
    let failed = |reason: String| AgentError::Precache {
      path: path.clone(),
      reason,
    };

    let url = origin.join(path).map_err(|e| failed(e.to_string()))?;
    let response = fetcher
      .fetch(&Request::get(url.clone()))
      .await
      .map_err(|e| failed(e.to_string()))?;
    if !response.is_cacheable() {
      return Err(failed(format!("status {}", response.status)));
    }

    debug!(%path, "precached");
    Ok((RequestKey::from_url(&url), response))
  });

  match try_join_all(fetches).await {
    Ok(entries) => Ok(Installation {
      generation,
      entries,
    }),
    Err(e) => {
      generation.phase = LifecyclePhase::Redundant;
      warn!(store = generation.store.name(), error = %e, "install failed");
      Err(e)
    }
  }
}

/// Owns store creation and deletion, the active/waiting generations and
/// which clients are under the agent's control.
pub struct LifecycleController<S: CacheStorage> {
  storage: Arc<S>,
  namespace: String,
  active: Option<Generation>,
  waiting: Option<Generation>,
  /// Connected clients and whether each is controlled
  clients: HashMap<ClientId, bool>,
  next_client: ClientId,
  skip_waiting: bool,
  claim_on_activate: bool,
}

impl<S: CacheStorage> LifecycleController<S> {
  pub fn new(storage: Arc<S>, namespace: impl Into<String>) -> Self {
    Self {
      storage,
      namespace: namespace.into(),
      active: None,
      waiting: None,
      clients: HashMap::new(),
      next_client: 1,
      skip_waiting: false,
      claim_on_activate: false,
    }
  }

  /// Activate new generations as soon as they are installed.
  pub fn with_skip_waiting(mut self, skip_waiting: bool) -> Self {
    self.skip_waiting = skip_waiting;
    self
  }

  /// Claim every connected client whenever a generation activates.
  pub fn with_claim_on_activate(mut self, claim: bool) -> Self {
    self.claim_on_activate = claim;
    self
  }

  /// Bring the in-memory generations in line with storage.
  ///
  /// Storage is shared with other processes, so the recorded active store
  /// wins over whatever this controller last saw. `pending_version` counts as
  /// waiting if its store exists but is not the active one. Called at startup
  /// and whenever another process may have installed or activated.
  pub fn restore(&mut self, pending_version: &str) -> color_eyre::Result<()> {
    let prefix = format!("{}-", self.namespace);

    let mut recorded = None;
    if let Some(name) = self.storage.active_store()? {
      if name.starts_with(&prefix) && self.storage.has_store(&name)? {
        recorded = Some(name[prefix.len()..].to_string());
      } else {
        warn!(store = %name, "recorded active store is unusable, ignoring");
      }
    }

    match recorded {
      Some(version) if !self.is_active_version(&version) => {
        let generation = Generation::new(&self.namespace, &version, LifecyclePhase::Active);
        info!(store = generation.store.name(), "adopted active generation from storage");
        if let Some(mut previous) = self.active.replace(generation) {
          previous.phase = LifecyclePhase::Redundant;
          info!(store = previous.store.name(), "previous generation is redundant");
        }
        if self.claim_on_activate {
          self.clients_claim();
        }
      }
      Some(_) => {}
      None => {
        if let Some(mut lost) = self.active.take() {
          lost.phase = LifecyclePhase::Redundant;
          warn!(store = lost.store.name(), "active generation is gone from storage");
        }
      }
    }

    if let Some(waiting) = &self.waiting {
      if self.is_active_version(&waiting.version) || !self.storage.has_store(waiting.store.name())? {
        debug!(store = waiting.store.name(), "waiting generation no longer waiting");
        self.waiting = None;
      }
    }

    if self.waiting.is_none() && !self.is_active_version(pending_version) {
      let pending = Generation::new(&self.namespace, pending_version, LifecyclePhase::Waiting);
      if self.storage.has_store(pending.store.name())? {
        info!(store = pending.store.name(), "restored waiting generation");
        self.waiting = Some(pending);
      }
    }

    Ok(())
  }

  /// Write a fetched precache and move the generation on.
  ///
  /// Returns the phase the generation ended up in: `Active` if nothing else
  /// was active (or skip-waiting is configured, or it refreshed the active
  /// generation in place), `Waiting` otherwise.
  pub fn commit(&mut self, installation: Installation) -> AgentResult<LifecyclePhase> {
    let Installation {
      mut generation,
      entries,
    } = installation;

    self
      .storage
      .put_all(generation.store.name(), &entries)
      .map_err(|e| {
        warn!(store = generation.store.name(), error = %e, "install could not be committed");
        AgentError::storage(e)
      })?;
    info!(store = generation.store.name(), entries = entries.len(), "installed");

    if self.is_active_version(&generation.version) {
      debug!(store = generation.store.name(), "refreshed active generation in place");
      return Ok(LifecyclePhase::Active);
    }

    generation.phase = LifecyclePhase::Waiting;
    let store_name = generation.store.name().to_string();
    if let Some(mut replaced) = self.waiting.replace(generation) {
      if replaced.store.name() != store_name {
        replaced.phase = LifecyclePhase::Redundant;
        info!(store = replaced.store.name(), "waiting generation superseded");
      }
    }

    if self.active.is_none() || self.skip_waiting {
      self.skip_waiting()?;
      return Ok(LifecyclePhase::Active);
    }

    info!(store = %store_name, "waiting for activation");
    Ok(LifecyclePhase::Waiting)
  }

  /// Activate the waiting generation, if any. Returns whether one was activated.
  pub fn skip_waiting(&mut self) -> AgentResult<bool> {
    let Some(generation) = self.waiting.take() else {
      debug!("skip-waiting: nothing is waiting");
      return Ok(false);
    };

    self.activate(generation)?;
    Ok(true)
  }

  fn activate(&mut self, mut generation: Generation) -> AgentResult<()> {
    generation.phase = LifecyclePhase::Activating;
    info!(store = generation.store.name(), "activating");

    // Nothing is deleted before the marker points at the new store
    if let Err(e) = self.storage.set_active_store(generation.store.name()) {
      warn!(store = generation.store.name(), error = %e, "activation failed");
      generation.phase = LifecyclePhase::Waiting;
      self.waiting = Some(generation);
      return Err(AgentError::storage(e));
    }

    // A store left behind here is evicted by the next activation
    match self
      .storage
      .delete_stores_except(&self.namespace, &generation.store)
    {
      Ok(evicted) => {
        for name in &evicted {
          info!(store = %name, "evicted stale store");
        }
      }
      Err(e) => warn!(store = generation.store.name(), error = %e, "eviction failed"),
    }

    if let Some(mut previous) = self.active.take() {
      previous.phase = LifecyclePhase::Redundant;
      info!(store = previous.store.name(), "previous generation is redundant");
    }

    generation.phase = LifecyclePhase::Active;
    info!(store = generation.store.name(), version = %generation.version, "active");
    self.active = Some(generation);

    if self.claim_on_activate {
      self.clients_claim();
    }

    Ok(())
  }

  /// Register a client. It is controlled only if a generation is already active.
  pub fn connect(&mut self) -> ClientId {
    let id = self.next_client;
    self.next_client += 1;

    let controlled = self.active.is_some();
    self.clients.insert(id, controlled);
    debug!(client = id, controlled, "client connected");

    id
  }

  pub fn disconnect(&mut self, client: ClientId) {
    self.clients.remove(&client);
  }

  pub fn is_controlled(&self, client: ClientId) -> bool {
    self.active.is_some() && self.clients.get(&client).copied().unwrap_or(false)
  }

  /// Take control of every connected client. Returns how many were newly claimed.
  pub fn clients_claim(&mut self) -> usize {
    if self.active.is_none() {
      return 0;
    }

    let mut claimed = 0;
    for controlled in self.clients.values_mut().filter(|c| !**c) {
      *controlled = true;
      claimed += 1;
    }
    if claimed > 0 {
      info!(claimed, "took control of clients");
    }

    claimed
  }

  pub fn handle_command(&mut self, command: AgentCommand) -> AgentResult<Option<VersionReply>> {
    debug!(?command, "command received");
    match command {
      AgentCommand::SkipWaiting => {
        self.skip_waiting()?;
        Ok(None)
      }
      AgentCommand::ClientsClaim => {
        self.clients_claim();
        Ok(None)
      }
      AgentCommand::GetVersion => self
        .version()
        .map(|version| {
          Some(VersionReply {
            version: version.to_string(),
          })
        })
        .ok_or(AgentError::NotInstalled),
    }
  }

  /// Version of the active generation, or of the waiting one before any activation.
  pub fn version(&self) -> Option<&str> {
    self
      .active
      .as_ref()
      .or(self.waiting.as_ref())
      .map(|g| g.version.as_str())
  }

  pub fn active(&self) -> Option<&Generation> {
    self.active.as_ref()
  }

  pub fn waiting(&self) -> Option<&Generation> {
    self.waiting.as_ref()
  }

  /// The store requests are served from.
  pub fn current_store(&self) -> Option<&StoreHandle> {
    self.active.as_ref().map(|g| &g.store)
  }

  fn is_active_version(&self, version: &str) -> bool {
    self.active.as_ref().is_some_and(|g| g.version == version)
  }
}
