use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::agent::Agent;
use crate::cache::{CacheResult, CacheStorage};
use crate::commands::{AgentCommand, VersionReply};
use crate::error::{AgentError, AgentResult};
use crate::lifecycle::{ClientId, LifecyclePhase};
use crate::network::{Request, Response};

/// Events delivered to the agent
#[derive(Debug)]
pub enum AgentEvent {
  /// Outgoing request from a client
  Fetch {
    client: ClientId,
    request: Request,
    reply: oneshot::Sender<AgentResult<CacheResult<Response>>>,
  },
  /// Control message
  Message {
    command: AgentCommand,
    reply: oneshot::Sender<AgentResult<Option<VersionReply>>>,
  },
  /// Install the configured generation
  Install {
    reply: oneshot::Sender<AgentResult<LifecyclePhase>>,
  },
  /// A new client appeared
  Connect { reply: oneshot::Sender<ClientId> },
  /// A client went away
  Disconnect { client: ClientId },
}

/// Sending side of the agent's event loop. Cheap to clone.
#[derive(Clone)]
pub struct AgentHandle {
  tx: mpsc::UnboundedSender<AgentEvent>,
}

impl AgentHandle {
  /// Start the event loop for `agent`.
  ///
  /// Each event runs in its own task, so a slow fetch never holds up other
  /// requests or control messages.
  pub fn spawn<S: CacheStorage + 'static>(agent: Arc<Agent<S>>) -> Self {
    let (tx, mut rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
      while let Some(event) = rx.recv().await {
        let agent = Arc::clone(&agent);
        tokio::spawn(async move { dispatch(&agent, event).await });
      }
      debug!("event loop stopped");
    });

    Self { tx }
  }

  pub async fn fetch(&self, client: ClientId, request: Request) -> AgentResult<CacheResult<Response>> {
    let (reply, rx) = oneshot::channel();
    self.send(AgentEvent::Fetch {
      client,
      request,
      reply,
    })?;
    rx.await.map_err(|_| AgentError::Closed)?
  }

  pub async fn message(&self, command: AgentCommand) -> AgentResult<Option<VersionReply>> {
    let (reply, rx) = oneshot::channel();
    self.send(AgentEvent::Message { command, reply })?;
    rx.await.map_err(|_| AgentError::Closed)?
  }

  pub async fn install(&self) -> AgentResult<LifecyclePhase> {
    let (reply, rx) = oneshot::channel();
    self.send(AgentEvent::Install { reply })?;
    rx.await.map_err(|_| AgentError::Closed)?
  }

  pub async fn connect(&self) -> AgentResult<ClientId> {
    let (reply, rx) = oneshot::channel();
    self.send(AgentEvent::Connect { reply })?;
    rx.await.map_err(|_| AgentError::Closed)
  }

  pub fn disconnect(&self, client: ClientId) -> AgentResult<()> {
    self.send(AgentEvent::Disconnect { client })
  }

  fn send(&self, event: AgentEvent) -> AgentResult<()> {
    self.tx.send(event).map_err(|_| AgentError::Closed)
  }
}

async fn dispatch<S: CacheStorage>(agent: &Agent<S>, event: AgentEvent) {
  // A dropped receiver means the caller gave up; nothing to do about it
  match event {
    AgentEvent::Fetch {
      client,
      request,
      reply,
    } => {
      let _ = reply.send(agent.handle(client, &request).await);
    }
    AgentEvent::Message { command, reply } => {
      let _ = reply.send(agent.message(command).await);
    }
    AgentEvent::Install { reply } => {
      let _ = reply.send(agent.install().await);
    }
    AgentEvent::Connect { reply } => {
      let _ = reply.send(agent.connect().await);
    }
    AgentEvent::Disconnect { client } => agent.disconnect(client).await,
  }
}
