//! Typed failures surfaced by the agent.
//!
//! Storage and configuration plumbing report through `color_eyre::Result`;
//! these variants are the ones callers need to tell apart (a network failure
//! that may still be recovered from cache versus one that exhausted every
//! fallback).

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AgentError {
  /// The fetch was rejected or timed out.
  #[error("network request to {url} failed: {reason}")]
  Network { url: String, reason: String },

  /// A manifest path could not be precached, so the install was abandoned.
  #[error("precache of {path} failed: {reason}")]
  Precache { path: String, reason: String },

  /// The network failed and neither a cached copy nor the offline document exists.
  #[error("{url} is unavailable offline")]
  Exhausted {
    url: String,
    #[source]
    source: Box<AgentError>,
  },

  #[error("no cache generation is installed")]
  NotInstalled,

  #[error("cache storage failed: {0}")]
  Storage(String),

  #[error("agent event loop has shut down")]
  Closed,
}

impl AgentError {
  pub fn network(url: impl ToString, reason: impl ToString) -> Self {
    Self::Network {
      url: url.to_string(),
      reason: reason.to_string(),
    }
  }

  pub fn exhausted(url: impl ToString, source: AgentError) -> Self {
    Self::Exhausted {
      url: url.to_string(),
      source: Box::new(source),
    }
  }

  pub fn storage(err: impl std::fmt::Display) -> Self {
    Self::Storage(err.to_string())
  }

  /// Whether the failure came from the network side (as opposed to local state).
  pub fn is_network(&self) -> bool {
    matches!(self, Self::Network { .. } | Self::Exhausted { .. })
  }
}

pub type AgentResult<T> = std::result::Result<T, AgentError>;
