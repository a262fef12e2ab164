use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use std::time::Duration;
use tracing::debug;

use crate::config::NetworkConfig;
use crate::error::{AgentError, AgentResult};

use super::types::{Request, Response};

/// Anything that can put a request on the wire.
///
/// A rejected fetch (connection refused, DNS failure, timeout) is an `Err`;
/// an HTTP error status is still an `Ok` response.
#[async_trait]
pub trait Fetch: Send + Sync {
  async fn fetch(&self, request: &Request) -> AgentResult<Response>;
}

/// Request headers that describe the hop to the agent rather than the request itself.
const SKIPPED_REQUEST_HEADERS: &[&str] = &[
  "host",
  "connection",
  "content-length",
  "transfer-encoding",
  "accept-encoding",
];

/// reqwest-backed network client
#[derive(Clone)]
pub struct HttpFetcher {
  client: reqwest::Client,
}

impl HttpFetcher {
  pub fn new(config: &NetworkConfig) -> Result<Self> {
    let client = reqwest::Client::builder()
      .timeout(Duration::from_secs(config.timeout_secs))
      .user_agent(concat!("cachet/", env!("CARGO_PKG_VERSION")))
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self { client })
  }
}

#[async_trait]
impl Fetch for HttpFetcher {
  async fn fetch(&self, request: &Request) -> AgentResult<Response> {
    let method = reqwest::Method::from_bytes(request.method.as_bytes())
      .map_err(|e| AgentError::network(&request.url, e))?;

    let mut builder = self.client.request(method, request.url.clone());
    for (name, value) in &request.headers {
      if SKIPPED_REQUEST_HEADERS
        .iter()
        .any(|skipped| name.eq_ignore_ascii_case(skipped))
      {
        continue;
      }
      builder = builder.header(name.as_str(), value.as_str());
    }
    if !request.body.is_empty() {
      builder = builder.body(request.body.clone());
    }

    let response = builder
      .send()
      .await
      .map_err(|e| AgentError::network(&request.url, e))?;

    let status = response.status().as_u16();
    let headers = response
      .headers()
      .iter()
      .filter_map(|(name, value)| {
        value
          .to_str()
          .ok()
          .map(|v| (name.as_str().to_string(), v.to_string()))
      })
      .collect();
    let body = response
      .bytes()
      .await
      .map_err(|e| AgentError::network(&request.url, e))?
      .to_vec();

    debug!(url = %request.url, status, bytes = body.len(), "fetched");

    Ok(Response {
      status,
      headers,
      body,
    })
  }
}
