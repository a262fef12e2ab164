//! HTTP host for the agent.
//!
//! Every request not addressed to `/__cachet/*` is treated as a client's
//! outgoing request for the configured origin and answered by the agent.
//! Responses carry `x-cachet-source` naming where the body came from.

use axum::{
  body::{Body, Bytes},
  extract::{Path, State},
  http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri},
  response::{IntoResponse, Response as HttpResponse},
  routing::{delete, post},
  Json, Router,
};
use color_eyre::{eyre::eyre, Result};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::CacheResult;
use crate::commands::AgentCommand;
use crate::error::AgentError;
use crate::event::AgentHandle;
use crate::lifecycle::ClientId;
use crate::network::{Request, RequestMode, Response};

/// Request header naming the client a request belongs to
pub const CLIENT_HEADER: &str = "x-cachet-client";
/// Response header naming where the body came from
pub const SOURCE_HEADER: &str = "x-cachet-source";
/// Response header with the time a stored body was written (RFC 3339)
pub const CACHED_AT_HEADER: &str = "x-cachet-cached-at";

/// Headers that describe a single hop and are never forwarded.
/// The body may also have been decoded on the way in, so its framing
/// headers no longer apply.
const HOP_BY_HOP_HEADERS: &[&str] = &[
  "connection",
  "keep-alive",
  "proxy-connection",
  "transfer-encoding",
  "upgrade",
  "te",
  "trailer",
  "content-length",
  "content-encoding",
];

pub struct ServerState {
  agent: AgentHandle,
  origin: Url,
  /// Client used for requests that do not name one
  default_client: ClientId,
}

#[derive(Serialize)]
struct ClientReply {
  client: ClientId,
}

#[derive(Serialize)]
struct ErrorReply {
  error: String,
}

pub fn router(state: Arc<ServerState>) -> Router {
  Router::new()
    .route("/__cachet/message", post(message))
    .route("/__cachet/install", post(install))
    .route("/__cachet/clients", post(connect))
    .route("/__cachet/clients/:id", delete(disconnect))
    .fallback(proxy)
    .with_state(state)
}

#[derive(Serialize)]
struct InstallReply {
  phase: String,
}

/// Install the configured generation, then connect the default client so it
/// starts out controlled. A failed install is not fatal: whatever generation
/// was active keeps serving.
async fn start(agent: &AgentHandle) -> Result<ClientId> {
  match agent.install().await {
    Ok(phase) => info!(%phase, "configured generation installed"),
    Err(e) => warn!(error = %e, "install failed, serving the previous generation"),
  }

  Ok(agent.connect().await?)
}

/// Serve until the listener fails or ctrl-c arrives.
pub async fn serve(agent: AgentHandle, origin: Url, listen: &str) -> Result<()> {
  let default_client = start(&agent).await?;
  let state = Arc::new(ServerState {
    agent,
    origin,
    default_client,
  });

  let listener = tokio::net::TcpListener::bind(listen)
    .await
    .map_err(|e| eyre!("Failed to bind {}: {}", listen, e))?;
  info!(%listen, origin = %state.origin, "serving");

  let server = axum::serve(listener, router(state));
  tokio::select! {
    result = server => result.map_err(|e| eyre!("Server error: {}", e))?,
    _ = tokio::signal::ctrl_c() => info!("shutdown signal received"),
  }

  Ok(())
}

async fn proxy(
  State(state): State<Arc<ServerState>>,
  method: Method,
  uri: Uri,
  headers: HeaderMap,
  body: Bytes,
) -> HttpResponse {
  let request = match to_request(&state.origin, &method, &uri, &headers, body) {
    Ok(request) => request,
    Err(e) => return error_response(StatusCode::BAD_REQUEST, e),
  };
  let client = client_id(&headers).unwrap_or(state.default_client);

  match state.agent.fetch(client, request).await {
    Ok(result) => to_response(result),
    Err(e) => {
      warn!(%uri, error = %e, "request failed");
      error_response(error_status(&e), e)
    }
  }
}

async fn message(
  State(state): State<Arc<ServerState>>,
  Json(command): Json<AgentCommand>,
) -> HttpResponse {
  match state.agent.message(command).await {
    Ok(Some(reply)) => Json(reply).into_response(),
    Ok(None) => StatusCode::NO_CONTENT.into_response(),
    Err(e) => error_response(error_status(&e), e),
  }
}

async fn install(State(state): State<Arc<ServerState>>) -> HttpResponse {
  match state.agent.install().await {
    Ok(phase) => Json(InstallReply {
      phase: phase.to_string(),
    })
    .into_response(),
    Err(e) => error_response(error_status(&e), e),
  }
}

async fn connect(State(state): State<Arc<ServerState>>) -> HttpResponse {
  match state.agent.connect().await {
    Ok(client) => Json(ClientReply { client }).into_response(),
    Err(e) => error_response(error_status(&e), e),
  }
}

async fn disconnect(State(state): State<Arc<ServerState>>, Path(id): Path<ClientId>) -> HttpResponse {
  match state.agent.disconnect(id) {
    Ok(()) => StatusCode::NO_CONTENT.into_response(),
    Err(e) => error_response(error_status(&e), e),
  }
}

fn client_id(headers: &HeaderMap) -> Option<ClientId> {
  headers.get(CLIENT_HEADER)?.to_str().ok()?.trim().parse().ok()
}

/// Rebuild the client's request against the origin.
fn to_request(origin: &Url, method: &Method, uri: &Uri, headers: &HeaderMap, body: Bytes) -> Result<Request> {
  let path = uri.path_and_query().map(|p| p.as_str()).unwrap_or("/");
  let url = origin
    .join(path)
    .map_err(|e| eyre!("Invalid request path {}: {}", path, e))?;

  let mut request = Request::get(url).with_method(method.as_str());
  if is_navigation(headers) {
    request.mode = RequestMode::Navigate;
  }
  for (name, value) in headers {
    if name.as_str() == CLIENT_HEADER {
      continue;
    }
    if let Ok(value) = value.to_str() {
      request = request.with_header(name.as_str(), value);
    }
  }

  Ok(request.with_body(body.to_vec()))
}

/// A top-level document load, as browsers mark it.
fn is_navigation(headers: &HeaderMap) -> bool {
  let header_is = |name: &str, pred: &dyn Fn(&str) -> bool| {
    headers
      .get(name)
      .and_then(|v| v.to_str().ok())
      .is_some_and(pred)
  };

  header_is("sec-fetch-mode", &|mode| mode.eq_ignore_ascii_case("navigate"))
    || header_is(header::ACCEPT.as_str(), &|accept| accept.trim_start().starts_with("text/html"))
}

fn to_response(result: CacheResult<Response>) -> HttpResponse {
  let CacheResult {
    data,
    source,
    cached_at,
  } = result;
  debug!(status = data.status, source = source.as_str(), "responding");

  let status = StatusCode::from_u16(data.status).unwrap_or(StatusCode::BAD_GATEWAY);
  let mut response = HttpResponse::new(Body::from(data.body));
  *response.status_mut() = status;

  let headers = response.headers_mut();
  for (name, value) in &data.headers {
    if HOP_BY_HOP_HEADERS.iter().any(|h| h.eq_ignore_ascii_case(name)) {
      continue;
    }
    if let (Ok(name), Ok(value)) = (
      HeaderName::from_bytes(name.as_bytes()),
      HeaderValue::from_str(value),
    ) {
      headers.append(name, value);
    }
  }
  headers.insert(SOURCE_HEADER, HeaderValue::from_static(source.as_str()));
  if let Some(Ok(value)) = cached_at.map(|at| HeaderValue::from_str(&at.to_rfc3339())) {
    headers.insert(CACHED_AT_HEADER, value);
  }

  response
}

/// Failures the network caused map to a gateway timeout; the rest are ours.
fn error_status(err: &AgentError) -> StatusCode {
  match err {
    _ if err.is_network() => StatusCode::GATEWAY_TIMEOUT,
    AgentError::NotInstalled => StatusCode::SERVICE_UNAVAILABLE,
    AgentError::Precache { .. } => StatusCode::BAD_GATEWAY,
    _ => StatusCode::INTERNAL_SERVER_ERROR,
  }
}

fn error_response(status: StatusCode, err: impl ToString) -> HttpResponse {
  (
    status,
    Json(ErrorReply {
      error: err.to_string(),
    }),
  )
    .into_response()
}
