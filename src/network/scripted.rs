//! In-process fetcher with canned responses, used by the tests.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use crate::error::{AgentError, AgentResult};

use super::client::Fetch;
use super::types::{Request, Response};

/// Answers from a table keyed by URL; unknown URLs get a 404.
/// Can be switched offline, in which case every fetch is rejected.
pub struct ScriptedFetcher {
  responses: Mutex<HashMap<String, Response>>,
  online: AtomicBool,
  calls: Mutex<Vec<String>>,
}

impl ScriptedFetcher {
  pub fn new() -> Self {
    Self {
      responses: Mutex::new(HashMap::new()),
      online: AtomicBool::new(true),
      calls: Mutex::new(Vec::new()),
    }
  }

  pub fn respond(&self, url: &str, response: Response) {
    self
      .responses
      .lock()
      .unwrap()
      .insert(url.to_string(), response);
  }

  pub fn set_online(&self, online: bool) {
    self.online.store(online, Ordering::SeqCst);
  }

  pub fn call_count(&self) -> usize {
    self.calls.lock().unwrap().len()
  }

  pub fn calls_to(&self, url: &str) -> usize {
    self.calls.lock().unwrap().iter().filter(|c| *c == url).count()
  }
}

#[async_trait]
impl Fetch for ScriptedFetcher {
  async fn fetch(&self, request: &Request) -> AgentResult<Response> {
    let url = request.url.to_string();
    self.calls.lock().unwrap().push(url.clone());

    if !self.online.load(Ordering::SeqCst) {
      return Err(AgentError::network(&url, "network unreachable"));
    }

    let response = self.responses.lock().unwrap().get(&url).cloned();
    Ok(response.unwrap_or_else(|| Response::new(404, "not found")))
  }
}
