//! Canonical store keys for requests.

use sha2::{Digest, Sha256};
use std::fmt;
use url::Url;

use crate::network::Request;

/// Key under which a response is stored.
///
/// Only GET responses are ever stored, so the method is fixed. The URL is
/// canonicalized by `url` parsing and stripped of its fragment, which never
/// reaches the server.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct RequestKey {
  url: String,
}

impl RequestKey {
  pub const METHOD: &'static str = "GET";

  pub fn from_url(url: &Url) -> Self {
    let mut url = url.clone();
    url.set_fragment(None);
    Self {
      url: url.to_string(),
    }
  }

  pub fn for_request(request: &Request) -> Self {
    Self::from_url(&request.url)
  }

  pub fn url(&self) -> &str {
    &self.url
  }

  /// Stable, fixed-length identifier for the storage backend.
  pub fn cache_hash(&self) -> String {
    let mut hasher = Sha256::new();
    hasher.update(Self::METHOD.as_bytes());
    hasher.update(b" ");
    hasher.update(self.url.as_bytes());
    hex::encode(hasher.finalize())
  }
}

impl fmt::Display for RequestKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{} {}", Self::METHOD, self.url)
  }
}
