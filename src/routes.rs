//! Request classification.
//!
//! A `RouteTable` is an ordered list of rules; the first rule whose condition
//! holds decides the policy. Classification is pure: no network, no storage.
//!
//! Rule order:
//! 1. non-GET requests go to the network untouched
//! 2. configured network-only patterns (API, data hosts, analytics)
//! 3. same-origin manifest members, unless the request is for a document
//! 4. configured static-asset patterns (images, icons, fonts)
//! 5. documents: navigations and `.html` fetches
//! 6. anything else on the agent's own origin
//! 7. everything left over

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use url::{Origin, Url};

use crate::config::RoutesConfig;
use crate::network::Request;

/// How a request is served.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Policy {
  /// Always the network; the store is never read nor written
  NetworkOnly,
  /// Part of the precache manifest; cache-first
  PrecachePinned,
  /// Cached on first use; cache-first
  LazyCacheable,
  /// Page loads; network-first with the offline document as last resort
  NavigationFallback,
}

impl Policy {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::NetworkOnly => "network-only",
      Self::PrecachePinned => "precache-pinned",
      Self::LazyCacheable => "lazy-cacheable",
      Self::NavigationFallback => "navigation-fallback",
    }
  }
}

impl fmt::Display for Policy {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// Declarative URL test, as written in the config file:
/// `{ match: contains, value: "/api/" }`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "match", content = "value", rename_all = "snake_case")]
pub enum Matcher {
  /// Substring anywhere in the full URL
  Contains(String),
  /// Path ends with this (case-insensitive), e.g. `.woff2`
  Suffix(String),
  /// Path starts with this
  PathPrefix(String),
  /// Host is this domain or one of its subdomains
  Host(String),
}

impl Matcher {
  pub fn matches(&self, url: &Url) -> bool {
    match self {
      Self::Contains(needle) => url.as_str().contains(needle.as_str()),
      Self::Suffix(suffix) => url
        .path()
        .to_ascii_lowercase()
        .ends_with(&suffix.to_ascii_lowercase()),
      Self::PathPrefix(prefix) => url.path().starts_with(prefix.as_str()),
      Self::Host(domain) => url
        .host_str()
        .is_some_and(|host| host == domain || host.ends_with(&format!(".{}", domain))),
    }
  }
}

#[derive(Debug, Clone)]
enum Condition {
  NotGet,
  Pattern(Matcher),
  Pinned,
  Document,
  SameOrigin,
}

/// One entry of the route table.
#[derive(Debug, Clone)]
pub struct RouteRule {
  /// Short label shown when explaining a classification
  pub name: &'static str,
  condition: Option<Condition>,
  pub policy: Policy,
}

impl RouteRule {
  fn new(name: &'static str, condition: Condition, policy: Policy) -> Self {
    Self {
      name,
      condition: Some(condition),
      policy,
    }
  }
}

pub struct RouteTable {
  origin: Origin,
  pinned: HashSet<String>,
  rules: Vec<RouteRule>,
  fallback: RouteRule,
}

impl RouteTable {
  pub fn new(origin: &Url, precache: &[String], routes: &RoutesConfig) -> Self {
    let pinned = precache
      .iter()
      .filter_map(|path| origin.join(path).ok())
      .map(|url| url.path().to_string())
      .collect();

    let mut rules = vec![RouteRule::new("non-get", Condition::NotGet, Policy::NetworkOnly)];
    rules.extend(routes.network_only.iter().map(|m| {
      RouteRule::new(
        "network-only",
        Condition::Pattern(m.clone()),
        Policy::NetworkOnly,
      )
    }));
    rules.push(RouteRule::new(
      "precache",
      Condition::Pinned,
      Policy::PrecachePinned,
    ));
    rules.extend(routes.lazy.iter().map(|m| {
      RouteRule::new(
        "static-asset",
        Condition::Pattern(m.clone()),
        Policy::LazyCacheable,
      )
    }));
    rules.push(RouteRule::new(
      "document",
      Condition::Document,
      Policy::NavigationFallback,
    ));
    rules.push(RouteRule::new(
      "same-origin",
      Condition::SameOrigin,
      Policy::LazyCacheable,
    ));

    Self {
      origin: origin.origin(),
      pinned,
      rules,
      fallback: RouteRule {
        name: "default",
        condition: None,
        policy: Policy::LazyCacheable,
      },
    }
  }

  pub fn classify(&self, request: &Request) -> Policy {
    self.route(request).policy
  }

  /// The rule that decides the request's policy.
  pub fn route(&self, request: &Request) -> &RouteRule {
    self
      .rules
      .iter()
      .find(|rule| {
        rule
          .condition
          .as_ref()
          .is_some_and(|condition| self.holds(condition, request))
      })
      .unwrap_or(&self.fallback)
  }

  fn holds(&self, condition: &Condition, request: &Request) -> bool {
    let url = &request.url;
    match condition {
      Condition::NotGet => !request.is_get(),
      Condition::Pattern(matcher) => matcher.matches(url),
      Condition::Pinned => {
        !is_document(request) && self.is_same_origin(url) && self.pinned.contains(url.path())
      }
      Condition::Document => is_document(request),
      Condition::SameOrigin => self.is_same_origin(url),
    }
  }

  fn is_same_origin(&self, url: &Url) -> bool {
    url.origin() == self.origin
  }
}

fn is_document(request: &Request) -> bool {
  request.is_navigation() || request.url.path().ends_with(".html")
}
