//! Decides which requests are handled here and hands them to the engine.

use url::Url;

use crate::config::TargetConfig;
use crate::retrieval::{RetrievalEngine, Retrieved};

/// An outbound image request. Always a GET.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestDescriptor {
  url: Url,
}

impl RequestDescriptor {
  pub fn new(url: Url) -> Self {
    Self { url }
  }

  /// Parse an absolute URL into a descriptor.
  pub fn parse(url: &str) -> Result<Self, url::ParseError> {
    Url::parse(url).map(Self::new)
  }

  pub fn url(&self) -> &Url {
    &self.url
  }

  /// Cache key: the full request URL.
  pub fn cache_key(&self) -> &str {
    self.url.as_str()
  }
}

/// Host + path rule selecting the requests to intercept.
#[derive(Debug, Clone)]
pub struct MatchRule {
  host: String,
  path_segment: String,
}

impl MatchRule {
  pub fn new(host: impl Into<String>, path_segment: impl Into<String>) -> Self {
    Self {
      host: host.into(),
      path_segment: path_segment.into(),
    }
  }

  /// True when the host is an exact match and the path contains the
  /// segment (case-sensitive).
  pub fn matches(&self, request: &RequestDescriptor) -> bool {
    request.url.host_str() == Some(self.host.as_str())
      && request.url.path().contains(&self.path_segment)
  }
}

impl From<&TargetConfig> for MatchRule {
  fn from(config: &TargetConfig) -> Self {
    Self::new(&config.host, &config.path_segment)
  }
}

/// What to do with an incoming request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
  /// Resolve through the retrieval engine
  Intercept,
  /// Not ours; leave it to normal network handling
  PassThrough,
}

/// Match rule composed with the retrieval engine.
pub struct Interceptor {
  rule: MatchRule,
  engine: RetrievalEngine,
}

impl Interceptor {
  pub fn new(rule: MatchRule, engine: RetrievalEngine) -> Self {
    Self { rule, engine }
  }

  pub fn decide(&self, request: &RequestDescriptor) -> Decision {
    if self.rule.matches(request) {
      Decision::Intercept
    } else {
      Decision::PassThrough
    }
  }

  /// Resolve a matched request. Always yields a usable response.
  pub async fn handle(&self, request: &RequestDescriptor) -> Retrieved {
    self.engine.retrieve(request).await
  }

  /// Resolve the request if it matches, or decline with `None`.
  pub async fn intercept(&self, request: &RequestDescriptor) -> Option<Retrieved> {
    match self.decide(request) {
      Decision::Intercept => Some(self.handle(request).await),
      Decision::PassThrough => None,
    }
  }
}
