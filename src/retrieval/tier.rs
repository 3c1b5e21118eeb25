//! The ordered retrieval tiers and what each attempt can produce.

use std::fmt;

use super::Retrieved;

/// One retrieval strategy. Tiers run strictly in [`Tier::ORDER`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
  /// Look the URL up in the cache store
  Cache,
  /// Fetch the original URL
  Direct,
  /// Fetch the original URL through the relay endpoint
  Relay,
}

impl Tier {
  pub const ORDER: [Tier; 3] = [Tier::Cache, Tier::Direct, Tier::Relay];
}

impl fmt::Display for Tier {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      Tier::Cache => "cache",
      Tier::Direct => "direct",
      Tier::Relay => "relay",
    };
    f.write_str(name)
  }
}

/// Result of attempting a single tier.
#[derive(Debug)]
pub enum TierOutcome {
  /// The tier produced a response to hand back
  Success(Retrieved),
  /// The tier did not produce a response; move on to the next one
  Skip(SkipReason),
}

/// Why a tier was skipped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
  /// No entry for the URL
  CacheMiss,
  /// The store could not be read
  CacheAccessFailure(String),
  /// The request could not complete
  TransportFailure(String),
  /// The request completed with a non-2xx status
  UpstreamRejection(u16),
}

impl fmt::Display for SkipReason {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      SkipReason::CacheMiss => write!(f, "cache miss"),
      SkipReason::CacheAccessFailure(e) => write!(f, "cache unavailable: {}", e),
      SkipReason::TransportFailure(e) => write!(f, "transport failure: {}", e),
      SkipReason::UpstreamRejection(status) => write!(f, "upstream returned status {}", status),
    }
  }
}
