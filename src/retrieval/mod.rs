//! Cache-first retrieval with graceful degradation.
//!
//! A request is resolved by trying, in order: the cache store, a direct
//! fetch, a fetch through the relay, and finally the generated placeholder.
//! Successful network tiers write their response back to the cache.

mod engine;
mod tier;

use chrono::{DateTime, Utc};
use std::fmt;
use thiserror::Error;

use crate::cache::StoredResponse;
use crate::placeholder;

pub use engine::RetrievalEngine;

/// A failure that aborts the tier sequence and degrades straight to the
/// placeholder.
#[derive(Debug, Error)]
pub enum RetrievalError {
  #[error("relay endpoint {0} cannot carry a query string")]
  InvalidRelayEndpoint(String),

  #[error("retrieval panicked: {0}")]
  Panicked(String),
}

/// Response produced by the engine, with where it came from.
#[derive(Debug, Clone)]
pub struct Retrieved {
  /// The response to hand back to the caller
  pub response: StoredResponse,
  /// Which tier produced it
  pub source: ResponseSource,
  /// When the response was cached (if from cache)
  pub cached_at: Option<DateTime<Utc>>,
}

impl Retrieved {
  /// Create a result from a cache hit.
  pub fn from_cache(response: StoredResponse, cached_at: DateTime<Utc>) -> Self {
    Self {
      response,
      source: ResponseSource::Cache,
      cached_at: Some(cached_at),
    }
  }

  /// Create a result from a network tier.
  pub fn from_network(response: StoredResponse, source: ResponseSource) -> Self {
    Self {
      response,
      source,
      cached_at: None,
    }
  }

  /// Create the last-resort placeholder result.
  pub fn placeholder() -> Self {
    Self {
      response: placeholder::response(),
      source: ResponseSource::Placeholder,
      cached_at: None,
    }
  }
}

/// Indicates which tier produced a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseSource {
  /// Served from the cache store
  Cache,
  /// Fetched from the original URL
  Direct,
  /// Fetched through the relay and re-headered
  Relay,
  /// Generated because every other tier failed
  Placeholder,
}

impl fmt::Display for ResponseSource {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      ResponseSource::Cache => "cache",
      ResponseSource::Direct => "direct",
      ResponseSource::Relay => "relay",
      ResponseSource::Placeholder => "placeholder",
    };
    f.write_str(name)
  }
}
