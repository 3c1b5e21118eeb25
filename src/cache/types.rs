//! Response payloads held by the cache store.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, CONTENT_TYPE};
use reqwest::StatusCode;

/// A complete HTTP response: body bytes, status line and headers.
///
/// This is the value type of the cache store and the shape every retrieval
/// tier produces. Header names are case-insensitive (`HeaderMap` semantics).
#[derive(Debug, Clone, PartialEq)]
pub struct StoredResponse {
  pub body: Bytes,
  pub status: u16,
  pub status_text: String,
  pub headers: HeaderMap,
}

impl StoredResponse {
  /// Create a response, deriving the status text from the status code.
  pub fn new(status: u16, headers: HeaderMap, body: impl Into<Bytes>) -> Self {
    Self {
      body: body.into(),
      status,
      status_text: canonical_reason(status),
      headers,
    }
  }

  /// Whether the status is in the 2xx range.
  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }

  /// Value of a header as a string, if present and valid UTF-8.
  pub fn header(&self, name: &str) -> Option<&str> {
    self.headers.get(name).and_then(|v| v.to_str().ok())
  }

  pub fn content_type(&self) -> Option<&str> {
    self
      .headers
      .get(CONTENT_TYPE)
      .and_then(|v| v.to_str().ok())
  }
}

/// A response read back from the store.
#[derive(Debug, Clone)]
pub struct CachedResponse {
  /// The stored response, byte-identical to what was written
  pub response: StoredResponse,
  /// When the entry was written
  pub cached_at: DateTime<Utc>,
}

/// Standard reason phrase for a status code, or an empty string.
pub fn canonical_reason(status: u16) -> String {
  StatusCode::from_u16(status)
    .ok()
    .and_then(|s| s.canonical_reason())
    .unwrap_or_default()
    .to_string()
}
