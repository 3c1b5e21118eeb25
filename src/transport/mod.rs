//! Network transport used by the direct and relay tiers.

mod http;

use async_trait::async_trait;
use thiserror::Error;
use url::Url;

use crate::cache::StoredResponse;

pub use http::HttpTransport;

/// A fetch that could not produce a response.
///
/// A completed request with a non-2xx status is not an error at this layer;
/// it comes back as a normal response and the caller decides what to do.
#[derive(Debug, Error)]
pub enum FetchError {
  #[error("request to {url} failed: {message}")]
  Transport { url: String, message: String },

  #[error("request to {url} timed out")]
  Timeout { url: String },

  #[error("failed to read response body from {url}: {message}")]
  Body { url: String, message: String },
}

/// Something that can perform a GET and hand back the whole response.
///
/// Implementations must not attach credentials (cookies, auth headers) to
/// outgoing requests.
#[async_trait]
pub trait Transport: Send + Sync {
  async fn fetch(&self, url: &Url) -> Result<StoredResponse, FetchError>;
}
