use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use std::time::Duration;
use url::Url;

use super::{FetchError, Transport};
use crate::cache::StoredResponse;
use crate::config::HttpConfig;

/// reqwest-backed transport.
///
/// The client has no cookie store and no default auth, so requests go out
/// without credentials. Redirects are followed with reqwest's default policy.
#[derive(Clone)]
pub struct HttpTransport {
  client: reqwest::Client,
}

impl HttpTransport {
  pub fn new(config: &HttpConfig) -> Result<Self> {
    let client = reqwest::Client::builder()
      .timeout(Duration::from_secs(config.timeout_secs))
      .user_agent(config.user_agent.clone())
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self { client })
  }
}

#[async_trait]
impl Transport for HttpTransport {
  async fn fetch(&self, url: &Url) -> Result<StoredResponse, FetchError> {
    let response = self
      .client
      .get(url.clone())
      .send()
      .await
      .map_err(|e| classify(url, e))?;

    let status = response.status().as_u16();
    let headers = response.headers().clone();

    let body = response.bytes().await.map_err(|e| classify(url, e))?;

    Ok(StoredResponse::new(status, headers, body))
  }
}

fn classify(url: &Url, err: reqwest::Error) -> FetchError {
  if err.is_timeout() {
    FetchError::Timeout {
      url: url.to_string(),
    }
  } else if err.is_body() || err.is_decode() {
    FetchError::Body {
      url: url.to_string(),
      message: err.to_string(),
    }
  } else {
    FetchError::Transport {
      url: url.to_string(),
      message: err.to_string(),
    }
  }
}
