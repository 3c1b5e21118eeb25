//! Retrieval engine that walks the tiers for one request.

use futures::FutureExt;
use reqwest::header::{HeaderMap, HeaderValue, CACHE_CONTROL, CONTENT_TYPE};
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use url::Url;

use super::tier::{SkipReason, Tier, TierOutcome};
use super::{ResponseSource, RetrievalError, Retrieved};
use crate::cache::{CacheStorage, StoredResponse};
use crate::config::RelayConfig;
use crate::intercept::RequestDescriptor;
use crate::transport::Transport;

const RELAY_CONTENT_TYPE: &str = "image/jpeg";
const RELAY_CACHE_CONTROL: &str = "public, max-age=86400";

/// Resolves requests through cache, direct fetch, relay and placeholder.
///
/// The engine holds no per-request state; concurrent calls for the same URL
/// each run the full sequence and may both write the cache.
#[derive(Clone)]
pub struct RetrievalEngine {
  storage: Arc<dyn CacheStorage>,
  transport: Arc<dyn Transport>,
  relay: RelayConfig,
}

impl RetrievalEngine {
  pub fn new(
    storage: Arc<dyn CacheStorage>,
    transport: Arc<dyn Transport>,
    relay: RelayConfig,
  ) -> Self {
    Self {
      storage,
      transport,
      relay,
    }
  }

  /// Resolve a request to a response.
  ///
  /// Never fails: any error or panic inside the tier sequence degrades to
  /// the placeholder.
  pub async fn retrieve(&self, request: &RequestDescriptor) -> Retrieved {
    let url = request.url();

    match AssertUnwindSafe(self.resolve(request)).catch_unwind().await {
      Ok(Ok(retrieved)) => retrieved,
      Ok(Err(e)) => {
        error!(%url, error = %e, "retrieval failed, serving placeholder");
        Retrieved::placeholder()
      }
      Err(panic) => {
        let e = RetrievalError::Panicked(panic_message(panic.as_ref()));
        error!(%url, error = %e, "retrieval failed, serving placeholder");
        Retrieved::placeholder()
      }
    }
  }

  async fn resolve(&self, request: &RequestDescriptor) -> Result<Retrieved, RetrievalError> {
    let url = request.url();

    for tier in Tier::ORDER {
      match self.attempt(tier, request).await? {
        TierOutcome::Success(retrieved) => {
          info!(%url, %tier, status = retrieved.response.status, "served");
          return Ok(retrieved);
        }
        TierOutcome::Skip(reason) => {
          debug!(%url, %tier, %reason, "tier skipped");
        }
      }
    }

    warn!(%url, "all tiers failed, serving placeholder");
    Ok(Retrieved::placeholder())
  }

  /// Run a single tier.
  ///
  /// Only failures that should abort the whole sequence come back as `Err`;
  /// everything the next tier can recover from is a `Skip`.
  pub async fn attempt(
    &self,
    tier: Tier,
    request: &RequestDescriptor,
  ) -> Result<TierOutcome, RetrievalError> {
    match tier {
      Tier::Cache => Ok(self.lookup(request)),
      Tier::Direct => Ok(self.fetch_direct(request).await),
      Tier::Relay => self.fetch_relay(request).await,
    }
  }

  fn lookup(&self, request: &RequestDescriptor) -> TierOutcome {
    let key = request.cache_key();
    match self.storage.get(key) {
      Ok(Some(cached)) => {
        debug!(url = %key, cached_at = %cached.cached_at, "cache hit");
        TierOutcome::Success(Retrieved::from_cache(cached.response, cached.cached_at))
      }
      Ok(None) => TierOutcome::Skip(SkipReason::CacheMiss),
      Err(e) => {
        warn!(
          url = %key,
          backend = self.storage.backend(),
          error = %e,
          "cache read failed, treating as miss"
        );
        TierOutcome::Skip(SkipReason::CacheAccessFailure(e.to_string()))
      }
    }
  }

  async fn fetch_direct(&self, request: &RequestDescriptor) -> TierOutcome {
    let response = match self.transport.fetch(request.url()).await {
      Ok(response) => response,
      Err(e) => return TierOutcome::Skip(SkipReason::TransportFailure(e.to_string())),
    };

    if !response.is_success() {
      return TierOutcome::Skip(SkipReason::UpstreamRejection(response.status));
    }

    self.store(request.cache_key(), &response);
    TierOutcome::Success(Retrieved::from_network(response, ResponseSource::Direct))
  }

  async fn fetch_relay(&self, request: &RequestDescriptor) -> Result<TierOutcome, RetrievalError> {
    let relay_url = relay_url(&self.relay, request.url())?;
    debug!(url = %request.url(), %relay_url, "fetching through relay");

    let relayed = match self.transport.fetch(&relay_url).await {
      Ok(response) => response,
      Err(e) => {
        return Ok(TierOutcome::Skip(SkipReason::TransportFailure(
          e.to_string(),
        )))
      }
    };

    if !relayed.is_success() {
      return Ok(TierOutcome::Skip(SkipReason::UpstreamRejection(
        relayed.status,
      )));
    }

    let response = reheader_relayed(relayed);
    self.store(request.cache_key(), &response);
    Ok(TierOutcome::Success(Retrieved::from_network(
      response,
      ResponseSource::Relay,
    )))
  }

  /// Best-effort cache write.
  fn store(&self, key: &str, response: &StoredResponse) {
    if let Err(e) = self.storage.put(key, response) {
      warn!(
        url = %key,
        backend = self.storage.backend(),
        error = %e,
        "cache write failed"
      );
    }
  }
}

/// Build the relay URL carrying `original` percent-encoded in the configured
/// query parameter.
pub fn relay_url(relay: &RelayConfig, original: &Url) -> Result<Url, RetrievalError> {
  if relay.endpoint.cannot_be_a_base() {
    return Err(RetrievalError::InvalidRelayEndpoint(
      relay.endpoint.to_string(),
    ));
  }

  let mut url = relay.endpoint.clone();
  url
    .query_pairs_mut()
    .append_pair(&relay.query_param, original.as_str());
  Ok(url)
}

/// Keep the relay's body and status line but replace every header.
fn reheader_relayed(relayed: StoredResponse) -> StoredResponse {
  let mut headers = HeaderMap::new();
  headers.insert(CONTENT_TYPE, HeaderValue::from_static(RELAY_CONTENT_TYPE));
  headers.insert(CACHE_CONTROL, HeaderValue::from_static(RELAY_CACHE_CONTROL));

  StoredResponse {
    body: relayed.body,
    status: relayed.status,
    status_text: relayed.status_text,
    headers,
  }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
  if let Some(s) = panic.downcast_ref::<&str>() {
    s.to_string()
  } else if let Some(s) = panic.downcast_ref::<String>() {
    s.clone()
  } else {
    "unknown panic".to_string()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{CachedResponse, MemoryStorage};
  use crate::transport::FetchError;
  use async_trait::async_trait;
  use color_eyre::eyre::eyre;
  use std::collections::HashMap;
  use std::sync::atomic::{AtomicUsize, Ordering};
  use std::sync::Mutex;

  const PHOTO: &str = "https://camara.leg.br/deputado/bandep/555.jpg";
  const RELAYED_PHOTO: &str =
    "https://api.allorigins.win/raw?url=https%3A%2F%2Fcamara.leg.br%2Fdeputado%2Fbandep%2F555.jpg";
  const JPEG: [u8; 6] = [0xFF, 0xD8, 0xFF, 0xE0, 0x00, 0x10];

  enum Reply {
    Respond(StoredResponse),
    Panic,
  }

  /// Transport with scripted replies per URL. Unscripted URLs fail like an
  /// unreachable host.
  #[derive(Default)]
  struct FakeTransport {
    replies: Mutex<HashMap<String, Reply>>,
    calls: Mutex<Vec<String>>,
  }

  impl FakeTransport {
    fn reply(self, url: &str, response: StoredResponse) -> Self {
      self
        .replies
        .lock()
        .unwrap()
        .insert(url.to_string(), Reply::Respond(response));
      self
    }

    fn panic_on(self, url: &str) -> Self {
      self
        .replies
        .lock()
        .unwrap()
        .insert(url.to_string(), Reply::Panic);
      self
    }

    fn calls(&self) -> Vec<String> {
      self.calls.lock().unwrap().clone()
    }
  }

  #[async_trait]
  impl Transport for FakeTransport {
    async fn fetch(&self, url: &Url) -> Result<StoredResponse, FetchError> {
      self.calls.lock().unwrap().push(url.to_string());
      tokio::task::yield_now().await;

      let response = match self.replies.lock().unwrap().get(url.as_str()) {
        Some(Reply::Respond(response)) => Some(response.clone()),
        Some(Reply::Panic) => None,
        None => {
          return Err(FetchError::Transport {
            url: url.to_string(),
            message: "network unreachable".to_string(),
          })
        }
      };

      match response {
        Some(response) => Ok(response),
        None => panic!("transport exploded"),
      }
    }
  }

  /// Memory store that counts writes.
  #[derive(Default)]
  struct CountingStorage {
    inner: MemoryStorage,
    puts: AtomicUsize,
  }

  impl CacheStorage for CountingStorage {
    fn get(&self, key: &str) -> color_eyre::Result<Option<CachedResponse>> {
      self.inner.get(key)
    }

    fn put(&self, key: &str, response: &StoredResponse) -> color_eyre::Result<()> {
      self.puts.fetch_add(1, Ordering::SeqCst);
      self.inner.put(key, response)
    }

    fn backend(&self) -> &'static str {
      "counting"
    }
  }

  /// Store whose every operation fails.
  struct BrokenStorage;

  impl CacheStorage for BrokenStorage {
    fn get(&self, _key: &str) -> color_eyre::Result<Option<CachedResponse>> {
      Err(eyre!("disk on fire"))
    }

    fn put(&self, _key: &str, _response: &StoredResponse) -> color_eyre::Result<()> {
      Err(eyre!("disk on fire"))
    }

    fn backend(&self) -> &'static str {
      "broken"
    }
  }

  fn response(status: u16, headers: &[(&'static str, &'static str)], body: &[u8]) -> StoredResponse {
    let mut map = HeaderMap::new();
    for (name, value) in headers {
      map.insert(*name, HeaderValue::from_static(*value));
    }
    StoredResponse::new(status, map, body.to_vec())
  }

  fn direct_jpeg() -> StoredResponse {
    response(
      200,
      &[("content-type", "image/jpeg"), ("etag", "\"abc\"")],
      &JPEG,
    )
  }

  fn relay_ok() -> StoredResponse {
    response(
      200,
      &[
        ("content-type", "application/octet-stream"),
        ("access-control-allow-origin", "*"),
        ("cache-control", "no-store"),
      ],
      &JPEG,
    )
  }

  fn engine(
    storage: Arc<dyn CacheStorage>,
    transport: Arc<FakeTransport>,
  ) -> RetrievalEngine {
    RetrievalEngine::new(storage, transport, RelayConfig::default())
  }

  fn photo() -> RequestDescriptor {
    RequestDescriptor::parse(PHOTO).unwrap()
  }

  fn assert_relay_headers(resp: &StoredResponse) {
    assert_eq!(resp.headers.len(), 2);
    assert_eq!(resp.header("Content-Type"), Some("image/jpeg"));
    assert_eq!(resp.header("Cache-Control"), Some("public, max-age=86400"));
  }

  fn assert_placeholder(retrieved: &Retrieved) {
    assert_eq!(retrieved.source, ResponseSource::Placeholder);
    assert_eq!(retrieved.response.status, 200);
    assert_eq!(retrieved.response.content_type(), Some("image/svg+xml"));
  }

  #[test]
  fn test_relay_url_percent_encodes_original() {
    let url = relay_url(&RelayConfig::default(), &Url::parse(PHOTO).unwrap()).unwrap();
    assert_eq!(url.as_str(), RELAYED_PHOTO);
  }

  #[test]
  fn test_relay_url_encodes_query_of_original() {
    let original = Url::parse("https://camara.leg.br/deputado/bandep/1.jpg?a=1&b=2").unwrap();
    let url = relay_url(&RelayConfig::default(), &original).unwrap();
    assert_eq!(
      url.as_str(),
      "https://api.allorigins.win/raw?url=https%3A%2F%2Fcamara.leg.br%2Fdeputado%2Fbandep%2F1.jpg%3Fa%3D1%26b%3D2"
    );
  }

  #[test]
  fn test_relay_url_rejects_opaque_endpoint() {
    let relay = RelayConfig {
      endpoint: Url::parse("mailto:relay@example.com").unwrap(),
      ..RelayConfig::default()
    };
    let err = relay_url(&relay, &Url::parse(PHOTO).unwrap()).unwrap_err();
    assert!(matches!(err, RetrievalError::InvalidRelayEndpoint(_)));
  }

  #[tokio::test]
  async fn test_cache_hit_short_circuits() {
    let storage = Arc::new(CountingStorage::default());
    let cached = response(200, &[("content-type", "image/png")], b"stored bytes");
    storage.inner.put(PHOTO, &cached).unwrap();
    let transport = Arc::new(FakeTransport::default().reply(PHOTO, direct_jpeg()));

    let retrieved = engine(storage.clone(), transport.clone())
      .retrieve(&photo())
      .await;

    assert_eq!(retrieved.source, ResponseSource::Cache);
    assert!(retrieved.cached_at.is_some());
    assert_eq!(retrieved.response, cached);
    assert!(transport.calls().is_empty());
    assert_eq!(storage.puts.load(Ordering::SeqCst), 0);
  }

  #[tokio::test]
  async fn test_direct_success_skips_relay_and_caches_unmodified() {
    let storage = Arc::new(CountingStorage::default());
    let transport = Arc::new(
      FakeTransport::default()
        .reply(PHOTO, direct_jpeg())
        .reply(RELAYED_PHOTO, relay_ok()),
    );

    let retrieved = engine(storage.clone(), transport.clone())
      .retrieve(&photo())
      .await;

    assert_eq!(retrieved.source, ResponseSource::Direct);
    assert_eq!(retrieved.response, direct_jpeg());
    assert_eq!(transport.calls(), vec![PHOTO.to_string()]);

    let cached = storage.get(PHOTO).unwrap().unwrap();
    assert_eq!(cached.response, direct_jpeg());
  }

  #[tokio::test]
  async fn test_relay_headers_are_replaced() {
    let storage = Arc::new(CountingStorage::default());
    let transport = Arc::new(FakeTransport::default().reply(RELAYED_PHOTO, relay_ok()));

    let retrieved = engine(storage, transport).retrieve(&photo()).await;

    assert_eq!(retrieved.source, ResponseSource::Relay);
    assert_relay_headers(&retrieved.response);
    assert!(retrieved.response.header("access-control-allow-origin").is_none());
  }

  #[tokio::test]
  async fn test_relay_success_is_cached_under_original_url() {
    let storage = Arc::new(CountingStorage::default());
    let transport = Arc::new(FakeTransport::default().reply(RELAYED_PHOTO, relay_ok()));
    let engine = engine(storage.clone(), transport.clone());

    let first = engine.retrieve(&photo()).await;
    let second = engine.retrieve(&photo()).await;

    assert_eq!(first.source, ResponseSource::Relay);
    assert_eq!(second.source, ResponseSource::Cache);
    assert_eq!(second.response, first.response);
    assert_relay_headers(&second.response);
    assert_eq!(
      transport.calls(),
      vec![PHOTO.to_string(), RELAYED_PHOTO.to_string()]
    );
    assert!(storage.get(RELAYED_PHOTO).unwrap().is_none());
  }

  #[tokio::test]
  async fn test_relay_rejection_serves_placeholder_without_caching() {
    let storage = Arc::new(CountingStorage::default());
    let transport = Arc::new(
      FakeTransport::default().reply(RELAYED_PHOTO, response(404, &[], b"not found")),
    );

    let retrieved = engine(storage.clone(), transport.clone())
      .retrieve(&photo())
      .await;

    assert_placeholder(&retrieved);
    assert_eq!(storage.puts.load(Ordering::SeqCst), 0);
    assert!(storage.get(PHOTO).unwrap().is_none());
  }

  #[tokio::test]
  async fn test_unreachable_direct_falls_back_to_relay() {
    let storage = Arc::new(CountingStorage::default());
    let relayed_body = [0xFF, 0xD8, 0xFF, 0xDB, 0x00, 0x43, 0x00];
    let transport = Arc::new(FakeTransport::default().reply(
      RELAYED_PHOTO,
      response(200, &[("content-type", "text/plain")], &relayed_body),
    ));

    let retrieved = engine(storage.clone(), transport.clone())
      .retrieve(&photo())
      .await;

    assert_eq!(retrieved.response.status, 200);
    assert_relay_headers(&retrieved.response);
    assert_eq!(retrieved.response.body.as_ref(), &relayed_body);

    let cached = storage.get(PHOTO).unwrap().unwrap();
    assert_eq!(cached.response, retrieved.response);
  }

  #[tokio::test]
  async fn test_direct_rejection_is_not_cached_and_falls_through() {
    let storage = Arc::new(CountingStorage::default());
    let transport = Arc::new(
      FakeTransport::default()
        .reply(PHOTO, response(403, &[("content-type", "text/html")], b"denied"))
        .reply(RELAYED_PHOTO, relay_ok()),
    );

    let retrieved = engine(storage.clone(), transport.clone())
      .retrieve(&photo())
      .await;

    assert_eq!(retrieved.source, ResponseSource::Relay);
    assert_eq!(storage.puts.load(Ordering::SeqCst), 1);
    assert_relay_headers(&storage.get(PHOTO).unwrap().unwrap().response);
  }

  #[tokio::test]
  async fn test_all_tiers_failing_serves_placeholder() {
    let storage = Arc::new(CountingStorage::default());
    let transport = Arc::new(FakeTransport::default());

    let retrieved = engine(storage.clone(), transport.clone())
      .retrieve(&photo())
      .await;

    assert_placeholder(&retrieved);
    assert_eq!(transport.calls().len(), 2);
    assert_eq!(storage.puts.load(Ordering::SeqCst), 0);
  }

  #[tokio::test]
  async fn test_cache_read_failure_is_a_miss_and_write_failure_is_ignored() {
    let transport = Arc::new(FakeTransport::default().reply(PHOTO, direct_jpeg()));

    let retrieved = engine(Arc::new(BrokenStorage), transport.clone())
      .retrieve(&photo())
      .await;

    assert_eq!(retrieved.source, ResponseSource::Direct);
    assert_eq!(retrieved.response, direct_jpeg());
  }

  #[tokio::test]
  async fn test_relay_success_survives_cache_write_failure() {
    let transport = Arc::new(FakeTransport::default().reply(RELAYED_PHOTO, relay_ok()));

    let retrieved = engine(Arc::new(BrokenStorage), transport.clone())
      .retrieve(&photo())
      .await;

    assert_eq!(retrieved.source, ResponseSource::Relay);
    assert_relay_headers(&retrieved.response);
    assert_eq!(retrieved.response.body.as_ref(), &JPEG);
    assert_eq!(
      transport.calls(),
      vec![PHOTO.to_string(), RELAYED_PHOTO.to_string()]
    );
  }

  #[tokio::test]
  async fn test_panic_in_transport_degrades_to_placeholder() {
    let storage = Arc::new(CountingStorage::default());
    let transport = Arc::new(FakeTransport::default().panic_on(PHOTO));

    let retrieved = engine(storage.clone(), transport.clone())
      .retrieve(&photo())
      .await;

    assert_placeholder(&retrieved);
    assert_eq!(storage.puts.load(Ordering::SeqCst), 0);
  }

  #[tokio::test]
  async fn test_invalid_relay_endpoint_degrades_to_placeholder() {
    let storage = Arc::new(CountingStorage::default());
    let transport = Arc::new(FakeTransport::default());
    let relay = RelayConfig {
      endpoint: Url::parse("data:text/plain,relay").unwrap(),
      ..RelayConfig::default()
    };

    let retrieved = RetrievalEngine::new(storage, transport.clone(), relay)
      .retrieve(&photo())
      .await;

    assert_placeholder(&retrieved);
    assert_eq!(transport.calls(), vec![PHOTO.to_string()]);
  }

  #[tokio::test]
  async fn test_concurrent_identical_requests_are_not_deduplicated() {
    let storage = Arc::new(CountingStorage::default());
    let transport = Arc::new(FakeTransport::default().reply(PHOTO, direct_jpeg()));
    let engine = engine(storage.clone(), transport.clone());
    let request = photo();

    let (a, b) = futures::join!(engine.retrieve(&request), engine.retrieve(&request));

    assert_eq!(a.source, ResponseSource::Direct);
    assert_eq!(b.source, ResponseSource::Direct);
    assert_eq!(transport.calls().len(), 2);
    assert_eq!(storage.puts.load(Ordering::SeqCst), 2);
  }

  #[tokio::test]
  async fn test_attempt_runs_a_single_tier() {
    let storage = Arc::new(CountingStorage::default());
    let transport = Arc::new(FakeTransport::default().reply(RELAYED_PHOTO, relay_ok()));
    let engine = engine(storage.clone(), transport.clone());

    let outcome = engine.attempt(Tier::Cache, &photo()).await.unwrap();
    assert!(matches!(outcome, TierOutcome::Skip(SkipReason::CacheMiss)));

    let outcome = engine.attempt(Tier::Direct, &photo()).await.unwrap();
    assert!(matches!(
      outcome,
      TierOutcome::Skip(SkipReason::TransportFailure(_))
    ));

    let outcome = engine.attempt(Tier::Relay, &photo()).await.unwrap();
    match outcome {
      TierOutcome::Success(retrieved) => {
        assert_eq!(retrieved.source, ResponseSource::Relay);
        assert_relay_headers(&retrieved.response);
      }
      other => panic!("expected relay success, got {:?}", other),
    }
    assert_eq!(transport.calls(), vec![PHOTO.to_string(), RELAYED_PHOTO.to_string()]);
  }
}
