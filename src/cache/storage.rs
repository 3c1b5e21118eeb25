//! Cache storage trait and SQLite implementation.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use rusqlite::{params, Connection, OptionalExtension};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use super::types::{CachedResponse, StoredResponse};

/// Trait for cache storage backends.
///
/// Keys are full request URLs. A `put` for an existing key replaces the
/// previous value.
pub trait CacheStorage: Send + Sync {
  /// Look up a stored response by key.
  fn get(&self, key: &str) -> Result<Option<CachedResponse>>;

  /// Store a response under the given key.
  fn put(&self, key: &str, response: &StoredResponse) -> Result<()>;

  /// Backend name for logging.
  fn backend(&self) -> &'static str;
}

/// Storage implementation that doesn't cache anything.
/// Used when caching is disabled - all operations are no-ops.
pub struct NoopStorage;

impl CacheStorage for NoopStorage {
  fn get(&self, _key: &str) -> Result<Option<CachedResponse>> {
    Ok(None) // Always miss
  }

  fn put(&self, _key: &str, _response: &StoredResponse) -> Result<()> {
    Ok(()) // Discard
  }

  fn backend(&self) -> &'static str {
    "none"
  }
}

/// Process-local storage. Entries are lost when the process exits.
#[derive(Default)]
pub struct MemoryStorage {
  entries: Mutex<HashMap<String, CachedResponse>>,
}

impl MemoryStorage {
  pub fn new() -> Self {
    Self::default()
  }
}

impl CacheStorage for MemoryStorage {
  fn get(&self, key: &str) -> Result<Option<CachedResponse>> {
    let entries = self
      .entries
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    Ok(entries.get(key).cloned())
  }

  fn put(&self, key: &str, response: &StoredResponse) -> Result<()> {
    let mut entries = self
      .entries
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    entries.insert(
      key.to_string(),
      CachedResponse {
        response: response.clone(),
        cached_at: Utc::now(),
      },
    );
    Ok(())
  }

  fn backend(&self) -> &'static str {
    "memory"
  }
}

/// SQLite-based cache storage implementation.
///
/// Several named stores can share one database file; each store only sees
/// its own rows. The database is opened on first access, not on
/// construction.
pub struct SqliteStorage {
  path: PathBuf,
  name: String,
  conn: Mutex<Option<Connection>>,
}

impl SqliteStorage {
  /// Create a store backed by the database at `path`.
  pub fn new(path: impl Into<PathBuf>, name: impl Into<String>) -> Self {
    Self {
      path: path.into(),
      name: name.into(),
      conn: Mutex::new(None),
    }
  }

  /// Create a store at the default location.
  pub fn at_default_path(name: impl Into<String>) -> Result<Self> {
    Ok(Self::new(Self::default_path()?, name))
  }

  /// Get the default database path.
  pub fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("bandep-proxy").join("cache.db"))
  }

  pub fn path(&self) -> &Path {
    &self.path
  }

  /// Run `f` against the connection, opening the database first if needed.
  fn with_conn<R>(&self, f: impl FnOnce(&Connection) -> Result<R>) -> Result<R> {
    let mut guard = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    if guard.is_none() {
      *guard = Some(Self::open(&self.path)?);
    }

    match guard.as_ref() {
      Some(conn) => f(conn),
      None => Err(eyre!("Cache database at {} is not open", self.path.display())),
    }
  }

  fn open(path: &Path) -> Result<Connection> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;

    conn
      .execute_batch(CACHE_SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))?;

    tracing::debug!(path = %path.display(), "opened cache database");
    Ok(conn)
  }
}

/// Schema for cache tables.
const CACHE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS response_cache (
    cache_name TEXT NOT NULL,
    url TEXT NOT NULL,
    status INTEGER NOT NULL,
    status_text TEXT NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    body_sha256 TEXT NOT NULL,
    cached_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (cache_name, url)
);
"#;

impl CacheStorage for SqliteStorage {
  fn get(&self, key: &str) -> Result<Option<CachedResponse>> {
    self.with_conn(|conn| {
      let mut stmt = conn
        .prepare(
          "SELECT status, status_text, headers, body, body_sha256, cached_at
           FROM response_cache
           WHERE cache_name = ? AND url = ?",
        )
        .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

      let row: Option<(i64, String, String, Vec<u8>, String, String)> = stmt
        .query_row(params![self.name, key], |row| {
          Ok((
            row.get(0)?,
            row.get(1)?,
            row.get(2)?,
            row.get(3)?,
            row.get(4)?,
            row.get(5)?,
          ))
        })
        .optional()
        .map_err(|e| eyre!("Failed to read cache entry for {}: {}", key, e))?;

      let Some((status, status_text, headers, body, digest, cached_at)) = row else {
        return Ok(None);
      };

      if body_digest(&body) != digest {
        return Err(eyre!("Cached body for {} failed digest check", key));
      }

      let status =
        u16::try_from(status).map_err(|_| eyre!("Invalid cached status {} for {}", status, key))?;

      Ok(Some(CachedResponse {
        response: StoredResponse {
          body: body.into(),
          status,
          status_text,
          headers: decode_headers(&headers)?,
        },
        cached_at: parse_datetime(&cached_at)?,
      }))
    })
  }

  fn put(&self, key: &str, response: &StoredResponse) -> Result<()> {
    let headers = encode_headers(&response.headers)?;
    let digest = body_digest(&response.body);

    self.with_conn(|conn| {
      conn
        .execute(
          "INSERT OR REPLACE INTO response_cache
             (cache_name, url, status, status_text, headers, body, body_sha256, cached_at)
           VALUES (?, ?, ?, ?, ?, ?, ?, datetime('now'))",
          params![
            self.name,
            key,
            response.status,
            response.status_text,
            headers,
            response.body.as_ref(),
            digest
          ],
        )
        .map_err(|e| eyre!("Failed to store cache entry for {}: {}", key, e))?;
      Ok(())
    })
  }

  fn backend(&self) -> &'static str {
    "sqlite"
  }
}

/// Hex SHA-256 of a response body.
fn body_digest(body: &[u8]) -> String {
  let mut hasher = Sha256::new();
  hasher.update(body);
  hex::encode(hasher.finalize())
}

/// Serialize headers as a JSON list of `[name, hex value]` pairs, keeping
/// repeated headers. Values are hex-encoded since they may hold non-UTF-8
/// bytes.
fn encode_headers(headers: &HeaderMap) -> Result<String> {
  let pairs: Vec<(&str, String)> = headers
    .iter()
    .map(|(name, value)| (name.as_str(), hex::encode(value.as_bytes())))
    .collect();

  serde_json::to_string(&pairs).map_err(|e| eyre!("Failed to serialize headers: {}", e))
}

fn decode_headers(json: &str) -> Result<HeaderMap> {
  let pairs: Vec<(String, String)> =
    serde_json::from_str(json).map_err(|e| eyre!("Failed to deserialize headers: {}", e))?;

  let mut headers = HeaderMap::with_capacity(pairs.len());
  for (name, value) in pairs {
    let name = HeaderName::from_bytes(name.as_bytes())
      .map_err(|e| eyre!("Invalid cached header name '{}': {}", name, e))?;
    let bytes =
      hex::decode(&value).map_err(|e| eyre!("Invalid cached header value for {}: {}", name, e))?;
    let value = HeaderValue::from_bytes(&bytes)
      .map_err(|e| eyre!("Invalid cached header value for {}: {}", name, e))?;
    headers.append(name, value);
  }
  Ok(headers)
}

/// Parse a datetime string from SQLite format.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  // SQLite stores as "YYYY-MM-DD HH:MM:SS"
  chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
    .map(|dt| dt.and_utc())
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}
