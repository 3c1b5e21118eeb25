//! Local HTTP host for the interceptor.
//!
//! `GET /image?url=<absolute URL>` runs the interception decision for the
//! URL. Matching URLs are resolved by the retrieval engine; other URLs are
//! either fetched unmodified (pass-through) or refused.

use axum::body::Body;
use axum::extract::{Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::cache::StoredResponse;
use crate::intercept::{Interceptor, RequestDescriptor};
use crate::transport::Transport;

#[derive(Clone)]
pub struct AppState {
  interceptor: Arc<Interceptor>,
  transport: Arc<dyn Transport>,
  passthrough: bool,
}

impl AppState {
  pub fn new(interceptor: Interceptor, transport: Arc<dyn Transport>, passthrough: bool) -> Self {
    Self {
      interceptor: Arc::new(interceptor),
      transport,
      passthrough,
    }
  }
}

#[derive(Debug, Deserialize)]
struct ImageQuery {
  url: String,
}

pub fn router(state: AppState) -> Router {
  Router::new()
    .route("/image", get(image))
    .route("/health", get(health))
    .with_state(state)
}

/// Serve until Ctrl-C.
pub async fn serve(listen: SocketAddr, state: AppState) -> Result<()> {
  let listener = tokio::net::TcpListener::bind(listen)
    .await
    .map_err(|e| eyre!("Failed to bind {}: {}", listen, e))?;

  info!(%listen, passthrough = state.passthrough, "listening");

  axum::serve(listener, router(state))
    .with_graceful_shutdown(async {
      let _ = tokio::signal::ctrl_c().await;
      info!("shutting down");
    })
    .await
    .map_err(|e| eyre!("Server error: {}", e))
}

async fn health() -> &'static str {
  "ok"
}

async fn image(State(state): State<AppState>, Query(query): Query<ImageQuery>) -> Response {
  let request = match RequestDescriptor::parse(&query.url) {
    Ok(request) => request,
    Err(e) => {
      return (
        StatusCode::BAD_REQUEST,
        format!("invalid url '{}': {}", query.url, e),
      )
        .into_response()
    }
  };

  if let Some(retrieved) = state.interceptor.intercept(&request).await {
    debug!(url = %request.url(), source = %retrieved.source, "intercepted");
    return to_http(retrieved.response);
  }

  if !state.passthrough {
    return (StatusCode::FORBIDDEN, "request not intercepted").into_response();
  }

  match state.transport.fetch(request.url()).await {
    Ok(response) => to_http(response),
    Err(e) => {
      warn!(url = %request.url(), error = %e, "pass-through fetch failed");
      (StatusCode::BAD_GATEWAY, e.to_string()).into_response()
    }
  }
}

/// Convert a stored response into an axum response. Framing headers are
/// dropped since the body is already complete.
fn to_http(stored: StoredResponse) -> Response {
  let status = StatusCode::from_u16(stored.status).unwrap_or(StatusCode::BAD_GATEWAY);

  let mut headers = stored.headers;
  headers.remove(header::TRANSFER_ENCODING);
  headers.remove(header::CONTENT_LENGTH);
  headers.remove(header::CONNECTION);

  let mut response = Response::new(Body::from(stored.body));
  *response.status_mut() = status;
  *response.headers_mut() = headers;
  response
}
