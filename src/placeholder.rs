//! Fallback image served when no real photo can be retrieved.

use reqwest::header::{HeaderMap, HeaderValue, CACHE_CONTROL, CONTENT_TYPE};

use crate::cache::StoredResponse;

pub const WIDTH: u32 = 150;
pub const HEIGHT: u32 = 200;
pub const CAPTION: &str = "Sem foto";

const CONTENT_TYPE_SVG: &str = "image/svg+xml";
const CACHE_ONE_HOUR: &str = "public, max-age=3600";

const BACKGROUND: &str = "#f8f9fa";
const BORDER: &str = "#dee2e6";
const SILHOUETTE: &str = "#6c757d";

/// Render the placeholder SVG: a gray head-and-shoulders silhouette on a
/// light card with the caption underneath.
pub fn svg() -> String {
  let cx = WIDTH / 2;
  format!(
    concat!(
      r#"<svg width="{w}" height="{h}" viewBox="0 0 {w} {h}" xmlns="http://www.w3.org/2000/svg">"#,
      r#"<rect width="{w}" height="{h}" fill="{bg}" stroke="{border}" stroke-width="2"/>"#,
      r#"<circle cx="{cx}" cy="70" r="25" fill="{fg}"/>"#,
      r#"<rect x="50" y="110" width="50" height="70" rx="25" fill="{fg}"/>"#,
      r#"<text x="{cx}" y="190" text-anchor="middle" font-family="Arial" font-size="12" fill="{fg}">{caption}</text>"#,
      "</svg>"
    ),
    w = WIDTH,
    h = HEIGHT,
    cx = cx,
    bg = BACKGROUND,
    border = BORDER,
    fg = SILHOUETTE,
    caption = CAPTION,
  )
}

/// Build the placeholder response: status 200, SVG body, one hour of
/// client caching. Same value on every call.
pub fn response() -> StoredResponse {
  let mut headers = HeaderMap::new();
  headers.insert(CONTENT_TYPE, HeaderValue::from_static(CONTENT_TYPE_SVG));
  headers.insert(CACHE_CONTROL, HeaderValue::from_static(CACHE_ONE_HOUR));
  StoredResponse::new(200, headers, svg())
}
