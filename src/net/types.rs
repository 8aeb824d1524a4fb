//! Request and response types shared by the proxy, the agent and the cache.

use axum::body::Bytes;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, CONTENT_TYPE};
use reqwest::{Method, StatusCode};
use sha2::{Digest, Sha256};
use url::Url;

use crate::cache::CacheKey;

/// Fetch metadata mode of a request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RequestMode {
  /// Top-level page load
  Navigate,
  /// Same-origin only
  SameOrigin,
  /// No CORS
  #[default]
  NoCors,
  /// CORS
  Cors,
}

impl RequestMode {
  /// Derive the mode from request headers.
  ///
  /// `Sec-Fetch-Mode` wins when present. Clients that do not send fetch
  /// metadata are treated as navigating when a GET accepts `text/html`.
  pub fn from_headers(method: &Method, headers: &HeaderMap) -> Self {
    if let Some(mode) = headers
      .get("sec-fetch-mode")
      .and_then(|v| v.to_str().ok())
    {
      return match mode.trim().to_ascii_lowercase().as_str() {
        "navigate" => Self::Navigate,
        "same-origin" => Self::SameOrigin,
        "cors" => Self::Cors,
        _ => Self::NoCors,
      };
    }

    let accepts_html = headers
      .get_all(ACCEPT)
      .iter()
      .filter_map(|v| v.to_str().ok())
      .any(|v| v.contains("text/html"));

    if *method == Method::GET && accepts_html {
      Self::Navigate
    } else {
      Self::NoCors
    }
  }
}

/// An intercepted request.
#[derive(Debug, Clone)]
pub struct Request {
  pub method: Method,
  /// Absolute URL, including query
  pub url: Url,
  pub headers: HeaderMap,
  pub body: Bytes,
  pub mode: RequestMode,
}

impl Request {
  /// Plain GET for `url`, as issued when seeding the store.
  pub fn get(url: Url) -> Self {
    Self {
      method: Method::GET,
      url,
      headers: HeaderMap::new(),
      body: Bytes::new(),
      mode: RequestMode::NoCors,
    }
  }

  pub fn is_navigation(&self) -> bool {
    self.mode == RequestMode::Navigate
  }
}

impl CacheKey for Request {
  fn cache_hash(&self) -> String {
    // SHA256 hash for stable, fixed-length keys
    let mut hasher = Sha256::new();
    hasher.update(self.description().as_bytes());
    hex::encode(hasher.finalize())
  }

  fn description(&self) -> String {
    format!("{} {}", self.method, self.url)
  }
}

/// A fully buffered response. Cloning shares the body buffer.
#[derive(Debug, Clone)]
pub struct Response {
  pub status: StatusCode,
  pub status_text: String,
  pub headers: HeaderMap,
  pub body: Bytes,
}

impl Response {
  pub fn new(status: StatusCode, headers: HeaderMap, body: Bytes) -> Self {
    Self {
      status,
      status_text: status.canonical_reason().unwrap_or_default().to_string(),
      headers,
      body,
    }
  }

  /// The response returned when offline and nothing is cached.
  pub fn offline() -> Self {
    let mut headers = HeaderMap::new();
    headers.insert(
      CONTENT_TYPE,
      HeaderValue::from_static("text/plain; charset=utf-8"),
    );

    Self {
      status: StatusCode::SERVICE_UNAVAILABLE,
      status_text: "Service Unavailable".to_string(),
      headers,
      body: Bytes::from_static(b"Offline"),
    }
  }

  pub fn is_cacheable(&self) -> bool {
    self.status == StatusCode::OK
  }
}
