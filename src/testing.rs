//! Shared fixtures for unit tests.

use async_trait::async_trait;
use axum::body::Bytes;
use color_eyre::{eyre::eyre, Result};
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use reqwest::StatusCode;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use url::Url;

use crate::agent::AgentSettings;
use crate::net::{Network, Request, RequestMode, Response};

pub const ORIGIN: &str = "https://prep.example.org/";

pub fn url(path: &str) -> Url {
  Url::parse(ORIGIN).unwrap().join(path).unwrap()
}

/// Same-origin subresource GET.
pub fn get(path: &str) -> Request {
  Request::get(url(path))
}

/// Same-origin top-level page load.
pub fn navigate(path: &str) -> Request {
  let mut request = get(path);
  request.mode = RequestMode::Navigate;
  request
}

pub fn html(body: &str) -> Response {
  let mut headers = HeaderMap::new();
  headers.insert(
    CONTENT_TYPE,
    HeaderValue::from_static("text/html; charset=utf-8"),
  );
  Response::new(StatusCode::OK, headers, Bytes::from(body.to_string()))
}

pub fn settings(version: &str, seeds: &[&str]) -> AgentSettings {
  AgentSettings {
    version: version.to_string(),
    origin: Url::parse(ORIGIN).unwrap(),
    seed_assets: seeds.iter().map(|s| s.to_string()).collect(),
    exclude: vec!["/rest/".into(), "/auth/".into(), "supabase".into()],
    skip_waiting: true,
  }
}

/// In-memory origin: serves registered paths, 404 for anything else.
#[derive(Default)]
pub struct FakeNetwork {
  responses: Mutex<HashMap<String, Response>>,
  calls: Mutex<HashMap<String, usize>>,
  offline: AtomicBool,
}

impl FakeNetwork {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn serve(&self, path: &str, response: Response) {
    self
      .responses
      .lock()
      .unwrap()
      .insert(path.to_string(), response);
  }

  pub fn set_offline(&self, offline: bool) {
    self.offline.store(offline, Ordering::SeqCst);
  }

  /// Number of fetches seen for `path`, online or not.
  pub fn calls(&self, path: &str) -> usize {
    self.calls.lock().unwrap().get(path).copied().unwrap_or(0)
  }
}

#[async_trait]
impl Network for FakeNetwork {
  async fn fetch(&self, request: &Request) -> Result<Response> {
    let path = request.url.path().to_string();
    *self.calls.lock().unwrap().entry(path.clone()).or_default() += 1;

    if self.offline.load(Ordering::SeqCst) {
      return Err(eyre!("Failed to fetch {}: network unreachable", request.url));
    }

    let response = self.responses.lock().unwrap().get(&path).cloned();
    Ok(response.unwrap_or_else(|| {
      Response::new(StatusCode::NOT_FOUND, HeaderMap::new(), Bytes::new())
    }))
  }
}
