use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use reqwest::header::{HeaderMap, ACCEPT_ENCODING, CONTENT_LENGTH, HOST};
use std::time::Duration;

use super::types::{Request, Response};
use super::Network;
use crate::config::Config;

/// Headers that describe a single connection and must not be forwarded.
const HOP_BY_HOP: &[&str] = &[
  "connection",
  "keep-alive",
  "proxy-authenticate",
  "proxy-authorization",
  "te",
  "trailer",
  "transfer-encoding",
  "upgrade",
];

/// Network access to the origin server over HTTP
#[derive(Clone)]
pub struct HttpNetwork {
  client: reqwest::Client,
}

impl HttpNetwork {
  pub fn new(config: &Config) -> Result<Self> {
    let client = reqwest::Client::builder()
      .timeout(Duration::from_secs(config.network.timeout_secs))
      // Redirects are handed back to the browser untouched
      .redirect(reqwest::redirect::Policy::none())
      .user_agent(concat!("shellcache/", env!("CARGO_PKG_VERSION")))
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self { client })
  }
}

#[async_trait]
impl Network for HttpNetwork {
  async fn fetch(&self, request: &Request) -> Result<Response> {
    let mut builder = self
      .client
      .request(request.method.clone(), request.url.clone())
      .headers(forwardable(&request.headers));
    if !request.body.is_empty() {
      builder = builder.body(request.body.clone());
    }

    let response = builder
      .send()
      .await
      .map_err(|e| eyre!("Failed to fetch {}: {}", request.url, e))?;

    let status = response.status();
    let headers = forwardable(response.headers());
    let body = response
      .bytes()
      .await
      .map_err(|e| eyre!("Failed to read body of {}: {}", request.url, e))?;

    Ok(Response::new(status, headers, body))
  }
}

/// Copy of `headers` without hop-by-hop headers.
///
/// `Host` and `Content-Length` are recomputed for the outgoing message, and
/// `Accept-Encoding` is left to the client so bodies arrive decoded.
pub fn forwardable(headers: &HeaderMap) -> HeaderMap {
  let mut out = headers.clone();
  for name in HOP_BY_HOP {
    out.remove(*name);
  }
  out.remove(HOST);
  out.remove(CONTENT_LENGTH);
  out.remove(ACCEPT_ENCODING);
  out
}
