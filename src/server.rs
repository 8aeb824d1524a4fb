//! HTTP front end: every incoming request goes through the registration's
//! controller, and anything it does not intercept is passed straight through.

use axum::body::{to_bytes, Body, Bytes};
use axum::extract::{Request as HttpRequest, State};
use axum::http::request::Parts;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response as HttpResponse};
use axum::Router;
use color_eyre::{eyre::eyre, Result};
use std::sync::Arc;
use tracing::{debug, warn};
use url::Url;

use crate::agent::Interception;
use crate::cache::CacheStorage;
use crate::net::{forwardable, Network, Request, RequestMode, Response};
use crate::registration::Registration;

/// Request bodies larger than this are rejected.
const MAX_BODY_BYTES: usize = 32 * 1024 * 1024;

pub struct Proxy<S: CacheStorage, N: Network> {
  registration: Arc<Registration<S, N>>,
  network: Arc<N>,
  origin: Url,
}

impl<S: CacheStorage, N: Network> Proxy<S, N> {
  pub fn new(registration: Arc<Registration<S, N>>, network: Arc<N>, origin: Url) -> Self {
    Self {
      registration,
      network,
      origin,
    }
  }
}

pub fn router<S, N>(proxy: Arc<Proxy<S, N>>) -> Router
where
  S: CacheStorage + 'static,
  N: Network + 'static,
{
  Router::new().fallback(intercept::<S, N>).with_state(proxy)
}

async fn intercept<S, N>(State(proxy): State<Arc<Proxy<S, N>>>, request: HttpRequest) -> HttpResponse
where
  S: CacheStorage + 'static,
  N: Network + 'static,
{
  let (parts, body) = request.into_parts();
  let body = match to_bytes(body, MAX_BODY_BYTES).await {
    Ok(body) => body,
    Err(e) => {
      warn!(uri = %parts.uri, error = %e, "Failed to read request body");
      return (StatusCode::PAYLOAD_TOO_LARGE, "Request body too large").into_response();
    }
  };

  let request = match to_agent_request(&parts, body, &proxy.origin) {
    Ok(request) => request,
    Err(e) => {
      warn!(uri = %parts.uri, error = %e, "Rejected request");
      return (StatusCode::BAD_REQUEST, "Bad request").into_response();
    }
  };

  match proxy.registration.handle(&request).await {
    Some(Interception::Respond(result)) => into_http_response(result.response),
    Some(Interception::Bypass(_)) | None => pass_through(proxy.network.as_ref(), &request).await,
  }
}

/// The default network path: fetch and relay, no cache involvement.
async fn pass_through<N: Network>(network: &N, request: &Request) -> HttpResponse {
  match network.fetch(request).await {
    Ok(response) => into_http_response(response),
    Err(e) => {
      debug!(url = %request.url, error = %e, "Pass-through fetch failed");
      (StatusCode::BAD_GATEWAY, "Bad Gateway").into_response()
    }
  }
}

/// Resolve the incoming request against the origin.
///
/// Origin-form targets (`/path?query`) are same-origin by construction.
/// Absolute-form targets are only accepted when they name the origin itself;
/// the proxy never fetches a host a client picks.
pub fn to_agent_request(parts: &Parts, body: Bytes, origin: &Url) -> Result<Request> {
  let uri = &parts.uri;
  let url = if uri.scheme().is_some() {
    let url =
      Url::parse(&uri.to_string()).map_err(|e| eyre!("Invalid request URI {}: {}", uri, e))?;
    if url.origin() != origin.origin() {
      return Err(eyre!("Request target {} is outside the origin", url));
    }
    url
  } else {
    let mut url = origin.clone();
    url.set_path(uri.path());
    url.set_query(uri.query());
    url
  };

  Ok(Request {
    method: parts.method.clone(),
    url,
    headers: parts.headers.clone(),
    body,
    mode: RequestMode::from_headers(&parts.method, &parts.headers),
  })
}

fn into_http_response(response: Response) -> HttpResponse {
  let mut http = HttpResponse::new(Body::from(response.body));
  *http.status_mut() = response.status;
  *http.headers_mut() = forwardable(&response.headers);
  http
}
