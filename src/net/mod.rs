//! Network access for the agent and the proxy's pass-through path.

mod client;
mod types;

use async_trait::async_trait;
use color_eyre::Result;

pub use client::{forwardable, HttpNetwork};
pub use types::{Request, RequestMode, Response};

/// Something that can perform a fetch.
///
/// An `Err` means no response was obtained at all (offline, DNS failure,
/// timeout). Any HTTP status, including 4xx and 5xx, is an `Ok`.
#[async_trait]
pub trait Network: Send + Sync {
  async fn fetch(&self, request: &Request) -> Result<Response>;
}
