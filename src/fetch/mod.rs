//! Upstream feed retrieval.

mod client;
mod basic;
pub mod auth;

pub use client::HttpClient;
pub use basic::BasicClient;

use async_trait::async_trait;
use tracing::debug;

use crate::error::FetchError;

/// Source of raw feed bytes for one pipeline pass.
#[async_trait]
pub trait FeedSource: Send + Sync {
    async fn fetch(&self) -> Result<Vec<u8>, FetchError>;
}

/// Issues a single GET to `url` and returns the body.
///
/// # Errors
///
/// Fails on a client that cannot send (see [`HttpClient::check`]), an
/// unparsable URL, a transport error or any non-success status. No retry is
/// attempted.
pub async fn fetch_bytes<C: HttpClient + ?Sized>(
    client: &C,
    url: &str,
) -> Result<Vec<u8>, FetchError> {
    client.check()?;
    let parsed = reqwest::Url::parse(url).map_err(|e| FetchError::InvalidUrl {
        url: url.to_string(),
        reason: e.to_string(),
    })?;
    let req = reqwest::Request::new(reqwest::Method::GET, parsed);

    let resp = client.execute(req).await?;
    let status = resp.status();
    if !status.is_success() {
        return Err(FetchError::Status(status));
    }

    let bytes = resp.bytes().await?;
    debug!(bytes = bytes.len(), %status, "Feed body received");
    Ok(bytes.to_vec())
}

/// Fetches the configured vehicle-positions URL through `C`.
pub struct FeedFetcher<C> {
    client: C,
    url: String,
}

impl<C: HttpClient> FeedFetcher<C> {
    pub fn new(client: C, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl<C: HttpClient> FeedSource for FeedFetcher<C> {
    #[tracing::instrument(name = "fetch_feed", skip(self), fields(url = %self.url))]
    async fn fetch(&self) -> Result<Vec<u8>, FetchError> {
        fetch_bytes(&self.client, &self.url).await
    }
}
