use crate::error::FetchError;
use crate::fetch::client::HttpClient;
use async_trait::async_trait;
use reqwest::header::{HeaderName, HeaderValue};

/// Header used by Azure API Management gateways, which front the OC Transpo
/// GTFS-RT endpoints.
pub const SUBSCRIPTION_KEY_HEADER: &str = "ocp-apim-subscription-key";

/// An [`HttpClient`] wrapper that injects an API key as an HTTP header.
///
/// The key is parsed once at construction but never rejected there. A key
/// that is not a legal header value fails every fetch with
/// [`FetchError::InvalidCredential`].
pub struct ApiKey<C> {
    inner: C,
    header_name: HeaderName,
    key: Result<HeaderValue, String>,
}

impl<C> ApiKey<C> {
    /// Wraps `inner`, setting `header_name: key` on every request. An empty
    /// key is sent as-is and left for the upstream to reject.
    pub fn new(inner: C, header_name: HeaderName, key: &str) -> Self {
        let key = HeaderValue::from_str(key)
            .map(|mut value| {
                value.set_sensitive(true);
                value
            })
            .map_err(|e| format!("{header_name} value: {e}"));

        Self {
            inner,
            header_name,
            key,
        }
    }

    /// Uses the `Ocp-Apim-Subscription-Key` header.
    pub fn subscription_key(inner: C, key: &str) -> Self {
        Self::new(inner, HeaderName::from_static(SUBSCRIPTION_KEY_HEADER), key)
    }
}

#[async_trait]
impl<C: HttpClient> HttpClient for ApiKey<C> {
    async fn execute(&self, mut req: reqwest::Request) -> reqwest::Result<reqwest::Response> {
        if let Ok(key) = &self.key {
            req.headers_mut().insert(self.header_name.clone(), key.clone());
        }
        self.inner.execute(req).await
    }

    fn check(&self) -> Result<(), FetchError> {
        if let Err(reason) = &self.key {
            return Err(FetchError::InvalidCredential(reason.clone()));
        }
        self.inner.check()
    }
}
