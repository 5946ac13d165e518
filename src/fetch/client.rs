use async_trait::async_trait;
use reqwest::{Request, Response};

use crate::error::FetchError;

/// Executes a prepared request. Wrappers such as [`super::auth::ApiKey`]
/// decorate the request before handing it to the inner client.
#[async_trait]
pub trait HttpClient: Send + Sync {
    async fn execute(&self, req: Request) -> reqwest::Result<Response>;

    /// Reports configuration that makes every request unsendable. Checked
    /// before each fetch.
    fn check(&self) -> Result<(), FetchError> {
        Ok(())
    }
}
