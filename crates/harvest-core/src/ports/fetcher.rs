use async_trait::async_trait;

use crate::domain::FetchError;

/// External fetch-and-extract capability.
///
/// Must be safe to call repeatedly for the same target.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, target: &str) -> Result<serde_json::Value, FetchError>;
}
