//! Plain HTTP GET fetcher.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, StatusCode};
use serde_json::json;

use crate::config::FetcherSettings;
use crate::domain::{FailureKind, FetchError};
use crate::error::HarvestError;
use crate::ports::Fetcher;

#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    pub fn new(timeout: Duration, user_agent: &str) -> Result<Self, HarvestError> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(user_agent)
            .build()
            .map_err(|e| HarvestError::Config(format!("cannot build HTTP client: {e}")))?;
        Ok(Self { client })
    }

    pub fn from_settings(settings: &FetcherSettings) -> Result<Self, HarvestError> {
        Self::new(settings.timeout(), &settings.user_agent)
    }
}

/// `None` for a success status.
pub fn classify_status(status: StatusCode) -> Option<FailureKind> {
    if status.is_success() {
        return None;
    }
    let transient = status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
        || status.is_server_error();
    Some(if transient {
        FailureKind::Transient
    } else {
        FailureKind::Fatal
    })
}

fn classify_request_error(err: &reqwest::Error) -> FailureKind {
    if err.is_builder() {
        FailureKind::Fatal
    } else {
        // Timeouts, refused connections, resets, truncated bodies.
        FailureKind::Transient
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, target: &str) -> Result<serde_json::Value, FetchError> {
        let response = self.client.get(target).send().await.map_err(|e| FetchError {
            kind: classify_request_error(&e),
            message: e.to_string(),
        })?;

        let status = response.status();
        if let Some(kind) = classify_status(status) {
            return Err(FetchError {
                kind,
                message: format!("HTTP {status} from {target}"),
            });
        }

        let is_json = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.contains("json"));
        let url = response.url().to_string();

        let body = response.text().await.map_err(|e| FetchError {
            kind: classify_request_error(&e),
            message: e.to_string(),
        })?;

        if is_json {
            return serde_json::from_str(&body)
                .map_err(|e| FetchError::fatal(format!("invalid JSON body from {target}: {e}")));
        }

        Ok(json!({
            "status": status.as_u16(),
            "url": url,
            "body": body,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(200, None)]
    #[case(204, None)]
    #[case(429, Some(FailureKind::Transient))]
    #[case(408, Some(FailureKind::Transient))]
    #[case(500, Some(FailureKind::Transient))]
    #[case(503, Some(FailureKind::Transient))]
    #[case(404, Some(FailureKind::Fatal))]
    #[case(403, Some(FailureKind::Fatal))]
    #[case(410, Some(FailureKind::Fatal))]
    fn status_classification(#[case] code: u16, #[case] expected: Option<FailureKind>) {
        let status = StatusCode::from_u16(code).unwrap();
        assert_eq!(classify_status(status), expected);
    }

    #[tokio::test]
    async fn unreachable_host_is_transient() {
        let fetcher = HttpFetcher::new(Duration::from_secs(2), "harvest-test").unwrap();
        // Port 9 on loopback: nothing listens, connection is refused.
        let err = fetcher.fetch("http://127.0.0.1:9/x/1").await.unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn malformed_url_is_fatal() {
        let fetcher = HttpFetcher::new(Duration::from_secs(2), "harvest-test").unwrap();
        let err = fetcher.fetch("not a url").await.unwrap_err();
        assert_eq!(err.kind, FailureKind::Fatal);
    }
}
