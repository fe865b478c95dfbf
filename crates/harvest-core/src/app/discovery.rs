//! Turning listing pages and discovery files into `(id, target)` pairs.
//!
//! Accepted entry shapes, anywhere an entry is expected:
//! - a bare URL string: id derived from its path
//! - `{"url": ..}` or `{"target": ..}`, with an optional explicit `"id"`
//!
//! Entries that yield no usable id are skipped with a warning.

use serde_json::Value;

use super::retry::RetryPolicy;
use super::worker::FetchState;
use crate::domain::{Discovery, FetchError, TaskId};
use crate::error::HarvestError;
use crate::ports::Fetcher;

/// Listing pages to visit: `base`, then `base/2` .. `base/max_page`.
pub fn listing_targets(base: &str, max_page: usize) -> Vec<String> {
    if max_page == 0 {
        return Vec::new();
    }
    let root = base.trim_end_matches('/');
    std::iter::once(base.to_string())
        .chain((2..=max_page).map(|page| format!("{root}/{page}")))
        .collect()
}

/// Parse one entry. `None` when the shape is wrong or no id can be derived.
pub fn discovery_from_value(value: &Value) -> Option<Discovery> {
    let result = match value {
        Value::String(url) => Discovery::from_target(url.trim()),
        Value::Object(map) => {
            let target = map
                .get("url")
                .or_else(|| map.get("target"))
                .and_then(Value::as_str)?;
            match map.get("id").and_then(Value::as_str) {
                Some(id) if !id.is_empty() => Ok(Discovery::new(TaskId::new(id), target)),
                _ => Discovery::from_target(target),
            }
        }
        _ => return None,
    };

    match result {
        Ok(discovery) => Some(discovery),
        Err(err) => {
            tracing::warn!(error = %err, "skipping discovery entry");
            None
        }
    }
}

/// Links found on a listing page: the fetcher's payload must carry a `links` array.
///
/// A payload without one breaks the fetcher contract and is a fatal fetch error.
/// The built-in `http` fetcher never produces `links` for HTML pages, so listing
/// discovery needs a `command` fetcher (or a JSON endpoint) that extracts them.
pub fn links_from_payload(payload: &Value) -> Result<Vec<Discovery>, FetchError> {
    let links = payload.get("links").and_then(Value::as_array).ok_or_else(|| {
        FetchError::fatal(
            "listing payload has no \"links\" array; \
             discovery needs a fetcher that extracts links (fetcher.kind = \"command\")",
        )
    })?;
    Ok(links.iter().filter_map(discovery_from_value).collect())
}

/// Fetch a listing page and extract its links, retrying transient failures with
/// the worker's backoff schedule.
pub async fn fetch_listing(
    fetcher: &dyn Fetcher,
    listing_url: &str,
    retry: &RetryPolicy,
) -> Result<Vec<Discovery>, HarvestError> {
    let mut state = FetchState::Idle.begin();
    loop {
        let err = match fetcher.fetch(listing_url).await {
            Ok(payload) => {
                let links = links_from_payload(&payload)?;
                tracing::info!(listing = listing_url, links = links.len(), "listing fetched");
                return Ok(links);
            }
            Err(err) => err,
        };

        state = state.failed(err.kind, retry);
        let FetchState::Retrying { attempt } = state else {
            return Err(err.into());
        };
        let delay = retry.jittered_delay(attempt, &mut rand::thread_rng());
        tracing::warn!(
            listing = listing_url,
            attempt,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "listing fetch failed, backing off"
        );
        tokio::time::sleep(delay).await;
        state = state.begin();
    }
}

/// Parse a discovery file.
///
/// Either a single JSON document (an array of entries, or a listing export
/// `{"url_origen": .., "enlaces": [..]}`), or one entry per line: a URL or a JSON
/// object. Blank lines and `#` comments are ignored.
pub fn parse_discoveries(text: &str) -> Result<Vec<Discovery>, HarvestError> {
    let trimmed = text.trim_start();
    if (trimmed.starts_with('[') || trimmed.starts_with('{'))
        && let Ok(document) = serde_json::from_str::<Value>(trimmed)
    {
        return Ok(from_document(&document));
    }

    let mut discoveries = Vec::new();
    for (lineno, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let value = if line.starts_with('{') {
            serde_json::from_str::<Value>(line).map_err(|e| {
                HarvestError::Config(format!("line {}: invalid JSON: {e}", lineno + 1))
            })?
        } else {
            Value::String(line.to_string())
        };
        discoveries.extend(discovery_from_value(&value));
    }
    Ok(discoveries)
}

fn from_document(document: &Value) -> Vec<Discovery> {
    let entries = match document {
        Value::Array(items) => items.as_slice(),
        Value::Object(map) => match map.get("enlaces").or_else(|| map.get("links")) {
            Some(Value::Array(items)) => items.as_slice(),
            _ => return discovery_from_value(document).into_iter().collect(),
        },
        _ => &[],
    };
    entries.iter().filter_map(discovery_from_value).collect()
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;
    use serde_json::json;

    use super::*;
    use crate::domain::{FailureKind, FetchError};

    fn ids(discoveries: &[Discovery]) -> Vec<&str> {
        discoveries.iter().map(|d| d.id.as_str()).collect()
    }

    #[test]
    fn listing_pages_start_at_the_base() {
        assert_eq!(
            listing_targets("https://s/venta/", 3),
            vec!["https://s/venta/", "https://s/venta/2", "https://s/venta/3"]
        );
        assert_eq!(listing_targets("https://s/venta", 1), vec!["https://s/venta"]);
        assert!(listing_targets("https://s/venta", 0).is_empty());
    }

    #[test]
    fn entries_with_and_without_ids() {
        let d = discovery_from_value(&json!("https://s/flat/123/d")).unwrap();
        assert_eq!(d.id.as_str(), "123/d");

        let d = discovery_from_value(&json!({"id": "custom", "url": "https://s/a/b"})).unwrap();
        assert_eq!(d.id.as_str(), "custom");
        assert_eq!(d.target, "https://s/a/b");

        let d = discovery_from_value(&json!({"target": "https://s/a/b"})).unwrap();
        assert_eq!(d.id.as_str(), "a/b");

        assert!(discovery_from_value(&json!("https://s/")).is_none());
        assert!(discovery_from_value(&json!(42)).is_none());
        assert!(discovery_from_value(&json!({"id": "x"})).is_none());
    }

    #[test]
    fn payload_links_are_collected() {
        let payload = json!({"links": ["https://s/a/1", {"url": "https://s/a/2"}, "junk"]});
        assert_eq!(ids(&links_from_payload(&payload).unwrap()), vec!["a/1", "a/2"]);
    }

    #[test]
    fn payload_without_links_is_a_fatal_fetch_error() {
        let err = links_from_payload(&json!({"status": 200, "body": "<html>"})).unwrap_err();
        assert_eq!(err.kind, FailureKind::Fatal);
        assert!(err.message.contains("fetcher.kind"));
    }

    #[test]
    fn line_oriented_file() {
        let text = "\
# first page
https://s/a/1

{\"id\": \"b/2\", \"url\": \"https://s/b/2\"}
https://s/a/1
";
        assert_eq!(ids(&parse_discoveries(text).unwrap()), vec!["a/1", "b/2", "a/1"]);
    }

    #[test]
    fn listing_export_document() {
        let text = r#"{
            "url_origen": "https://s/venta",
            "enlaces": [
                {"id": "a/1", "url": "https://s/a/1"},
                "https://s/a/2"
            ]
        }"#;
        assert_eq!(ids(&parse_discoveries(text).unwrap()), vec!["a/1", "a/2"]);
    }

    #[test]
    fn json_array_document() {
        let text = r#"[
            {"id": "a/1", "url": "https://s/a/1"},
            {"id": "a/2", "url": "https://s/a/2"}
        ]"#;
        assert_eq!(ids(&parse_discoveries(text).unwrap()), vec!["a/1", "a/2"]);
    }

    #[test]
    fn broken_json_line_is_an_error() {
        assert!(parse_discoveries("https://s/a/1\n{\"url\": \n").is_err());
    }

    struct FlakyListing {
        failures: Mutex<Vec<FetchError>>,
        calls: AtomicU32,
    }

    #[async_trait]
    impl Fetcher for FlakyListing {
        async fn fetch(&self, _: &str) -> Result<Value, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.failures.lock().unwrap().pop() {
                Some(err) => Err(err),
                None => Ok(json!({"links": ["https://s/a/1", "https://s/a/2"]})),
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn listing_fetch_retries_transient_failures() {
        let fetcher = FlakyListing {
            failures: Mutex::new(vec![FetchError::transient("429"), FetchError::transient("503")]),
            calls: AtomicU32::new(0),
        };
        let links = fetch_listing(&fetcher, "https://s/venta", &RetryPolicy::default())
            .await
            .unwrap();
        assert_eq!(ids(&links), vec!["a/1", "a/2"]);
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn listing_fetch_stops_on_fatal() {
        let fetcher = FlakyListing {
            failures: Mutex::new(vec![FetchError::fatal("404")]),
            calls: AtomicU32::new(0),
        };
        let err = fetch_listing(&fetcher, "https://s/venta", &RetryPolicy::default())
            .await
            .unwrap_err();
        assert!(matches!(err, HarvestError::Fetch(_)));
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
    }

    struct HtmlListing;

    #[async_trait]
    impl Fetcher for HtmlListing {
        async fn fetch(&self, target: &str) -> Result<Value, FetchError> {
            Ok(json!({"status": 200, "url": target, "body": "<html></html>"}))
        }
    }

    #[tokio::test]
    async fn listing_without_links_fails_without_retrying() {
        let err = fetch_listing(&HtmlListing, "https://s/venta", &RetryPolicy::default())
            .await
            .unwrap_err();
        let HarvestError::Fetch(err) = err else {
            panic!("expected a fetch error, got {err:?}");
        };
        assert_eq!(err.kind, FailureKind::Fatal);
    }
}
