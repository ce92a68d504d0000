mod api_key;
mod basic;
mod client;

pub use api_key::{APP_TOKEN_HEADER, ApiKey};
pub use basic::{BasicClient, FETCH_TIMEOUT_SECS};
pub use client::HttpClient;

use tracing::{debug, error};

use crate::error::PipelineError;
use crate::parser::parse_records;
use crate::record::RawRecord;

/// NYC Open Data real-time traffic speed resource.
pub const DEFAULT_SOURCE_URL: &str = "https://data.cityofnewyork.us/resource/i4gi-tjb9.json";

/// Records requested per fetch unless configured otherwise.
pub const DEFAULT_FETCH_LIMIT: u32 = 1000;

/// Newest observations first.
const ORDER_CLAUSE: &str = "data_as_of DESC";

pub async fn fetch_bytes<C: HttpClient + ?Sized>(
    client: &C,
    url: reqwest::Url,
) -> Result<Vec<u8>, PipelineError> {
    let req = reqwest::Request::new(reqwest::Method::GET, url);

    let resp = client.execute(req).await?.error_for_status()?;
    Ok(resp.bytes().await?.to_vec())
}

/// Fetches up to `limit` of the most recent records from `source_url`.
///
/// # Errors
///
/// Returns [`PipelineError::Network`] on transport errors, timeouts,
/// non-success statuses, and bodies that are not a JSON array of objects.
#[tracing::instrument(skip(client), fields(source = %source_url))]
pub async fn fetch_records<C: HttpClient + ?Sized>(
    client: &C,
    source_url: &str,
    limit: u32,
) -> Result<Vec<RawRecord>, PipelineError> {
    let result = async {
        let mut url = reqwest::Url::parse(source_url)
            .map_err(|e| PipelineError::Network(format!("invalid source url: {e}")))?;
        url.query_pairs_mut()
            .append_pair("$limit", &limit.to_string())
            .append_pair("$order", ORDER_CLAUSE);

        let bytes = fetch_bytes(client, url).await?;
        debug!(bytes = bytes.len(), "Feed bytes received, parsing");
        parse_records(&bytes)
    }
    .await;

    if let Err(e) = &result {
        error!(error = %e, "Feed fetch failed");
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct Scripted {
        status: u16,
        body: &'static str,
        urls: Mutex<Vec<String>>,
    }

    impl Scripted {
        fn new(status: u16, body: &'static str) -> Self {
            Self {
                status,
                body,
                urls: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl HttpClient for Scripted {
        async fn execute(&self, req: reqwest::Request) -> reqwest::Result<reqwest::Response> {
            self.urls.lock().unwrap().push(req.url().to_string());
            let resp = http::Response::builder()
                .status(self.status)
                .body(self.body)
                .unwrap();
            Ok(resp.into())
        }
    }

    #[tokio::test]
    async fn test_fetch_records_sends_limit_and_order() {
        let client = Scripted::new(200, r#"[{"id": "1"}, {"id": "2"}]"#);

        let records = fetch_records(&client, DEFAULT_SOURCE_URL, 25).await.unwrap();

        assert_eq!(records.len(), 2);
        let url = reqwest::Url::parse(&client.urls.lock().unwrap()[0]).unwrap();
        let pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        assert_eq!(
            pairs,
            [
                ("$limit".to_string(), "25".to_string()),
                ("$order".to_string(), "data_as_of DESC".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_fetch_records_empty_feed_is_ok() {
        let client = Scripted::new(200, "[]");
        let records = fetch_records(&client, DEFAULT_SOURCE_URL, 10).await.unwrap();
        assert!(records.is_empty());
    }

    #[tokio::test]
    async fn test_http_error_status_is_network_failure() {
        let client = Scripted::new(503, "unavailable");
        let err = fetch_records(&client, DEFAULT_SOURCE_URL, 10)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Network(_)));
    }

    #[tokio::test]
    async fn test_non_array_body_is_network_failure() {
        let client = Scripted::new(200, r#"{"error": true}"#);
        let err = fetch_records(&client, DEFAULT_SOURCE_URL, 10)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Network(_)));
    }

    #[tokio::test]
    async fn test_invalid_source_url_is_reported() {
        let client = Scripted::new(200, "[]");
        let err = fetch_records(&client, "not a url", 10).await.unwrap_err();
        assert!(matches!(err, PipelineError::Network(_)));
        assert!(client.urls.lock().unwrap().is_empty());
    }
}
