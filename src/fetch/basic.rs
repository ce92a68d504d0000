use super::client::HttpClient;
use async_trait::async_trait;
use std::time::Duration;

/// Seconds before a feed request is abandoned.
pub const FETCH_TIMEOUT_SECS: u64 = 15;

pub struct BasicClient(reqwest::Client);

impl BasicClient {
    /// Builds a client with the default feed timeout.
    pub fn new() -> reqwest::Result<Self> {
        Self::with_timeout(Duration::from_secs(FETCH_TIMEOUT_SECS))
    }

    pub fn with_timeout(timeout: Duration) -> reqwest::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()?;
        Ok(Self(client))
    }
}

#[async_trait]
impl HttpClient for BasicClient {
    async fn execute(&self, req: reqwest::Request) -> reqwest::Result<reqwest::Response> {
        self.0.execute(req).await
    }
}
