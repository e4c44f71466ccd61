use std::time::Duration;

use harvest_core::error::AppError;
use harvest_core::traits::Fetcher;
use reqwest::Client;

/// Settings for [`ReqwestFetcher`]. Base URLs belong to the site being
/// crawled, see [`Catalogue::new`](crate::Catalogue::new).
#[derive(Debug, Clone)]
pub struct FetcherConfig {
    pub user_agent: String,
    pub timeout: Duration,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            user_agent: format!("harvest/{}", env!("CARGO_PKG_VERSION")),
            timeout: Duration::from_secs(30),
        }
    }
}

impl FetcherConfig {
    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// HTTP fetcher using reqwest.
///
/// Any 2xx or 3xx response counts as a page; everything else is an
/// [`AppError::HttpError`], which fails the task that made the request.
#[derive(Clone)]
pub struct ReqwestFetcher {
    client: Client,
    timeout_secs: u64,
}

impl ReqwestFetcher {
    pub fn new() -> Result<Self, AppError> {
        Self::with_config(FetcherConfig::default())
    }

    pub fn with_config(config: FetcherConfig) -> Result<Self, AppError> {
        let client = Client::builder()
            .user_agent(config.user_agent)
            .timeout(config.timeout)
            .build()
            .map_err(|e| AppError::HttpError(e.to_string()))?;

        Ok(Self {
            client,
            timeout_secs: config.timeout.as_secs(),
        })
    }
}

impl Fetcher for ReqwestFetcher {
    async fn fetch(&self, url: &str) -> Result<String, AppError> {
        tracing::debug!(%url, "Performing request");
        let response = self.client.get(url).send().await.map_err(|e| {
            if e.is_timeout() {
                AppError::Timeout(self.timeout_secs)
            } else if e.is_connect() {
                AppError::NetworkError(format!("Connection failed: {e}"))
            } else {
                AppError::HttpError(e.to_string())
            }
        })?;

        let status = response.status();
        if !is_accepted(status.as_u16()) {
            return Err(AppError::HttpError(format!(
                "HTTP {} for {}",
                status.as_u16(),
                url
            )));
        }

        response
            .text()
            .await
            .map_err(|e| AppError::HttpError(format!("Failed to read response body: {e}")))
    }
}

fn is_accepted(status: u16) -> bool {
    (200..400).contains(&status)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_success_and_redirect_statuses() {
        assert!(is_accepted(200));
        assert!(is_accepted(204));
        assert!(is_accepted(304));
        assert!(!is_accepted(404));
        assert!(!is_accepted(500));
        assert!(!is_accepted(199));
    }

    #[test]
    fn default_config() {
        let config = FetcherConfig::default();
        assert!(config.user_agent.starts_with("harvest/"));
        assert_eq!(config.timeout, Duration::from_secs(30));
        assert!(ReqwestFetcher::with_config(config.with_timeout(Duration::from_secs(5))).is_ok());
    }

    #[tokio::test]
    async fn connection_refused_is_a_network_error() {
        let fetcher = ReqwestFetcher::with_config(
            FetcherConfig::default().with_timeout(Duration::from_secs(2)),
        )
        .unwrap();
        // Port 9 (discard) is closed on loopback in test environments.
        let err = fetcher.fetch("http://127.0.0.1:9/").await.unwrap_err();
        assert!(matches!(
            err,
            AppError::NetworkError(_) | AppError::HttpError(_) | AppError::Timeout(_)
        ));
    }
}
