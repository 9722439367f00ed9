use crate::config::ScrapeConfig;
use crate::errors::{DownloadError, Result};
use log::warn;
use metrics::{counter, histogram};
use reqwest::Client;
use reqwest::header::{ACCEPT, ACCEPT_LANGUAGE, HeaderMap, HeaderValue};
use std::time::{Duration, Instant};
use url::Url;

/// Retrieves the raw HTML of the source page. Implementations do not retry;
/// retry policy lives in the scrape service.
#[async_trait::async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self) -> Result<String>;
    fn source_url(&self) -> &str;
}

/// HTTP fetcher for the BCV page.
///
/// Sends a desktop-browser fingerprint (the site varies behavior by client)
/// and honors the configured timeout and TLS policy.
pub struct PageFetcher {
    client: Client,
    url: String,
    timeout: Duration,
}

impl PageFetcher {
    pub fn new(config: &ScrapeConfig) -> Result<Self> {
        Url::parse(&config.source_url)
            .map_err(|e| DownloadError::InvalidUrl(e.to_string()))?;

        let mut headers = HeaderMap::new();
        headers.insert(
            ACCEPT,
            HeaderValue::from_static(
                "text/html,application/xhtml+xml,application/xml;q=0.9,image/webp,*/*;q=0.8",
            ),
        );
        headers.insert(
            ACCEPT_LANGUAGE,
            HeaderValue::from_static("es-VE,es;q=0.9,en;q=0.8"),
        );

        let client = Client::builder()
            .user_agent(config.user_agent.clone())
            .default_headers(headers)
            .connect_timeout(Duration::from_secs(10))
            .tcp_keepalive(Duration::from_secs(60))
            .danger_accept_invalid_certs(!config.verify_tls)
            .build()
            .map_err(|e| DownloadError::ClientBuild(e.into()))?;

        Ok(Self {
            client,
            url: config.source_url.clone(),
            timeout: Duration::from_secs(config.timeout_secs),
        })
    }

    fn classify(&self, e: reqwest::Error) -> DownloadError {
        if e.is_timeout() {
            DownloadError::Timeout(self.timeout.as_secs())
        } else if e.is_connect() {
            DownloadError::Connect(e.into())
        } else {
            DownloadError::Failed(e.into())
        }
    }
}

#[async_trait::async_trait]
impl Fetcher for PageFetcher {
    async fn fetch(&self) -> Result<String> {
        let start = Instant::now();

        let result = self
            .client
            .get(&self.url)
            .timeout(self.timeout)
            .send()
            .await;

        let response = match result {
            Ok(res) => res,
            Err(e) => {
                warn!("Fetch failed for {}: {}", self.url, e);
                counter!("fetch_requests_total", "outcome" => "transport_error").increment(1);
                return Err(self.classify(e).into());
            }
        };

        let status = response.status();
        counter!("fetch_requests_total", "outcome" => status.as_u16().to_string()).increment(1);

        if !status.is_success() {
            warn!("Fetch returned status {} for {}", status, self.url);
            return Err(DownloadError::Status(status.as_u16()).into());
        }

        let body = response
            .text()
            .await
            .map_err(|e| DownloadError::Failed(e.into()))?;

        histogram!("fetch_duration_seconds").record(start.elapsed().as_secs_f64());

        Ok(body)
    }

    fn source_url(&self) -> &str {
        &self.url
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fetcher_creation() {
        let config = ScrapeConfig::default();
        let fetcher = PageFetcher::new(&config).unwrap();
        assert_eq!(fetcher.source_url(), "https://www.bcv.org.ve/");
        assert_eq!(fetcher.timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_fetcher_rejects_bad_url() {
        let config = ScrapeConfig {
            source_url: "not a url".to_string(),
            ..ScrapeConfig::default()
        };
        assert!(PageFetcher::new(&config).is_err());
    }
}
