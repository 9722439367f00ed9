use crate::dates;
use crate::entity;
use crate::errors::{Error, Result};
use crate::extract;
use crate::fetcher::Fetcher;
use crate::store::{NewRate, RecordStore};
use chrono::{NaiveDate, NaiveDateTime, Utc};
use log::{info, warn};
use metrics::{counter, histogram};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Debug payload stored next to each record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawData {
    #[serde(flatten)]
    pub fragments: extract::RawFragments,
    pub scraped_at_timestamp: i64,
}

/// A validated scrape result, not yet persisted.
#[derive(Debug, Clone)]
pub struct ScrapePayload {
    /// Rate rounded to the stored 4-decimal scale
    pub usd_rate: Decimal,
    /// Date the published rate is valid for
    pub value_date: NaiveDate,
    /// When the page was actually retrieved
    pub scraped_at: NaiveDateTime,
    pub source_url: String,
    pub raw_data: RawData,
}

#[derive(Debug, Clone)]
pub struct ScrapeOutcome {
    pub payload: ScrapePayload,
    pub attempts: u32,
}

#[derive(Debug)]
pub struct SavedRate {
    pub record: entity::Model,
    pub attempts: u32,
}

/// Terminal failure of a scrape execution. When only the store write failed,
/// `scraped` carries the validated payload so a caller can retry the save
/// without scraping again.
#[derive(Debug)]
pub struct ScrapeFailure {
    pub error: Error,
    pub attempts: u32,
    pub scraped: Option<ScrapePayload>,
}

impl std::fmt::Display for ScrapeFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (after {} attempt(s))", self.error, self.attempts)
    }
}

/// Composes fetcher, extractor and date parser into the retrying scrape
/// pipeline. Attempts are strictly sequential; every failure is retried
/// identically until the attempt budget runs out.
pub struct ScrapeService {
    fetcher: Arc<dyn Fetcher>,
    max_attempts: u32,
    retry_delay: Duration,
}

impl ScrapeService {
    pub fn new(fetcher: Arc<dyn Fetcher>, max_attempts: u32, retry_delay: Duration) -> Self {
        Self {
            fetcher,
            max_attempts: max_attempts.max(1),
            retry_delay,
        }
    }

    /// One fetch-extract-validate pass.
    async fn scrape_once(&self) -> Result<ScrapePayload> {
        let html = self.fetcher.fetch().await?;

        let rate = extract::extract_rate(&html)?;
        let date_text = extract::extract_value_date_text(&html)?;
        let value_date = dates::parse_spanish_date(&date_text)?;
        let fragments = extract::extract_raw_fragments(&html);

        let scraped_at = Utc::now().naive_utc();
        info!(
            "Extracted rate {} for value date {} from {}",
            rate,
            value_date,
            self.fetcher.source_url()
        );

        Ok(ScrapePayload {
            usd_rate: rate.round_dp_with_strategy(4, RoundingStrategy::MidpointAwayFromZero),
            value_date,
            scraped_at,
            source_url: self.fetcher.source_url().to_string(),
            raw_data: RawData {
                fragments,
                scraped_at_timestamp: Utc::now().timestamp(),
            },
        })
    }

    /// Runs up to `max_attempts` passes with a fixed delay in between.
    /// Success short-circuits; after the last failure the last error is
    /// returned with the attempt count.
    pub async fn scrape_with_retries(&self) -> std::result::Result<ScrapeOutcome, ScrapeFailure> {
        let start = Instant::now();
        let mut attempt = 0u32;
        let mut last_error: Option<Error> = None;

        while attempt < self.max_attempts {
            attempt += 1;
            info!("BCV scraping attempt {}/{}", attempt, self.max_attempts);

            match self.scrape_once().await {
                Ok(payload) => {
                    histogram!("scrape_duration_seconds", "outcome" => "success")
                        .record(start.elapsed().as_secs_f64());
                    counter!("scrape_attempts_total", "outcome" => "success").increment(1);
                    return Ok(ScrapeOutcome { payload, attempts: attempt });
                }
                Err(e) => {
                    warn!("BCV scraping attempt {} failed: {}", attempt, e);
                    counter!("scrape_attempts_total", "outcome" => "failure").increment(1);
                    last_error = Some(e);

                    if attempt < self.max_attempts {
                        tokio::time::sleep(self.retry_delay).await;
                    }
                }
            }
        }

        histogram!("scrape_duration_seconds", "outcome" => "failure")
            .record(start.elapsed().as_secs_f64());

        Err(ScrapeFailure {
            error: last_error.unwrap_or_else(|| {
                Error::with_message(
                    crate::errors::ErrorKind::Job,
                    "no scrape attempt was made".to_string(),
                    None::<crate::errors::BoxError>,
                )
            }),
            attempts: attempt,
            scraped: None,
        })
    }

    /// Full pipeline: scrape, then persist. A failed store write is reported
    /// as a failure that still carries the scraped payload.
    pub async fn scrape_and_save(
        &self,
        store: &dyn RecordStore,
    ) -> std::result::Result<SavedRate, ScrapeFailure> {
        let outcome = self.scrape_with_retries().await?;
        let payload = outcome.payload;

        let raw_json = serde_json::to_string(&payload.raw_data).ok();

        match store
            .save(NewRate {
                usd_rate: payload.usd_rate,
                value_date: payload.value_date,
                scraped_at: payload.scraped_at,
                source_url: payload.source_url.clone(),
                raw_data: raw_json,
            })
            .await
        {
            Ok(record) => {
                info!(
                    "Stored rate {} (id {}) for value date {}",
                    record.usd_rate, record.id, record.value_date
                );
                Ok(SavedRate {
                    record,
                    attempts: outcome.attempts,
                })
            }
            Err(e) => {
                warn!("Scraped data could not be persisted: {}", e);
                Err(ScrapeFailure {
                    error: e,
                    attempts: outcome.attempts,
                    scraped: Some(payload),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::DownloadError;
    use std::sync::atomic::{AtomicU32, Ordering};

    const GOOD_PAGE: &str = r#"<html><body>
        <span class="date-display-single">Miércoles, 25 Junio 2025</span>
        <div id="dolar"><strong>105,45270000</strong></div>
        </body></html>"#;

    /// Fails the first `failures` fetches, then serves `body`.
    struct StubFetcher {
        failures: u32,
        body: &'static str,
        calls: AtomicU32,
    }

    impl StubFetcher {
        fn new(failures: u32, body: &'static str) -> Self {
            Self {
                failures,
                body,
                calls: AtomicU32::new(0),
            }
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait::async_trait]
    impl Fetcher for StubFetcher {
        async fn fetch(&self) -> Result<String> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                Err(DownloadError::Timeout(30).into())
            } else {
                Ok(self.body.to_string())
            }
        }

        fn source_url(&self) -> &str {
            "https://www.bcv.org.ve/"
        }
    }

    fn service(fetcher: Arc<StubFetcher>, max_attempts: u32) -> ScrapeService {
        ScrapeService::new(fetcher, max_attempts, Duration::from_millis(0))
    }

    #[tokio::test]
    async fn test_success_on_third_attempt() {
        let fetcher = Arc::new(StubFetcher::new(2, GOOD_PAGE));
        let svc = service(fetcher.clone(), 3);

        let outcome = svc.scrape_with_retries().await.unwrap();
        assert_eq!(outcome.attempts, 3);
        assert_eq!(fetcher.calls(), 3);
        assert_eq!(outcome.payload.usd_rate.to_string(), "105.4527");
        assert_eq!(
            outcome.payload.value_date,
            chrono::NaiveDate::from_ymd_opt(2025, 6, 25).unwrap()
        );
    }

    #[tokio::test]
    async fn test_success_short_circuits() {
        let fetcher = Arc::new(StubFetcher::new(0, GOOD_PAGE));
        let svc = service(fetcher.clone(), 3);

        let outcome = svc.scrape_with_retries().await.unwrap();
        assert_eq!(outcome.attempts, 1);
        assert_eq!(fetcher.calls(), 1);
    }

    #[tokio::test]
    async fn test_all_attempts_exhausted() {
        let fetcher = Arc::new(StubFetcher::new(10, GOOD_PAGE));
        let svc = service(fetcher.clone(), 3);

        let failure = svc.scrape_with_retries().await.unwrap_err();
        assert_eq!(failure.attempts, 3);
        assert_eq!(fetcher.calls(), 3);
        assert!(failure.scraped.is_none());
        assert!(failure.error.is_download());
    }

    #[tokio::test]
    async fn test_unparsable_page_is_retried() {
        let fetcher = Arc::new(StubFetcher::new(0, "<html><body>mantenimiento</body></html>"));
        let svc = service(fetcher.clone(), 2);

        let failure = svc.scrape_with_retries().await.unwrap_err();
        assert_eq!(failure.attempts, 2);
        assert_eq!(fetcher.calls(), 2);
        assert!(failure.error.is_extract());
    }

    #[tokio::test]
    async fn test_delay_observed_between_attempts() {
        let fetcher = Arc::new(StubFetcher::new(2, GOOD_PAGE));
        let svc = ScrapeService::new(fetcher, 3, Duration::from_millis(30));

        let started = Instant::now();
        let outcome = svc.scrape_with_retries().await.unwrap();
        assert_eq!(outcome.attempts, 3);
        // Two inter-attempt delays
        assert!(started.elapsed() >= Duration::from_millis(60));
    }

    #[tokio::test]
    async fn test_rate_rounded_to_four_decimals() {
        let fetcher = Arc::new(StubFetcher::new(0, GOOD_PAGE));
        let svc = service(fetcher, 1);

        let outcome = svc.scrape_with_retries().await.unwrap();
        assert_eq!(outcome.payload.usd_rate.scale(), 4);
    }
}
