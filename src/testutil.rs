//! Shared in-memory fakes for exercising the pipeline without network or
//! database access.

use crate::entity;
use crate::errors::{DownloadError, Result, StoreError};
use crate::fetcher::Fetcher;
use crate::store::{NewRate, RecordStore};
use chrono::{NaiveDate, NaiveDateTime, Utc};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};

pub const GOOD_PAGE: &str = r#"<html><body>
    <span class="date-display-single">Miércoles, 25 Junio 2025</span>
    <div id="dolar"><strong>105,45270000</strong></div>
    </body></html>"#;

/// Fails the first `failures` fetches, then serves the canned page.
pub struct StubFetcher {
    failures: u32,
    calls: AtomicU32,
}

impl StubFetcher {
    pub fn new(failures: u32) -> Self {
        Self {
            failures,
            calls: AtomicU32::new(0),
        }
    }

    pub fn calls(&self) -> u32 {
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
            Ok(GOOD_PAGE.to_string())
        }
    }

    fn source_url(&self) -> &str {
        "https://www.bcv.org.ve/"
    }
}

/// In-memory RecordStore.
#[derive(Default)]
pub struct MemoryStore {
    rows: Mutex<Vec<entity::Model>>,
    fail_saves: bool,
}

impl MemoryStore {
    pub fn failing() -> Self {
        Self {
            rows: Mutex::new(Vec::new()),
            fail_saves: true,
        }
    }

    pub fn len(&self) -> usize {
        self.rows.lock().unwrap().len()
    }

    /// Seeds a row scraped at `scraped_at`.
    pub fn seed(&self, scraped_at: NaiveDateTime) {
        let mut rows = self.rows.lock().unwrap();
        let id = rows.len() as i64 + 1;
        rows.push(entity::Model {
            id,
            usd_rate: rust_decimal::Decimal::new(1054527, 4),
            value_date: scraped_at.date(),
            scraped_at,
            currency_code: "USD".to_string(),
            source_url: "https://www.bcv.org.ve/".to_string(),
            raw_data: None,
            created_at: scraped_at,
            updated_at: scraped_at,
        });
    }
}

#[async_trait::async_trait]
impl RecordStore for MemoryStore {
    async fn save(&self, rate: NewRate) -> Result<entity::Model> {
        if self.fail_saves {
            return Err(StoreError::Insert("disk full".into()).into());
        }
        let mut rows = self.rows.lock().unwrap();
        let now = Utc::now().naive_utc();
        let model = entity::Model {
            id: rows.len() as i64 + 1,
            usd_rate: rate.usd_rate,
            value_date: rate.value_date,
            scraped_at: rate.scraped_at,
            currency_code: "USD".to_string(),
            source_url: rate.source_url,
            raw_data: rate.raw_data,
            created_at: now,
            updated_at: now,
        };
        rows.push(model.clone());
        Ok(model)
    }

    async fn most_recent(&self) -> Result<Option<entity::Model>> {
        let rows = self.rows.lock().unwrap();
        Ok(rows.iter().max_by_key(|r| r.scraped_at).cloned())
    }

    async fn count_since(&self, since: NaiveDateTime) -> Result<u64> {
        let rows = self.rows.lock().unwrap();
        Ok(rows.iter().filter(|r| r.scraped_at >= since).count() as u64)
    }

    async fn count_scraped_on(&self, date: NaiveDate) -> Result<u64> {
        let rows = self.rows.lock().unwrap();
        Ok(rows.iter().filter(|r| r.scraped_at.date() == date).count() as u64)
    }

    async fn history(
        &self,
        from_date: Option<NaiveDate>,
        to_date: Option<NaiveDate>,
        limit: u64,
    ) -> Result<Vec<entity::Model>> {
        let rows = self.rows.lock().unwrap();
        let mut selected: Vec<entity::Model> = rows
            .iter()
            .filter(|r| from_date.is_none_or(|from| r.value_date >= from))
            .filter(|r| to_date.is_none_or(|to| r.value_date <= to))
            .cloned()
            .collect();
        selected.sort_by(|a, b| {
            (b.value_date, b.scraped_at).cmp(&(a.value_date, a.scraped_at))
        });
        selected.truncate(limit as usize);
        Ok(selected)
    }

    async fn count_all(&self) -> Result<u64> {
        Ok(self.len() as u64)
    }
}
