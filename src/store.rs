use crate::entity::{self, Entity as ExchangeRate};
use crate::errors::{Result, StoreError};
use chrono::{NaiveDate, NaiveDateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, PaginatorTrait, QueryFilter,
    QueryOrder, QuerySelect, Set,
};
use std::sync::Arc;

/// Payload for one new exchange-rate row. The id and bookkeeping timestamps
/// are assigned at persistence time.
#[derive(Debug, Clone)]
pub struct NewRate {
    pub usd_rate: Decimal,
    pub value_date: NaiveDate,
    pub scraped_at: NaiveDateTime,
    pub source_url: String,
    pub raw_data: Option<String>,
}

/// Durable, append-only storage of scraped observations.
#[async_trait::async_trait]
pub trait RecordStore: Send + Sync {
    /// Inserts one scraped observation and returns the stored row.
    async fn save(&self, rate: NewRate) -> Result<entity::Model>;

    /// Most recently scraped row, regardless of value date.
    async fn most_recent(&self) -> Result<Option<entity::Model>>;

    /// Rows scraped at or after `since`. Drives the recent-data guard.
    async fn count_since(&self, since: NaiveDateTime) -> Result<u64>;

    /// Rows whose scrape fell on `date` (used by the backup schedule to skip
    /// days already covered).
    async fn count_scraped_on(&self, date: NaiveDate) -> Result<u64>;

    /// Value-date-bounded history, newest first.
    async fn history(
        &self,
        from_date: Option<NaiveDate>,
        to_date: Option<NaiveDate>,
        limit: u64,
    ) -> Result<Vec<entity::Model>>;

    /// Total row count, for the stats surface.
    async fn count_all(&self) -> Result<u64>;
}

/// Postgres-backed repository over the `bcv_exchange_rates` table.
#[derive(Clone)]
pub struct RateStore {
    db: Arc<DatabaseConnection>,
}

impl RateStore {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }
}

#[async_trait::async_trait]
impl RecordStore for RateStore {
    async fn save(&self, rate: NewRate) -> Result<entity::Model> {
        let now = Utc::now().naive_utc();
        let active = entity::ActiveModel {
            usd_rate: Set(rate.usd_rate),
            value_date: Set(rate.value_date),
            scraped_at: Set(rate.scraped_at),
            currency_code: Set("USD".to_string()),
            source_url: Set(rate.source_url),
            raw_data: Set(rate.raw_data),
            created_at: Set(now),
            updated_at: Set(now),
            ..Default::default()
        };

        let model = active
            .insert(&*self.db)
            .await
            .map_err(|e| StoreError::Insert(e.to_string().into()))?;

        Ok(model)
    }

    async fn most_recent(&self) -> Result<Option<entity::Model>> {
        let row = ExchangeRate::find()
            .order_by_desc(entity::Column::ScrapedAt)
            .one(&*self.db)
            .await
            .map_err(|e| StoreError::Query(e.to_string().into()))?;

        Ok(row)
    }

    async fn count_since(&self, since: NaiveDateTime) -> Result<u64> {
        let count = ExchangeRate::find()
            .filter(entity::Column::ScrapedAt.gte(since))
            .count(&*self.db)
            .await
            .map_err(|e| StoreError::Query(e.to_string().into()))?;

        Ok(count)
    }

    async fn count_scraped_on(&self, date: NaiveDate) -> Result<u64> {
        let start = date.and_hms_opt(0, 0, 0).unwrap_or_default();
        let end = start + chrono::Duration::days(1);

        let count = ExchangeRate::find()
            .filter(entity::Column::ScrapedAt.gte(start))
            .filter(entity::Column::ScrapedAt.lt(end))
            .count(&*self.db)
            .await
            .map_err(|e| StoreError::Query(e.to_string().into()))?;

        Ok(count)
    }

    async fn history(
        &self,
        from_date: Option<NaiveDate>,
        to_date: Option<NaiveDate>,
        limit: u64,
    ) -> Result<Vec<entity::Model>> {
        let mut query = ExchangeRate::find()
            .order_by_desc(entity::Column::ValueDate)
            .order_by_desc(entity::Column::ScrapedAt);

        if let Some(from) = from_date {
            query = query.filter(entity::Column::ValueDate.gte(from));
        }
        if let Some(to) = to_date {
            query = query.filter(entity::Column::ValueDate.lte(to));
        }

        let rows = query
            .limit(limit)
            .all(&*self.db)
            .await
            .map_err(|e| StoreError::Query(e.to_string().into()))?;

        Ok(rows)
    }

    async fn count_all(&self) -> Result<u64> {
        let count = ExchangeRate::find()
            .count(&*self.db)
            .await
            .map_err(|e| StoreError::Query(e.to_string().into()))?;

        Ok(count)
    }
}
