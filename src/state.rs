use crate::cache::CacheService;
use crate::config::Config;
use crate::connector::{create_redis_pool, postgres_connection};
use crate::fetcher::PageFetcher;
use crate::job::{JobTracker, ScrapeJob};
use crate::lock::LockManager;
use crate::scrape::ScrapeService;
use crate::store::{RateStore, RecordStore};
use log::info;
use std::sync::Arc;
use std::time::Duration;

/// Fully wired application: one of everything, shared by the CLI, the API
/// and the scheduler.
#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub cache: Arc<CacheService>,
    pub locker: Arc<LockManager>,
    pub store: Arc<dyn RecordStore>,
    pub scraper: Arc<ScrapeService>,
    pub tracker: Arc<JobTracker>,
    pub job: Arc<ScrapeJob>,
}

impl AppState {
    pub async fn new(config: Config) -> Self {
        let db = Arc::new(
            postgres_connection(&config.db)
                .await
                .expect("Failed to connect to postgres"),
        );
        info!("PostgreSQL database connected successfully");

        let cache_pool = config.cache.redis.as_ref().map(|redis| {
            create_redis_pool(redis).expect("Failed to create redis pool")
        });
        if cache_pool.is_some() {
            info!("Redis cache pool created");
        } else {
            info!("No redis configured, using in-process cache");
        }

        let cache = Arc::new(CacheService::new(
            cache_pool.clone(),
            config.name.clone(),
            None,
        ));
        let locker = Arc::new(LockManager::new(
            cache_pool.map(Arc::new),
            &config.name,
        ));

        let store: Arc<dyn RecordStore> = Arc::new(RateStore::new(db));

        let fetcher = Arc::new(
            PageFetcher::new(&config.scrape).expect("Failed to build HTTP client"),
        );
        let scraper = Arc::new(ScrapeService::new(
            fetcher,
            config.scrape.max_attempts,
            Duration::from_secs(config.scrape.retry_delay_secs),
        ));

        let tracker = Arc::new(JobTracker::new(
            cache.clone(),
            Duration::from_secs(config.cache.status_ttl_secs),
            Duration::from_secs(config.cache.summary_ttl_secs),
        ));

        let job = Arc::new(ScrapeJob::new(
            scraper.clone(),
            store.clone(),
            tracker.clone(),
            locker.clone(),
            config.job.clone(),
        ));

        Self {
            config,
            cache,
            locker,
            store,
            scraper,
            tracker,
            job,
        }
    }
}
