use serde::{Deserialize, Serialize};
use std::fmt;

/// Scraping target configuration
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ScrapeConfig {
    /// Page to scrape
    #[serde(default = "default_source_url")]
    pub source_url: String,
    /// Request timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    /// Delay between scrape attempts in seconds
    #[serde(default = "default_retry_delay")]
    pub retry_delay_secs: u64,
    /// Attempts per scrape execution
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// User-Agent header sent to the source site
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    /// Verify the source site's TLS certificate. The BCV chain is not always
    /// resolvable from hosts without the local CA bundle, so this defaults to
    /// off; production deployments should turn it on.
    #[serde(default)]
    pub verify_tls: bool,
}

fn default_source_url() -> String {
    "https://www.bcv.org.ve/".to_string()
}

fn default_timeout() -> u64 {
    30
}

fn default_retry_delay() -> u64 {
    2
}

fn default_max_attempts() -> u32 {
    3
}

fn default_user_agent() -> String {
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36"
        .to_string()
}

impl Default for ScrapeConfig {
    fn default() -> Self {
        Self {
            source_url: default_source_url(),
            timeout_secs: default_timeout(),
            retry_delay_secs: default_retry_delay(),
            max_attempts: default_max_attempts(),
            user_agent: default_user_agent(),
            verify_tls: false,
        }
    }
}

/// Redis Configuration
#[derive(Serialize, Deserialize, Clone)]
pub struct RedisConfig {
    /// Redis server hostname
    pub redis_host: String,
    /// Redis server port
    pub redis_port: u16,
    /// Redis database index
    pub redis_db: u16,
    /// Optional Redis username
    pub redis_username: Option<String>,
    /// Optional Redis password
    pub redis_password: Option<String>,
    /// Connection pool size
    pub pool_size: Option<usize>,
}

impl fmt::Debug for RedisConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisConfig")
            .field("redis_host", &self.redis_host)
            .field("redis_port", &self.redis_port)
            .field("redis_db", &self.redis_db)
            .field("redis_username", &self.redis_username)
            .field(
                "redis_password",
                &self.redis_password.as_ref().map(|_| "***REDACTED***"),
            )
            .field("pool_size", &self.pool_size)
            .finish()
    }
}

/// Database Configuration
#[derive(Serialize, Deserialize, Clone)]
pub struct DatabaseConfig {
    /// Database server hostname
    pub database_host: String,
    /// Database server port
    pub database_port: u16,
    /// Database name
    pub database_name: String,
    /// Schema search path
    pub database_schema: String,
    /// Database user
    pub database_user: String,
    /// Database password
    pub database_password: String,
}

impl fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("database_host", &self.database_host)
            .field("database_port", &self.database_port)
            .field("database_name", &self.database_name)
            .field("database_schema", &self.database_schema)
            .field("database_user", &self.database_user)
            .field("database_password", &"***REDACTED***")
            .finish()
    }
}

/// Cache Configuration
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct CacheConfig {
    /// Redis configuration for the shared cache; in-process map when absent
    pub redis: Option<RedisConfig>,
    /// TTL for the in-flight job status entry in seconds
    #[serde(default = "default_status_ttl")]
    pub status_ttl_secs: u64,
    /// TTL for the rolling last-success / last-failure entries in seconds
    #[serde(default = "default_summary_ttl")]
    pub summary_ttl_secs: u64,
}

fn default_status_ttl() -> u64 {
    1800
}

fn default_summary_ttl() -> u64 {
    86400
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            redis: None,
            status_ttl_secs: default_status_ttl(),
            summary_ttl_secs: default_summary_ttl(),
        }
    }
}

/// Job lifecycle configuration
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct JobConfig {
    /// Lifetime of the named execution lock in seconds. Kept independent of
    /// `status_ttl_secs`: the lock prevents duplicate scraping, the status
    /// entry is observational only.
    #[serde(default = "default_lock_ttl")]
    pub lock_ttl_secs: u64,
    /// Wall-clock bound for one whole multi-attempt scrape execution
    #[serde(default = "default_handler_timeout")]
    pub handler_timeout_secs: u64,
    /// Outer retry executions before the job is declared failed
    #[serde(default = "default_job_attempts")]
    pub max_job_attempts: u32,
    /// Delay before outer retry n (1-based); indexes beyond the table fall
    /// back to the first entry
    #[serde(default = "default_backoff")]
    pub backoff_secs: Vec<u64>,
    /// Wall-clock retry deadline measured from the first attempt, in seconds
    #[serde(default = "default_retry_deadline")]
    pub retry_deadline_secs: u64,
    /// Automatic runs are skipped when a record was scraped within this window
    #[serde(default = "default_recent_window")]
    pub recent_window_secs: u64,
}

fn default_lock_ttl() -> u64 {
    600
}

fn default_handler_timeout() -> u64 {
    300
}

fn default_job_attempts() -> u32 {
    3
}

fn default_backoff() -> Vec<u64> {
    vec![60, 120, 240]
}

fn default_retry_deadline() -> u64 {
    3600
}

fn default_recent_window() -> u64 {
    3600
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            lock_ttl_secs: default_lock_ttl(),
            handler_timeout_secs: default_handler_timeout(),
            max_job_attempts: default_job_attempts(),
            backoff_secs: default_backoff(),
            retry_deadline_secs: default_retry_deadline(),
            recent_window_secs: default_recent_window(),
        }
    }
}

/// API Configuration
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Api {
    /// Port number for the API server
    pub port: u16,
}

/// Logger configuration
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct LoggerConfig {
    /// Log level filter (overridable via RUST_LOG)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Optional directory for daily-rolling log files
    pub file_dir: Option<String>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file_dir: None,
        }
    }
}

/// Main Configuration
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Config {
    /// Application instance name, used as the cache key namespace
    pub name: String,
    /// Database configuration
    pub db: DatabaseConfig,
    /// Scraping target configuration
    #[serde(default)]
    pub scrape: ScrapeConfig,
    /// Cache configuration
    #[serde(default)]
    pub cache: CacheConfig,
    /// Job lifecycle configuration
    #[serde(default)]
    pub job: JobConfig,
    /// API server configuration
    pub api: Option<Api>,
    /// Logger configuration
    pub logger: Option<LoggerConfig>,
}

impl Config {
    /// Loads configuration from a TOML file
    pub fn load(path: &str) -> Result<Self, String> {
        let config_str = std::fs::read_to_string(path).map_err(|e| e.to_string())?;
        let config: Config = toml::from_str(&config_str).map_err(|e| e.to_string())?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const MINIMAL: &str = r#"
        name = "bcv_rates"

        [db]
        database_host = "localhost"
        database_port = 5432
        database_name = "bcv"
        database_schema = "public"
        database_user = "bcv"
        database_password = "secret"
    "#;

    #[test]
    fn test_config_defaults() {
        let config: Config = toml::from_str(MINIMAL).unwrap();
        assert_eq!(config.scrape.source_url, "https://www.bcv.org.ve/");
        assert_eq!(config.scrape.timeout_secs, 30);
        assert_eq!(config.scrape.retry_delay_secs, 2);
        assert_eq!(config.scrape.max_attempts, 3);
        assert!(!config.scrape.verify_tls);
        assert_eq!(config.job.backoff_secs, vec![60, 120, 240]);
        assert_eq!(config.job.lock_ttl_secs, 600);
        assert_eq!(config.cache.status_ttl_secs, 1800);
        assert_eq!(config.cache.summary_ttl_secs, 86400);
        assert!(config.cache.redis.is_none());
    }

    #[test]
    fn test_load_config_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "{}", MINIMAL).unwrap();

        let config = Config::load(file.path().to_str().unwrap());
        assert!(config.is_ok(), "config load failed: {:?}", config.err());
    }

    #[test]
    fn test_load_config_not_found() {
        let result = Config::load("non_existent_file.toml");
        assert!(result.is_err());
    }

    #[test]
    fn test_database_password_redacted() {
        let config: Config = toml::from_str(MINIMAL).unwrap();
        let printed = format!("{:?}", config.db);
        assert!(printed.contains("***REDACTED***"));
        assert!(!printed.contains("secret"));
    }
}
