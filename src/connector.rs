use crate::config::{DatabaseConfig, RedisConfig};
use sea_orm::{Database, DatabaseConnection};

pub fn create_redis_pool(redis: &RedisConfig) -> Option<deadpool_redis::Pool> {
    let cfg = deadpool_redis::Config {
        connection: Some(deadpool_redis::ConnectionInfo {
            addr: deadpool_redis::ConnectionAddr::Tcp(redis.redis_host.clone(), redis.redis_port),
            redis: deadpool_redis::RedisConnectionInfo {
                db: redis.redis_db as i64,
                username: redis.redis_username.clone(),
                password: redis.redis_password.clone(),
                protocol: deadpool_redis::ProtocolVersion::RESP3,
            },
        }),
        pool: Some(deadpool_redis::PoolConfig {
            max_size: redis.pool_size.unwrap_or(16),
            ..Default::default()
        }),
        ..Default::default()
    };
    cfg.create_pool(Some(deadpool_redis::Runtime::Tokio1)).ok()
}

pub async fn postgres_connection(db: &DatabaseConfig) -> Option<DatabaseConnection> {
    let pg_url = format!(
        "postgres://{}:{}@{}:{}/{}",
        db.database_user, db.database_password, db.database_host, db.database_port, db.database_name
    );

    let mut db_options = sea_orm::ConnectOptions::new(pg_url);
    db_options
        .set_schema_search_path(&db.database_schema)
        .sqlx_logging(true)
        .sqlx_logging_level(log::LevelFilter::Debug);

    match Database::connect(db_options).await {
        Ok(conn) => Some(conn),
        Err(e) => {
            log::error!("Failed to connect to postgres database: {}", e);
            None
        }
    }
}
