use crate::config::LoggerConfig;
use once_cell::sync::OnceCell;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_log::LogTracer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

// Hold the non-blocking writer guard to keep the background logging thread alive
static FILE_GUARD: OnceCell<WorkerGuard> = OnceCell::new();

/// Initializes the tracing subscriber stack: env-filtered console output plus
/// an optional daily-rolling file appender. `RUST_LOG` overrides the
/// configured level. Safe to call once per process.
pub fn init(config: &LoggerConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.clone()));

    let console_layer = fmt::layer().with_target(true);

    let file_layer = config.file_dir.as_ref().map(|dir| {
        let appender = RollingFileAppender::new(Rotation::DAILY, dir, "bcv-rates.log");
        let (writer, guard) = tracing_appender::non_blocking(appender);
        FILE_GUARD.set(guard).ok();
        fmt::layer().with_ansi(false).with_writer(writer)
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .init();

    // Bridge `log` macros into tracing
    LogTracer::init().ok();
}
