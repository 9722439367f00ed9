use bcv_rates::api::{self, ApiState};
use bcv_rates::config::Config;
use bcv_rates::entity::format_bs;
use bcv_rates::job::{JobOutcome, JobRequest, SkipReason};
use bcv_rates::logger;
use bcv_rates::scheduler::CronScheduler;
use bcv_rates::state::AppState;
use clap::{Parser, Subcommand};
use log::info;
use std::process::ExitCode;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "bcv-rates", about = "BCV exchange-rate scraper", version)]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(long, default_value = "config.toml")]
    config: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run one automatic scrape (honors the recent-data guard)
    Auto {
        /// Scrape even when recent data exists
        #[arg(long)]
        force: bool,
    },
    /// Run one manual scrape (ignores the recent-data guard)
    Manual,
    /// Show the current job status and the rolling success/failure summaries
    Status,
    /// Drop the job status and summary cache entries
    Clear,
    /// Run the API server and the calendar scheduler
    Serve,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match Config::load(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("failed to load {}: {}", cli.config, e);
            return ExitCode::FAILURE;
        }
    };

    logger::init(&config.logger.clone().unwrap_or_default());

    let state = AppState::new(config).await;

    match cli.command {
        Command::Auto { force } => {
            let request = if force {
                JobRequest::automatic_forced()
            } else {
                JobRequest::automatic()
            };
            run_job(&state, request).await
        }
        Command::Manual => run_job(&state, JobRequest::manual("cli")).await,
        Command::Status => show_status(&state).await,
        Command::Clear => match state.tracker.clear_all().await {
            Ok(()) => {
                println!("job status and summaries cleared");
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("failed to clear cache entries: {e}");
                ExitCode::FAILURE
            }
        },
        Command::Serve => serve(state).await,
    }
}

async fn run_job(state: &AppState, request: JobRequest) -> ExitCode {
    match state.job.run(request).await {
        Ok(JobOutcome::Completed {
            record,
            scrape_attempts,
            execution_time_ms,
        }) => {
            println!(
                "scraped {} for {} in {}ms ({} attempt(s), record id {})",
                format_bs(&record.usd_rate),
                record.value_date,
                execution_time_ms,
                scrape_attempts,
                record.id
            );
            ExitCode::SUCCESS
        }
        Ok(JobOutcome::Skipped(SkipReason::RecentData)) => {
            println!("skipped: recent data exists");
            ExitCode::SUCCESS
        }
        Ok(JobOutcome::Skipped(SkipReason::Overlap)) => {
            println!("skipped: another scraping job is running");
            ExitCode::SUCCESS
        }
        Ok(JobOutcome::Failed { attempts, error }) => {
            eprintln!("scraping failed after {attempts} attempt(s): {error}");
            ExitCode::FAILURE
        }
        Err(e) => {
            eprintln!("scraping job errored: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn show_status(state: &AppState) -> ExitCode {
    match state.tracker.current().await {
        Ok(Some(status)) => {
            println!(
                "current job: {} (id {}, attempt {}, manual: {}, updated {})",
                status.status, status.job_id, status.attempt, status.is_manual, status.updated_at
            );
            if let Some(error) = &status.error {
                println!("  error: {error}");
            }
            if let Some(next) = &status.next_retry_at {
                println!("  next retry at: {next}");
            }
        }
        Ok(None) => println!("no active job"),
        Err(e) => {
            eprintln!("failed to read job status: {e}");
            return ExitCode::FAILURE;
        }
    }

    match state.tracker.last_success().await {
        Ok(Some(success)) => println!(
            "last success: {} ({}, value date {}, {}ms, {} attempt(s))",
            success.completed_at,
            format_bs(&success.usd_rate),
            success.value_date,
            success.execution_time_ms,
            success.attempts
        ),
        Ok(None) => println!("no recorded success"),
        Err(e) => eprintln!("failed to read last success: {e}"),
    }

    match state.tracker.last_failure().await {
        Ok(Some(failure)) => println!(
            "last failure: {} ({} attempt(s)): {}",
            failure.failed_at, failure.attempts, failure.error
        ),
        Ok(None) => println!("no recorded failure"),
        Err(e) => eprintln!("failed to read last failure: {e}"),
    }

    ExitCode::SUCCESS
}

async fn serve(state: AppState) -> ExitCode {
    let scheduler = Arc::new(CronScheduler::new(
        state.cache.clone(),
        state.store.clone(),
        state.job.clone(),
    ));
    scheduler.start();

    let port = state.config.api.as_ref().map(|api| api.port).unwrap_or(8080);
    info!("Starting API server and scheduler");

    let api_state = ApiState {
        store: state.store.clone(),
        tracker: state.tracker.clone(),
        job: state.job.clone(),
    };

    match api::serve(api_state, port).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("server terminated: {e}");
            ExitCode::FAILURE
        }
    }
}
