use crate::job::{JobOutcome, JobRequest, JobTracker, ScrapeJob, SkipReason};
use crate::store::RecordStore;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{NaiveDate, Utc};
use log::error;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;

#[derive(Clone)]
pub struct ApiState {
    pub store: Arc<dyn RecordStore>,
    pub tracker: Arc<JobTracker>,
    pub job: Arc<ScrapeJob>,
}

pub fn router() -> Router<ApiState> {
    Router::new()
        .route("/bcv/latest", get(get_latest))
        .route("/bcv/history", get(get_history))
        .route("/bcv/status", get(get_status))
        .route("/bcv/stats", get(get_stats))
        .route("/bcv/scrape", post(scrape_manual))
}

pub async fn serve(state: ApiState, port: u16) -> crate::errors::Result<()> {
    let app = router().with_state(state);
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port))
        .await
        .map_err(|e| {
            crate::errors::Error::with_message(
                crate::errors::ErrorKind::Api,
                format!("failed to bind API port {port}"),
                Some(e),
            )
        })?;
    log::info!("API listening on port {}", port);
    axum::serve(listener, app).await.map_err(|e| {
        crate::errors::Error::with_message(
            crate::errors::ErrorKind::Api,
            "API server terminated".to_string(),
            Some(e),
        )
    })
}

fn internal_error(e: impl std::fmt::Display) -> Response {
    error!("API request failed: {}", e);
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "success": false, "error": e.to_string() })),
    )
        .into_response()
}

async fn get_latest(State(state): State<ApiState>) -> Response {
    match state.store.most_recent().await {
        Ok(Some(rate)) => {
            let is_current = rate.value_date == Utc::now().date_naive();
            (
                StatusCode::OK,
                Json(json!({
                    "success": true,
                    "data": {
                        "usd_rate": rate.usd_rate,
                        "formatted_rate": rate.formatted_rate(),
                        "value_date": rate.value_date.format("%d/%m/%Y").to_string(),
                        "scraped_at": rate.scraped_at.format("%d/%m/%Y %H:%M:%S").to_string(),
                        "is_current": is_current,
                    }
                })),
            )
                .into_response()
        }
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(json!({ "success": false, "message": "no data available" })),
        )
            .into_response(),
        Err(e) => internal_error(e),
    }
}

#[derive(Debug, Deserialize)]
struct HistoryParams {
    from_date: Option<NaiveDate>,
    to_date: Option<NaiveDate>,
    limit: Option<u64>,
}

async fn get_history(
    State(state): State<ApiState>,
    Query(params): Query<HistoryParams>,
) -> Response {
    let limit = params.limit.unwrap_or(15).min(100);
    match state
        .store
        .history(params.from_date, params.to_date, limit)
        .await
    {
        Ok(rows) => (
            StatusCode::OK,
            Json(json!({ "success": true, "data": rows })),
        )
            .into_response(),
        Err(e) => internal_error(e),
    }
}

async fn get_status(State(state): State<ApiState>) -> Response {
    let current = state.tracker.current().await;
    let success = state.tracker.last_success().await;
    let failure = state.tracker.last_failure().await;

    match (current, success, failure) {
        (Ok(current), Ok(success), Ok(failure)) => (
            StatusCode::OK,
            Json(json!({
                "success": true,
                "data": {
                    "current_job": current,
                    "last_success": success,
                    "last_failure": failure,
                }
            })),
        )
            .into_response(),
        (Err(e), _, _) | (_, Err(e), _) | (_, _, Err(e)) => internal_error(e),
    }
}

async fn get_stats(State(state): State<ApiState>) -> Response {
    let total = state.store.count_all().await;
    let latest = state.store.most_recent().await;

    match (total, latest) {
        (Ok(total), Ok(latest)) => (
            StatusCode::OK,
            Json(json!({
                "success": true,
                "data": {
                    "total_records": total,
                    "latest": latest.map(|r| json!({
                        "usd_rate": r.usd_rate,
                        "formatted_rate": r.formatted_rate(),
                        "value_date": r.value_date,
                        "scraped_at": r.scraped_at,
                    })),
                }
            })),
        )
            .into_response(),
        (Err(e), _) | (_, Err(e)) => internal_error(e),
    }
}

async fn scrape_manual(State(state): State<ApiState>) -> Response {
    // Surface the live status so callers can see what blocked them
    match state.tracker.current().await {
        Ok(Some(status)) if status.status.is_live() => {
            return (
                StatusCode::CONFLICT,
                Json(json!({
                    "success": false,
                    "error": "a scraping job is already running",
                    "current_job": status,
                })),
            )
                .into_response();
        }
        Ok(_) => {}
        Err(e) => return internal_error(e),
    }

    match state.job.run(JobRequest::manual("api")).await {
        Ok(JobOutcome::Completed {
            record,
            scrape_attempts,
            execution_time_ms,
        }) => (
            StatusCode::OK,
            Json(json!({
                "success": true,
                "data": {
                    "id": record.id,
                    "usd_rate": record.usd_rate,
                    "value_date": record.value_date,
                    "scraped_at": record.scraped_at,
                },
                "meta": {
                    "attempts": scrape_attempts,
                    "execution_time_ms": execution_time_ms,
                }
            })),
        )
            .into_response(),
        Ok(JobOutcome::Skipped(SkipReason::Overlap)) => (
            StatusCode::CONFLICT,
            Json(json!({
                "success": false,
                "error": "a scraping job is already running",
            })),
        )
            .into_response(),
        Ok(JobOutcome::Skipped(SkipReason::RecentData)) => (
            StatusCode::OK,
            Json(json!({
                "success": false,
                "error": "recent data already exists",
            })),
        )
            .into_response(),
        Ok(JobOutcome::Failed { attempts, error }) => (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(json!({
                "success": false,
                "error": error,
                "meta": { "attempts": attempts },
            })),
        )
            .into_response(),
        Err(e) => internal_error(e),
    }
}
