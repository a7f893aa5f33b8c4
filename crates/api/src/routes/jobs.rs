//! Dispatch job status routes.

use axum::extract::{Path, Query, State};
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use uuid::Uuid;

use herald_common::error::AppError;
use herald_common::types::DispatchJob;

use crate::middleware::customer::CustomerId;
use crate::state::AppState;

const DEFAULT_LIMIT: u32 = 50;
const MAX_LIMIT: u32 = 500;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/jobs", get(list_jobs))
        .route("/api/jobs/{id}", get(get_job))
}

#[derive(Debug, Deserialize)]
pub struct ListParams {
    pub limit: Option<u32>,
}

/// `GET /api/jobs/{id}`: one job of the calling customer.
async fn get_job(
    State(state): State<AppState>,
    CustomerId(customer_id): CustomerId,
    Path(id): Path<Uuid>,
) -> Result<Json<DispatchJob>, AppError> {
    state
        .jobs
        .get(id)
        .await?
        .filter(|job| job.customer_id == customer_id)
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("Job {} not found", id)))
}

/// `GET /api/jobs?limit=N`: latest jobs of the calling customer.
async fn list_jobs(
    State(state): State<AppState>,
    CustomerId(customer_id): CustomerId,
    Query(params): Query<ListParams>,
) -> Result<Json<Vec<DispatchJob>>, AppError> {
    let limit = params.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT);
    let jobs = state.jobs.list_by_customer(customer_id, limit).await?;
    Ok(Json(jobs))
}
