//! Message submission routes.

use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use herald_common::error::AppError;
use herald_common::types::MessageInput;
use herald_engine::scheduler::{ItemFailure, ScheduledJob};

use crate::middleware::customer::CustomerId;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/messages", post(send_message))
        .route("/api/messages/bulk", post(send_bulk))
}

#[derive(Debug, Deserialize)]
pub struct BulkRequest {
    pub data: Vec<MessageInput>,
}

#[derive(Debug, Serialize)]
pub struct BulkResponse {
    pub success: bool,
    pub total: usize,
    pub processed: usize,
    pub results: Vec<ScheduledJob>,
    pub failures: Vec<ItemFailure>,
}

/// `POST /api/messages`: schedule a single message.
async fn send_message(
    State(state): State<AppState>,
    CustomerId(customer_id): CustomerId,
    Json(input): Json<MessageInput>,
) -> Result<Json<ScheduledJob>, AppError> {
    let scheduled = state.scheduler.schedule_single(customer_id, input).await?;
    Ok(Json(scheduled))
}

/// `POST /api/messages/bulk`: schedule a batch. Malformed items are reported, not fatal.
async fn send_bulk(
    State(state): State<AppState>,
    CustomerId(customer_id): CustomerId,
    Json(body): Json<BulkRequest>,
) -> Result<Json<BulkResponse>, AppError> {
    let outcome = state
        .scheduler
        .schedule_batch(customer_id, body.data)
        .await?;

    Ok(Json(BulkResponse {
        success: true,
        total: outcome.total,
        processed: outcome.scheduled.len(),
        results: outcome.scheduled,
        failures: outcome.failures,
    }))
}
