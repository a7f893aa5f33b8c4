//! Provider callbacks.

use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use serde_json::{Value, json};

use herald_common::error::AppError;

use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/webhook-received", post(delivery_receipt))
}

/// `POST /webhook-received`: Z-API delivery receipt. Unauthenticated; the provider calls it.
async fn delivery_receipt(
    State(state): State<AppState>,
    Json(payload): Json<Value>,
) -> Result<Json<Value>, AppError> {
    let outcome = state.receipts.record(&payload).await?;

    if let Some(forwarder) = &state.forwarder {
        forwarder.forward(&outcome.forward).await;
    }

    Ok(Json(json!({ "message": "ok" })))
}
