pub mod health;
pub mod jobs;
pub mod messages;
pub mod webhooks;

use axum::Router;

use crate::state::AppState;

/// Build the complete API router with all routes.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .merge(health::router())
        .merge(messages::router())
        .merge(jobs::router())
        .merge(webhooks::router())
        .with_state(state)
}
