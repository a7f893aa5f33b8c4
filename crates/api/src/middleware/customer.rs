//! Caller identity extractor.
//!
//! Every `/api` route acts on behalf of the customer named by the `X-Customer-Id` header.
//! Authenticating that header is left to the gateway in front of this service.

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use uuid::Uuid;

use herald_common::error::AppError;

pub const CUSTOMER_HEADER: &str = "x-customer-id";

#[derive(Debug, Clone, Copy)]
pub struct CustomerId(pub Uuid);

impl<S: Send + Sync> FromRequestParts<S> for CustomerId {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let raw = parts
            .headers
            .get(CUSTOMER_HEADER)
            .ok_or_else(|| AppError::Validation("Missing X-Customer-Id header".to_string()))?;

        raw.to_str()
            .ok()
            .and_then(|value| Uuid::parse_str(value.trim()).ok())
            .map(CustomerId)
            .ok_or_else(|| AppError::Validation("X-Customer-Id must be a UUID".to_string()))
    }
}
