//! Prometheus metrics endpoint
//!
//! `GET /metrics` in Prometheus text format, readable by local admins.

use axum::{
    Router,
    extract::State,
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use prometheus::{Encoder, TextEncoder};

use super::extract::MaybeActor;
use crate::AppState;
use crate::data::User;
use crate::error::AppError;
use crate::metrics::REGISTRY;

async fn metrics_handler(
    State(state): State<AppState>,
    MaybeActor(actor): MaybeActor,
) -> Result<Response, AppError> {
    let actor = actor.ok_or(AppError::Unauthorized)?;
    let is_admin = state
        .db
        .find::<User>(&actor)
        .await?
        .is_some_and(|user| user.is_admin && !user.lifecycle.is_deleted());
    if !is_admin {
        return Err(AppError::Forbidden("metrics are restricted to admins".to_string()));
    }

    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    match encoder.encode_to_string(&metric_families) {
        Ok(text) => Ok((
            StatusCode::OK,
            [(header::CONTENT_TYPE, encoder.format_type())],
            text,
        )
            .into_response()),
        Err(e) => {
            tracing::error!(error = %e, "Failed to encode metrics");
            Err(AppError::Internal(e.into()))
        }
    }
}

pub fn metrics_router() -> Router<AppState> {
    Router::new().route("/metrics", get(metrics_handler))
}
