//! Client activity endpoints
//!
//! - POST /activities - submit an activity
//! - GET /activities/:id - read one activity

use axum::body::Bytes;
use axum::{
    Router,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
};
use serde_json::{Value, json};

use super::extract::{ActorCredentials, MaybeActor};
use crate::AppState;
use crate::data::Activity;
use crate::error::AppError;
use crate::metrics::ERRORS_TOTAL;

pub fn activities_router() -> Router<AppState> {
    Router::new()
        .route("/activities", post(submit_activity))
        .route("/activities/:id", get(get_activity))
}

/// Request body as JSON, reported as an envelope error otherwise
pub(super) fn parse_body(body: &Bytes) -> Result<Value, AppError> {
    serde_json::from_slice(body)
        .map_err(|e| AppError::InvalidActivity(vec![format!("body is not valid JSON: {}", e)]))
}

/// POST /activities
///
/// `201` with the decorated activity. A handler failure returns the
/// recorded activity alongside the error, with the error's status.
async fn submit_activity(
    State(state): State<AppState>,
    ActorCredentials(credentials): ActorCredentials,
    body: Bytes,
) -> Result<Response, AppError> {
    let body = parse_body(&body)?;
    let outcome = state.activities.submit(body, credentials.as_ref()).await?;

    match outcome.error {
        None => Ok((StatusCode::CREATED, Json(outcome.activity)).into_response()),
        Some(error) => {
            let (status, error_type) = error.status_and_type();
            ERRORS_TOTAL.with_label_values(&[error_type]).inc();
            Ok((
                status,
                Json(json!({
                    "activity": outcome.activity,
                    "error": error.public_message(),
                })),
            )
                .into_response())
        }
    }
}

/// GET /activities/:id
async fn get_activity(
    State(state): State<AppState>,
    MaybeActor(viewer): MaybeActor,
    Path(id): Path<String>,
) -> Result<Json<Activity>, AppError> {
    let activity = state.activities.get_activity(&id, viewer.as_deref()).await?;
    Ok(Json(activity))
}
