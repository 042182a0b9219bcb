//! Peer endpoints
//!
//! - POST /inbox - signed activity from a peer server
//! - GET /server - this server's identity

use axum::body::Bytes;
use axum::{
    Router,
    extract::State,
    http::StatusCode,
    response::Json,
    routing::{get, post},
};
use serde_json::{Value, json};

use super::activities::parse_body;
use super::extract::PeerServer;
use crate::AppState;
use crate::error::AppError;
use crate::metrics::FEDERATION_REQUEST_DURATION_SECONDS;

pub fn federation_router() -> Router<AppState> {
    Router::new()
        .route("/inbox", post(inbox))
        .route("/server", get(server_info))
}

/// POST /inbox
///
/// The activity is queued and applied by the inbox sweep.
async fn inbox(
    State(state): State<AppState>,
    PeerServer(domain): PeerServer,
    body: Bytes,
) -> Result<(StatusCode, Json<Value>), AppError> {
    let _timer = FEDERATION_REQUEST_DURATION_SECONDS
        .with_label_values(&["inbound"])
        .start_timer();

    let body = parse_body(&body)?;
    let id = state.activities.receive(body, &domain).await?;
    Ok((StatusCode::ACCEPTED, Json(json!({ "id": id }))))
}

/// GET /server
///
/// Peers fetch the public key here to verify `X-Server-Id` requests.
async fn server_info(State(state): State<AppState>) -> Result<Json<Value>, AppError> {
    let domain = &state.config.server.domain;
    let public_key = state
        .db
        .public_key(domain)
        .await?
        .ok_or_else(|| AppError::NotFound("server key".to_string()))?;

    Ok(Json(json!({
        "domain": domain,
        "publicKey": public_key,
    })))
}
