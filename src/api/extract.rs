//! Request authentication extractors
//!
//! Users and peers prove who they are with the same three headers: an id
//! (`X-Actor-Id` or `X-Server-Id`), `X-Timestamp` and `X-Signature`.

use axum::{
    async_trait,
    extract::{FromRef, FromRequestParts},
    http::request::Parts,
};

use crate::AppState;
use crate::error::AppError;
use crate::federation::{ACTOR_ID_HEADER, Credentials, SERVER_ID_HEADER};

/// Actor credentials as sent, not yet verified
///
/// The activity service checks them against the activity's actor.
#[derive(Debug, Clone)]
pub struct ActorCredentials(pub Option<Credentials>);

#[async_trait]
impl<S> FromRequestParts<S> for ActorCredentials
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(ActorCredentials(Credentials::from_headers(
            &parts.headers,
            ACTOR_ID_HEADER,
        )?))
    }
}

/// Verified actor, or `None` for anonymous callers
///
/// Bad credentials degrade to anonymous instead of failing the request.
#[derive(Debug, Clone)]
pub struct MaybeActor(pub Option<String>);

#[async_trait]
impl<S> FromRequestParts<S> for MaybeActor
where
    AppState: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = std::convert::Infallible;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let state = AppState::from_ref(state);
        let credentials = Credentials::from_headers(&parts.headers, ACTOR_ID_HEADER)
            .ok()
            .flatten();
        let actor = state
            .identity
            .authenticate_actor_or_anonymous(credentials.as_ref())
            .await;
        Ok(MaybeActor(actor))
    }
}

/// Authenticated peer domain
#[derive(Debug, Clone)]
pub struct PeerServer(pub String);

#[async_trait]
impl<S> FromRequestParts<S> for PeerServer
where
    AppState: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let state = AppState::from_ref(state);
        let credentials = Credentials::from_headers(&parts.headers, SERVER_ID_HEADER)?
            .ok_or(AppError::Unauthorized)?;
        let domain = state.identity.authenticate_server(&credentials).await?;
        Ok(PeerServer(domain))
    }
}
