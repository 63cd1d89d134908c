//! Authentication Routes
//!
//! - POST /login - Exchange demo credentials for a bearer token
//! - `require_bearer` - Middleware guarding the WebSocket upgrade endpoint

use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Json, Response},
};
use axum_extra::{
    headers::{authorization::Bearer, Authorization},
    typed_header::TypedHeaderRejection,
    TypedHeader,
};
use parley_core::AuthError;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use super::{error_response, ErrorResponse};
use crate::server::AppState;

/// Username the bearer token was issued to, inserted into request extensions.
#[derive(Debug, Clone)]
pub struct AuthenticatedUser(pub String);

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct LoginResponse {
    pub token: String,
}

/// POST /login
pub async fn login_handler(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<LoginRequest>, JsonRejection>,
) -> Result<Json<LoginResponse>, (StatusCode, Json<ErrorResponse>)> {
    let Json(request) = payload.map_err(|rejection| {
        debug!(error = %rejection, "Rejected login body");
        error_response(StatusCode::BAD_REQUEST, "invalid_request", rejection.body_text())
    })?;

    let token = state
        .issuer
        .login(&request.username, &request.password)
        .map_err(auth_error_to_response)?;

    debug!(username = %request.username, "Issued token");
    Ok(Json(LoginResponse { token }))
}

/// Reject requests without a valid `Authorization: Bearer <token>` header.
pub async fn require_bearer(
    State(state): State<Arc<AppState>>,
    bearer: Result<TypedHeader<Authorization<Bearer>>, TypedHeaderRejection>,
    mut request: Request,
    next: Next,
) -> Response {
    let token = match bearer {
        Ok(TypedHeader(Authorization(bearer))) => bearer.token().to_string(),
        Err(rejection) if rejection.is_missing() => {
            return unauthorized("Missing Authorization header");
        }
        Err(_) => return unauthorized("Invalid Authorization header format"),
    };

    match state.gate.verify(&token) {
        Ok(username) => {
            debug!(%username, path = %request.uri().path(), "Bearer token accepted");
            request.extensions_mut().insert(AuthenticatedUser(username));
            next.run(request).await
        }
        Err(e) => {
            warn!(error = %e, "Bearer token rejected");
            unauthorized("Invalid token")
        }
    }
}

fn unauthorized(message: &str) -> Response {
    error_response(StatusCode::UNAUTHORIZED, "unauthorized", message).into_response()
}

/// Convert AuthError to HTTP response
fn auth_error_to_response(err: AuthError) -> (StatusCode, Json<ErrorResponse>) {
    let (status, error) = match &err {
        AuthError::UnknownUser(_) => (StatusCode::NOT_FOUND, "unknown_user"),
        AuthError::InvalidCredentials => (StatusCode::UNAUTHORIZED, "invalid_credentials"),
        AuthError::Signing(_) => {
            error!(error = %err, "Token signing failed");
            (StatusCode::INTERNAL_SERVER_ERROR, "internal_error")
        }
        _ => (StatusCode::UNAUTHORIZED, "unauthorized"),
    };

    error_response(status, error, err.to_string())
}
