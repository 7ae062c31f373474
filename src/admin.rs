// Login surface for the administrative UI. The user, key and policy
// management endpoints live in a separate service; this side only
// exchanges credentials for bearer tokens and identifies their holder.

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode, header};
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    username: String,
    password: String,
}

#[derive(Debug, Serialize)]
pub struct LoginResponse {
    token: String,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    error: String,
}

fn unauthorized() -> (StatusCode, Json<ErrorResponse>) {
    (
        StatusCode::UNAUTHORIZED,
        Json(ErrorResponse {
            error: "invalid credentials".to_string(),
        }),
    )
}

#[axum::debug_handler]
pub async fn login(
    State(state): State<AppState>,
    Json(request): Json<LoginRequest>,
) -> Result<Json<LoginResponse>, (StatusCode, Json<ErrorResponse>)> {
    let user = match state.db.get_user(&request.username).await {
        Ok(Some(user)) => user,
        Ok(None) => return Err(unauthorized()),
        Err(error) => {
            tracing::error!(%error, "Login lookup failed");
            return Err(unauthorized());
        }
    };

    // Seeded accounts carry '!' until a real password is configured;
    // bcrypt rejects that as an invalid hash, which is what we want.
    let verified = bcrypt::verify(&request.password, &user.password_hash).unwrap_or(false);
    if !verified {
        tracing::warn!(username = request.username, "Login rejected");
        return Err(unauthorized());
    }

    let token = state.tokens.issue(&user.username).map_err(|error| {
        tracing::error!(%error, "Token signing failed");
        unauthorized()
    })?;
    tracing::info!(username = user.username, "Login succeeded");
    Ok(Json(LoginResponse { token }))
}

#[derive(Debug, Serialize)]
pub struct WhoAmIResponse {
    username: String,
}

#[axum::debug_handler]
/// Identifies the holder of a bearer token.
pub async fn whoami(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<WhoAmIResponse>, (StatusCode, Json<ErrorResponse>)> {
    let token = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .ok_or_else(unauthorized)?;
    let username = state.tokens.verify(token).map_err(|_| unauthorized())?;
    Ok(Json(WhoAmIResponse { username }))
}
