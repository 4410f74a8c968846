use crate::error::{AppError, AppResult};
use crate::users::{User, UserStore};
use axum::http::{HeaderMap, StatusCode};

pub fn extract_session_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|s| s.to_string())
}

/// Resolves the caller's session token to a full user row. Missing or
/// expired sessions are a 401; the identity itself is supplied by the
/// session collaborator, not by request input.
pub async fn current_user(headers: &HeaderMap, users: &UserStore) -> AppResult<User> {
    let token = extract_session_token(headers).ok_or_else(|| {
        AppError::new(StatusCode::UNAUTHORIZED, "unauthorized", "Unauthorized")
    })?;

    let session = users
        .get_session_by_token(&token)
        .await
        .map_err(AppError::internal)?
        .ok_or_else(|| {
            AppError::new(StatusCode::UNAUTHORIZED, "unauthorized", "Unauthorized")
        })?;

    users
        .get_user_by_id(&session.user_id)
        .await
        .map_err(AppError::internal)?
        .ok_or_else(|| {
            AppError::new(StatusCode::UNAUTHORIZED, "unauthorized", "Unauthorized")
        })
}
