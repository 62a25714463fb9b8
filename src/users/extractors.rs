use axum::{
    async_trait,
    extract::{FromRef, FromRequestParts},
    http::{request::Parts, StatusCode},
};
use tracing::warn;

use super::repo::User;
use super::services::JwtKeys;
use crate::state::AppState;

/// Auth gate: resolves the bearer token to the user record plus the token
/// itself. A token that verifies but is no longer in the user's token list
/// (logged out) is rejected the same as a forged one.
pub struct AuthSession {
    pub user: User,
    pub token: String,
}

#[async_trait]
impl FromRequestParts<AppState> for AuthSession {
    type Rejection = (StatusCode, String);

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let auth_header = parts
            .headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .ok_or((
                StatusCode::UNAUTHORIZED,
                "Missing Authorization header".to_string(),
            ))?;

        let token = auth_header.strip_prefix("Bearer ").ok_or((
            StatusCode::UNAUTHORIZED,
            "Invalid Authorization header".to_string(),
        ))?;

        let keys = JwtKeys::from_ref(state);
        let claims = match keys.verify(token) {
            Ok(c) => c,
            Err(_) => {
                warn!("invalid session token");
                return Err((StatusCode::UNAUTHORIZED, "Please authenticate".to_string()));
            }
        };

        let user = User::find_by_id(&state.db, claims.sub)
            .await
            .ok()
            .flatten()
            .ok_or((StatusCode::UNAUTHORIZED, "Please authenticate".to_string()))?;

        if !user.tokens.iter().any(|t| t == token) {
            warn!(user_id = %user.id, "token not in active session list");
            return Err((StatusCode::UNAUTHORIZED, "Please authenticate".to_string()));
        }

        Ok(AuthSession {
            user,
            token: token.to_string(),
        })
    }
}
