use axum::{
    extract::{DefaultBodyLimit, FromRef, Multipart, Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use bytes::Bytes;
use serde_json::{json, Value};
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use super::dto::{AuthResponse, LoginRequest, RegisterRequest, UpdateUserRequest};
use super::extractors::AuthSession;
use super::repo::{User, UserChanges};
use super::services::{
    hash_password, is_acceptable_password, is_valid_email, process_avatar, updates_allowed,
    validate_upload, verify_password, JwtKeys,
};
use crate::state::AppState;

pub fn user_routes() -> Router<AppState> {
    Router::new()
        .route("/users", post(register))
        .route("/users/login", post(login))
        .route("/users/logout", post(logout))
        .route("/users/logoutAll", post(logout_all))
        .route("/users/me", get(get_me).patch(update_me).delete(delete_me))
        .route("/users/me/avatar", post(upload_avatar).delete(delete_avatar))
        .route("/users/:id/avatar", get(get_avatar))
        // Generous transport cap; the 1MB avatar rule is enforced by the
        // upload filter so oversized files get a proper error body.
        .layer(DefaultBodyLimit::max(5 * 1024 * 1024))
}

#[instrument(skip_all)]
pub async fn register(
    State(state): State<AppState>,
    Json(mut payload): Json<RegisterRequest>,
) -> Result<(StatusCode, Json<AuthResponse>), (StatusCode, Json<Value>)> {
    payload.email = payload.email.trim().to_lowercase();

    if !is_valid_email(&payload.email) {
        warn!(email = %payload.email, "invalid email");
        return Err(bad_request("Invalid email"));
    }
    if !is_acceptable_password(&payload.password) {
        warn!("password rejected by policy");
        return Err(bad_request("Invalid password"));
    }
    let age = payload.age.unwrap_or(0);
    if age < 0 {
        return Err(bad_request("Age must be a positive number"));
    }

    if let Ok(Some(_)) = User::find_by_email(&state.db, &payload.email).await {
        warn!(email = %payload.email, "email already registered");
        return Err(bad_request("Email already registered"));
    }

    let hash = hash_password(&payload.password).map_err(|e| bad_request(e.to_string()))?;

    let user = User::create(&state.db, &payload.name, &payload.email, &hash, age)
        .await
        .map_err(|e| {
            error!(error = %e, "create user failed");
            bad_request(e.to_string())
        })?;

    let keys = JwtKeys::from_ref(&state);
    let token = keys.sign(user.id).map_err(|e| bad_request(e.to_string()))?;
    User::add_token(&state.db, user.id, &token)
        .await
        .map_err(|e| {
            error!(error = %e, user_id = %user.id, "persist session token failed");
            bad_request(e.to_string())
        })?;

    info!(user_id = %user.id, email = %user.email, "user registered");
    Ok((StatusCode::CREATED, Json(AuthResponse { user, token })))
}

/// Login failures are deliberately opaque: always 400 with an empty body,
/// whichever part of the credential check failed.
#[instrument(skip_all)]
pub async fn login(
    State(state): State<AppState>,
    Json(mut payload): Json<LoginRequest>,
) -> Result<Json<AuthResponse>, StatusCode> {
    payload.email = payload.email.trim().to_lowercase();

    let user = match User::find_by_email(&state.db, &payload.email).await {
        Ok(Some(u)) => u,
        Ok(None) => {
            warn!(email = %payload.email, "login unknown email");
            return Err(StatusCode::BAD_REQUEST);
        }
        Err(e) => {
            error!(error = %e, "find_by_email failed");
            return Err(StatusCode::BAD_REQUEST);
        }
    };

    let ok = verify_password(&payload.password, &user.password_hash).unwrap_or(false);
    if !ok {
        warn!(user_id = %user.id, "login invalid password");
        return Err(StatusCode::BAD_REQUEST);
    }

    let keys = JwtKeys::from_ref(&state);
    let token = keys.sign(user.id).map_err(|_| StatusCode::BAD_REQUEST)?;
    User::add_token(&state.db, user.id, &token)
        .await
        .map_err(|e| {
            error!(error = %e, user_id = %user.id, "persist session token failed");
            StatusCode::BAD_REQUEST
        })?;

    info!(user_id = %user.id, "user logged in");
    Ok(Json(AuthResponse { user, token }))
}

#[instrument(skip_all)]
pub async fn logout(State(state): State<AppState>, session: AuthSession) -> StatusCode {
    match User::remove_token(&state.db, session.user.id, &session.token).await {
        Ok(()) => StatusCode::OK,
        Err(e) => {
            error!(error = %e, user_id = %session.user.id, "logout failed");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

#[instrument(skip_all)]
pub async fn logout_all(State(state): State<AppState>, session: AuthSession) -> StatusCode {
    match User::clear_tokens(&state.db, session.user.id).await {
        Ok(()) => StatusCode::OK,
        Err(e) => {
            error!(error = %e, user_id = %session.user.id, "logout all failed");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

#[instrument(skip_all)]
pub async fn upload_avatar(
    State(state): State<AppState>,
    session: AuthSession,
    mut multipart: Multipart,
) -> Response {
    let mut upload: Option<(Option<String>, Bytes)> = None;
    while let Ok(Some(field)) = multipart.next_field().await {
        if field.name() == Some("avatar") {
            let filename = field.file_name().map(|s| s.to_string());
            let data = match field.bytes().await {
                Ok(b) => b,
                Err(e) => {
                    warn!(error = %e, "failed to read avatar field");
                    return StatusCode::BAD_REQUEST.into_response();
                }
            };
            upload = Some((filename, data));
            break;
        }
    }
    let Some((filename, data)) = upload else {
        return StatusCode::BAD_REQUEST.into_response();
    };

    if let Err(e) = validate_upload(filename.as_deref(), data.len()) {
        warn!(error = %e, "avatar upload rejected by filter");
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": e.to_string() })),
        )
            .into_response();
    }

    // Image decode/encode is CPU-bound; keep it off the async workers.
    let png = match tokio::task::spawn_blocking(move || process_avatar(&data)).await {
        Ok(Ok(png)) => png,
        Ok(Err(e)) => {
            warn!(error = %e, "avatar transform failed");
            return StatusCode::BAD_REQUEST.into_response();
        }
        Err(e) => {
            error!(error = %e, "avatar transform task failed");
            return StatusCode::BAD_REQUEST.into_response();
        }
    };

    match User::set_avatar(&state.db, session.user.id, &png).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => {
            error!(error = %e, user_id = %session.user.id, "persist avatar failed");
            StatusCode::BAD_REQUEST.into_response()
        }
    }
}

#[instrument(skip_all)]
pub async fn delete_avatar(State(state): State<AppState>, session: AuthSession) -> StatusCode {
    match User::clear_avatar(&state.db, session.user.id).await {
        Ok(()) => StatusCode::OK,
        Err(e) => {
            error!(error = %e, user_id = %session.user.id, "clear avatar failed");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

/// Public; a malformed id is indistinguishable from an unknown one.
#[instrument(skip(state))]
pub async fn get_avatar(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let Ok(id) = Uuid::parse_str(&id) else {
        return StatusCode::NOT_FOUND.into_response();
    };

    match User::find_by_id(&state.db, id).await {
        Ok(Some(User {
            avatar: Some(bytes),
            ..
        })) => ([(header::CONTENT_TYPE, "image/png")], bytes).into_response(),
        Ok(_) => StatusCode::NOT_FOUND.into_response(),
        Err(e) => {
            error!(error = %e, %id, "avatar lookup failed");
            StatusCode::NOT_FOUND.into_response()
        }
    }
}

#[instrument(skip_all)]
pub async fn get_me(session: AuthSession) -> Json<User> {
    Json(session.user)
}

#[instrument(skip_all)]
pub async fn update_me(
    State(state): State<AppState>,
    session: AuthSession,
    Json(body): Json<serde_json::Map<String, Value>>,
) -> Result<Json<User>, (StatusCode, Json<Value>)> {
    if !updates_allowed(body.keys().map(String::as_str)) {
        warn!(user_id = %session.user.id, "update with unknown field");
        return Err(bad_request("Invalid updates!"));
    }

    let req: UpdateUserRequest =
        serde_json::from_value(Value::Object(body)).map_err(|e| internal(e.into()))?;

    let mut changes = UserChanges {
        name: req.name,
        email: req.email.map(|e| e.trim().to_lowercase()),
        password_hash: None,
        age: req.age,
    };
    if let Some(password) = req.password {
        changes.password_hash = Some(hash_password(&password).map_err(internal)?);
    }

    let user = User::apply_changes(&state.db, session.user.id, &changes)
        .await
        .map_err(|e| {
            error!(error = %e, user_id = %session.user.id, "profile update failed");
            internal(e)
        })?;

    info!(user_id = %user.id, "profile updated");
    Ok(Json(user))
}

#[instrument(skip_all)]
pub async fn delete_me(
    State(state): State<AppState>,
    session: AuthSession,
) -> Result<Json<User>, (StatusCode, Json<Value>)> {
    User::delete(&state.db, session.user.id).await.map_err(|e| {
        error!(error = %e, user_id = %session.user.id, "delete account failed");
        internal(e)
    })?;

    info!(user_id = %session.user.id, "account deleted");
    Ok(Json(session.user))
}

fn bad_request(msg: impl Into<String>) -> (StatusCode, Json<Value>) {
    (StatusCode::BAD_REQUEST, Json(json!({ "error": msg.into() })))
}

fn internal(e: anyhow::Error) -> (StatusCode, Json<Value>) {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": e.to_string() })),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn app_routes_build_without_conflicts() {
        // Route registration panics on conflicting paths, e.g. if
        // /users/me/avatar and /users/:id/avatar ever collide.
        let _app = crate::app::build_app(crate::state::AppState::fake());
    }

    #[test]
    fn invalid_updates_error_body() {
        let (status, Json(body)) = bad_request("Invalid updates!");
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body, json!({ "error": "Invalid updates!" }));
    }

    #[test]
    fn internal_error_body_carries_message() {
        let (status, Json(body)) = internal(anyhow::anyhow!("boom"));
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["error"], "boom");
    }
}
