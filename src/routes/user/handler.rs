use axum::{
    Extension,
    extract::{Json, State},
    http::StatusCode,
    response::IntoResponse,
};
use serde::{Deserialize, Serialize};

use crate::AppState;
use crate::error::AppError;
use crate::utils::{Claims, generate_token, success_to_api_response, verify_password};

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub user_id: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct LoginResponse {
    pub user_id: String,
    pub display_name: String,
    pub token: String,
    pub expires_at: i64,
}

#[axum::debug_handler]
pub async fn login(
    State(state): State<AppState>,
    Json(req): Json<LoginRequest>,
) -> Result<impl IntoResponse, AppError> {
    let user = state
        .store
        .find_user(&req.user_id)
        .await?
        .ok_or(AppError::Unauthorized)?;

    let valid = verify_password(&req.password, &user.password_hash)
        .map_err(|_| AppError::Unauthorized)?;
    if !valid {
        return Err(AppError::Unauthorized);
    }

    let (token, expires_at) = generate_token(&user.user_id, &user.role, &state.config)
        .map_err(|e| AppError::Internal(format!("token generation failed: {}", e)))?;

    Ok((
        StatusCode::OK,
        success_to_api_response(LoginResponse {
            user_id: user.user_id,
            display_name: user.display_name,
            token,
            expires_at,
        }),
    ))
}

#[axum::debug_handler]
pub async fn check_token(Extension(claims): Extension<Claims>) -> impl IntoResponse {
    (
        StatusCode::OK,
        success_to_api_response(serde_json::json!({
            "user_id": claims.sub,
            "role": claims.role,
            "expires_at": claims.exp,
        })),
    )
}
