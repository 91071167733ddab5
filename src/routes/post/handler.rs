use axum::{
    Extension,
    extract::{Json, State},
    http::StatusCode,
    response::IntoResponse,
};
use serde::Deserialize;

use crate::AppState;
use crate::error::AppError;
use crate::utils::{Claims, success_to_api_response};

use super::model::{self, CreatePostRequest};

#[derive(Debug, Deserialize)]
pub struct PostIdBody {
    pub post_id: i64,
}

#[derive(Debug, Deserialize)]
pub struct PostReportBody {
    pub post_id: i64,
    pub message: Option<String>,
}

#[axum::debug_handler]
pub async fn create_post(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<CreatePostRequest>,
) -> Result<impl IntoResponse, AppError> {
    let post = model::add_post(&state, &claims, req).await?;
    Ok((StatusCode::CREATED, success_to_api_response(post)))
}

#[axum::debug_handler]
pub async fn delete_post(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<PostIdBody>,
) -> Result<impl IntoResponse, AppError> {
    model::delete_post(&state, &claims, req.post_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[axum::debug_handler]
pub async fn report_post(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<PostReportBody>,
) -> Result<impl IntoResponse, AppError> {
    model::report_post(&state, &claims, req.post_id, req.message.as_deref()).await?;
    Ok((
        StatusCode::CREATED,
        success_to_api_response(serde_json::json!({ "accepted": true })),
    ))
}
