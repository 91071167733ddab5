use axum::{
    Extension,
    extract::{Json, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use chrono::NaiveDate;
use serde::Deserialize;

use crate::AppState;
use crate::error::AppError;
use crate::routes::post::model::PostWindow;
use crate::utils::{Claims, success_to_api_response};

use super::model::{self, CreateGroupRequest};

#[derive(Debug, Deserialize)]
pub struct OpenQuery {
    pub group_type: Option<String>,
    pub day: Option<NaiveDate>,
    pub start: Option<i64>,
    pub limit: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct TypedPageQuery {
    pub group_type: Option<String>,
    pub start: Option<i64>,
    pub limit: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct DetailQuery {
    pub group_id: String,
    pub start: Option<i64>,
    pub limit: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct IdBody {
    pub group_id: String,
}

#[derive(Debug, Deserialize)]
pub struct MemberBody {
    pub group_id: String,
    pub user_id: String,
}

#[derive(Debug, Deserialize)]
pub struct GroupReportBody {
    pub group_id: String,
    pub message: Option<String>,
}

#[axum::debug_handler]
pub async fn list_open(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Query(query): Query<OpenQuery>,
) -> Result<impl IntoResponse, AppError> {
    let groups = model::list_open_groups(
        &state,
        &claims,
        query.group_type,
        query.day,
        query.start,
        query.limit,
    )
    .await?;
    Ok((StatusCode::OK, success_to_api_response(groups)))
}

#[axum::debug_handler]
pub async fn list_joined(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Query(query): Query<TypedPageQuery>,
) -> Result<impl IntoResponse, AppError> {
    let groups = model::list_joined_groups(
        &state,
        &claims,
        query.group_type,
        query.start,
        query.limit,
    )
    .await?;
    Ok((StatusCode::OK, success_to_api_response(groups)))
}

#[axum::debug_handler]
pub async fn list_owned(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Query(query): Query<TypedPageQuery>,
) -> Result<impl IntoResponse, AppError> {
    let groups = model::list_owned_groups(
        &state,
        &claims,
        query.group_type,
        query.start,
        query.limit,
    )
    .await?;
    Ok((StatusCode::OK, success_to_api_response(groups)))
}

#[axum::debug_handler]
pub async fn get_detail(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Query(query): Query<DetailQuery>,
) -> Result<impl IntoResponse, AppError> {
    let window = PostWindow {
        start: query.start,
        limit: query.limit,
    };
    let detail = model::group_detail(&state, &claims, &query.group_id, window).await?;
    Ok((StatusCode::OK, success_to_api_response(detail)))
}

#[axum::debug_handler]
pub async fn create_group(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<CreateGroupRequest>,
) -> Result<impl IntoResponse, AppError> {
    let detail = model::create_group(&state, &claims, req).await?;
    Ok((StatusCode::CREATED, success_to_api_response(detail)))
}

#[axum::debug_handler]
pub async fn cancel_group(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<IdBody>,
) -> Result<impl IntoResponse, AppError> {
    let detail = model::cancel_group(&state, &claims, &req.group_id).await?;
    Ok((StatusCode::OK, success_to_api_response(detail)))
}

#[axum::debug_handler]
pub async fn join_group(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<IdBody>,
) -> Result<impl IntoResponse, AppError> {
    let detail = model::join_group(&state, &claims, &req.group_id).await?;
    Ok((StatusCode::OK, success_to_api_response(detail)))
}

#[axum::debug_handler]
pub async fn leave_group(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<IdBody>,
) -> Result<impl IntoResponse, AppError> {
    let detail = model::unjoin_group(&state, &claims, &req.group_id).await?;
    Ok((StatusCode::OK, success_to_api_response(detail)))
}

#[axum::debug_handler]
pub async fn add_member(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<MemberBody>,
) -> Result<impl IntoResponse, AppError> {
    let detail = model::add_member(&state, &claims, &req.group_id, &req.user_id).await?;
    Ok((StatusCode::OK, success_to_api_response(detail)))
}

#[axum::debug_handler]
pub async fn remove_member(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<MemberBody>,
) -> Result<impl IntoResponse, AppError> {
    let detail = model::remove_member(&state, &claims, &req.group_id, &req.user_id).await?;
    Ok((StatusCode::OK, success_to_api_response(detail)))
}

#[axum::debug_handler]
pub async fn report_group(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<GroupReportBody>,
) -> Result<impl IntoResponse, AppError> {
    model::report_group(&state, &claims, &req.group_id, req.message.as_deref()).await?;
    Ok((
        StatusCode::CREATED,
        success_to_api_response(serde_json::json!({ "accepted": true })),
    ))
}
