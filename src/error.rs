use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};

use crate::utils::{error_codes, error_to_api_response};

/// 群聊操作的错误类型
#[derive(Debug)]
pub enum AppError {
    /// 用户已经在群组中
    AlreadyMember,
    /// 用户不在群组中
    NotMember,
    /// 存在屏蔽关系，对外表现为资源不存在
    Unavailable,
    /// 没有权限执行此操作
    Forbidden,
    /// 该群组类型不允许此操作
    InvalidOperation(&'static str),
    /// 群组被管理员锁定
    Locked,
    /// 内容不符合规则（图片数量、文本长度等）
    InvalidContent(&'static str),
    /// 资源不存在
    NotFound,
    /// 未授权访问
    Unauthorized,
    /// 不变量被破坏，出现即为 bug
    Internal(String),
    Database(sqlx::Error),
}

impl From<sqlx::Error> for AppError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::RowNotFound => AppError::NotFound,
            other => AppError::Database(other),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, message) = match self {
            AppError::AlreadyMember => (
                StatusCode::BAD_REQUEST,
                error_codes::ALREADY_MEMBER,
                "已经是群组成员".to_string(),
            ),
            AppError::NotMember => (
                StatusCode::BAD_REQUEST,
                error_codes::NOT_MEMBER,
                "用户不在群组中".to_string(),
            ),
            // 屏蔽关系与真正的不存在必须返回完全相同的响应，
            // 防止通过错误类型探测屏蔽状态
            AppError::Unavailable | AppError::NotFound => (
                StatusCode::NOT_FOUND,
                error_codes::NOT_FOUND,
                "资源不存在".to_string(),
            ),
            AppError::Forbidden => (
                StatusCode::FORBIDDEN,
                error_codes::PERMISSION_DENIED,
                "没有权限执行此操作".to_string(),
            ),
            AppError::InvalidOperation(msg) => (
                StatusCode::BAD_REQUEST,
                error_codes::INVALID_OPERATION,
                msg.to_string(),
            ),
            AppError::Locked => (
                StatusCode::LOCKED,
                error_codes::GROUP_LOCKED,
                "群组已被锁定，禁止发帖".to_string(),
            ),
            AppError::InvalidContent(msg) => (
                StatusCode::BAD_REQUEST,
                error_codes::VALIDATION_ERROR,
                msg.to_string(),
            ),
            AppError::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                error_codes::AUTH_FAILED,
                "未授权访问".to_string(),
            ),
            AppError::Internal(detail) => {
                tracing::error!("Invariant violation: {}", detail);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    error_codes::INTERNAL_ERROR,
                    "内部服务器错误".to_string(),
                )
            }
            AppError::Database(e) => {
                tracing::error!("Database error: {}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    error_codes::INTERNAL_ERROR,
                    "内部服务器错误".to_string(),
                )
            }
        };

        (status, error_to_api_response::<()>(code, message)).into_response()
    }
}
