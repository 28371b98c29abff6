use std::fmt;
use std::error::Error as StdError;
use serde::{Serialize, Deserialize};
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response, Json},
};

/// 服务器错误类型
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ServerError {
    /// 内部错误
    Internal(String),
    /// 推送网关拒绝凭证（GCM API Key 无效等）
    Authentication(String),
    /// 权限不足（internalOnly 且调用方非内部）
    PermissionDenied(String),
    /// 无效的请求（字段无法使用）
    InvalidRequest(String),
    /// 网络错误（重试耗尽后的传输失败）
    Network(String),
    /// 超时错误
    Timeout(String),
    /// 服务不可用（网关 5xx、通道未配置或已关闭）
    ServiceUnavailable(String),
    /// 序列化错误
    Serialization(String),
    /// 配置错误
    Configuration(String),
    /// Feedback 轮询错误（非致命）
    Feedback(String),
}

impl ServerError {
    /// 是否为可重试的瞬时错误
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ServerError::Network(_) | ServerError::Timeout(_) | ServerError::ServiceUnavailable(_)
        )
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            ServerError::Authentication(_) => StatusCode::UNAUTHORIZED,
            ServerError::PermissionDenied(_) => StatusCode::FORBIDDEN,
            ServerError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            ServerError::Network(_) => StatusCode::BAD_GATEWAY,
            ServerError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            ServerError::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerError::Internal(msg) => write!(f, "Internal error: {}", msg),
            ServerError::Authentication(msg) => write!(f, "Authentication error: {}", msg),
            ServerError::PermissionDenied(msg) => write!(f, "Permission denied: {}", msg),
            ServerError::InvalidRequest(msg) => write!(f, "Invalid request: {}", msg),
            ServerError::Network(msg) => write!(f, "Network error: {}", msg),
            ServerError::Timeout(msg) => write!(f, "Timeout error: {}", msg),
            ServerError::ServiceUnavailable(msg) => write!(f, "Service unavailable: {}", msg),
            ServerError::Serialization(msg) => write!(f, "Serialization error: {}", msg),
            ServerError::Configuration(msg) => write!(f, "Configuration error: {}", msg),
            ServerError::Feedback(msg) => write!(f, "Feedback error: {}", msg),
        }
    }
}

impl StdError for ServerError {}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let error_response = ErrorResponse::new(&self);
        (self.status_code(), Json(error_response)).into_response()
    }
}

impl From<std::io::Error> for ServerError {
    fn from(err: std::io::Error) -> Self {
        ServerError::Internal(err.to_string())
    }
}

impl From<serde_json::Error> for ServerError {
    fn from(err: serde_json::Error) -> Self {
        ServerError::Serialization(err.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for ServerError {
    fn from(err: tokio::time::error::Elapsed) -> Self {
        ServerError::Timeout(err.to_string())
    }
}

impl From<reqwest::Error> for ServerError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ServerError::Timeout(err.to_string())
        } else if err.is_decode() {
            ServerError::Serialization(err.to_string())
        } else {
            ServerError::Network(err.to_string())
        }
    }
}

/// 结果类型别名
pub type Result<T> = std::result::Result<T, ServerError>;

/// 错误代码
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    /// 内部错误
    Internal = 1000,
    /// 认证错误
    Authentication = 1001,
    /// 权限不足
    PermissionDenied = 1002,
    /// 无效的请求
    InvalidRequest = 1003,
    /// 网络错误
    Network = 2001,
    /// 序列化错误
    Serialization = 2002,
    /// 配置错误
    Configuration = 2003,
    /// 超时错误
    Timeout = 3002,
    /// 服务不可用
    ServiceUnavailable = 5000,
    /// Feedback 错误
    Feedback = 5001,
}

impl From<&ServerError> for ErrorCode {
    fn from(error: &ServerError) -> Self {
        match error {
            ServerError::Internal(_) => ErrorCode::Internal,
            ServerError::Authentication(_) => ErrorCode::Authentication,
            ServerError::PermissionDenied(_) => ErrorCode::PermissionDenied,
            ServerError::InvalidRequest(_) => ErrorCode::InvalidRequest,
            ServerError::Network(_) => ErrorCode::Network,
            ServerError::Timeout(_) => ErrorCode::Timeout,
            ServerError::ServiceUnavailable(_) => ErrorCode::ServiceUnavailable,
            ServerError::Serialization(_) => ErrorCode::Serialization,
            ServerError::Configuration(_) => ErrorCode::Configuration,
            ServerError::Feedback(_) => ErrorCode::Feedback,
        }
    }
}

/// 错误响应
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// 错误代码
    pub code: ErrorCode,
    /// 错误消息
    pub message: String,
    /// 详细信息
    pub details: Option<String>,
    /// 时间戳
    pub timestamp: u64,
}

impl ErrorResponse {
    /// 创建错误响应
    pub fn new(error: &ServerError) -> Self {
        Self {
            code: ErrorCode::from(error),
            message: error.to_string(),
            details: None,
            timestamp: chrono::Utc::now().timestamp() as u64,
        }
    }
}
