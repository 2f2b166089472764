use axum::http::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 识别流水线的错误分类
#[derive(Debug, Clone, Error, PartialEq)]
pub enum OmrError {
    #[error("unsupported file type: {name}")]
    UnsupportedFormat { name: String },

    #[error("invalid image encoding: {0}")]
    InvalidEncoding(String),

    #[error("file too large: {size} bytes (limit {limit})")]
    TooLarge { size: usize, limit: usize },

    #[error("model not loaded")]
    Unavailable,

    #[error("recognition failed: {0}")]
    Recognition(String),

    #[error("missing required fields: {}", .0.join(", "))]
    MissingField(Vec<&'static str>),

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

/// 批量结果里随错误条目一起返回，调用方据此区分“整体不可用”与“单张失败”
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    UnsupportedFormat,
    InvalidEncoding,
    TooLarge,
    Unavailable,
    Recognition,
    MissingField,
    InvalidRequest,
}

impl OmrError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            OmrError::UnsupportedFormat { .. } => ErrorKind::UnsupportedFormat,
            OmrError::InvalidEncoding(_) => ErrorKind::InvalidEncoding,
            OmrError::TooLarge { .. } => ErrorKind::TooLarge,
            OmrError::Unavailable => ErrorKind::Unavailable,
            OmrError::Recognition(_) => ErrorKind::Recognition,
            OmrError::MissingField(_) => ErrorKind::MissingField,
            OmrError::InvalidRequest(_) => ErrorKind::InvalidRequest,
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            OmrError::UnsupportedFormat { .. }
            | OmrError::InvalidEncoding(_)
            | OmrError::MissingField(_)
            | OmrError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            OmrError::TooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            OmrError::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
            OmrError::Recognition(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}
