use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

pub mod config;
pub mod log;
pub mod logging;
pub mod middleware;

/// 统一的接口返回结构，`errorCode` 与 HTTP 状态码一致
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WebResult {
    pub success: bool,
    #[serde(rename = "errorCode")]
    pub code: u32,
    #[serde(rename = "errorMsg")]
    pub msg: String,
    pub data: Value,
}

impl WebResult {
    pub fn ok(data: impl Serialize) -> Self {
        Self {
            success: true,
            code: 200,
            msg: "".to_string(),
            data: json!(data),
        }
    }

    pub fn err_with_code(code: u32, msg: impl ToString) -> Self {
        Self {
            success: false,
            code,
            msg: msg.to_string(),
            data: Default::default(),
        }
    }

    pub fn with_data(mut self, data: impl Serialize) -> Self {
        self.data = json!(data);
        self
    }

    pub fn status(&self) -> StatusCode {
        u16::try_from(self.code)
            .ok()
            .and_then(|code| StatusCode::from_u16(code).ok())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
    }
}

impl IntoResponse for WebResult {
    fn into_response(self) -> Response {
        (self.status(), Json(self)).into_response()
    }
}
