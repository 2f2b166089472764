use crate::api::{endpoint_list, ENDPOINTS, SERVICE_NAME};
use crate::build_info;
use crate::model::MediaKind;
use crate::util::WebResult;
use crate::AppState;
use axum::extract::State;
use axum::http::{header, HeaderValue};
use axum::response::IntoResponse;
use chrono::Utc;
use serde_json::{json, Map, Value};

/// 服务说明与调用示例
pub async fn index() -> impl IntoResponse {
    let endpoints: Map<String, Value> = ENDPOINTS
        .iter()
        .map(|(method, path, description)| {
            (format!("{} {}", method, path), Value::from(*description))
        })
        .collect();

    WebResult::ok(json!({
        "service": SERVICE_NAME,
        "version": build_info::summary(),
        "endpoints": endpoints,
        "usage": {
            "process_file": "curl -X POST -F 'file=@sheet.jpg' http://localhost:5000/api/process",
            "process_base64": "curl -X POST -H 'Content-Type: application/json' -d '{\"image\": \"<base64>\"}' http://localhost:5000/api/process",
            "batch": "curl -X POST -F 'files[]=@a.jpg' -F 'files[]=@b.jpg' http://localhost:5000/api/batch",
            "validate": "curl -X POST -H 'Content-Type: application/json' -d '{\"detected_answers\": {\"1\": \"A\"}, \"answer_key\": {\"1\": \"A\"}}' http://localhost:5000/api/validate"
        },
        "available_endpoints": endpoint_list(),
    }))
}

/// 健康检查：始终返回 200，模型未加载时状态为 degraded
pub async fn health(State(app_state): State<AppState>) -> impl IntoResponse {
    let model_loaded = app_state.gateway.is_available();
    let body = WebResult::ok(json!({
        "status": if model_loaded { "healthy" } else { "degraded" },
        "model_loaded": model_loaded,
        "service": SERVICE_NAME,
        "version": build_info::summary(),
        "model_path": app_state.config.model.path,
        "uptime": app_state.started_at.elapsed().as_secs(),
        "timestamp": Utc::now().to_rfc3339(),
    }));

    let mut resp = body.into_response();
    resp.headers_mut()
        .insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
    resp
}

pub async fn model_info(State(app_state): State<AppState>) -> impl IntoResponse {
    let model = &app_state.config.model;
    WebResult::ok(json!({
        "model_type": model.kind,
        "model_path": model.path,
        "input_size": model.input_size,
        "supported_formats": MediaKind::allowed_types(),
        "model_loaded": app_state.gateway.is_available(),
        "recognition_timeout_secs": app_state.gateway.timeout().as_secs(),
        "batch": {
            "max_items": app_state.config.batch.max_items,
            "max_concurrency": app_state.orchestrator.concurrency(),
        },
        "engine_pool": app_state.engine_pool.as_ref().map(|pool| pool.stats()),
    }))
}
