mod health;
mod omr;

use crate::util::config::CorsConfig;
use crate::util::{middleware, WebResult};
use crate::AppState;
use axum::extract::DefaultBodyLimit;
use axum::http::{header, HeaderValue, Method};
use axum::middleware::from_fn;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::Router;
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use tracing::{info, warn};

pub const SERVICE_NAME: &str = "OMR Answer Sheet API";

/// (方法, 路径, 说明)
pub(crate) const ENDPOINTS: [(&str, &str, &str); 6] = [
    ("GET", "/", "service description"),
    ("GET", "/api/health", "health check"),
    ("POST", "/api/process", "process a single answer sheet"),
    ("POST", "/api/batch", "process multiple answer sheets"),
    ("POST", "/api/validate", "score detected answers against an answer key"),
    ("GET", "/api/model-info", "recognition model information"),
];

pub(crate) fn endpoint_list() -> Vec<String> {
    ENDPOINTS
        .iter()
        .map(|(method, path, _)| format!("{} {}", method, path))
        .collect()
}

/// 按配置创建CORS层，`*` 表示允许任意来源
fn create_cors_layer(cors: &CorsConfig) -> CorsLayer {
    let layer = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION]);

    if cors.allowed_origins.iter().any(|origin| origin.trim() == "*") {
        info!("[global] CORS配置 - 允许任意来源");
        return layer.allow_origin(Any);
    }

    let origins: Vec<HeaderValue> = cors
        .allowed_origins
        .iter()
        .filter_map(|s| match s.trim().parse::<HeaderValue>() {
            Ok(origin) => Some(origin),
            Err(e) => {
                warn!("无效的CORS源: {} - {}", s, e);
                None
            }
        })
        .collect();
    info!("[global] CORS配置 - 允许的源: {}", cors.allowed_origins.join(","));
    layer.allow_origin(origins)
}

pub fn routes(app_state: AppState) -> Router {
    let body_limit = app_state.config.request_body_limit();
    let cors = create_cors_layer(&app_state.config.cors);

    Router::new()
        .route("/", get(health::index))
        .route("/api/health", get(health::health))
        .route("/api/model-info", get(health::model_info))
        .route("/api/process", post(omr::process))
        .route("/api/batch", post(omr::batch))
        .route("/api/validate", post(omr::validate))
        .fallback(not_found)
        .with_state(app_state)
        // 由 RequestBodyLimitLayer 统一限制请求体大小
        .layer(DefaultBodyLimit::disable())
        .layer(RequestBodyLimitLayer::new(body_limit))
        .layer(from_fn(middleware::request_logging_middleware))
        .layer(cors)
}

async fn not_found() -> impl IntoResponse {
    WebResult::err_with_code(404, "Endpoint not found")
        .with_data(json!({ "available_endpoints": endpoint_list() }))
}


#[cfg(test)]
mod tests {
    use super::routes;
    use super::test_support::{body_json, get, state};
    use axum::http::StatusCode;
    use serde_json::json;
    use tower::ServiceExt;

    #[tokio::test]
    async fn health_reports_degraded_mode() {
        let (app_state, _dir) = state(false);
        let resp = routes(app_state).oneshot(get("/api/health")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()["cache-control"], "no-store");
        let data = body_json(resp).await["data"].clone();
        assert_eq!(data["status"], json!("degraded"));
        assert_eq!(data["model_loaded"], json!(false));
        assert_eq!(data["model_path"], json!("best.pt"));
    }

    #[tokio::test]
    async fn health_reports_healthy_when_loaded() {
        let (app_state, _dir) = state(true);
        let resp = routes(app_state).oneshot(get("/api/health")).await.unwrap();
        let data = body_json(resp).await["data"].clone();
        assert_eq!(data["status"], json!("healthy"));
        assert_eq!(data["model_loaded"], json!(true));
    }

    #[tokio::test]
    async fn model_info_lists_formats() {
        let (app_state, _dir) = state(true);
        let resp = routes(app_state).oneshot(get("/api/model-info")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let data = body_json(resp).await["data"].clone();
        assert_eq!(data["model_type"], json!("YOLOv8"));
        assert_eq!(data["input_size"], json!("640x640"));
        assert_eq!(data["supported_formats"].as_array().unwrap().len(), 5);
        assert_eq!(data["batch"]["max_items"], json!(4));
        assert!(data["engine_pool"].is_null());
    }

    #[tokio::test]
    async fn index_and_fallback_list_endpoints() {
        let (app_state, _dir) = state(true);
        let app = routes(app_state);

        let resp = app.clone().oneshot(get("/")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let data = body_json(resp).await["data"].clone();
        assert!(data["endpoints"]["POST /api/process"].is_string());

        let resp = app.oneshot(get("/api/unknown")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        let body = body_json(resp).await;
        assert_eq!(body["errorCode"], json!(404));
        assert_eq!(body["data"]["available_endpoints"].as_array().unwrap().len(), 6);
    }
}
