use crate::util::logging::standards::events;
use axum::{extract::Request, http::HeaderMap, middleware::Next, response::Response};
use std::time::Instant;
use uuid::Uuid;

/// 写入请求扩展中的请求 ID
#[derive(Debug, Clone)]
pub struct RequestId(pub String);

fn extract_client_ip(headers: &HeaderMap) -> Option<String> {
    headers
        .get("x-forwarded-for")
        .or_else(|| headers.get("x-real-ip"))
        .and_then(|h| h.to_str().ok())
        .and_then(|s| s.split(',').next())
        .map(|s| s.trim().to_string())
}

fn parse_content_length(headers: &HeaderMap) -> usize {
    headers
        .get("content-length")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(0)
}

fn is_quiet_path(path: &str) -> bool {
    matches!(path, "/api/health" | "/favicon.ico")
}

// 统一请求日志中间件
pub async fn request_logging_middleware(mut request: Request, next: Next) -> Response {
    let start_time = Instant::now();
    let request_id = Uuid::new_v4().to_string();
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let client_ip = extract_client_ip(request.headers());
    let request_size = parse_content_length(request.headers());
    request
        .extensions_mut()
        .insert(RequestId(request_id.clone()));

    let quiet_path = is_quiet_path(&path);
    if !quiet_path {
        tracing::debug!(
            target: "http.server",
            event = events::REQUEST_RECEIVED,
            request_id = %request_id,
            method = %method,
            path = %path,
            request_bytes = request_size,
            client_ip = client_ip.as_deref().unwrap_or("unknown")
        );
    }

    let response = next.run(request).await;
    let duration_ms = start_time.elapsed().as_millis() as u64;
    let status = response.status();

    if status.is_server_error() {
        tracing::error!(
            target: "http.server",
            event = events::REQUEST_ERROR,
            request_id = %request_id,
            method = %method,
            path = %path,
            status = status.as_u16(),
            duration_ms
        );
    } else if status.is_client_error() {
        tracing::warn!(
            target: "http.server",
            event = events::REQUEST_REJECTED,
            request_id = %request_id,
            method = %method,
            path = %path,
            status = status.as_u16(),
            duration_ms
        );
    } else if quiet_path {
        tracing::trace!(
            target: "http.server",
            event = events::REQUEST_COMPLETE,
            path = %path,
            status = status.as_u16()
        );
    } else {
        tracing::info!(
            target: "http.server",
            event = events::REQUEST_COMPLETE,
            request_id = %request_id,
            method = %method,
            path = %path,
            status = status.as_u16(),
            duration_ms
        );
    }

    response
}
