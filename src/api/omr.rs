//! 答题卡识别与评分接口

use crate::model::scoring::{score, ValidationRequest};
use crate::model::{MediaKind, OmrError, Submission};
use crate::util::logging::standards::events;
use crate::util::WebResult;
use crate::AppState;
use axum::extract::multipart::{MultipartError, MultipartRejection};
use axum::extract::rejection::JsonRejection;
use axum::extract::{FromRequest, Multipart, Request, State};
use axum::http::header;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::{json, Value};

const PROCESS_HELP: &str =
    "Send image as multipart/form-data with \"file\" field or as JSON with \"image\" (base64) field";

/// 领域错误 → 统一返回结构
fn error_response(err: &OmrError) -> Response {
    let result = WebResult::err_with_code(u32::from(err.status().as_u16()), err);
    let result = match err {
        OmrError::UnsupportedFormat { .. } => {
            result.with_data(json!({ "allowed_types": MediaKind::allowed_types() }))
        }
        OmrError::MissingField(_) => {
            result.with_data(json!({ "required": ["detected_answers", "answer_key"] }))
        }
        OmrError::Unavailable => result.with_data(json!({
            "message": "OMR processor is not available. Please check server logs."
        })),
        _ => result,
    };
    result.into_response()
}

fn multipart_error(err: MultipartError) -> Response {
    WebResult::err_with_code(u32::from(err.status().as_u16()), err.body_text()).into_response()
}

fn bad_request(msg: &str) -> Response {
    WebResult::err_with_code(400, msg).into_response()
}

fn is_multipart(request: &Request) -> bool {
    content_type(request).starts_with("multipart/form-data")
}

fn is_json(request: &Request) -> bool {
    content_type(request).starts_with("application/json")
}

fn content_type(request: &Request) -> &str {
    request
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
}

/// POST /api/process
///
/// multipart 字段 `file`，或 JSON `{"image": "<base64>"}`
pub async fn process(State(app_state): State<AppState>, request: Request) -> Response {
    if !app_state.gateway.is_available() {
        return error_response(&OmrError::Unavailable);
    }

    let submission = match read_single_submission(&app_state, request).await {
        Ok(submission) => submission,
        Err(resp) => return resp,
    };

    match app_state.gateway.recognize_submission(submission).await {
        Ok(result) => WebResult::ok(result).into_response(),
        Err(err) => error_response(&err),
    }
}

async fn read_single_submission(app_state: &AppState, request: Request) -> Result<Submission, Response> {
    if is_multipart(&request) {
        let mut multipart = Multipart::from_request(request, app_state)
            .await
            .map_err(IntoResponse::into_response)?;
        while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
            if field.name() != Some("file") {
                continue;
            }
            let file_name = field.file_name().unwrap_or_default().to_string();
            let bytes = field.bytes().await.map_err(multipart_error)?;
            if file_name.is_empty() {
                return Err(bad_request("No file selected"));
            }
            let submission = Submission::upload(file_name, bytes.to_vec());
            if let Err(err) = submission.admit() {
                tracing::info!(
                    event = events::SUBMISSION_REJECTED,
                    filename = %submission.declared_name,
                    error = %err
                );
                return Err(error_response(&err));
            }
            tracing::debug!(
                event = events::SUBMISSION_ADMITTED,
                filename = %submission.declared_name,
                bytes = bytes.len()
            );
            return Ok(submission);
        }
    } else if is_json(&request) {
        let Json(body) = Json::<Value>::from_request(request, app_state)
            .await
            .map_err(|rejection| bad_request(&rejection.body_text()))?;
        if let Some(Value::String(image)) = body.get("image") {
            return Ok(Submission::encoded(image.clone()));
        }
    }

    Err(WebResult::err_with_code(400, "No image provided")
        .with_data(json!({ "help": PROCESS_HELP }))
        .into_response())
}

/// POST /api/batch
///
/// multipart 字段 `files[]`（兼容 `files`），逐项返回结果
pub async fn batch(
    State(app_state): State<AppState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Response {
    if !app_state.gateway.is_available() {
        return error_response(&OmrError::Unavailable);
    }
    let mut multipart = match multipart {
        Ok(multipart) => multipart,
        Err(_) => return bad_request("No files provided"),
    };

    let max_items = app_state.config.batch.max_items;
    let mut submissions = Vec::new();
    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(err) => return multipart_error(err),
        };
        if !matches!(field.name(), Some("files[]") | Some("files")) {
            continue;
        }
        if submissions.len() >= max_items {
            return error_response(&OmrError::InvalidRequest(format!(
                "too many files: at most {} per batch",
                max_items
            )));
        }
        let file_name = field.file_name().unwrap_or_default().to_string();
        let bytes = match field.bytes().await {
            Ok(bytes) => bytes,
            Err(err) => return multipart_error(err),
        };
        submissions.push(Submission::upload(file_name, bytes.to_vec()));
    }

    if submissions.is_empty() {
        return bad_request("No files provided");
    }

    let report = app_state.orchestrator.run_batch(submissions).await;
    WebResult::ok(report).into_response()
}

/// POST /api/validate
pub async fn validate(payload: Result<Json<ValidationRequest>, JsonRejection>) -> Response {
    let request = match payload {
        Ok(Json(request)) => request,
        Err(JsonRejection::MissingJsonContentType(_)) => return bad_request("Request must be JSON"),
        Err(rejection) => {
            return error_response(&OmrError::InvalidRequest(rejection.body_text()));
        }
    };

    let (detected, key) = match request.into_maps() {
        Ok(maps) => maps,
        Err(err) => return error_response(&err),
    };

    let report = score(&detected, &key);
    tracing::info!(
        event = events::SCORE_COMPLETE,
        score = report.score,
        total = report.total,
        percentage = report.percentage,
        grade = %report.grade
    );
    WebResult::ok(report).into_response()
}

#[cfg(test)]
mod tests {
    use crate::api::routes;
    use crate::api::test_support::{body_json, get, json_request, multipart, state};
    use crate::model::normalize::tests::sample_image_bytes;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use base64::Engine;
    use image::ImageFormat;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    fn png() -> Vec<u8> {
        sample_image_bytes(ImageFormat::Png)
    }

    #[tokio::test]
    async fn process_upload_returns_answers_with_metadata() {
        let (app_state, _dir) = state(true);
        let resp = routes(app_state)
            .oneshot(multipart("/api/process", &[("file", "../Sheet 1.PNG", png())]))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["success"], json!(true));
        assert_eq!(body["data"]["answers"]["1"], json!("A"));
        assert_eq!(body["data"]["metadata"]["filename"], json!("Sheet_1.png"));
        assert_eq!(body["data"]["metadata"]["questions_detected"], json!(3));
        assert_eq!(body["data"]["metadata"]["processing_status"], json!("success"));
    }

    #[tokio::test]
    async fn process_base64_with_data_url() {
        let (app_state, _dir) = state(true);
        let encoded = base64::engine::general_purpose::STANDARD.encode(png());
        let resp = routes(app_state)
            .oneshot(json_request(
                "/api/process",
                &json!({ "image": format!("data:image/png;base64,{}", encoded) }),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["data"]["metadata"]["filename"], json!("temp_image.jpg"));
    }

    #[tokio::test]
    async fn process_rejects_bad_inputs() {
        let (app_state, _dir) = state(true);
        let app = routes(app_state);

        let resp = app
            .clone()
            .oneshot(multipart("/api/process", &[("file", "sheet.gif", png())]))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let body = body_json(resp).await;
        assert_eq!(body["errorCode"], json!(400));
        assert_eq!(
            body["data"]["allowed_types"],
            json!(["png", "jpg", "jpeg", "bmp", "tiff"])
        );

        let resp = app
            .clone()
            .oneshot(multipart("/api/process", &[("file", "", png())]))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(resp).await["errorMsg"], json!("No file selected"));

        let resp = app
            .clone()
            .oneshot(json_request("/api/process", &json!({ "image": "%%%" })))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let resp = app
            .clone()
            .oneshot(json_request("/api/process", &json!({ "picture": "x" })))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert!(body_json(resp).await["data"]["help"].is_string());
    }

    #[tokio::test]
    async fn process_recognition_failure_is_500() {
        let (app_state, _dir) = state(true);
        let resp = routes(app_state)
            .oneshot(multipart("/api/process", &[("file", "fail.png", png())]))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body_json(resp).await["success"], json!(false));
    }

    #[tokio::test]
    async fn degraded_service_is_503() {
        let (app_state, _dir) = state(false);
        let app = routes(app_state);
        let resp = app
            .clone()
            .oneshot(multipart("/api/process", &[("file", "sheet.png", png())]))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);

        let resp = app
            .oneshot(multipart("/api/batch", &[("files[]", "sheet.png", png())]))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn batch_reports_each_file_in_order() {
        let (app_state, _dir) = state(true);
        let resp = routes(app_state)
            .oneshot(multipart(
                "/api/batch",
                &[
                    ("files[]", "a.png", png()),
                    ("files[]", "b.txt", b"hello".to_vec()),
                    ("files", "c.png", b"broken".to_vec()),
                    ("files[]", "d.png", png()),
                ],
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let data = body_json(resp).await["data"].clone();
        assert_eq!(data["total"], json!(4));
        assert_eq!(data["processed"], json!(2));
        assert_eq!(data["failed"], json!(2));
        let statuses: Vec<&str> = data["results"]
            .as_array()
            .unwrap()
            .iter()
            .map(|r| r["status"].as_str().unwrap())
            .collect();
        assert_eq!(statuses, vec!["success", "error", "error", "success"]);
        assert_eq!(data["results"][1]["filename"], json!("b.txt"));
    }

    #[tokio::test]
    async fn batch_limits() {
        let (app_state, _dir) = state(true);
        let app = routes(app_state);

        let resp = app
            .clone()
            .oneshot(multipart("/api/batch", &[("other", "a.png", png())]))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let files: Vec<(&str, &str, Vec<u8>)> =
            (0..5).map(|_| ("files[]", "a.png", png())).collect();
        let resp = app.oneshot(multipart("/api/batch", &files)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn validate_scores_against_key() {
        let (app_state, _dir) = state(false);
        let resp = routes(app_state)
            .oneshot(json_request(
                "/api/validate",
                &json!({
                    "detected_answers": {"1": "A", "2": "C"},
                    "answer_key": {"1": "A", "2": "B", "3": "C"}
                }),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let data = body_json(resp).await["data"].clone();
        assert_eq!(data["score"], json!(1));
        assert_eq!(data["total"], json!(3));
        assert_eq!(data["percentage"], json!(33.33));
        assert_eq!(data["grade"], json!("F"));
        assert_eq!(data["comparison"][2]["question"], json!("3"));
        assert_eq!(data["comparison"][2]["detected"], Value::Null);
    }

    #[tokio::test]
    async fn validate_rejects_incomplete_requests() {
        let (app_state, _dir) = state(true);
        let app = routes(app_state);

        let resp = app
            .clone()
            .oneshot(json_request("/api/validate", &json!({ "answer_key": {"1": "A"} })))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let body = body_json(resp).await;
        assert_eq!(body["data"]["required"], json!(["detected_answers", "answer_key"]));

        let resp = app
            .clone()
            .oneshot(
                Request::post("/api/validate")
                    .body(Body::from("detected_answers=1"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(resp).await["errorMsg"], json!("Request must be JSON"));

        let resp = app.oneshot(get("/api/validate")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::METHOD_NOT_ALLOWED);
    }
}
