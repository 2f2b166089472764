//! 识别网关：暂存图片 → 调用外部识别能力 → 附加元数据
//!
//! 识别调用是同步阻塞的，放在 `spawn_blocking` 中执行。暂存守卫随闭包一起移动，
//! 无论识别成功、返回错误、panic 还是被超时放弃，暂存文件都会在闭包结束时删除。
//!
//! 识别器声明了容量时，调用先在网关排队取得名额，超时只从取得名额后开始计算。

use crate::model::error::OmrError;
use crate::model::normalize::{normalize, CanonicalImage, NormalizeLimits};
use crate::model::staging::Staging;
use crate::model::submission::Submission;
use crate::util::logging::standards::events;
use omr_conn::{AnswerMap, Recognition, Recognizer};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::any::Any;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;

pub const PROCESSING_SUCCESS: &str = "success";

/// 网关自行写入的字段，引擎返回同名字段时丢弃
const RESERVED_KEYS: [&str; 3] = ["metadata", "filename", "status"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecognitionMetadata {
    pub filename: String,
    pub questions_detected: usize,
    pub processing_status: String,
}

/// 单张识别成功的结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recognized {
    pub answers: AnswerMap,
    #[serde(flatten)]
    pub extras: Map<String, Value>,
    pub metadata: RecognitionMetadata,
}

impl Recognized {
    fn from_recognition(raw: Recognition, filename: String) -> Result<Self, OmrError> {
        let Recognition { answers, mut extras } = raw;
        // 引擎以 `{"error": ...}` 报告的失败
        if let Some(error) = extras.get("error").filter(|v| !v.is_null()) {
            let message = match error {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            return Err(OmrError::Recognition(message));
        }
        for key in RESERVED_KEYS {
            extras.remove(key);
        }
        let metadata = RecognitionMetadata {
            filename,
            questions_detected: answers.len(),
            processing_status: PROCESSING_SUCCESS.to_string(),
        };
        Ok(Self {
            answers,
            extras,
            metadata,
        })
    }
}

/// `Ok` 为识别结果，`Err` 为不可用或识别失败
pub type RecognitionOutcome = Result<Recognized, OmrError>;

#[derive(Clone)]
pub struct RecognitionGateway {
    recognizer: Option<Arc<dyn Recognizer>>,
    /// 与识别器容量一致的名额，被超时放弃的调用结束前不归还
    slots: Option<Arc<Semaphore>>,
    staging: Staging,
    timeout: Duration,
    limits: NormalizeLimits,
}

impl RecognitionGateway {
    /// `recognizer` 为 `None` 表示模型未加载，整个进程生命周期内保持降级
    pub fn new(recognizer: Option<Arc<dyn Recognizer>>, staging: Staging, timeout: Duration) -> Self {
        let slots = recognizer
            .as_ref()
            .and_then(|r| r.capacity())
            .map(|capacity| Arc::new(Semaphore::new(capacity.max(1))));
        Self {
            recognizer,
            slots,
            staging,
            timeout,
            limits: NormalizeLimits::default(),
        }
    }

    pub fn with_limits(mut self, limits: NormalizeLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn is_available(&self) -> bool {
        self.recognizer.is_some()
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// 归一化 + 识别；解码在阻塞线程上完成
    pub async fn recognize_submission(&self, submission: Submission) -> RecognitionOutcome {
        if !self.is_available() {
            tracing::warn!(event = events::RECOGNIZER_UNAVAILABLE, "模型未加载，拒绝识别请求");
            return Err(OmrError::Unavailable);
        }
        let limits = self.limits;
        let image = tokio::task::spawn_blocking(move || normalize(&submission, &limits))
            .await
            .map_err(|e| OmrError::InvalidEncoding(format!("image decoder fault: {}", e)))??;
        self.recognize(image).await
    }

    pub async fn recognize(&self, image: CanonicalImage) -> RecognitionOutcome {
        let Some(recognizer) = self.recognizer.clone() else {
            tracing::warn!(event = events::RECOGNIZER_UNAVAILABLE, "模型未加载，拒绝识别请求");
            return Err(OmrError::Unavailable);
        };

        let filename = image.staging_name().to_string();
        let staging = self.staging.clone();
        let queued = Instant::now();

        let permit = match &self.slots {
            Some(slots) => match slots.clone().acquire_owned().await {
                Ok(permit) => Some(permit),
                Err(_) => return Err(OmrError::Unavailable),
            },
            None => None,
        };

        let started = Instant::now();
        tracing::debug!(
            event = events::RECOGNITION_START,
            filename = %filename,
            width = image.width(),
            height = image.height(),
            queued_ms = started.duration_since(queued).as_millis() as u64
        );

        let task = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            let staged = staging
                .stage(&image)
                .map_err(|e| OmrError::Recognition(format!("staging failed: {}", e)))?;
            drop(image);
            let outcome = recognizer.recognize(staged.path());
            drop(staged);
            outcome.map_err(|e| OmrError::Recognition(e.to_string()))
        });

        let raw = match tokio::time::timeout(self.timeout, task).await {
            Ok(Ok(Ok(raw))) => raw,
            Ok(Ok(Err(err))) => {
                tracing::warn!(
                    event = events::RECOGNITION_ERROR,
                    filename = %filename,
                    error = %err,
                    elapsed_ms = started.elapsed().as_millis() as u64
                );
                return Err(err);
            }
            Ok(Err(join_error)) => {
                let message = if join_error.is_panic() {
                    panic_message(join_error.into_panic().as_ref())
                } else {
                    join_error.to_string()
                };
                tracing::error!(
                    event = events::RECOGNITION_ERROR,
                    filename = %filename,
                    panic = %message,
                    "识别任务异常退出"
                );
                return Err(OmrError::Recognition(format!("recognizer fault: {}", message)));
            }
            Err(_) => {
                tracing::warn!(
                    event = events::RECOGNITION_TIMEOUT,
                    filename = %filename,
                    timeout_ms = self.timeout.as_millis() as u64
                );
                return Err(OmrError::Recognition(format!(
                    "recognition timed out after {}ms",
                    self.timeout.as_millis()
                )));
            }
        };

        let recognized = Recognized::from_recognition(raw, filename)?;
        tracing::info!(
            event = events::RECOGNITION_COMPLETE,
            filename = %recognized.metadata.filename,
            questions_detected = recognized.metadata.questions_detected,
            elapsed_ms = started.elapsed().as_millis() as u64
        );
        Ok(recognized)
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::model::normalize::tests::sample_upload;
    use crate::model::normalize::{normalize, NormalizeLimits};
    use omr_conn::RecognizeError;
    use serde_json::json;
    use std::path::{Path, PathBuf};
    use std::sync::Mutex;

    /// 测试用识别器：按文件名决定行为，并记录看到的暂存路径
    #[derive(Default)]
    pub(crate) struct ScriptedRecognizer {
        pub(crate) seen: Mutex<Vec<(PathBuf, bool)>>,
    }

    impl Recognizer for ScriptedRecognizer {
        fn recognize(&self, image_path: &Path) -> Result<Recognition, RecognizeError> {
            self.seen
                .lock()
                .unwrap()
                .push((image_path.to_path_buf(), image_path.exists()));
            let name = image_path
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or_default();
            if name.starts_with("panic") {
                panic!("scripted panic for {}", name);
            }
            if name.starts_with("slow") {
                std::thread::sleep(Duration::from_millis(300));
            }
            if name.starts_with("fail") {
                return Err(RecognizeError::Engine {
                    code: 400,
                    message: "engine crashed".to_string(),
                });
            }
            if name.starts_with("soft") {
                return Recognition::from_payload(json!({"error": "no sheet found"}));
            }
            Recognition::from_payload(json!({
                "answers": {"1": "A", "2": "B", "3": null},
                "sheet_layout": "3x4",
                "status": "engine-internal"
            }))
        }
    }

    /// 只有一个引擎的识别器：调用逐个执行，每次耗时固定
    pub(crate) struct SerialRecognizer {
        engine: Mutex<()>,
        per_call: Duration,
    }

    impl SerialRecognizer {
        pub(crate) fn new(per_call: Duration) -> Self {
            Self {
                engine: Mutex::new(()),
                per_call,
            }
        }
    }

    impl Recognizer for SerialRecognizer {
        fn recognize(&self, _image_path: &Path) -> Result<Recognition, RecognizeError> {
            let _engine = self.engine.lock().unwrap();
            std::thread::sleep(self.per_call);
            Recognition::from_payload(json!({"answers": {"1": "A"}}))
        }

        fn capacity(&self) -> Option<usize> {
            Some(1)
        }
    }

    pub(crate) fn gateway_with(
        recognizer: Option<Arc<dyn Recognizer>>,
        root: &Path,
        timeout: Duration,
    ) -> RecognitionGateway {
        RecognitionGateway::new(recognizer, Staging::new(root), timeout)
    }

    fn image(name: &str) -> CanonicalImage {
        normalize(&sample_upload(name), &NormalizeLimits::default()).unwrap()
    }

    fn staging_is_empty(root: &Path) -> bool {
        !root.exists() || std::fs::read_dir(root).unwrap().count() == 0
    }

    #[tokio::test]
    async fn success_adds_metadata_and_cleans_up() {
        let root = tempfile::tempdir().unwrap();
        let recognizer = Arc::new(ScriptedRecognizer::default());
        let gateway = gateway_with(Some(recognizer.clone()), root.path(), Duration::from_secs(5));

        let result = gateway.recognize(image("sheet.png")).await.unwrap();
        assert_eq!(result.metadata.filename, "sheet.png");
        assert_eq!(result.metadata.questions_detected, 3);
        assert_eq!(result.metadata.processing_status, "success");
        assert_eq!(result.extras["sheet_layout"], json!("3x4"));
        assert!(!result.extras.contains_key("status"));

        let seen = recognizer.seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert!(seen[0].1, "staged file must exist during recognition");
        assert!(!seen[0].0.exists());
        assert!(staging_is_empty(root.path()));
    }

    #[tokio::test]
    async fn serialized_shape_is_flat() {
        let root = tempfile::tempdir().unwrap();
        let gateway = gateway_with(
            Some(Arc::new(ScriptedRecognizer::default())),
            root.path(),
            Duration::from_secs(5),
        );
        let value = serde_json::to_value(gateway.recognize(image("a.jpg")).await.unwrap()).unwrap();
        assert_eq!(value["answers"]["1"], json!("A"));
        assert_eq!(value["answers"]["3"], Value::Null);
        assert_eq!(value["sheet_layout"], json!("3x4"));
        assert_eq!(value["metadata"]["questions_detected"], json!(3));
    }

    #[tokio::test]
    async fn unavailable_never_stages() {
        let root = tempfile::tempdir().unwrap();
        let gateway = gateway_with(None, root.path(), Duration::from_secs(5));
        assert!(!gateway.is_available());
        assert_eq!(
            gateway.recognize(image("sheet.png")).await,
            Err(OmrError::Unavailable)
        );
        assert!(staging_is_empty(root.path()));
    }

    #[tokio::test]
    async fn engine_error_still_cleans_up() {
        let root = tempfile::tempdir().unwrap();
        let gateway = gateway_with(
            Some(Arc::new(ScriptedRecognizer::default())),
            root.path(),
            Duration::from_secs(5),
        );
        let err = gateway.recognize(image("fail.png")).await.unwrap_err();
        assert!(matches!(err, OmrError::Recognition(ref m) if m.contains("engine crashed")));
        assert!(staging_is_empty(root.path()));

        let err = gateway.recognize(image("soft.png")).await.unwrap_err();
        assert_eq!(err, OmrError::Recognition("no sheet found".to_string()));
        assert!(staging_is_empty(root.path()));
    }

    #[tokio::test]
    async fn panic_becomes_recognition_error() {
        let root = tempfile::tempdir().unwrap();
        let gateway = gateway_with(
            Some(Arc::new(ScriptedRecognizer::default())),
            root.path(),
            Duration::from_secs(5),
        );
        let err = gateway.recognize(image("panic.png")).await.unwrap_err();
        assert!(matches!(err, OmrError::Recognition(ref m) if m.contains("scripted panic")));
        assert!(staging_is_empty(root.path()));
    }

    #[tokio::test]
    async fn timeout_is_recognition_error() {
        let root = tempfile::tempdir().unwrap();
        let gateway = gateway_with(
            Some(Arc::new(ScriptedRecognizer::default())),
            root.path(),
            Duration::from_millis(50),
        );
        let err = gateway.recognize(image("slow.png")).await.unwrap_err();
        assert!(matches!(err, OmrError::Recognition(ref m) if m.contains("timed out")));

        // 被放弃的调用结束后仍会清理暂存
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert!(staging_is_empty(root.path()));
    }

    #[tokio::test]
    async fn waiting_for_the_engine_does_not_count_toward_timeout() {
        let root = tempfile::tempdir().unwrap();
        let gateway = gateway_with(
            Some(Arc::new(SerialRecognizer::new(Duration::from_millis(150)))),
            root.path(),
            Duration::from_millis(400),
        );

        let calls = (0..4).map(|i| gateway.recognize(image(&format!("q{}.png", i))));
        let outcomes = futures::future::join_all(calls).await;
        for outcome in outcomes {
            assert_eq!(outcome.unwrap().metadata.questions_detected, 1);
        }
        assert!(staging_is_empty(root.path()));
    }

    #[tokio::test]
    async fn submission_is_normalized_before_recognition() {
        let root = tempfile::tempdir().unwrap();
        let recognizer = Arc::new(ScriptedRecognizer::default());
        let gateway = gateway_with(Some(recognizer.clone()), root.path(), Duration::from_secs(5));

        let ok = gateway.recognize_submission(sample_upload("Sheet 7.PNG")).await.unwrap();
        assert_eq!(ok.metadata.filename, "Sheet_7.png");

        let bad = crate::model::submission::Submission::upload("x.png", b"garbage".to_vec());
        assert!(matches!(
            gateway.recognize_submission(bad).await,
            Err(OmrError::InvalidEncoding(_))
        ));
        assert_eq!(recognizer.seen.lock().unwrap().len(), 1);
    }
}
