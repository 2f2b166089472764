//! 答题卡识别引擎连接层
//!
//! 识别引擎本身（模型加载、涂点检测、版面解析）是外部黑盒，这里只负责：
//! - `Recognizer` 能力抽象：输入暂存图片路径，输出题号 → 选项映射
//! - `engine`：基于 stdin/stdout JSON 行协议的引擎子进程
//! - `pool`：有界引擎进程池，带熔断与自动重启

pub mod engine;
pub mod pool;

use serde_json::{Map, Value};
use std::path::Path;
use thiserror::Error;

pub use engine::{EngineOptions, EngineProcess};
pub use pool::{EnginePool, PoolStats};

/// 题号 → 识别出的选项
pub type AnswerMap = Map<String, Value>;

/// 外部识别能力（一次调用对应一张答题卡）
///
/// 调用是同步且可能很慢的，调用方负责放到阻塞线程里执行。
pub trait Recognizer: Send + Sync {
    fn recognize(&self, image_path: &Path) -> Result<Recognition, RecognizeError>;

    /// 可同时进行的识别调用数，`None` 表示不限
    fn capacity(&self) -> Option<usize> {
        None
    }
}

/// 引擎返回的原始识别结果
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Recognition {
    pub answers: AnswerMap,
    /// 引擎附带的其他字段（版面信息、置信度等），原样透传
    pub extras: Map<String, Value>,
}

impl Recognition {
    /// 从 `{"answers": {...}, ...}` 结构拆出答案与附加字段
    pub fn from_payload(payload: Value) -> Result<Self, RecognizeError> {
        let Value::Object(mut extras) = payload else {
            return Err(RecognizeError::Protocol(
                "recognition payload is not an object".to_string(),
            ));
        };
        let answers = match extras.remove("answers") {
            Some(Value::Object(answers)) => answers,
            Some(Value::Null) | None => AnswerMap::new(),
            Some(other) => {
                return Err(RecognizeError::Protocol(format!(
                    "answers must be an object, got {}",
                    other
                )))
            }
        };
        Ok(Self { answers, extras })
    }
}

#[derive(Debug, Error)]
pub enum RecognizeError {
    #[error("failed to spawn recognition engine: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("engine io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("engine did not answer within {0}s")]
    Timeout(u64),

    /// 图片本身的问题，引擎仍然健康
    #[error("image rejected by engine ({code}): {message}")]
    Rejected { code: u32, message: String },

    /// 引擎内部错误，需要重启进程
    #[error("engine error ({code}): {message}")]
    Engine { code: u32, message: String },

    #[error("malformed engine reply: {0}")]
    Protocol(String),

    #[error("engine pool circuit open, retry after {0}s")]
    CircuitOpen(u64),
}

impl RecognizeError {
    /// 是否说明引擎进程本身出了问题（需要计入熔断并重启）
    pub fn is_engine_fault(&self) -> bool {
        !matches!(self, RecognizeError::Rejected { .. } | RecognizeError::CircuitOpen(_))
    }
}
