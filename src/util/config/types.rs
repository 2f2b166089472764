//! 配置数据结构定义
//!
//! 所有段落都带 serde 默认值，配置文件只需写出需要修改的字段。

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

/// 主配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub model: ModelConfig,
    pub engine: EngineConfig,
    pub recognition: RecognitionConfig,
    pub upload: UploadConfig,
    pub batch: BatchConfig,
    pub cors: CorsConfig,
    pub logging: LoggingConfig,
}

/// 服务器配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 5000,
        }
    }
}

/// 识别模型配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// 模型权重路径，不存在时服务以降级模式运行
    pub path: String,
    /// 模型下载地址（fetch-model 使用）
    pub url: Option<String>,
    pub kind: String,
    pub input_size: String,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            path: "best.pt".to_string(),
            url: None,
            kind: "YOLOv8".to_string(),
            input_size: "640x640".to_string(),
        }
    }
}

/// 识别引擎子进程配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub binary: String,
    /// 启动参数模板，`{model}` 替换为模型路径
    pub args: Vec<String>,
    pub work_dir: Option<String>,
    pub lib_path: Option<String>,
    /// 0 表示按 CPU 自动选择
    pub pool_size: usize,
    pub response_timeout_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            binary: "omr/omr-engine".to_string(),
            args: vec!["--model".to_string(), "{model}".to_string()],
            work_dir: None,
            lib_path: None,
            pool_size: 0,
            response_timeout_secs: 30,
        }
    }
}

/// 单次识别调用的策略
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecognitionConfig {
    /// 单张识别超时，超时记为识别失败
    pub timeout_secs: u64,
}

impl Default for RecognitionConfig {
    fn default() -> Self {
        Self { timeout_secs: 60 }
    }
}

/// 上传与暂存配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadConfig {
    pub staging_dir: String,
    pub max_file_mb: u64,
    pub max_pixels: u64,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            staging_dir: "api_uploads".to_string(),
            max_file_mb: 10,
            max_pixels: 50_000_000,
        }
    }
}

impl UploadConfig {
    pub fn max_file_bytes(&self) -> usize {
        (self.max_file_mb as usize).saturating_mul(1024 * 1024)
    }

    pub fn staging_path(&self) -> PathBuf {
        PathBuf::from(&self.staging_dir)
    }
}

/// 批量识别配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    pub max_items: usize,
    /// 0 表示按 CPU 自动选择
    pub max_concurrency: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_items: 50,
            max_concurrency: 0,
        }
    }
}

impl BatchConfig {
    pub fn effective_concurrency(&self) -> usize {
        if self.max_concurrency == 0 {
            num_cpus::get().clamp(1, 16)
        } else {
            self.max_concurrency
        }
    }
}

/// 跨域配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CorsConfig {
    /// `*` 表示允许任意来源
    pub allowed_origins: Vec<String>,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            allowed_origins: vec!["*".to_string()],
        }
    }
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub file: LogFileConfig,
    /// 是否输出 JSON 结构化日志
    pub structured: bool,
    /// 按 target 单独设置级别，如 `api: debug`
    pub overrides: HashMap<String, String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: LogFileConfig::default(),
            structured: false,
            overrides: HashMap::new(),
        }
    }
}

/// 日志文件配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogFileConfig {
    pub enabled: bool,
    pub directory: String,
    pub retention_days: Option<u32>,
}

impl Default for LogFileConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            directory: "logs".to_string(),
            retention_days: Some(7),
        }
    }
}

impl Config {
    pub fn get_port(&self) -> u16 {
        self.server.port
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    pub fn engine_pool_size(&self) -> usize {
        if self.engine.pool_size == 0 {
            omr_conn::EnginePool::auto_capacity()
        } else {
            self.engine.pool_size
        }
    }

    /// 请求体上限：单文件上限 × 批量上限
    pub fn request_body_limit(&self) -> usize {
        self.upload
            .max_file_bytes()
            .saturating_mul(self.batch.max_items.max(1))
            .saturating_add(1024 * 1024)
    }
}
