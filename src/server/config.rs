//! 配置管理模块
//! 负责配置文件的加载、验证和日志初始化

use crate::util::config::loader::ConfigLoader;
use crate::util::config::Config;
use crate::util::log::{cleanup_old_logs, log_init_with_config, resolve_log_dir};
use anyhow::Result;
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;

pub const CONFIG_FILE_NAME: &str = "config.yaml";
pub const LOG_FILE_PREFIX: &str = "omr-server";

/// 配置管理器
pub struct ConfigManager;

impl ConfigManager {
    /// 加载和验证配置
    pub fn load_and_validate() -> Result<(Config, ConfigValidationReport)> {
        let config_path = Self::find_config_file_path(CONFIG_FILE_NAME);
        let config = Self::load_from_path(&config_path)?;
        let validation_report = Self::validate_config(&config);
        Ok((config, validation_report))
    }

    /// 读取配置并应用环境变量覆盖，文件不存在时写出模板
    pub fn load_from_path(config_path: &Path) -> Result<Config> {
        match ConfigLoader::load_with_env_overrides(config_path) {
            Ok(config) => Ok(config),
            Err(e) => {
                warn!("[warn] 配置文件读取失败: {} - {}", config_path.display(), e);
                let config = Self::handle_config_load_failure(config_path)?;
                Ok(ConfigLoader::apply_env_overrides(config))
            }
        }
    }

    /// 初始化日志系统
    ///
    /// 返回的 guard 需要持有到进程退出；未启用文件日志时为 `None`。
    pub fn initialize_logging(config: &Config) -> Result<Option<WorkerGuard>> {
        let log_guard = log_init_with_config(LOG_FILE_PREFIX, &config.logging)?;

        if let Some(retention_days) = config.logging.file.retention_days {
            if config.logging.file.enabled {
                let log_path = resolve_log_dir(&config.logging.file.directory);
                if let Err(e) = cleanup_old_logs(&log_path, LOG_FILE_PREFIX, retention_days) {
                    warn!("日志清理失败: {}", e);
                }
            }
        }

        info!("[ok] 日志系统初始化完成");
        Ok(log_guard)
    }

    /// 智能查找配置文件路径，适应开发和生产环境
    pub fn find_config_file_path(filename: &str) -> PathBuf {
        let current_dir = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));

        // 情况1：当前目录下的 config/
        let config_in_current = current_dir.join("config").join(filename);
        if config_in_current.exists() {
            return config_in_current;
        }

        // 情况2：在 bin/ 目录运行时，上级目录的 config/
        if let Some(parent) = current_dir.parent() {
            let config_in_parent = parent.join("config").join(filename);
            if config_in_parent.exists() {
                return config_in_parent;
            }
        }

        // 情况3：当前目录
        let dev_path = current_dir.join(filename);
        if dev_path.exists() {
            return dev_path;
        }

        // 都不存在时，bin/ 下返回上级 config/，否则返回当前目录下的 config/
        if current_dir.file_name() == Some(std::ffi::OsStr::new("bin")) {
            if let Some(parent) = current_dir.parent() {
                return parent.join("config").join(filename);
            }
        }
        config_in_current
    }

    /// 处理配置加载失败
    fn handle_config_load_failure(config_path: &Path) -> Result<Config> {
        if !config_path.exists() {
            info!("[note] 创建默认配置文件: {}", config_path.display());
            let config = Config::default();
            if let Err(write_err) = config.write_yaml_to_path(config_path) {
                warn!("[fail] 创建默认配置文件失败: {}", write_err);
            }
            Ok(config)
        } else {
            warn!("[fail] 配置文件存在但无法解析，请检查语法");
            Err(anyhow::anyhow!(
                "配置文件解析失败: {}",
                config_path.display()
            ))
        }
    }

    /// 验证配置
    pub fn validate_config(config: &Config) -> ConfigValidationReport {
        let mut report = ConfigValidationReport::new();

        Self::validate_basic_settings(config, &mut report);
        Self::validate_model_settings(config, &mut report);
        Self::validate_limits(config, &mut report);

        report
    }

    /// 启动日志初始化后再输出验证结果
    pub fn log_report(report: &ConfigValidationReport) {
        if report.has_errors() {
            warn!("[warn] 配置验证发现错误: {}", report.error_count());
            for error in &report.errors {
                warn!("  - {}: {}", error.field, error.message);
            }
        }

        if report.has_warnings() {
            info!("配置验证发现警告: {}", report.warning_count());
            for warning in &report.warnings {
                info!("  - {}: {}", warning.field, warning.message);
            }
        }

        for item in &report.info {
            info!("  - {}: {}", item.field, item.message);
        }
    }

    fn validate_basic_settings(config: &Config, report: &mut ConfigValidationReport) {
        if config.get_port() == 0 {
            report.add_error("server.port", "端口不能为0");
        }

        if config.server.host.trim().is_empty() {
            report.add_error("server.host", "监听地址不能为空");
        }

        if config.cors.allowed_origins.is_empty() {
            report.add_warning("cors.allowed_origins", "未配置CORS来源，浏览器跨域请求将被拒绝");
        }
    }

    /// 模型或引擎缺失只会进入降级模式，不阻止启动
    fn validate_model_settings(config: &Config, report: &mut ConfigValidationReport) {
        if config.model.path.trim().is_empty() {
            report.add_error("model.path", "模型路径不能为空");
        } else if !Path::new(&config.model.path).exists() {
            report.add_warning(
                "model.path",
                &format!("模型文件不存在: {}，服务将以降级模式运行", config.model.path),
            );
        }

        let binary = config.engine.binary.trim();
        if binary.is_empty() {
            report.add_error("engine.binary", "识别引擎路径不能为空");
        } else if !binary.contains(std::path::is_separator) {
            report.add_info("engine.binary", "识别引擎将从 PATH 中查找");
        } else if !Path::new(binary).exists() {
            report.add_warning("engine.binary", &format!("识别引擎不存在: {}", binary));
        }

        if config.engine.response_timeout_secs == 0 {
            report.add_error("engine.response_timeout_secs", "引擎响应超时必须大于0");
        }

        report.add_info(
            "engine.pool_size",
            &format!("引擎池大小: {}", config.engine_pool_size()),
        );
    }

    fn validate_limits(config: &Config, report: &mut ConfigValidationReport) {
        if config.recognition.timeout_secs == 0 {
            report.add_error("recognition.timeout_secs", "识别超时必须大于0");
        } else if config.recognition.timeout_secs < config.engine.response_timeout_secs {
            report.add_warning(
                "recognition.timeout_secs",
                "识别超时小于引擎响应超时，超时将由网关先行判定",
            );
        }

        if config.upload.max_file_mb == 0 {
            report.add_error("upload.max_file_mb", "单文件大小上限必须大于0");
        }

        if config.upload.max_pixels == 0 {
            report.add_error("upload.max_pixels", "像素上限必须大于0");
        }

        if config.batch.max_items == 0 {
            report.add_error("batch.max_items", "批量数量上限必须大于0");
        }

        report.add_info(
            "batch.max_concurrency",
            &format!("批量并发: {}", config.batch.effective_concurrency()),
        );
    }
}

/// 配置验证报告
#[derive(Debug, Clone, Default)]
pub struct ConfigValidationReport {
    pub errors: Vec<ValidationIssue>,
    pub warnings: Vec<ValidationIssue>,
    pub info: Vec<ValidationIssue>,
}

/// 验证问题
#[derive(Debug, Clone)]
pub struct ValidationIssue {
    pub field: String,
    pub message: String,
}

impl ConfigValidationReport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_error(&mut self, field: &str, message: &str) {
        self.errors.push(ValidationIssue {
            field: field.to_string(),
            message: message.to_string(),
        });
    }

    pub fn add_warning(&mut self, field: &str, message: &str) {
        self.warnings.push(ValidationIssue {
            field: field.to_string(),
            message: message.to_string(),
        });
    }

    pub fn add_info(&mut self, field: &str, message: &str) {
        self.info.push(ValidationIssue {
            field: field.to_string(),
            message: message.to_string(),
        });
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn has_warnings(&self) -> bool {
        !self.warnings.is_empty()
    }

    pub fn error_count(&self) -> usize {
        self.errors.len()
    }

    pub fn warning_count(&self) -> usize {
        self.warnings.len()
    }
}
