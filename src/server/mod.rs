//! 服务器模块
//!
//! 负责服务启动的各个阶段：
//! - 配置管理 (config.rs)
//! - HTTP服务器设置 (http.rs)
//!
//! 使用示例：
//! ```rust,ignore
//! use omr_server::server::ServerBootstrap;
//!
//! let server = ServerBootstrap::new()?;
//! server.start().await?;
//! ```

pub mod config;
pub mod http;

pub use config::{ConfigManager, ConfigValidationReport};
pub use http::{HttpServer, ServerManager};

use crate::build_info;
use crate::util::config::Config;
use crate::util::logging::standards::events;
use crate::AppState;
use anyhow::{anyhow, Result};
use omr_conn::{EngineOptions, EnginePool};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;

/// 服务器引导程序 - 统一的服务器启动入口
pub struct ServerBootstrap {
    config: Config,
    validation_report: ConfigValidationReport,
    _log_guard: Option<WorkerGuard>,
}

impl ServerBootstrap {
    /// 加载配置、初始化日志并检查配置
    pub fn new() -> Result<Self> {
        let (config, validation_report) = ConfigManager::load_and_validate()?;
        let log_guard = ConfigManager::initialize_logging(&config)?;

        info!("[launch] 开始服务器引导程序...");
        ConfigManager::log_report(&validation_report);

        if validation_report.has_errors() {
            return Err(anyhow!(
                "配置验证失败，发现 {} 个错误",
                validation_report.error_count()
            ));
        }

        Ok(Self {
            config,
            validation_report,
            _log_guard: log_guard,
        })
    }

    /// 启动服务器，阻塞直到收到关闭信号
    pub async fn start(self) -> Result<()> {
        info!(
            event = "server.start",
            version = %build_info::summary(),
            warnings = self.validation_report.warning_count()
        );

        let engine_pool = load_recognizer(&self.config).await;
        let app_state = match engine_pool {
            Some(pool) => AppState::with_engine_pool(self.config.clone(), pool),
            None => AppState::new(self.config.clone(), None),
        };

        if app_state.is_degraded() {
            warn!("[warn] 识别模型未加载，服务以降级模式运行: /api/process 与 /api/batch 将返回 503");
        }

        let server = ServerManager::create_server(&self.config, app_state).await?;
        info!(
            "[start] OMR服务已启动: http://{}",
            server.local_addr()
        );
        ServerManager::start_server(server).await
    }

    pub fn config(&self) -> &Config {
        &self.config
    }
}

/// 启动识别引擎池，失败时返回 `None` 进入降级模式
pub async fn load_recognizer(config: &Config) -> Option<Arc<EnginePool>> {
    let model_path = PathBuf::from(&config.model.path);
    if !model_path.exists() {
        warn!(
            event = events::MODEL_MISSING,
            model_path = %model_path.display(),
            "模型文件不存在，请先运行 fetch-model 下载模型"
        );
        return None;
    }

    let options = engine_options(config);
    let capacity = config.engine_pool_size();
    let started = tokio::task::spawn_blocking(move || EnginePool::start(options, capacity)).await;

    match started {
        Ok(Ok(pool)) => {
            info!(
                event = events::MODEL_LOADED,
                model_path = %model_path.display(),
                model_type = %config.model.kind,
                pool_capacity = pool.capacity()
            );
            Some(Arc::new(pool))
        }
        Ok(Err(e)) => {
            error!(
                event = events::MODEL_LOAD_FAILED,
                model_path = %model_path.display(),
                error = %e
            );
            None
        }
        Err(join_err) => {
            error!(
                event = events::MODEL_LOAD_FAILED,
                model_path = %model_path.display(),
                error = %join_err
            );
            None
        }
    }
}

/// 由配置生成引擎启动参数
pub fn engine_options(config: &Config) -> EngineOptions {
    let engine = &config.engine;
    EngineOptions {
        binary: PathBuf::from(&engine.binary),
        args: engine.args.clone(),
        model_path: PathBuf::from(&config.model.path),
        work_dir: engine.work_dir.as_ref().map(PathBuf::from),
        lib_path: engine.lib_path.as_ref().map(PathBuf::from),
        response_timeout_secs: engine.response_timeout_secs,
    }
}

/// 启动服务器（主入口）
pub async fn start_server() -> Result<()> {
    let bootstrap = ServerBootstrap::new()?;
    bootstrap.start().await
}

/// 离线就绪检查结果
#[derive(Debug, Serialize)]
pub struct ReadinessReport {
    pub config_path: String,
    pub config_errors: usize,
    pub config_warnings: usize,
    pub model_path: String,
    pub model_present: bool,
    pub engine_binary: String,
    pub engine_present: bool,
}

impl ReadinessReport {
    /// 模型缺失仍可降级运行，只有配置错误视为不可启动
    pub fn can_start(&self) -> bool {
        self.config_errors == 0
    }

    pub fn can_recognize(&self) -> bool {
        self.can_start() && self.model_present && self.engine_present
    }
}

/// 不启动服务，仅检查配置、模型与引擎是否就绪
pub fn check_readiness() -> Result<ReadinessReport> {
    let config_path = ConfigManager::find_config_file_path(config::CONFIG_FILE_NAME);
    let config = ConfigManager::load_from_path(&config_path)?;
    Ok(readiness_for(&config, &config_path))
}

fn readiness_for(config: &Config, config_path: &Path) -> ReadinessReport {
    let report = ConfigManager::validate_config(config);
    let binary = config.engine.binary.trim();
    // 不含路径分隔符的引擎名交给 PATH 查找，这里无法确认
    let engine_present =
        !binary.contains(std::path::is_separator) || Path::new(binary).exists();

    ReadinessReport {
        config_path: config_path.display().to_string(),
        config_errors: report.error_count(),
        config_warnings: report.warning_count(),
        model_path: config.model.path.clone(),
        model_present: Path::new(&config.model.path).exists(),
        engine_binary: config.engine.binary.clone(),
        engine_present,
    }
}
