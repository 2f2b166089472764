use std::sync::Arc;
use std::time::{Duration, Instant};

use omr_conn::{EnginePool, Recognizer};

pub mod api;
pub mod build_info;
pub mod model;
pub mod server;
pub mod util;

use model::{BatchOrchestrator, NormalizeLimits, RecognitionGateway, Staging};
use util::config::Config;

/// 应用状态结构
///
/// 识别能力在启动时确定，之后只读；`None` 表示降级模式。
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub gateway: RecognitionGateway,
    pub orchestrator: BatchOrchestrator,
    /// 引擎池（仅用于 model-info 展示统计）
    pub engine_pool: Option<Arc<EnginePool>>,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(config: Config, recognizer: Option<Arc<dyn Recognizer>>) -> Self {
        let staging = Staging::new(config.upload.staging_path());
        let gateway = RecognitionGateway::new(
            recognizer,
            staging,
            Duration::from_secs(config.recognition.timeout_secs),
        )
        .with_limits(NormalizeLimits::from(&config.upload));
        let orchestrator =
            BatchOrchestrator::new(gateway.clone(), config.batch.effective_concurrency());
        Self {
            config: Arc::new(config),
            gateway,
            orchestrator,
            engine_pool: None,
            started_at: Instant::now(),
        }
    }

    /// 以引擎池作为识别能力
    pub fn with_engine_pool(config: Config, pool: Arc<EnginePool>) -> Self {
        let recognizer: Arc<dyn Recognizer> = pool.clone();
        let mut state = Self::new(config, Some(recognizer));
        state.engine_pool = Some(pool);
        state
    }

    pub fn is_degraded(&self) -> bool {
        !self.gateway.is_available()
    }
}

/// 智能查找配置文件路径，适应开发和生产环境
pub fn find_config_file_path(filename: &str) -> std::path::PathBuf {
    server::config::ConfigManager::find_config_file_path(filename)
}
