use crate::util::config::LoggingConfig;
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use tracing::level_filters::LevelFilter;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::daily;
use tracing_subscriber::fmt::layer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{filter::EnvFilter, Layer, Registry};

/// 按配置初始化日志：控制台 + 按天滚动的文件（可选 JSON 格式）
///
/// 返回的 guard 必须在进程生命周期内持有，否则文件日志会丢失尾部。
pub fn log_init_with_config(
    file_prefix: &str,
    config: &LoggingConfig,
) -> anyhow::Result<Option<WorkerGuard>> {
    let level_filter = parse_level(&config.level).unwrap_or(LevelFilter::INFO);
    let filter_expression = build_env_filter_expression(level_filter, &config.overrides);
    let new_filter = || {
        EnvFilter::try_new(filter_expression.as_str())
            .unwrap_or_else(|_| EnvFilter::new(level_filter_to_str(level_filter)))
    };

    let (file_writer, guard, log_dir) = if config.file.enabled {
        let log_dir = resolve_log_dir(&config.file.directory);
        std::fs::create_dir_all(&log_dir)?;
        let appender = daily(&log_dir, format!("{}.log", file_prefix));
        let (writer, guard) = tracing_appender::non_blocking(appender);
        (Some(writer), Some(guard), Some(log_dir))
    } else {
        (None, None, None)
    };

    if config.structured {
        let stdout_layer = layer()
            .json()
            .with_target(true)
            .with_writer(io::stdout)
            .with_filter(new_filter());
        let file_layer = file_writer.map(|writer| {
            layer()
                .json()
                .with_target(true)
                .with_ansi(false)
                .with_writer(writer)
                .with_filter(new_filter())
        });
        Registry::default()
            .with(stdout_layer)
            .with(file_layer)
            .try_init()?;
    } else {
        let stdout_layer = layer()
            .with_target(false)
            .with_writer(io::stdout)
            .with_filter(new_filter());
        let file_layer = file_writer.map(|writer| {
            layer()
                .with_target(true)
                .with_ansi(false)
                .with_writer(writer)
                .with_filter(new_filter())
        });
        Registry::default()
            .with(stdout_layer)
            .with(file_layer)
            .try_init()?;
    }

    match &log_dir {
        Some(dir) => tracing::info!(
            event = "log.init",
            level = %config.level,
            console = true,
            file = true,
            directory = %dir.display(),
            rotation = "daily",
            structured = config.structured
        ),
        None => tracing::info!(
            event = "log.init",
            level = %config.level,
            console = true,
            file = false,
            structured = config.structured
        ),
    }

    Ok(guard)
}

/// 相对路径基于工作目录；在 bin/ 下运行时落到上级目录
pub fn resolve_log_dir(directory: &str) -> PathBuf {
    let path = Path::new(directory);
    if path.is_absolute() {
        return path.to_path_buf();
    }
    let current_dir = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    if current_dir.file_name() == Some(std::ffi::OsStr::new("bin")) {
        if let Some(parent) = current_dir.parent() {
            return parent.join(path);
        }
    }
    current_dir.join(path)
}

pub fn cleanup_old_logs(log_dir: &Path, file_prefix: &str, retention_days: u32) -> anyhow::Result<usize> {
    if !log_dir.exists() {
        tracing::debug!("日志目录不存在: {}", log_dir.display());
        return Ok(0);
    }

    let retention = std::time::Duration::from_secs(u64::from(retention_days) * 24 * 60 * 60);
    let cutoff = std::time::SystemTime::now()
        .checked_sub(retention)
        .unwrap_or(std::time::UNIX_EPOCH);

    let mut deleted_count = 0;
    let mut error_count = 0;

    for entry in std::fs::read_dir(log_dir)? {
        let entry = entry?;
        let path = entry.path();

        // 只处理本服务的日志文件
        let file_name = path
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or("");
        if !file_name.starts_with(file_prefix) {
            continue;
        }

        let Ok(metadata) = entry.metadata() else {
            continue;
        };
        if !metadata.is_file() {
            continue;
        }
        let modified = metadata
            .modified()
            .or_else(|_| metadata.created())
            .unwrap_or_else(|_| std::time::SystemTime::now());

        if modified < cutoff {
            match std::fs::remove_file(&path) {
                Ok(()) => {
                    deleted_count += 1;
                    tracing::debug!("已删除过期日志: {}", path.display());
                }
                Err(e) => {
                    error_count += 1;
                    tracing::warn!("删除日志文件失败: {} - {}", path.display(), e);
                }
            }
        }
    }

    if deleted_count > 0 {
        tracing::info!(event = "log.cleanup", deleted = deleted_count, retention_days);
    }
    if error_count > 0 {
        tracing::warn!("有 {} 个文件清理失败", error_count);
    }

    Ok(deleted_count)
}

fn build_env_filter_expression(
    default_level: LevelFilter,
    overrides: &HashMap<String, String>,
) -> String {
    let mut directives = vec![level_filter_to_str(default_level).to_string()];

    let mut targets: Vec<_> = overrides.iter().collect();
    targets.sort();
    for (target, level_str) in targets {
        if let Some(level) = parse_level(level_str) {
            directives.push(format!(
                "{}={}",
                normalize_directive_target(target),
                level_filter_to_str(level)
            ));
        }
    }

    directives.join(",")
}

fn parse_level(level: &str) -> Option<LevelFilter> {
    match level.trim().to_lowercase().as_str() {
        "off" => Some(LevelFilter::OFF),
        "trace" => Some(LevelFilter::TRACE),
        "debug" => Some(LevelFilter::DEBUG),
        "info" => Some(LevelFilter::INFO),
        "warn" => Some(LevelFilter::WARN),
        "error" => Some(LevelFilter::ERROR),
        _ => None,
    }
}

fn level_filter_to_str(level: LevelFilter) -> &'static str {
    match level {
        LevelFilter::OFF => "off",
        LevelFilter::ERROR => "error",
        LevelFilter::WARN => "warn",
        LevelFilter::INFO => "info",
        LevelFilter::DEBUG => "debug",
        LevelFilter::TRACE => "trace",
    }
}

fn normalize_directive_target(target: &str) -> String {
    if let Some(raw) = target.strip_prefix("target:") {
        raw.to_string()
    } else if target.contains("::") {
        target.to_string()
    } else {
        format!("omr_server::{}", target.replace('.', "::"))
    }
}
