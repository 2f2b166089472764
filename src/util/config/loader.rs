//! 配置加载和管理模块
//! 处理配置文件的读取、写入和环境变量覆盖

use super::types::*;
use anyhow::{Context, Result};
use std::fs;
use std::path::Path;

/// 配置加载器
pub struct ConfigLoader;

impl ConfigLoader {
    /// 从YAML文件读取配置
    pub fn read_yaml(path: impl AsRef<Path>) -> Result<Config> {
        let path = path.as_ref();
        let config_str = fs::read_to_string(path)
            .with_context(|| format!("读取配置文件失败: {}", path.display()))?;
        let config = serde_yaml::from_str(&config_str)
            .with_context(|| format!("解析配置文件失败: {}", path.display()))?;
        Ok(config)
    }

    /// 读取配置文件并应用环境变量覆盖
    pub fn load_with_env_overrides(path: impl AsRef<Path>) -> Result<Config> {
        let config = Self::read_yaml(path)?;
        Ok(Self::apply_env_overrides(config))
    }

    /// 从环境变量读取配置覆盖
    pub fn apply_env_overrides(config: Config) -> Config {
        Self::apply_overrides_from(config, |key| std::env::var(key).ok())
    }

    /// 覆盖逻辑与环境变量来源解耦，便于测试
    pub fn apply_overrides_from<F>(mut config: Config, lookup: F) -> Config
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = lookup("OMR_HOST") {
            tracing::info!("[ok] 环境变量覆盖服务器地址: {}", host);
            config.server.host = host;
        }

        // PORT 兼容云平台约定，OMR_PORT 优先
        for key in ["PORT", "OMR_PORT"] {
            if let Some(port_str) = lookup(key) {
                match port_str.trim().parse::<u16>() {
                    Ok(port) => {
                        config.server.port = port;
                        tracing::info!("[ok] 环境变量 {} 覆盖服务器端口: {}", key, port);
                    }
                    Err(_) => tracing::warn!("[warn] {} 无法解析为端口: {}", key, port_str),
                }
            }
        }

        if let Some(model_path) = lookup("MODEL_PATH") {
            tracing::info!("[ok] 环境变量覆盖模型路径: {}", model_path);
            config.model.path = model_path;
        }

        if let Some(model_url) = lookup("MODEL_URL") {
            let trimmed = model_url.trim();
            config.model.url = if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_string())
            };
        }

        if let Some(binary) = lookup("OMR_ENGINE_BINARY") {
            tracing::info!("[ok] 环境变量覆盖识别引擎: {}", binary);
            config.engine.binary = binary;
        }

        if let Some(level) = lookup("OMR_LOG_LEVEL") {
            config.logging.level = level;
        }

        if let Some(origins) = lookup("CORS_ALLOWED_ORIGINS") {
            let parsed: Vec<String> = origins
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
            if !parsed.is_empty() {
                tracing::info!("[ok] 环境变量覆盖CORS来源: {}", parsed.join(","));
                config.cors.allowed_origins = parsed;
            }
        }

        config
    }
}

/// 配置写入器
pub struct ConfigWriter;

impl ConfigWriter {
    /// 生成带默认值的配置模板
    pub fn generate_template() -> Config {
        Config::default()
    }

    /// 写入YAML，自动创建上级目录
    pub fn write_yaml_with_dir(config: &Config, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let yaml = serde_yaml::to_string(config)?;
        fs::write(path, yaml)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn env_overrides_apply() {
        let config = ConfigLoader::apply_overrides_from(
            Config::default(),
            lookup(&[
                ("PORT", "7000"),
                ("MODEL_PATH", "/models/omr.pt"),
                ("CORS_ALLOWED_ORIGINS", "https://a.example, https://b.example"),
            ]),
        );
        assert_eq!(config.server.port, 7000);
        assert_eq!(config.model.path, "/models/omr.pt");
        assert_eq!(config.cors.allowed_origins.len(), 2);
    }

    #[test]
    fn omr_port_wins_over_port() {
        let config = ConfigLoader::apply_overrides_from(
            Config::default(),
            lookup(&[("PORT", "7000"), ("OMR_PORT", "7100")]),
        );
        assert_eq!(config.server.port, 7100);
    }

    #[test]
    fn invalid_port_is_ignored() {
        let config =
            ConfigLoader::apply_overrides_from(Config::default(), lookup(&[("PORT", "http")]));
        assert_eq!(config.server.port, 5000);
    }

    #[test]
    fn template_round_trips_through_yaml() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config").join("config.yaml");
        ConfigWriter::write_yaml_with_dir(&ConfigWriter::generate_template(), &path).unwrap();
        let loaded = ConfigLoader::read_yaml(&path).unwrap();
        assert_eq!(loaded.server.port, 5000);
        assert_eq!(loaded.engine.args, vec!["--model", "{model}"]);
    }
}
