//! 部署前下载识别模型权重
//!
//! 目标路径取 `MODEL_PATH`（或配置 `model.path`），下载地址取 `MODEL_URL`（或配置 `model.url`）。

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use tokio::io::AsyncWriteExt;
use tracing::{error, info, warn};

use omr_server::server::config::{ConfigManager, CONFIG_FILE_NAME};
use omr_server::util::logging::standards::events;

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;
/// 无 Content-Length 时每下载这么多字节记录一次进度
const PROGRESS_STEP_BYTES: u64 = 16 * 1024 * 1024;

#[tokio::main]
async fn main() -> ExitCode {
    let config_path = ConfigManager::find_config_file_path(CONFIG_FILE_NAME);
    let config = match ConfigManager::load_from_path(&config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("加载配置文件失败: {:#}", e);
            return ExitCode::FAILURE;
        }
    };

    let _guard = match ConfigManager::initialize_logging(&config) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("初始化日志系统失败: {:#}", e);
            return ExitCode::FAILURE;
        }
    };

    let destination = PathBuf::from(&config.model.path);
    if let Ok(meta) = std::fs::metadata(&destination) {
        let size_mb = meta.len() as f64 / BYTES_PER_MB;
        println!("模型已存在: {} ({:.2} MB)", destination.display(), size_mb);
        return ExitCode::SUCCESS;
    }

    let Some(url) = config.model.url.as_deref().map(str::trim).filter(|u| !u.is_empty()) else {
        warn!(
            event = events::MODEL_MISSING,
            model_path = %destination.display(),
            "未配置模型下载地址"
        );
        println!("[warn] 未设置 MODEL_URL，无法下载模型");
        println!("请任选其一：");
        println!("1. 将模型文件放到 {}", destination.display());
        println!("2. 设置环境变量 MODEL_URL 指向模型下载地址");
        println!("3. 在配置文件中填写 model.url: {}", config_path.display());
        println!("未加载模型时服务仍可启动，但识别接口会返回 503");
        return ExitCode::FAILURE;
    };

    match download(url, &destination).await {
        Ok(bytes) => {
            println!(
                "[ok] 模型下载完成: {} ({:.2} MB)",
                destination.display(),
                bytes as f64 / BYTES_PER_MB
            );
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(
                event = events::MODEL_DOWNLOAD_FAILED,
                url = %url,
                error = %format!("{:#}", e)
            );
            eprintln!("[fail] 模型下载失败: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

/// 先写入 `.part` 临时文件，完成后再改名，失败时删除残留
async fn download(url: &str, destination: &Path) -> Result<u64> {
    if let Some(parent) = destination.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("创建目录失败: {}", parent.display()))?;
    }

    let partial = partial_path(destination);
    let result = stream_to(url, &partial).await;
    match result {
        Ok(bytes) => {
            tokio::fs::rename(&partial, destination)
                .await
                .with_context(|| format!("重命名失败: {}", destination.display()))?;
            Ok(bytes)
        }
        Err(e) => {
            if let Err(rm_err) = tokio::fs::remove_file(&partial).await {
                if rm_err.kind() != std::io::ErrorKind::NotFound {
                    warn!("清理未完成的下载文件失败: {} - {}", partial.display(), rm_err);
                }
            }
            Err(e)
        }
    }
}

async fn stream_to(url: &str, partial: &Path) -> Result<u64> {
    let client = reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(30))
        .build()
        .context("创建HTTP客户端失败")?;

    let mut response = client
        .get(url)
        .send()
        .await
        .with_context(|| format!("请求失败: {}", url))?;
    if !response.status().is_success() {
        bail!("下载地址返回状态码 {}", response.status());
    }

    let total = response.content_length();
    info!(
        event = events::MODEL_DOWNLOAD_START,
        url = %url,
        destination = %partial.display(),
        total_bytes = ?total
    );

    let mut file = tokio::fs::File::create(partial)
        .await
        .with_context(|| format!("创建文件失败: {}", partial.display()))?;
    let started = Instant::now();
    let mut downloaded: u64 = 0;
    let mut progress = Progress::new(total);

    while let Some(chunk) = response.chunk().await.context("读取响应数据失败")? {
        file.write_all(&chunk).await.context("写入模型文件失败")?;
        downloaded += chunk.len() as u64;
        if let Some(percent) = progress.advance(downloaded) {
            info!(
                event = events::MODEL_DOWNLOAD_PROGRESS,
                downloaded_bytes = downloaded,
                percent = ?percent
            );
        }
    }
    file.flush().await.context("写入模型文件失败")?;

    if let Some(expected) = total {
        if downloaded != expected {
            bail!("下载不完整: 期望 {} 字节，实际 {} 字节", expected, downloaded);
        }
    }

    info!(
        event = events::MODEL_DOWNLOAD_COMPLETE,
        downloaded_bytes = downloaded,
        elapsed_ms = started.elapsed().as_millis() as u64
    );
    Ok(downloaded)
}

fn partial_path(destination: &Path) -> PathBuf {
    let mut name = destination
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".part");
    destination.with_file_name(name)
}

/// 进度节流：已知总大小时按 10% 步进，否则按固定字节数
struct Progress {
    total: Option<u64>,
    next_mark: u64,
}

impl Progress {
    fn new(total: Option<u64>) -> Self {
        let mut progress = Self { total, next_mark: 0 };
        progress.next_mark = progress.step();
        progress
    }

    fn step(&self) -> u64 {
        match self.total {
            Some(total) if total > 0 => (total / 10).max(1),
            _ => PROGRESS_STEP_BYTES,
        }
    }

    /// 跨过下一个刻度时返回百分比（未知总大小时为 `None`）
    fn advance(&mut self, downloaded: u64) -> Option<Option<u8>> {
        if downloaded < self.next_mark {
            return None;
        }
        let step = self.step();
        while self.next_mark <= downloaded {
            self.next_mark += step;
        }
        let percent = self
            .total
            .filter(|&t| t > 0)
            .map(|t| ((downloaded.min(t) * 100) / t) as u8);
        Some(percent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_sits_next_to_destination() {
        assert_eq!(
            partial_path(Path::new("models/best.pt")),
            PathBuf::from("models/best.pt.part")
        );
    }

    #[test]
    fn progress_reports_every_tenth() {
        let mut progress = Progress::new(Some(1000));
        assert_eq!(progress.advance(50), None);
        assert_eq!(progress.advance(100), Some(Some(10)));
        assert_eq!(progress.advance(150), None);
        assert_eq!(progress.advance(420), Some(Some(42)));
        assert_eq!(progress.advance(450), None);
        assert_eq!(progress.advance(1000), Some(Some(100)));
    }

    #[test]
    fn progress_without_length_uses_byte_steps() {
        let mut progress = Progress::new(None);
        assert_eq!(progress.advance(PROGRESS_STEP_BYTES - 1), None);
        assert_eq!(progress.advance(PROGRESS_STEP_BYTES), Some(None));
    }
}
