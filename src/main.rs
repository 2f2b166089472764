use std::fs::OpenOptions;
use std::io::Write;

use omr_server::{build_info, server};

const PANIC_LOG: &str = "./panic.log";

/// 识别任务中的 panic 只影响对应答题卡，进程继续服务；此处只负责留档
fn install_panic_hook() {
    std::panic::set_hook(Box::new(|panic_info| {
        let payload = panic_info.payload();
        let reason = payload
            .downcast_ref::<&str>()
            .copied()
            .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
            .unwrap_or("unknown panic payload");
        let location = panic_info
            .location()
            .map(|l| format!("{}:{}", l.file(), l.line()))
            .unwrap_or_else(|| "unknown".to_string());
        let thread = std::thread::current()
            .name()
            .unwrap_or("unnamed")
            .to_string();
        let now = chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f");

        eprintln!("[PANIC] 线程 {} 发生panic: {} ({})", thread, reason, location);

        let _ = std::panic::catch_unwind(|| {
            tracing::error!(
                event = "panic.raised",
                thread = %thread,
                location = %location,
                reason = %reason
            );
        });

        // 追加写入，批量识别中多次 panic 不互相覆盖
        let record = format!(
            "[{}] version={} thread={} location={} reason={}\n",
            now,
            build_info::BUILD_VERSION,
            thread,
            location,
            reason
        );
        let written = OpenOptions::new()
            .create(true)
            .append(true)
            .open(PANIC_LOG)
            .and_then(|mut file| file.write_all(record.as_bytes()));
        if let Err(e) = written {
            eprintln!("[warn] 无法写入 {}: {}", PANIC_LOG, e);
        }

        std::io::stderr().flush().ok();
    }));
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    install_panic_hook();

    match std::env::args().nth(1).as_deref() {
        Some("health-check") | Some("--health-check") => {
            let report = server::check_readiness()?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            if report.can_start() {
                Ok(())
            } else {
                anyhow::bail!("配置存在 {} 个错误，服务无法启动", report.config_errors)
            }
        }
        Some("--version") | Some("-V") => {
            println!("omr-server {}", build_info::summary());
            Ok(())
        }
        _ => server::start_server().await,
    }
}
