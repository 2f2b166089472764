//! HTTP服务器设置模块
//! 负责绑定监听地址、创建路由与优雅关闭

use crate::api::routes;
use crate::util::config::Config;
use crate::AppState;
use anyhow::{Context, Result};
use axum::Router;
use tokio::net::TcpListener;
use tokio::signal::ctrl_c;
use tracing::info;

/// HTTP服务器管理器
pub struct ServerManager;

impl ServerManager {
    /// 创建HTTP服务器
    pub async fn create_server(config: &Config, app_state: AppState) -> Result<HttpServer> {
        let address = config.bind_address();
        let listener = TcpListener::bind(&address)
            .await
            .with_context(|| format!("端口绑定失败: {}", address))?;
        let local_addr = listener.local_addr()?;

        info!(
            target: "server.http",
            event = "http.router.build"
        );
        let app_routes = routes(app_state);

        info!(
            target: "server.http",
            event = "http.server.ready",
            address = %local_addr
        );

        Ok(HttpServer {
            listener,
            app_routes,
            local_addr,
        })
    }

    /// 启动服务器，阻塞直到收到关闭信号
    pub async fn start_server(server: HttpServer) -> Result<()> {
        info!(
            target: "server.http",
            event = "http.server.start",
            address = %server.local_addr
        );

        axum::serve(server.listener, server.app_routes)
            .with_graceful_shutdown(Self::shutdown_signal())
            .await?;

        info!("HTTP服务器已关闭");
        Ok(())
    }

    async fn shutdown_signal() {
        tokio::select! {
            _ = ctrl_c() => {
                info!(
                    target: "server.http",
                    event = "http.server.signal",
                    signal = "SIGINT"
                );
            }
            _ = Self::wait_for_sigterm() => {
                info!(
                    target: "server.http",
                    event = "http.server.signal",
                    signal = "SIGTERM"
                );
            }
        }

        info!(
            target: "server.http",
            event = "http.server.shutdown_begin"
        );
    }

    /// 等待 SIGTERM 信号
    async fn wait_for_sigterm() -> Result<(), Box<dyn std::error::Error>> {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut term_signal = signal(SignalKind::terminate())?;
            term_signal.recv().await;
            Ok(())
        }
        #[cfg(not(unix))]
        {
            std::future::pending::<()>().await;
            Ok(())
        }
    }
}

/// HTTP服务器实例
pub struct HttpServer {
    listener: TcpListener,
    app_routes: Router,
    local_addr: std::net::SocketAddr,
}

impl HttpServer {
    pub fn local_addr(&self) -> std::net::SocketAddr {
        self.local_addr
    }
}
