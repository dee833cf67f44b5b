use actix_web::{web, App, HttpServer};
use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use tracing::info;

use v_im_server::comm::config::init_global_config_manager;
use v_im_server::config::Options;
use v_im_server::init_tracing;
use v_im_server::server::ImServer;
use v_im_server::service::{Datasource, HttpDatasource};
use v_im_server::storage::MemoryStore;
use v_im_server::{net, router};

/// 命令行参数 / Command line arguments
#[derive(Parser, Debug)]
#[command(author, version, about = "v-im-server IM Server", long_about = None)]
pub struct Args {
    /// 指定配置文件路径（TOML） / Config file path (TOML)
    #[arg(short = 'c', long = "config", default_value = "config/default.toml")]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    // 配置文件可缺省，分层源兜底 / the config file may be absent, layered sources apply
    let config_exists = args
        .config
        .as_deref()
        .map(|p| std::path::Path::new(p).exists())
        .unwrap_or(false);
    init_global_config_manager(if config_exists { args.config.as_deref() } else { None })?;
    init_tracing()?;

    let opts = Arc::new(Options::load()?);
    let store = Arc::new(MemoryStore::new());
    let datasource: Option<Arc<dyn Datasource>> = if opts.datasource.enabled {
        Some(Arc::new(HttpDatasource::new(&opts.datasource)))
    } else {
        None
    };

    let server = ImServer::new(opts.clone(), store, datasource)?;
    server.bootstrap().await;

    let tcp = tokio::spawn(net::tcp::start(
        server.clone(),
        opts.server.host.clone(),
        opts.server.tcp_port,
    ));
    let ws = tokio::spawn(net::ws::start(
        server.clone(),
        opts.server.host.clone(),
        opts.server.ws_port,
    ));
    let http = actix_web::rt::spawn(start_http_server(
        server.clone(),
        opts.server.host.clone(),
        opts.server.http_port,
    ));

    tokio::signal::ctrl_c().await?;
    server.shutdown().await;
    tcp.abort();
    ws.abort();
    http.abort();
    info!("👋 服务已退出 / server exited");
    Ok(())
}

/// 启动HTTP管理面 / Start the admin HTTP server
async fn start_http_server(server: Arc<ImServer>, host: String, port: u16) -> Result<()> {
    let addr = format!("{}:{}", host, port);
    info!("🌐 HTTP管理面启动 / admin HTTP starting on http://{}", addr);
    HttpServer::new(move || {
        App::new()
            .app_data(web::Data::new(server.clone()))
            .configure(router::configure)
    })
    .bind(addr)?
    .run()
    .await?;
    Ok(())
}
