use actix_web::http::StatusCode;
use actix_web::{web, Responder};
use std::sync::Arc;

use crate::comm::response::respond_any;
use crate::server::ImServer;

// 路由注册入口（GET） / Route registration (GET)
pub fn register(cfg: &mut actix_web::web::ServiceConfig, path: &str) {
    cfg.service(web::resource(path).route(web::get().to(health_handle)));
}

// 基础健康检查 / Basic health probe
pub async fn health_handle(server: web::Data<Arc<ImServer>>) -> impl Responder {
    respond_any(
        StatusCode::OK,
        serde_json::json!({
            "status": "up",
            "connections": server.conn_manager.len(),
            "cached_channels": server.channels.cached_len(),
            "pending_retries": server.retry.len(),
        }),
    )
}
