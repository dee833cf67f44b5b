use actix_web::http::StatusCode;
use actix_web::{web, Responder};
use serde::Deserialize;
use std::sync::Arc;
use tracing::error;

use crate::comm::response::{respond_any, respond_error, respond_ok};
use crate::server::ImServer;

#[derive(Deserialize)]
pub struct IpListReq {
    pub ips: Vec<String>,
}

// 路由注册入口 / Route registration
pub fn register(cfg: &mut actix_web::web::ServiceConfig, base: &str) {
    cfg.service(web::resource(format!("{}/blacklist_add", base)).route(web::post().to(add_handle)));
    cfg.service(
        web::resource(format!("{}/blacklist_remove", base)).route(web::post().to(remove_handle)),
    );
    cfg.service(web::resource(format!("{}/blacklist", base)).route(web::get().to(get_handle)));
}

// 添加IP黑名单 / Add IP blacklist entries
pub async fn add_handle(server: web::Data<Arc<ImServer>>, req: web::Json<IpListReq>) -> impl Responder {
    if req.ips.is_empty() {
        return respond_error("ip列表不能为空 / ips must not be empty");
    }
    if let Err(e) = server.store.add_ip_blacklist(&req.ips) {
        error!("添加IP黑名单失败 / add ip blacklist err: {}", e);
        return respond_error(e);
    }
    server.cache_ip_blacklist(&req.ips);
    respond_ok()
}

// 移除IP黑名单 / Remove IP blacklist entries
pub async fn remove_handle(
    server: web::Data<Arc<ImServer>>,
    req: web::Json<IpListReq>,
) -> impl Responder {
    if req.ips.is_empty() {
        return respond_error("ip列表不能为空 / ips must not be empty");
    }
    if let Err(e) = server.store.remove_ip_blacklist(&req.ips) {
        error!("移除IP黑名单失败 / remove ip blacklist err: {}", e);
        return respond_error(e);
    }
    server.uncache_ip_blacklist(&req.ips);
    respond_ok()
}

// 获取IP黑名单 / List IP blacklist entries
pub async fn get_handle(server: web::Data<Arc<ImServer>>) -> impl Responder {
    match server.store.get_ip_blacklist() {
        Ok(ips) => respond_any(StatusCode::OK, ips),
        Err(e) => {
            error!("获取IP黑名单失败 / get ip blacklist err: {}", e);
            respond_error(e)
        }
    }
}
