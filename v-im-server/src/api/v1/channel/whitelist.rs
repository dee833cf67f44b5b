use actix_web::http::StatusCode;
use actix_web::{web, Responder};
use serde::Deserialize;
use std::sync::Arc;
use tracing::error;

use v_im_proto::channel_type;

use super::{default_channel_type, person_list_channel_id, ListReq};
use crate::comm::response::{respond_any, respond_error, respond_ok};
use crate::server::ImServer;

// 路由注册入口 / Route registration
pub fn register(cfg: &mut actix_web::web::ServiceConfig, base: &str) {
    cfg.service(web::resource(format!("{}/whitelist_add", base)).route(web::post().to(add_handle)));
    cfg.service(web::resource(format!("{}/whitelist_set", base)).route(web::post().to(set_handle)));
    cfg.service(
        web::resource(format!("{}/whitelist_remove", base)).route(web::post().to(remove_handle)),
    );
    cfg.service(web::resource(format!("{}/whitelist", base)).route(web::get().to(get_handle)));
}

// 添加白名单 / Add allowlist entries
pub async fn add_handle(server: web::Data<Arc<ImServer>>, req: web::Json<ListReq>) -> impl Responder {
    if let Err(e) = req.check() {
        return respond_error(e);
    }
    if req.channel_type == channel_type::PERSON {
        for uid in &req.uids {
            let fake_id = person_list_channel_id(&server.opts, &req.channel_id, uid);
            let uids = vec![uid.clone()];
            if let Err(e) = server.store.add_allowlist(&fake_id, req.channel_type, &uids) {
                error!("添加白名单失败 / add allowlist err: {}", e);
                return respond_error(e);
            }
            server
                .channels
                .mutate_cached(&fake_id, req.channel_type, |c| c.add_allowlist(&uids));
        }
        return respond_ok();
    }
    let channel_type_ = default_channel_type(req.channel_type);
    if let Err(e) = server.store.add_allowlist(&req.channel_id, channel_type_, &req.uids) {
        error!("添加白名单失败 / add allowlist err: {}", e);
        return respond_error(e);
    }
    server
        .channels
        .mutate_cached(&req.channel_id, channel_type_, |c| c.add_allowlist(&req.uids));
    respond_ok()
}

// 设置白名单（覆盖；空uids即全部移除） / Replace the allowlist; empty uids clears it
pub async fn set_handle(server: web::Data<Arc<ImServer>>, req: web::Json<ListReq>) -> impl Responder {
    if let Err(e) = req.check() {
        return respond_error(e);
    }
    if req.channel_type == channel_type::PERSON {
        for uid in &req.uids {
            let fake_id = person_list_channel_id(&server.opts, &req.channel_id, uid);
            if let Err(e) = server.store.remove_all_allowlist(&fake_id, req.channel_type) {
                error!("移除所有白名单失败 / remove all allowlist err: {}", e);
                return respond_error(e);
            }
            let uids = vec![uid.clone()];
            if let Err(e) = server.store.add_allowlist(&fake_id, req.channel_type, &uids) {
                error!("添加白名单失败 / add allowlist err: {}", e);
                return respond_error(e);
            }
            server
                .channels
                .mutate_cached(&fake_id, req.channel_type, |c| c.set_allowlist(uids.clone()));
        }
        return respond_ok();
    }
    let channel_type_ = default_channel_type(req.channel_type);
    if let Err(e) = server.store.remove_all_allowlist(&req.channel_id, channel_type_) {
        error!("移除所有白名单失败 / remove all allowlist err: {}", e);
        return respond_error(e);
    }
    if !req.uids.is_empty() {
        if let Err(e) = server.store.add_allowlist(&req.channel_id, channel_type_, &req.uids) {
            error!("添加白名单失败 / add allowlist err: {}", e);
            return respond_error(e);
        }
    }
    server
        .channels
        .mutate_cached(&req.channel_id, channel_type_, |c| c.set_allowlist(req.uids.clone()));
    respond_ok()
}

// 移除白名单 / Remove allowlist entries
pub async fn remove_handle(
    server: web::Data<Arc<ImServer>>,
    req: web::Json<ListReq>,
) -> impl Responder {
    if let Err(e) = req.check() {
        return respond_error(e);
    }
    if req.channel_type == channel_type::PERSON {
        for uid in &req.uids {
            let fake_id = person_list_channel_id(&server.opts, &req.channel_id, uid);
            let uids = vec![uid.clone()];
            if let Err(e) = server.store.remove_allowlist(&fake_id, req.channel_type, &uids) {
                error!("移除白名单失败 / remove allowlist err: {}", e);
                return respond_error(e);
            }
            server
                .channels
                .mutate_cached(&fake_id, req.channel_type, |c| c.remove_allowlist(&uids));
        }
        return respond_ok();
    }
    let channel_type_ = default_channel_type(req.channel_type);
    if let Err(e) = server.store.remove_allowlist(&req.channel_id, channel_type_, &req.uids) {
        error!("移除白名单失败 / remove allowlist err: {}", e);
        return respond_error(e);
    }
    server
        .channels
        .mutate_cached(&req.channel_id, channel_type_, |c| c.remove_allowlist(&req.uids));
    respond_ok()
}

#[derive(Deserialize)]
pub struct WhitelistQuery {
    pub channel_id: String,
    #[serde(default)]
    pub channel_type: u8,
}

// 查询白名单 / Inspect the allowlist
pub async fn get_handle(
    server: web::Data<Arc<ImServer>>,
    query: web::Query<WhitelistQuery>,
) -> impl Responder {
    let channel_type_ = default_channel_type(query.channel_type);
    match server.channels.get(&query.channel_id, channel_type_).await {
        Ok(Some(channel)) => {
            let mut allowlist = channel.get_allowlist();
            allowlist.sort();
            respond_any(StatusCode::OK, allowlist)
        }
        Ok(None) => respond_error("频道不存在 / channel does not exist"),
        Err(e) => {
            error!("获取频道失败 / get channel err: {}", e);
            respond_error(e)
        }
    }
}
