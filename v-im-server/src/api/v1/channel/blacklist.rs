use actix_web::{web, Responder};
use std::sync::Arc;
use tracing::error;

use v_im_proto::channel_type;

use super::{default_channel_type, person_list_channel_id, ListReq};
use crate::comm::response::{respond_error, respond_ok};
use crate::server::ImServer;

// 路由注册入口（POST） / Route registration (POST)
pub fn register(cfg: &mut actix_web::web::ServiceConfig, base: &str) {
    cfg.service(web::resource(format!("{}/blacklist_add", base)).route(web::post().to(add_handle)));
    cfg.service(web::resource(format!("{}/blacklist_set", base)).route(web::post().to(set_handle)));
    cfg.service(
        web::resource(format!("{}/blacklist_remove", base)).route(web::post().to(remove_handle)),
    );
}

// 添加黑名单 / Add denylist entries
pub async fn add_handle(server: web::Data<Arc<ImServer>>, req: web::Json<ListReq>) -> impl Responder {
    if let Err(e) = req.check() {
        return respond_error(e);
    }
    if req.uids.is_empty() {
        return respond_error("uids不能为空 / uids must not be empty");
    }
    if req.channel_type == channel_type::PERSON {
        // 个人频道逐uid挂到规范键 / person lists attach per target uid
        for uid in &req.uids {
            let fake_id = person_list_channel_id(&server.opts, &req.channel_id, uid);
            let uids = vec![uid.clone()];
            if let Err(e) = server.store.add_denylist(&fake_id, req.channel_type, &uids) {
                error!("添加黑名单失败 / add denylist err: {}", e);
                return respond_error(e);
            }
            server
                .channels
                .mutate_cached(&fake_id, req.channel_type, |c| c.add_denylist(&uids));
        }
        return respond_ok();
    }
    let channel_type_ = default_channel_type(req.channel_type);
    if let Err(e) = server.store.add_denylist(&req.channel_id, channel_type_, &req.uids) {
        error!("添加黑名单失败 / add denylist err: {}", e);
        return respond_error(e);
    }
    server
        .channels
        .mutate_cached(&req.channel_id, channel_type_, |c| c.add_denylist(&req.uids));
    respond_ok()
}

// 设置黑名单（覆盖原数据） / Replace the denylist wholesale
pub async fn set_handle(server: web::Data<Arc<ImServer>>, req: web::Json<ListReq>) -> impl Responder {
    if let Err(e) = req.check() {
        return respond_error(e);
    }
    if req.channel_type == channel_type::PERSON {
        for uid in &req.uids {
            let fake_id = person_list_channel_id(&server.opts, &req.channel_id, uid);
            if let Err(e) = server.store.remove_all_denylist(&fake_id, req.channel_type) {
                error!("移除所有黑名单失败 / remove all denylist err: {}", e);
                return respond_error(e);
            }
            let uids = vec![uid.clone()];
            if let Err(e) = server.store.add_denylist(&fake_id, req.channel_type, &uids) {
                error!("添加黑名单失败 / add denylist err: {}", e);
                return respond_error(e);
            }
            server
                .channels
                .mutate_cached(&fake_id, req.channel_type, |c| c.set_denylist(uids.clone()));
        }
        return respond_ok();
    }
    let channel_type_ = default_channel_type(req.channel_type);
    if let Err(e) = server.store.remove_all_denylist(&req.channel_id, channel_type_) {
        error!("移除所有黑名单失败 / remove all denylist err: {}", e);
        return respond_error(e);
    }
    if !req.uids.is_empty() {
        if let Err(e) = server.store.add_denylist(&req.channel_id, channel_type_, &req.uids) {
            error!("添加黑名单失败 / add denylist err: {}", e);
            return respond_error(e);
        }
    }
    server
        .channels
        .mutate_cached(&req.channel_id, channel_type_, |c| c.set_denylist(req.uids.clone()));
    respond_ok()
}

// 移除黑名单 / Remove denylist entries
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
            if let Err(e) = server.store.remove_denylist(&fake_id, req.channel_type, &uids) {
                error!("移除黑名单失败 / remove denylist err: {}", e);
                return respond_error(e);
            }
            server
                .channels
                .mutate_cached(&fake_id, req.channel_type, |c| c.remove_denylist(&uids));
        }
        return respond_ok();
    }
    let channel_type_ = default_channel_type(req.channel_type);
    if let Err(e) = server.store.remove_denylist(&req.channel_id, channel_type_, &req.uids) {
        error!("移除黑名单失败 / remove denylist err: {}", e);
        return respond_error(e);
    }
    server
        .channels
        .mutate_cached(&req.channel_id, channel_type_, |c| c.remove_denylist(&req.uids));
    respond_ok()
}
