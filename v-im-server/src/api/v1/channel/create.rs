use actix_web::{web, Responder};
use serde::Deserialize;
use std::sync::Arc;
use tracing::error;

use v_im_proto::channel_type;

use super::default_channel_type;
use crate::comm::response::{respond_error, respond_ok};
use crate::server::ImServer;
use crate::storage::ChannelInfo;

#[derive(Deserialize)]
pub struct ChannelCreateReq {
    pub channel_id: String,
    #[serde(default)]
    pub channel_type: u8,
    #[serde(default)]
    pub ban: i32,
    #[serde(default)]
    pub large: i32,
    #[serde(default)]
    pub subscribers: Vec<String>,
}

#[derive(Deserialize)]
pub struct ChannelInfoReq {
    pub channel_id: String,
    #[serde(default)]
    pub channel_type: u8,
    #[serde(default)]
    pub ban: i32,
    #[serde(default)]
    pub large: i32,
}

#[derive(Deserialize)]
pub struct ChannelDeleteReq {
    pub channel_id: String,
    #[serde(default)]
    pub channel_type: u8,
}

// 路由注册入口（POST） / Route registration (POST)
pub fn register(cfg: &mut actix_web::web::ServiceConfig, base: &str) {
    cfg.service(web::resource(base.to_string()).route(web::post().to(create_or_update_handle)));
    cfg.service(web::resource(format!("{}/info", base)).route(web::post().to(update_info_handle)));
    cfg.service(web::resource(format!("{}/delete", base)).route(web::post().to(delete_handle)));
}

// 创建或修改频道：订阅者整体重置 / Create or update a channel, resetting subscribers
pub async fn create_or_update_handle(
    server: web::Data<Arc<ImServer>>,
    req: web::Json<ChannelCreateReq>,
) -> impl Responder {
    if req.channel_id.trim().is_empty() {
        return respond_error("频道ID不能为空 / channel_id must not be empty");
    }
    if req.channel_type == channel_type::PERSON {
        return respond_error("暂不支持个人频道 / person channels are not supported here");
    }
    let channel_type_ = default_channel_type(req.channel_type);
    let info = ChannelInfo {
        channel_id: req.channel_id.clone(),
        channel_type: channel_type_,
        ban: req.ban == 1,
        large: req.large == 1,
    };
    if let Err(e) = server.store.add_or_update_channel(&info) {
        error!("创建频道失败 / create channel err: {}", e);
        return respond_error(e);
    }
    if let Err(e) = server.store.remove_all_subscriber(&req.channel_id, channel_type_) {
        error!("移除所有订阅者失败 / remove all subscribers err: {}", e);
        return respond_error(e);
    }
    if !req.subscribers.is_empty() {
        if let Err(e) = server
            .store
            .add_subscribers(&req.channel_id, channel_type_, &req.subscribers)
        {
            error!("添加订阅者失败 / add subscribers err: {}", e);
            return respond_error(e);
        }
    }
    // 结构性变更后使缓存失效 / invalidate the cache after the structural change
    server.channels.evict(&req.channel_id, channel_type_);
    respond_ok()
}

// 更新或添加频道信息 / Update or add the channel descriptor
pub async fn update_info_handle(
    server: web::Data<Arc<ImServer>>,
    req: web::Json<ChannelInfoReq>,
) -> impl Responder {
    let channel_type_ = default_channel_type(req.channel_type);
    let info = ChannelInfo {
        channel_id: req.channel_id.clone(),
        channel_type: channel_type_,
        ban: req.ban == 1,
        large: req.large == 1,
    };
    if let Err(e) = server.store.add_or_update_channel(&info) {
        error!("更新频道信息失败 / update channel info err: {}", e);
        return respond_error(e);
    }
    // 已缓存则就地刷新 / refresh the cached descriptor in place
    server
        .channels
        .mutate_cached(&req.channel_id, channel_type_, |channel| channel.set_info(info.clone()));
    respond_ok()
}

// 删除频道并清空消息 / Delete the channel and clear its messages
pub async fn delete_handle(
    server: web::Data<Arc<ImServer>>,
    req: web::Json<ChannelDeleteReq>,
) -> impl Responder {
    let channel_type_ = default_channel_type(req.channel_type);
    if let Err(e) = server
        .store
        .delete_channel_and_clear_messages(&req.channel_id, channel_type_)
    {
        error!("删除频道失败 / delete channel err: {}", e);
        return respond_error(e);
    }
    server.channels.evict(&req.channel_id, channel_type_);
    respond_ok()
}
