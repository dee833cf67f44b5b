use actix_web::{web, Responder};
use serde::Deserialize;
use std::sync::Arc;
use tracing::error;

use v_im_proto::channel_type;

use super::default_channel_type;
use crate::comm::response::{respond_error, respond_ok};
use crate::server::ImServer;

#[derive(Deserialize)]
pub struct SubscriberReq {
    pub channel_id: String,
    #[serde(default)]
    pub channel_type: u8,
    #[serde(default)]
    pub subscribers: Vec<String>,
    /// 1=重置原订阅者 / 1 = reset the existing subscriber set first
    #[serde(default)]
    pub reset: i32,
    /// 1=临时订阅者（仅内存） / 1 = temporary subscriber, in-memory only
    #[serde(default)]
    pub temp_subscriber: i32,
}

impl SubscriberReq {
    fn check(&self) -> Result<(), &'static str> {
        if self.channel_id.trim().is_empty() {
            return Err("频道ID不能为空 / channel_id must not be empty");
        }
        Ok(())
    }
}

// 路由注册入口（POST） / Route registration (POST)
pub fn register(cfg: &mut actix_web::web::ServiceConfig, base: &str) {
    cfg.service(web::resource(format!("{}/subscriber_add", base)).route(web::post().to(add_handle)));
    cfg.service(
        web::resource(format!("{}/subscriber_remove", base)).route(web::post().to(remove_handle)),
    );
}

// 添加订阅者 / Add subscribers
pub async fn add_handle(
    server: web::Data<Arc<ImServer>>,
    req: web::Json<SubscriberReq>,
) -> impl Responder {
    if let Err(e) = req.check() {
        return respond_error(e);
    }
    if req.channel_type == channel_type::PERSON {
        return respond_error("个人频道不支持添加订阅者 / person channels take no subscribers");
    }
    let channel_type_ = default_channel_type(req.channel_type);
    let channel = match server.channels.get(&req.channel_id, channel_type_).await {
        Ok(Some(channel)) => channel,
        Ok(None) => return respond_error("频道并不存在 / channel does not exist"),
        Err(e) => {
            error!("获取频道失败 / get channel err: {}", e);
            return respond_error(e);
        }
    };

    if req.temp_subscriber == 1 {
        // 临时订阅者只进缓存 / tmp subscribers live in the cache only
        if req.reset == 1 {
            channel.remove_all_tmp_subscriber();
        }
        channel.add_tmp_subscribers(&req.subscribers);
        return respond_ok();
    }

    let mut existing: Vec<String> = Vec::new();
    if req.reset == 1 {
        if let Err(e) = server.store.remove_all_subscriber(&req.channel_id, channel_type_) {
            error!("移除所有订阅者失败 / remove all subscribers err: {}", e);
            return respond_error(e);
        }
        channel.remove_all_subscriber();
    } else {
        existing = match server.store.get_subscribers(&req.channel_id, channel_type_) {
            Ok(subs) => subs,
            Err(e) => {
                error!("获取订阅者失败 / get subscribers err: {}", e);
                return respond_error(e);
            }
        };
    }
    let new_subscribers: Vec<String> = req
        .subscribers
        .iter()
        .filter(|uid| !uid.trim().is_empty() && !existing.contains(uid))
        .cloned()
        .collect();
    if !new_subscribers.is_empty() {
        if let Err(e) = server
            .store
            .add_subscribers(&req.channel_id, channel_type_, &new_subscribers)
        {
            error!("添加订阅者失败 / add subscribers err: {}", e);
            return respond_error(e);
        }
        channel.add_subscribers(&new_subscribers);
    }
    respond_ok()
}

// 移除订阅者 / Remove subscribers
pub async fn remove_handle(
    server: web::Data<Arc<ImServer>>,
    req: web::Json<SubscriberReq>,
) -> impl Responder {
    if let Err(e) = req.check() {
        return respond_error(e);
    }
    let channel_type_ = default_channel_type(req.channel_type);
    let channel = match server.channels.get(&req.channel_id, channel_type_).await {
        Ok(Some(channel)) => channel,
        Ok(None) => return respond_error("频道不存在 / channel does not exist"),
        Err(e) => {
            error!("获取频道失败 / get channel err: {}", e);
            return respond_error(e);
        }
    };
    if req.temp_subscriber == 1 {
        channel.remove_tmp_subscribers(&req.subscribers);
        return respond_ok();
    }
    if let Err(e) = server
        .store
        .remove_subscribers(&req.channel_id, channel_type_, &req.subscribers)
    {
        error!("移除订阅者失败 / remove subscribers err: {}", e);
        return respond_error(e);
    }
    channel.remove_subscribers(&req.subscribers);
    respond_ok()
}
