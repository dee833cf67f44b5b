use actix_web::http::StatusCode;
use actix_web::{web, Responder};
use base64::{engine::general_purpose::STANDARD as B64, Engine as _};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::error;

use v_im_proto::channel_type;

use crate::comm::response::{respond_any, respond_error};
use crate::domain::{fake_channel_id, Message};
use crate::server::ImServer;

/// 拉取模式 / Pull direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(try_from = "u8")]
pub enum PullMode {
    /// 向下（更旧） / downwards, towards older messages
    Down,
    /// 向上（更新） / upwards, towards newer messages
    Up,
}

impl TryFrom<u8> for PullMode {
    type Error = String;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            0 => Ok(PullMode::Down),
            1 => Ok(PullMode::Up),
            other => Err(format!("未知拉取模式 / unknown pull mode {}", other)),
        }
    }
}

impl Default for PullMode {
    fn default() -> Self {
        PullMode::Down
    }
}

const MAX_SYNC_LIMIT: usize = 10_000;
const DEFAULT_SYNC_LIMIT: usize = 100;

#[derive(Deserialize)]
pub struct SyncReq {
    /// 当前登录用户uid（个人频道定位用） / the requesting uid, used for person keys
    #[serde(default)]
    pub login_uid: String,
    pub channel_id: String,
    #[serde(default)]
    pub channel_type: u8,
    /// 开始消息序号 / start message seq
    #[serde(default)]
    pub start_message_seq: u32,
    /// 结束消息序号（结果不含） / end message seq, excluded from results
    #[serde(default)]
    pub end_message_seq: u32,
    #[serde(default)]
    pub limit: usize,
    #[serde(default)]
    pub pull_mode: PullMode,
}

#[derive(Serialize, Debug)]
pub struct MessageResp {
    pub message_id: i64,
    pub message_seq: u32,
    pub client_msg_no: String,
    pub from_uid: String,
    pub channel_id: String,
    pub channel_type: u8,
    pub timestamp: i32,
    pub expire: u32,
    pub topic: String,
    /// base64明文载荷 / base64 of the plaintext payload
    pub payload: String,
}

impl MessageResp {
    fn from_message(message: &Message) -> Self {
        MessageResp {
            message_id: message.recv.message_id,
            message_seq: message.recv.message_seq,
            client_msg_no: message.recv.client_msg_no.clone(),
            from_uid: message.recv.from_uid.clone(),
            channel_id: message.recv.channel_id.clone(),
            channel_type: message.recv.channel_type,
            timestamp: message.recv.timestamp,
            expire: message.recv.expire,
            topic: message.recv.topic.clone(),
            payload: B64.encode(&message.recv.payload),
        }
    }
}

#[derive(Serialize, Debug)]
pub struct SyncResp {
    pub start_message_seq: u32,
    pub end_message_seq: u32,
    /// 1=还有更多 / 1 = more messages remain
    pub more: u8,
    pub messages: Vec<MessageResp>,
}

// 路由注册入口（POST） / Route registration (POST)
pub fn register(cfg: &mut actix_web::web::ServiceConfig, path: &str) {
    cfg.service(web::resource(path).route(web::post().to(sync_handle)));
}

// 同步频道内的消息 / Sync messages of a channel window
pub async fn sync_handle(server: web::Data<Arc<ImServer>>, req: web::Json<SyncReq>) -> impl Responder {
    let mut limit = req.limit;
    if limit == 0 {
        limit = DEFAULT_SYNC_LIMIT;
    }
    if limit > MAX_SYNC_LIMIT {
        limit = MAX_SYNC_LIMIT;
    }

    let effective_channel_id = if req.channel_type == channel_type::PERSON
        && !server.opts.is_fake_channel(&req.channel_id)
    {
        fake_channel_id(&req.login_uid, &req.channel_id, &server.opts.channel.fake_delimiter)
    } else {
        req.channel_id.clone()
    };

    let loaded = if req.start_message_seq == 0 && req.end_message_seq == 0 {
        server
            .store
            .load_last_msgs(&effective_channel_id, req.channel_type, limit)
    } else if req.pull_mode == PullMode::Up {
        server.store.load_next_range_msgs(
            &effective_channel_id,
            req.channel_type,
            req.start_message_seq,
            req.end_message_seq,
            limit,
        )
    } else {
        server.store.load_prev_range_msgs(
            &effective_channel_id,
            req.channel_type,
            req.start_message_seq,
            req.end_message_seq,
            limit,
        )
    };
    let messages = match loaded {
        Ok(messages) => messages,
        Err(e) => {
            error!("同步消息失败 / message sync err: {}", e);
            return respond_error(e);
        }
    };

    let responses: Vec<MessageResp> = messages.iter().map(MessageResp::from_message).collect();
    let more = compute_more(req.pull_mode, req.end_message_seq, limit, &responses);

    respond_any(
        StatusCode::OK,
        SyncResp {
            start_message_seq: req.start_message_seq,
            end_message_seq: req.end_message_seq,
            more: more as u8,
            messages: responses,
        },
    )
}

/// 是否还有更多：数量未达limit或已触到边界序号即为否
/// Whether more remain: false once the count falls short of the limit or the
/// boundary seq shows up (first element bounds Down, last bounds Up).
fn compute_more(pull_mode: PullMode, end_message_seq: u32, limit: usize, responses: &[MessageResp]) -> bool {
    if responses.len() < limit {
        return false;
    }
    let boundary = match pull_mode {
        PullMode::Down => responses.first(),
        PullMode::Up => responses.last(),
    };
    if let Some(boundary) = boundary {
        if end_message_seq != 0 && boundary.message_seq == end_message_seq {
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resp(seq: u32) -> MessageResp {
        MessageResp {
            message_id: seq as i64,
            message_seq: seq,
            client_msg_no: String::new(),
            from_uid: String::new(),
            channel_id: String::new(),
            channel_type: 2,
            timestamp: 0,
            expire: 0,
            topic: String::new(),
            payload: String::new(),
        }
    }

    #[test]
    fn more_follows_limit_and_boundary() {
        // seqs 1..20 窗口 start=10 end=5 limit=3 -> [9,8,7] 还有更多
        let window: Vec<MessageResp> = vec![resp(9), resp(8), resp(7)];
        assert!(compute_more(PullMode::Down, 5, 3, &window));

        // 数量不足limit即没有更多 / short of the limit means no more
        assert!(!compute_more(PullMode::Down, 5, 4, &window));

        // 首条即边界（向下） / first element at the boundary (Down)
        let window: Vec<MessageResp> = vec![resp(5), resp(4), resp(3)];
        assert!(!compute_more(PullMode::Down, 5, 3, &window));

        // 末条即边界（向上） / last element at the boundary (Up)
        let window: Vec<MessageResp> = vec![resp(6), resp(7), resp(8)];
        assert!(!compute_more(PullMode::Up, 8, 3, &window));
        assert!(compute_more(PullMode::Up, 9, 3, &window));
    }
}
