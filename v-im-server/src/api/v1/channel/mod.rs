//! 频道管理接口 / Channel admin endpoints.

pub mod blacklist;
pub mod create;
pub mod messagesync;
pub mod subscriber;
pub mod whitelist;

use serde::Deserialize;

use v_im_proto::channel_type;

use crate::config::Options;
use crate::domain::fake_channel_id;

/// 名单类请求 / Shared shape of the list-editing requests.
#[derive(Deserialize)]
pub struct ListReq {
    pub channel_id: String,
    #[serde(default)]
    pub channel_type: u8,
    #[serde(default)]
    pub uids: Vec<String>,
}

impl ListReq {
    pub fn check(&self) -> Result<(), &'static str> {
        if self.channel_id.trim().is_empty() {
            return Err("频道ID不能为空 / channel_id must not be empty");
        }
        Ok(())
    }
}

/// 频道类型缺省在API边界上显式落到群组
/// channelType 0 defaults to group, explicitly at the API boundary.
pub fn default_channel_type(channel_type_: u8) -> u8 {
    if channel_type_ == 0 {
        channel_type::GROUP
    } else {
        channel_type_
    }
}

/// 个人频道的名单挂在与目标uid构成的规范键上
/// Person-channel lists attach to the canonical key formed with the target uid.
pub fn person_list_channel_id(opts: &Options, channel_id: &str, uid: &str) -> String {
    if opts.is_fake_channel(channel_id) {
        channel_id.to_string()
    } else {
        fake_channel_id(uid, channel_id, &opts.channel.fake_delimiter)
    }
}
