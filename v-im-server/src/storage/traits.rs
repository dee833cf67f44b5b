use anyhow::Result;

use super::{ChannelInfo, StreamItem};
use crate::domain::Message;

/// 持久层窄接口，便于测试替换 / Narrow persistence interface for testability.
///
/// `append_messages` 为每条消息分配频道内单调递增的 messageSeq 并返回。
/// `append_messages` assigns the per-channel monotonically increasing
/// messageSeq to each message and returns the assigned values in order.
pub trait Store: Send + Sync {
    // -------- 频道 / channels --------
    fn add_or_update_channel(&self, info: &ChannelInfo) -> Result<()>;
    fn get_channel(&self, channel_id: &str, channel_type: u8) -> Result<Option<ChannelInfo>>;
    fn delete_channel_and_clear_messages(&self, channel_id: &str, channel_type: u8) -> Result<()>;

    // -------- 订阅者 / subscribers --------
    fn add_subscribers(&self, channel_id: &str, channel_type: u8, uids: &[String]) -> Result<()>;
    fn remove_subscribers(&self, channel_id: &str, channel_type: u8, uids: &[String]) -> Result<()>;
    fn remove_all_subscriber(&self, channel_id: &str, channel_type: u8) -> Result<()>;
    fn get_subscribers(&self, channel_id: &str, channel_type: u8) -> Result<Vec<String>>;

    // -------- 白名单 / allowlist --------
    fn add_allowlist(&self, channel_id: &str, channel_type: u8, uids: &[String]) -> Result<()>;
    fn remove_allowlist(&self, channel_id: &str, channel_type: u8, uids: &[String]) -> Result<()>;
    fn remove_all_allowlist(&self, channel_id: &str, channel_type: u8) -> Result<()>;
    fn get_allowlist(&self, channel_id: &str, channel_type: u8) -> Result<Vec<String>>;

    // -------- 黑名单 / denylist --------
    fn add_denylist(&self, channel_id: &str, channel_type: u8, uids: &[String]) -> Result<()>;
    fn remove_denylist(&self, channel_id: &str, channel_type: u8, uids: &[String]) -> Result<()>;
    fn remove_all_denylist(&self, channel_id: &str, channel_type: u8) -> Result<()>;
    fn get_denylist(&self, channel_id: &str, channel_type: u8) -> Result<Vec<String>>;

    // -------- 用户 / users --------
    fn get_user_token(&self, uid: &str, device_flag: u8) -> Result<Option<(String, u8)>>;
    fn update_user_cursor_if_need(&self, uid: &str, message_seq: u32) -> Result<()>;
    fn get_user_cursor(&self, uid: &str) -> Result<u32>;

    // -------- 消息 / messages --------
    fn append_messages(
        &self,
        channel_id: &str,
        channel_type: u8,
        messages: &[Message],
    ) -> Result<Vec<u32>>;
    fn append_stream_item(
        &self,
        channel_id: &str,
        channel_type: u8,
        stream_no: &str,
        item: &StreamItem,
    ) -> Result<u32>;
    fn append_messages_of_notify_queue(&self, messages: &[Message]) -> Result<()>;
    fn load_last_msgs(&self, channel_id: &str, channel_type: u8, limit: usize) -> Result<Vec<Message>>;
    /// 向下拉取：(end, start) 开区间内按seq降序 / Down: seqs strictly inside (end, start), descending.
    fn load_prev_range_msgs(
        &self,
        channel_id: &str,
        channel_type: u8,
        start_seq: u32,
        end_seq: u32,
        limit: usize,
    ) -> Result<Vec<Message>>;
    /// 向上拉取：seq大于start小于end按升序 / Up: seqs above start and strictly below end, ascending.
    fn load_next_range_msgs(
        &self,
        channel_id: &str,
        channel_type: u8,
        start_seq: u32,
        end_seq: u32,
        limit: usize,
    ) -> Result<Vec<Message>>;

    // -------- IP黑名单 / IP blacklist --------
    fn add_ip_blacklist(&self, ips: &[String]) -> Result<()>;
    fn remove_ip_blacklist(&self, ips: &[String]) -> Result<()>;
    fn get_ip_blacklist(&self) -> Result<Vec<String>>;
}
