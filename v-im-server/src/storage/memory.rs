use anyhow::Result;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashSet;

use super::{ChannelInfo, StreamItem, Store};
use crate::domain::Message;

type ChannelKey = (String, u8);

#[derive(Default)]
struct ChannelLog {
    next_seq: u32,
    messages: Vec<Message>,
}

/// 进程内存储：dashmap分片索引，频道日志独立加锁
/// In-process store: dashmap-sharded indexes, one lock per channel log.
#[derive(Default)]
pub struct MemoryStore {
    channels: DashMap<ChannelKey, ChannelInfo>,
    subscribers: DashMap<ChannelKey, HashSet<String>>,
    allowlist: DashMap<ChannelKey, HashSet<String>>,
    denylist: DashMap<ChannelKey, HashSet<String>>,
    logs: DashMap<ChannelKey, Mutex<ChannelLog>>,
    streams: DashMap<(String, u8, String), Vec<StreamItem>>,
    tokens: DashMap<(String, u8), (String, u8)>,
    cursors: DashMap<String, u32>,
    notify_queue: Mutex<Vec<Message>>,
    ip_blacklist: Mutex<HashSet<String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore::default()
    }

    fn key(channel_id: &str, channel_type: u8) -> ChannelKey {
        (channel_id.to_string(), channel_type)
    }

    fn add_to(map: &DashMap<ChannelKey, HashSet<String>>, key: ChannelKey, uids: &[String]) {
        let mut set = map.entry(key).or_default();
        for uid in uids {
            if !uid.trim().is_empty() {
                set.insert(uid.clone());
            }
        }
    }

    fn remove_from(map: &DashMap<ChannelKey, HashSet<String>>, key: &ChannelKey, uids: &[String]) {
        if let Some(mut set) = map.get_mut(key) {
            for uid in uids {
                set.remove(uid);
            }
        }
    }

    fn get_sorted(map: &DashMap<ChannelKey, HashSet<String>>, key: &ChannelKey) -> Vec<String> {
        let mut v: Vec<String> = map
            .get(key)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        v.sort();
        v
    }

    /// 测试与用户接入层写入令牌 / Seed a user token (used by tests and the user surface).
    pub fn update_user_token(&self, uid: &str, device_flag: u8, token: &str, level: u8) {
        self.tokens
            .insert((uid.to_string(), device_flag), (token.to_string(), level));
    }

    /// 通知队列快照 / Snapshot of the notify queue (consumed by the webhook emitter).
    pub fn notify_queue_snapshot(&self) -> Vec<Message> {
        self.notify_queue.lock().clone()
    }

    /// 流分片快照 / Snapshot of stored stream items.
    pub fn stream_items(&self, channel_id: &str, channel_type: u8, stream_no: &str) -> Vec<StreamItem> {
        self.streams
            .get(&(channel_id.to_string(), channel_type, stream_no.to_string()))
            .map(|v| v.value().clone())
            .unwrap_or_default()
    }
}

impl Store for MemoryStore {
    fn add_or_update_channel(&self, info: &ChannelInfo) -> Result<()> {
        self.channels
            .insert(Self::key(&info.channel_id, info.channel_type), info.clone());
        Ok(())
    }

    fn get_channel(&self, channel_id: &str, channel_type: u8) -> Result<Option<ChannelInfo>> {
        Ok(self
            .channels
            .get(&Self::key(channel_id, channel_type))
            .map(|c| c.value().clone()))
    }

    fn delete_channel_and_clear_messages(&self, channel_id: &str, channel_type: u8) -> Result<()> {
        let key = Self::key(channel_id, channel_type);
        self.channels.remove(&key);
        self.subscribers.remove(&key);
        self.allowlist.remove(&key);
        self.denylist.remove(&key);
        self.logs.remove(&key);
        Ok(())
    }

    fn add_subscribers(&self, channel_id: &str, channel_type: u8, uids: &[String]) -> Result<()> {
        Self::add_to(&self.subscribers, Self::key(channel_id, channel_type), uids);
        Ok(())
    }

    fn remove_subscribers(&self, channel_id: &str, channel_type: u8, uids: &[String]) -> Result<()> {
        Self::remove_from(&self.subscribers, &Self::key(channel_id, channel_type), uids);
        Ok(())
    }

    fn remove_all_subscriber(&self, channel_id: &str, channel_type: u8) -> Result<()> {
        self.subscribers.remove(&Self::key(channel_id, channel_type));
        Ok(())
    }

    fn get_subscribers(&self, channel_id: &str, channel_type: u8) -> Result<Vec<String>> {
        Ok(Self::get_sorted(&self.subscribers, &Self::key(channel_id, channel_type)))
    }

    fn add_allowlist(&self, channel_id: &str, channel_type: u8, uids: &[String]) -> Result<()> {
        Self::add_to(&self.allowlist, Self::key(channel_id, channel_type), uids);
        Ok(())
    }

    fn remove_allowlist(&self, channel_id: &str, channel_type: u8, uids: &[String]) -> Result<()> {
        Self::remove_from(&self.allowlist, &Self::key(channel_id, channel_type), uids);
        Ok(())
    }

    fn remove_all_allowlist(&self, channel_id: &str, channel_type: u8) -> Result<()> {
        self.allowlist.remove(&Self::key(channel_id, channel_type));
        Ok(())
    }

    fn get_allowlist(&self, channel_id: &str, channel_type: u8) -> Result<Vec<String>> {
        Ok(Self::get_sorted(&self.allowlist, &Self::key(channel_id, channel_type)))
    }

    fn add_denylist(&self, channel_id: &str, channel_type: u8, uids: &[String]) -> Result<()> {
        Self::add_to(&self.denylist, Self::key(channel_id, channel_type), uids);
        Ok(())
    }

    fn remove_denylist(&self, channel_id: &str, channel_type: u8, uids: &[String]) -> Result<()> {
        Self::remove_from(&self.denylist, &Self::key(channel_id, channel_type), uids);
        Ok(())
    }

    fn remove_all_denylist(&self, channel_id: &str, channel_type: u8) -> Result<()> {
        self.denylist.remove(&Self::key(channel_id, channel_type));
        Ok(())
    }

    fn get_denylist(&self, channel_id: &str, channel_type: u8) -> Result<Vec<String>> {
        Ok(Self::get_sorted(&self.denylist, &Self::key(channel_id, channel_type)))
    }

    fn get_user_token(&self, uid: &str, device_flag: u8) -> Result<Option<(String, u8)>> {
        Ok(self
            .tokens
            .get(&(uid.to_string(), device_flag))
            .map(|t| t.value().clone()))
    }

    fn update_user_cursor_if_need(&self, uid: &str, message_seq: u32) -> Result<()> {
        let mut cursor = self.cursors.entry(uid.to_string()).or_insert(0);
        if message_seq > *cursor {
            *cursor = message_seq;
        }
        Ok(())
    }

    fn get_user_cursor(&self, uid: &str) -> Result<u32> {
        Ok(self.cursors.get(uid).map(|c| *c).unwrap_or(0))
    }

    fn append_messages(
        &self,
        channel_id: &str,
        channel_type: u8,
        messages: &[Message],
    ) -> Result<Vec<u32>> {
        let entry = self
            .logs
            .entry(Self::key(channel_id, channel_type))
            .or_default();
        let mut log = entry.lock();
        let mut seqs = Vec::with_capacity(messages.len());
        for message in messages {
            log.next_seq += 1;
            let seq = log.next_seq;
            let mut stored = message.clone();
            stored.recv.message_seq = seq;
            log.messages.push(stored);
            seqs.push(seq);
        }
        Ok(seqs)
    }

    fn append_stream_item(
        &self,
        channel_id: &str,
        channel_type: u8,
        stream_no: &str,
        item: &StreamItem,
    ) -> Result<u32> {
        let mut items = self
            .streams
            .entry((channel_id.to_string(), channel_type, stream_no.to_string()))
            .or_default();
        items.push(item.clone());
        Ok(items.len() as u32)
    }

    fn append_messages_of_notify_queue(&self, messages: &[Message]) -> Result<()> {
        self.notify_queue.lock().extend(messages.iter().cloned());
        Ok(())
    }

    fn load_last_msgs(&self, channel_id: &str, channel_type: u8, limit: usize) -> Result<Vec<Message>> {
        let key = Self::key(channel_id, channel_type);
        let Some(entry) = self.logs.get(&key) else {
            return Ok(vec![]);
        };
        let log = entry.lock();
        Ok(log.messages.iter().rev().take(limit).cloned().collect())
    }

    fn load_prev_range_msgs(
        &self,
        channel_id: &str,
        channel_type: u8,
        start_seq: u32,
        end_seq: u32,
        limit: usize,
    ) -> Result<Vec<Message>> {
        let key = Self::key(channel_id, channel_type);
        let Some(entry) = self.logs.get(&key) else {
            return Ok(vec![]);
        };
        let log = entry.lock();
        Ok(log
            .messages
            .iter()
            .rev()
            .filter(|m| {
                let seq = m.recv.message_seq;
                (start_seq == 0 || seq < start_seq) && seq > end_seq
            })
            .take(limit)
            .cloned()
            .collect())
    }

    fn load_next_range_msgs(
        &self,
        channel_id: &str,
        channel_type: u8,
        start_seq: u32,
        end_seq: u32,
        limit: usize,
    ) -> Result<Vec<Message>> {
        let key = Self::key(channel_id, channel_type);
        let Some(entry) = self.logs.get(&key) else {
            return Ok(vec![]);
        };
        let log = entry.lock();
        Ok(log
            .messages
            .iter()
            .filter(|m| {
                let seq = m.recv.message_seq;
                seq > start_seq && (end_seq == 0 || seq < end_seq)
            })
            .take(limit)
            .cloned()
            .collect())
    }

    fn add_ip_blacklist(&self, ips: &[String]) -> Result<()> {
        let mut set = self.ip_blacklist.lock();
        for ip in ips {
            set.insert(ip.clone());
        }
        Ok(())
    }

    fn remove_ip_blacklist(&self, ips: &[String]) -> Result<()> {
        let mut set = self.ip_blacklist.lock();
        for ip in ips {
            set.remove(ip);
        }
        Ok(())
    }

    fn get_ip_blacklist(&self) -> Result<Vec<String>> {
        let mut v: Vec<String> = self.ip_blacklist.lock().iter().cloned().collect();
        v.sort();
        Ok(v)
    }
}
