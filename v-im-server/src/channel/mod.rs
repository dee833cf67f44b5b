//! 频道对象与注册表 / Channel object and registry.

pub mod registry;

pub use registry::ChannelRegistry;

use parking_lot::RwLock;
use std::collections::HashSet;

use v_im_proto::{channel_type, ReasonCode};

use crate::delivery::DeliveryEngine;
use crate::domain::{person_channel_peers, Message};
use crate::storage::ChannelInfo;

/// 频道：缓存的成员关系加许可判定
/// A channel: cached membership containers plus permission evaluation.
///
/// 四个集合各自加锁；组合判定不取跨集合锁，并发编辑下为最后写入生效。
/// Each set is individually locked; composite checks take no cross-set lock,
/// racing edits are last-writer-wins.
pub struct Channel {
    pub channel_id: String,
    pub channel_type: u8,
    info: RwLock<ChannelInfo>,
    subscribers: RwLock<HashSet<String>>,
    tmp_subscribers: RwLock<HashSet<String>>,
    allowlist: RwLock<HashSet<String>>,
    denylist: RwLock<HashSet<String>>,
}

impl Channel {
    pub fn new(info: ChannelInfo) -> Self {
        Channel {
            channel_id: info.channel_id.clone(),
            channel_type: info.channel_type,
            info: RwLock::new(info),
            subscribers: RwLock::new(HashSet::new()),
            tmp_subscribers: RwLock::new(HashSet::new()),
            allowlist: RwLock::new(HashSet::new()),
            denylist: RwLock::new(HashSet::new()),
        }
    }

    pub fn info(&self) -> ChannelInfo {
        self.info.read().clone()
    }

    pub fn set_info(&self, info: ChannelInfo) {
        *self.info.write() = info;
    }

    pub fn large(&self) -> bool {
        self.info.read().large
    }

    // -------- 订阅者 / subscribers --------

    pub fn add_subscriber(&self, uid: &str) {
        self.subscribers.write().insert(uid.to_string());
    }

    pub fn add_subscribers(&self, uids: &[String]) {
        let mut set = self.subscribers.write();
        for uid in uids {
            set.insert(uid.clone());
        }
    }

    pub fn remove_subscriber(&self, uid: &str) {
        self.subscribers.write().remove(uid);
    }

    pub fn remove_subscribers(&self, uids: &[String]) {
        let mut set = self.subscribers.write();
        for uid in uids {
            set.remove(uid);
        }
    }

    pub fn remove_all_subscriber(&self) {
        self.subscribers.write().clear();
    }

    pub fn set_subscribers(&self, uids: Vec<String>) {
        *self.subscribers.write() = uids.into_iter().collect();
    }

    pub fn is_subscriber(&self, uid: &str) -> bool {
        self.subscribers.read().contains(uid)
    }

    pub fn get_all_subscribers(&self) -> Vec<String> {
        self.subscribers.read().iter().cloned().collect()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }

    // -------- 临时订阅者（仅内存） / tmp subscribers (memory only) --------

    pub fn add_tmp_subscribers(&self, uids: &[String]) {
        let mut set = self.tmp_subscribers.write();
        for uid in uids {
            set.insert(uid.clone());
        }
    }

    pub fn remove_tmp_subscribers(&self, uids: &[String]) {
        let mut set = self.tmp_subscribers.write();
        for uid in uids {
            set.remove(uid);
        }
    }

    pub fn remove_all_tmp_subscriber(&self) {
        self.tmp_subscribers.write().clear();
    }

    pub fn is_tmp_subscriber(&self, uid: &str) -> bool {
        self.tmp_subscribers.read().contains(uid)
    }

    // -------- 白名单 / allowlist --------

    pub fn add_allowlist(&self, uids: &[String]) {
        let mut set = self.allowlist.write();
        for uid in uids {
            set.insert(uid.clone());
        }
    }

    pub fn remove_allowlist(&self, uids: &[String]) {
        let mut set = self.allowlist.write();
        for uid in uids {
            set.remove(uid);
        }
    }

    pub fn set_allowlist(&self, uids: Vec<String>) {
        *self.allowlist.write() = uids.into_iter().collect();
    }

    pub fn get_allowlist(&self) -> Vec<String> {
        self.allowlist.read().iter().cloned().collect()
    }

    // -------- 黑名单 / denylist --------

    pub fn add_denylist(&self, uids: &[String]) {
        let mut set = self.denylist.write();
        for uid in uids {
            set.insert(uid.clone());
        }
    }

    pub fn remove_denylist(&self, uids: &[String]) {
        let mut set = self.denylist.write();
        for uid in uids {
            set.remove(uid);
        }
    }

    pub fn set_denylist(&self, uids: Vec<String>) {
        *self.denylist.write() = uids.into_iter().collect();
    }

    // -------- 许可 / permission --------

    /// 发送许可判定 / Evaluate send permission for `from_uid`.
    ///
    /// 客服频道直通；系统账号直通；白名单非空则须在名单内；黑名单一票否决；
    /// 群组类频道还须为（临时）订阅者。
    pub fn has_permission(&self, from_uid: &str, system_uids: &HashSet<String>) -> ReasonCode {
        if self.channel_type == channel_type::CUSTOMER_SERVICE {
            return ReasonCode::Success;
        }
        if system_uids.contains(from_uid) {
            return ReasonCode::Success;
        }
        {
            let allowlist = self.allowlist.read();
            if !allowlist.is_empty() && !allowlist.contains(from_uid) {
                return ReasonCode::NotAllowSend;
            }
        }
        if self.denylist.read().contains(from_uid) {
            return ReasonCode::InBlacklist;
        }
        if channel_type::is_group_like(self.channel_type)
            && !self.is_subscriber(from_uid)
            && !self.is_tmp_subscriber(from_uid)
        {
            return ReasonCode::SubscriberNotExist;
        }
        ReasonCode::Success
    }

    /// 消息的接收方uid集合 / Recipient uids for messages in this channel.
    ///
    /// 个人频道为规范键上的两个参与者，其余为订阅者并临时订阅者。
    pub fn recipient_uids(&self, fake_delimiter: &str) -> Vec<String> {
        if self.channel_type == channel_type::PERSON {
            return person_channel_peers(&self.channel_id, fake_delimiter);
        }
        let mut uids: HashSet<String> = self.subscribers.read().iter().cloned().collect();
        uids.extend(self.tmp_subscribers.read().iter().cloned());
        uids.into_iter().collect()
    }

    /// 消息进入频道：交给投递引擎扇出
    /// Put ingested messages into the channel: hand them to the delivery engine.
    pub fn put(
        &self,
        delivery: &DeliveryEngine,
        messages: &[Message],
        from_uid: &str,
        from_device_flag: u8,
        from_device_id: &str,
    ) -> anyhow::Result<()> {
        delivery.fanout(self, messages, from_uid, from_device_flag, from_device_id)
    }
}
