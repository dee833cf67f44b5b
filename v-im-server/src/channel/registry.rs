use anyhow::Result;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::{debug, warn};

use v_im_proto::channel_type;

use super::Channel;
use crate::config::Options;
use crate::domain::person_channel_peers;
use crate::service::Datasource;
use crate::storage::{ChannelInfo, Store};

type ChannelKey = (String, u8);

/// 频道注册表：并发缓存加按键single-flight装载
/// Channel registry: concurrent cache with per-key single-flight loading.
///
/// 装载顺序：store -> 数据源（启用且store为空时）。缓存仅对临时订阅者有权威。
/// Loader order: store -> datasource (when enabled and the store came back
/// empty). The cache is authoritative only for tmp subscribers.
pub struct ChannelRegistry {
    opts: Arc<Options>,
    store: Arc<dyn Store>,
    datasource: Option<Arc<dyn Datasource>>,
    channels: DashMap<ChannelKey, Arc<Channel>>,
    loader_locks: DashMap<ChannelKey, Arc<tokio::sync::Mutex<()>>>,
}

impl ChannelRegistry {
    pub fn new(
        opts: Arc<Options>,
        store: Arc<dyn Store>,
        datasource: Option<Arc<dyn Datasource>>,
    ) -> Self {
        ChannelRegistry {
            opts,
            store,
            datasource,
            channels: DashMap::new(),
            loader_locks: DashMap::new(),
        }
    }

    /// 取频道；未缓存则物化，个人与数据频道按需创建
    /// Get a channel, materializing on miss; person and data channels are
    /// created on demand, other types must exist in store or datasource.
    pub async fn get(&self, channel_id: &str, channel_type_: u8) -> Result<Option<Arc<Channel>>> {
        let key = (channel_id.to_string(), channel_type_);
        if let Some(channel) = self.channels.get(&key) {
            return Ok(Some(channel.value().clone()));
        }

        // 同键只允许一个装载在途 / at most one materialization in flight per key
        let lock = self
            .loader_locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .value()
            .clone();
        let _guard = lock.lock().await;
        if let Some(channel) = self.channels.get(&key) {
            return Ok(Some(channel.value().clone()));
        }

        let loaded = self.load(channel_id, channel_type_).await?;
        if let Some(channel) = &loaded {
            self.channels.insert(key.clone(), channel.clone());
        }
        self.loader_locks.remove(&key);
        Ok(loaded)
    }

    async fn load(&self, channel_id: &str, channel_type_: u8) -> Result<Option<Arc<Channel>>> {
        let mut info = self.store.get_channel(channel_id, channel_type_)?;
        if info.is_none() {
            if let Some(ds) = &self.datasource {
                match ds.get_channel_info(channel_id, channel_type_).await {
                    Ok(found) => info = found,
                    Err(e) => {
                        warn!("数据源获取频道信息失败 / datasource channel info failed: {}", e)
                    }
                }
            }
        }
        let info = match info {
            Some(info) => info,
            None => {
                // 个人与数据频道按需物化，其余视为不存在
                // person and data channels materialize on demand
                if channel_type_ == channel_type::PERSON || channel_type_ == channel_type::DATA {
                    ChannelInfo::new(channel_id, channel_type_)
                } else {
                    return Ok(None);
                }
            }
        };

        let channel = Arc::new(Channel::new(info));
        if channel_type_ == channel_type::DATA {
            // 数据频道成员只存在于内存 / data-channel membership lives in memory only
            return Ok(Some(channel));
        }

        let mut subscribers = self.store.get_subscribers(channel_id, channel_type_)?;
        if subscribers.is_empty() {
            if let Some(ds) = &self.datasource {
                subscribers = ds.get_subscribers(channel_id, channel_type_).await.unwrap_or_default();
            }
        }
        if channel_type_ == channel_type::PERSON {
            for peer in person_channel_peers(channel_id, &self.opts.channel.fake_delimiter) {
                if !subscribers.contains(&peer) {
                    subscribers.push(peer);
                }
            }
        }
        channel.set_subscribers(subscribers);

        let mut denylist = self.store.get_denylist(channel_id, channel_type_)?;
        if denylist.is_empty() {
            if let Some(ds) = &self.datasource {
                denylist = ds.get_blacklist(channel_id, channel_type_).await.unwrap_or_default();
            }
        }
        channel.set_denylist(denylist);

        let mut allowlist = self.store.get_allowlist(channel_id, channel_type_)?;
        if allowlist.is_empty() {
            if let Some(ds) = &self.datasource {
                allowlist = ds.get_whitelist(channel_id, channel_type_).await.unwrap_or_default();
            }
        }
        channel.set_allowlist(allowlist);

        debug!(
            "📦 频道已物化 / channel materialized: {}({})",
            channel_id, channel_type_
        );
        Ok(Some(channel))
    }

    /// 仅取缓存 / Cached lookup only, no materialization.
    pub fn get_cached(&self, channel_id: &str, channel_type_: u8) -> Option<Arc<Channel>> {
        self.channels
            .get(&(channel_id.to_string(), channel_type_))
            .map(|c| c.value().clone())
    }

    /// 管理面变更：已缓存则就地变更，冷缓存即无事
    /// Admin mutation hook: mutate in place when cached, a cold cache is a no-op.
    pub fn mutate_cached<F: FnOnce(&Arc<Channel>)>(&self, channel_id: &str, channel_type_: u8, f: F) {
        if let Some(channel) = self.get_cached(channel_id, channel_type_) {
            f(&channel);
        }
    }

    /// 驱逐缓存 / Evict from the cache.
    pub fn evict(&self, channel_id: &str, channel_type_: u8) {
        self.channels.remove(&(channel_id.to_string(), channel_type_));
    }

    /// 空数据频道驱逐 / Drop an emptied data channel.
    pub fn remove_data_channel(&self, channel_id: &str, channel_type_: u8) {
        if channel_type_ == channel_type::DATA {
            self.evict(channel_id, channel_type_);
            debug!("🧹 空数据频道已驱逐 / empty data channel evicted: {}", channel_id);
        }
    }

    pub fn cached_len(&self) -> usize {
        self.channels.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;

    fn registry() -> (ChannelRegistry, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let registry = ChannelRegistry::new(Arc::new(Options::default()), store.clone(), None);
        (registry, store)
    }

    #[tokio::test]
    async fn unknown_group_channel_is_none() {
        let (registry, _) = registry();
        assert!(registry
            .get("nope", channel_type::GROUP)
            .await
            .expect("get")
            .is_none());
    }

    #[tokio::test]
    async fn person_channel_materializes_with_peers() {
        let (registry, _) = registry();
        let channel = registry
            .get("alice@bob", channel_type::PERSON)
            .await
            .expect("get")
            .expect("channel");
        assert!(channel.is_subscriber("alice"));
        assert!(channel.is_subscriber("bob"));
    }

    #[tokio::test]
    async fn store_membership_is_loaded_once() {
        let (registry, store) = registry();
        store
            .add_or_update_channel(&ChannelInfo::new("grp", channel_type::GROUP))
            .expect("channel");
        store
            .add_subscribers("grp", channel_type::GROUP, &["alice".to_string()])
            .expect("subs");
        store
            .add_denylist("grp", channel_type::GROUP, &["evil".to_string()])
            .expect("deny");

        let channel = registry
            .get("grp", channel_type::GROUP)
            .await
            .expect("get")
            .expect("channel");
        assert!(channel.is_subscriber("alice"));
        assert_eq!(
            channel.has_permission("evil", &Default::default()),
            v_im_proto::ReasonCode::InBlacklist
        );
        // 二次获取走缓存，同一对象 / second get hits the cache, same object
        let again = registry
            .get("grp", channel_type::GROUP)
            .await
            .expect("get")
            .expect("channel");
        assert!(Arc::ptr_eq(&channel, &again));
    }

    #[tokio::test]
    async fn eviction_forces_reload() {
        let (registry, store) = registry();
        store
            .add_or_update_channel(&ChannelInfo::new("grp", channel_type::GROUP))
            .expect("channel");
        let first = registry
            .get("grp", channel_type::GROUP)
            .await
            .expect("get")
            .expect("channel");
        registry.evict("grp", channel_type::GROUP);
        let second = registry
            .get("grp", channel_type::GROUP)
            .await
            .expect("get")
            .expect("channel");
        assert!(!Arc::ptr_eq(&first, &second));
    }
}
