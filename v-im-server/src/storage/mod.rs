//! 存储适配层 / Store adapter over the persistent backend.
//!
//! 核心只依赖 [`Store`] 这一窄接口；进程内缺省实现为 [`MemoryStore`]，
//! 生产部署将该trait绑定到外部后端。
//! The core consumes only the narrow [`Store`] trait; [`MemoryStore`] is the
//! in-process default, production binds the trait to an external backend.

pub mod memory;
pub mod traits;

pub use memory::MemoryStore;
pub use traits::Store;

/// 频道描述 / Persisted channel descriptor.
#[derive(Clone, Debug, Default, serde::Serialize, serde::Deserialize)]
pub struct ChannelInfo {
    pub channel_id: String,
    pub channel_type: u8,
    /// 封禁后整频道禁止收发 / banned channels refuse all traffic
    pub ban: bool,
    /// 大群标记 / large-channel hint
    pub large: bool,
}

impl ChannelInfo {
    pub fn new(channel_id: impl Into<String>, channel_type: u8) -> Self {
        ChannelInfo { channel_id: channel_id.into(), channel_type, ban: false, large: false }
    }
}

/// 流式消息分片 / One item of a streaming message.
#[derive(Clone, Debug, Default)]
pub struct StreamItem {
    pub client_msg_no: String,
    pub blob: Vec<u8>,
}
