//! 服务端聚合根 / The server aggregate.

pub mod closer;
pub mod conn;
pub mod conn_manager;

pub use closer::Closer;
pub use conn::{Conn, ConnState, OutEvent};
pub use conn_manager::ConnManager;

use anyhow::Result;
use dashmap::DashSet;
use parking_lot::RwLock;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

use v_im_proto::{DisconnectPacket, Frame, ReasonCode};

use crate::channel::ChannelRegistry;
use crate::config::Options;
use crate::delivery::{DeliveryEngine, RetryQueue};
use crate::processor::FramePool;
use crate::service::{Datasource, Webhook};
use crate::storage::Store;

/// 消息ID生成器：雪花算法，按节点ID播种，内部自同步
/// Message id generator: snowflake seeded by the node id, internally
/// synchronized with clock-monotonic enforcement.
pub struct MessageIdGen {
    node: snowflake_me::Snowflake,
}

impl MessageIdGen {
    pub fn new(node_id: u16) -> Result<Self> {
        let machine_id = (node_id % 32) as u8;
        let data_center_id = ((node_id >> 5) % 32) as u8;
        let node = snowflake_me::Snowflake::builder()
            .machine_id(&move || Ok(machine_id))
            .data_center_id(&move || Ok(data_center_id))
            .finalize()
            .map_err(|e| anyhow::anyhow!("雪花生成器初始化失败 / snowflake init failed: {:?}", e))?;
        Ok(MessageIdGen { node })
    }

    pub fn next(&self) -> Result<i64> {
        let id = self
            .node
            .next_id()
            .map_err(|e| anyhow::anyhow!("生成消息ID失败 / message id generation failed: {:?}", e))?;
        Ok(id as i64)
    }
}

/// IM服务端：各组件的聚合，帧处理只触达其中的窄缝
/// The IM server: an aggregate of components; the frame pipeline touches
/// only the narrow seams collected here.
pub struct ImServer {
    pub opts: Arc<Options>,
    pub store: Arc<dyn Store>,
    pub datasource: Option<Arc<dyn Datasource>>,
    pub conn_manager: Arc<ConnManager>,
    pub channels: Arc<ChannelRegistry>,
    pub retry: Arc<RetryQueue>,
    pub delivery: Arc<DeliveryEngine>,
    pub webhook: Arc<Webhook>,
    pub closer: Closer,
    pub message_id_gen: MessageIdGen,
    pub frame_pool: FramePool,
    /// 接入层IP黑名单缓存 / cached IP blacklist enforced at accept
    pub ip_blacklist: DashSet<String>,
    /// 系统账号缓存，发送许可直通 / cached system uids, permission bypass
    system_uids: RwLock<HashSet<String>>,
    shutdown_tx: watch::Sender<bool>,
}

impl ImServer {
    /// 组装服务端；须在tokio运行时内调用（closer与后台任务需要）
    /// Assemble the server; must run inside a tokio runtime.
    pub fn new(
        opts: Arc<Options>,
        store: Arc<dyn Store>,
        datasource: Option<Arc<dyn Datasource>>,
    ) -> Result<Arc<ImServer>> {
        let conn_manager = Arc::new(ConnManager::new());
        let webhook = Arc::new(Webhook::new(opts.webhook.clone()));
        let retry = Arc::new(RetryQueue::new(&opts.retry));
        let delivery = Arc::new(DeliveryEngine::new(
            opts.clone(),
            conn_manager.clone(),
            retry.clone(),
            webhook.clone(),
        ));
        let channels = Arc::new(ChannelRegistry::new(opts.clone(), store.clone(), datasource.clone()));
        let closer = Closer::start(conn_manager.clone());
        let message_id_gen = MessageIdGen::new(opts.server.node_id)?;
        let (shutdown_tx, _) = watch::channel(false);

        Ok(Arc::new(ImServer {
            opts,
            store,
            datasource,
            conn_manager,
            channels,
            retry,
            delivery,
            webhook,
            closer,
            message_id_gen,
            frame_pool: FramePool::new(),
            ip_blacklist: DashSet::new(),
            system_uids: RwLock::new(HashSet::new()),
            shutdown_tx,
        }))
    }

    /// 预热：装载IP黑名单与系统账号，并启动后台循环
    /// Warm up caches and start the background loops.
    pub async fn bootstrap(self: &Arc<Self>) {
        match self.store.get_ip_blacklist() {
            Ok(ips) => {
                for ip in ips {
                    self.ip_blacklist.insert(ip);
                }
            }
            Err(e) => warn!("装载IP黑名单失败 / load ip blacklist failed: {}", e),
        }
        if let Some(ds) = &self.datasource {
            match ds.get_system_uids().await {
                Ok(uids) => {
                    *self.system_uids.write() = uids.into_iter().collect();
                    info!("✅ 系统账号已装载 / system uids loaded: {}", self.system_uids.read().len());
                }
                Err(e) => warn!("获取系统账号失败 / get system uids failed: {}", e),
            }
        }
        self.delivery.start_retry_loop(self.shutdown_rx());
        crate::tasks::heartbeat::spawn_cleanup_task(self.clone());
    }

    pub fn shutdown_rx(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    pub fn system_uids_snapshot(&self) -> HashSet<String> {
        self.system_uids.read().clone()
    }

    pub fn is_ip_blacklisted(&self, ip: &str) -> bool {
        self.ip_blacklist.contains(ip)
    }

    pub fn cache_ip_blacklist(&self, ips: &[String]) {
        for ip in ips {
            self.ip_blacklist.insert(ip.clone());
        }
    }

    pub fn uncache_ip_blacklist(&self, ips: &[String]) {
        for ip in ips {
            self.ip_blacklist.remove(ip);
        }
    }

    /// 停机：停收新连接，向所有连接广播服务停止并关闭
    /// Shutdown: stop accepting, broadcast ServerStop and close everything.
    pub async fn shutdown(&self) {
        info!("🛑 服务停机中 / server stopping");
        let _ = self.shutdown_tx.send(true);
        for conn in self.conn_manager.all_conns() {
            let _ = conn.send_frame(Frame::Disconnect(DisconnectPacket {
                reason_code: ReasonCode::ServerStop,
                reason: "server stop".to_string(),
            }));
            conn.close();
        }
    }
}
