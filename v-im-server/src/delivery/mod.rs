//! 投递引擎 / Delivery engine: fan-out and at-least-once retry.

pub mod retry;

pub use retry::{RetryEntry, RetryQueue};

use anyhow::Result;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, warn};

use v_im_proto::{crypto, Frame};

use crate::channel::Channel;
use crate::config::Options;
use crate::domain::Message;
use crate::server::conn::Conn;
use crate::server::conn_manager::ConnManager;
use crate::service::Webhook;

/// 投递引擎：把已入库的消息扇出给接收方连接，并驱动重试
/// Fans ingested messages out to recipient connections and drives retries.
pub struct DeliveryEngine {
    opts: Arc<Options>,
    conn_manager: Arc<ConnManager>,
    retry: Arc<RetryQueue>,
    webhook: Arc<Webhook>,
}

impl DeliveryEngine {
    pub fn new(
        opts: Arc<Options>,
        conn_manager: Arc<ConnManager>,
        retry: Arc<RetryQueue>,
        webhook: Arc<Webhook>,
    ) -> Self {
        DeliveryEngine { opts, conn_manager, retry, webhook }
    }

    /// 频道消息扇出：接收方为频道成员，跳过发送设备本身
    /// Fan out channel messages to members, skipping the sending device.
    ///
    /// 持久消息按 (uid, deviceId) 进入重试队列，直到 recvack 或超限。
    /// Persistent deliveries are tracked per (uid, deviceId) until acked
    /// or the retry budget is exhausted.
    pub fn fanout(
        &self,
        channel: &Channel,
        messages: &[Message],
        from_uid: &str,
        _from_device_flag: u8,
        from_device_id: &str,
    ) -> Result<()> {
        let recipients = channel.recipient_uids(&self.opts.channel.fake_delimiter);
        for uid in recipients {
            for conn in self.conn_manager.conns_by_uid(&uid) {
                if !conn.authed() {
                    continue;
                }
                // 不回投给发送设备 / never echo back to the sending device
                if conn.uid() == from_uid && conn.device_id() == from_device_id {
                    continue;
                }
                for message in messages {
                    if self.deliver_to_conn(&conn, message) && !message.recv.framer.no_persist {
                        self.retry.schedule(RetryEntry {
                            uid: uid.clone(),
                            device_id: conn.device_id(),
                            message_id: message.recv.message_id,
                            send_count: 1,
                            message: message.clone(),
                        });
                    }
                }
            }
        }
        Ok(())
    }

    /// 对单个连接投递：载荷按其会话密钥重加密
    /// Deliver to one connection, re-encrypting with its session key.
    pub fn deliver_to_conn(&self, conn: &Arc<Conn>, message: &Message) -> bool {
        let (aes_key, aes_iv) = conn.aes_params();
        let cipher = match crypto::aes_encrypt_b64(&message.recv.payload, &aes_key, &aes_iv) {
            Ok(cipher) => cipher,
            Err(e) => {
                warn!(
                    "载荷加密失败 / payload encryption failed: conn={} err={}",
                    conn.id, e
                );
                return false;
            }
        };
        let mut recv = message.recv.clone();
        recv.payload = cipher.into_bytes();
        conn.send_frame(Frame::Recv(recv)).is_ok()
    }

    /// 启动时间轮驱动循环 / Start the wheel-driven retry loop.
    pub fn start_retry_loop(self: &Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) {
        let engine = self.clone();
        tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval(std::time::Duration::from_millis(engine.retry.tick_ms));
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        for entry in engine.retry.advance() {
                            engine.handle_expired(entry);
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
        });
    }

    fn handle_expired(&self, entry: RetryEntry) {
        if entry.send_count >= self.retry.max_retry() {
            debug!(
                "♻️ 重试超限丢弃 / retry budget exhausted: uid={} device={} message_id={} sends={}",
                entry.uid, entry.device_id, entry.message_id, entry.send_count
            );
            self.webhook
                .retry_exceeded(&entry.uid, &entry.device_id, entry.message_id, entry.send_count);
            return;
        }
        // 重投给匹配的在线连接（可能是重连后的新连接）
        // redispatch to any live connection matching the recipient
        for conn in self.conn_manager.conns_by_uid(&entry.uid) {
            if conn.device_id() == entry.device_id && conn.authed() {
                self.deliver_to_conn(&conn, &entry.message);
            }
        }
        self.retry.schedule(RetryEntry { send_count: entry.send_count + 1, ..entry });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryConfig;
    use crate::server::conn::{ConnState, OutEvent};
    use crate::storage::ChannelInfo;
    use tokio::sync::mpsc;
    use v_im_proto::channel_type;

    fn engine() -> (Arc<DeliveryEngine>, Arc<ConnManager>, Arc<RetryQueue>) {
        let opts = Arc::new(Options::default());
        let conn_manager = Arc::new(ConnManager::new());
        let retry = Arc::new(RetryQueue::new(&RetryConfig {
            interval_ms: 20,
            max_count: 3,
            wheel_size: 4,
            tick_ms: 10,
        }));
        let webhook = Arc::new(Webhook::new(opts.webhook.clone()));
        let engine = Arc::new(DeliveryEngine::new(
            opts,
            conn_manager.clone(),
            retry.clone(),
            webhook,
        ));
        (engine, conn_manager, retry)
    }

    fn authed_conn(
        manager: &ConnManager,
        uid: &str,
        device_id: &str,
    ) -> (Arc<Conn>, mpsc::UnboundedReceiver<OutEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let conn = Arc::new(Conn::new(
            manager.next_conn_id(),
            "127.0.0.1:9".parse().expect("addr"),
            tx,
        ));
        conn.set_state(ConnState {
            uid: uid.to_string(),
            device_id: device_id.to_string(),
            device_flag: 1,
            authed: true,
            aes_key: "0123456789abcdef".to_string(),
            aes_iv: "fedcba9876543210".to_string(),
            ..Default::default()
        });
        manager.register(conn.clone());
        manager.index_uid(&conn);
        (conn, rx)
    }

    fn message(id: i64, payload: &[u8]) -> Message {
        let mut m = Message::default();
        m.recv.message_id = id;
        m.recv.message_seq = 1;
        m.recv.channel_id = "grp".to_string();
        m.recv.channel_type = channel_type::GROUP;
        m.recv.from_uid = "alice".to_string();
        m.recv.payload = payload.to_vec();
        m
    }

    #[tokio::test]
    async fn fanout_skips_sender_device_and_encrypts() {
        let (engine, manager, retry) = engine();
        let (_sender, mut sender_rx) = authed_conn(&manager, "alice", "d1");
        let (_peer, mut peer_rx) = authed_conn(&manager, "bob", "d2");

        let channel = Channel::new(ChannelInfo::new("grp", channel_type::GROUP));
        channel.add_subscribers(&["alice".to_string(), "bob".to_string()]);

        let msg = message(7, b"hello");
        engine
            .fanout(&channel, &[msg], "alice", 1, "d1")
            .expect("fanout");

        assert!(sender_rx.try_recv().is_err(), "sender device must not get an echo");
        match peer_rx.try_recv() {
            Ok(OutEvent::Frame(Frame::Recv(recv))) => {
                assert_eq!(recv.message_id, 7);
                let plain = crypto::aes_decrypt_b64(
                    std::str::from_utf8(&recv.payload).expect("utf8"),
                    "0123456789abcdef",
                    "fedcba9876543210",
                )
                .expect("decrypt");
                assert_eq!(plain, b"hello");
            }
            other => panic!("expected recv frame, got {:?}", other),
        }
        // 持久投递进入重试队列 / persistent delivery is tracked
        assert_eq!(retry.len(), 1);
    }

    #[tokio::test]
    async fn sender_other_devices_receive_too() {
        let (engine, manager, _retry) = engine();
        let (_d1, mut d1_rx) = authed_conn(&manager, "alice", "d1");
        let (_d2, mut d2_rx) = authed_conn(&manager, "alice", "d2");

        let channel = Channel::new(ChannelInfo::new("alice@bob", channel_type::PERSON));
        engine
            .fanout(&channel, &[message(1, b"hi")], "alice", 1, "d1")
            .expect("fanout");

        assert!(d1_rx.try_recv().is_err());
        assert!(matches!(d2_rx.try_recv(), Ok(OutEvent::Frame(Frame::Recv(_)))));
    }

    #[tokio::test]
    async fn no_persist_messages_skip_retry_tracking() {
        let (engine, manager, retry) = engine();
        let (_peer, mut peer_rx) = authed_conn(&manager, "bob", "d2");
        let channel = Channel::new(ChannelInfo::new("grp", channel_type::GROUP));
        channel.add_subscriber("bob");

        let mut msg = message(9, b"transient");
        msg.recv.framer.no_persist = true;
        engine
            .fanout(&channel, &[msg], "alice", 1, "d1")
            .expect("fanout");

        assert!(matches!(peer_rx.try_recv(), Ok(OutEvent::Frame(Frame::Recv(_)))));
        assert!(retry.is_empty());
    }

    #[tokio::test]
    async fn expired_entry_is_redelivered_until_acked() {
        let (engine, manager, retry) = engine();
        let (_peer, mut peer_rx) = authed_conn(&manager, "bob", "d2");
        let channel = Channel::new(ChannelInfo::new("grp", channel_type::GROUP));
        channel.add_subscriber("bob");

        engine
            .fanout(&channel, &[message(11, b"again")], "alice", 1, "d1")
            .expect("fanout");
        assert!(matches!(peer_rx.try_recv(), Ok(OutEvent::Frame(Frame::Recv(_)))));

        // 到期一次：重投并重新登记 / one expiry: redeliver and reschedule
        retry.advance();
        for entry in retry.advance() {
            engine.handle_expired(entry);
        }
        assert!(matches!(peer_rx.try_recv(), Ok(OutEvent::Frame(Frame::Recv(_)))));
        assert_eq!(retry.len(), 1);

        // 确认后不再重投 / after the ack no further redelivery
        assert!(retry.finish("bob", "d2", 11));
        retry.advance();
        for entry in retry.advance() {
            engine.handle_expired(entry);
        }
        assert!(peer_rx.try_recv().is_err());
    }
}
