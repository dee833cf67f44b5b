use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

use v_im_proto::{device_level, Frame};

/// 写端事件 / Events consumed by the per-connection writer task.
#[derive(Debug)]
pub enum OutEvent {
    Frame(Frame),
    Close,
}

/// 连接可变状态：认证后填充的类型化记录
/// Mutable connection state: a typed record filled in at auth time.
#[derive(Debug, Clone)]
pub struct ConnState {
    pub uid: String,
    pub device_flag: u8,
    pub device_id: String,
    pub device_level: u8,
    pub proto_version: u8,
    pub authed: bool,
    pub aes_key: String,
    pub aes_iv: String,
    pub max_idle: Duration,
}

impl Default for ConnState {
    fn default() -> Self {
        ConnState {
            uid: String::new(),
            device_flag: 0,
            device_id: String::new(),
            device_level: device_level::SLAVE,
            proto_version: 0,
            authed: false,
            aes_key: String::new(),
            aes_iv: String::new(),
            max_idle: Duration::from_secs(90),
        }
    }
}

type SubscriptionParams = HashMap<String, serde_json::Value>;

/// 一条客户端连接 / One client connection.
///
/// 解码侧向 `pending` 追加帧；`scheduled` 保证同一连接同时至多一个
/// 排空任务在跑，单连接帧序得以保持。
/// The decoder appends to `pending`; `scheduled` guarantees at most one
/// drain task per connection, preserving per-connection frame order.
pub struct Conn {
    pub id: u64,
    pub remote_addr: SocketAddr,
    out_tx: mpsc::UnboundedSender<OutEvent>,
    state: RwLock<ConnState>,
    pending: Mutex<Vec<Frame>>,
    scheduled: AtomicBool,
    closed: AtomicBool,
    closed_notify: tokio::sync::Notify,
    subscriptions: Mutex<HashMap<(String, u8), SubscriptionParams>>,
    last_activity: Mutex<Instant>,
}

impl Conn {
    pub fn new(id: u64, remote_addr: SocketAddr, out_tx: mpsc::UnboundedSender<OutEvent>) -> Self {
        Conn {
            id,
            remote_addr,
            out_tx,
            state: RwLock::new(ConnState::default()),
            pending: Mutex::new(Vec::new()),
            scheduled: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            closed_notify: tokio::sync::Notify::new(),
            subscriptions: Mutex::new(HashMap::new()),
            last_activity: Mutex::new(Instant::now()),
        }
    }

    // -------- 出站 / outbound --------

    /// 发送一帧（入写端队列，非阻塞） / Enqueue one frame for the writer task.
    pub fn send_frame(&self, frame: Frame) -> anyhow::Result<()> {
        self.out_tx
            .send(OutEvent::Frame(frame))
            .map_err(|_| anyhow::anyhow!("connection {} writer gone", self.id))
    }

    /// 请求关闭连接 / Ask the writer task to close the socket.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            let _ = self.out_tx.send(OutEvent::Close);
            // notify_one留存permit，读端晚到也能收到 / the permit survives a late waiter
            self.closed_notify.notify_one();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// 等待关闭信号（读端循环用） / Await the close signal (reader loops).
    pub async fn wait_close(&self) {
        if self.is_closed() {
            return;
        }
        self.closed_notify.notified().await;
    }

    // -------- 状态 / state --------

    pub fn state(&self) -> ConnState {
        self.state.read().clone()
    }

    pub fn set_state(&self, state: ConnState) {
        *self.state.write() = state;
    }

    pub fn authed(&self) -> bool {
        self.state.read().authed
    }

    pub fn uid(&self) -> String {
        self.state.read().uid.clone()
    }

    pub fn device_id(&self) -> String {
        self.state.read().device_id.clone()
    }

    pub fn device_flag(&self) -> u8 {
        self.state.read().device_flag
    }

    pub fn device_level(&self) -> u8 {
        self.state.read().device_level
    }

    pub fn max_idle(&self) -> Duration {
        self.state.read().max_idle
    }

    /// 会话加密参数 / Session crypto parameters (aesKey, aesIV).
    pub fn aes_params(&self) -> (String, String) {
        let state = self.state.read();
        (state.aes_key.clone(), state.aes_iv.clone())
    }

    // -------- 活跃度 / liveness --------

    pub fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity.lock().elapsed()
    }

    // -------- 待处理帧队列 / pending frame queue --------

    pub fn push_frames(&self, frames: Vec<Frame>) {
        self.pending.lock().extend(frames);
    }

    /// 尝试占据排空权 / Try to claim the (single) drain slot.
    pub fn try_schedule(&self) -> bool {
        !self.scheduled.swap(true, Ordering::AcqRel)
    }

    /// 原子换出全部待处理帧 / Atomically swap out all pending frames.
    pub fn pop_frames(&self) -> Vec<Frame> {
        std::mem::take(&mut *self.pending.lock())
    }

    /// 批处理完成：让出排空权；若期间又有新帧且再次占得，返回true继续
    /// Batch done: release the slot; returns true when more frames arrived
    /// and this caller reclaimed the slot, so it should drain again.
    pub fn finish_frames(&self) -> bool {
        self.scheduled.store(false, Ordering::Release);
        if !self.pending.lock().is_empty() && self.try_schedule() {
            return true;
        }
        false
    }

    // -------- 订阅记录 / subscription records --------

    pub fn subscribe_channel(&self, channel_id: &str, channel_type: u8, params: SubscriptionParams) {
        self.subscriptions
            .lock()
            .insert((channel_id.to_string(), channel_type), params);
    }

    pub fn unsubscribe_channel(&self, channel_id: &str, channel_type: u8) {
        self.subscriptions
            .lock()
            .remove(&(channel_id.to_string(), channel_type));
    }

    pub fn subscriptions_snapshot(&self) -> Vec<(String, u8)> {
        self.subscriptions.lock().keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conn() -> (Conn, mpsc::UnboundedReceiver<OutEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Conn::new(1, "127.0.0.1:9".parse().expect("addr"), tx), rx)
    }

    #[test]
    fn single_drain_slot() {
        let (conn, _rx) = conn();
        conn.push_frames(vec![Frame::Ping]);
        assert!(conn.try_schedule());
        assert!(!conn.try_schedule(), "second drain must not be scheduled");
        let frames = conn.pop_frames();
        assert_eq!(frames.len(), 1);
        assert!(!conn.finish_frames(), "queue empty, no re-drain");
        assert!(conn.try_schedule(), "slot released after finish");
    }

    #[test]
    fn finish_reclaims_when_frames_arrived_mid_drain() {
        let (conn, _rx) = conn();
        conn.push_frames(vec![Frame::Ping]);
        assert!(conn.try_schedule());
        conn.pop_frames();
        // 排空期间又到一帧 / another frame lands mid-drain
        conn.push_frames(vec![Frame::Ping]);
        assert!(conn.finish_frames(), "must reclaim and signal another round");
        assert!(!conn.try_schedule());
    }

    #[test]
    fn close_is_idempotent() {
        let (conn, mut rx) = conn();
        conn.close();
        conn.close();
        assert!(matches!(rx.try_recv(), Ok(OutEvent::Close)));
        assert!(rx.try_recv().is_err(), "only one close event");
    }
}
