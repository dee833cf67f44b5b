//! 帧处理管道 / The frame processing pipeline.
//!
//! 每个连接的待处理帧由至多一个排空任务消费；批内按帧类型的最大连续段
//! 分组后交给各类型处理器，组内顺序即客户端发送顺序。
//! Pending frames are consumed by at most one drain task per connection;
//! inside a batch, maximal same-type runs go to the per-type handlers with
//! client order preserved within each run.

pub mod auth;
pub mod recvack;
pub mod send;
pub mod sub;

use parking_lot::Mutex;
use std::sync::Arc;
use tracing::debug;

use v_im_proto::{Frame, FrameType, RecvackPacket, SendPacket, SubPacket};

use crate::server::conn::Conn;
use crate::server::ImServer;

/// 热路径批缓冲池：归还即清零，引用不得逃逸处理器
/// Hot-path batch buffer pool: buffers are reset on return and references
/// never escape the handlers.
pub struct FramePool {
    send_bufs: Mutex<Vec<Vec<SendPacket>>>,
    recvack_bufs: Mutex<Vec<Vec<RecvackPacket>>>,
    sub_bufs: Mutex<Vec<Vec<SubPacket>>>,
    frame_bufs: Mutex<Vec<Vec<Frame>>>,
}

impl FramePool {
    pub fn new() -> Self {
        FramePool {
            send_bufs: Mutex::new(Vec::new()),
            recvack_bufs: Mutex::new(Vec::new()),
            sub_bufs: Mutex::new(Vec::new()),
            frame_bufs: Mutex::new(Vec::new()),
        }
    }

    pub fn get_send_packets(&self) -> Vec<SendPacket> {
        self.send_bufs.lock().pop().unwrap_or_default()
    }

    pub fn put_send_packets(&self, mut buf: Vec<SendPacket>) {
        buf.clear();
        self.send_bufs.lock().push(buf);
    }

    pub fn get_recvack_packets(&self) -> Vec<RecvackPacket> {
        self.recvack_bufs.lock().pop().unwrap_or_default()
    }

    pub fn put_recvack_packets(&self, mut buf: Vec<RecvackPacket>) {
        buf.clear();
        self.recvack_bufs.lock().push(buf);
    }

    pub fn get_sub_packets(&self) -> Vec<SubPacket> {
        self.sub_bufs.lock().pop().unwrap_or_default()
    }

    pub fn put_sub_packets(&self, mut buf: Vec<SubPacket>) {
        buf.clear();
        self.sub_bufs.lock().push(buf);
    }

    pub fn get_frames(&self) -> Vec<Frame> {
        self.frame_bufs.lock().pop().unwrap_or_default()
    }

    pub fn put_frames(&self, mut buf: Vec<Frame>) {
        buf.clear();
        self.frame_bufs.lock().push(buf);
    }
}

impl Default for FramePool {
    fn default() -> Self {
        FramePool::new()
    }
}

/// 帧按类型分组：保持组内顺序的最大连续段
/// Group frames into maximal runs of the same type, order preserved.
pub fn group_frames(frames: Vec<Frame>) -> Vec<(FrameType, Vec<Frame>)> {
    let mut groups: Vec<(FrameType, Vec<Frame>)> = Vec::new();
    for frame in frames {
        let frame_type = frame.frame_type();
        match groups.last_mut() {
            Some((last_type, run)) if *last_type == frame_type => run.push(frame),
            _ => groups.push((frame_type, vec![frame])),
        }
    }
    groups
}

/// 连接排空任务：换出全部待处理帧并分发，直到队列清空
/// Drain task for one connection: swap out pending frames and dispatch
/// until the queue goes empty.
pub async fn drain(server: Arc<ImServer>, conn: Arc<Conn>) {
    loop {
        let frames = conn.pop_frames();
        if !frames.is_empty() {
            process_frames(&server, &conn, frames).await;
        }
        if !conn.finish_frames() {
            break;
        }
    }
}

pub async fn process_frames(server: &Arc<ImServer>, conn: &Arc<Conn>, frames: Vec<Frame>) {
    for (frame_type, group) in group_frames(frames) {
        process_same_frames(server, conn, frame_type, group).await;
    }
}

async fn process_same_frames(
    server: &Arc<ImServer>,
    conn: &Arc<Conn>,
    frame_type: FrameType,
    frames: Vec<Frame>,
) {
    match frame_type {
        FrameType::Ping => {
            debug!("🏓 ping: conn={}", conn.id);
            conn.touch();
            let _ = conn.send_frame(Frame::Pong);
        }
        FrameType::Send => {
            let mut batch = server.frame_pool.get_send_packets();
            for frame in frames {
                if let Frame::Send(packet) = frame {
                    batch.push(packet);
                }
            }
            send::process_msgs(server, conn, &batch).await;
            server.frame_pool.put_send_packets(batch);
        }
        FrameType::Recvack => {
            let mut batch = server.frame_pool.get_recvack_packets();
            for frame in frames {
                if let Frame::Recvack(packet) = frame {
                    batch.push(packet);
                }
            }
            recvack::process_recvacks(server, conn, &batch);
            server.frame_pool.put_recvack_packets(batch);
        }
        FrameType::Sub => {
            let mut batch = server.frame_pool.get_sub_packets();
            for frame in frames {
                if let Frame::Sub(packet) = frame {
                    batch.push(packet);
                }
            }
            sub::process_subs(server, conn, &batch).await;
            server.frame_pool.put_sub_packets(batch);
        }
        // CONNECT在认证前单独处理，其余未知类型忽略
        // CONNECT is handled pre-auth; anything else is ignored
        _ => {}
    }
}

/// 连接关闭的收尾：索引清理、订阅拆除、离线webhook
/// Teardown on close: index removal, subscription teardown, offline webhook.
pub fn process_close(server: &Arc<ImServer>, conn_id: u64) {
    let Some(conn) = server.conn_manager.remove_conn(conn_id) else {
        return;
    };
    let state = conn.state();
    debug!("👋 连接关闭 / connection closed: conn={} uid={}", conn_id, state.uid);
    if !state.authed {
        return;
    }
    for (channel_id, channel_type) in conn.subscriptions_snapshot() {
        if server.conn_manager.exist_conns_with_uid(&state.uid) {
            continue;
        }
        if let Some(channel) = server.channels.get_cached(&channel_id, channel_type) {
            channel.remove_subscriber(&state.uid);
            if channel.subscriber_count() == 0 {
                server.channels.remove_data_channel(&channel_id, channel_type);
            }
        }
    }
    let (online_count, total_online_count) =
        server.conn_manager.count_with(&state.uid, state.device_flag);
    server
        .webhook
        .offline(&state.uid, state.device_flag, conn_id, online_count, total_online_count);
}
