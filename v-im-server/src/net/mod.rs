//! 接入层：TCP与WebSocket共用同一条帧管道
//! Transport layer: TCP and WebSocket feed the same frame pipeline.

pub mod tcp;
pub mod ws;

use std::sync::Arc;
use tracing::debug;

use v_im_proto::Frame;

use crate::processor;
use crate::server::conn::Conn;
use crate::server::ImServer;

/// 解码后的帧进入管道：CONNECT在认证前单独处理，其余帧入队并调度排空
/// Route decoded frames: CONNECT is handled pre-auth inline, everything else
/// is queued and a drain task is scheduled when none is running.
pub async fn ingest_frames(server: &Arc<ImServer>, conn: &Arc<Conn>, frames: Vec<Frame>) {
    let mut queued: Vec<Frame> = Vec::with_capacity(frames.len());
    for frame in frames {
        match frame {
            Frame::Connect(packet) => {
                if conn.authed() {
                    debug!("重复CONNECT已忽略 / duplicate connect ignored: conn={}", conn.id);
                    continue;
                }
                processor::auth::process_auth(server, conn, packet).await;
            }
            Frame::Unknown(t) => {
                debug!("未知帧类型已忽略 / unknown frame type {} ignored: conn={}", t, conn.id);
            }
            other => {
                if !conn.authed() {
                    debug!(
                        "未认证连接的帧已忽略 / frame before auth ignored: conn={}",
                        conn.id
                    );
                    continue;
                }
                queued.push(other);
            }
        }
    }
    if queued.is_empty() {
        return;
    }
    conn.push_frames(queued);
    if conn.try_schedule() {
        let server = server.clone();
        let conn = conn.clone();
        tokio::spawn(processor::drain(server, conn));
    }
}
