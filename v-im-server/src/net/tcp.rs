//! 原生TCP接入 / Raw TCP listener.

use anyhow::Result;
use bytes::BytesMut;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use v_im_proto::codec;

use crate::processor;
use crate::server::conn::{Conn, OutEvent};
use crate::server::ImServer;

/// 启动TCP监听 / Start the TCP listener.
pub async fn start(server: Arc<ImServer>, host: String, port: u16) -> Result<()> {
    let addr = format!("{}:{}", host, port);
    let listener = TcpListener::bind(&addr).await?;
    info!("🚀 TCP监听已启动 / TCP listening on {}", addr);

    let mut shutdown_rx = server.shutdown_rx();
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer_addr) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        error!("accept失败 / accept error: {}", e);
                        continue;
                    }
                };
                // 接入层IP黑名单 / IP blacklist enforced at accept
                if server.is_ip_blacklisted(&peer_addr.ip().to_string()) {
                    debug!("🚫 IP在黑名单中，拒绝接入 / blacklisted ip refused: {}", peer_addr);
                    continue;
                }
                let server = server.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(server, stream, peer_addr).await {
                        debug!("连接结束 / connection ended: {} ({})", peer_addr, e);
                    }
                });
            }
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }
    Ok(())
}

async fn handle_connection(
    server: Arc<ImServer>,
    stream: TcpStream,
    peer_addr: std::net::SocketAddr,
) -> Result<()> {
    debug!("📨 新TCP连接 / new tcp connection from {}", peer_addr);
    let (mut reader, mut writer) = stream.into_split();
    let (tx, mut rx) = mpsc::unbounded_channel::<OutEvent>();
    let conn = Arc::new(Conn::new(server.conn_manager.next_conn_id(), peer_addr, tx));
    server.conn_manager.register(conn.clone());

    // 写端任务：编码出站帧 / writer task encodes outbound frames
    let write_task = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match event {
                OutEvent::Frame(frame) => {
                    if writer.write_all(&codec::encode_frame(&frame)).await.is_err() {
                        break;
                    }
                }
                OutEvent::Close => {
                    let _ = writer.shutdown().await;
                    break;
                }
            }
        }
    });

    // 读端循环：增量解码，被踢时由关闭信号打断
    // reader loop with incremental decode; the close signal interrupts a kick
    let mut buf = BytesMut::with_capacity(4096);
    loop {
        let read = tokio::select! {
            read = reader.read_buf(&mut buf) => read,
            _ = conn.wait_close() => break,
        };
        match read {
            Ok(0) => break,
            Ok(_) => {
                let mut frames = Vec::new();
                loop {
                    match codec::decode_frame(&mut buf) {
                        Ok(Some(frame)) => frames.push(frame),
                        Ok(None) => break,
                        Err(e) => {
                            debug!("帧解码失败，关闭连接 / decode error, closing: {}", e);
                            conn.close();
                            frames.clear();
                            break;
                        }
                    }
                }
                if conn.is_closed() {
                    break;
                }
                if !frames.is_empty() {
                    crate::net::ingest_frames(&server, &conn, frames).await;
                }
            }
            Err(e) => {
                debug!("读取失败 / read error: {}", e);
                break;
            }
        }
    }

    conn.close();
    write_task.abort();
    processor::process_close(&server, conn.id);
    Ok(())
}
