//! WebSocket接入：二进制消息承载线协议帧
//! WebSocket listener: binary messages carry the same wire frames.

use anyhow::Result;
use bytes::BytesMut;
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, error, info};

use v_im_proto::codec;

use crate::processor;
use crate::server::conn::{Conn, OutEvent};
use crate::server::ImServer;

/// 启动WS监听 / Start the WebSocket listener.
pub async fn start(server: Arc<ImServer>, host: String, port: u16) -> Result<()> {
    let addr = format!("{}:{}", host, port);
    let listener = TcpListener::bind(&addr).await?;
    info!("🚀 WebSocket监听已启动 / WebSocket listening on {}", addr);

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
                if server.is_ip_blacklisted(&peer_addr.ip().to_string()) {
                    debug!("🚫 IP在黑名单中，拒绝接入 / blacklisted ip refused: {}", peer_addr);
                    continue;
                }
                let server = server.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(server, stream, peer_addr).await {
                        debug!("WS连接结束 / ws connection ended: {} ({})", peer_addr, e);
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
    debug!("📨 新WS连接 / new ws connection from {}", peer_addr);
    let ws_stream = accept_async(stream).await?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    let (tx, mut rx) = mpsc::unbounded_channel::<OutEvent>();
    let conn = Arc::new(Conn::new(server.conn_manager.next_conn_id(), peer_addr, tx));
    server.conn_manager.register(conn.clone());

    let write_task = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match event {
                OutEvent::Frame(frame) => {
                    let data = codec::encode_frame(&frame).to_vec();
                    if ws_sender.send(Message::Binary(data)).await.is_err() {
                        break;
                    }
                }
                OutEvent::Close => {
                    let _ = ws_sender.send(Message::Close(None)).await;
                    let _ = ws_sender.close().await;
                    break;
                }
            }
        }
    });

    let mut buf = BytesMut::with_capacity(4096);
    loop {
        let message = tokio::select! {
            message = ws_receiver.next() => match message {
                Some(message) => message,
                None => break,
            },
            _ = conn.wait_close() => break,
        };
        match message {
            Ok(Message::Binary(data)) => {
                buf.extend_from_slice(&data);
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
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => conn.touch(),
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!("WS读取失败 / ws read error: {}", e);
                break;
            }
        }
    }

    conn.close();
    write_task.abort();
    processor::process_close(&server, conn.id);
    Ok(())
}
